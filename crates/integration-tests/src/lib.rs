//! Integration test harness for OTP login.
//!
//! Builds the full application router in-process with an in-memory session
//! store and recording notifiers, then drives it with
//! `tower::ServiceExt::oneshot`. No network, database or running server
//! is needed.
//!
//! # Registered services
//!
//! | Name     | Behaviour                                  |
//! |----------|--------------------------------------------|
//! | `email`  | Records the code (email channel)           |
//! | `sms`    | Records the code (SMS channel)             |
//! | `broken` | Always fails with a transport error        |
//! | `slow`   | Never finishes before the send timeout     |
//!
//! # Host routes
//!
//! - `POST /test/login` - first-factor login stand-in, body `id=..&email=..[&phone=..]`
//! - `POST /test/logout` - clears the session
//! - `GET /account` - protected by `require_otp`

#![allow(clippy::missing_panics_doc)]

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::{
    Form, Router,
    body::Body,
    http::{Request, StatusCode, header},
    response::IntoResponse,
    routing::{get, post},
};
use otp_login_core::{Email, OtpPolicy, PhoneNumber, UserId};
use otp_login_server::{
    config::{OtpLoginConfig, OtpSettings, ServiceKind},
    middleware::{
        OptionalAuth, SESSION_COOKIE_NAME, clear_current_user, require_otp, set_current_user,
    },
    models::CurrentUser,
    services::notify::{Channel, Destination, Notifier, NotifyError, OtpMessage, ServiceRegistry},
    state::AppState,
};
use serde::Deserialize;
use tower::ServiceExt;
use tower_sessions::{MemoryStore, Session};

/// A code captured by a recording notifier.
#[derive(Debug, Clone)]
pub struct SentCode {
    pub service: String,
    pub destination: Destination,
    pub code: String,
    pub reference: String,
}

type Outbox = Arc<Mutex<Vec<SentCode>>>;

struct RecordingNotifier {
    service: &'static str,
    channel: Channel,
    outbox: Outbox,
}

#[async_trait]
impl Notifier for RecordingNotifier {
    fn channel(&self) -> Channel {
        self.channel
    }

    async fn send(
        &self,
        destination: &Destination,
        message: &OtpMessage,
    ) -> Result<(), NotifyError> {
        self.outbox.lock().expect("outbox lock").push(SentCode {
            service: self.service.to_string(),
            destination: destination.clone(),
            code: message.code.as_str().to_string(),
            reference: message.reference.clone(),
        });
        Ok(())
    }
}

struct BrokenNotifier;

#[async_trait]
impl Notifier for BrokenNotifier {
    fn channel(&self) -> Channel {
        Channel::Email
    }

    async fn send(&self, _: &Destination, _: &OtpMessage) -> Result<(), NotifyError> {
        Err(NotifyError::Transport("connection refused".to_string()))
    }
}

struct SlowNotifier;

#[async_trait]
impl Notifier for SlowNotifier {
    fn channel(&self) -> Channel {
        Channel::Email
    }

    async fn send(&self, _: &Destination, _: &OtpMessage) -> Result<(), NotifyError> {
        tokio::time::sleep(Duration::from_secs(30)).await;
        Ok(())
    }
}

/// Settings for a [`TestApp`].
#[derive(Debug, Clone)]
pub struct TestAppBuilder {
    enabled: bool,
    default_service: String,
    ttl_secs: u64,
    max_attempts: u32,
    send_timeout: Duration,
}

impl Default for TestAppBuilder {
    fn default() -> Self {
        Self {
            enabled: true,
            default_service: "email".to_string(),
            ttl_secs: 300,
            max_attempts: 3,
            send_timeout: Duration::from_millis(200),
        }
    }
}

impl TestAppBuilder {
    #[must_use]
    pub const fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    #[must_use]
    pub fn default_service(mut self, name: &str) -> Self {
        self.default_service = name.to_string();
        self
    }

    #[must_use]
    pub const fn ttl_secs(mut self, ttl_secs: u64) -> Self {
        self.ttl_secs = ttl_secs;
        self
    }

    #[must_use]
    pub const fn max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Build the application.
    #[must_use]
    pub fn build(self) -> TestApp {
        let outbox: Outbox = Arc::default();

        let mut registry = ServiceRegistry::new();
        for (name, channel) in [("email", Channel::Email), ("sms", Channel::Sms)] {
            let outbox = Arc::clone(&outbox);
            registry.register(name, move || {
                Ok(Arc::new(RecordingNotifier {
                    service: name,
                    channel,
                    outbox: Arc::clone(&outbox),
                }) as Arc<dyn Notifier>)
            });
        }
        registry.register("broken", || Ok(Arc::new(BrokenNotifier) as Arc<dyn Notifier>));
        registry.register("slow", || Ok(Arc::new(SlowNotifier) as Arc<dyn Notifier>));

        let services: BTreeMap<String, ServiceKind> = registry
            .names()
            .into_iter()
            .map(|name| (name.to_string(), ServiceKind::Log))
            .collect();

        let config = OtpLoginConfig {
            database_url: None,
            host: [127, 0, 0, 1].into(),
            port: 3000,
            base_url: "http://localhost:3000".to_string(),
            otp: OtpSettings {
                enabled: self.enabled,
                services,
                default_service: self.default_service,
                policy: OtpPolicy::new(6, self.ttl_secs, self.max_attempts)
                    .expect("valid test policy"),
                send_timeout: self.send_timeout,
                redirect_to: "/account".to_string(),
                login_url: "/login".to_string(),
            },
            smtp: None,
            twilio: None,
            sentry_dsn: None,
            sentry_environment: None,
            sentry_sample_rate: 0.0,
            sentry_traces_sample_rate: 0.0,
        };

        let state = AppState::new(config, registry, None);
        let host_routes = Router::new()
            .route("/test/login", post(test_login))
            .route("/test/logout", post(test_logout))
            .route(
                "/account",
                get(account).route_layer(axum::middleware::from_fn_with_state(
                    state.clone(),
                    require_otp,
                )),
            );

        TestApp {
            router: otp_login_server::router(state, MemoryStore::default(), host_routes),
            outbox,
            cookie: None,
        }
    }
}

/// Form accepted by the stand-in first-factor login.
#[derive(Debug, Deserialize)]
struct LoginForm {
    id: i64,
    email: String,
    phone: Option<String>,
}

async fn test_login(session: Session, Form(form): Form<LoginForm>) -> impl IntoResponse {
    let user = CurrentUser {
        id: UserId::new(form.id),
        email: Email::parse(&form.email).expect("valid test email"),
        phone: form
            .phone
            .filter(|p| !p.is_empty())
            .map(|p| PhoneNumber::parse(&p).expect("valid test phone")),
    };

    match set_current_user(&session, &user).await {
        Ok(()) => StatusCode::NO_CONTENT,
        Err(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

async fn test_logout(session: Session) -> StatusCode {
    match clear_current_user(&session).await {
        Ok(()) => StatusCode::NO_CONTENT,
        Err(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

async fn account(OptionalAuth(user): OptionalAuth) -> String {
    user.map_or_else(|| "guest".to_string(), |u| format!("account:{}", u.id))
}

/// A collected response.
#[derive(Debug)]
pub struct TestResponse {
    pub status: StatusCode,
    pub location: Option<String>,
    pub request_id: Option<String>,
    pub body: String,
}

impl TestResponse {
    /// The `data-error` indicator rendered on the form, if any.
    #[must_use]
    pub fn error_indicator(&self) -> Option<&str> {
        let start = self.body.find("data-error=\"")? + "data-error=\"".len();
        let rest = self.body.get(start..)?;
        rest.split('"').next()
    }

    /// The challenge reference rendered on the form, if any.
    #[must_use]
    pub fn reference(&self) -> Option<&str> {
        let start = self.body.find("data-reference=\"")? + "data-reference=\"".len();
        let rest = self.body.get(start..)?;
        rest.split('"').next()
    }
}

/// The application under test plus a single browser-like cookie jar.
pub struct TestApp {
    router: Router,
    outbox: Outbox,
    cookie: Option<String>,
}

impl TestApp {
    /// Application with default settings.
    #[must_use]
    pub fn new() -> Self {
        Self::builder().build()
    }

    #[must_use]
    pub fn builder() -> TestAppBuilder {
        TestAppBuilder::default()
    }

    /// Log in as user `id` (email `user{id}@example.com`), optionally with a phone.
    pub async fn login(&mut self, id: i64, phone: Option<&str>) {
        let mut body = format!("id={id}&email=user{id}%40example.com");
        if let Some(phone) = phone {
            body.push_str("&phone=");
            body.push_str(&phone.replace('+', "%2B"));
        }
        let response = self.post_form("/test/login", &body).await;
        assert_eq!(response.status, StatusCode::NO_CONTENT, "test login failed");
    }

    /// Log out, dropping the user and any verification state.
    pub async fn logout(&mut self) {
        let response = self.post_form("/test/logout", "").await;
        assert_eq!(response.status, StatusCode::NO_CONTENT, "test logout failed");
    }

    pub async fn get(&mut self, path: &str) -> TestResponse {
        let request = self.request("GET", path).body(Body::empty()).expect("request");
        self.send(request).await
    }

    pub async fn post_form(&mut self, path: &str, body: &str) -> TestResponse {
        let request = self
            .request("POST", path)
            .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
            .body(Body::from(body.to_string()))
            .expect("request");
        self.send(request).await
    }

    /// Send a prepared request, carrying the session cookie.
    pub async fn send(&mut self, request: Request<Body>) -> TestResponse {
        let response = self
            .router
            .clone()
            .oneshot(request)
            .await
            .expect("router is infallible");

        for value in response.headers().get_all(header::SET_COOKIE) {
            let Ok(value) = value.to_str() else { continue };
            let Some(pair) = value.split(';').next() else { continue };
            if pair.starts_with(&format!("{SESSION_COOKIE_NAME}=")) {
                self.cookie = Some(pair.to_string());
            }
        }

        let status = response.status();
        let header_str = |name: &str| {
            response
                .headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(String::from)
        };
        let location = header_str("location");
        let request_id = header_str("x-request-id");

        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("read body");

        TestResponse {
            status,
            location,
            request_id,
            body: String::from_utf8_lossy(&bytes).into_owned(),
        }
    }

    /// Request builder with the session cookie attached.
    #[must_use]
    pub fn request(&self, method: &str, path: &str) -> axum::http::request::Builder {
        let builder = Request::builder().method(method).uri(path);
        match &self.cookie {
            Some(cookie) => builder.header(header::COOKIE, cookie),
            None => builder,
        }
    }

    /// Current session cookie (`name=value`).
    #[must_use]
    pub fn cookie(&self) -> Option<&str> {
        self.cookie.as_deref()
    }

    /// Every code delivered so far.
    #[must_use]
    pub fn sent(&self) -> Vec<SentCode> {
        self.outbox.lock().expect("outbox lock").clone()
    }

    /// The most recently delivered code.
    #[must_use]
    pub fn last_code(&self) -> String {
        self.sent().last().map(|s| s.code.clone()).expect("a code was sent")
    }
}

impl Default for TestApp {
    fn default() -> Self {
        Self::new()
    }
}
