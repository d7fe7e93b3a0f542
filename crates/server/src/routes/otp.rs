//! Verification route handlers.
//!
//! Every handler requires a logged-in user. Failures the user can act on
//! (wrong code, expired code, delivery problems) re-render the form with
//! status 422 and a `data-error` indicator; session or configuration
//! failures become an [`AppError`].

use askama::Template;
use askama_web::WebTemplate;
use axum::{
    Form,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Redirect, Response},
};
use chrono::{DateTime, Utc};
use otp_login_core::{CheckOutcome, OtpChallenge, RejectReason};
use serde::Deserialize;
use tower_sessions::Session;

use super::VERIFY_PATH;
use crate::error::{AppError, Result, add_breadcrumb, set_sentry_user};
use crate::middleware::RequireAuth;
use crate::services::otp::OtpError;
use crate::state::AppState;

// =============================================================================
// Form Types
// =============================================================================

/// Code submission form.
#[derive(Debug, Deserialize)]
pub struct CheckForm {
    #[serde(default)]
    pub code: String,
}

/// Resend form. An empty or missing `service` means the default service.
#[derive(Debug, Deserialize)]
pub struct ResendForm {
    #[serde(default)]
    pub service: Option<String>,
}

// =============================================================================
// Templates
// =============================================================================

/// Problem shown above the form.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyError {
    WrongCode { attempts_left: u32 },
    LockedOut,
    Expired,
    DeliveryFailed,
    NoDestination,
    UnknownService,
}

impl VerifyError {
    /// Stable machine-readable indicator, rendered as `data-error`.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::WrongCode { .. } => "rejected",
            Self::LockedOut => "locked_out",
            Self::Expired => "expired",
            Self::DeliveryFailed => "delivery_failed",
            Self::NoDestination => "no_destination",
            Self::UnknownService => "unknown_service",
        }
    }

    /// Human-readable message.
    #[must_use]
    pub fn message(&self) -> String {
        match self {
            Self::WrongCode { attempts_left: 0 } => {
                "That code is incorrect and no attempts are left. Request a new code.".to_string()
            }
            Self::WrongCode { attempts_left: 1 } => {
                "That code is incorrect. 1 attempt left.".to_string()
            }
            Self::WrongCode { attempts_left } => {
                format!("That code is incorrect. {attempts_left} attempts left.")
            }
            Self::LockedOut => "Too many incorrect attempts. Request a new code.".to_string(),
            Self::Expired => "That code has expired. Request a new code.".to_string(),
            Self::DeliveryFailed => {
                "We could not send your code. Try again or choose another method.".to_string()
            }
            Self::NoDestination => {
                "There is no address on file for that method. Choose another one.".to_string()
            }
            Self::UnknownService => "That verification method is not available.".to_string(),
        }
    }

    /// Map an issuing failure the user can recover from.
    const fn from_issue(err: &OtpError) -> Option<Self> {
        match err {
            OtpError::DeliveryFailed { .. } => Some(Self::DeliveryFailed),
            OtpError::NoDestination { .. } => Some(Self::NoDestination),
            OtpError::UnknownService(_) | OtpError::Session(_) => None,
        }
    }
}

/// What the form shows about the pending challenge. Never the code.
#[derive(Debug, Clone)]
pub struct ChallengeView {
    pub reference: String,
    pub sent_to: String,
    pub minutes_remaining: i64,
    pub attempts_left: u32,
}

impl ChallengeView {
    fn new(challenge: &OtpChallenge, now: DateTime<Utc>, max_attempts: u32) -> Self {
        Self {
            reference: challenge.reference.clone(),
            sent_to: challenge.sent_to.clone(),
            minutes_remaining: (challenge.seconds_remaining(now) + 59) / 60,
            attempts_left: challenge.attempts_left(max_attempts),
        }
    }
}

/// Entry in the "send via" selector.
#[derive(Debug, Clone)]
pub struct ServiceOption {
    pub name: String,
    pub selected: bool,
}

/// Verification form template.
#[derive(Template, WebTemplate)]
#[template(path = "otp/verify.html")]
pub struct VerifyTemplate {
    pub challenge: Option<ChallengeView>,
    pub error: Option<VerifyError>,
    pub code_length: usize,
    pub services: Vec<ServiceOption>,
}

impl VerifyTemplate {
    fn new(
        state: &AppState,
        challenge: Option<&OtpChallenge>,
        error: Option<VerifyError>,
        now: DateTime<Utc>,
    ) -> Self {
        let settings = &state.config().otp;
        let max_attempts = settings.policy.max_attempts();

        let selected = challenge.map_or(settings.default_service.as_str(), |c| c.service.as_str());
        let services = state
            .registry()
            .names()
            .into_iter()
            .map(|name| ServiceOption {
                name: name.to_string(),
                selected: name == selected,
            })
            .collect();

        Self {
            challenge: challenge.map(|c| ChallengeView::new(c, now, max_attempts)),
            error,
            code_length: settings.policy.code_length(),
            services,
        }
    }

    /// Render with status 422.
    fn unprocessable(self) -> Response {
        (StatusCode::UNPROCESSABLE_ENTITY, self).into_response()
    }
}

// =============================================================================
// Handlers
// =============================================================================

/// Show the verification form.
///
/// Reuses the active challenge if there is one; otherwise issues a code
/// through the default service. Already verified sessions (or a disabled
/// flow) are sent on to `OTP_REDIRECT_TO`.
#[tracing::instrument(skip_all)]
pub async fn view(
    State(state): State<AppState>,
    session: Session,
    RequireAuth(user): RequireAuth,
) -> Result<Response> {
    let settings = &state.config().otp;
    let otp = state.otp();

    if !settings.enabled || otp.is_verified(&session).await? {
        return Ok(Redirect::to(&settings.redirect_to).into_response());
    }

    let now = Utc::now();
    match otp.ensure_challenge(&session, &user, now).await {
        Ok(challenge) => Ok(VerifyTemplate::new(&state, Some(&challenge), None, now).into_response()),
        Err(err) => match VerifyError::from_issue(&err) {
            Some(error) => Ok(VerifyTemplate::new(&state, None, Some(error), now).unprocessable()),
            None => Err(err.into()),
        },
    }
}

/// Check a submitted code.
///
/// Like the form itself, a disabled flow or an already verified session
/// goes straight on to `OTP_REDIRECT_TO`.
#[tracing::instrument(skip_all)]
pub async fn check(
    State(state): State<AppState>,
    session: Session,
    RequireAuth(user): RequireAuth,
    Form(form): Form<CheckForm>,
) -> Result<Response> {
    let settings = &state.config().otp;
    let otp = state.otp();

    if !settings.enabled || otp.is_verified(&session).await? {
        return Ok(Redirect::to(&settings.redirect_to).into_response());
    }

    let now = Utc::now();

    let error = match otp.check(&session, &user, &form.code, now).await? {
        CheckOutcome::Verified => {
            set_sentry_user(&user.id, Some(user.email.as_str()));
            add_breadcrumb("auth", "Second factor verified", &[]);
            return Ok(Redirect::to(&settings.redirect_to).into_response());
        }
        CheckOutcome::Rejected(RejectReason::WrongCode { attempts_left }) => {
            VerifyError::WrongCode { attempts_left }
        }
        CheckOutcome::Rejected(RejectReason::LockedOut) => VerifyError::LockedOut,
        CheckOutcome::Expired => VerifyError::Expired,
    };

    let challenge = otp.current_challenge(&session, &user, now).await?;
    Ok(VerifyTemplate::new(&state, challenge.as_ref(), Some(error), now).unprocessable())
}

/// Discard the current code and send a new one.
#[tracing::instrument(skip_all)]
pub async fn resend(
    State(state): State<AppState>,
    session: Session,
    RequireAuth(user): RequireAuth,
    Form(form): Form<ResendForm>,
) -> Result<Response> {
    let settings = &state.config().otp;
    let otp = state.otp();

    if !settings.enabled || otp.is_verified(&session).await? {
        return Ok(Redirect::to(&settings.redirect_to).into_response());
    }

    let now = Utc::now();
    match otp.issue(&session, &user, form.service.as_deref(), now).await {
        Ok(_) => Ok(Redirect::to(VERIFY_PATH).into_response()),
        Err(OtpError::UnknownService(name)) => {
            tracing::info!(service = %name, "Resend requested for unknown service");
            Ok(VerifyTemplate::new(&state, None, Some(VerifyError::UnknownService), now)
                .unprocessable())
        }
        Err(err) => match VerifyError::from_issue(&err) {
            Some(error) => Ok(VerifyTemplate::new(&state, None, Some(error), now).unprocessable()),
            None => Err(AppError::from(err)),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_indicators_are_distinct() {
        let all = [
            VerifyError::WrongCode { attempts_left: 2 },
            VerifyError::LockedOut,
            VerifyError::Expired,
            VerifyError::DeliveryFailed,
            VerifyError::NoDestination,
            VerifyError::UnknownService,
        ];
        let mut codes: Vec<_> = all.iter().map(VerifyError::code).collect();
        codes.sort_unstable();
        codes.dedup();
        assert_eq!(codes.len(), all.len());
    }

    #[test]
    fn test_wrong_code_message_counts_attempts() {
        assert!(VerifyError::WrongCode { attempts_left: 3 }.message().contains("3 attempts"));
        assert!(VerifyError::WrongCode { attempts_left: 1 }.message().contains("1 attempt left"));
        assert!(VerifyError::WrongCode { attempts_left: 0 }.message().contains("new code"));
    }

    #[test]
    fn test_template_never_renders_code() {
        let template = VerifyTemplate {
            challenge: Some(ChallengeView {
                reference: "K7QM".to_string(),
                sent_to: "j***@example.com".to_string(),
                minutes_remaining: 5,
                attempts_left: 5,
            }),
            error: None,
            code_length: 6,
            services: vec![ServiceOption {
                name: "email".to_string(),
                selected: true,
            }],
        };

        let html = template.render().unwrap_or_default();
        assert!(html.contains("K7QM"));
        assert!(html.contains("j***@example.com"));
        assert!(html.contains("action=\"/login/check\""));
        assert!(!html.contains("data-error"));
    }

    #[test]
    fn test_template_renders_error_indicator() {
        let template = VerifyTemplate {
            challenge: None,
            error: Some(VerifyError::DeliveryFailed),
            code_length: 6,
            services: Vec::new(),
        };

        let html = template.render().unwrap_or_default();
        assert!(html.contains("data-error=\"delivery_failed\""));
        assert!(!html.contains("action=\"/login/check\""));
    }
}
