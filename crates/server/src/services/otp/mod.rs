//! One-time code verification flow.
//!
//! Issues codes through a resolved notification service and checks
//! submissions against the challenge stored in the session. At most one
//! challenge lives in a session at a time.

mod attempts;
mod error;

pub use attempts::AttemptLedger;
pub use error::OtpError;

use chrono::{DateTime, Utc};
use otp_login_core::{CheckOutcome, OtpChallenge};
use tower_sessions::Session;

use crate::config::OtpSettings;
use crate::models::{CurrentUser, session_keys};
use crate::services::notify::{Destination, OtpMessage, ServiceRegistry};

/// Verification service.
///
/// Borrowed per request; the session is passed into every operation.
pub struct OtpService<'a> {
    registry: &'a ServiceRegistry,
    settings: &'a OtpSettings,
    attempts: &'a AttemptLedger,
}

impl<'a> OtpService<'a> {
    /// Create a new verification service.
    #[must_use]
    pub const fn new(
        registry: &'a ServiceRegistry,
        settings: &'a OtpSettings,
        attempts: &'a AttemptLedger,
    ) -> Self {
        Self {
            registry,
            settings,
            attempts,
        }
    }

    /// Whether this session already passed verification.
    ///
    /// # Errors
    ///
    /// Returns `OtpError::Session` if the session cannot be read.
    pub async fn is_verified(&self, session: &Session) -> Result<bool, OtpError> {
        Ok(session
            .get::<bool>(session_keys::OTP_VERIFIED)
            .await?
            .unwrap_or(false))
    }

    /// The session's challenge, if it belongs to `user` and is still usable.
    ///
    /// # Errors
    ///
    /// Returns `OtpError::Session` if the session cannot be read.
    pub async fn current_challenge(
        &self,
        session: &Session,
        user: &CurrentUser,
        now: DateTime<Utc>,
    ) -> Result<Option<OtpChallenge>, OtpError> {
        let challenge = session
            .get::<OtpChallenge>(session_keys::OTP_CHALLENGE)
            .await?;

        Ok(challenge.filter(|c| {
            c.is_active_for(user.id, now, self.settings.policy.max_attempts())
        }))
    }

    /// Return the active challenge, or issue one through the default service.
    ///
    /// Showing the form twice does not send a second code.
    ///
    /// # Errors
    ///
    /// Returns an `OtpError` if a new code has to be issued and that fails.
    pub async fn ensure_challenge(
        &self,
        session: &Session,
        user: &CurrentUser,
        now: DateTime<Utc>,
    ) -> Result<OtpChallenge, OtpError> {
        if let Some(challenge) = self.current_challenge(session, user, now).await? {
            tracing::debug!(
                user_id = %user.id,
                reference = %challenge.reference,
                "Reusing active challenge"
            );
            return Ok(challenge);
        }

        self.issue(session, user, None, now).await
    }

    /// Generate and send a new code, replacing the current challenge.
    ///
    /// `service` defaults to the configured default service. The new
    /// challenge is only stored once the transport reports success; until
    /// then any earlier challenge stays valid.
    ///
    /// # Errors
    ///
    /// - `OtpError::UnknownService` if the service does not resolve
    /// - `OtpError::NoDestination` if the user has no address for its channel
    /// - `OtpError::DeliveryFailed` if the transport errors or times out
    pub async fn issue(
        &self,
        session: &Session,
        user: &CurrentUser,
        service: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<OtpChallenge, OtpError> {
        let service = service
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .unwrap_or(self.settings.default_service.as_str());

        let notifier = self
            .registry
            .resolve(service)
            .ok_or_else(|| OtpError::UnknownService(service.to_string()))?;

        let channel = notifier.channel();
        let destination =
            Destination::for_channel(channel, user).ok_or_else(|| OtpError::NoDestination {
                service: service.to_string(),
                channel,
            })?;

        let (code, mut challenge) = self.settings.policy.issue(user.id, service, now);
        challenge.sent_to = destination.masked();
        let message = OtpMessage::new(code, &challenge, now);

        match tokio::time::timeout(
            self.settings.send_timeout,
            notifier.send(&destination, &message),
        )
        .await
        {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::warn!(service = %service, error = %e, "Failed to deliver login code");
                return Err(OtpError::delivery(service, &e));
            }
            Err(_) => {
                tracing::warn!(
                    service = %service,
                    timeout_secs = self.settings.send_timeout.as_secs(),
                    "Login code delivery timed out"
                );
                return Err(OtpError::DeliveryFailed {
                    service: service.to_string(),
                    reason: "timed out".to_string(),
                });
            }
        }

        session
            .insert(session_keys::OTP_CHALLENGE, &challenge)
            .await?;

        tracing::info!(
            user_id = %user.id,
            service = %service,
            reference = %challenge.reference,
            to = %challenge.sent_to,
            "Issued login code"
        );

        Ok(challenge)
    }

    /// Check a submitted code.
    ///
    /// A missing challenge, or one issued to a different user, counts as
    /// `Expired`. Only a wrong code keeps the challenge; every other outcome
    /// removes it. On `Verified` the session is marked and its id cycled.
    ///
    /// # Errors
    ///
    /// Returns `OtpError::Session` if the session cannot be read or written.
    pub async fn check(
        &self,
        session: &Session,
        user: &CurrentUser,
        submitted: &str,
        now: DateTime<Utc>,
    ) -> Result<CheckOutcome, OtpError> {
        let challenge = session
            .get::<OtpChallenge>(session_keys::OTP_CHALLENGE)
            .await?
            .filter(|c| c.user_id == user.id);

        let Some(mut challenge) = challenge else {
            session
                .remove::<OtpChallenge>(session_keys::OTP_CHALLENGE)
                .await?;
            return Ok(CheckOutcome::Expired);
        };

        challenge.attempts = self.attempts.reserve(&challenge, now);
        let outcome = challenge.check(submitted, now, self.settings.policy.max_attempts());

        if outcome.keeps_challenge() {
            session
                .insert(session_keys::OTP_CHALLENGE, &challenge)
                .await?;
        } else {
            self.attempts.forget(&challenge);
            session
                .remove::<OtpChallenge>(session_keys::OTP_CHALLENGE)
                .await?;
        }

        match outcome {
            CheckOutcome::Verified => {
                session.insert(session_keys::OTP_VERIFIED, true).await?;
                session.cycle_id().await?;
                tracing::info!(user_id = %user.id, reference = %challenge.reference, "Login code verified");
            }
            CheckOutcome::Rejected(reason) => {
                tracing::info!(
                    user_id = %user.id,
                    reference = %challenge.reference,
                    reason = ?reason,
                    "Login code rejected"
                );
            }
            CheckOutcome::Expired => {
                tracing::info!(user_id = %user.id, reference = %challenge.reference, "Login code expired");
            }
        }

        Ok(outcome)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use async_trait::async_trait;
    use chrono::TimeDelta;
    use otp_login_core::{Email, OtpPolicy, PhoneNumber, RejectReason, UserId};
    use tower_sessions::MemoryStore;

    use super::*;
    use crate::config::ServiceKind;
    use crate::services::notify::{Channel, Notifier, NotifyError};

    /// Records every message it is asked to send.
    #[derive(Default)]
    struct Recorder {
        sent: Mutex<Vec<(Destination, String)>>,
    }

    struct RecordingNotifier {
        channel: Channel,
        recorder: Arc<Recorder>,
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
            self.recorder
                .sent
                .lock()
                .unwrap()
                .push((destination.clone(), message.code.as_str().to_string()));
            Ok(())
        }
    }

    struct FailingNotifier;

    #[async_trait]
    impl Notifier for FailingNotifier {
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
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        }
    }

    struct Fixture {
        registry: ServiceRegistry,
        settings: OtpSettings,
        attempts: AttemptLedger,
        recorder: Arc<Recorder>,
        store: Arc<MemoryStore>,
        session: Session,
    }

    impl Fixture {
        fn new() -> Self {
            let recorder = Arc::new(Recorder::default());
            let mut registry = ServiceRegistry::new();

            for (name, channel) in [("email", Channel::Email), ("sms", Channel::Sms)] {
                let recorder = Arc::clone(&recorder);
                registry.register(name, move || {
                    Ok(Arc::new(RecordingNotifier {
                        channel,
                        recorder: Arc::clone(&recorder),
                    }) as Arc<dyn Notifier>)
                });
            }
            registry.register("broken", || Ok(Arc::new(FailingNotifier) as Arc<dyn Notifier>));
            registry.register("slow", || Ok(Arc::new(SlowNotifier) as Arc<dyn Notifier>));

            let services: BTreeMap<String, ServiceKind> =
                [("email".to_string(), ServiceKind::Log)].into_iter().collect();

            let settings = OtpSettings {
                enabled: true,
                services,
                default_service: "email".to_string(),
                policy: OtpPolicy::new(6, 300, 3).unwrap(),
                send_timeout: Duration::from_millis(50),
                redirect_to: "/".to_string(),
                login_url: "/login".to_string(),
            };

            let store = Arc::new(MemoryStore::default());
            Self {
                registry,
                settings,
                attempts: AttemptLedger::new(),
                recorder,
                session: Session::new(None, Arc::clone(&store), None),
                store,
            }
        }

        fn service(&self) -> OtpService<'_> {
            OtpService::new(&self.registry, &self.settings, &self.attempts)
        }

        fn sent_count(&self) -> usize {
            self.recorder.sent.lock().unwrap().len()
        }

        fn last_code(&self) -> String {
            self.recorder.sent.lock().unwrap().last().unwrap().1.clone()
        }
    }

    fn user(id: i64, phone: Option<&str>) -> CurrentUser {
        CurrentUser {
            id: UserId::new(id),
            email: Email::parse("jane@example.com").unwrap(),
            phone: phone.map(|p| PhoneNumber::parse(p).unwrap()),
        }
    }

    #[tokio::test]
    async fn test_ensure_challenge_is_idempotent() {
        let fx = Fixture::new();
        let user = user(1, None);
        let now = Utc::now();

        let first = fx.service().ensure_challenge(&fx.session, &user, now).await.unwrap();
        let second = fx
            .service()
            .ensure_challenge(&fx.session, &user, now + TimeDelta::seconds(10))
            .await
            .unwrap();

        assert_eq!(first, second);
        assert_eq!(fx.sent_count(), 1);
        assert_eq!(first.sent_to, "j***@example.com");
        assert_eq!(first.service, "email");
    }

    #[tokio::test]
    async fn test_ensure_challenge_reissues_after_expiry() {
        let fx = Fixture::new();
        let user = user(1, None);
        let now = Utc::now();

        let first = fx.service().ensure_challenge(&fx.session, &user, now).await.unwrap();
        let later = now + TimeDelta::seconds(301);
        let second = fx.service().ensure_challenge(&fx.session, &user, later).await.unwrap();

        assert_ne!(first.code_hash, second.code_hash);
        assert_eq!(fx.sent_count(), 2);
    }

    #[tokio::test]
    async fn test_verified_clears_challenge_and_marks_session() {
        let fx = Fixture::new();
        let user = user(1, None);
        let now = Utc::now();

        fx.service().ensure_challenge(&fx.session, &user, now).await.unwrap();
        let code = fx.last_code();

        let outcome = fx.service().check(&fx.session, &user, &code, now).await.unwrap();
        assert_eq!(outcome, CheckOutcome::Verified);
        assert!(fx.service().is_verified(&fx.session).await.unwrap());
        assert!(
            fx.service()
                .current_challenge(&fx.session, &user, now)
                .await
                .unwrap()
                .is_none()
        );

        // The code cannot be replayed.
        let replay = fx.service().check(&fx.session, &user, &code, now).await.unwrap();
        assert_eq!(replay, CheckOutcome::Expired);
    }

    #[tokio::test]
    async fn test_wrong_code_then_lockout() {
        let fx = Fixture::new();
        let user = user(1, None);
        let now = Utc::now();

        fx.service().ensure_challenge(&fx.session, &user, now).await.unwrap();
        let code = fx.last_code();
        let wrong = if code == "000000" { "111111" } else { "000000" };

        for left in [2, 1, 0] {
            let outcome = fx.service().check(&fx.session, &user, wrong, now).await.unwrap();
            assert_eq!(
                outcome,
                CheckOutcome::Rejected(RejectReason::WrongCode { attempts_left: left })
            );
        }

        let outcome = fx.service().check(&fx.session, &user, &code, now).await.unwrap();
        assert_eq!(outcome, CheckOutcome::Rejected(RejectReason::LockedOut));
        assert!(!fx.service().is_verified(&fx.session).await.unwrap());
    }

    #[tokio::test]
    async fn test_expired_code_is_removed() {
        let fx = Fixture::new();
        let user = user(1, None);
        let now = Utc::now();

        fx.service().ensure_challenge(&fx.session, &user, now).await.unwrap();
        let code = fx.last_code();

        let later = now + TimeDelta::seconds(301);
        let outcome = fx.service().check(&fx.session, &user, &code, later).await.unwrap();
        assert_eq!(outcome, CheckOutcome::Expired);

        let stored = fx
            .session
            .get::<OtpChallenge>(session_keys::OTP_CHALLENGE)
            .await
            .unwrap();
        assert!(stored.is_none());
    }

    #[tokio::test]
    async fn test_challenge_for_other_user_counts_as_expired() {
        let fx = Fixture::new();
        let owner = user(1, None);
        let other = user(2, None);
        let now = Utc::now();

        fx.service().ensure_challenge(&fx.session, &owner, now).await.unwrap();
        let code = fx.last_code();

        let outcome = fx.service().check(&fx.session, &other, &code, now).await.unwrap();
        assert_eq!(outcome, CheckOutcome::Expired);
    }

    #[tokio::test]
    async fn test_check_without_challenge() {
        let fx = Fixture::new();
        let outcome = fx
            .service()
            .check(&fx.session, &user(1, None), "123456", Utc::now())
            .await
            .unwrap();
        assert_eq!(outcome, CheckOutcome::Expired);
    }

    #[tokio::test]
    async fn test_issue_through_named_service() {
        let fx = Fixture::new();
        let user = user(1, Some("+15550109999"));

        let challenge = fx
            .service()
            .issue(&fx.session, &user, Some("sms"), Utc::now())
            .await
            .unwrap();

        assert_eq!(challenge.service, "sms");
        assert_eq!(challenge.sent_to, "+*******9999");
        let sent = fx.recorder.sent.lock().unwrap();
        assert!(matches!(sent.last(), Some((Destination::Phone(_), _))));
    }

    #[tokio::test]
    async fn test_issue_replaces_previous_challenge() {
        let fx = Fixture::new();
        let user = user(1, None);
        let now = Utc::now();

        fx.service().ensure_challenge(&fx.session, &user, now).await.unwrap();
        let old_code = fx.last_code();
        fx.service().issue(&fx.session, &user, None, now).await.unwrap();
        let new_code = fx.last_code();

        if old_code != new_code {
            let outcome = fx.service().check(&fx.session, &user, &old_code, now).await.unwrap();
            assert!(matches!(outcome, CheckOutcome::Rejected(_)));
        }
        let outcome = fx.service().check(&fx.session, &user, &new_code, now).await.unwrap();
        assert_eq!(outcome, CheckOutcome::Verified);
    }

    #[tokio::test]
    async fn test_issue_unknown_service() {
        let fx = Fixture::new();
        let result = fx
            .service()
            .issue(&fx.session, &user(1, None), Some("fax"), Utc::now())
            .await;
        assert!(matches!(result, Err(OtpError::UnknownService(name)) if name == "fax"));
    }

    #[tokio::test]
    async fn test_issue_sms_without_phone() {
        let fx = Fixture::new();
        let result = fx
            .service()
            .issue(&fx.session, &user(1, None), Some("sms"), Utc::now())
            .await;
        assert!(matches!(
            result,
            Err(OtpError::NoDestination { channel: Channel::Sms, .. })
        ));
        assert_eq!(fx.sent_count(), 0);
    }

    #[tokio::test]
    async fn test_delivery_failure_stores_nothing() {
        let fx = Fixture::new();
        let user = user(1, None);
        let now = Utc::now();

        let result = fx.service().issue(&fx.session, &user, Some("broken"), now).await;
        assert!(matches!(result, Err(OtpError::DeliveryFailed { .. })));
        assert!(
            fx.service()
                .current_challenge(&fx.session, &user, now)
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn test_failed_resend_keeps_previous_challenge() {
        let fx = Fixture::new();
        let user = user(1, None);
        let now = Utc::now();

        let first = fx.service().ensure_challenge(&fx.session, &user, now).await.unwrap();
        let code = fx.last_code();

        let unknown = fx.service().issue(&fx.session, &user, Some("fax"), now).await;
        assert!(matches!(unknown, Err(OtpError::UnknownService(_))));
        let broken = fx.service().issue(&fx.session, &user, Some("broken"), now).await;
        assert!(matches!(broken, Err(OtpError::DeliveryFailed { .. })));

        let current = fx.service().current_challenge(&fx.session, &user, now).await.unwrap();
        assert_eq!(current, Some(first));
        let outcome = fx.service().check(&fx.session, &user, &code, now).await.unwrap();
        assert_eq!(outcome, CheckOutcome::Verified);
    }

    #[tokio::test]
    async fn test_parallel_stale_sessions_share_attempt_limit() {
        let fx = Fixture::new();
        let user = user(1, None);
        let now = Utc::now();

        fx.service().ensure_challenge(&fx.session, &user, now).await.unwrap();
        fx.session.save().await.unwrap();
        let code = fx.last_code();
        let wrong = if code == "000000" { "111111" } else { "000000" };

        // Four requests on the same cookie, all loaded before any of them writes.
        let mut requests = Vec::new();
        for _ in 0..4 {
            let session = Session::new(fx.session.id(), Arc::clone(&fx.store), None);
            session
                .get::<OtpChallenge>(session_keys::OTP_CHALLENGE)
                .await
                .unwrap()
                .unwrap();
            requests.push(session);
        }

        for (session, left) in requests.iter().zip([2, 1, 0]) {
            let outcome = fx.service().check(session, &user, wrong, now).await.unwrap();
            assert_eq!(
                outcome,
                CheckOutcome::Rejected(RejectReason::WrongCode { attempts_left: left })
            );
        }

        let outcome = fx.service().check(requests.last().unwrap(), &user, &code, now).await.unwrap();
        assert_eq!(outcome, CheckOutcome::Rejected(RejectReason::LockedOut));
    }

    #[tokio::test]
    async fn test_send_timeout_is_delivery_failure() {
        let fx = Fixture::new();
        let result = fx
            .service()
            .issue(&fx.session, &user(1, None), Some("slow"), Utc::now())
            .await;
        assert!(matches!(
            result,
            Err(OtpError::DeliveryFailed { reason, .. }) if reason == "timed out"
        ));
    }
}
