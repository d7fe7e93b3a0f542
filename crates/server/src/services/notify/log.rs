//! Development transport that writes codes to the log.

use async_trait::async_trait;

use super::{Channel, Destination, Notifier, NotifyError, OtpMessage};

/// Tracing target for lines that contain a plaintext code.
///
/// The Sentry layer drops everything on this target.
pub const CODE_LOG_TARGET: &str = "otp_login::codes";

/// Logs the code at `info` on [`CODE_LOG_TARGET`] instead of sending it.
///
/// For local development only. Never configure this in production; anyone
/// with log access can complete any login.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    fn channel(&self) -> Channel {
        Channel::Log
    }

    async fn send(
        &self,
        destination: &Destination,
        message: &OtpMessage,
    ) -> Result<(), NotifyError> {
        tracing::info!(
            target: CODE_LOG_TARGET,
            to = %destination.masked(),
            reference = %message.reference,
            code = %message.code.as_str(),
            "Log notifier: login code not delivered"
        );
        Ok(())
    }
}
