//! Notification service commands.

use chrono::Utc;
use otp_login_core::UserId;
use otp_login_server::config::{ConfigError, OtpLoginConfig};
use otp_login_server::services::notify::{Destination, NotifyError, OtpMessage, ServiceRegistry};

/// Errors from the services commands.
#[derive(Debug, thiserror::Error)]
pub enum ServicesError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Service '{0}' is not configured or cannot be built")]
    UnknownService(String),

    #[error("Invalid destination: {0}")]
    InvalidDestination(String),

    #[error("Delivery failed: {0}")]
    Notify(#[from] NotifyError),

    #[error("Delivery timed out after {0} seconds")]
    Timeout(u64),
}

/// Print every configured service, its kind and whether it resolves.
///
/// # Errors
///
/// Returns an error if the configuration cannot be loaded.
#[allow(clippy::print_stdout)]
pub fn list() -> Result<(), ServicesError> {
    let config = OtpLoginConfig::from_env()?;
    let registry = ServiceRegistry::from_config(&config);

    for (name, kind) in &config.otp.services {
        let status = if registry.resolve(name).is_some() {
            "ok"
        } else {
            "unavailable"
        };
        let default = if *name == config.otp.default_service {
            " (default)"
        } else {
            ""
        };
        println!("{name:<16} {kind:<8} {status}{default}");
    }

    Ok(())
}

/// Send a freshly generated code through `service` to `to`.
///
/// # Errors
///
/// Returns an error if the service does not resolve, the destination is
/// invalid, or delivery fails or times out.
pub async fn send(service: &str, to: &str) -> Result<(), ServicesError> {
    let config = OtpLoginConfig::from_env()?;
    let registry = ServiceRegistry::from_config(&config);

    let notifier = registry
        .resolve(service)
        .ok_or_else(|| ServicesError::UnknownService(service.to_string()))?;
    let destination = Destination::parse(to).map_err(ServicesError::InvalidDestination)?;

    let now = Utc::now();
    let (code, challenge) = config.otp.policy.issue(UserId::new(0), service, now);
    let message = OtpMessage::new(code, &challenge, now);

    let timeout = config.otp.send_timeout;
    tokio::time::timeout(timeout, notifier.send(&destination, &message))
        .await
        .map_err(|_| ServicesError::Timeout(timeout.as_secs()))??;

    tracing::info!(
        service = %service,
        channel = %notifier.channel(),
        to = %destination.masked(),
        reference = %challenge.reference,
        "Test code sent"
    );
    Ok(())
}
