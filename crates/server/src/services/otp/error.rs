//! Verification flow error types.

use thiserror::Error;

use crate::services::notify::{Channel, NotifyError};

/// Errors that can occur while issuing or checking a code.
///
/// A wrong or expired code is not an error; see
/// [`CheckOutcome`](otp_login_core::CheckOutcome).
#[derive(Debug, Error)]
pub enum OtpError {
    /// No service is registered under this name, or it could not be built.
    #[error("unknown notification service: {0}")]
    UnknownService(String),

    /// The user has no address for the service's channel.
    #[error("no {channel} destination for service {service}")]
    NoDestination {
        /// Service that was selected.
        service: String,
        /// Channel the service delivers on.
        channel: Channel,
    },

    /// The transport failed or timed out.
    #[error("delivery through {service} failed: {reason}")]
    DeliveryFailed {
        /// Service that was selected.
        service: String,
        /// Transport error or timeout description.
        reason: String,
    },

    /// Reading or writing the session failed.
    #[error("session error: {0}")]
    Session(#[from] tower_sessions::session::Error),
}

impl OtpError {
    pub(crate) fn delivery(service: &str, err: &NotifyError) -> Self {
        Self::DeliveryFailed {
            service: service.to_string(),
            reason: err.to_string(),
        }
    }
}
