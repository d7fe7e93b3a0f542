//! Session middleware configuration.

use tower_sessions::{Expiry, SessionManagerLayer, SessionStore};

use crate::config::OtpLoginConfig;

/// Session cookie name.
pub const SESSION_COOKIE_NAME: &str = "otp_session";

/// Session expiry on inactivity (12 hours).
const SESSION_EXPIRY_SECONDS: i64 = 12 * 60 * 60;

/// Create the session layer over `store`.
///
/// The binary passes a `PostgresStore` when a database URL is configured
/// and a `MemoryStore` otherwise; tests use `MemoryStore`. The sessions
/// table for `PostgresStore` is created by `otp-cli migrate`.
#[must_use]
pub fn create_session_layer<S>(store: S, config: &OtpLoginConfig) -> SessionManagerLayer<S>
where
    S: SessionStore + Clone,
{
    SessionManagerLayer::new(store)
        .with_name(SESSION_COOKIE_NAME)
        .with_expiry(Expiry::OnInactivity(
            tower_sessions::cookie::time::Duration::seconds(SESSION_EXPIRY_SECONDS),
        ))
        .with_secure(config.is_secure())
        .with_same_site(tower_sessions::cookie::SameSite::Lax)
        .with_http_only(true)
        .with_path("/")
}
