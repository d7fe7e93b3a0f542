//! Application state shared across handlers.

use std::sync::Arc;

use sqlx::PgPool;

use crate::config::OtpLoginConfig;
use crate::services::notify::ServiceRegistry;
use crate::services::otp::{AttemptLedger, OtpService};

/// Application state shared across all handlers.
///
/// Cheaply cloneable via `Arc`. Immutable once built.
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    config: OtpLoginConfig,
    registry: ServiceRegistry,
    attempts: AttemptLedger,
    pool: Option<PgPool>,
}

impl AppState {
    /// Create a new application state.
    ///
    /// # Arguments
    ///
    /// * `config` - Loaded configuration
    /// * `registry` - Notification services, usually [`ServiceRegistry::from_config`]
    /// * `pool` - Session database pool, `None` when sessions are kept in memory
    #[must_use]
    pub fn new(config: OtpLoginConfig, registry: ServiceRegistry, pool: Option<PgPool>) -> Self {
        Self {
            inner: Arc::new(AppStateInner {
                config,
                registry,
                attempts: AttemptLedger::new(),
                pool,
            }),
        }
    }

    /// Get a reference to the configuration.
    #[must_use]
    pub fn config(&self) -> &OtpLoginConfig {
        &self.inner.config
    }

    /// Get a reference to the notification service registry.
    #[must_use]
    pub fn registry(&self) -> &ServiceRegistry {
        &self.inner.registry
    }

    /// Get the session database pool, if sessions are stored in `PostgreSQL`.
    #[must_use]
    pub fn pool(&self) -> Option<&PgPool> {
        self.inner.pool.as_ref()
    }

    /// Verification service bound to this state.
    #[must_use]
    pub fn otp(&self) -> OtpService<'_> {
        OtpService::new(
            &self.inner.registry,
            &self.inner.config.otp,
            &self.inner.attempts,
        )
    }
}
