//! Name-to-transport resolution.
//!
//! The registry holds one factory closure per configured service name.
//! Resolving a name runs its factory and hands back a fresh transport, or
//! `None` if the name is unknown or the transport cannot be built. Nothing
//! here touches the network.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use thiserror::Error;

use super::{LogNotifier, Notifier, SmtpNotifier, TwilioNotifier};
use crate::config::{OtpLoginConfig, ServiceKind};

/// Errors raised while constructing a transport.
#[derive(Debug, Error)]
pub enum BuildError {
    /// The service needs settings that are not present.
    #[error("{0} is not configured")]
    NotConfigured(&'static str),

    /// An address in the transport settings is invalid.
    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    /// SMTP relay setup failed.
    #[error("SMTP error: {0}")]
    Smtp(#[from] lettre::transport::smtp::Error),

    /// HTTP client setup failed.
    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),
}

/// Constructs a fresh transport instance.
pub type ServiceFactory = Arc<dyn Fn() -> Result<Arc<dyn Notifier>, BuildError> + Send + Sync>;

/// Registration table from service name to transport factory.
#[derive(Clone, Default)]
pub struct ServiceRegistry {
    factories: BTreeMap<String, ServiceFactory>,
}

impl ServiceRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the registry from the configured service table.
    ///
    /// Transport settings are captured by each factory, so a service whose
    /// settings are missing still registers and simply fails to resolve.
    #[must_use]
    pub fn from_config(config: &OtpLoginConfig) -> Self {
        let mut registry = Self::new();

        for (name, kind) in &config.otp.services {
            match kind {
                ServiceKind::Smtp => {
                    let smtp = config.smtp.clone();
                    registry.register(name.clone(), move || {
                        let smtp = smtp.as_ref().ok_or(BuildError::NotConfigured("SMTP"))?;
                        Ok(Arc::new(SmtpNotifier::new(smtp)?) as Arc<dyn Notifier>)
                    });
                }
                ServiceKind::Twilio => {
                    let twilio = config.twilio.clone();
                    registry.register(name.clone(), move || {
                        let twilio = twilio
                            .as_ref()
                            .ok_or(BuildError::NotConfigured("Twilio"))?;
                        Ok(Arc::new(TwilioNotifier::new(twilio)?) as Arc<dyn Notifier>)
                    });
                }
                ServiceKind::Log => {
                    registry.register(name.clone(), || {
                        Ok(Arc::new(LogNotifier) as Arc<dyn Notifier>)
                    });
                }
            }
        }

        registry
    }

    /// Register (or replace) the factory for `name`.
    pub fn register<F>(&mut self, name: impl Into<String>, factory: F)
    where
        F: Fn() -> Result<Arc<dyn Notifier>, BuildError> + Send + Sync + 'static,
    {
        self.factories.insert(name.into(), Arc::new(factory));
    }

    /// Construct the transport registered under `name`.
    ///
    /// Returns `None` for an empty or unknown name, and when the factory
    /// fails. Never panics.
    #[must_use]
    pub fn resolve(&self, name: &str) -> Option<Arc<dyn Notifier>> {
        if name.is_empty() {
            return None;
        }

        let Some(factory) = self.factories.get(name) else {
            tracing::debug!(service = %name, "Unknown notification service");
            return None;
        };

        match factory() {
            Ok(notifier) => Some(notifier),
            Err(e) => {
                tracing::warn!(service = %name, error = %e, "Failed to build notification service");
                None
            }
        }
    }

    /// Whether `name` has a registered factory.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    /// Registered service names, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        self.factories.keys().map(String::as_str).collect()
    }
}

impl fmt::Debug for ServiceRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceRegistry")
            .field("services", &self.names())
            .finish()
    }
}
