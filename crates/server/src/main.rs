//! OTP Login - Second-factor verification server.
//!
//! Serves the verification routes on port 3000 by default.
//!
//! # Architecture
//!
//! - Axum web framework with Askama templates
//! - tower-sessions backed by `PostgreSQL` (or memory when no database is set)
//! - Notification services resolved by name: SMTP email, Twilio SMS, log
//!
//! Sessions table migrations are NOT run on startup. Run them with
//! `otp-cli migrate`.

#![cfg_attr(not(test), forbid(unsafe_code))]

use std::error::Error;

use axum::Router;
use otp_login_server::config::OtpLoginConfig;
use otp_login_server::services::notify::ServiceRegistry;
use otp_login_server::state::AppState;
use otp_login_server::telemetry::{init_sentry, init_tracing};
use secrecy::ExposeSecret;
use sqlx::postgres::PgPoolOptions;
use tower_sessions::session_store::ExpiredDeletion;
use tower_sessions::{MemoryStore, SessionStore};
use tower_sessions_sqlx_store::PostgresStore;

/// Interval between sweeps of expired sessions in `PostgreSQL`.
const SESSION_CLEANUP_INTERVAL_SECS: u64 = 60 * 60;

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    // Load configuration first (needed for Sentry init)
    let config = OtpLoginConfig::from_env()?;

    // Sentry must be initialized before the tracing subscriber
    let _sentry_guard = init_sentry(&config);
    init_tracing();

    let registry = ServiceRegistry::from_config(&config);
    for name in registry.names() {
        if registry.resolve(name).is_none() {
            tracing::warn!(service = %name, "Notification service is configured but cannot be built");
        }
    }
    tracing::info!(
        services = ?registry.names(),
        default_service = %config.otp.default_service,
        enabled = config.otp.enabled,
        "Notification services registered"
    );

    let addr = config.socket_addr();

    match config.database_url.clone() {
        Some(url) => {
            let pool = PgPoolOptions::new()
                .max_connections(5)
                .connect(url.expose_secret())
                .await?;
            tracing::info!("Database pool created");

            let store = PostgresStore::new(pool.clone());
            tokio::spawn(
                store
                    .clone()
                    .continuously_delete_expired(tokio::time::Duration::from_secs(
                        SESSION_CLEANUP_INTERVAL_SECS,
                    )),
            );

            let state = AppState::new(config, registry, Some(pool));
            serve(addr, state, store).await
        }
        None => {
            tracing::warn!("No database configured, sessions are kept in memory");
            let state = AppState::new(config, registry, None);
            serve(addr, state, MemoryStore::default()).await
        }
    }
}

async fn serve<S>(
    addr: std::net::SocketAddr,
    state: AppState,
    store: S,
) -> Result<(), Box<dyn Error>>
where
    S: SessionStore + Clone,
{
    let app = otp_login_server::router(state, store, Router::new())
        // Sentry layers (outermost for full request coverage)
        .layer(sentry_tower::NewSentryLayer::new_from_top())
        .layer(sentry_tower::SentryHttpLayer::new().enable_transaction());

    tracing::info!("otp-login listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    tracing::info!("Shutdown signal received, starting graceful shutdown");
}
