//! Session table migration.
//!
//! # Environment Variables
//!
//! - `OTP_DATABASE_URL` - `PostgreSQL` connection string (fallback: `DATABASE_URL`)

use secrecy::{ExposeSecret, SecretString};
use sqlx::PgPool;
use tower_sessions_sqlx_store::PostgresStore;

/// Errors that can occur while migrating.
#[derive(Debug, thiserror::Error)]
pub enum MigrationError {
    #[error("Missing environment variable: OTP_DATABASE_URL or DATABASE_URL")]
    MissingDatabaseUrl,

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Create the `tower_sessions` schema and session table if missing.
///
/// # Errors
///
/// Returns an error if no database URL is set or the database rejects the
/// migration.
pub async fn run() -> Result<(), MigrationError> {
    dotenvy::dotenv().ok();

    let database_url = ["OTP_DATABASE_URL", "DATABASE_URL"]
        .iter()
        .find_map(|key| std::env::var(key).ok().filter(|v| !v.trim().is_empty()))
        .map(SecretString::from)
        .ok_or(MigrationError::MissingDatabaseUrl)?;

    tracing::info!("Connecting to session database...");
    let pool = PgPool::connect(database_url.expose_secret()).await?;

    tracing::info!("Creating session table...");
    PostgresStore::new(pool).migrate().await?;

    tracing::info!("Session migrations complete!");
    Ok(())
}
