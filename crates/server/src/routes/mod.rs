//! HTTP route handlers.
//!
//! # Route Structure
//!
//! ```text
//! GET  /health                 - Liveness check
//! GET  /health/ready           - Readiness check (session database)
//!
//! # Verification (requires a logged-in user)
//! GET  /login/verify           - Show the code form, issuing a code if needed
//! POST /login/check            - Check the submitted code
//! POST /login/resend           - Issue a new code, optionally via another service
//! ```

pub mod otp;

use axum::{
    Router,
    routing::{get, post},
};

use crate::state::AppState;

/// Path of the verification form.
pub const VERIFY_PATH: &str = "/login/verify";

/// Path the code form posts to.
pub const CHECK_PATH: &str = "/login/check";

/// Path the resend form posts to.
pub const RESEND_PATH: &str = "/login/resend";

/// Create the verification routes router.
pub fn routes() -> Router<AppState> {
    Router::new()
        .route(VERIFY_PATH, get(otp::view))
        .route(CHECK_PATH, post(otp::check))
        .route(RESEND_PATH, post(otp::resend))
}
