//! HTTP middleware and extractors.
//!
//! # Middleware Order (outermost first)
//!
//! 1. Sentry layers (added by the binary)
//! 2. `TraceLayer` (request span with status and latency)
//! 3. Request ID (propagated or generated, echoed in the response)
//! 4. Session layer (tower-sessions)
//! 5. `require_otp` on the host's protected routes

pub mod auth;
pub mod otp_guard;
pub mod request_id;
pub mod session;

pub use auth::{AuthRejection, OptionalAuth, RequireAuth, clear_current_user, set_current_user};
pub use otp_guard::require_otp;
pub use request_id::{REQUEST_ID_HEADER, request_id_middleware};
pub use session::{SESSION_COOKIE_NAME, create_session_layer};
