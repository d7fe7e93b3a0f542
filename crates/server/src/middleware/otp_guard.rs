//! Guard for routes that require a verified second factor.

use axum::{
    extract::{Request, State},
    middleware::Next,
    response::{IntoResponse, Redirect, Response},
};
use tower_sessions::Session;

use crate::error::AppError;
use crate::models::{CurrentUser, session_keys};
use crate::routes::VERIFY_PATH;
use crate::state::AppState;

/// Redirect logged-in but unverified sessions to the verification form.
///
/// Requests without a logged-in user pass through untouched; guarding the
/// first factor is the host's job. With `OTP_ENABLED=false` everything
/// passes.
///
/// ```rust,ignore
/// let protected = Router::new()
///     .route("/account", get(account))
///     .route_layer(axum::middleware::from_fn_with_state(state.clone(), require_otp));
/// ```
///
/// # Errors
///
/// Returns `AppError::Session` if the session cannot be read.
pub async fn require_otp(
    State(state): State<AppState>,
    session: Session,
    request: Request,
    next: Next,
) -> Result<Response, AppError> {
    if !state.config().otp.enabled {
        return Ok(next.run(request).await);
    }

    let user = session
        .get::<CurrentUser>(session_keys::CURRENT_USER)
        .await?;

    let Some(user) = user else {
        return Ok(next.run(request).await);
    };

    if state.otp().is_verified(&session).await? {
        return Ok(next.run(request).await);
    }

    tracing::debug!(user_id = %user.id, path = %request.uri().path(), "Second factor required");
    Ok(Redirect::to(VERIFY_PATH).into_response())
}
