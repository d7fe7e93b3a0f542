//! First-factor authentication extractors.
//!
//! The host application logs users in and calls [`set_current_user`]; the
//! verification routes read that identity back with [`RequireAuth`].

use axum::{
    extract::{FromRef, FromRequestParts},
    http::{StatusCode, request::Parts},
    response::{IntoResponse, Redirect, Response},
};
use otp_login_core::OtpChallenge;
use tower_sessions::Session;

use crate::models::{CurrentUser, session_keys};
use crate::state::AppState;

/// Extractor that requires a logged-in user.
///
/// Redirects to the configured login page (`OTP_LOGIN_URL`) otherwise.
///
/// # Example
///
/// ```rust,ignore
/// async fn handler(RequireAuth(user): RequireAuth) -> impl IntoResponse {
///     format!("Hello, {}!", user.email)
/// }
/// ```
pub struct RequireAuth(pub CurrentUser);

/// Rejection returned when no user is logged in.
#[derive(Debug)]
pub enum AuthRejection {
    /// Redirect to the login page.
    RedirectToLogin(String),
    /// The session layer is missing.
    NoSession,
}

impl IntoResponse for AuthRejection {
    fn into_response(self) -> Response {
        match self {
            Self::RedirectToLogin(url) => Redirect::to(&url).into_response(),
            Self::NoSession => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
        }
    }
}

impl<S> FromRequestParts<S> for RequireAuth
where
    AppState: FromRef<S>,
    S: Send + Sync,
{
    type Rejection = AuthRejection;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let session = parts
            .extensions
            .get::<Session>()
            .ok_or(AuthRejection::NoSession)?;

        let user = session
            .get::<CurrentUser>(session_keys::CURRENT_USER)
            .await
            .ok()
            .flatten();

        user.map(Self).ok_or_else(|| {
            let app = AppState::from_ref(state);
            AuthRejection::RedirectToLogin(app.config().otp.login_url.clone())
        })
    }
}

/// Extractor that optionally gets the logged-in user.
pub struct OptionalAuth(pub Option<CurrentUser>);

impl<S> FromRequestParts<S> for OptionalAuth
where
    S: Send + Sync,
{
    type Rejection = std::convert::Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let user = match parts.extensions.get::<Session>() {
            Some(session) => session
                .get::<CurrentUser>(session_keys::CURRENT_USER)
                .await
                .ok()
                .flatten(),
            None => None,
        };

        Ok(Self(user))
    }
}

/// Record a successful first-factor login.
///
/// Any verification state from a previous user is discarded and the
/// session id is cycled.
///
/// # Errors
///
/// Returns an error if the session cannot be modified.
pub async fn set_current_user(
    session: &Session,
    user: &CurrentUser,
) -> Result<(), tower_sessions::session::Error> {
    reset_verification(session).await?;
    session.cycle_id().await?;
    session.insert(session_keys::CURRENT_USER, user).await
}

/// Log the user out, clearing identity and verification state.
///
/// # Errors
///
/// Returns an error if the session cannot be modified.
pub async fn clear_current_user(session: &Session) -> Result<(), tower_sessions::session::Error> {
    reset_verification(session).await?;
    session
        .remove::<CurrentUser>(session_keys::CURRENT_USER)
        .await?;
    Ok(())
}

async fn reset_verification(session: &Session) -> Result<(), tower_sessions::session::Error> {
    session
        .remove::<OtpChallenge>(session_keys::OTP_CHALLENGE)
        .await?;
    session.remove::<bool>(session_keys::OTP_VERIFIED).await?;
    Ok(())
}
