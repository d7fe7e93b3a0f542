//! Session-related types.
//!
//! The host's first-factor login writes a [`CurrentUser`] under
//! [`keys::CURRENT_USER`]. Everything else here is owned by the
//! verification flow.

use serde::{Deserialize, Serialize};

use otp_login_core::{Email, PhoneNumber, UserId};

/// Session-stored user identity.
///
/// Minimal data needed to address a code to the logged-in user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CurrentUser {
    /// User's database ID.
    pub id: UserId,
    /// User's email address.
    pub email: Email,
    /// Phone number for SMS services, if the user has one.
    #[serde(default)]
    pub phone: Option<PhoneNumber>,
}

/// Session keys for authentication data.
pub mod keys {
    /// Key for storing the current logged-in user.
    pub const CURRENT_USER: &str = "current_user";

    /// Key for the pending [`OtpChallenge`](otp_login_core::OtpChallenge).
    pub const OTP_CHALLENGE: &str = "otp_challenge";

    /// Key for the flag set once the code has been verified.
    pub const OTP_VERIFIED: &str = "otp_verified";
}
