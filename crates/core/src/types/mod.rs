//! Core types for OTP login.
//!
//! This module provides type-safe wrappers for the login verification domain.

pub mod challenge;
pub mod email;
pub mod id;
pub mod phone;

pub use challenge::{CheckOutcome, OtpChallenge, OtpCode, OtpPolicy, PolicyError, RejectReason};
pub use email::{Email, EmailError};
pub use id::UserId;
pub use phone::{PhoneNumber, PhoneNumberError};
