//! OTP Login Core - Shared types and verification policy.
//!
//! This crate provides the types used across the OTP login components:
//! - `server` - The `/login/verify` and `/login/check` routes
//! - `cli` - Command-line tools for migrations and transport checks
//!
//! # Architecture
//!
//! The core crate contains only types and pure logic - no I/O, no sessions,
//! no HTTP clients. The challenge state machine takes `now` as an argument so
//! it can be driven deterministically from tests.
//!
//! # Modules
//!
//! - [`types`] - Newtype wrappers for user IDs, emails, phone numbers, and
//!   the OTP challenge itself

#![cfg_attr(not(test), forbid(unsafe_code))]

pub mod types;

pub use types::*;
