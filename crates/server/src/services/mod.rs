//! Business logic services.
//!
//! - `notify` - Notification transports and the name-to-transport registry
//! - `otp` - Issuing and checking one-time codes

pub mod notify;
pub mod otp;
