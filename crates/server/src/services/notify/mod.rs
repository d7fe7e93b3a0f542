//! Notification transports for delivering one-time codes.
//!
//! A [`Notifier`] sends an [`OtpMessage`] to a [`Destination`]. Concrete
//! transports are constructed by name through the [`ServiceRegistry`].

mod log;
mod registry;
mod smtp;
mod twilio;

use askama::Template;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use otp_login_core::{Email, OtpChallenge, OtpCode, PhoneNumber};
use thiserror::Error;

use crate::models::CurrentUser;

pub use self::log::{CODE_LOG_TARGET, LogNotifier};
pub use registry::{BuildError, ServiceFactory, ServiceRegistry};
pub use smtp::SmtpNotifier;
pub use twilio::TwilioNotifier;

/// Delivery channel a transport speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    /// Email address destination.
    Email,
    /// Phone number destination.
    Sms,
    /// Written to the application log; addressed by email.
    Log,
}

impl Channel {
    /// Lowercase name for logs and templates.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Email => "email",
            Self::Sms => "sms",
            Self::Log => "log",
        }
    }
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a code is delivered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Destination {
    /// An email inbox.
    Email(Email),
    /// A phone able to receive SMS.
    Phone(PhoneNumber),
}

impl Destination {
    /// Pick the user's address for `channel`.
    ///
    /// Returns `None` when the user has nothing to send to on that channel,
    /// e.g. an SMS service and no phone number on file.
    #[must_use]
    pub fn for_channel(channel: Channel, user: &CurrentUser) -> Option<Self> {
        match channel {
            Channel::Email | Channel::Log => Some(Self::Email(user.email.clone())),
            Channel::Sms => user.phone.clone().map(Self::Phone),
        }
    }

    /// Parse a free-form destination (used by the CLI): anything with an `@`
    /// is an email address, everything else a phone number.
    ///
    /// # Errors
    ///
    /// Returns a message describing why the value is not a valid address.
    pub fn parse(value: &str) -> Result<Self, String> {
        if value.contains('@') {
            Email::parse(value)
                .map(Self::Email)
                .map_err(|e| e.to_string())
        } else {
            PhoneNumber::parse(value)
                .map(Self::Phone)
                .map_err(|e| e.to_string())
        }
    }

    /// Raw address string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::Email(email) => email.as_str(),
            Self::Phone(phone) => phone.as_str(),
        }
    }

    /// Address with most characters hidden, safe to show and log.
    #[must_use]
    pub fn masked(&self) -> String {
        match self {
            Self::Email(email) => email.masked(),
            Self::Phone(phone) => phone.masked(),
        }
    }
}

/// Errors returned by a transport's `send`.
#[derive(Debug, Error)]
pub enum NotifyError {
    /// The transport cannot deliver to this kind of destination.
    #[error("{channel} transport cannot deliver to {destination}")]
    UnsupportedDestination {
        /// Transport channel.
        channel: Channel,
        /// Masked destination.
        destination: String,
    },

    /// Destination address rejected by the transport.
    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    /// Message body rendering failed.
    #[error("Template error: {0}")]
    Template(#[from] askama::Error),

    /// Network or protocol failure talking to the provider.
    #[error("Transport error: {0}")]
    Transport(String),

    /// The provider answered with a non-success status.
    #[error("Provider returned {status}: {body}")]
    Provider {
        /// HTTP status code.
        status: u16,
        /// Response body, truncated.
        body: String,
    },
}

/// A notification transport.
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Channel this transport delivers on.
    fn channel(&self) -> Channel;

    /// Deliver `message` to `destination`.
    async fn send(&self, destination: &Destination, message: &OtpMessage)
    -> Result<(), NotifyError>;
}

/// The content of a code notification.
#[derive(Debug, Clone)]
pub struct OtpMessage {
    /// Plaintext code.
    pub code: OtpCode,
    /// Challenge reference shown on the verification form.
    pub reference: String,
    /// Whole minutes until the code expires, at least 1.
    pub valid_for_minutes: i64,
}

#[derive(Template)]
#[template(path = "messages/code.txt")]
struct CodeText<'a> {
    code: &'a str,
    reference: &'a str,
    minutes: i64,
}

#[derive(Template)]
#[template(path = "messages/code_email.html")]
struct CodeEmailHtml<'a> {
    code: &'a str,
    reference: &'a str,
    minutes: i64,
}

#[derive(Template)]
#[template(path = "messages/code_sms.txt")]
struct CodeSms<'a> {
    code: &'a str,
    reference: &'a str,
    minutes: i64,
}

impl OtpMessage {
    /// Build the message for a freshly issued challenge.
    #[must_use]
    pub fn new(code: OtpCode, challenge: &OtpChallenge, now: DateTime<Utc>) -> Self {
        let seconds = challenge.seconds_remaining(now);
        Self {
            code,
            reference: challenge.reference.clone(),
            valid_for_minutes: ((seconds + 59) / 60).max(1),
        }
    }

    /// Email subject line.
    #[must_use]
    pub fn subject(&self) -> String {
        format!("Your login code (ref {})", self.reference)
    }

    /// Plain-text email body.
    ///
    /// # Errors
    ///
    /// Returns an error if the template fails to render.
    pub fn render_text(&self) -> Result<String, askama::Error> {
        CodeText {
            code: self.code.as_str(),
            reference: &self.reference,
            minutes: self.valid_for_minutes,
        }
        .render()
    }

    /// HTML email body.
    ///
    /// # Errors
    ///
    /// Returns an error if the template fails to render.
    pub fn render_html(&self) -> Result<String, askama::Error> {
        CodeEmailHtml {
            code: self.code.as_str(),
            reference: &self.reference,
            minutes: self.valid_for_minutes,
        }
        .render()
    }

    /// Short SMS body.
    ///
    /// # Errors
    ///
    /// Returns an error if the template fails to render.
    pub fn render_sms(&self) -> Result<String, askama::Error> {
        CodeSms {
            code: self.code.as_str(),
            reference: &self.reference,
            minutes: self.valid_for_minutes,
        }
        .render()
    }
}
