//! Phone number type for SMS delivery.

use core::fmt;

use serde::{Deserialize, Serialize};

/// Errors that can occur when parsing a [`PhoneNumber`].
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum PhoneNumberError {
    /// The input string is empty.
    #[error("phone number cannot be empty")]
    Empty,
    /// The number does not start with `+`.
    #[error("phone number must be in E.164 format (start with +)")]
    MissingPlus,
    /// The number contains something other than digits after the `+`.
    #[error("phone number may only contain digits after the +")]
    InvalidCharacter,
    /// Wrong number of digits.
    #[error("phone number must have between {min} and {max} digits")]
    InvalidLength {
        /// Minimum digit count.
        min: usize,
        /// Maximum digit count.
        max: usize,
    },
}

/// A phone number in E.164 format (`+` followed by 8-15 digits).
///
/// Spaces, dashes, dots and parentheses are stripped before validation so
/// that `+1 (555) 010-9999` parses to `+15550109999`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(try_from = "String", into = "String")]
pub struct PhoneNumber(String);

impl PhoneNumber {
    /// Minimum number of digits.
    pub const MIN_DIGITS: usize = 8;
    /// Maximum number of digits (E.164).
    pub const MAX_DIGITS: usize = 15;

    /// Parse a `PhoneNumber` from a string.
    ///
    /// # Errors
    ///
    /// Returns an error if the input is empty, lacks a leading `+`, contains
    /// non-digit characters, or has the wrong number of digits.
    pub fn parse(s: &str) -> Result<Self, PhoneNumberError> {
        let compact: String = s
            .chars()
            .filter(|c| !matches!(c, ' ' | '-' | '.' | '(' | ')'))
            .collect();

        if compact.is_empty() {
            return Err(PhoneNumberError::Empty);
        }

        let digits = compact
            .strip_prefix('+')
            .ok_or(PhoneNumberError::MissingPlus)?;

        if !digits.chars().all(|c| c.is_ascii_digit()) {
            return Err(PhoneNumberError::InvalidCharacter);
        }

        if !(Self::MIN_DIGITS..=Self::MAX_DIGITS).contains(&digits.len()) {
            return Err(PhoneNumberError::InvalidLength {
                min: Self::MIN_DIGITS,
                max: Self::MAX_DIGITS,
            });
        }

        Ok(Self(compact))
    }

    /// Returns the number as a string slice, including the leading `+`.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns a masked form showing only the last four digits.
    #[must_use]
    pub fn masked(&self) -> String {
        let tail_start = self.0.len().saturating_sub(4);
        let tail = self.0.get(tail_start..).unwrap_or_default();
        format!("+{}{tail}", "*".repeat(tail_start.saturating_sub(1)))
    }
}

impl fmt::Display for PhoneNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for PhoneNumber {
    type Err = PhoneNumberError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for PhoneNumber {
    type Error = PhoneNumberError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<PhoneNumber> for String {
    fn from(phone: PhoneNumber) -> Self {
        phone.0
    }
}
