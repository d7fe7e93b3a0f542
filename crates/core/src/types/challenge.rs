//! OTP challenge and the verification policy that drives it.
//!
//! A challenge moves through a small state machine:
//!
//! ```text
//!                 ┌──────────── wrong code (attempts += 1) ───┐
//!                 ▼                                           │
//! issue ──► AwaitingCode ──── matching code, not expired ───► Verified
//!                 │
//!                 ├──── now > expires_at ─────────────────────► Expired
//!                 └──── attempts >= max_attempts ─────────────► Rejected (locked out)
//! ```
//!
//! Only `Rejected(WrongCode)` keeps the challenge alive. Every other outcome
//! is terminal and the caller must discard the challenge.

use core::fmt;

use chrono::{DateTime, TimeDelta, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use super::id::UserId;

/// Characters used for challenge reference tags (no 0/O or 1/I).
const REFERENCE_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";

/// Length of a challenge reference tag.
const REFERENCE_LENGTH: usize = 4;

/// Errors returned when building an [`OtpPolicy`] from configuration.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum PolicyError {
    /// Code length outside the supported range.
    #[error("code length must be between {min} and {max} (got {got})")]
    CodeLength {
        /// Minimum supported length.
        min: usize,
        /// Maximum supported length.
        max: usize,
        /// Requested length.
        got: usize,
    },
    /// Time-to-live is zero or too large.
    #[error("code lifetime must be between 1 and {max} seconds (got {got})")]
    Ttl {
        /// Maximum supported lifetime in seconds.
        max: u64,
        /// Requested lifetime in seconds.
        got: u64,
    },
    /// Max attempts is zero.
    #[error("max attempts must be at least 1")]
    MaxAttempts,
}

/// A plaintext one-time code.
///
/// Only ever held in memory between generation and delivery. `Debug` is
/// redacted so codes do not leak into logs.
#[derive(Clone, PartialEq, Eq)]
pub struct OtpCode(String);

impl OtpCode {
    /// Wrap an existing code value.
    #[must_use]
    pub fn new(code: impl Into<String>) -> Self {
        Self(code.into())
    }

    /// Generate a random numeric code of `length` digits. Leading zeros are
    /// allowed, so every digit is drawn independently.
    #[must_use]
    pub fn generate(length: usize) -> Self {
        let mut rng = rand::rng();
        let code = (0..length)
            .map(|_| char::from(b'0' + rng.random_range(0..10u8)))
            .collect();
        Self(code)
    }

    /// The code value, for rendering into an outgoing message.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Hex-encoded SHA-256 of the code. This is what gets stored.
    #[must_use]
    pub fn digest(&self) -> String {
        digest(&self.0)
    }
}

impl fmt::Debug for OtpCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("OtpCode([REDACTED])")
    }
}

fn digest(value: &str) -> String {
    hex::encode(Sha256::digest(value.as_bytes()))
}

/// Why a submission was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// The code did not match; the challenge stays active.
    WrongCode {
        /// Submissions left before lockout.
        attempts_left: u32,
    },
    /// The attempt limit was already reached; the challenge is invalidated.
    LockedOut,
}

/// Result of checking a submitted code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckOutcome {
    /// Code matched before expiry.
    Verified,
    /// Wrong code or locked out.
    Rejected(RejectReason),
    /// No active challenge, or it expired. Issue a new one.
    Expired,
}

impl CheckOutcome {
    /// Whether the challenge must be kept for further attempts.
    #[must_use]
    pub const fn keeps_challenge(&self) -> bool {
        matches!(self, Self::Rejected(RejectReason::WrongCode { .. }))
    }
}

/// Server-side record of an issued code awaiting verification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OtpChallenge {
    /// User the code was issued to.
    pub user_id: UserId,
    /// Hex SHA-256 of the code.
    pub code_hash: String,
    /// Short public tag shown on the form and included in the message.
    pub reference: String,
    /// Name of the service the code was sent through.
    pub service: String,
    /// Masked destination the code was sent to, for display.
    #[serde(default)]
    pub sent_to: String,
    /// When the code was issued.
    pub issued_at: DateTime<Utc>,
    /// Last instant at which the code is accepted.
    pub expires_at: DateTime<Utc>,
    /// Wrong submissions so far.
    pub attempts: u32,
}

impl OtpChallenge {
    /// Build a challenge for `code`, valid for `ttl` from `issued_at`.
    #[must_use]
    pub fn new(
        user_id: UserId,
        code: &OtpCode,
        reference: impl Into<String>,
        service: impl Into<String>,
        issued_at: DateTime<Utc>,
        ttl: TimeDelta,
    ) -> Self {
        Self {
            user_id,
            code_hash: code.digest(),
            reference: reference.into(),
            service: service.into(),
            sent_to: String::new(),
            issued_at,
            expires_at: issued_at + ttl,
            attempts: 0,
        }
    }

    /// Whether `now` is past the expiry instant.
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }

    /// Whether this challenge belongs to `user_id` and is still usable.
    #[must_use]
    pub fn is_active_for(&self, user_id: UserId, now: DateTime<Utc>, max_attempts: u32) -> bool {
        self.user_id == user_id && !self.is_expired(now) && self.attempts < max_attempts
    }

    /// Submissions left before lockout.
    #[must_use]
    pub const fn attempts_left(&self, max_attempts: u32) -> u32 {
        max_attempts.saturating_sub(self.attempts)
    }

    /// Whole seconds until expiry, zero once expired.
    #[must_use]
    pub fn seconds_remaining(&self, now: DateTime<Utc>) -> i64 {
        (self.expires_at - now).num_seconds().max(0)
    }

    /// Constant-time comparison of `submitted` (trimmed) against the stored digest.
    #[must_use]
    pub fn matches(&self, submitted: &str) -> bool {
        let candidate = digest(submitted.trim());
        candidate
            .as_bytes()
            .ct_eq(self.code_hash.as_bytes())
            .into()
    }

    /// Check a submission at `now`.
    ///
    /// Order matters: expiry wins over everything, then the attempt limit
    /// (so a correct code after lockout is still rejected), then the code
    /// itself. A wrong code increments `attempts`.
    pub fn check(&mut self, submitted: &str, now: DateTime<Utc>, max_attempts: u32) -> CheckOutcome {
        if self.is_expired(now) {
            return CheckOutcome::Expired;
        }

        if self.attempts >= max_attempts {
            return CheckOutcome::Rejected(RejectReason::LockedOut);
        }

        if self.matches(submitted) {
            return CheckOutcome::Verified;
        }

        self.attempts = self.attempts.saturating_add(1);
        CheckOutcome::Rejected(RejectReason::WrongCode {
            attempts_left: self.attempts_left(max_attempts),
        })
    }
}

/// Code length, lifetime and attempt limit for issued challenges.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OtpPolicy {
    code_length: usize,
    ttl: TimeDelta,
    max_attempts: u32,
}

impl OtpPolicy {
    /// Default number of digits.
    pub const DEFAULT_CODE_LENGTH: usize = 6;
    /// Shortest supported code.
    pub const MIN_CODE_LENGTH: usize = 4;
    /// Longest supported code.
    pub const MAX_CODE_LENGTH: usize = 10;
    /// Default lifetime (5 minutes).
    pub const DEFAULT_TTL_SECS: u64 = 300;
    /// Longest supported lifetime (1 day).
    pub const MAX_TTL_SECS: u64 = 24 * 60 * 60;
    /// Default attempt limit.
    pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

    /// Build a policy, validating every parameter.
    ///
    /// # Errors
    ///
    /// Returns `PolicyError` if the code length, lifetime, or attempt limit
    /// is out of range.
    pub fn new(code_length: usize, ttl_secs: u64, max_attempts: u32) -> Result<Self, PolicyError> {
        if !(Self::MIN_CODE_LENGTH..=Self::MAX_CODE_LENGTH).contains(&code_length) {
            return Err(PolicyError::CodeLength {
                min: Self::MIN_CODE_LENGTH,
                max: Self::MAX_CODE_LENGTH,
                got: code_length,
            });
        }

        let ttl = (1..=Self::MAX_TTL_SECS)
            .contains(&ttl_secs)
            .then(|| i64::try_from(ttl_secs).ok())
            .flatten()
            .and_then(TimeDelta::try_seconds)
            .ok_or(PolicyError::Ttl {
                max: Self::MAX_TTL_SECS,
                got: ttl_secs,
            })?;

        if max_attempts == 0 {
            return Err(PolicyError::MaxAttempts);
        }

        Ok(Self {
            code_length,
            ttl,
            max_attempts,
        })
    }

    /// Number of digits in generated codes.
    #[must_use]
    pub const fn code_length(&self) -> usize {
        self.code_length
    }

    /// How long an issued code stays valid.
    #[must_use]
    pub const fn ttl(&self) -> TimeDelta {
        self.ttl
    }

    /// Wrong submissions allowed before lockout.
    #[must_use]
    pub const fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Issue a fresh code and its challenge for `user_id`.
    ///
    /// The plaintext code is returned separately so it can be delivered;
    /// the challenge only carries its digest.
    #[must_use]
    pub fn issue(
        &self,
        user_id: UserId,
        service: &str,
        now: DateTime<Utc>,
    ) -> (OtpCode, OtpChallenge) {
        let code = OtpCode::generate(self.code_length);
        let challenge =
            OtpChallenge::new(user_id, &code, generate_reference(), service, now, self.ttl);
        (code, challenge)
    }
}

impl Default for OtpPolicy {
    fn default() -> Self {
        Self {
            code_length: Self::DEFAULT_CODE_LENGTH,
            ttl: TimeDelta::seconds(300),
            max_attempts: Self::DEFAULT_MAX_ATTEMPTS,
        }
    }
}

fn generate_reference() -> String {
    let mut rng = rand::rng();
    (0..REFERENCE_LENGTH)
        .map(|_| {
            let idx = rng.random_range(0..REFERENCE_ALPHABET.len());
            char::from(REFERENCE_ALPHABET.get(idx).copied().unwrap_or(b'X'))
        })
        .collect()
}
