//! Process-wide count of wrong submissions per challenge.
//!
//! The challenge lives in the session and each request works on its own
//! copy, so parallel submissions on one cookie can all read the same
//! `attempts` value. Every check reserves its slot here first, which keeps
//! the attempt limit exact within one server process.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};
use otp_login_core::OtpChallenge;

#[derive(Debug, Default)]
pub struct AttemptLedger {
    // challenge key -> (attempts used, expiry)
    inner: Mutex<HashMap<String, (u32, DateTime<Utc>)>>,
}

impl AttemptLedger {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve one submission against `challenge`.
    ///
    /// Returns how many submissions were already used, counting both this
    /// ledger and the session copy, whichever is higher.
    pub fn reserve(&self, challenge: &OtpChallenge, now: DateTime<Utc>) -> u32 {
        let mut entries = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        entries.retain(|_, (_, expires_at)| *expires_at >= now);

        let (used, _) = entries
            .entry(key(challenge))
            .or_insert((challenge.attempts, challenge.expires_at));
        let before = (*used).max(challenge.attempts);
        *used = before.saturating_add(1);
        before
    }

    /// Drop the entry for a challenge that is no longer usable.
    pub fn forget(&self, challenge: &OtpChallenge) {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&key(challenge));
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

/// Codes alone repeat across users, so the key includes the owner and reference.
fn key(challenge: &OtpChallenge) -> String {
    format!(
        "{}:{}:{}",
        challenge.user_id, challenge.reference, challenge.code_hash
    )
}
