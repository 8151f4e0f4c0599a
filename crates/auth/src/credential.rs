//! The authentication artifact used to call the remote service
//!
//! Timestamps are unix milliseconds (absolute, not deltas). `issued_at` is
//! kept alongside `expires_at` so the refresh window can be derived from the
//! credential's total lifetime.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use common::Secret;
use serde::{Deserialize, Serialize};

/// Access and refresh material plus expiry.
///
/// Debug output redacts both tokens. A refresh produces a new `Credential`;
/// existing ones are never mutated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Credential {
    /// Bearer token for API calls
    pub access: Secret<String>,
    /// Token for obtaining the next credential
    pub refresh: Secret<String>,
    /// Scope the credential was issued for
    pub scope: String,
    /// Issue time as unix timestamp in milliseconds
    pub issued_at: u64,
    /// Expiration as unix timestamp in milliseconds
    pub expires_at: u64,
}

impl Credential {
    /// Build a credential valid for `lifetime` starting at `issued_at`.
    pub fn new(
        access: impl Into<String>,
        refresh: impl Into<String>,
        scope: impl Into<String>,
        issued_at: u64,
        lifetime: Duration,
    ) -> Self {
        Self {
            access: Secret::new(access.into()),
            refresh: Secret::new(refresh.into()),
            scope: scope.into(),
            issued_at,
            expires_at: issued_at.saturating_add(lifetime.as_millis() as u64),
        }
    }

    /// Total validity period.
    pub fn lifetime(&self) -> Duration {
        Duration::from_millis(self.expires_at.saturating_sub(self.issued_at))
    }

    /// Validity left at `now` (unix millis); zero once expired.
    pub fn remaining(&self, now: u64) -> Duration {
        Duration::from_millis(self.expires_at.saturating_sub(now))
    }

    pub fn is_expired(&self, now: u64) -> bool {
        now >= self.expires_at
    }
}

/// Current time as unix milliseconds.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifetime_and_remaining() {
        let cred = Credential::new("at", "rt", "SCOPE", 1_000_000, Duration::from_secs(300));
        assert_eq!(cred.expires_at, 1_300_000);
        assert_eq!(cred.lifetime(), Duration::from_secs(300));
        assert_eq!(cred.remaining(1_250_000), Duration::from_secs(50));
        assert_eq!(cred.remaining(2_000_000), Duration::ZERO);
    }

    #[test]
    fn expiry_is_inclusive() {
        let cred = Credential::new("at", "rt", "SCOPE", 0, Duration::from_secs(1));
        assert!(!cred.is_expired(999));
        assert!(cred.is_expired(1000));
    }

    #[test]
    fn debug_never_shows_tokens() {
        let cred = Credential::new("at_secret", "rt_secret", "SCOPE", 0, Duration::from_secs(1));
        let debug = format!("{cred:?}");
        assert!(!debug.contains("at_secret"), "got: {debug}");
        assert!(!debug.contains("rt_secret"), "got: {debug}");
        assert!(debug.contains("SCOPE"));
    }

    #[test]
    fn serde_roundtrip_keeps_tokens() {
        let cred = Credential::new("at_1", "rt_1", "SCOPE", 5, Duration::from_secs(60));
        let json = serde_json::to_string(&cred).unwrap();
        let back: Credential = serde_json::from_str(&json).unwrap();
        assert_eq!(back.access.expose(), "at_1");
        assert_eq!(back.refresh.expose(), "rt_1");
        assert_eq!(back.expires_at, cred.expires_at);
    }
}
