//! Failed-login ledger.
//!
//! Usernames and client IPs are tracked as independent identifiers; callers
//! check both and treat either lock as a lock.

use chrono::{DateTime, Duration, Utc};
use std::{
    collections::HashMap,
    sync::{PoisonError, RwLock},
};
use tracing::{info, warn};

pub const MAX_FAILED_ATTEMPTS: u32 = 5;
pub const LOCKOUT_MINUTES: i64 = 15;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct FailedLogin {
    count: u32,
    last_attempt: DateTime<Utc>,
    locked_until: Option<DateTime<Utc>>,
}

/// Snapshot returned by [`LockoutLedger::lockout`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LockoutInfo {
    pub attempts: u32,
    pub locked_until: Option<DateTime<Utc>>,
    pub is_locked: bool,
}

impl LockoutInfo {
    /// Attempts left before the next failure locks the identifier.
    #[must_use]
    pub fn remaining(&self, max_attempts: u32) -> u32 {
        max_attempts.saturating_sub(self.attempts)
    }
}

#[derive(Debug)]
pub struct LockoutLedger {
    max_attempts: u32,
    lockout: Duration,
    entries: RwLock<HashMap<String, FailedLogin>>,
}

impl Default for LockoutLedger {
    fn default() -> Self {
        Self::new(MAX_FAILED_ATTEMPTS, Duration::minutes(LOCKOUT_MINUTES))
    }
}

impl LockoutLedger {
    #[must_use]
    pub fn new(max_attempts: u32, lockout: Duration) -> Self {
        Self {
            max_attempts,
            lockout,
            entries: RwLock::new(HashMap::new()),
        }
    }

    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    #[must_use]
    pub fn lockout_minutes(&self) -> i64 {
        self.lockout.num_minutes()
    }

    pub fn record_failure(&self, identifier: &str) -> LockoutInfo {
        self.record_failure_at(identifier, Utc::now())
    }

    /// Count a failed attempt.
    ///
    /// An entry whose lock already expired starts over at one. A failure while
    /// still locked is counted but does not move `locked_until`.
    pub(crate) fn record_failure_at(&self, identifier: &str, now: DateTime<Utc>) -> LockoutInfo {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let entry = entries
            .entry(identifier.to_string())
            .or_insert(FailedLogin {
                count: 0,
                last_attempt: now,
                locked_until: None,
            });

        if entry.locked_until.is_some_and(|until| now >= until) {
            entry.count = 0;
            entry.locked_until = None;
        }

        entry.count = entry.count.saturating_add(1);
        entry.last_attempt = now;

        if entry.count >= self.max_attempts && entry.locked_until.is_none() {
            let until = now + self.lockout;
            entry.locked_until = Some(until);
            warn!(
                target: "security",
                identifier,
                attempts = entry.count,
                locked_until = %until.to_rfc3339(),
                "Account locked due to failed login attempts"
            );
        }

        Self::info_for(entry, now)
    }

    /// Drop the counters after a successful login.
    pub fn clear(&self, identifier: &str) {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(identifier);
    }

    /// Administrative reset.
    pub fn reset(&self, identifier: &str) {
        self.clear(identifier);
        info!(target: "security", identifier, "Lockout manually reset");
    }

    #[must_use]
    pub fn lockout(&self, identifier: &str) -> LockoutInfo {
        self.lockout_at(identifier, Utc::now())
    }

    /// Current state of an identifier; an expired lock reads as zero attempts.
    pub(crate) fn lockout_at(&self, identifier: &str, now: DateTime<Utc>) -> LockoutInfo {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        entries
            .get(identifier)
            .map(|entry| Self::info_for(entry, now))
            .unwrap_or_default()
    }

    fn info_for(entry: &FailedLogin, now: DateTime<Utc>) -> LockoutInfo {
        match entry.locked_until {
            Some(until) if now >= until => LockoutInfo::default(),
            Some(until) => LockoutInfo {
                attempts: entry.count,
                locked_until: Some(until),
                is_locked: true,
            },
            None => LockoutInfo {
                attempts: entry.count,
                locked_until: None,
                is_locked: false,
            },
        }
    }

    /// Identifiers with a recorded failure.
    #[must_use]
    pub fn tracked(&self) -> usize {
        self.entries.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Forget entries that are neither locked nor recently active.
    pub fn prune(&self) {
        self.prune_at(Utc::now());
    }

    pub(crate) fn prune_at(&self, now: DateTime<Utc>) {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let lockout = self.lockout;
        entries.retain(|_, entry| match entry.locked_until {
            Some(until) => now < until,
            None => now - entry.last_attempt < lockout,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_identifier_is_clear() {
        let ledger = LockoutLedger::default();
        assert_eq!(ledger.lockout("nobody"), LockoutInfo::default());
    }

    #[test]
    fn fifth_failure_locks_for_fifteen_minutes() {
        let ledger = LockoutLedger::default();
        let now = Utc::now();
        for attempt in 1..=4 {
            let info = ledger.record_failure_at("alice", now);
            assert_eq!(info.attempts, attempt);
            assert!(!info.is_locked);
            assert_eq!(info.remaining(MAX_FAILED_ATTEMPTS), MAX_FAILED_ATTEMPTS - attempt);
        }
        let info = ledger.record_failure_at("alice", now);
        assert!(info.is_locked);
        assert_eq!(info.locked_until, Some(now + Duration::minutes(15)));
    }

    #[test]
    fn failure_while_locked_does_not_extend() {
        let ledger = LockoutLedger::default();
        let now = Utc::now();
        for _ in 0..5 {
            ledger.record_failure_at("198.51.100.10", now);
        }
        let later = now + Duration::minutes(10);
        let info = ledger.record_failure_at("198.51.100.10", later);
        assert!(info.is_locked);
        assert_eq!(info.attempts, 6);
        assert_eq!(info.locked_until, Some(now + Duration::minutes(15)));
    }

    #[test]
    fn lock_expires_on_read() {
        let ledger = LockoutLedger::default();
        let now = Utc::now();
        for _ in 0..5 {
            ledger.record_failure_at("alice", now);
        }
        let just_before = now + Duration::minutes(15) - Duration::nanoseconds(1);
        assert!(ledger.lockout_at("alice", just_before).is_locked);

        let after = now + Duration::minutes(15) + Duration::seconds(1);
        assert_eq!(ledger.lockout_at("alice", after), LockoutInfo::default());
    }

    #[test]
    fn failure_after_expiry_starts_over() {
        let ledger = LockoutLedger::default();
        let now = Utc::now();
        for _ in 0..5 {
            ledger.record_failure_at("alice", now);
        }
        let after = now + Duration::minutes(16);
        let info = ledger.record_failure_at("alice", after);
        assert_eq!(info.attempts, 1);
        assert!(!info.is_locked);
    }

    #[test]
    fn clear_and_reset_remove_entry() {
        let ledger = LockoutLedger::default();
        ledger.record_failure("alice");
        ledger.clear("alice");
        assert_eq!(ledger.lockout("alice").attempts, 0);

        for _ in 0..5 {
            ledger.record_failure("bob");
        }
        assert!(ledger.lockout("bob").is_locked);
        ledger.reset("bob");
        assert!(!ledger.lockout("bob").is_locked);
    }

    #[test]
    fn prune_keeps_active_entries() {
        let ledger = LockoutLedger::default();
        let now = Utc::now();
        ledger.record_failure_at("stale", now - Duration::hours(1));
        ledger.record_failure_at("fresh", now);
        for _ in 0..5 {
            ledger.record_failure_at("locked", now);
        }
        ledger.prune_at(now + Duration::minutes(1));
        assert_eq!(ledger.lockout_at("stale", now).attempts, 0);
        assert_eq!(ledger.lockout_at("fresh", now).attempts, 1);
        assert!(ledger.lockout_at("locked", now + Duration::minutes(1)).is_locked);
    }
}
