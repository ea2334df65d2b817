//! Per-session exclusive leases.
//!
//! One lease per `sessionId` across all in-process turns. The holder owns
//! the session until it releases or the TTL expires; expired leases are
//! reaped by the next acquirer, first come first served. The lock is
//! advisory within one process; cross-process exclusion is out of scope.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;

use va_domain::error::{Error, Result};
use va_domain::trace::TraceEvent;

/// An exclusive lease on a session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionLease {
    pub session_id: String,
    pub run_id: String,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl SessionLease {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// Manages per-session leases.
#[derive(Default)]
pub struct SessionLockMap {
    leases: Mutex<HashMap<String, SessionLease>>,
}

impl SessionLockMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the lease for a session.
    ///
    /// Re-entrant for the same `run_id` (refreshes the expiry). Fails with
    /// [`Error::LockHeld`] if another run holds an unexpired lease; an
    /// expired lease is reaped and granted to the caller.
    pub fn acquire(&self, session_id: &str, run_id: &str, ttl: Duration) -> Result<SessionLease> {
        let now = Utc::now();
        let ttl = chrono::Duration::from_std(ttl)
            .map_err(|e| Error::InvalidInput(format!("lock ttl: {e}")))?;

        let mut leases = self.leases.lock();
        let mut reaped_expired = false;

        if let Some(existing) = leases.get(session_id) {
            if existing.run_id != run_id && !existing.is_expired_at(now) {
                return Err(Error::LockHeld {
                    session_id: session_id.to_owned(),
                    holder: existing.run_id.clone(),
                });
            }
            reaped_expired = existing.run_id != run_id;
        }

        let lease = SessionLease {
            session_id: session_id.to_owned(),
            run_id: run_id.to_owned(),
            acquired_at: now,
            expires_at: now + ttl,
        };
        leases.insert(session_id.to_owned(), lease.clone());

        TraceEvent::LockAcquired {
            session_id: session_id.to_owned(),
            run_id: run_id.to_owned(),
            reaped_expired,
        }
        .emit();

        Ok(lease)
    }

    /// Release the lease. Idempotent: returns whether anything was released.
    /// A release by a non-holder is a no-op.
    pub fn release(&self, session_id: &str, run_id: &str) -> bool {
        let mut leases = self.leases.lock();
        match leases.get(session_id) {
            Some(lease) if lease.run_id == run_id => {
                leases.remove(session_id);
                TraceEvent::LockReleased {
                    session_id: session_id.to_owned(),
                    run_id: run_id.to_owned(),
                }
                .emit();
                true
            }
            _ => false,
        }
    }

    /// Current lease holder, if any (expired leases included until reaped).
    pub fn holder(&self, session_id: &str) -> Option<SessionLease> {
        self.leases.lock().get(session_id).cloned()
    }

    /// Drop every expired lease. Returns how many were reaped.
    pub fn reap_expired(&self) -> usize {
        let now = Utc::now();
        let mut leases = self.leases.lock();
        let before = leases.len();
        leases.retain(|_, lease| !lease.is_expired_at(now));
        before - leases.len()
    }

    pub fn held_count(&self) -> usize {
        self.leases.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TTL: Duration = Duration::from_secs(60);

    #[test]
    fn acquire_and_release() {
        let map = SessionLockMap::new();
        let lease = map.acquire("s1", "r1", TTL).unwrap();
        assert_eq!(lease.session_id, "s1");
        assert!(map.release("s1", "r1"));
        assert_eq!(map.held_count(), 0);
    }

    #[test]
    fn second_run_is_rejected() {
        let map = SessionLockMap::new();
        map.acquire("s1", "r1", TTL).unwrap();

        let err = map.acquire("s1", "r2", TTL).unwrap_err();
        match err {
            Error::LockHeld { session_id, holder } => {
                assert_eq!(session_id, "s1");
                assert_eq!(holder, "r1");
            }
            other => panic!("expected LockHeld, got {other:?}"),
        }

        // After release the second run succeeds.
        map.release("s1", "r1");
        map.acquire("s1", "r2", TTL).unwrap();
    }

    #[test]
    fn reentrant_for_same_run() {
        let map = SessionLockMap::new();
        let first = map.acquire("s1", "r1", TTL).unwrap();
        let second = map.acquire("s1", "r1", TTL).unwrap();
        assert!(second.expires_at >= first.expires_at);
        assert_eq!(map.held_count(), 1);
    }

    #[test]
    fn expired_lease_is_reaped_by_acquirer() {
        let map = SessionLockMap::new();
        map.acquire("s1", "r1", Duration::from_millis(0)).unwrap();

        let lease = map.acquire("s1", "r2", TTL).unwrap();
        assert_eq!(lease.run_id, "r2");
    }

    #[test]
    fn release_is_idempotent() {
        let map = SessionLockMap::new();
        map.acquire("s1", "r1", TTL).unwrap();
        assert!(map.release("s1", "r1"));
        assert!(!map.release("s1", "r1"));
    }

    #[test]
    fn release_by_non_holder_is_noop() {
        let map = SessionLockMap::new();
        map.acquire("s1", "r1", TTL).unwrap();
        assert!(!map.release("s1", "r2"));
        assert_eq!(map.holder("s1").unwrap().run_id, "r1");
    }

    #[test]
    fn different_sessions_are_independent() {
        let map = SessionLockMap::new();
        map.acquire("s1", "r1", TTL).unwrap();
        map.acquire("s2", "r2", TTL).unwrap();
        assert_eq!(map.held_count(), 2);
    }

    #[test]
    fn reap_expired_counts() {
        let map = SessionLockMap::new();
        map.acquire("s1", "r1", Duration::from_millis(0)).unwrap();
        map.acquire("s2", "r2", TTL).unwrap();
        assert_eq!(map.reap_expired(), 1);
        assert!(map.holder("s1").is_none());
        assert!(map.holder("s2").is_some());
    }
}
