//! Per-token exclusive lock for image jobs.
//!
//! The upstream rejects parallel image jobs on the same account; this is a
//! time-bounded advisory lock, not a mutex guarding Rust data — a crashed
//! holder simply lets the TTL expire rather than stranding the token forever.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};

pub struct LockTable {
    held: Mutex<HashMap<i64, DateTime<Utc>>>,
}

impl LockTable {
    pub fn new() -> Self {
        Self {
            held: Mutex::new(HashMap::new()),
        }
    }

    /// True if the token is locked and the lock's TTL has not yet elapsed.
    pub fn is_held(&self, token_id: i64, now: DateTime<Utc>) -> bool {
        self.held
            .lock()
            .unwrap()
            .get(&token_id)
            .map(|expires_at| *expires_at > now)
            .unwrap_or(false)
    }

    /// Acquire the lock if free (or its previous holder's TTL has expired).
    /// Returns false without mutating state if still held by someone else.
    pub fn try_acquire(&self, token_id: i64, ttl: std::time::Duration, now: DateTime<Utc>) -> bool {
        let mut held = self.held.lock().unwrap();
        if let Some(expires_at) = held.get(&token_id) {
            if *expires_at > now {
                return false;
            }
        }
        let ttl = Duration::from_std(ttl).unwrap_or_else(|_| Duration::seconds(0));
        held.insert(token_id, now + ttl);
        true
    }

    /// Idempotent: releasing a lock that isn't held (or already expired) is a no-op.
    pub fn release(&self, token_id: i64) {
        self.held.lock().unwrap().remove(&token_id);
    }
}

impl Default for LockTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expired_lock_is_considered_free() {
        let locks = LockTable::new();
        let now = Utc::now();
        assert!(locks.try_acquire(1, std::time::Duration::from_secs(1), now));
        assert!(!locks.try_acquire(1, std::time::Duration::from_secs(1), now));

        let later = now + Duration::seconds(2);
        assert!(!locks.is_held(1, later));
        assert!(locks.try_acquire(1, std::time::Duration::from_secs(1), later));
    }

    #[test]
    fn release_is_idempotent() {
        let locks = LockTable::new();
        locks.release(42);
        locks.release(42);
        assert!(!locks.is_held(42, Utc::now()));
    }
}
