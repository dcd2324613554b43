//! Lock typestate for compile-time safety of lock lifecycle.
//!
//! A held lock is a `Lock<Acquired>`. Releasing consumes it, so a released
//! lock cannot be released twice or used as proof of ownership.
//!
//! # State Transition Diagram
//!
//! ```text
//! (unlocked) ─── try_acquire() ──→ Acquired ─── release() ──→ (unlocked)
//!                                     │
//!                              lease expires ──→ (unlocked, token stale)
//! ```
//!
//! There is no `extend()`: leases are not renewed. A critical section that
//! outlives its lease loses exclusivity, and its later release is a no-op
//! because the stored token no longer matches.

use crate::Timestamp;
use serde::{Deserialize, Serialize};
use std::marker::PhantomData;
use std::time::Duration;

// ============================================================================
// LOCK DATA (state-independent)
// ============================================================================

/// Ownership record for a lock attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockData {
    /// Store key of the lock.
    pub key: String,
    /// Unique per attempt: owner instance id plus a fresh random component.
    pub owner_token: String,
    pub lease: Duration,
    pub acquired_at: Timestamp,
}

impl LockData {
    /// When the lease lapses if the lock is never released.
    pub fn expires_at(&self) -> Timestamp {
        chrono::Duration::from_std(self.lease)
            .ok()
            .and_then(|lease| self.acquired_at.checked_add_signed(lease))
            .unwrap_or(Timestamp::MAX_UTC)
    }

    pub fn is_expired(&self, now: Timestamp) -> bool {
        now >= self.expires_at()
    }

    pub fn remaining_duration(&self, now: Timestamp) -> Option<Duration> {
        if self.is_expired(now) {
            None
        } else {
            (self.expires_at() - now).to_std().ok()
        }
    }
}

// ============================================================================
// TYPESTATE MARKERS
// ============================================================================

/// Marker trait for lock states.
pub trait LockState: private::Sealed + Send + Sync {}

/// Lock is currently held.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Acquired;
impl LockState for Acquired {}

/// Lock has been released (documentation only; never constructed at runtime).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Released;
impl LockState for Released {}

mod private {
    pub trait Sealed {}
    impl Sealed for super::Acquired {}
    impl Sealed for super::Released {}
}

// ============================================================================
// LOCK TYPESTATE WRAPPER
// ============================================================================

/// A lock with compile-time state tracking.
#[derive(Debug)]
pub struct Lock<S: LockState> {
    data: LockData,
    _state: PhantomData<S>,
}

impl<S: LockState> Lock<S> {
    pub fn data(&self) -> &LockData {
        &self.data
    }

    pub fn key(&self) -> &str {
        &self.data.key
    }

    pub fn owner_token(&self) -> &str {
        &self.data.owner_token
    }

    pub fn lease(&self) -> Duration {
        self.data.lease
    }
}

impl Lock<Acquired> {
    /// Wrap the data of a successful acquire.
    ///
    /// Only the lock implementation should call this, right after the store
    /// accepted the set-if-absent.
    pub fn new(data: LockData) -> Self {
        Lock {
            data,
            _state: PhantomData,
        }
    }

    /// Give up the typed handle, returning the data needed for the
    /// store-side compare-and-delete.
    pub fn release(self) -> LockData {
        self.data
    }

    pub fn is_expired(&self, now: Timestamp) -> bool {
        self.data.is_expired(now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn make_lock_data(lease: Duration) -> LockData {
        LockData {
            key: "lock:order:1".to_string(),
            owner_token: "instance-a:0192".to_string(),
            lease,
            acquired_at: Utc::now(),
        }
    }

    #[test]
    fn test_lock_expiry() {
        let data = make_lock_data(Duration::from_secs(5));
        let lock = Lock::<Acquired>::new(data.clone());
        assert!(!lock.is_expired(data.acquired_at));
        assert!(lock.is_expired(data.acquired_at + chrono::Duration::seconds(5)));
        assert_eq!(
            data.remaining_duration(data.acquired_at + chrono::Duration::seconds(2)),
            Some(Duration::from_secs(3))
        );
        assert_eq!(
            data.remaining_duration(data.acquired_at + chrono::Duration::seconds(6)),
            None
        );
    }

    #[test]
    fn test_unbounded_lease_saturates() {
        let data = make_lock_data(Duration::MAX);
        assert_eq!(data.expires_at(), Timestamp::MAX_UTC);
        assert!(!data.is_expired(Utc::now()));
    }

    #[test]
    fn test_lock_release_consumes() {
        let data = make_lock_data(Duration::from_secs(10));
        let lock = Lock::<Acquired>::new(data.clone());
        assert_eq!(lock.key(), "lock:order:1");

        let released = lock.release();
        assert_eq!(released, data);
        // lock is now consumed and cannot be used
    }
}
