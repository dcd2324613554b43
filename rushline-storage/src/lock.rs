//! Distributed mutual exclusion over the shared key-value store.
//!
//! Acquire is a single `SET NX PX` with a fresh ownership token. Release is a
//! server-side compare-and-delete on that token, so an owner whose lease has
//! already expired cannot delete a lock now held by someone else.
//!
//! Leases are never renewed. Provision the lease longer than the critical
//! section it protects.

use crate::kv::KvStore;
use rushline_core::{
    Acquired, Clock, Lock, LockData, LockError, RushlineResult, SystemClock,
};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Lock client bound to one process instance.
#[derive(Clone)]
pub struct DistributedLock {
    store: Arc<dyn KvStore>,
    clock: Arc<dyn Clock>,
    instance_id: String,
}

impl DistributedLock {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self {
            store,
            clock: Arc::new(SystemClock),
            instance_id: Uuid::now_v7().simple().to_string(),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    fn next_token(&self) -> String {
        format!("{}:{}", self.instance_id, Uuid::now_v7().simple())
    }

    /// Non-blocking acquire. `Ok(None)` means someone else holds the lock.
    pub async fn try_acquire(
        &self,
        key: &str,
        lease: Duration,
    ) -> RushlineResult<Option<Lock<Acquired>>> {
        let token = self.next_token();
        let acquired_at = self.clock.now();
        if !self.store.set_if_absent(key, &token, lease).await? {
            tracing::debug!(key = %key, "Lock busy");
            return Ok(None);
        }
        tracing::debug!(key = %key, lease_ms = lease.as_millis() as u64, "Lock acquired");
        Ok(Some(Lock::new(LockData {
            key: key.to_string(),
            owner_token: token,
            lease,
            acquired_at,
        })))
    }

    /// Like [`try_acquire`](Self::try_acquire), reporting a held lock as
    /// `LockError::Busy`.
    pub async fn acquire(&self, key: &str, lease: Duration) -> RushlineResult<Lock<Acquired>> {
        self.try_acquire(key, lease).await?.ok_or_else(|| {
            LockError::Busy {
                key: key.to_string(),
            }
            .into()
        })
    }

    /// Retry `try_acquire` up to `max_attempts` times, sleeping `interval`
    /// between attempts, then fail with `LockError::Timeout`.
    pub async fn acquire_with_retry(
        &self,
        key: &str,
        lease: Duration,
        max_attempts: u32,
        interval: Duration,
    ) -> RushlineResult<Lock<Acquired>> {
        let attempts = max_attempts.max(1);
        for attempt in 1..=attempts {
            if let Some(lock) = self.try_acquire(key, lease).await? {
                return Ok(lock);
            }
            if attempt < attempts {
                tokio::time::sleep(interval).await;
            }
        }
        tracing::warn!(key = %key, attempts, "Lock acquire retries exhausted");
        Err(LockError::Timeout {
            key: key.to_string(),
            attempts,
        }
        .into())
    }

    /// Release a held lock. Returns `false` when the stored token no longer
    /// matches, which happens once the lease has expired.
    pub async fn release(&self, lock: Lock<Acquired>) -> RushlineResult<bool> {
        let data = lock.release();
        let released = self
            .store
            .compare_and_delete(&data.key, &data.owner_token)
            .await?;
        if released {
            tracing::debug!(key = %data.key, "Lock released");
        } else {
            tracing::warn!(
                key = %data.key,
                expired = data.is_expired(self.clock.now()),
                "Lock no longer owned at release"
            );
        }
        Ok(released)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::InMemoryKvStore;

    fn lock_client(store: &Arc<InMemoryKvStore>) -> DistributedLock {
        DistributedLock::new(store.clone())
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_owner_blocked_until_lease_expires() {
        let store = Arc::new(InMemoryKvStore::new());
        let owner_a = lock_client(&store);
        let owner_b = lock_client(&store);
        let lease = Duration::from_secs(5);

        let held = owner_a.try_acquire("lock:shop:1", lease).await.unwrap();
        assert!(held.is_some());
        assert!(owner_b.try_acquire("lock:shop:1", lease).await.unwrap().is_none());

        tokio::time::advance(lease).await;
        assert!(owner_b.try_acquire("lock:shop:1", lease).await.unwrap().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_owner_cannot_release_new_holder() {
        let store = Arc::new(InMemoryKvStore::new());
        let owner_a = lock_client(&store);
        let owner_b = lock_client(&store);
        let lease = Duration::from_secs(1);

        let stale = owner_a.acquire("lock:k", lease).await.unwrap();
        tokio::time::advance(lease).await;
        let fresh = owner_b.acquire("lock:k", lease).await.unwrap();

        assert!(!owner_a.release(stale).await.unwrap());
        assert!(store.get("lock:k").await.unwrap().is_some());
        assert!(owner_b.release(fresh).await.unwrap());
        assert!(store.get("lock:k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_same_instance_gets_distinct_tokens() {
        let store = Arc::new(InMemoryKvStore::new());
        let client = lock_client(&store);
        let first = client.acquire("lock:a", Duration::from_secs(5)).await.unwrap();
        let second = client.acquire("lock:b", Duration::from_secs(5)).await.unwrap();
        assert_ne!(first.owner_token(), second.owner_token());
        assert!(first.owner_token().starts_with(client.instance_id()));

        // Re-entry is not supported.
        let err = client.acquire("lock:a", Duration::from_secs(5)).await.unwrap_err();
        assert!(matches!(err, rushline_core::RushlineError::Lock(LockError::Busy { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_with_retry_times_out() {
        let store = Arc::new(InMemoryKvStore::new());
        let holder = lock_client(&store);
        let waiter = lock_client(&store);
        let _held = holder.acquire("lock:x", Duration::from_secs(60)).await.unwrap();

        let err = waiter
            .acquire_with_retry("lock:x", Duration::from_secs(1), 3, Duration::from_millis(50))
            .await
            .unwrap_err();
        assert_eq!(
            err,
            rushline_core::RushlineError::from(LockError::Timeout {
                key: "lock:x".to_string(),
                attempts: 3
            })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_with_retry_succeeds_after_release() {
        let store = Arc::new(InMemoryKvStore::new());
        let holder = lock_client(&store);
        let waiter = lock_client(&store);
        let held = holder.acquire("lock:y", Duration::from_secs(60)).await.unwrap();

        let pending = tokio::spawn(async move {
            waiter
                .acquire_with_retry("lock:y", Duration::from_secs(1), 10, Duration::from_millis(50))
                .await
        });
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(holder.release(held).await.unwrap());

        assert!(pending.await.unwrap().is_ok());
    }
}
