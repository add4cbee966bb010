//! Per-user, per-day quota tracking.
//!
//! Check-then-consume is made safe two ways: an in-process async lock per
//! (user, day) key that callers hold from the fresh read until the commit,
//! and a conditional increment in storage that refuses to pass the limit even
//! if another process races us.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use chrono::NaiveDate;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use crate::error::{MentoraError, Result};
use crate::model::{QuotaRecord, Remaining};
use crate::storage::StorageBackend;

type QuotaKey = (String, NaiveDate);

/// Lazily created async mutexes, one per (user, day). Entries are dropped
/// once nobody holds or waits on them.
#[derive(Default)]
pub struct KeyedLocks {
    locks: Mutex<HashMap<QuotaKey, Weak<AsyncMutex<()>>>>,
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn acquire(&self, user_id: &str, day: NaiveDate) -> Result<OwnedMutexGuard<()>> {
        let lock = {
            let mut locks = self
                .locks
                .lock()
                .map_err(|e| MentoraError::Storage(format!("quota lock table poisoned: {e}")))?;
            let key = (user_id.to_string(), day);
            match locks.get(&key).and_then(Weak::upgrade) {
                Some(existing) => existing,
                None => {
                    locks.retain(|_, weak| weak.strong_count() > 0);
                    let fresh = Arc::new(AsyncMutex::new(()));
                    locks.insert(key, Arc::downgrade(&fresh));
                    fresh
                }
            }
        };
        Ok(lock.lock_owned().await)
    }

    /// Number of keys with a live lock. Test and diagnostics aid.
    pub fn live_keys(&self) -> usize {
        self.locks
            .lock()
            .map(|locks| locks.values().filter(|w| w.strong_count() > 0).count())
            .unwrap_or(0)
    }
}

/// Quota operations over a storage backend.
pub struct QuotaTracker<S> {
    store: Arc<S>,
    locks: KeyedLocks,
}

impl<S: StorageBackend> QuotaTracker<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self {
            store,
            locks: KeyedLocks::new(),
        }
    }

    /// Fresh read of the (user, day) record against `limit`.
    pub async fn record(
        &self,
        user_id: &str,
        day: NaiveDate,
        limit: Option<u32>,
    ) -> Result<QuotaRecord> {
        let used = self.store.quota_used(user_id, day).await?;
        Ok(QuotaRecord::new(user_id, day, limit, used))
    }

    pub async fn get_remaining(
        &self,
        user_id: &str,
        day: NaiveDate,
        limit: Option<u32>,
    ) -> Result<Remaining> {
        Ok(self.record(user_id, day, limit).await?.remaining())
    }

    pub async fn can_consume(
        &self,
        user_id: &str,
        day: NaiveDate,
        limit: Option<u32>,
    ) -> Result<bool> {
        Ok(self.record(user_id, day, limit).await?.can_consume())
    }

    /// Consume one unit. Returns the updated record, or `None` when the limit
    /// had already been reached (nothing changed).
    pub async fn consume(
        &self,
        user_id: &str,
        day: NaiveDate,
        limit: Option<u32>,
    ) -> Result<Option<QuotaRecord>> {
        let used = self.store.try_consume(user_id, day, limit).await?;
        Ok(used.map(|used| QuotaRecord::new(user_id, day, limit, used)))
    }

    /// Serialize check-and-consume for one (user, day). Hold the guard from
    /// the quota read through the commit.
    pub async fn lock(&self, user_id: &str, day: NaiveDate) -> Result<OwnedMutexGuard<()>> {
        self.locks.acquire(user_id, day).await
    }

    pub fn locks(&self) -> &KeyedLocks {
        &self.locks
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;
    use std::time::Duration;

    fn day() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 3, 14).unwrap()
    }

    fn tracker() -> QuotaTracker<MemoryStorage> {
        QuotaTracker::new(Arc::new(MemoryStorage::new()))
    }

    #[tokio::test]
    async fn test_remaining_counts_down() {
        let q = tracker();
        assert_eq!(
            q.get_remaining("ada", day(), Some(2)).await.unwrap(),
            Remaining::Limited(2)
        );
        q.consume("ada", day(), Some(2)).await.unwrap();
        assert_eq!(
            q.get_remaining("ada", day(), Some(2)).await.unwrap(),
            Remaining::Limited(1)
        );
    }

    #[tokio::test]
    async fn test_consume_never_exceeds_limit() {
        let q = tracker();
        for _ in 0..5 {
            q.consume("ada", day(), Some(3)).await.unwrap();
        }
        let record = q.record("ada", day(), Some(3)).await.unwrap();
        assert_eq!(record.used, 3);
        assert!(!q.can_consume("ada", day(), Some(3)).await.unwrap());
        assert!(q.consume("ada", day(), Some(3)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_unlimited_always_consumable() {
        let q = tracker();
        for _ in 0..20 {
            assert!(q.consume("ada", day(), None).await.unwrap().is_some());
        }
        assert_eq!(
            q.get_remaining("ada", day(), None).await.unwrap(),
            Remaining::Unlimited
        );
    }

    #[tokio::test]
    async fn test_concurrent_consumers_respect_limit() {
        let q = Arc::new(tracker());
        let mut handles = Vec::new();
        for _ in 0..16 {
            let q = Arc::clone(&q);
            handles.push(tokio::spawn(async move {
                let _guard = q.lock("ada", day()).await.unwrap();
                if q.can_consume("ada", day(), Some(4)).await.unwrap() {
                    tokio::time::sleep(Duration::from_millis(2)).await;
                    q.consume("ada", day(), Some(4)).await.unwrap().is_some()
                } else {
                    false
                }
            }));
        }
        let mut granted = 0;
        for h in handles {
            if h.await.unwrap() {
                granted += 1;
            }
        }
        assert_eq!(granted, 4);
        assert_eq!(q.record("ada", day(), Some(4)).await.unwrap().used, 4);
    }

    #[tokio::test]
    async fn test_lock_is_per_key() {
        let q = tracker();
        let _ada = q.lock("ada", day()).await.unwrap();
        // Different user and different day must not block.
        let bob = tokio::time::timeout(Duration::from_millis(100), q.lock("bob", day())).await;
        assert!(bob.is_ok());
        let tomorrow = day().succ_opt().unwrap();
        let next = tokio::time::timeout(Duration::from_millis(100), q.lock("ada", tomorrow)).await;
        assert!(next.is_ok());
    }

    #[tokio::test]
    async fn test_same_key_blocks_until_released() {
        let q = tracker();
        let guard = q.lock("ada", day()).await.unwrap();
        let blocked = tokio::time::timeout(Duration::from_millis(50), q.lock("ada", day())).await;
        assert!(blocked.is_err());
        drop(guard);
        let acquired = tokio::time::timeout(Duration::from_millis(100), q.lock("ada", day())).await;
        assert!(acquired.is_ok());
    }

    #[tokio::test]
    async fn test_released_locks_are_pruned() {
        let q = tracker();
        {
            let _g = q.lock("ada", day()).await.unwrap();
            assert_eq!(q.locks().live_keys(), 1);
        }
        assert_eq!(q.locks().live_keys(), 0);
    }
}
