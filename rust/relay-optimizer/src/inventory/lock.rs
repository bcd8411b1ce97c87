//! Named fleet-wide mutual exclusion over the inventory store

use rand::RngCore;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use super::{InventoryStore, StoreError};
use crate::config::LockConfig;

/// Proof of holding the lock
#[derive(Debug)]
#[must_use = "a held lock must be released with DistributedMutex::unlock"]
pub struct HeldLock {
    token: String,
}

impl HeldLock {
    pub fn token(&self) -> &str {
        &self.token
    }
}

/// Lock shared by every optimizer using the same store
pub struct DistributedMutex {
    store: Arc<dyn InventoryStore>,
    name: String,
    ttl: Duration,
    retries: u32,
    retry_delay: Duration,
    renew_interval: Duration,
}

impl DistributedMutex {
    pub fn new(store: Arc<dyn InventoryStore>, config: &LockConfig) -> Self {
        Self {
            store,
            name: config.name.clone(),
            ttl: config.ttl(),
            retries: config.retries,
            retry_delay: config.retry_delay(),
            renew_interval: config.renew_interval(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Acquire the lock, retrying a bounded number of times
    pub async fn lock(&self) -> Result<HeldLock, StoreError> {
        let mut raw = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut raw);
        let token = hex::encode(raw);

        let attempts = self.retries.max(1);
        for attempt in 1..=attempts {
            if self.store.try_lock(&self.name, &token, self.ttl).await? {
                debug!("🔒 acquired {} (attempt {})", self.name, attempt);
                return Ok(HeldLock { token });
            }
            if attempt < attempts {
                tokio::time::sleep(self.retry_delay).await;
            }
        }

        Err(StoreError::LockNotAcquired {
            name: self.name.clone(),
            attempts,
        })
    }

    /// Push the expiry out by another TTL. Fails with `LockLost` if someone
    /// else holds it now.
    pub async fn extend(&self, held: &HeldLock) -> Result<(), StoreError> {
        if self.store.try_lock(&self.name, &held.token, self.ttl).await? {
            Ok(())
        } else {
            Err(StoreError::LockLost(self.name.clone()))
        }
    }

    /// Drive `work` while renewing the lease in the background
    ///
    /// `work` is dropped as soon as the lock is found to be lost. Backend
    /// errors during renewal are logged and retried on the next tick.
    pub async fn hold_while<F: Future>(&self, held: &HeldLock, work: F) -> Result<F::Output, StoreError> {
        let renew = async {
            let mut ticker = tokio::time::interval(self.renew_interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match self.extend(held).await {
                    Ok(()) => debug!("renewed {}", self.name),
                    Err(StoreError::LockLost(name)) => return StoreError::LockLost(name),
                    Err(e) => warn!("could not renew {}: {}", self.name, e),
                }
            }
        };

        tokio::select! {
            output = work => Ok(output),
            lost = renew => {
                warn!("lock {} lost while working", self.name);
                Err(lost)
            }
        }
    }

    /// Release the lock. Fails if it expired and was taken by someone else.
    pub async fn unlock(&self, held: HeldLock) -> Result<(), StoreError> {
        if self.store.unlock(&self.name, &held.token).await? {
            debug!("🔓 released {}", self.name);
            Ok(())
        } else {
            warn!("lock {} was lost before release", self.name);
            Err(StoreError::LockLost(self.name.clone()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inventory::MemoryStore;

    /// Counts lock writes on top of a memory store
    #[derive(Default)]
    struct CountingStore {
        inner: MemoryStore,
        lock_calls: std::sync::atomic::AtomicU32,
    }

    #[async_trait::async_trait]
    impl InventoryStore for CountingStore {
        async fn set(&self, key: &str, value: Vec<u8>) -> Result<(), StoreError> {
            self.inner.set(key, value).await
        }
        async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
            self.inner.get(key).await
        }
        async fn delete(&self, key: &str) -> Result<(), StoreError> {
            self.inner.delete(key).await
        }
        async fn keys(&self, pattern: &str) -> Result<Vec<String>, StoreError> {
            self.inner.keys(pattern).await
        }
        async fn try_lock(&self, name: &str, token: &str, ttl: Duration) -> Result<bool, StoreError> {
            self.lock_calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            self.inner.try_lock(name, token, ttl).await
        }
        async fn unlock(&self, name: &str, token: &str) -> Result<bool, StoreError> {
            self.inner.unlock(name, token).await
        }
    }

    fn config() -> LockConfig {
        LockConfig {
            name: "mutex".to_string(),
            ttl_secs: 60,
            retries: 3,
            retry_delay_ms: 10,
        }
    }

    fn short_lease() -> LockConfig {
        LockConfig { ttl_secs: 3, ..config() }
    }

    #[tokio::test]
    async fn test_lock_and_unlock() {
        let store: Arc<dyn InventoryStore> = Arc::new(MemoryStore::new());
        let mutex = DistributedMutex::new(store.clone(), &config());

        let held = mutex.lock().await.unwrap();
        assert!(store.get("mutex").await.unwrap().is_some());
        mutex.unlock(held).await.unwrap();
        assert!(store.get("mutex").await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_contended_lock_gives_up() {
        let store: Arc<dyn InventoryStore> = Arc::new(MemoryStore::new());
        let first = DistributedMutex::new(store.clone(), &config());
        let second = DistributedMutex::new(store, &config());

        let held = first.lock().await.unwrap();
        let err = second.lock().await.unwrap_err();
        assert!(matches!(err, StoreError::LockNotAcquired { attempts: 3, .. }));

        first.unlock(held).await.unwrap();
        let held = second.lock().await.unwrap();
        second.unlock(held).await.unwrap();
    }

    #[tokio::test]
    async fn test_stolen_lock_is_reported() {
        let store: Arc<dyn InventoryStore> = Arc::new(MemoryStore::new());
        let mutex = DistributedMutex::new(store.clone(), &config());

        let held = mutex.lock().await.unwrap();
        store.delete("mutex").await.unwrap();
        assert!(matches!(mutex.unlock(held).await, Err(StoreError::LockLost(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_lease_is_renewed_during_long_work() {
        let store = Arc::new(CountingStore::default());
        let mutex = DistributedMutex::new(store.clone(), &short_lease());

        let held = mutex.lock().await.unwrap();
        let output = mutex
            .hold_while(&held, async {
                tokio::time::sleep(Duration::from_secs(10)).await;
                "done"
            })
            .await
            .unwrap();

        assert_eq!(output, "done");
        // One acquisition plus a renewal every second
        assert!(store.lock_calls.load(std::sync::atomic::Ordering::SeqCst) >= 9);
        mutex.unlock(held).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_work_stops_when_lock_is_taken_over() {
        let store: Arc<dyn InventoryStore> = Arc::new(MemoryStore::new());
        let mutex = DistributedMutex::new(store.clone(), &short_lease());
        let held = mutex.lock().await.unwrap();

        let thief = store.clone();
        let err = mutex
            .hold_while(&held, async move {
                tokio::time::sleep(Duration::from_millis(1500)).await;
                thief.delete("mutex").await.unwrap();
                thief.try_lock("mutex", "other", Duration::from_secs(60)).await.unwrap();
                tokio::time::sleep(Duration::from_secs(3600)).await;
            })
            .await
            .unwrap_err();

        assert!(matches!(err, StoreError::LockLost(_)));
        assert!(matches!(mutex.extend(&held).await, Err(StoreError::LockLost(_))));
    }
}
