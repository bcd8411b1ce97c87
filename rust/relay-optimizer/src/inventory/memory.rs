//! In-process inventory backend

use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Mutex;

use super::{glob_match, InventoryStore, LockRecord, StoreError};

/// Inventory held in a process-local map
#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl InventoryStore for MemoryStore {
    async fn set(&self, key: &str, value: Vec<u8>) -> Result<(), StoreError> {
        self.entries.lock().await.insert(key.to_string(), value);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.entries.lock().await.get(key).cloned())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.entries.lock().await.remove(key);
        Ok(())
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>, StoreError> {
        let entries = self.entries.lock().await;
        let mut keys: Vec<String> = entries.keys().filter(|k| glob_match(pattern, k)).cloned().collect();
        keys.sort();
        Ok(keys)
    }

    async fn try_lock(&self, name: &str, token: &str, ttl: Duration) -> Result<bool, StoreError> {
        let mut entries = self.entries.lock().await;
        if !LockRecord::may_acquire(entries.get(name).map(Vec::as_slice), token) {
            return Ok(false);
        }
        entries.insert(name.to_string(), bincode::serialize(&LockRecord::new(token, ttl))?);
        Ok(true)
    }

    async fn unlock(&self, name: &str, token: &str) -> Result<bool, StoreError> {
        let mut entries = self.entries.lock().await;
        if !LockRecord::held_by(entries.get(name).map(Vec::as_slice), token) {
            return Ok(false);
        }
        entries.remove(name);
        Ok(true)
    }
}
