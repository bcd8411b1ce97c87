//! Inventory Storage (RocksDB)
//!
//! Persistent inventory backend. Survives optimizer restarts, and can be
//! shared by every node served from the same host.

use async_trait::async_trait;
use rocksdb::{IteratorMode, Options, DB};
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;
use tracing::info;

use super::{glob_match, InventoryStore, LockRecord, StoreError};

/// Inventory backed by RocksDB
pub struct RocksStore {
    /// RocksDB instance
    db: DB,

    /// Serializes lock read-modify-write
    lock_guard: Mutex<()>,
}

impl RocksStore {
    /// Open or create an inventory at the given path
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.set_max_open_files(100);
        opts.set_keep_log_file_num(3);

        let db = DB::open(&opts, path)?;

        let count = db.iterator(IteratorMode::Start).count();
        info!("📦 Opened inventory at {:?} with {} entries", path, count);

        Ok(Self {
            db,
            lock_guard: Mutex::new(()),
        })
    }

    /// Flush all changes to disk
    pub fn flush(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }

    fn guard(&self) -> Result<std::sync::MutexGuard<'_, ()>, StoreError> {
        self.lock_guard
            .lock()
            .map_err(|_| StoreError::Backend("lock guard poisoned".to_string()))
    }
}

#[async_trait]
impl InventoryStore for RocksStore {
    async fn set(&self, key: &str, value: Vec<u8>) -> Result<(), StoreError> {
        self.db.put(key.as_bytes(), value)?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.db.get(key.as_bytes())?)
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.db.delete(key.as_bytes())?;
        Ok(())
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>, StoreError> {
        let mut keys = Vec::new();
        for item in self.db.iterator(IteratorMode::Start) {
            let (key, _) = item?;
            let key = String::from_utf8_lossy(&key).into_owned();
            if glob_match(pattern, &key) {
                keys.push(key);
            }
        }
        Ok(keys)
    }

    async fn try_lock(&self, name: &str, token: &str, ttl: Duration) -> Result<bool, StoreError> {
        let _guard = self.guard()?;
        let existing = self.db.get(name.as_bytes())?;
        if !LockRecord::may_acquire(existing.as_deref(), token) {
            return Ok(false);
        }
        let record = bincode::serialize(&LockRecord::new(token, ttl))?;
        self.db.put(name.as_bytes(), record)?;
        Ok(true)
    }

    async fn unlock(&self, name: &str, token: &str) -> Result<bool, StoreError> {
        let _guard = self.guard()?;
        let existing = self.db.get(name.as_bytes())?;
        if !LockRecord::held_by(existing.as_deref(), token) {
            return Ok(false);
        }
        self.db.delete(name.as_bytes())?;
        Ok(true)
    }
}
