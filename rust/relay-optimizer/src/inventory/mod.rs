//! Shared Inventory
//!
//! Key/value store of currently known good peers, shared by every optimizer
//! instance of a fleet. Keys are `"{address}-{port}"`, values are bincode
//! encoded [`PeerRecord`]s. The named fleet lock lives in the same keyspace.

mod lock;
mod memory;
mod redis_store;
mod rocks;

pub use lock::{DistributedMutex, HeldLock};
pub use memory::MemoryStore;
pub use redis_store::RedisStore;
pub use rocks::RocksStore;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::types::PeerRecord;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Storage backend error: {0}")]
    Backend(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("Could not acquire lock {name} after {attempts} attempts")]
    LockNotAcquired { name: String, attempts: u32 },

    #[error("Lock {0} is no longer held by this process")]
    LockLost(String),
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::Backend(e.to_string())
    }
}

impl From<redis::RedisError> for StoreError {
    fn from(e: redis::RedisError) -> Self {
        StoreError::Backend(e.to_string())
    }
}

/// Operations the optimizer needs from the shared store
#[async_trait]
pub trait InventoryStore: Send + Sync {
    async fn set(&self, key: &str, value: Vec<u8>) -> Result<(), StoreError>;

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    async fn delete(&self, key: &str) -> Result<(), StoreError>;

    /// Keys matching a glob pattern (`*` and `?`)
    async fn keys(&self, pattern: &str) -> Result<Vec<String>, StoreError>;

    /// Take the named lock for `token` unless another live token holds it
    async fn try_lock(&self, name: &str, token: &str, ttl: Duration) -> Result<bool, StoreError>;

    /// Release the named lock if `token` still holds it
    async fn unlock(&self, name: &str, token: &str) -> Result<bool, StoreError>;
}

/// Value stored under a lock name
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct LockRecord {
    pub token: String,

    /// Unix milliseconds after which the lock is free
    pub expires_at_ms: i64,
}

impl LockRecord {
    pub fn new(token: &str, ttl: Duration) -> Self {
        Self {
            token: token.to_string(),
            expires_at_ms: now_ms() + ttl.as_millis() as i64,
        }
    }

    pub fn is_expired(&self) -> bool {
        now_ms() >= self.expires_at_ms
    }

    /// Whether `token` may take a lock currently stored as `existing`
    pub fn may_acquire(existing: Option<&[u8]>, token: &str) -> bool {
        match existing.map(bincode::deserialize::<LockRecord>) {
            None => true,
            Some(Ok(record)) => record.token == token || record.is_expired(),
            // Unreadable lock entries are overwritten
            Some(Err(_)) => true,
        }
    }

    pub fn held_by(existing: Option<&[u8]>, token: &str) -> bool {
        matches!(
            existing.map(bincode::deserialize::<LockRecord>),
            Some(Ok(record)) if record.token == token
        )
    }
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

pub fn encode_peer(peer: &PeerRecord) -> Result<Vec<u8>, StoreError> {
    Ok(bincode::serialize(peer)?)
}

pub fn decode_peer(bytes: &[u8]) -> Result<PeerRecord, StoreError> {
    Ok(bincode::deserialize(bytes)?)
}

/// Redis-style glob match supporting `*` and `?`
pub fn glob_match(pattern: &str, key: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let k: Vec<char> = key.chars().collect();

    let (mut pi, mut ki) = (0, 0);
    let mut star: Option<usize> = None;
    let mut star_ki = 0;

    while ki < k.len() {
        if pi < p.len() && (p[pi] == '?' || p[pi] == k[ki]) {
            pi += 1;
            ki += 1;
        } else if pi < p.len() && p[pi] == '*' {
            star = Some(pi);
            star_ki = ki;
            pi += 1;
        } else if let Some(s) = star {
            pi = s + 1;
            star_ki += 1;
            ki = star_ki;
        } else {
            return false;
        }
    }

    while pi < p.len() && p[pi] == '*' {
        pi += 1;
    }
    pi == p.len()
}
