//! Inventory Storage (Redis)
//!
//! Networked inventory backend. Every optimizer of a fleet, on any host,
//! points at the same server and contends for the same lock key.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};
use std::time::Duration;
use tracing::info;

use super::{InventoryStore, StoreError};

/// Set the lock when it is free or already ours, refreshing the expiry
const TRY_LOCK: &str = r#"
local v = redis.call('GET', KEYS[1])
if v == false or v == ARGV[1] then
    redis.call('SET', KEYS[1], ARGV[1], 'PX', ARGV[2])
    return 1
end
return 0
"#;

/// Delete the lock only while it still carries our token
const UNLOCK: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
end
return 0
"#;

/// Inventory backed by a Redis server
pub struct RedisStore {
    conn: ConnectionManager,
    try_lock: Script,
    unlock: Script,
}

impl RedisStore {
    /// Connect to the server at `url` (`redis://host:port/db`)
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        info!("📦 Connected to inventory at {}", url);

        Ok(Self {
            conn,
            try_lock: Script::new(TRY_LOCK),
            unlock: Script::new(UNLOCK),
        })
    }
}

#[async_trait]
impl InventoryStore for RedisStore {
    async fn set(&self, key: &str, value: Vec<u8>) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        conn.set::<_, _, ()>(key, value).await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let mut conn = self.conn.clone();
        Ok(conn.get(key).await?)
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        conn.del::<_, ()>(key).await?;
        Ok(())
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>, StoreError> {
        let mut conn = self.conn.clone();
        let mut keys: Vec<String> = conn.keys(pattern).await?;
        keys.sort();
        Ok(keys)
    }

    async fn try_lock(&self, name: &str, token: &str, ttl: Duration) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let taken: i32 = self
            .try_lock
            .key(name)
            .arg(token)
            .arg(ttl.as_millis().max(1) as u64)
            .invoke_async(&mut conn)
            .await?;
        Ok(taken == 1)
    }

    async fn unlock(&self, name: &str, token: &str) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let removed: i32 = self.unlock.key(name).arg(token).invoke_async(&mut conn).await?;
        Ok(removed == 1)
    }
}
