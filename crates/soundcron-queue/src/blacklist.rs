use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use tracing::debug;

use soundcron_core::{
    blacklist::{blacklist_key, Blacklist},
    CoreError,
};

/// Blacklist entries as Redis keys with a TTL, shared by every process.
#[derive(Clone)]
pub struct RedisBlacklist {
    conn: MultiplexedConnection,
    ttl: Duration,
}

impl RedisBlacklist {
    pub async fn connect(client: &redis::Client, ttl: Duration) -> crate::Result<Self> {
        let conn = client.get_multiplexed_async_connection().await?;
        Ok(Self { conn, ttl })
    }
}

#[async_trait]
impl Blacklist for RedisBlacklist {
    async fn add(&self, soundcron_id: &str) -> soundcron_core::Result<()> {
        let mut conn = self.conn.clone();
        let _: () = redis::cmd("SET")
            .arg(blacklist_key(soundcron_id))
            .arg("1")
            .arg("EX")
            .arg(self.ttl.as_secs().max(1))
            .query_async(&mut conn)
            .await
            .map_err(|e| CoreError::Blacklist(e.to_string()))?;
        debug!(soundcron_id, ttl_secs = self.ttl.as_secs(), "blacklisted");
        Ok(())
    }

    async fn is_blacklisted(&self, soundcron_id: &str) -> soundcron_core::Result<bool> {
        let mut conn = self.conn.clone();
        let n: i64 = redis::cmd("EXISTS")
            .arg(blacklist_key(soundcron_id))
            .query_async(&mut conn)
            .await
            .map_err(|e| CoreError::Blacklist(e.to_string()))?;
        Ok(n > 0)
    }
}

/// Process-local blacklist for dry runs and tests.
pub struct MemoryBlacklist {
    entries: Mutex<HashMap<String, Instant>>,
    ttl: Duration,
}

impl MemoryBlacklist {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            ttl,
        }
    }
}

#[async_trait]
impl Blacklist for MemoryBlacklist {
    async fn add(&self, soundcron_id: &str) -> soundcron_core::Result<()> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let now = Instant::now();
        entries.retain(|_, expires_at| *expires_at > now);
        entries.insert(soundcron_id.to_string(), now + self.ttl);
        Ok(())
    }

    async fn is_blacklisted(&self, soundcron_id: &str) -> soundcron_core::Result<bool> {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(entries
            .get(soundcron_id)
            .is_some_and(|expires_at| *expires_at > Instant::now()))
    }
}
