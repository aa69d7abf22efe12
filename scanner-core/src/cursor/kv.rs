//! Key-value cursor store backed by Redis.
//!
//! Key = `prefix + taskKey`, value = decimal height, no TTL — the
//! `redis` crate pairing with an async `ConnectionManager` mirrors the
//! cache/indexer stacks in the example pack that combine `redis` with
//! `sqlx` for exactly this load/save-a-checkpoint pattern.

use async_trait::async_trait;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;

use super::CursorStore;

/// Redis-backed [`CursorStore`].
pub struct RedisCursorStore {
    conn: ConnectionManager,
    prefix: String,
}

impl RedisCursorStore {
    /// Connects to `url` and wraps the connection in a
    /// [`ConnectionManager`] for automatic reconnection.
    ///
    /// # Errors
    ///
    /// Returns an error if the URL is invalid or the initial connection
    /// fails.
    pub async fn connect(url: &str, prefix: impl Into<String>) -> anyhow::Result<Self> {
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self {
            conn,
            prefix: prefix.into(),
        })
    }

    fn key(&self, task_key: &str) -> String {
        format!("{}{task_key}", self.prefix)
    }
}

#[async_trait]
impl CursorStore for RedisCursorStore {
    async fn load(&self, task_key: &str) -> anyhow::Result<u64> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn.get(self.key(task_key)).await?;
        Ok(raw.map(|s| s.parse()).transpose()?.unwrap_or(0))
    }

    async fn save(&self, task_key: &str, height: u64) -> anyhow::Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.set(self.key(task_key), height.to_string()).await?;
        Ok(())
    }

    async fn close(&self) -> anyhow::Result<()> {
        Ok(())
    }
}
