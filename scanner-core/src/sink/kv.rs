//! Redis sink: pushes each decoded log as a JSON document onto a list,
//! or publishes it to a pub/sub channel.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tokio_util::sync::CancellationToken;

use super::Output;
use crate::decoder::DecodedLog;

/// Redis delivery mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RedisMode {
    /// `RPUSH` onto a list.
    List,
    /// `PUBLISH` to a pub/sub channel.
    PubSub,
}

/// Redis sink backed by a shared [`ConnectionManager`].
pub struct RedisSink {
    conn: ConnectionManager,
    key: String,
    mode: RedisMode,
}

impl RedisSink {
    /// Connects to `url` and targets list or channel `key` depending on
    /// `mode`.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection cannot be established.
    pub async fn connect(url: &str, key: impl Into<String>, mode: RedisMode) -> anyhow::Result<Self> {
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self {
            conn,
            key: key.into(),
            mode,
        })
    }
}

#[async_trait]
impl Output for RedisSink {
    fn name(&self) -> &str {
        "kv"
    }

    async fn send(&self, _cancel: &CancellationToken, batch: &[DecodedLog]) -> anyhow::Result<()> {
        let mut conn = self.conn.clone();
        for log in batch {
            let doc = serde_json::json!({
                "blockNumber": log.raw.block_number,
                "txHash": log.raw.transaction_hash,
                "logIndex": log.raw.log_index,
                "address": log.raw.address(),
                "eventName": log.event_name,
                "params": log.params,
            });
            let payload = doc.to_string();
            match self.mode {
                RedisMode::List => {
                    let _: () = conn.rpush(&self.key, payload).await?;
                }
                RedisMode::PubSub => {
                    let _: () = conn.publish(&self.key, payload).await?;
                }
            }
        }
        Ok(())
    }

    async fn close(&self) -> anyhow::Result<()> {
        Ok(())
    }
}
