//! Postgres sink: upserts `(tx_hash, log_index)`, deduplicating
//! redeliveries from at-least-once re-scans.

use async_trait::async_trait;
use sqlx::PgPool;
use tokio_util::sync::CancellationToken;

use super::Output;
use crate::decoder::DecodedLog;

/// Relational sink backed by `sqlx`/Postgres.
pub struct RelationalSink {
    pool: PgPool,
    table: String,
}

impl RelationalSink {
    /// Connects to `database_url` and ensures `table` exists.
    ///
    /// # Errors
    ///
    /// Returns an error if `table` contains characters outside
    /// `[A-Za-z0-9_]`, the connection fails, or table creation fails.
    pub async fn connect(database_url: &str, table: &str) -> anyhow::Result<Self> {
        if !table.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            anyhow::bail!("invalid table name {table:?}: only [A-Za-z0-9_] allowed");
        }
        let pool = PgPool::connect(database_url).await?;
        let create = format!(
            "CREATE TABLE IF NOT EXISTS {table} (
                tx_hash TEXT NOT NULL,
                log_index BIGINT NOT NULL,
                block_number BIGINT NOT NULL,
                event_name TEXT,
                data JSONB NOT NULL,
                PRIMARY KEY (tx_hash, log_index)
            )"
        );
        sqlx::query(&create).execute(&pool).await?;
        Ok(Self {
            pool,
            table: table.to_owned(),
        })
    }
}

#[async_trait]
impl Output for RelationalSink {
    fn name(&self) -> &str {
        "relational"
    }

    async fn send(&self, _cancel: &CancellationToken, batch: &[DecodedLog]) -> anyhow::Result<()> {
        for log in batch {
            let Some(tx_hash) = log.raw.transaction_hash else {
                continue;
            };
            let Some(log_index) = log.raw.log_index else {
                continue;
            };
            let block_number = log.raw.block_number.unwrap_or_default();
            let data = serde_json::json!({
                "address": log.raw.address(),
                "topics": log.raw.topics(),
                "params": log.params,
            });
            let query = format!(
                "INSERT INTO {} (tx_hash, log_index, block_number, event_name, data)
                 VALUES ($1, $2, $3, $4, $5)
                 ON CONFLICT (tx_hash, log_index) DO UPDATE SET data = excluded.data",
                self.table
            );
            sqlx::query(&query)
                .bind(tx_hash.to_string())
                .bind(log_index as i64)
                .bind(block_number as i64)
                .bind(&log.event_name)
                .bind(&data)
                .execute(&self.pool)
                .await?;
        }
        Ok(())
    }

    async fn close(&self) -> anyhow::Result<()> {
        self.pool.close().await;
        Ok(())
    }
}
