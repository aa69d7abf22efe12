//! Relational cursor store backed by Postgres via `sqlx`.
//!
//! One row per `task_key`, upsert on conflict — table
//! `<prefix>checkpoints(task_key PK, block_height BIGINT, updated_at
//! TIMESTAMPTZ)`.

use async_trait::async_trait;
use sqlx::PgPool;
use sqlx::Row;

use super::CursorStore;

/// Postgres-backed [`CursorStore`].
pub struct PostgresCursorStore {
    pool: PgPool,
    table: String,
}

impl PostgresCursorStore {
    /// Connects to `database_url` and ensures `<prefix>checkpoints`
    /// exists.
    ///
    /// # Errors
    ///
    /// Returns an error if `prefix` contains characters outside
    /// `[A-Za-z0-9_]`, the connection fails, or the table cannot be
    /// created.
    pub async fn connect(database_url: &str, prefix: &str) -> anyhow::Result<Self> {
        if !prefix.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            anyhow::bail!("invalid cursor table prefix {prefix:?}: only [A-Za-z0-9_] allowed");
        }
        let pool = PgPool::connect(database_url).await?;
        let table = format!("{prefix}checkpoints");
        let create = format!(
            "CREATE TABLE IF NOT EXISTS {table} (
                task_key TEXT PRIMARY KEY,
                block_height BIGINT NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
            )"
        );
        sqlx::query(&create).execute(&pool).await?;
        Ok(Self { pool, table })
    }
}

#[async_trait]
impl CursorStore for PostgresCursorStore {
    async fn load(&self, task_key: &str) -> anyhow::Result<u64> {
        let query = format!("SELECT block_height FROM {} WHERE task_key = $1", self.table);
        let row = sqlx::query(&query)
            .bind(task_key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get::<i64, _>("block_height")).unwrap_or(0) as u64)
    }

    async fn save(&self, task_key: &str, height: u64) -> anyhow::Result<()> {
        let query = format!(
            "INSERT INTO {} (task_key, block_height, updated_at) VALUES ($1, $2, now())
             ON CONFLICT (task_key) DO UPDATE SET block_height = excluded.block_height, updated_at = now()",
            self.table
        );
        sqlx::query(&query)
            .bind(task_key)
            .bind(height as i64)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn close(&self) -> anyhow::Result<()> {
        self.pool.close().await;
        Ok(())
    }
}
