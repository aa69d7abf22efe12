//! Scan-progress persistence: `(task_key -> height)`, three backends.
//!
//! The capability-set shape (`load`/`save`/`close`) mirrors the sink
//! `Output` trait and the pool's `RpcClient` trait — the crate holds a
//! `dyn CursorStore` and has no knowledge of the concrete backend.

mod memory;
mod relational;
mod kv;

pub use kv::RedisCursorStore;
pub use memory::InMemoryCursorStore;
pub use relational::PostgresCursorStore;

use async_trait::async_trait;

/// Persists the next-unscanned-block cursor for a named task.
#[async_trait]
pub trait CursorStore: Send + Sync {
    /// Returns the saved height for `task_key`, or `0` if no entry
    /// exists (not an error).
    ///
    /// # Errors
    ///
    /// Returns an error only on a genuine backend failure.
    async fn load(&self, task_key: &str) -> anyhow::Result<u64>;

    /// Upserts `height` for `task_key`; the latest write wins.
    ///
    /// # Errors
    ///
    /// Returns an error only on a genuine backend failure.
    async fn save(&self, task_key: &str, height: u64) -> anyhow::Result<()>;

    /// Releases backend resources (connections, file handles, …).
    ///
    /// # Errors
    ///
    /// Returns an error only on a genuine backend failure.
    async fn close(&self) -> anyhow::Result<()>;
}
