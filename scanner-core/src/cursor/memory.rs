//! Ephemeral, in-process cursor store for tests and one-shot runs.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::CursorStore;

/// Map-backed cursor store behind a readers-writer lock.
#[derive(Debug, Default)]
pub struct InMemoryCursorStore {
    heights: RwLock<HashMap<String, u64>>,
}

impl InMemoryCursorStore {
    /// Builds an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CursorStore for InMemoryCursorStore {
    async fn load(&self, task_key: &str) -> anyhow::Result<u64> {
        Ok(self.heights.read().await.get(task_key).copied().unwrap_or(0))
    }

    async fn save(&self, task_key: &str, height: u64) -> anyhow::Result<()> {
        self.heights.write().await.insert(task_key.to_owned(), height);
        Ok(())
    }

    async fn close(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn load_with_no_entry_returns_zero() {
        let store = InMemoryCursorStore::new();
        assert_eq!(store.load("chain:1").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn save_then_load_round_trips() {
        let store = InMemoryCursorStore::new();
        store.save("chain:1", 500).await.unwrap();
        assert_eq!(store.load("chain:1").await.unwrap(), 500);
        store.save("chain:1", 600).await.unwrap();
        assert_eq!(store.load("chain:1").await.unwrap(), 600);
    }
}
