//! Appends JSON-lines to a file path, serialized under a mutex.

use std::path::PathBuf;

use async_trait::async_trait;
use serde_json::json;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use super::Output;
use crate::decoder::DecodedLog;

/// JSON-lines file sink.
pub struct FileSink {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl FileSink {
    /// Targets the given path; the file is created on first write if
    /// it does not exist.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }
}

#[async_trait]
impl Output for FileSink {
    fn name(&self) -> &str {
        "file"
    }

    async fn send(&self, _cancel: &CancellationToken, batch: &[DecodedLog]) -> anyhow::Result<()> {
        let _guard = self.write_lock.lock().await;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        for log in batch {
            let doc = json!({
                "blockNumber": log.raw.block_number,
                "txHash": log.raw.transaction_hash,
                "logIndex": log.raw.log_index,
                "address": log.raw.address(),
                "eventName": log.event_name,
                "params": log.params,
            });
            file.write_all(doc.to_string().as_bytes()).await?;
            file.write_all(b"\n").await?;
        }
        Ok(())
    }

    async fn close(&self) -> anyhow::Result<()> {
        Ok(())
    }
}
