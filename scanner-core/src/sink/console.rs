//! Writes one JSON document per log to stdout.

use async_trait::async_trait;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use super::Output;
use crate::decoder::DecodedLog;

/// Stdout sink — one JSON document per log.
#[derive(Debug, Clone, Default)]
pub struct ConsoleSink;

impl ConsoleSink {
    /// Builds a console sink.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Output for ConsoleSink {
    fn name(&self) -> &str {
        "console"
    }

    #[allow(clippy::print_stdout, reason = "this sink's entire purpose is writing to stdout")]
    async fn send(&self, _cancel: &CancellationToken, batch: &[DecodedLog]) -> anyhow::Result<()> {
        for log in batch {
            let doc = json!({
                "blockNumber": log.raw.block_number,
                "txHash": log.raw.transaction_hash,
                "logIndex": log.raw.log_index,
                "address": log.raw.address(),
                "eventName": log.event_name,
                "params": log.params,
            });
            println!("{doc}");
        }
        Ok(())
    }

    async fn close(&self) -> anyhow::Result<()> {
        Ok(())
    }
}
