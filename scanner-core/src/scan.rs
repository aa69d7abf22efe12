//! The scan loop: derives a start block, then repeatedly advances a
//! cursor through finalized ranges, persisting progress as it goes.
//!
//! Grounded in the teacher's adaptive `try_sync`/`fetch_logs` loop
//! shape (cursor-driven, periodic persistence) but generalized: the
//! teacher's TCP-slow-start range sizing is dropped in favor of a fixed
//! `batch_size`, since the reorg-safe windowed tick here has no need to
//! cope with a provider range cap on a one-shot backfill the way a
//! bulk-export tool does.

use std::sync::Arc;
use std::time::Duration;

use alloy::rpc::types::Log;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::cursor::CursorStore;
use crate::decoder::Decoder;
use crate::error::ScannerError;
use crate::filter::Filter;
use crate::pool::NodePool;
use crate::sink::{fan_out, Output};

/// Static configuration for one [`ScanLoop`].
#[derive(Debug, Clone)]
pub struct ScannerConfig {
    /// Identifies this scan's cursor-store entry and appears in logs.
    pub chain_id: u64,
    /// Block to start at when no saved cursor exists, or always when
    /// `force_start` is set.
    pub start_block: u64,
    /// When set, `start_block` wins over any saved cursor.
    pub force_start: bool,
    /// Blocks to step back from `head` when deriving a start block and
    /// no saved cursor and no `start_block` are available.
    pub start_rewind: u64,
    /// Blocks to step back from a saved cursor, to re-cover a window
    /// that may have been missed before a restart.
    pub cursor_rewind: u64,
    /// Maximum blocks per `scanRange` call.
    pub batch_size: u64,
    /// Delay between ticks of the main loop.
    pub interval: Duration,
    /// Blocks behind `head` considered safe from reorg.
    pub reorg_safe: u64,
    /// Whether single-block ranges may be skipped via bloom pre-check.
    pub use_bloom: bool,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            chain_id: 0,
            start_block: 0,
            force_start: false,
            start_rewind: 0,
            cursor_rewind: 0,
            batch_size: 100,
            interval: Duration::from_secs(3),
            reorg_safe: 0,
            use_bloom: false,
        }
    }
}

/// Receives the logs matched by one scanned range.
///
/// Returning an error aborts the range: the cursor is not advanced and
/// the same range is retried on the next tick. `cancel` is the scan
/// loop's own cancellation token; implementations that retry (e.g. the
/// sink fan-out's webhook delivery) must honor it rather than running a
/// retry loop to completion after shutdown is requested.
#[async_trait]
pub trait RangeHandler: Send + Sync {
    /// Handles one range's matched logs, in ascending `(blockNumber,
    /// logIndex)` order.
    async fn handle(&self, cancel: &CancellationToken, logs: &[Log]) -> anyhow::Result<()>;
}

/// Default [`RangeHandler`]: decodes each log against a [`Decoder`]
/// (falling back to an undecoded [`crate::decoder::DecodedLog`] when
/// decoding fails) and fans the batch out to every configured sink.
pub struct DecodeAndFanOut {
    decoder: Decoder,
    sinks: Vec<Arc<dyn Output>>,
}

impl DecodeAndFanOut {
    /// Builds a handler that decodes with `decoder` and delivers to
    /// `sinks`.
    #[must_use]
    pub fn new(decoder: Decoder, sinks: Vec<Arc<dyn Output>>) -> Self {
        Self { decoder, sinks }
    }
}

#[async_trait]
impl RangeHandler for DecodeAndFanOut {
    async fn handle(&self, cancel: &CancellationToken, logs: &[Log]) -> anyhow::Result<()> {
        let batch: Vec<_> = logs
            .iter()
            .map(|log| match self.decoder.decode(log) {
                Ok(decoded) => decoded,
                Err(e) => {
                    warn!(error = %e, "dropping undecodable log");
                    crate::decoder::DecodedLog::raw_only(log.clone())
                }
            })
            .collect();
        fan_out(&self.sinks, cancel, &batch).await;
        Ok(())
    }
}

/// Drives a cursor through finalized block ranges on an interval timer.
pub struct ScanLoop {
    config: ScannerConfig,
    pool: Arc<NodePool>,
    cursor_store: Arc<dyn CursorStore>,
    filter: Filter,
    handler: Arc<dyn RangeHandler>,
}

impl ScanLoop {
    /// Builds a scan loop over `pool`, persisting progress to
    /// `cursor_store` under `config.chain_id`, matching `filter`, and
    /// delivering matched logs to `handler`.
    #[must_use]
    pub fn new(
        config: ScannerConfig,
        pool: Arc<NodePool>,
        cursor_store: Arc<dyn CursorStore>,
        filter: Filter,
        handler: Arc<dyn RangeHandler>,
    ) -> Self {
        Self {
            config,
            pool,
            cursor_store,
            filter,
            handler,
        }
    }

    fn task_key(&self) -> String {
        self.config.chain_id.to_string()
    }

    /// Derives the first block to scan, per the configured priority:
    /// an explicit forced start, else a saved cursor (rewound), else a
    /// configured start block, else `head - start_rewind`.
    ///
    /// # Errors
    ///
    /// Returns an error if the cursor store or an RPC call fails.
    pub async fn derive_start_block(&self, cancel: &CancellationToken) -> Result<u64, ScannerError> {
        if self.config.force_start && self.config.start_block > 0 {
            return Ok(self.config.start_block);
        }

        let saved = self
            .cursor_store
            .load(&self.task_key())
            .await
            .map_err(ScannerError::CursorStore)?;
        if saved > 0 {
            return Ok(saved.saturating_sub(self.config.cursor_rewind));
        }

        if self.config.start_block > 0 {
            return Ok(self.config.start_block);
        }

        let head = self.pool.block_number(cancel).await?;
        Ok(head.saturating_sub(self.config.start_rewind))
    }

    /// Runs the scan loop until `cancel` fires.
    ///
    /// # Errors
    ///
    /// Returns an error only if start-block derivation itself fails;
    /// once running, per-range failures are logged and retried, never
    /// propagated out of this call.
    pub async fn run(&self, cancel: CancellationToken) -> Result<(), ScannerError> {
        let mut cursor = self.derive_start_block(&cancel).await?;
        info!(chain_id = self.config.chain_id, cursor, "scan loop starting");

        let mut ticker = tokio::time::interval(self.config.interval);
        loop {
            tokio::select! {
                () = cancel.cancelled() => return Ok(()),
                _ = ticker.tick() => {}
            }

            let head = match self.pool.block_number(&cancel).await {
                Ok(h) => h,
                Err(ScannerError::Cancelled) => return Ok(()),
                Err(e) => {
                    warn!(chain_id = self.config.chain_id, error = %e, "failed to fetch head, will retry next tick");
                    continue;
                }
            };
            let safe_head = head.saturating_sub(self.config.reorg_safe);

            while cursor <= safe_head {
                if cancel.is_cancelled() {
                    return Ok(());
                }
                let end = (cursor + self.config.batch_size - 1).min(safe_head);

                match self.scan_range(&cancel, cursor, end).await {
                    Ok(()) => {
                        cursor = end + 1;
                        if let Err(e) = self.cursor_store.save(&self.task_key(), cursor).await {
                            warn!(chain_id = self.config.chain_id, error = %e, "cursor save failed, continuing");
                        }
                    }
                    Err(ScannerError::Cancelled) => return Ok(()),
                    Err(e) => {
                        warn!(chain_id = self.config.chain_id, from = cursor, to = end, error = %e, "scan range failed, retrying after 1s");
                        tokio::select! {
                            () = cancel.cancelled() => return Ok(()),
                            () = tokio::time::sleep(Duration::from_secs(1)) => {}
                        }
                        break;
                    }
                }
            }
        }
    }

    /// Scans one inclusive block range, applying the bloom pre-check
    /// for single-block ranges before falling back to `filterLogs`.
    ///
    /// # Errors
    ///
    /// Returns an error from the pool RPC call or from the handler; in
    /// either case the caller does not advance the cursor.
    async fn scan_range(&self, cancel: &CancellationToken, from: u64, to: u64) -> Result<(), ScannerError> {
        if self.config.use_bloom && !self.filter.is_heavy() && from == to {
            let header = self.pool.header_at(cancel, from).await?;
            if !self.filter.matches_bloom(&header.bloom) {
                return Ok(());
            }
        }

        let query = self.filter.to_query(from, to);
        let logs = self.pool.filter_logs(cancel, query).await?;
        if logs.is_empty() {
            return Ok(());
        }
        self.handler.handle(cancel, &logs).await.map_err(ScannerError::Handler)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cursor::InMemoryCursorStore;
    use crate::node::NodeConfig;
    use crate::rpc::{Header as RpcHeader, LogQuery, RpcClient};
    use alloy::primitives::{Address, Bloom, Bytes};
    use std::sync::atomic::{AtomicU64, Ordering};

    struct FakeClient {
        height: AtomicU64,
        header_at_calls: AtomicU64,
        filter_logs_calls: AtomicU64,
    }

    #[async_trait]
    impl RpcClient for FakeClient {
        async fn chain_id(&self) -> anyhow::Result<u64> {
            Ok(1)
        }

        async fn block_number(&self) -> anyhow::Result<u64> {
            Ok(self.height.load(Ordering::Acquire))
        }

        async fn header_at(&self, number: u64) -> anyhow::Result<RpcHeader> {
            self.header_at_calls.fetch_add(1, Ordering::AcqRel);
            Ok(RpcHeader {
                number,
                bloom: Bloom::default(),
                timestamp: 0,
            })
        }

        async fn block_at(&self, _number: u64) -> anyhow::Result<bool> {
            Ok(true)
        }

        async fn filter_logs(&self, _query: LogQuery) -> anyhow::Result<Vec<Log>> {
            self.filter_logs_calls.fetch_add(1, Ordering::AcqRel);
            Ok(Vec::new())
        }

        async fn code_at(&self, _address: Address, _number: u64) -> anyhow::Result<Bytes> {
            Ok(Bytes::new())
        }

        async fn close(&self) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn fake_client(height: u64) -> Arc<FakeClient> {
        Arc::new(FakeClient {
            height: AtomicU64::new(height),
            header_at_calls: AtomicU64::new(0),
            filter_logs_calls: AtomicU64::new(0),
        })
    }

    fn pool_with_height(height: u64) -> Arc<NodePool> {
        let client: Arc<dyn RpcClient> = fake_client(height);
        NodePool::new(vec![(
            NodeConfig {
                url: "fake://node".into(),
                priority: 1,
                rate_limit: 0,
                max_concurrent: 0,
            },
            client,
        )])
    }

    #[tokio::test]
    async fn cursor_rewind_subtracts_from_saved_height() {
        let pool = pool_with_height(1000);
        let cursor_store: Arc<dyn CursorStore> = Arc::new(InMemoryCursorStore::new());
        cursor_store.save("7", 500).await.unwrap();

        let config = ScannerConfig {
            chain_id: 7,
            cursor_rewind: 10,
            ..ScannerConfig::default()
        };
        let handler: Arc<dyn RangeHandler> = Arc::new(DecodeAndFanOut::new(Decoder::new(), vec![]));
        let scan = ScanLoop::new(config, pool, cursor_store, Filter::default(), handler);

        let start = scan.derive_start_block(&CancellationToken::new()).await.unwrap();
        assert_eq!(start, 490);
    }

    #[tokio::test]
    async fn boundary_rewind_never_underflows() {
        let pool = pool_with_height(50);
        let cursor_store: Arc<dyn CursorStore> = Arc::new(InMemoryCursorStore::new());

        let config = ScannerConfig {
            chain_id: 1,
            start_rewind: 100,
            ..ScannerConfig::default()
        };
        let handler: Arc<dyn RangeHandler> = Arc::new(DecodeAndFanOut::new(Decoder::new(), vec![]));
        let scan = ScanLoop::new(config, pool, cursor_store, Filter::default(), handler);

        let start = scan.derive_start_block(&CancellationToken::new()).await.unwrap();
        assert_eq!(start, 0);
    }

    #[tokio::test]
    async fn bloom_skip_avoids_filter_logs_when_address_absent() {
        let client = fake_client(10);
        let pool = NodePool::new(vec![(
            NodeConfig {
                url: "fake://node".into(),
                priority: 1,
                rate_limit: 0,
                max_concurrent: 0,
            },
            Arc::clone(&client) as Arc<dyn RpcClient>,
        )]);
        let cursor_store: Arc<dyn CursorStore> = Arc::new(InMemoryCursorStore::new());
        let filter = Filter::new([Address::with_last_byte(1)]);
        let config = ScannerConfig {
            chain_id: 1,
            use_bloom: true,
            ..ScannerConfig::default()
        };
        let handler: Arc<dyn RangeHandler> = Arc::new(DecodeAndFanOut::new(Decoder::new(), vec![]));
        let scan = ScanLoop::new(config, pool, cursor_store, filter, handler);

        let cancel = CancellationToken::new();
        scan.scan_range(&cancel, 5, 5).await.unwrap();

        assert_eq!(client.header_at_calls.load(Ordering::Acquire), 1);
        assert_eq!(client.filter_logs_calls.load(Ordering::Acquire), 0);
    }

    #[tokio::test]
    async fn successful_ranges_persist_cursor_as_last_processed_plus_one() {
        let pool = pool_with_height(20);
        let cursor_store: Arc<dyn CursorStore> = Arc::new(InMemoryCursorStore::new());
        let config = ScannerConfig {
            chain_id: 99,
            start_rewind: 20,
            batch_size: 5,
            interval: Duration::from_millis(5),
            ..ScannerConfig::default()
        };
        let handler: Arc<dyn RangeHandler> = Arc::new(DecodeAndFanOut::new(Decoder::new(), vec![]));
        let scan = ScanLoop::new(config, pool, Arc::clone(&cursor_store), Filter::default(), handler);

        let cancel = CancellationToken::new();
        let run_cancel = cancel.clone();
        let handle = tokio::spawn(async move { scan.run(run_cancel).await });

        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
        handle.await.unwrap().unwrap();

        // head (20) - reorg_safe (0) drains in batches of 5 starting at 0,
        // so the last processed block is 20 and the saved cursor is 21.
        assert_eq!(cursor_store.load("99").await.unwrap(), 21);
    }
}
