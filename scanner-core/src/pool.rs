//! Multi-endpoint node pool: scoring, failover, and the background
//! height-sync task.
//!
//! Grounded in the `ProviderPool` health-tick/pick-node shape (snapshot
//! nodes, probe them concurrently on a timer, cache the observed max
//! height) and in the teacher's multi-RPC fallback in `sync_chain`
//! (try each endpoint in turn, keep the last error).

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use alloy::primitives::{Address, Bytes};
use alloy::rpc::types::Log;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{AcquireError, ScannerError};
use crate::node::{Node, NodeConfig, score};
use crate::rpc::{Header, LogQuery, RpcClient};

/// How often the background task refreshes every node's observed
/// height and the pool-wide maximum.
const SYNC_INTERVAL: Duration = Duration::from_secs(5);

/// Owns `N` [`Node`]s, scores and selects among them, and retries a
/// failed operation across nodes up to a small bound.
pub struct NodePool {
    nodes: Vec<Arc<Node>>,
    global_max: AtomicU64,
    cancel: CancellationToken,
    sync_task: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl NodePool {
    /// Builds a pool from `(config, client)` pairs and spawns the
    /// background height-sync task.
    #[must_use]
    pub fn new(nodes: Vec<(NodeConfig, Arc<dyn RpcClient>)>) -> Arc<Self> {
        let nodes: Vec<Arc<Node>> = nodes
            .into_iter()
            .map(|(cfg, client)| Arc::new(Node::new(cfg, client)))
            .collect();
        let pool = Arc::new(Self {
            nodes,
            global_max: AtomicU64::new(0),
            cancel: CancellationToken::new(),
            sync_task: parking_lot::Mutex::new(None),
        });
        let handle = tokio::spawn(Self::sync_loop(Arc::clone(&pool)));
        *pool.sync_task.lock() = Some(handle);
        pool
    }

    /// Cancels the background sync task. Further calls into the pool
    /// still work; only the periodic height refresh stops.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    async fn sync_loop(pool: Arc<Self>) {
        let mut ticker = tokio::time::interval(SYNC_INTERVAL);
        loop {
            tokio::select! {
                () = pool.cancel.cancelled() => return,
                _ = ticker.tick() => pool.sync_tick().await,
            }
        }
    }

    /// Queries `blockNumber` on every node concurrently (bypassing rate
    /// and concurrency limits, since this is maintenance traffic), then
    /// stores the maximum observed height.
    async fn sync_tick(&self) {
        let futures = self.nodes.iter().map(|node| async move {
            let height = node.block_number().await.ok();
            (node, height)
        });
        let results = futures::future::join_all(futures).await;
        let max = results
            .into_iter()
            .filter_map(|(_, h)| h)
            .max()
            .unwrap_or(0);
        if max > 0 {
            self.global_max.fetch_max(max, Ordering::AcqRel);
        }
    }

    /// The pool-wide maximum observed height, or 0 if never measured.
    #[must_use]
    pub fn global_max(&self) -> u64 {
        self.global_max.load(Ordering::Acquire)
    }

    /// Snapshot nodes sorted by [`score`] descending (highest first),
    /// with ties broken by insertion order.
    fn ranked(&self) -> Vec<Arc<Node>> {
        let global_max = self.global_max();
        let mut ranked: Vec<(usize, Arc<Node>)> = self.nodes.iter().cloned().enumerate().collect();
        ranked.sort_by(|(ia, a), (ib, b)| {
            score(b, global_max)
                .cmp(&score(a, global_max))
                .then(ia.cmp(ib))
        });
        ranked.into_iter().map(|(_, n)| n).collect()
    }

    /// Selects an available node, acquiring its rate/concurrency
    /// permit. Callers must [`Node::release`] the returned node when
    /// done.
    ///
    /// # Errors
    ///
    /// [`ScannerError::NoAvailableNodes`] if the best non-blocking
    /// candidate is circuit-broken; [`ScannerError::NoNodeMeetsHeight`]
    /// if no node meets `min_height`; [`ScannerError::Cancelled`] if
    /// `cancel` fires while waiting on the fallback candidate.
    pub async fn pick_available(
        &self,
        cancel: &CancellationToken,
        min_height: u64,
    ) -> Result<Arc<Node>, ScannerError> {
        let ranked = self.ranked();

        let eligible: Vec<&Arc<Node>> = ranked
            .iter()
            .filter(|n| min_height == 0 || n.observed_height() >= min_height)
            .collect();

        for node in &eligible {
            match node.try_acquire(cancel) {
                Ok(()) => return Ok((*node).clone()),
                Err(AcquireError::Cancelled) => return Err(ScannerError::Cancelled),
                Err(_) => {}
            }
        }

        let Some(best) = eligible.first() else {
            return Err(ScannerError::NoNodeMeetsHeight);
        };
        if best.circuit_open() {
            return Err(ScannerError::NoAvailableNodes);
        }
        match best.wait_acquire(cancel).await {
            Ok(()) => Ok((*best).clone()),
            Err(AcquireError::Cancelled) => Err(ScannerError::Cancelled),
            Err(other) => Err(ScannerError::Rpc(anyhow::anyhow!(other))),
        }
    }

    /// Runs `op` against up to `min(len(nodes), 3)` nodes, retrying on
    /// failure (but never on cancellation) and returning the last error
    /// if every attempt fails.
    ///
    /// # Errors
    ///
    /// Returns [`ScannerError::Cancelled`] immediately if `cancel` is
    /// signalled, or the last underlying error after attempts are
    /// exhausted.
    pub async fn execute<T, F, Fut>(
        &self,
        cancel: &CancellationToken,
        mut op: F,
    ) -> Result<T, ScannerError>
    where
        F: FnMut(Arc<Node>) -> Fut,
        Fut: std::future::Future<Output = anyhow::Result<T>>,
    {
        let attempts = self.nodes.len().min(3).max(1);
        let mut last_err: Option<ScannerError> = None;

        for _ in 0..attempts {
            if cancel.is_cancelled() {
                return Err(ScannerError::Cancelled);
            }
            let node = match self.pick_available(cancel, 0).await {
                Ok(n) => n,
                Err(ScannerError::Cancelled) => return Err(ScannerError::Cancelled),
                Err(e) => {
                    last_err = Some(e);
                    continue;
                }
            };
            let result = op(Arc::clone(&node)).await;
            node.release();
            match result {
                Ok(v) => return Ok(v),
                Err(e) => last_err = Some(ScannerError::Rpc(e)),
            }
        }

        Err(last_err.unwrap_or(ScannerError::NoAvailableNodes))
    }

    /// Returns the pool-wide max height directly if already known,
    /// otherwise falls back to a single `execute`d RPC call.
    ///
    /// # Errors
    ///
    /// See [`NodePool::execute`].
    pub async fn block_number(&self, cancel: &CancellationToken) -> Result<u64, ScannerError> {
        let cached = self.global_max();
        if cached > 0 {
            return Ok(cached);
        }
        self.execute(cancel, |node| async move { node.block_number().await })
            .await
    }

    /// Proxies `eth_chainId` via [`NodePool::execute`].
    ///
    /// # Errors
    ///
    /// See [`NodePool::execute`].
    pub async fn chain_id(&self, cancel: &CancellationToken) -> Result<u64, ScannerError> {
        self.execute(cancel, |node| async move { node.chain_id().await })
            .await
    }

    /// Proxies a header lookup via [`NodePool::execute`].
    ///
    /// # Errors
    ///
    /// See [`NodePool::execute`].
    pub async fn header_at(
        &self,
        cancel: &CancellationToken,
        number: u64,
    ) -> Result<Header, ScannerError> {
        self.execute(cancel, move |node| async move { node.header_at(number).await })
            .await
    }

    /// Proxies a block-existence lookup via [`NodePool::execute`].
    ///
    /// # Errors
    ///
    /// See [`NodePool::execute`].
    pub async fn block_at(
        &self,
        cancel: &CancellationToken,
        number: u64,
    ) -> Result<bool, ScannerError> {
        self.execute(cancel, move |node| async move { node.block_at(number).await })
            .await
    }

    /// Proxies `eth_getLogs` via [`NodePool::execute`].
    ///
    /// # Errors
    ///
    /// See [`NodePool::execute`].
    pub async fn filter_logs(
        &self,
        cancel: &CancellationToken,
        query: LogQuery,
    ) -> Result<Vec<Log>, ScannerError> {
        self.execute(cancel, move |node| {
            let query = query.clone();
            async move { node.filter_logs(query).await }
        })
        .await
    }

    /// Proxies `eth_getCode` via [`NodePool::execute`].
    ///
    /// # Errors
    ///
    /// See [`NodePool::execute`].
    pub async fn code_at(
        &self,
        cancel: &CancellationToken,
        address: Address,
        number: u64,
    ) -> Result<Bytes, ScannerError> {
        self.execute(cancel, move |node| async move { node.code_at(address, number).await })
            .await
    }
}

impl Drop for NodePool {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::primitives::Bytes;

    struct FixedClient {
        height: Result<u64, &'static str>,
    }

    #[async_trait::async_trait]
    impl RpcClient for FixedClient {
        async fn chain_id(&self) -> anyhow::Result<u64> {
            Ok(1)
        }
        async fn block_number(&self) -> anyhow::Result<u64> {
            self.height.map_err(|e| anyhow::anyhow!(e))
        }
        async fn header_at(&self, number: u64) -> anyhow::Result<Header> {
            Ok(Header {
                number,
                bloom: alloy::primitives::Bloom::default(),
                timestamp: 0,
            })
        }
        async fn block_at(&self, _number: u64) -> anyhow::Result<bool> {
            Ok(true)
        }
        async fn filter_logs(&self, _query: LogQuery) -> anyhow::Result<Vec<Log>> {
            Ok(Vec::new())
        }
        async fn code_at(&self, _address: Address, _number: u64) -> anyhow::Result<Bytes> {
            Ok(Bytes::new())
        }
        async fn close(&self) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn node_config(priority: u32) -> NodeConfig {
        NodeConfig {
            url: "fake://node".into(),
            priority,
            rate_limit: 0,
            max_concurrent: 0,
        }
    }

    #[tokio::test]
    async fn failover_routes_around_an_erroring_node() {
        let failing: Arc<dyn RpcClient> = Arc::new(FixedClient {
            height: Err("connection refused"),
        });
        let healthy: Arc<dyn RpcClient> = Arc::new(FixedClient { height: Ok(100) });

        let pool = NodePool::new(vec![
            (node_config(10), failing),
            (node_config(8), healthy),
        ]);
        pool.shutdown();

        let cancel = CancellationToken::new();
        let height = pool.block_number(&cancel).await.unwrap();
        assert_eq!(height, 100);

        assert!(pool.nodes[0].total_errors() >= 1);
    }
}
