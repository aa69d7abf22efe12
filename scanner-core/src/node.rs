//! A single RPC endpoint: rate limiting, concurrency caps, health
//! scoring, and circuit breaking.
//!
//! The token-bucket + semaphore pairing follows the per-node rate
//! limiter in the provider-pool reference this crate is grounded on;
//! the circuit breaker is deliberately a two-state (open/closed) design
//! rather than the three-state half-open machine some resilience
//! libraries use, since that is the observable behavior this system's
//! invariants pin down.

use std::num::NonZeroU32;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use governor::clock::{Clock, DefaultClock};
use governor::{Quota, RateLimiter};
use parking_lot::Mutex;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::error::AcquireError;
use crate::rpc::{Header, LogQuery, RpcClient};

/// Static configuration for one RPC endpoint.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// The endpoint URL.
    pub url: String,
    /// Selection priority in `[1, 100]`; higher is preferred.
    pub priority: u32,
    /// Requests per second this endpoint is allowed; `0` means unlimited.
    pub rate_limit: u32,
    /// Maximum concurrent in-flight requests; `0` means unlimited.
    pub max_concurrent: u32,
}

type DirectLimiter = RateLimiter<
    governor::state::NotKeyed,
    governor::state::InMemoryState,
    DefaultClock,
>;

/// Mutable error/circuit-breaker state, guarded by its own lock so
/// breaker checks never contend with the latency EWMA update.
struct BreakerState {
    consecutive_errors: u32,
    total_errors: u64,
    circuit_open: bool,
    last_error_at: Option<Instant>,
}

impl BreakerState {
    const fn new() -> Self {
        Self {
            consecutive_errors: 0,
            total_errors: 0,
            circuit_open: false,
            last_error_at: None,
        }
    }

    /// `consecutiveErrors >= 5` before this call opens the breaker.
    const BREAK_THRESHOLD: u32 = 5;
    /// Breaker closes again once this much time has passed since the
    /// last error, even if `consecutiveErrors` never reached zero.
    const COOLDOWN: Duration = Duration::from_secs(30);

    fn record_error(&mut self) {
        self.consecutive_errors += 1;
        self.total_errors += 1;
        self.last_error_at = Some(Instant::now());
        if self.consecutive_errors >= Self::BREAK_THRESHOLD {
            self.circuit_open = true;
        }
    }

    fn record_success(&mut self) {
        self.consecutive_errors = self.consecutive_errors.saturating_sub(1);
        if self.consecutive_errors == 0 {
            self.circuit_open = false;
        }
    }

    /// Re-evaluates the 30s cooldown and returns whether the breaker is
    /// currently open.
    fn is_open(&mut self) -> bool {
        if self.circuit_open
            && let Some(at) = self.last_error_at
            && (at.elapsed() > Self::COOLDOWN || self.consecutive_errors == 0)
        {
            self.circuit_open = false;
        }
        self.circuit_open
    }
}

/// Runtime state and rate/concurrency control for one RPC endpoint.
pub struct Node {
    config: NodeConfig,
    client: Arc<dyn RpcClient>,
    avg_latency_ms: Mutex<f64>,
    observed_height: AtomicU64,
    breaker: Mutex<BreakerState>,
    limiter: Option<DirectLimiter>,
    semaphore: Option<Arc<Semaphore>>,
}

impl Node {
    /// Builds a node around `client`, wiring up its token bucket and
    /// concurrency semaphore per `config`. A `0` limit means unlimited,
    /// matching [`NodeConfig`]'s contract.
    pub fn new(config: NodeConfig, client: Arc<dyn RpcClient>) -> Self {
        let limiter = NonZeroU32::new(config.rate_limit)
            .map(|n| RateLimiter::direct(Quota::per_second(n)));
        let semaphore = NonZeroU32::new(config.max_concurrent)
            .map(|n| Arc::new(Semaphore::new(n.get() as usize)));
        Self {
            config,
            client,
            avg_latency_ms: Mutex::new(0.0),
            observed_height: AtomicU64::new(0),
            breaker: Mutex::new(BreakerState::new()),
            limiter,
            semaphore,
        }
    }

    /// The endpoint's static configuration.
    #[must_use]
    pub const fn config(&self) -> &NodeConfig {
        &self.config
    }

    /// EWMA latency in milliseconds (weight 0.2 on each new sample).
    #[must_use]
    pub fn avg_latency_ms(&self) -> f64 {
        *self.avg_latency_ms.lock()
    }

    /// Monotonic non-decreasing observed block height.
    #[must_use]
    pub fn observed_height(&self) -> u64 {
        self.observed_height.load(Ordering::Acquire)
    }

    /// Current `consecutiveErrors` counter.
    #[must_use]
    pub fn consecutive_errors(&self) -> u32 {
        self.breaker.lock().consecutive_errors
    }

    /// Current `totalErrors` counter.
    #[must_use]
    pub fn total_errors(&self) -> u64 {
        self.breaker.lock().total_errors
    }

    /// Whether the circuit breaker is presently open, re-evaluating the
    /// 30s cooldown as a side effect (per the spec's invariant: the
    /// breaker is considered closed once either condition holds).
    #[must_use]
    pub fn circuit_open(&self) -> bool {
        self.breaker.lock().is_open()
    }

    fn update_height(&self, height: u64) {
        self.observed_height.fetch_max(height, Ordering::AcqRel);
    }

    fn record_metric(&self, started: Instant, ok: bool) {
        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
        let mut avg = self.avg_latency_ms.lock();
        *avg = if *avg == 0.0 {
            elapsed_ms
        } else {
            0.2f64.mul_add(elapsed_ms, 0.8 * *avg)
        };
        drop(avg);

        let mut breaker = self.breaker.lock();
        if ok {
            breaker.record_success();
        } else {
            breaker.record_error();
        }
    }

    /// Non-blocking acquisition: breaker, then rate token, then
    /// concurrency permit, in that order. The rate token is spent
    /// before the semaphore attempt even when the semaphore attempt
    /// fails — callers must pair a successful `try_acquire` with
    /// [`Node::release`].
    ///
    /// # Errors
    ///
    /// See [`AcquireError`] for the conditions under which this call
    /// fails instead of granting a permit.
    pub fn try_acquire(&self, cancel: &CancellationToken) -> Result<(), AcquireError> {
        if self.circuit_open() {
            return Err(AcquireError::CircuitBroken);
        }
        if let Some(limiter) = &self.limiter
            && limiter.check().is_err()
        {
            return Err(AcquireError::RateLimited);
        }
        match &self.semaphore {
            None => Ok(()),
            Some(sem) => match sem.clone().try_acquire_owned() {
                Ok(permit) => {
                    permit.forget();
                    Ok(())
                }
                Err(_) if cancel.is_cancelled() => Err(AcquireError::Cancelled),
                Err(_) => Err(AcquireError::Busy),
            },
        }
    }

    /// Returns one concurrency permit. A no-op if `max_concurrent == 0`.
    pub fn release(&self) {
        if let Some(sem) = &self.semaphore {
            sem.add_permits(1);
        }
    }

    /// Blocking variant of [`Node::try_acquire`]: waits for a rate
    /// token and then a concurrency permit, honoring `cancel`.
    ///
    /// # Errors
    ///
    /// Returns [`AcquireError::Cancelled`] if `cancel` fires first.
    pub async fn wait_acquire(&self, cancel: &CancellationToken) -> Result<(), AcquireError> {
        if let Some(limiter) = &self.limiter {
            loop {
                match limiter.check() {
                    Ok(()) => break,
                    Err(not_until) => {
                        let wait = not_until.wait_time_from(DefaultClock::default().now());
                        tokio::select! {
                            () = cancel.cancelled() => return Err(AcquireError::Cancelled),
                            () = tokio::time::sleep(wait) => {}
                        }
                    }
                }
            }
        }
        match &self.semaphore {
            None => Ok(()),
            Some(sem) => {
                tokio::select! {
                    () = cancel.cancelled() => Err(AcquireError::Cancelled),
                    permit = sem.clone().acquire_owned() => {
                        permit.map_err(|_| AcquireError::Cancelled)?.forget();
                        Ok(())
                    }
                }
            }
        }
    }

    /// Proxies `eth_chainId`.
    ///
    /// # Errors
    ///
    /// Returns the underlying RPC error; this call never retries.
    pub async fn chain_id(&self) -> anyhow::Result<u64> {
        let start = Instant::now();
        let res = self.client.chain_id().await;
        self.record_metric(start, res.is_ok());
        res
    }

    /// Proxies `eth_blockNumber`, also advancing [`Node::observed_height`]
    /// on success.
    ///
    /// # Errors
    ///
    /// Returns the underlying RPC error; this call never retries.
    pub async fn block_number(&self) -> anyhow::Result<u64> {
        let start = Instant::now();
        let res = self.client.block_number().await;
        self.record_metric(start, res.is_ok());
        if let Ok(height) = res {
            self.update_height(height);
        }
        res
    }

    /// Proxies the block header lookup.
    ///
    /// # Errors
    ///
    /// Returns the underlying RPC error; this call never retries.
    pub async fn header_at(&self, number: u64) -> anyhow::Result<Header> {
        let start = Instant::now();
        let res = self.client.header_at(number).await;
        self.record_metric(start, res.is_ok());
        res
    }

    /// Proxies a block-existence lookup.
    ///
    /// # Errors
    ///
    /// Returns the underlying RPC error; this call never retries.
    pub async fn block_at(&self, number: u64) -> anyhow::Result<bool> {
        let start = Instant::now();
        let res = self.client.block_at(number).await;
        self.record_metric(start, res.is_ok());
        res
    }

    /// Proxies `eth_getLogs`.
    ///
    /// # Errors
    ///
    /// Returns the underlying RPC error; this call never retries.
    pub async fn filter_logs(&self, query: LogQuery) -> anyhow::Result<Vec<alloy::rpc::types::Log>> {
        let start = Instant::now();
        let res = self.client.filter_logs(query).await;
        self.record_metric(start, res.is_ok());
        res
    }

    /// Proxies `eth_getCode`.
    ///
    /// # Errors
    ///
    /// Returns the underlying RPC error; this call never retries.
    pub async fn code_at(
        &self,
        address: alloy::primitives::Address,
        number: u64,
    ) -> anyhow::Result<alloy::primitives::Bytes> {
        let start = Instant::now();
        let res = self.client.code_at(address, number).await;
        self.record_metric(start, res.is_ok());
        res
    }
}

/// Score used to rank nodes for selection; higher is better.
///
/// Strictly decreasing in `consecutiveErrors` and in height lag (at
/// equal priority and latency), and collapses to a large negative
/// number once a node is lagging the observed chain head by more than
/// 100 blocks.
#[must_use]
pub fn score(node: &Node, global_max: u64) -> i64 {
    let priority = i64::from(node.config.priority);
    let latency_penalty = (node.avg_latency_ms() / 10.0) as i64;
    let consecutive_errors = i64::from(node.consecutive_errors());

    let mut s = priority * 100 - latency_penalty - consecutive_errors * 500;

    let observed = node.observed_height();
    let lag = global_max.saturating_sub(observed);
    if lag > 100 {
        return -10_000;
    }
    let lag = lag as i64;
    s -= if lag > 20 {
        lag * 200
    } else if lag > 5 {
        lag * 100
    } else if lag > 0 {
        lag * 20
    } else {
        0
    };
    s
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::{Header, LogQuery};
    use alloy::primitives::{Address, Bytes};
    use alloy::rpc::types::Log;

    struct AlwaysErrClient;

    #[async_trait::async_trait]
    impl RpcClient for AlwaysErrClient {
        async fn chain_id(&self) -> anyhow::Result<u64> {
            anyhow::bail!("connection refused")
        }
        async fn block_number(&self) -> anyhow::Result<u64> {
            anyhow::bail!("connection refused")
        }
        async fn header_at(&self, _number: u64) -> anyhow::Result<Header> {
            anyhow::bail!("connection refused")
        }
        async fn block_at(&self, _number: u64) -> anyhow::Result<bool> {
            anyhow::bail!("connection refused")
        }
        async fn filter_logs(&self, _query: LogQuery) -> anyhow::Result<Vec<Log>> {
            anyhow::bail!("connection refused")
        }
        async fn code_at(&self, _address: Address, _number: u64) -> anyhow::Result<Bytes> {
            anyhow::bail!("connection refused")
        }
        async fn close(&self) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn node_with_errors(config: NodeConfig, client: Arc<dyn RpcClient>) -> Node {
        Node::new(config, client)
    }

    /// Errors on its first `fail_count` calls to `filter_logs`, then
    /// succeeds, so a test can drive the breaker open and then closed
    /// again via successes without waiting out the cooldown.
    struct FlakyThenOkClient {
        calls: AtomicU64,
        fail_count: u64,
    }

    #[async_trait::async_trait]
    impl RpcClient for FlakyThenOkClient {
        async fn chain_id(&self) -> anyhow::Result<u64> {
            anyhow::bail!("connection refused")
        }
        async fn block_number(&self) -> anyhow::Result<u64> {
            anyhow::bail!("connection refused")
        }
        async fn header_at(&self, _number: u64) -> anyhow::Result<Header> {
            anyhow::bail!("connection refused")
        }
        async fn block_at(&self, _number: u64) -> anyhow::Result<bool> {
            anyhow::bail!("connection refused")
        }
        async fn filter_logs(&self, _query: LogQuery) -> anyhow::Result<Vec<Log>> {
            if self.calls.fetch_add(1, Ordering::AcqRel) < self.fail_count {
                anyhow::bail!("connection refused")
            } else {
                Ok(Vec::new())
            }
        }
        async fn code_at(&self, _address: Address, _number: u64) -> anyhow::Result<Bytes> {
            anyhow::bail!("connection refused")
        }
        async fn close(&self) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn default_config() -> NodeConfig {
        NodeConfig {
            url: "fake://node".into(),
            priority: 1,
            rate_limit: 0,
            max_concurrent: 0,
        }
    }

    #[tokio::test]
    async fn circuit_breaker_opens_on_fifth_consecutive_error() {
        let node = node_with_errors(default_config(), Arc::new(AlwaysErrClient));
        let cancel = CancellationToken::new();

        for _ in 0..4 {
            let _ = node.filter_logs(LogQuery::default()).await;
            assert!(node.try_acquire(&cancel).is_ok());
        }
        let _ = node.filter_logs(LogQuery::default()).await;

        assert!(matches!(node.try_acquire(&cancel), Err(AcquireError::CircuitBroken)));
    }

    #[tokio::test]
    async fn circuit_breaker_closes_after_cooldown() {
        let node = node_with_errors(default_config(), Arc::new(AlwaysErrClient));
        let cancel = CancellationToken::new();

        for _ in 0..5 {
            let _ = node.filter_logs(LogQuery::default()).await;
        }
        assert!(matches!(node.try_acquire(&cancel), Err(AcquireError::CircuitBroken)));

        node.breaker.lock().last_error_at = Some(Instant::now() - Duration::from_secs(31));
        assert!(node.try_acquire(&cancel).is_ok());
    }

    #[tokio::test]
    async fn circuit_breaker_closes_via_consecutive_errors_reaching_zero() {
        let node = node_with_errors(
            default_config(),
            Arc::new(FlakyThenOkClient {
                calls: AtomicU64::new(0),
                fail_count: 5,
            }),
        );
        let cancel = CancellationToken::new();

        for _ in 0..5 {
            let _ = node.filter_logs(LogQuery::default()).await;
        }
        assert!(matches!(node.try_acquire(&cancel), Err(AcquireError::CircuitBroken)));

        // `last_error_at` is left untouched (still well within the 30s
        // cooldown); only consecutive successes bring the breaker down.
        for _ in 0..4 {
            node.filter_logs(LogQuery::default()).await.unwrap();
            assert!(matches!(node.try_acquire(&cancel), Err(AcquireError::CircuitBroken)));
        }
        node.filter_logs(LogQuery::default()).await.unwrap();

        assert_eq!(node.consecutive_errors(), 0);
        assert!(node.try_acquire(&cancel).is_ok());
    }

    #[test]
    fn score_strictly_decreases_with_consecutive_errors() {
        let low_errors = node_with_errors(default_config(), Arc::new(AlwaysErrClient));
        low_errors.breaker.lock().consecutive_errors = 1;
        let high_errors = node_with_errors(default_config(), Arc::new(AlwaysErrClient));
        high_errors.breaker.lock().consecutive_errors = 2;

        assert!(score(&low_errors, 0) > score(&high_errors, 0));
    }

    #[test]
    fn score_strictly_decreases_with_lag() {
        let near = node_with_errors(default_config(), Arc::new(AlwaysErrClient));
        near.update_height(95);
        let far = node_with_errors(default_config(), Arc::new(AlwaysErrClient));
        far.update_height(50);

        assert!(score(&near, 100) > score(&far, 100));
    }
}
