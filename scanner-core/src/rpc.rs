//! The upstream RPC surface a [`crate::node::Node`] proxies.
//!
//! Generalizes the `RpcProvider` trait + `RealRpcProvider` wrapper pattern
//! used to make an alloy provider testable, extended to the full surface
//! the scanner needs (`headerAt`, `filterLogs`, `codeAt`, …) instead of
//! just `get_block_number`/`request`.

use alloy::primitives::{Address, Bloom, Bytes};
use alloy::providers::{Provider, ProviderBuilder};
use alloy::rpc::types::{Filter, Log};
use async_trait::async_trait;

/// A block header's fields the scanner cares about.
#[derive(Debug, Clone, Copy)]
pub struct Header {
    /// The block number.
    pub number: u64,
    /// The block's 2048-bit logs bloom filter.
    pub bloom: Bloom,
    /// The block's unix timestamp.
    pub timestamp: u64,
}

/// The query parameters sent upstream for `eth_getLogs`.
#[derive(Debug, Clone, Default)]
pub struct LogQuery {
    /// Inclusive start block.
    pub from_block: u64,
    /// Inclusive end block.
    pub to_block: u64,
    /// Contract addresses to match (empty = any).
    pub addresses: Vec<Address>,
    /// Per-position topic sets (empty set at a position = any).
    pub topics: Vec<Vec<alloy::primitives::B256>>,
}

impl LogQuery {
    fn into_filter(self) -> Filter {
        let mut filter = Filter::new()
            .from_block(self.from_block)
            .to_block(self.to_block);
        if !self.addresses.is_empty() {
            filter = filter.address(self.addresses);
        }
        for (i, set) in self.topics.into_iter().enumerate() {
            if set.is_empty() {
                continue;
            }
            filter = match i {
                0 => filter.event_signature(set),
                1 => filter.topic1(set),
                2 => filter.topic2(set),
                3 => filter.topic3(set),
                _ => filter,
            };
        }
        filter
    }
}

/// The minimal upstream RPC surface the scanner depends on.
///
/// Implementations plug in via this trait for testability, the same
/// capability-set approach the crate uses for sinks and cursor stores.
#[async_trait]
pub trait RpcClient: Send + Sync {
    /// Returns the chain's EIP-155 chain ID.
    async fn chain_id(&self) -> anyhow::Result<u64>;

    /// Returns the latest block number known to this endpoint.
    async fn block_number(&self) -> anyhow::Result<u64>;

    /// Returns the header at the given height.
    async fn header_at(&self, number: u64) -> anyhow::Result<Header>;

    /// Returns `true` if a block exists at the given height.
    async fn block_at(&self, number: u64) -> anyhow::Result<bool>;

    /// Executes `eth_getLogs` for the given query.
    async fn filter_logs(&self, query: LogQuery) -> anyhow::Result<Vec<Log>>;

    /// Returns the contract code at `address` as of block `number`.
    async fn code_at(&self, address: Address, number: u64) -> anyhow::Result<Bytes>;

    /// Releases any resources held by the underlying transport.
    async fn close(&self) -> anyhow::Result<()>;
}

/// Production [`RpcClient`] backed by an `alloy` HTTP provider.
pub struct AlloyRpcClient {
    provider: alloy::providers::RootProvider,
}

impl AlloyRpcClient {
    /// Connects to `url` over HTTP.
    ///
    /// # Errors
    ///
    /// Returns an error if `url` cannot be parsed.
    pub fn connect(url: &str) -> anyhow::Result<Self> {
        let provider = ProviderBuilder::new().connect_http(
            url.parse()
                .map_err(|e| anyhow::anyhow!("invalid RPC URL {url}: {e}"))?,
        );
        Ok(Self { provider })
    }
}

#[async_trait]
impl RpcClient for AlloyRpcClient {
    async fn chain_id(&self) -> anyhow::Result<u64> {
        Ok(self.provider.get_chain_id().await?)
    }

    async fn block_number(&self) -> anyhow::Result<u64> {
        Ok(self.provider.get_block_number().await?)
    }

    async fn header_at(&self, number: u64) -> anyhow::Result<Header> {
        let block = self
            .provider
            .get_block_by_number(number.into())
            .await?
            .ok_or_else(|| anyhow::anyhow!("block {number} not found"))?;
        Ok(Header {
            number: block.header.number,
            bloom: block.header.logs_bloom,
            timestamp: block.header.timestamp,
        })
    }

    async fn block_at(&self, number: u64) -> anyhow::Result<bool> {
        Ok(self
            .provider
            .get_block_by_number(number.into())
            .await?
            .is_some())
    }

    async fn filter_logs(&self, query: LogQuery) -> anyhow::Result<Vec<Log>> {
        Ok(self.provider.get_logs(&query.into_filter()).await?)
    }

    async fn code_at(&self, address: Address, number: u64) -> anyhow::Result<Bytes> {
        Ok(self
            .provider
            .get_code_at(address)
            .number(number)
            .await?)
    }

    async fn close(&self) -> anyhow::Result<()> {
        Ok(())
    }
}
