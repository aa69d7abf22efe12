//! Deserializable configuration surface: node list, scanner tuning,
//! filter spec, and output selection. Loading these from a file (YAML,
//! per `scanner-cli`) is a collaborator concern; this module only
//! defines the shapes `serde` deserializes into.

use std::collections::HashMap;
use std::time::Duration;

use alloy::primitives::{Address, B256};
use serde::Deserialize;

use crate::node::NodeConfig as RuntimeNodeConfig;
use crate::scan::ScannerConfig as RuntimeScannerConfig;

/// One upstream RPC endpoint, as loaded from configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct NodeConfig {
    /// Endpoint URL.
    pub url: String,
    /// Selection priority; higher is preferred. Defaults to 1.
    #[serde(default = "default_priority")]
    pub priority: u32,
    /// Requests per second allowed; 0 means unlimited.
    #[serde(default)]
    pub rate_limit: u32,
    /// Maximum concurrent in-flight requests; 0 means unlimited.
    #[serde(default)]
    pub max_concurrent: u32,
}

const fn default_priority() -> u32 {
    1
}

impl From<NodeConfig> for RuntimeNodeConfig {
    fn from(value: NodeConfig) -> Self {
        Self {
            url: value.url,
            priority: value.priority,
            rate_limit: value.rate_limit,
            max_concurrent: value.max_concurrent,
        }
    }
}

/// Scan-loop tuning, as loaded from configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ScannerConfig {
    /// Chain identifier; also the cursor store's task key.
    pub chain_id: u64,
    /// Start block when no saved cursor exists, or always when
    /// `force_start` is set.
    #[serde(default)]
    pub start_block: u64,
    /// When set, `start_block` always wins over a saved cursor.
    #[serde(default)]
    pub force_start: bool,
    /// Blocks to step back from `head` when no saved cursor or start
    /// block is configured.
    #[serde(default)]
    pub start_rewind: u64,
    /// Blocks to step back from a saved cursor on restart.
    #[serde(default)]
    pub cursor_rewind: u64,
    /// Maximum blocks per range. Defaults to 100.
    #[serde(default = "default_batch_size")]
    pub batch_size: u64,
    /// Seconds between ticks. Defaults to 3.
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    /// Blocks behind `head` considered safe from reorg.
    #[serde(default)]
    pub reorg_safe: u64,
    /// Whether single-block ranges may be skipped via bloom pre-check.
    #[serde(default)]
    pub use_bloom: bool,
}

const fn default_batch_size() -> u64 {
    100
}

const fn default_interval_secs() -> u64 {
    3
}

impl From<ScannerConfig> for RuntimeScannerConfig {
    fn from(value: ScannerConfig) -> Self {
        Self {
            chain_id: value.chain_id,
            start_block: value.start_block,
            force_start: value.force_start,
            start_rewind: value.start_rewind,
            cursor_rewind: value.cursor_rewind,
            batch_size: value.batch_size.max(1),
            interval: Duration::from_secs(value.interval_secs),
            reorg_safe: value.reorg_safe,
            use_bloom: value.use_bloom,
        }
    }
}

/// Contract + per-position topic predicate, as loaded from
/// configuration, plus an optional ABI JSON document for decoding.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct FilterSpec {
    /// Contract addresses to match; empty matches any address.
    #[serde(default)]
    pub contracts: Vec<Address>,
    /// Per-position topic hash sets; an absent or empty entry matches
    /// any value at that position.
    #[serde(default)]
    pub topics: Vec<Vec<B256>>,
    /// Optional ABI JSON document, parsed and registered with the
    /// [`crate::decoder::Decoder`] if decoding is desired.
    #[serde(default)]
    pub abi_json: Option<serde_json::Value>,
}

impl FilterSpec {
    /// Builds a runtime [`crate::filter::Filter`] from this spec.
    #[must_use]
    pub fn to_filter(&self) -> crate::filter::Filter {
        let mut filter = crate::filter::Filter::new(self.contracts.iter().copied());
        for (i, set) in self.topics.iter().enumerate() {
            filter.set_topic(i, set.iter().copied());
        }
        filter
    }

    /// Parses `abi_json` into a [`crate::decoder::Decoder`], if present.
    ///
    /// # Errors
    ///
    /// Returns an error if `abi_json` is present but not a valid ABI
    /// JSON document.
    pub fn to_decoder(&self) -> anyhow::Result<crate::decoder::Decoder> {
        let mut decoder = crate::decoder::Decoder::new();
        if let Some(abi_json) = &self.abi_json {
            let abi: alloy::json_abi::JsonAbi = serde_json::from_value(abi_json.clone())?;
            decoder.register_abi(&abi);
        }
        Ok(decoder)
    }
}

/// Per-sink parameters, keyed by a user-chosen sink name.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SinkConfig {
    /// Writes one JSON document per log to stdout.
    Console,
    /// Appends JSON-lines to a file path.
    File {
        /// Destination file path.
        path: String,
    },
    /// Delivers batches to an HTTP(S) endpoint.
    Webhook {
        /// Destination URL.
        url: String,
        /// Shared secret for `X-Scanner-Signature`; empty disables it.
        #[serde(default)]
        secret: String,
        /// Maximum delivery attempts. Defaults to 1.
        #[serde(default = "default_max_attempts")]
        max_attempts: u32,
        /// Initial backoff in milliseconds. Defaults to 1000.
        #[serde(default = "default_initial_backoff_ms")]
        initial_backoff_ms: u64,
        /// Backoff cap in milliseconds. Defaults to 10000.
        #[serde(default = "default_max_backoff_ms")]
        max_backoff_ms: u64,
        /// Request timeout in seconds. Defaults to 10.
        #[serde(default = "default_webhook_timeout_secs")]
        timeout_secs: u64,
        /// When set, deliveries are buffered and sent by a background
        /// worker pool instead of inline.
        #[serde(default)]
        is_async: bool,
        /// Channel capacity for the async mode. Defaults to 1000.
        #[serde(default = "default_buffer_size")]
        buffer_size: usize,
        /// Worker count for the async mode. Defaults to 1.
        #[serde(default = "default_workers")]
        workers: usize,
    },
    /// Upserts decoded logs into a Postgres table.
    Relational {
        /// Postgres connection string.
        database_url: String,
        /// Table name; must match `[A-Za-z0-9_]+`.
        table: String,
    },
    /// Pushes or publishes decoded logs via Redis.
    Kv {
        /// Redis connection URL.
        url: String,
        /// List or channel name.
        key: String,
        /// `"list"` (default) or `"pubsub"`.
        #[serde(default = "default_kv_mode")]
        mode: String,
    },
    /// Publishes decoded logs to a Kafka topic.
    Kafka {
        /// Comma-separated bootstrap server list.
        brokers: String,
        /// Destination topic.
        topic: String,
    },
    /// Publishes decoded logs to a RabbitMQ topic exchange.
    RabbitMq {
        /// AMQP connection URL.
        amqp_url: String,
        /// Topic exchange name.
        exchange: String,
        /// Routing key for published messages.
        routing_key: String,
    },
}

const fn default_max_attempts() -> u32 {
    1
}

const fn default_initial_backoff_ms() -> u64 {
    1000
}

const fn default_max_backoff_ms() -> u64 {
    10_000
}

const fn default_webhook_timeout_secs() -> u64 {
    10
}

const fn default_buffer_size() -> usize {
    1000
}

const fn default_workers() -> usize {
    1
}

fn default_kv_mode() -> String {
    "list".to_owned()
}

/// Enumerates the sinks to enable and their per-sink parameters.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct OutputsConfig {
    /// Sink name to its configuration.
    #[serde(flatten)]
    pub sinks: HashMap<String, SinkConfig>,
}

/// Selects and parameterizes a cursor-store backend.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CursorConfig {
    /// Ephemeral, process-lifetime only. The default when unset.
    Memory,
    /// Redis-backed, key `<prefix><chainId>`.
    Kv {
        /// Redis connection URL.
        url: String,
        /// Key prefix.
        #[serde(default)]
        prefix: String,
    },
    /// Postgres-backed, table `<prefix>checkpoints`.
    Relational {
        /// Postgres connection string.
        database_url: String,
        /// Table name prefix.
        #[serde(default)]
        prefix: String,
    },
}

impl Default for CursorConfig {
    fn default() -> Self {
        Self::Memory
    }
}

/// The complete configuration surface for one scanner instance.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Upstream RPC endpoints.
    pub nodes: Vec<NodeConfig>,
    /// Scan loop tuning.
    pub scanner: ScannerConfig,
    /// Contract/topic predicate and optional ABI.
    #[serde(default)]
    pub filter: FilterSpec,
    /// Sink selection and parameters.
    #[serde(default)]
    pub outputs: OutputsConfig,
    /// Cursor-store backend selection.
    #[serde(default)]
    pub cursor: CursorConfig,
}
