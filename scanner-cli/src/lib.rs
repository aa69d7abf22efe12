//! Wires a loaded [`scanner_core::Config`] into a running scan loop:
//! node construction, sink construction, and the top-level `run`
//! entry point `main` calls.

use std::sync::Arc;

use anyhow::{Context, Result};
use scanner_core::config::{Config, CursorConfig, SinkConfig};
use scanner_core::cursor::{InMemoryCursorStore, PostgresCursorStore, RedisCursorStore};
use scanner_core::sink::kv::RedisMode;
use scanner_core::sink::webhook::{WebhookConfig, WebhookSink};
use scanner_core::sink::{ConsoleSink, FileSink, KafkaSink, RabbitMqSink, RedisSink, RelationalSink};
use scanner_core::{
    AlloyRpcClient, CursorStore, DecodeAndFanOut, NodePool, Output, RangeHandler, RpcClient, ScanLoop,
};
use tokio_util::sync::CancellationToken;

/// Builds the configured cursor-store backend.
///
/// # Errors
///
/// Returns an error if the backend fails to connect.
pub async fn build_cursor_store(config: &CursorConfig) -> Result<Arc<dyn CursorStore>> {
    Ok(match config {
        CursorConfig::Memory => Arc::new(InMemoryCursorStore::new()),
        CursorConfig::Kv { url, prefix } => Arc::new(
            RedisCursorStore::connect(url, prefix.clone())
                .await
                .context("connecting cursor store")?,
        ),
        CursorConfig::Relational { database_url, prefix } => Arc::new(
            PostgresCursorStore::connect(database_url, prefix)
                .await
                .context("connecting cursor store")?,
        ),
    })
}

/// Builds every configured sink backend.
///
/// # Errors
///
/// Returns an error if any sink fails to connect (bad URL, unreachable
/// broker, invalid table name, …).
pub async fn build_sinks(config: &scanner_core::config::OutputsConfig) -> Result<Vec<Arc<dyn Output>>> {
    let mut sinks: Vec<Arc<dyn Output>> = Vec::with_capacity(config.sinks.len());
    for (name, sink) in &config.sinks {
        let built: Arc<dyn Output> = match sink {
            SinkConfig::Console => Arc::new(ConsoleSink::new()),
            SinkConfig::File { path } => Arc::new(FileSink::new(path.clone())),
            SinkConfig::Webhook {
                url,
                secret,
                max_attempts,
                initial_backoff_ms,
                max_backoff_ms,
                timeout_secs,
                is_async,
                buffer_size,
                workers,
            } => {
                let webhook_config = WebhookConfig {
                    url: url.clone(),
                    secret: secret.clone(),
                    max_attempts: *max_attempts,
                    initial_backoff: std::time::Duration::from_millis(*initial_backoff_ms),
                    max_backoff: std::time::Duration::from_millis(*max_backoff_ms),
                    timeout: std::time::Duration::from_secs(*timeout_secs),
                    async_buffer_size: is_async.then_some(*buffer_size),
                    async_workers: *workers,
                };
                let sink = if *is_async {
                    WebhookSink::new_async(webhook_config)
                } else {
                    WebhookSink::new(webhook_config)
                }
                .with_context(|| format!("building webhook sink {name:?}"))?;
                Arc::new(sink)
            }
            SinkConfig::Relational { database_url, table } => Arc::new(
                RelationalSink::connect(database_url, table)
                    .await
                    .with_context(|| format!("connecting relational sink {name:?}"))?,
            ),
            SinkConfig::Kv { url, key, mode } => {
                let mode = match mode.as_str() {
                    "pubsub" => RedisMode::PubSub,
                    _ => RedisMode::List,
                };
                Arc::new(
                    RedisSink::connect(url, key.clone(), mode)
                        .await
                        .with_context(|| format!("connecting kv sink {name:?}"))?,
                )
            }
            SinkConfig::Kafka { brokers, topic } => Arc::new(
                KafkaSink::connect(brokers, topic.clone())
                    .with_context(|| format!("connecting kafka sink {name:?}"))?,
            ),
            SinkConfig::RabbitMq {
                amqp_url,
                exchange,
                routing_key,
            } => Arc::new(
                RabbitMqSink::connect(amqp_url, exchange, routing_key)
                    .await
                    .with_context(|| format!("connecting rabbitmq sink {name:?}"))?,
            ),
        };
        sinks.push(built);
    }
    Ok(sinks)
}

/// Connects every configured node over HTTP.
///
/// # Errors
///
/// Returns an error if any node's URL cannot be parsed, or none are
/// configured.
pub fn build_pool(config: &Config) -> Result<Arc<NodePool>> {
    if config.nodes.is_empty() {
        anyhow::bail!("no nodes configured");
    }
    let nodes = config
        .nodes
        .iter()
        .cloned()
        .map(|node_config| {
            let client: Arc<dyn RpcClient> = Arc::new(AlloyRpcClient::connect(&node_config.url)?);
            Ok((node_config.into(), client))
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(NodePool::new(nodes))
}

/// Builds and runs a scanner from a fully loaded [`Config`] until
/// `cancel` fires.
///
/// # Errors
///
/// Returns an error if node construction, cursor store connection, sink
/// construction, or the scan loop's own start-block derivation fails.
pub async fn run(config: Config, cancel: CancellationToken) -> Result<()> {
    let pool = build_pool(&config)?;
    let cursor_store = build_cursor_store(&config.cursor).await?;
    let filter = config.filter.to_filter();
    let decoder = config
        .filter
        .to_decoder()
        .context("parsing configured ABI JSON")?;
    let sinks = build_sinks(&config.outputs).await?;
    let handler: Arc<dyn RangeHandler> = Arc::new(DecodeAndFanOut::new(decoder, sinks));

    let scan = ScanLoop::new(config.scanner.into(), pool, cursor_store, filter, handler);
    scan.run(cancel).await.context("scan loop failed")
}
