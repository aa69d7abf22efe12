//! Queue sinks: Kafka via `rdkafka`, RabbitMQ via `lapin`. Each log is
//! published as one JSON message keyed by its transaction hash so that
//! a partitioned consumer sees all logs of one transaction in order.

use async_trait::async_trait;
use lapin::options::{BasicPublishOptions, ExchangeDeclareOptions};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind};
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::ClientConfig;
use tokio_util::sync::CancellationToken;

use super::Output;
use crate::decoder::DecodedLog;

fn message_key(log: &DecodedLog) -> String {
    log.raw
        .transaction_hash
        .map(|h| h.to_string())
        .unwrap_or_default()
}

fn message_body(log: &DecodedLog) -> String {
    serde_json::json!({
        "blockNumber": log.raw.block_number,
        "txHash": log.raw.transaction_hash,
        "logIndex": log.raw.log_index,
        "address": log.raw.address(),
        "eventName": log.event_name,
        "params": log.params,
    })
    .to_string()
}

/// Kafka sink backed by `rdkafka`'s async producer.
pub struct KafkaSink {
    producer: FutureProducer,
    topic: String,
}

impl KafkaSink {
    /// Builds a producer pointed at `brokers`, publishing to `topic`.
    ///
    /// # Errors
    ///
    /// Returns an error if the producer cannot be constructed.
    pub fn connect(brokers: &str, topic: impl Into<String>) -> anyhow::Result<Self> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", brokers)
            .set("message.timeout.ms", "30000")
            .create()?;
        Ok(Self {
            producer,
            topic: topic.into(),
        })
    }
}

#[async_trait]
impl Output for KafkaSink {
    fn name(&self) -> &str {
        "kafka"
    }

    async fn send(&self, _cancel: &CancellationToken, batch: &[DecodedLog]) -> anyhow::Result<()> {
        for log in batch {
            let key = message_key(log);
            let body = message_body(log);
            let record = FutureRecord::to(&self.topic).key(&key).payload(&body);
            self.producer
                .send(record, std::time::Duration::from_secs(10))
                .await
                .map_err(|(e, _)| anyhow::anyhow!(e))?;
        }
        Ok(())
    }

    async fn close(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// RabbitMQ sink backed by `lapin`, publishing persistent messages to a
/// topic exchange.
pub struct RabbitMqSink {
    channel: Channel,
    exchange: String,
    routing_key: String,
}

impl RabbitMqSink {
    /// Connects to `amqp_url` and declares a durable topic exchange
    /// `exchange`; messages are published under `routing_key`.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection, channel, or exchange
    /// declaration fails.
    pub async fn connect(amqp_url: &str, exchange: &str, routing_key: &str) -> anyhow::Result<Self> {
        let conn = Connection::connect(amqp_url, ConnectionProperties::default()).await?;
        let channel = conn.create_channel().await?;
        channel
            .exchange_declare(
                exchange,
                ExchangeKind::Topic,
                ExchangeDeclareOptions {
                    durable: true,
                    ..ExchangeDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await?;
        Ok(Self {
            channel,
            exchange: exchange.to_owned(),
            routing_key: routing_key.to_owned(),
        })
    }
}

#[async_trait]
impl Output for RabbitMqSink {
    fn name(&self) -> &str {
        "rabbitmq"
    }

    async fn send(&self, _cancel: &CancellationToken, batch: &[DecodedLog]) -> anyhow::Result<()> {
        for log in batch {
            let body = message_body(log);
            self.channel
                .basic_publish(
                    &self.exchange,
                    &self.routing_key,
                    BasicPublishOptions::default(),
                    body.as_bytes(),
                    BasicProperties::default().with_delivery_mode(2),
                )
                .await?
                .await?;
        }
        Ok(())
    }

    async fn close(&self) -> anyhow::Result<()> {
        self.channel.close(200, "closing").await?;
        Ok(())
    }
}
