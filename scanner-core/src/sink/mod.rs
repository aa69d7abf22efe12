//! Heterogeneous sink fan-out: console/file/relational/kv/queue
//! adapters plus the retrying, optionally async-buffered webhook sink.

mod console;
mod file;
pub mod kv;
mod queue;
mod relational;
pub mod webhook;

pub use console::ConsoleSink;
pub use file::FileSink;
pub use kv::RedisSink;
pub use queue::{KafkaSink, RabbitMqSink};
pub use relational::RelationalSink;
pub use webhook::WebhookSink;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::error;

use crate::decoder::DecodedLog;

/// The capability set every output backend implements.
#[async_trait]
pub trait Output: Send + Sync {
    /// A stable identifier used in logs and error messages.
    fn name(&self) -> &str;

    /// Delivers one batch of decoded logs.
    ///
    /// `cancel` must be honored by any retry/backoff loop inside the
    /// implementation, per spec.md §5's cancellation guarantee.
    ///
    /// # Errors
    ///
    /// Returns an error if delivery fails; the fan-out logs but does
    /// not propagate it, so one broken sink cannot halt the scan loop.
    async fn send(&self, cancel: &CancellationToken, batch: &[DecodedLog]) -> anyhow::Result<()>;

    /// Releases backend resources.
    ///
    /// # Errors
    ///
    /// Returns an error only on a genuine backend failure.
    async fn close(&self) -> anyhow::Result<()>;
}

/// Delivers `batch` to every sink concurrently, waits for all of them,
/// and logs (without propagating) any individual sink error so that one
/// broken sink cannot halt the scan loop.
pub async fn fan_out(sinks: &[std::sync::Arc<dyn Output>], cancel: &CancellationToken, batch: &[DecodedLog]) {
    if batch.is_empty() {
        return;
    }
    let tasks = sinks.iter().map(|sink| {
        let sink = std::sync::Arc::clone(sink);
        let cancel = cancel.clone();
        let batch = batch.to_vec();
        tokio::spawn(async move {
            if let Err(e) = sink.send(&cancel, &batch).await {
                error!(sink = sink.name(), error = %e, "sink delivery failed");
            }
        })
    });
    for task in tasks {
        let _ = task.await;
    }
}
