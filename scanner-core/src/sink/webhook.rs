//! The webhook sink: HTTP delivery with bounded retries and doubling
//! backoff, an optional HMAC-SHA256 request signature, and an optional
//! asynchronous buffered mode so a slow endpoint cannot stall the scan
//! loop.
//!
//! The retry loop follows the exponential-backoff-with-cap idiom this
//! crate is grounded on elsewhere (see [`crate::node`]'s rate limiter
//! wait path); the classification of which responses are worth
//! retrying is deliberately permissive — any non-2xx status or
//! transport error counts — so that the observable attempt count stays
//! predictable across endpoints. See [`RetryClassifier`] for how a
//! narrower policy would plug in.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use reqwest::Client;
use sha2::Sha256;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::Output;
use crate::decoder::DecodedLog;

type HmacSha256 = Hmac<Sha256>;

/// Classifies an HTTP response status as worth retrying.
///
/// The default implementation used by [`WebhookSink`] treats any
/// non-2xx status as retry-worthy. A narrower policy (retry only on
/// 5xx/429, treat other 4xx as a permanent failure) is a matter of
/// implementing this trait; no bundled configuration does so today, so
/// every [`WebhookSink`] is built with the permissive default.
pub trait RetryClassifier: Send + Sync {
    /// Returns whether `status` should be retried.
    fn should_retry(&self, status: u16) -> bool;
}

struct AnyNon2xxRetries;

impl RetryClassifier for AnyNon2xxRetries {
    fn should_retry(&self, status: u16) -> bool {
        !(200..300).contains(&status)
    }
}

/// Static configuration for a [`WebhookSink`].
#[derive(Debug, Clone)]
pub struct WebhookConfig {
    /// Destination URL.
    pub url: String,
    /// Shared secret used to sign the payload; empty string disables
    /// signing.
    pub secret: String,
    /// Maximum delivery attempts per batch, including the first.
    pub max_attempts: u32,
    /// Backoff before the first retry.
    pub initial_backoff: Duration,
    /// Backoff ceiling; doubles from `initial_backoff` up to this cap.
    pub max_backoff: Duration,
    /// Request timeout per attempt.
    pub timeout: Duration,
    /// When `Some`, batches are buffered onto an internal channel of
    /// this capacity and delivered by a worker pool instead of inline
    /// in [`Output::send`].
    pub async_buffer_size: Option<usize>,
    /// Worker count for the async-buffered mode; ignored otherwise.
    pub async_workers: usize,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            secret: String::new(),
            max_attempts: 1,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(10),
            timeout: Duration::from_secs(10),
            async_buffer_size: None,
            async_workers: 1,
        }
    }
}

enum Delivery {
    Sync,
    Async {
        tx: Mutex<Option<mpsc::Sender<Vec<DecodedLog>>>>,
        workers: Mutex<Vec<JoinHandle<()>>>,
        cancel: CancellationToken,
        closed: Mutex<bool>,
    },
}

/// HTTP webhook sink.
pub struct WebhookSink {
    http: Client,
    config: WebhookConfig,
    classifier: Arc<dyn RetryClassifier>,
    delivery: Delivery,
}

impl WebhookSink {
    /// Builds a synchronous webhook sink: [`Output::send`] delivers
    /// inline, retrying per `config` before returning.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be constructed.
    pub fn new(config: WebhookConfig) -> anyhow::Result<Self> {
        let http = Client::builder().timeout(config.timeout).build()?;
        Ok(Self {
            http,
            config,
            classifier: Arc::new(AnyNon2xxRetries),
            delivery: Delivery::Sync,
        })
    }

    /// Builds a webhook sink whose [`Output::send`] only enqueues the
    /// batch onto a bounded channel, returning immediately; a pool of
    /// `config.async_workers` background tasks performs the actual
    /// retrying delivery.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be constructed or
    /// `async_buffer_size` is unset.
    pub fn new_async(config: WebhookConfig) -> anyhow::Result<Self> {
        let buffer = config
            .async_buffer_size
            .ok_or_else(|| anyhow::anyhow!("async_buffer_size must be set for an async webhook sink"))?;
        let http = Client::builder().timeout(config.timeout).build()?;
        let classifier: Arc<dyn RetryClassifier> = Arc::new(AnyNon2xxRetries);
        let (tx, rx) = mpsc::channel::<Vec<DecodedLog>>(buffer);
        let cancel = CancellationToken::new();
        let rx = Arc::new(Mutex::new(rx));

        let mut workers = Vec::with_capacity(config.async_workers.max(1));
        for _ in 0..config.async_workers.max(1) {
            let http = http.clone();
            let cfg = config.clone();
            let classifier = Arc::clone(&classifier);
            let cancel = cancel.clone();
            let rx = Arc::clone(&rx);
            workers.push(tokio::spawn(async move {
                loop {
                    let batch = rx.lock().await.recv().await;
                    let Some(batch) = batch else { break };
                    if let Err(e) = deliver_with_retry(&http, &cfg, classifier.as_ref(), &cancel, &batch).await {
                        tracing::error!(sink = "webhook", error = %e, "webhook delivery exhausted retries");
                    }
                }
            }));
        }

        Ok(Self {
            http,
            config,
            classifier,
            delivery: Delivery::Async {
                tx: Mutex::new(Some(tx)),
                workers: Mutex::new(workers),
                cancel,
                closed: Mutex::new(false),
            },
        })
    }
}

fn sign(secret: &str, body: &str) -> Option<String> {
    if secret.is_empty() {
        return None;
    }
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).ok()?;
    mac.update(body.as_bytes());
    Some(hex::encode(mac.finalize().into_bytes()))
}

fn payload(batch: &[DecodedLog]) -> String {
    let logs: Vec<serde_json::Value> = batch
        .iter()
        .map(|log| {
            serde_json::json!({
                "blockNumber": log.raw.block_number,
                "txHash": log.raw.transaction_hash,
                "logIndex": log.raw.log_index,
                "address": log.raw.address(),
                "eventName": log.event_name,
                "params": log.params,
            })
        })
        .collect();
    serde_json::json!({
        "timestamp": chrono::Utc::now().timestamp(),
        "logs": logs,
    })
    .to_string()
}

async fn attempt_once(
    http: &Client,
    config: &WebhookConfig,
    body: &str,
) -> Result<u16, reqwest::Error> {
    let mut req = http
        .post(&config.url)
        .header("Content-Type", "application/json")
        .header("User-Agent", concat!("scanner-core/", env!("CARGO_PKG_VERSION")))
        .body(body.to_owned());
    if let Some(sig) = sign(&config.secret, body) {
        req = req.header("X-Scanner-Signature", sig);
    }
    let resp = req.send().await?;
    Ok(resp.status().as_u16())
}

/// Delivers `batch`, retrying per `config` until success, a
/// non-retryable status, attempt exhaustion, or cancellation.
async fn deliver_with_retry(
    http: &Client,
    config: &WebhookConfig,
    classifier: &dyn RetryClassifier,
    cancel: &CancellationToken,
    batch: &[DecodedLog],
) -> anyhow::Result<()> {
    let body = payload(batch);
    let mut backoff = config.initial_backoff;
    let max_attempts = config.max_attempts.max(1);

    for attempt in 1..=max_attempts {
        if cancel.is_cancelled() {
            anyhow::bail!("webhook delivery cancelled");
        }
        let outcome = attempt_once(http, config, &body).await;
        match outcome {
            Ok(status) if (200..300).contains(&status) => return Ok(()),
            Ok(status) if !classifier.should_retry(status) => {
                anyhow::bail!("webhook endpoint returned non-retryable status {status}");
            }
            Ok(status) if attempt == max_attempts => {
                anyhow::bail!("webhook endpoint returned status {status} after {attempt} attempts");
            }
            Err(e) if attempt == max_attempts => {
                return Err(anyhow::anyhow!(e).context(format!("webhook delivery failed after {attempt} attempts")));
            }
            Ok(_) | Err(_) => {}
        }

        tokio::select! {
            () = cancel.cancelled() => anyhow::bail!("webhook delivery cancelled during backoff"),
            () = tokio::time::sleep(backoff) => {}
        }
        backoff = (backoff * 2).min(config.max_backoff);
    }
    unreachable!("loop always returns or bails by the last attempt")
}

#[async_trait]
impl Output for WebhookSink {
    fn name(&self) -> &str {
        "webhook"
    }

    async fn send(&self, cancel: &CancellationToken, batch: &[DecodedLog]) -> anyhow::Result<()> {
        match &self.delivery {
            Delivery::Sync => {
                deliver_with_retry(&self.http, &self.config, self.classifier.as_ref(), cancel, batch).await
            }
            Delivery::Async { tx, cancel: shutdown, closed, .. } => {
                if *closed.lock().await {
                    anyhow::bail!("webhook sink is closed");
                }
                let guard = tx.lock().await;
                let Some(sender) = guard.as_ref() else {
                    anyhow::bail!("webhook sink is closed");
                };
                tokio::select! {
                    () = cancel.cancelled() => Err(anyhow::anyhow!("webhook sink cancelled")),
                    () = shutdown.cancelled() => Err(anyhow::anyhow!("webhook sink cancelled")),
                    res = sender.send(batch.to_vec()) => res.map_err(|_| anyhow::anyhow!("webhook worker pool has shut down")),
                }
            }
        }
    }

    async fn close(&self) -> anyhow::Result<()> {
        if let Delivery::Async { tx, workers, cancel: _, closed } = &self.delivery {
            let mut closed_guard = closed.lock().await;
            if *closed_guard {
                return Ok(());
            }
            *closed_guard = true;
            tx.lock().await.take();
            for handle in workers.lock().await.drain(..) {
                let _ = handle.await;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header_exists, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn base_config(url: String) -> WebhookConfig {
        WebhookConfig {
            url,
            max_attempts: 3,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(5),
            ..WebhookConfig::default()
        }
    }

    #[tokio::test]
    async fn retries_once_on_server_error_then_succeeds() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/hook"))
            .respond_with(ResponseTemplate::new(500))
            .up_to_n_times(1)
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/hook"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let sink = WebhookSink::new(base_config(format!("{}/hook", server.uri()))).unwrap();
        sink.send(&CancellationToken::new(), &[]).await.unwrap();

        server.verify().await;
    }

    #[tokio::test]
    async fn fails_after_exhausting_attempts() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/hook"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let mut config = base_config(format!("{}/hook", server.uri()));
        config.max_attempts = 2;
        let sink = WebhookSink::new(config).unwrap();

        assert!(sink.send(&CancellationToken::new(), &[]).await.is_err());
    }

    #[tokio::test]
    async fn sync_send_aborts_during_backoff_when_cancelled() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/hook"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let mut config = base_config(format!("{}/hook", server.uri()));
        config.max_attempts = 5;
        config.initial_backoff = Duration::from_secs(10);
        let sink = WebhookSink::new(config).unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();

        let started = std::time::Instant::now();
        assert!(sink.send(&cancel, &[]).await.is_err());
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn signs_body_with_hmac_sha256_when_secret_set() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/hook"))
            .and(header_exists("X-Scanner-Signature"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let mut config = base_config(format!("{}/hook", server.uri()));
        config.secret = "my-secret".to_owned();
        let sink = WebhookSink::new(config).unwrap();

        sink.send(&CancellationToken::new(), &[]).await.unwrap();
        server.verify().await;
    }

    #[test]
    fn signature_matches_independently_computed_hmac() {
        let body = "{\"timestamp\":0,\"logs\":[]}";
        let expected = {
            let mut mac = HmacSha256::new_from_slice(b"my-secret").unwrap();
            mac.update(body.as_bytes());
            hex::encode(mac.finalize().into_bytes())
        };
        assert_eq!(sign("my-secret", body), Some(expected));
    }

    #[tokio::test]
    async fn async_send_returns_before_delivery_completes() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/hook"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(200)))
            .mount(&server)
            .await;

        let mut config = base_config(format!("{}/hook", server.uri()));
        config.async_buffer_size = Some(8);
        let sink = WebhookSink::new_async(config).unwrap();

        let started = std::time::Instant::now();
        sink.send(&CancellationToken::new(), &[]).await.unwrap();
        assert!(started.elapsed() < Duration::from_millis(50));

        sink.close().await.unwrap();
    }

    #[tokio::test]
    async fn send_fails_deterministically_after_close() {
        let server = MockServer::start().await;
        let mut config = base_config(format!("{}/hook", server.uri()));
        config.async_buffer_size = Some(8);
        let sink = WebhookSink::new_async(config).unwrap();

        sink.close().await.unwrap();
        assert!(sink.send(&CancellationToken::new(), &[]).await.is_err());
    }
}
