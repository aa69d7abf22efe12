//! The error taxonomy shared by every component in this crate.
//!
//! Mirrors the classification in the design notes: transient RPC/sink
//! failures, rate/capacity signals handled silently by [`crate::pool`],
//! degraded-node signals, decode-time data errors (never fatal to a
//! scan range), and fatal startup errors.

use thiserror::Error;

/// Error returned by [`crate::node::Node::try_acquire`] and
/// [`crate::node::Node::wait_acquire`].
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum AcquireError {
    /// The node's circuit breaker is open.
    #[error("circuit breaker open")]
    CircuitBroken,
    /// The node's token bucket has no tokens available.
    #[error("rate limited")]
    RateLimited,
    /// The node's concurrency semaphore has no free permits.
    #[error("node busy")]
    Busy,
    /// The caller's cancellation token fired while waiting.
    #[error("cancelled")]
    Cancelled,
}

/// Error returned by [`crate::decoder::Decoder::decode`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// The log carries no topics at all, so `topic0` cannot be read.
    #[error("log has no topics")]
    NoTopics,
    /// `topic0` does not match any registered event schema.
    #[error("unknown event signature {0:#x}")]
    UnknownSignature(alloy::primitives::B256),
    /// The number of topics does not match the indexed parameter count
    /// the schema declares.
    #[error("expected {expected} topics, got {actual}")]
    TopicCountMismatch {
        /// Topics the schema's indexed parameters require.
        expected: usize,
        /// Topics actually present on the log.
        actual: usize,
    },
    /// ABI decoding of `data` or an indexed topic failed.
    #[error("decode failed: {0}")]
    DecodeFailed(String),
}

/// Top-level error type surfaced by [`crate::pool::NodePool`],
/// [`crate::scan::ScanLoop`], and the sink fan-out.
#[derive(Debug, Error)]
pub enum ScannerError {
    /// No node in the pool could service the request (all circuit-broken
    /// or otherwise unavailable).
    #[error("no available node")]
    NoAvailableNodes,
    /// No node in the pool has observed a height meeting the caller's
    /// minimum height requirement.
    #[error("no node meets required height")]
    NoNodeMeetsHeight,
    /// The caller's cancellation token fired.
    #[error("operation cancelled")]
    Cancelled,
    /// An RPC call failed and retries were exhausted.
    #[error("rpc error: {0}")]
    Rpc(#[source] anyhow::Error),
    /// The cursor store backend failed.
    #[error("cursor store error: {0}")]
    CursorStore(#[source] anyhow::Error),
    /// A sink failed to deliver a batch.
    #[error("sink {name} error: {source}")]
    Sink {
        /// The sink's `name()`.
        name: String,
        /// The underlying delivery error.
        #[source]
        source: anyhow::Error,
    },
    /// The registered range handler returned an error; the scan loop
    /// will not advance the cursor for this range.
    #[error("handler error: {0}")]
    Handler(#[source] anyhow::Error),
    /// An unrecoverable configuration or startup error.
    #[error("fatal: {0}")]
    Fatal(#[source] anyhow::Error),
}

impl From<AcquireError> for ScannerError {
    fn from(value: AcquireError) -> Self {
        match value {
            AcquireError::Cancelled => Self::Cancelled,
            other => Self::Rpc(anyhow::anyhow!(other)),
        }
    }
}
