//! Node pool, scan loop, and sink fan-out engine for EVM event
//! scanning.
//!
//! A scanner instance owns a [`pool::NodePool`] of RPC endpoints, a
//! [`scan::ScanLoop`] that advances a persisted cursor through
//! finalized block ranges, and a set of [`sink::Output`] backends that
//! receive each range's matched (and optionally decoded) logs.

pub mod config;
pub mod cursor;
pub mod decoder;
pub mod error;
pub mod filter;
pub mod node;
pub mod pool;
pub mod rpc;
pub mod scan;
pub mod sink;

pub use config::Config;
pub use cursor::CursorStore;
pub use decoder::{DecodedLog, Decoder};
pub use error::{AcquireError, DecodeError, ScannerError};
pub use filter::Filter;
pub use node::{Node, NodeConfig};
pub use pool::NodePool;
pub use rpc::{AlloyRpcClient, Header, LogQuery, RpcClient};
pub use scan::{DecodeAndFanOut, RangeHandler, ScanLoop, ScannerConfig};
pub use sink::Output;
