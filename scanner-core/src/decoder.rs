//! `topic0 -> event schema` lookup and per-log ABI decoding.
//!
//! Built against `alloy-json-abi`/`alloy-dyn-abi` (both part of the
//! `alloy` umbrella dependency already pulled in for `primitives` and
//! `providers`) rather than generated `sol!` bindings, since the schema
//! here is an arbitrary set registered at runtime from parsed ABI JSON,
//! not fixed at compile time.

use std::collections::HashMap;

use alloy::dyn_abi::{DynSolValue, EventExt};
use alloy::json_abi::Event;
use alloy::primitives::B256;
use alloy::rpc::types::Log;
use serde_json::Value as JsonValue;

use crate::error::DecodeError;

/// A single decoded log.
#[derive(Debug, Clone)]
pub struct DecodedLog {
    /// The raw log as delivered by the RPC node.
    pub raw: Log,
    /// The matched event name, if decoding was attempted and succeeded.
    pub event_name: Option<String>,
    /// Named parameters, if decoding was attempted and succeeded.
    pub params: Option<HashMap<String, JsonValue>>,
}

impl DecodedLog {
    /// Wraps a raw log with no decoding applied.
    #[must_use]
    pub const fn raw_only(raw: Log) -> Self {
        Self {
            raw,
            event_name: None,
            params: None,
        }
    }
}

/// Maps `topic0` to a registered ABI event and decodes logs against it.
///
/// Immutable after construction and safe to share across tasks.
#[derive(Debug, Clone, Default)]
pub struct Decoder {
    schemas: HashMap<B256, Event>,
}

impl Decoder {
    /// Builds an empty decoder (every `decode` call will return
    /// [`DecodeError::UnknownSignature`]).
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers every event in a parsed ABI JSON document, keyed by
    /// the keccak256 of its canonical signature (`topic0`).
    pub fn register_abi(&mut self, abi: &alloy::json_abi::JsonAbi) {
        for event in abi.events() {
            self.schemas.insert(event.selector(), event.clone());
        }
    }

    /// Registers a single event schema directly.
    pub fn register_event(&mut self, event: Event) {
        self.schemas.insert(event.selector(), event);
    }

    /// Decodes one log against its `topic0`-matched schema.
    ///
    /// # Errors
    ///
    /// Returns [`DecodeError::NoTopics`] if the log carries no topics,
    /// [`DecodeError::UnknownSignature`] if `topic0` is not registered,
    /// [`DecodeError::TopicCountMismatch`] if the indexed-parameter
    /// count does not match the topic count, or
    /// [`DecodeError::DecodeFailed`] if ABI decoding itself fails.
    pub fn decode(&self, log: &Log) -> Result<DecodedLog, DecodeError> {
        let topic0 = *log.topics().first().ok_or(DecodeError::NoTopics)?;
        let event = self
            .schemas
            .get(&topic0)
            .ok_or(DecodeError::UnknownSignature(topic0))?;

        let indexed_count = event.inputs.iter().filter(|p| p.indexed).count();
        let expected_topics = indexed_count + 1; // + topic0 itself
        let actual_topics = log.topics().len();
        if expected_topics != actual_topics {
            return Err(DecodeError::TopicCountMismatch {
                expected: expected_topics,
                actual: actual_topics,
            });
        }

        let decoded = event
            .decode_log_parts(
                log.topics().iter().copied(),
                log.data().data.as_ref(),
            )
            .map_err(|e| DecodeError::DecodeFailed(e.to_string()))?;

        let mut params = HashMap::with_capacity(event.inputs.len());
        let mut indexed_iter = decoded.indexed.iter();
        let mut body_iter = decoded.body.iter();
        for input in &event.inputs {
            let value = if input.indexed {
                indexed_iter.next()
            } else {
                body_iter.next()
            };
            if let Some(value) = value {
                params.insert(input.name.clone(), dyn_sol_value_to_json(value));
            }
        }

        Ok(DecodedLog {
            raw: log.clone(),
            event_name: Some(event.name.clone()),
            params: Some(params),
        })
    }
}

/// Renders a decoded ABI value as JSON for sink delivery.
fn dyn_sol_value_to_json(value: &DynSolValue) -> JsonValue {
    match value {
        DynSolValue::Bool(b) => JsonValue::Bool(*b),
        DynSolValue::Int(i, _) => JsonValue::String(i.to_string()),
        DynSolValue::Uint(u, _) => JsonValue::String(u.to_string()),
        DynSolValue::FixedBytes(b, size) => JsonValue::String(format!("0x{}", hex::encode(&b[..*size]))),
        DynSolValue::Address(a) => JsonValue::String(a.to_string()),
        DynSolValue::Bytes(b) => JsonValue::String(format!("0x{}", hex::encode(b))),
        DynSolValue::String(s) => JsonValue::String(s.clone()),
        DynSolValue::Array(items) | DynSolValue::FixedArray(items) => {
            JsonValue::Array(items.iter().map(dyn_sol_value_to_json).collect())
        }
        DynSolValue::Tuple(items) => JsonValue::Array(items.iter().map(dyn_sol_value_to_json).collect()),
        _ => JsonValue::Null,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_no_topics_is_an_error() {
        let decoder = Decoder::new();
        let log = Log::default();
        assert!(matches!(decoder.decode(&log), Err(DecodeError::NoTopics)));
    }
}
