use std::time::Duration;

use alloy::json_abi::JsonAbi;
use alloy::primitives::{Address, U256};
use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Message fragments that mark a failure as a network hiccup rather than a bad request.
const TRANSIENT_PATTERNS: &[&str] = &[
    "network error",
    "connection failed",
    "connection refused",
    "connection reset",
    "connection closed",
    "timeout",
    "timed out",
    "disconnected",
    "econnreset",
    "enotfound",
    "broken pipe",
    "backend gone",
];

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ChainError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("connection closed: {0}")]
    Disconnected(String),

    #[error("execution reverted: {0}")]
    Reverted(String),

    #[error("invalid address: {0}")]
    InvalidAddress(String),

    #[error("ABI error: {0}")]
    Abi(String),

    #[error("unsupported by this source: {0}")]
    Unsupported(String),

    #[error("RPC error: {0}")]
    Rpc(String),

    #[error("decode error: {0}")]
    Decode(String),
}

impl ChainError {
    /// Failures worth retrying with the same request.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ChainError::Transport(_) | ChainError::Timeout(_) | ChainError::Disconnected(_)
        )
    }

    pub fn is_revert(&self) -> bool {
        matches!(self, ChainError::Reverted(_))
    }

    /// Classify a free-form node error message.
    pub fn from_message(message: impl Into<String>) -> Self {
        let message = message.into();
        let lower = message.to_ascii_lowercase();
        if lower.contains("revert") {
            ChainError::Reverted(message)
        } else if TRANSIENT_PATTERNS.iter().any(|p| lower.contains(p)) {
            ChainError::Transport(message)
        } else {
            ChainError::Rpc(message)
        }
    }
}

/// Untyped log payload as the chain source decoded it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RawEvent(pub Value);

impl RawEvent {
    pub fn new(value: Value) -> Self {
        Self(value)
    }

    pub fn payload(&self) -> &Value {
        &self.0
    }

    pub fn into_inner(self) -> Value {
        self.0
    }
}

impl From<Value> for RawEvent {
    fn from(value: Value) -> Self {
        Self(value)
    }
}

/// One factory record, positional or named depending on the source.
#[derive(Debug, Clone, PartialEq)]
pub enum RawRow {
    Tuple(Vec<Value>),
    Record(Map<String, Value>),
}

impl RawRow {
    pub fn from_value(value: Value) -> Option<Self> {
        match value {
            Value::Array(items) => Some(RawRow::Tuple(items)),
            Value::Object(map) => Some(RawRow::Record(map)),
            _ => None,
        }
    }
}

/// A page of factory records plus the total the slice call reported, if any.
#[derive(Debug, Clone, Default)]
pub struct SliceResult {
    pub rows: Vec<RawRow>,
    pub total: Option<u64>,
}

/// The presale views a pair listing reports on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresaleState {
    /// Raw `presaleStatus`: 0 pending, 1 open, 2..=4 finished.
    pub open_state: u8,
    pub sold: U256,
    pub capacity: U256,
}

impl PresaleState {
    /// `sold / capacity` as a whole percentage, rounded half up and capped at 100.
    pub fn progress_percent(&self) -> u8 {
        if self.capacity.is_zero() {
            return 0;
        }
        if self.sold >= self.capacity {
            return 100;
        }
        let hundred = U256::from(100u8);
        let doubled = self.capacity.saturating_mul(U256::from(2u8));
        let rounded = self.sold.saturating_mul(U256::from(200u8)).saturating_add(self.capacity) / doubled;
        u8::try_from(rounded.min(hundred).to::<u64>()).unwrap_or(100)
    }
}

/// Live event stream from a push subscription. It ends when the connection drops.
pub type EventStream = BoxStream<'static, Result<RawEvent, ChainError>>;

/// Everything the pipeline asks of the chain.
#[async_trait]
pub trait ChainSource: Send + Sync {
    async fn block_number(&self) -> Result<u64, ChainError>;

    /// Logs for the named events emitted by `address` within `from..=to`.
    async fn fetch_logs(
        &self,
        address: Address,
        abi: &JsonAbi,
        events: &[String],
        from: u64,
        to: u64,
    ) -> Result<Vec<RawEvent>, ChainError>;

    /// Open a push subscription. Sources without push support return `Unsupported`.
    async fn subscribe_logs(
        &self,
        address: Address,
        abi: &JsonAbi,
        events: &[String],
    ) -> Result<EventStream, ChainError>;

    async fn total_count(&self, factory: Address) -> Result<u64, ChainError>;

    async fn get_slice(
        &self,
        factory: Address,
        offset: u64,
        limit: u64,
    ) -> Result<SliceResult, ChainError>;

    async fn get_by_creator(
        &self,
        factory: Address,
        creator: Address,
        offset: u64,
        limit: u64,
    ) -> Result<SliceResult, ChainError>;

    async fn pair_details(&self, factory: Address, token: Address) -> Result<RawRow, ChainError>;

    async fn presale_state(&self, presale: Address) -> Result<PresaleState, ChainError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn node_messages_are_classified() {
        assert!(ChainError::from_message("read ECONNRESET").is_transient());
        assert!(ChainError::from_message("Request timed out").is_transient());
        assert!(ChainError::from_message("execution reverted: bad offset").is_revert());
        assert!(matches!(
            ChainError::from_message("method not found"),
            ChainError::Rpc(_)
        ));
    }

    #[test]
    fn terminal_errors_are_not_transient() {
        for err in [
            ChainError::InvalidAddress("x".into()),
            ChainError::Abi("x".into()),
            ChainError::Unsupported("push".into()),
            ChainError::Reverted("x".into()),
        ] {
            assert!(!err.is_transient(), "{err}");
        }
        assert!(ChainError::Timeout(Duration::from_secs(1)).is_transient());
    }

    #[test]
    fn progress_rounds_and_caps() {
        let state = |sold: u64, capacity: u64| PresaleState {
            open_state: 1,
            sold: U256::from(sold),
            capacity: U256::from(capacity),
        };
        assert_eq!(state(0, 0).progress_percent(), 0);
        assert_eq!(state(1, 3).progress_percent(), 33);
        assert_eq!(state(1, 200).progress_percent(), 1);
        assert_eq!(state(2, 3).progress_percent(), 67);
        assert_eq!(state(999, 1000).progress_percent(), 100);
        assert_eq!(state(5, 2).progress_percent(), 100);
    }

    #[test]
    fn rows_take_both_shapes() {
        assert!(matches!(RawRow::from_value(json!(["0x1", 2])), Some(RawRow::Tuple(v)) if v.len() == 2));
        assert!(matches!(RawRow::from_value(json!({"tokenAddress": "0x1"})), Some(RawRow::Record(_))));
        assert!(RawRow::from_value(json!("nope")).is_none());
    }
}
