use alloy::dyn_abi::{DecodedEvent, DynSolValue, EventExt};
use alloy::json_abi::{Event, JsonAbi};
use alloy::primitives::B256;
use alloy::rpc::types::Log;
use serde_json::{Map, Value, json};

use crate::address::to_canonical;
use crate::source::{ChainError, RawEvent};

/// Event selectors for the named events. Overloads are all included.
pub fn selectors(abi: &JsonAbi, names: &[String]) -> Result<Vec<B256>, ChainError> {
    let mut out = Vec::new();
    for name in names {
        let overloads = abi
            .event(name)
            .ok_or_else(|| ChainError::Abi(format!("event `{name}` is not declared")))?;
        out.extend(overloads.iter().filter(|e| !e.anonymous).map(Event::selector));
    }
    Ok(out)
}

/// Turn an RPC log into the untyped payload the normalizer consumes.
///
/// A log the ABI cannot decode still produces a payload; it carries a
/// `decodeError` field plus the raw topics and data.
pub fn decode_log(log: &Log, abi: &JsonAbi) -> RawEvent {
    let mut payload = Map::new();
    payload.insert("address".into(), json!(to_canonical(log.address())));
    if let Some(block) = log.block_number {
        payload.insert("blockNumber".into(), json!(block));
    }
    if let Some(hash) = log.block_hash {
        payload.insert("blockHash".into(), json!(format!("{hash:#x}")));
    }
    if let Some(tx) = log.transaction_hash {
        payload.insert("transactionHash".into(), json!(format!("{tx:#x}")));
    }
    if let Some(index) = log.log_index {
        payload.insert("logIndex".into(), json!(index));
    }
    if let Some(ts) = log.block_timestamp {
        payload.insert("blockTimestamp".into(), json!(ts));
    }

    let topic0 = log.topics().first();
    let event = topic0.and_then(|t| abi.events().find(|e| !e.anonymous && e.selector() == *t));

    match event {
        Some(event) => {
            payload.insert("event".into(), json!(event.name));
            match event.decode_log(log.data()) {
                Ok(decoded) => {
                    payload.insert("args".into(), Value::Object(named_args(event, decoded)));
                }
                Err(e) => {
                    tracing::debug!(event = %event.name, error = %e, "Log failed to decode");
                    payload.insert("decodeError".into(), json!(e.to_string()));
                    insert_raw(&mut payload, log);
                }
            }
        }
        None => {
            let topic = topic0.map(|t| format!("{t:#x}")).unwrap_or_default();
            payload.insert(
                "decodeError".into(),
                json!(format!("no event in ABI matches topic {topic}")),
            );
            insert_raw(&mut payload, log);
        }
    }

    RawEvent::new(Value::Object(payload))
}

fn named_args(event: &Event, decoded: DecodedEvent) -> Map<String, Value> {
    let mut indexed = decoded.indexed.into_iter();
    let mut body = decoded.body.into_iter();
    let mut args = Map::new();
    for (position, input) in event.inputs.iter().enumerate() {
        let value = if input.indexed { indexed.next() } else { body.next() };
        let Some(value) = value else { break };
        let key = if input.name.is_empty() {
            position.to_string()
        } else {
            input.name.clone()
        };
        args.insert(key, to_json(&value));
    }
    args
}

fn insert_raw(payload: &mut Map<String, Value>, log: &Log) {
    let topics: Vec<Value> = log.topics().iter().map(|t| json!(format!("{t:#x}"))).collect();
    payload.insert("topics".into(), Value::Array(topics));
    payload.insert(
        "data".into(),
        json!(format!("0x{}", hex::encode(&log.data().data))),
    );
}

/// JSON form of a decoded ABI value. Integers become decimal strings so
/// 256-bit amounts survive.
pub fn to_json(value: &DynSolValue) -> Value {
    match value {
        DynSolValue::Bool(b) => Value::Bool(*b),
        DynSolValue::Int(i, _) => Value::String(i.to_string()),
        DynSolValue::Uint(u, _) => Value::String(u.to_string()),
        DynSolValue::Address(a) => Value::String(to_canonical(*a)),
        DynSolValue::FixedBytes(word, size) => {
            Value::String(format!("0x{}", hex::encode(&word[..*size])))
        }
        DynSolValue::Bytes(bytes) => Value::String(format!("0x{}", hex::encode(bytes))),
        DynSolValue::String(s) => Value::String(s.clone()),
        DynSolValue::Array(items) | DynSolValue::FixedArray(items) | DynSolValue::Tuple(items) => {
            Value::Array(items.iter().map(to_json).collect())
        }
        other => Value::String(format!("{other:?}")),
    }
}
