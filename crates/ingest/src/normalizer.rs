//! Raw chain payload → [`DomainEvent`].
//!
//! Chain clients name the same log fields differently; every variant is
//! resolved here and nowhere else. Normalization never fails: a payload that
//! cannot be understood becomes a `ProcessingError` event.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use padwatch_chain::RawEvent;
use padwatch_chain::address;
use padwatch_core::now_ms;
use padwatch_storage::models::{
    Category, DisplayData, DomainEvent, EventStats, Priority, value_u64,
};
use serde_json::{Map, Value};

pub const PROCESSING_ERROR: &str = "ProcessingError";

const NAME_KEYS: &[&str] = &["eventName", "event", "event_name", "name"];
const ADDRESS_KEYS: &[&str] = &["contractAddress", "address", "contract"];
const BLOCK_KEYS: &[&str] = &["blockNumber", "block", "block_number"];
const TX_KEYS: &[&str] = &["transactionHash", "transaction", "transaction_id", "tx_hash"];
const LOG_INDEX_KEYS: &[&str] = &["logIndex", "log_index", "event_index"];
const PARAM_KEYS: &[&str] = &["result", "returnValues", "args", "params"];

/// Parameter keys treated as addresses (substring, case-insensitive).
const ADDRESS_PARAM_HINTS: &[&str] = &[
    "token",
    "presale",
    "creator",
    "owner",
    "to",
    "from",
    "recipient",
    "sender",
    "address",
    "tokenaddress",
    "presaleaddress",
    "devlpreceiver",
    "backingreceiver",
];

/// Amounts are 18-decimal fixed point.
const DECIMALS: i32 = 18;

#[derive(Debug, Default)]
pub struct Normalizer {
    fallback_index: AtomicU64,
}

struct Envelope<'a> {
    name: Option<String>,
    contract: Option<String>,
    block: u64,
    tx: Option<String>,
    log_index: Option<u64>,
    timestamp_ms: Option<i64>,
    params: Option<&'a Value>,
}

impl Normalizer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn normalize(&self, raw: &RawEvent) -> DomainEvent {
        self.normalize_at(raw, now_ms())
    }

    /// Normalize with an explicit clock for payloads that carry no timestamp.
    pub fn normalize_at(&self, raw: &RawEvent, now_ms: i64) -> DomainEvent {
        let Some(payload) = raw.payload().as_object() else {
            return self.degraded(raw, None, "event payload is not an object", now_ms);
        };
        let envelope = extract(payload);

        if let Some(message) = payload.get("decodeError").and_then(Value::as_str) {
            return self.degraded(raw, Some(&envelope), message, now_ms);
        }
        let Some(name) = envelope.name.clone() else {
            return self.degraded(raw, Some(&envelope), "event name is missing", now_ms);
        };
        let parameters = match envelope.params {
            None | Some(Value::Null) => Map::new(),
            Some(Value::Object(map)) => normalize_params(named_entries(map)),
            Some(Value::Array(items)) => normalize_params(
                items
                    .iter()
                    .enumerate()
                    .map(|(i, v)| (i.to_string(), v.clone()))
                    .collect(),
            ),
            Some(_) => {
                let message = "event parameters are malformed";
                return self.degraded(raw, Some(&envelope), message, now_ms);
            }
        };

        let contract_address = envelope
            .contract
            .clone()
            .unwrap_or_else(|| "unknown".to_string());
        let tx = envelope.tx.clone().unwrap_or_else(|| "unknown".to_string());
        let timestamp_ms = envelope.timestamp_ms.unwrap_or(now_ms);
        let id = self.event_id(&name, &tx, envelope.block, envelope.log_index);
        let display = display_for(&name, &contract_address, &parameters);

        DomainEvent {
            id,
            category: Category::for_event(&name),
            priority: Priority::for_event(&name),
            event_name: name,
            contract_address,
            block_number: envelope.block,
            transaction_hash: tx,
            log_index: envelope.log_index,
            timestamp_ms,
            formatted_time: format_time(timestamp_ms),
            parameters,
            display,
            contract_type: None,
            related: None,
            error: None,
            raw: raw.payload().clone(),
        }
    }

    pub fn normalize_batch(&self, raws: &[RawEvent]) -> Vec<DomainEvent> {
        raws.iter().map(|raw| self.normalize(raw)).collect()
    }

    pub fn summarize(events: &[DomainEvent]) -> EventStats {
        EventStats::collect(events, now_ms())
    }

    fn event_id(&self, name: &str, tx: &str, block: u64, log_index: Option<u64>) -> String {
        match log_index {
            Some(index) => format!("{name}_{tx}_{block}_{index}"),
            None => {
                let n = self.fallback_index.fetch_add(1, Ordering::Relaxed);
                format!("{name}_{tx}_{block}_b{n}")
            }
        }
    }

    fn degraded(
        &self,
        raw: &RawEvent,
        envelope: Option<&Envelope<'_>>,
        message: &str,
        now_ms: i64,
    ) -> DomainEvent {
        tracing::warn!(error = message, "Failed to normalize event");
        let contract_address = envelope
            .and_then(|e| e.contract.clone())
            .unwrap_or_else(|| "unknown".to_string());
        let tx = envelope
            .and_then(|e| e.tx.clone())
            .unwrap_or_else(|| "unknown".to_string());
        let block = envelope.map_or(0, |e| e.block);
        let timestamp_ms = envelope.and_then(|e| e.timestamp_ms).unwrap_or(now_ms);
        let log_index = envelope.and_then(|e| e.log_index);

        let mut parameters = Map::new();
        parameters.insert("error".into(), Value::String(message.to_string()));
        if let Some(name) = envelope.and_then(|e| e.name.clone()) {
            parameters.insert("originalEvent".into(), Value::String(name));
        }

        DomainEvent {
            id: self.event_id(PROCESSING_ERROR, &tx, block, log_index),
            event_name: PROCESSING_ERROR.to_string(),
            contract_address: contract_address.clone(),
            block_number: block,
            transaction_hash: tx,
            log_index,
            timestamp_ms,
            formatted_time: format_time(timestamp_ms),
            category: Category::Error,
            priority: Priority::High,
            parameters,
            display: DisplayData {
                title: "Processing Error".into(),
                description: format!(
                    "Could not process event from {}",
                    address::shorten(&contract_address)
                ),
                details: BTreeMap::from([("error".to_string(), message.to_string())]),
            },
            contract_type: None,
            related: None,
            error: Some(message.to_string()),
            raw: raw.payload().clone(),
        }
    }
}

fn first<'a>(payload: &'a Map<String, Value>, keys: &[&str]) -> Option<&'a Value> {
    keys.iter().find_map(|k| payload.get(*k).filter(|v| !v.is_null()))
}

fn extract(payload: &Map<String, Value>) -> Envelope<'_> {
    let text = |keys: &[&str]| {
        first(payload, keys)
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    };
    let contract = text(ADDRESS_KEYS).map(|a| address::canonical(&a).unwrap_or(a));

    let timestamp_ms = match payload.get("timestamp").and_then(value_i64) {
        Some(ms) => Some(ms),
        None => first(payload, &["blockTimestamp", "block_timestamp"])
            .and_then(value_i64)
            .map(|secs| secs.saturating_mul(1000)),
    };

    Envelope {
        name: text(NAME_KEYS),
        contract,
        block: first(payload, BLOCK_KEYS).and_then(value_u64).unwrap_or(0),
        tx: text(TX_KEYS),
        log_index: first(payload, LOG_INDEX_KEYS).and_then(value_u64),
        timestamp_ms,
        params: first(payload, PARAM_KEYS),
    }
}

fn value_i64(value: &Value) -> Option<i64> {
    value_u64(value).and_then(|v| i64::try_from(v).ok())
}

/// Named entries only, unless the map is purely positional.
fn named_entries(map: &Map<String, Value>) -> Vec<(String, Value)> {
    let positional = |k: &str| k.bytes().all(|b| b.is_ascii_digit());
    let has_named = map.keys().any(|k| !positional(k));
    map.iter()
        .filter(|(k, _)| !has_named || !positional(k))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

fn normalize_params(entries: Vec<(String, Value)>) -> Map<String, Value> {
    entries
        .into_iter()
        .map(|(key, value)| {
            let value = match value {
                Value::String(s) if is_address_key(&key) || address::looks_like_address(&s) => {
                    Value::String(address::canonical(&s).unwrap_or(s))
                }
                other => other,
            };
            (key, value)
        })
        .collect()
}

fn is_address_key(key: &str) -> bool {
    let key = key.to_ascii_lowercase();
    ADDRESS_PARAM_HINTS.iter().any(|hint| key.contains(hint))
}

fn format_time(timestamp_ms: i64) -> String {
    DateTime::<Utc>::from_timestamp_millis(timestamp_ms)
        .map(|t| t.to_rfc3339())
        .unwrap_or_default()
}

// ─── Display ────────────────────────────────────────────────────────────────

fn param_text(params: &Map<String, Value>, key: &str) -> String {
    match params.get(key) {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Null) | None => String::new(),
        Some(other) => other.to_string(),
    }
}

fn short_param(params: &Map<String, Value>, key: &str) -> String {
    address::shorten(&param_text(params, key))
}

/// `1.23M`-style rendering of an 18-decimal amount.
pub fn format_amount(raw: &str) -> String {
    let Ok(units) = raw.trim().parse::<f64>() else {
        return raw.to_string();
    };
    let value = units / 10f64.powi(DECIMALS);
    if value >= 1_000_000_000.0 {
        format!("{:.2}B", value / 1_000_000_000.0)
    } else if value >= 1_000_000.0 {
        format!("{:.2}M", value / 1_000_000.0)
    } else if value >= 1_000.0 {
        format!("{:.2}K", value / 1_000.0)
    } else {
        let s = format!("{value:.4}");
        s.trim_end_matches('0').trim_end_matches('.').to_string()
    }
}

/// `TokensPurchased` → `Tokens Purchased`.
fn title_case(name: &str) -> String {
    let mut out = String::with_capacity(name.len() + 4);
    let chars: Vec<char> = name.chars().collect();
    for (i, c) in chars.iter().enumerate() {
        let boundary = i > 0
            && c.is_uppercase()
            && (chars[i - 1].is_lowercase()
                || (chars[i - 1].is_uppercase() && chars.get(i + 1).is_some_and(|n| n.is_lowercase())));
        if boundary {
            out.push(' ');
        }
        out.push(*c);
    }
    out
}

fn display_for(name: &str, contract: &str, params: &Map<String, Value>) -> DisplayData {
    let mut details: BTreeMap<String, String> =
        params.iter().map(|(k, _)| (k.clone(), param_text(params, k))).collect();

    let (title, description) = match name {
        "TokenPresalePairCreated" => {
            details.insert("totalSupply".into(), format_amount(&param_text(params, "totalSupply")));
            (
                "New Token Launched".to_string(),
                format!(
                    "{} created token {} with presale {}",
                    short_param(params, "creator"),
                    short_param(params, "token"),
                    short_param(params, "presale"),
                ),
            )
        }
        "TokensPurchased" => (
            "Tokens Purchased".to_string(),
            format!(
                "{} bought {} tokens for {} BNB",
                short_param(params, "buyer"),
                format_amount(&param_text(params, "tokenAmount")),
                format_amount(&param_text(params, "amount")),
            ),
        ),
        "Transfer" => (
            "Token Transfer".to_string(),
            format!(
                "{} tokens from {} to {}",
                format_amount(&param_text(params, "value")),
                short_param(params, "from"),
                short_param(params, "to"),
            ),
        ),
        "PresaleStarted" | "PresaleEnded" | "PresaleStateChanged" => (
            title_case(name),
            format!("Presale {} changed state", address::shorten(contract)),
        ),
        _ => (
            title_case(name),
            format!("{} on {}", title_case(name), address::shorten(contract)),
        ),
    };

    DisplayData {
        title,
        description,
        details,
    }
}
