use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use padwatch_chain::{PresaleState, RawRow};
use padwatch_chain::address;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

// ─── Category ───────────────────────────────────────────────────────────────

/// Event family, derived from the event name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    TokenCreation,
    TokenLinking,
    Ownership,
    LgeConfig,
    VestingConfig,
    BackingConfig,
    System,
    TokenTransfer,
    TokenApproval,
    TokenConfig,
    PresaleLifecycle,
    PresaleTransaction,
    Liquidity,
    Unknown,
    Error,
}

impl Category {
    pub fn for_event(name: &str) -> Self {
        match name {
            "TokenPresalePairCreated" => Category::TokenCreation,
            "TokenPresaleLinked" => Category::TokenLinking,
            "OwnershipTransferred" => Category::Ownership,
            "LGEConfigSet" => Category::LgeConfig,
            "VestingConfigSet" => Category::VestingConfig,
            "BackingConfigSet" => Category::BackingConfig,
            "CoordinatorInitialized" => Category::System,
            "Transfer" => Category::TokenTransfer,
            "Approval" => Category::TokenApproval,
            "PresaleContractSet" | "ExcludeFeeSet" => Category::TokenConfig,
            "PresaleStarted" | "PresaleEnded" | "PresaleStateChanged" => Category::PresaleLifecycle,
            "TokensPurchased" | "TokensClaimed" | "BNBAccumulated" => Category::PresaleTransaction,
            "LiquidityAdded" => Category::Liquidity,
            _ => Category::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Category::TokenCreation => "token_creation",
            Category::TokenLinking => "token_linking",
            Category::Ownership => "ownership",
            Category::LgeConfig => "lge_config",
            Category::VestingConfig => "vesting_config",
            Category::BackingConfig => "backing_config",
            Category::System => "system",
            Category::TokenTransfer => "token_transfer",
            Category::TokenApproval => "token_approval",
            Category::TokenConfig => "token_config",
            Category::PresaleLifecycle => "presale_lifecycle",
            Category::PresaleTransaction => "presale_transaction",
            Category::Liquidity => "liquidity",
            Category::Unknown => "unknown",
            Category::Error => "error",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Category {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        serde_json::from_value(Value::String(s.to_string()))
            .map_err(|_| format!("unknown category `{s}`"))
    }
}

// ─── Priority ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    Medium,
    Low,
}

impl Priority {
    pub fn for_event(name: &str) -> Self {
        match name {
            "TokenPresalePairCreated" | "PresaleStarted" | "PresaleEnded" => Priority::High,
            "Transfer" | "Approval" => Priority::Low,
            _ => Priority::Medium,
        }
    }

    /// Higher is more urgent.
    pub fn rank(self) -> u8 {
        match self {
            Priority::High => 2,
            Priority::Medium => 1,
            Priority::Low => 0,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::High => "high",
            Priority::Medium => "medium",
            Priority::Low => "low",
        }
    }
}

impl FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "high" => Ok(Priority::High),
            "medium" => Ok(Priority::Medium),
            "low" => Ok(Priority::Low),
            other => Err(format!("unknown priority `{other}`")),
        }
    }
}

// ─── Contracts ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContractType {
    Factory,
    Token,
    Presale,
}

impl fmt::Display for ContractType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ContractType::Factory => "factory",
            ContractType::Token => "token",
            ContractType::Presale => "presale",
        })
    }
}

/// Edge recorded from a factory creation event, keyed by token address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContractRelation {
    pub token_address: String,
    pub presale_address: String,
    pub creator_address: Option<String>,
    pub created_at_ms: i64,
}

/// Contracts linked to the one that emitted an event.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelatedContracts {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub presale: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creator: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at_ms: Option<i64>,
}

// ─── DomainEvent ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DisplayData {
    pub title: String,
    pub description: String,
    #[serde(default)]
    pub details: BTreeMap<String, String>,
}

/// Canonical form of one on-chain log. Never mutated once built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DomainEvent {
    pub id: String,
    pub event_name: String,
    pub contract_address: String,
    pub block_number: u64,
    pub transaction_hash: String,
    #[serde(default)]
    pub log_index: Option<u64>,
    pub timestamp_ms: i64,
    #[serde(default)]
    pub formatted_time: String,
    pub category: Category,
    pub priority: Priority,
    #[serde(default)]
    pub parameters: Map<String, Value>,
    #[serde(default)]
    pub display: DisplayData,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contract_type: Option<ContractType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub related: Option<RelatedContracts>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub raw: Value,
}

impl DomainEvent {
    /// Copy of this event tagged with where it came from.
    pub fn with_context(
        &self,
        contract_type: Option<ContractType>,
        related: Option<RelatedContracts>,
    ) -> Self {
        Self {
            contract_type,
            related,
            ..self.clone()
        }
    }

    /// Minimum shape required to be stored.
    pub fn is_valid(&self) -> bool {
        !self.id.is_empty() && !self.event_name.is_empty() && !self.contract_address.is_empty()
    }

    pub fn is_error(&self) -> bool {
        self.category == Category::Error
    }

    /// String parameter by name.
    pub fn param_str(&self, key: &str) -> Option<&str> {
        self.parameters.get(key).and_then(Value::as_str)
    }
}

// ─── Query types ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventFilter {
    pub contract_address: Option<String>,
    pub event_name: Option<String>,
    pub category: Option<Category>,
    pub priority: Option<Priority>,
    pub from_ms: Option<i64>,
    pub to_ms: Option<i64>,
    pub from_block: Option<u64>,
    pub to_block: Option<u64>,
}

impl EventFilter {
    pub fn matches(&self, event: &DomainEvent) -> bool {
        if self
            .contract_address
            .as_ref()
            .is_some_and(|a| !a.eq_ignore_ascii_case(&event.contract_address))
        {
            return false;
        }
        if self.event_name.as_ref().is_some_and(|n| *n != event.event_name) {
            return false;
        }
        if self.category.is_some_and(|c| c != event.category) {
            return false;
        }
        if self.priority.is_some_and(|p| p != event.priority) {
            return false;
        }
        if self.from_ms.is_some_and(|t| event.timestamp_ms < t)
            || self.to_ms.is_some_and(|t| event.timestamp_ms > t)
        {
            return false;
        }
        if self.from_block.is_some_and(|b| event.block_number < b)
            || self.to_block.is_some_and(|b| event.block_number > b)
        {
            return false;
        }
        true
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortField {
    #[default]
    Timestamp,
    BlockNumber,
    EventName,
    ContractAddress,
    Category,
    Priority,
    Id,
}

impl FromStr for SortField {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "timestamp" | "timestampMs" | "timestamp_ms" => Ok(SortField::Timestamp),
            "blockNumber" | "block_number" => Ok(SortField::BlockNumber),
            "eventName" | "event_name" => Ok(SortField::EventName),
            "contractAddress" | "contract_address" => Ok(SortField::ContractAddress),
            "category" => Ok(SortField::Category),
            "priority" => Ok(SortField::Priority),
            "id" => Ok(SortField::Id),
            other => Err(format!("cannot sort by `{other}`")),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    Asc,
    #[default]
    Desc,
}

impl FromStr for SortOrder {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "asc" => Ok(SortOrder::Asc),
            "desc" => Ok(SortOrder::Desc),
            other => Err(format!("unknown sort order `{other}`")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueryOptions {
    pub limit: usize,
    pub offset: usize,
    pub sort_by: SortField,
    pub sort_order: SortOrder,
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self {
            limit: 100,
            offset: 0,
            sort_by: SortField::Timestamp,
            sort_order: SortOrder::Desc,
        }
    }
}

// ─── Pagination ─────────────────────────────────────────────────────────────

/// How a page was produced. Lets callers tell "no entities" from "query degraded".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PageStatus {
    Fresh,
    Cached,
    /// The slice call reported a different total than the count call.
    TotalChanged { counted: u64, reported: u64 },
    Degraded { reason: String },
}

impl PageStatus {
    pub fn is_degraded(&self) -> bool {
        matches!(self, PageStatus::Degraded { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PagedResult<T> {
    pub items: Vec<T>,
    pub total: u64,
    pub offset: u64,
    pub limit: u64,
    pub has_more: bool,
    pub status: PageStatus,
}

impl<T> PagedResult<T> {
    pub fn new(items: Vec<T>, total: u64, offset: u64, limit: u64) -> Self {
        let has_more = offset.saturating_add(items.len() as u64) < total;
        Self {
            items,
            total,
            offset,
            limit,
            has_more,
            status: PageStatus::Fresh,
        }
    }

    pub fn empty(total: u64, offset: u64, limit: u64) -> Self {
        Self::new(Vec::new(), total, offset, limit)
    }

    pub fn with_status(mut self, status: PageStatus) -> Self {
        self.status = status;
        self
    }
}

// ─── Stats ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeRange {
    pub earliest_ms: i64,
    pub latest_ms: i64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecentActivity {
    pub last_hour: usize,
    pub last_day: usize,
    pub last_week: usize,
}

/// Aggregate breakdown over a set of events.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventStats {
    pub total_events: usize,
    pub by_category: BTreeMap<String, usize>,
    pub by_priority: BTreeMap<String, usize>,
    pub by_contract: BTreeMap<String, usize>,
    pub by_event_name: BTreeMap<String, usize>,
    pub time_range: Option<TimeRange>,
    pub recent_activity: RecentActivity,
}

impl EventStats {
    pub fn collect<'a>(events: impl IntoIterator<Item = &'a DomainEvent>, now_ms: i64) -> Self {
        const HOUR: i64 = 60 * 60 * 1000;
        let mut stats = EventStats::default();
        for event in events {
            stats.total_events += 1;
            *stats.by_category.entry(event.category.to_string()).or_default() += 1;
            *stats.by_priority.entry(event.priority.as_str().to_string()).or_default() += 1;
            *stats.by_contract.entry(event.contract_address.clone()).or_default() += 1;
            *stats.by_event_name.entry(event.event_name.clone()).or_default() += 1;

            let ts = event.timestamp_ms;
            stats.time_range = Some(match stats.time_range {
                Some(range) => TimeRange {
                    earliest_ms: range.earliest_ms.min(ts),
                    latest_ms: range.latest_ms.max(ts),
                },
                None => TimeRange { earliest_ms: ts, latest_ms: ts },
            });

            let age = now_ms - ts;
            if age <= HOUR {
                stats.recent_activity.last_hour += 1;
            }
            if age <= 24 * HOUR {
                stats.recent_activity.last_day += 1;
            }
            if age <= 7 * 24 * HOUR {
                stats.recent_activity.last_week += 1;
            }
        }
        stats
    }
}

// ─── TokenPair ──────────────────────────────────────────────────────────────

/// One token/presale pair as the factory reports it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenPair {
    pub token_address: Option<String>,
    pub presale_address: Option<String>,
    pub creator: Option<String>,
    /// Seconds since epoch, as stored on chain.
    pub created_at: Option<u64>,
    pub token_name: String,
    pub token_symbol: String,
    pub total_supply: String,
    #[serde(default)]
    pub total_supply_formatted: String,
    /// Creation date, empty when the chain gave none.
    #[serde(default)]
    pub created_at_formatted: String,
    /// Live presale views; `None` when they could not be read.
    #[serde(default)]
    pub presale: Option<PresaleInfo>,
    #[serde(default)]
    pub status: SaleStatus,
    #[serde(default)]
    pub progress: SaleProgress,
}

const PAIR_FIELDS: [&str; 7] = [
    "tokenAddress",
    "presaleAddress",
    "creator",
    "createdAt",
    "tokenName",
    "tokenSymbol",
    "totalSupply",
];

impl TokenPair {
    /// Decode one factory row. Unparseable fields fall back to defaults; this never fails.
    pub fn from_row(row: &RawRow) -> Self {
        let field = |position: usize| -> Option<&Value> {
            match row {
                RawRow::Tuple(values) => values.get(position),
                RawRow::Record(map) => map
                    .get(PAIR_FIELDS[position])
                    .or_else(|| map.get(&position.to_string())),
            }
        };
        let addr = |position: usize| {
            field(position)
                .and_then(Value::as_str)
                .and_then(|s| address::canonical(s).ok())
        };
        let text = |position: usize, default: &str| {
            field(position)
                .and_then(Value::as_str)
                .filter(|s| !s.is_empty())
                .unwrap_or(default)
                .to_string()
        };

        TokenPair {
            token_address: addr(0),
            presale_address: addr(1),
            creator: addr(2),
            created_at: field(3).and_then(value_u64),
            token_name: text(4, "Unknown"),
            token_symbol: text(5, "UNK"),
            total_supply: field(6)
                .and_then(value_decimal)
                .unwrap_or_else(|| "0".to_string()),
            total_supply_formatted: String::new(),
            created_at_formatted: String::new(),
            presale: None,
            status: SaleStatus::Unknown,
            progress: SaleProgress::default(),
        }
    }

    /// Attach presale state. `None` leaves status and progress unknown.
    pub fn with_presale(mut self, info: Option<PresaleInfo>) -> Self {
        match &info {
            Some(info) => {
                self.status = SaleStatus::from_open_state(info.open_state);
                self.progress = SaleProgress::from_info(info);
            }
            None => {
                self.status = SaleStatus::Unknown;
                self.progress = SaleProgress::default();
            }
        }
        self.presale = info;
        self
    }
}

/// Where a presale is in its lifecycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SaleStatus {
    Pending,
    Active,
    Completed,
    #[default]
    Unknown,
}

impl SaleStatus {
    pub fn from_open_state(state: u8) -> Self {
        match state {
            0 => SaleStatus::Pending,
            1 => SaleStatus::Active,
            2..=4 => SaleStatus::Completed,
            _ => SaleStatus::Unknown,
        }
    }
}

/// Presale views, amounts as decimal strings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresaleInfo {
    pub open_state: u8,
    pub sold: String,
    pub capacity: String,
    pub progress_percent: u8,
}

impl From<&PresaleState> for PresaleInfo {
    fn from(state: &PresaleState) -> Self {
        Self {
            open_state: state.open_state,
            sold: state.sold.to_string(),
            capacity: state.capacity.to_string(),
            progress_percent: state.progress_percent(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SaleProgress {
    pub percentage: u8,
    pub current: String,
    pub total: String,
    /// `completed` at 100%, `active` below it, `unknown` without presale data.
    pub status: SaleStatus,
}

impl Default for SaleProgress {
    fn default() -> Self {
        Self {
            percentage: 0,
            current: "0".into(),
            total: "0".into(),
            status: SaleStatus::Unknown,
        }
    }
}

impl SaleProgress {
    fn from_info(info: &PresaleInfo) -> Self {
        Self {
            percentage: info.progress_percent,
            current: info.sold.clone(),
            total: info.capacity.clone(),
            status: if info.progress_percent >= 100 {
                SaleStatus::Completed
            } else {
                SaleStatus::Active
            },
        }
    }
}

/// Unsigned integer from a JSON number, decimal string or `0x` hex string.
pub fn value_u64(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => {
            let s = s.trim();
            match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
                Some(hex) => u64::from_str_radix(hex, 16).ok(),
                None => s.parse().ok(),
            }
        }
        _ => None,
    }
}

/// Decimal-digit string form of an unbounded integer value.
fn value_decimal(value: &Value) -> Option<String> {
    match value {
        Value::Number(n) => n.as_u64().map(|v| v.to_string()),
        Value::String(s) if !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit()) => {
            Some(s.clone())
        }
        Value::String(s) => value_u64(&Value::String(s.clone())).map(|v| v.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const TOKEN: &str = "0x5aAeb6053F3E94C9b9A09f33669435E7Ef1BeAed";
    const PRESALE: &str = "0xfB6916095ca1df60bB79Ce92cE3Ea74c37c5d359";

    #[test]
    fn categories_cover_the_launchpad_events() {
        assert_eq!(Category::for_event("TokenPresalePairCreated"), Category::TokenCreation);
        assert_eq!(Category::for_event("ExcludeFeeSet"), Category::TokenConfig);
        assert_eq!(Category::for_event("BNBAccumulated"), Category::PresaleTransaction);
        assert_eq!(Category::for_event("SomethingNew"), Category::Unknown);
        assert_eq!("presale_lifecycle".parse::<Category>(), Ok(Category::PresaleLifecycle));
    }

    #[test]
    fn priorities_default_to_medium() {
        assert_eq!(Priority::for_event("PresaleEnded"), Priority::High);
        assert_eq!(Priority::for_event("Approval"), Priority::Low);
        assert_eq!(Priority::for_event("TokensClaimed"), Priority::Medium);
    }

    #[test]
    fn tuple_and_record_rows_decode_identically() {
        let tuple = RawRow::Tuple(vec![
            json!(TOKEN.to_lowercase()),
            json!(PRESALE),
            json!("0x0000000000000000000000000000000000000000"),
            json!("1700000000"),
            json!("Pad"),
            json!("PAD"),
            json!("1000000000000000000000000"),
        ]);
        let record = RawRow::Record(
            json!({
                "tokenAddress": TOKEN,
                "presaleAddress": PRESALE.to_lowercase(),
                "creator": "0x0000000000000000000000000000000000000000",
                "createdAt": 1_700_000_000u64,
                "tokenName": "Pad",
                "tokenSymbol": "PAD",
                "totalSupply": "1000000000000000000000000",
            })
            .as_object()
            .unwrap()
            .clone(),
        );

        let a = TokenPair::from_row(&tuple);
        assert_eq!(a, TokenPair::from_row(&record));
        assert_eq!(a.token_address.as_deref(), Some(TOKEN));
        assert_eq!(a.created_at, Some(1_700_000_000));
        assert_eq!(a.total_supply, "1000000000000000000000000");
    }

    #[test]
    fn broken_rows_get_defaults() {
        let pair = TokenPair::from_row(&RawRow::Tuple(vec![json!("nope"), json!(42)]));
        assert_eq!(pair.token_address, None);
        assert_eq!(pair.presale_address, None);
        assert_eq!(pair.token_name, "Unknown");
        assert_eq!(pair.token_symbol, "UNK");
        assert_eq!(pair.total_supply, "0");
    }

    #[test]
    fn presale_state_drives_status_and_progress() {
        let row = RawRow::Tuple(vec![json!(TOKEN), json!(PRESALE)]);
        let pair = TokenPair::from_row(&row);
        assert_eq!(pair.status, SaleStatus::Unknown);
        assert_eq!(pair.progress.status, SaleStatus::Unknown);

        let state = PresaleState {
            open_state: 1,
            sold: padwatch_chain::U256::from(250u64),
            capacity: padwatch_chain::U256::from(1000u64),
        };
        let pair = pair.with_presale(Some(PresaleInfo::from(&state)));
        assert_eq!(pair.status, SaleStatus::Active);
        assert_eq!(pair.progress.percentage, 25);
        assert_eq!(pair.progress.status, SaleStatus::Active);
        assert_eq!((pair.progress.current.as_str(), pair.progress.total.as_str()), ("250", "1000"));

        let full = PresaleState { open_state: 3, sold: state.capacity, ..state };
        let pair = pair.with_presale(Some(PresaleInfo::from(&full)));
        assert_eq!(pair.status, SaleStatus::Completed);
        assert_eq!(pair.progress.status, SaleStatus::Completed);

        let value = serde_json::to_value(pair.with_presale(None)).unwrap();
        assert_eq!(value["status"], "unknown");
        assert!(value["presale"].is_null());
        assert_eq!(SaleStatus::from_open_state(9), SaleStatus::Unknown);
        assert_eq!(SaleStatus::from_open_state(0), SaleStatus::Pending);
    }

    #[test]
    fn page_reports_has_more() {
        let page = PagedResult::new(vec![1, 2], 5, 0, 2);
        assert!(page.has_more);
        assert!(!PagedResult::new(vec![5], 5, 4, 2).has_more);
        assert!(!PagedResult::<u8>::empty(0, 0, 10).has_more);
    }

    #[test]
    fn filter_matches_address_case_insensitively() {
        let filter = EventFilter {
            contract_address: Some(TOKEN.to_lowercase()),
            from_block: Some(10),
            ..Default::default()
        };
        let event: DomainEvent = serde_json::from_value(json!({
            "id": "Transfer_0xaa_12_0",
            "eventName": "Transfer",
            "contractAddress": TOKEN,
            "blockNumber": 12,
            "transactionHash": "0xaa",
            "timestampMs": 1,
            "category": "token_transfer",
            "priority": "low",
        }))
        .unwrap();
        assert!(filter.matches(&event));
        assert!(!EventFilter { to_block: Some(11), ..filter }.matches(&event));
    }
}
