use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;

/// Which delivery transports a subscription runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportMode {
    /// WebSocket log subscriptions only (falls back to polling when unavailable).
    Push,
    /// Block-range polling only.
    Poll,
    /// Both at once; the event cache absorbs the duplicates.
    Both,
}

impl TransportMode {
    pub fn uses_push(self) -> bool {
        matches!(self, TransportMode::Push | TransportMode::Both)
    }

    pub fn uses_poll(self) -> bool {
        matches!(self, TransportMode::Poll | TransportMode::Both)
    }
}

impl FromStr for TransportMode {
    type Err = eyre::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "push" | "ws" | "websocket" => Ok(TransportMode::Push),
            "poll" | "polling" => Ok(TransportMode::Poll),
            "both" => Ok(TransportMode::Both),
            other => Err(eyre::eyre!("unknown transport mode `{other}`")),
        }
    }
}

/// Global application settings loaded from environment variables.
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    /// HTTP JSON-RPC endpoint used for view calls and log polling.
    pub rpc_url: String,

    /// WebSocket endpoint for log subscriptions. `None` disables the push transport.
    pub ws_url: Option<String>,

    /// Root factory contract that deploys token/presale pairs.
    pub factory_address: String,

    /// Name of the factory event announcing a new pair.
    pub creation_event: String,

    pub transport_mode: TransportMode,

    /// Polling transport period.
    pub poll_interval: Duration,

    /// Maximum block span requested per log query.
    pub max_block_range: u64,

    pub reconnect_base_delay: Duration,
    pub reconnect_max_delay: Duration,

    /// Consecutive transient failures tolerated before a subscription is marked failed.
    pub max_reconnect_attempts: u32,

    /// Period of the discovery reconciliation pass.
    pub discovery_interval: Duration,

    /// Scan factory history from this block on startup.
    pub backfill_from_block: Option<u64>,

    pub cache_max_size: usize,
    pub cache_max_persisted: usize,
    pub cache_ttl: Duration,
    pub cache_cleanup_interval: Duration,

    /// Directory/file used by the file blob store.
    pub cache_path: PathBuf,

    /// PostgreSQL URL; when set, the event blob is kept in the database instead of on disk.
    pub database_url: Option<String>,

    /// Key under which the event blob is stored.
    pub storage_key: String,

    /// Blob size quota in bytes.
    pub max_blob_bytes: usize,

    pub list_cache_ttl: Duration,
    /// Entry cap for the list page and presale state caches.
    pub list_cache_max_entries: usize,
    pub view_call_timeout: Duration,
    pub subscribe_timeout: Duration,

    /// Port for the API server.
    pub api_port: u16,

    pub factory_abi_path: Option<PathBuf>,
    pub token_abi_path: Option<PathBuf>,
    pub presale_abi_path: Option<PathBuf>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            rpc_url: "http://localhost:8545".into(),
            ws_url: None,
            factory_address: "0x0000000000000000000000000000000000000000".into(),
            creation_event: "TokenPresalePairCreated".into(),
            transport_mode: TransportMode::Both,
            poll_interval: Duration::from_millis(10_000),
            max_block_range: 5_000,
            reconnect_base_delay: Duration::from_millis(3_000),
            reconnect_max_delay: Duration::from_millis(30_000),
            max_reconnect_attempts: 5,
            discovery_interval: Duration::from_millis(30_000),
            backfill_from_block: None,
            cache_max_size: 1_000,
            cache_max_persisted: 5_000,
            cache_ttl: Duration::from_secs(7 * 24 * 60 * 60),
            cache_cleanup_interval: Duration::from_secs(60 * 60),
            cache_path: PathBuf::from("data"),
            database_url: None,
            storage_key: "padwatch_events".into(),
            max_blob_bytes: 5 * 1024 * 1024,
            list_cache_ttl: Duration::from_millis(30_000),
            list_cache_max_entries: 256,
            view_call_timeout: Duration::from_millis(10_000),
            subscribe_timeout: Duration::from_millis(15_000),
            api_port: 3000,
            factory_abi_path: None,
            token_abi_path: None,
            presale_abi_path: None,
        }
    }
}

impl Settings {
    /// Load settings from environment variables (with optional `.env` file).
    pub fn from_env() -> eyre::Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build settings from an arbitrary key lookup, falling back to defaults.
    pub fn from_lookup<F>(lookup: F) -> eyre::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let d = Settings::default();
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let millis = |key: &str, default: Duration| -> eyre::Result<Duration> {
            Ok(match get(key) {
                Some(v) => Duration::from_millis(v.trim().parse()?),
                None => default,
            })
        };
        let secs = |key: &str, default: Duration| -> eyre::Result<Duration> {
            Ok(match get(key) {
                Some(v) => Duration::from_secs(v.trim().parse()?),
                None => default,
            })
        };

        Ok(Self {
            rpc_url: get("RPC_URL").unwrap_or(d.rpc_url),
            ws_url: get("WS_URL"),
            factory_address: get("FACTORY_ADDRESS").unwrap_or(d.factory_address),
            creation_event: get("CREATION_EVENT").unwrap_or(d.creation_event),
            transport_mode: match get("TRANSPORT_MODE") {
                Some(v) => v.parse()?,
                None => d.transport_mode,
            },
            poll_interval: millis("POLL_INTERVAL_MS", d.poll_interval)?,
            max_block_range: parse_or(get("MAX_BLOCK_RANGE"), d.max_block_range)?,
            reconnect_base_delay: millis("RECONNECT_BASE_DELAY_MS", d.reconnect_base_delay)?,
            reconnect_max_delay: millis("RECONNECT_MAX_DELAY_MS", d.reconnect_max_delay)?,
            max_reconnect_attempts: parse_or(
                get("MAX_RECONNECT_ATTEMPTS"),
                d.max_reconnect_attempts,
            )?,
            discovery_interval: millis("DISCOVERY_INTERVAL_MS", d.discovery_interval)?,
            backfill_from_block: get("BACKFILL_FROM_BLOCK")
                .map(|v| v.trim().parse())
                .transpose()?,
            cache_max_size: parse_or(get("CACHE_MAX_SIZE"), d.cache_max_size)?,
            cache_max_persisted: parse_or(get("CACHE_MAX_PERSISTED"), d.cache_max_persisted)?,
            cache_ttl: secs("CACHE_TTL_SECS", d.cache_ttl)?,
            cache_cleanup_interval: secs("CACHE_CLEANUP_INTERVAL_SECS", d.cache_cleanup_interval)?,
            cache_path: get("CACHE_PATH").map(PathBuf::from).unwrap_or(d.cache_path),
            database_url: get("DATABASE_URL"),
            storage_key: get("STORAGE_KEY").unwrap_or(d.storage_key),
            max_blob_bytes: parse_or(get("MAX_BLOB_BYTES"), d.max_blob_bytes)?,
            list_cache_ttl: millis("LIST_CACHE_TTL_MS", d.list_cache_ttl)?,
            list_cache_max_entries: parse_or(get("LIST_CACHE_MAX_ENTRIES"), d.list_cache_max_entries)?,
            view_call_timeout: millis("VIEW_CALL_TIMEOUT_MS", d.view_call_timeout)?,
            subscribe_timeout: millis("SUBSCRIBE_TIMEOUT_MS", d.subscribe_timeout)?,
            api_port: parse_or(get("API_PORT"), d.api_port)?,
            factory_abi_path: get("FACTORY_ABI_PATH").map(PathBuf::from),
            token_abi_path: get("TOKEN_ABI_PATH").map(PathBuf::from),
            presale_abi_path: get("PRESALE_ABI_PATH").map(PathBuf::from),
        })
    }
}

fn parse_or<T>(value: Option<String>, default: T) -> eyre::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match value {
        Some(v) => Ok(v.trim().parse()?),
        None => Ok(default),
    }
}
