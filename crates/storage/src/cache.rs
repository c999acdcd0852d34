//! Deduplicating, size-bounded, expiring event cache with blob persistence.

use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use padwatch_core::{Settings, now_ms};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::blob::BlobStore;
use crate::error::StorageError;
use crate::models::{
    DomainEvent, EventFilter, EventStats, PagedResult, QueryOptions, SortField, SortOrder,
};

pub const BLOB_VERSION: &str = "1.0";

/// Subset size written when the full snapshot does not fit the store quota.
pub const FALLBACK_PERSIST_COUNT: usize = 100;

#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub max_size: usize,
    pub max_persisted: usize,
    pub ttl: Duration,
    pub storage_key: String,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_size: 1_000,
            max_persisted: 5_000,
            ttl: Duration::from_secs(7 * 24 * 60 * 60),
            storage_key: "padwatch_events".into(),
        }
    }
}

impl CacheConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            max_size: settings.cache_max_size,
            max_persisted: settings.cache_max_persisted,
            ttl: settings.cache_ttl,
            storage_key: settings.storage_key.clone(),
        }
    }
}

/// Running counters, persisted alongside the events.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CacheCounters {
    pub total_events: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub duplicates_blocked: u64,
    pub evicted: u64,
    pub last_cleanup_ms: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStatus {
    pub size: usize,
    pub max_size: usize,
    pub oldest_ms: Option<i64>,
    pub newest_ms: Option<i64>,
    pub counters: CacheCounters,
}

/// What `persist` managed to write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersistOutcome {
    Full(usize),
    /// The quota forced a smaller most-recent subset.
    Reduced(usize),
    /// Even the reduced subset did not fit; nothing was written.
    Dropped,
}

#[derive(Serialize)]
struct BlobOut<'a> {
    events: Vec<&'a DomainEvent>,
    stats: CacheCounters,
    timestamp: i64,
    version: &'static str,
}

#[derive(Deserialize)]
struct BlobIn {
    #[serde(default)]
    events: Vec<Value>,
    #[serde(default)]
    stats: Option<CacheCounters>,
    #[serde(default)]
    version: Option<String>,
}

#[derive(Default)]
struct Inner {
    events: HashMap<String, Arc<DomainEvent>>,
    /// (timestamp, id) for every stored event; the first entry is the oldest.
    by_age: BTreeSet<(i64, String)>,
    counters: CacheCounters,
}

impl Inner {
    fn insert(&mut self, event: Arc<DomainEvent>) -> bool {
        if self.events.contains_key(&event.id) {
            self.counters.duplicates_blocked += 1;
            return false;
        }
        self.by_age.insert((event.timestamp_ms, event.id.clone()));
        self.events.insert(event.id.clone(), event);
        self.counters.total_events += 1;
        true
    }

    fn remove_oldest(&mut self) -> bool {
        match self.by_age.pop_first() {
            Some((_, id)) => {
                self.events.remove(&id);
                self.counters.evicted += 1;
                true
            }
            None => false,
        }
    }

    fn shrink_to(&mut self, max: usize) -> usize {
        let mut removed = 0;
        while self.events.len() > max && self.remove_oldest() {
            removed += 1;
        }
        removed
    }

    fn remove_older_than(&mut self, cutoff_ms: i64) -> usize {
        let mut removed = 0;
        while self.by_age.first().is_some_and(|(ts, _)| *ts < cutoff_ms) && self.remove_oldest() {
            removed += 1;
        }
        removed
    }
}

/// Shared event store. One lock guards the id map and the age index together.
pub struct EventCache {
    config: CacheConfig,
    inner: RwLock<Inner>,
}

impl EventCache {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            inner: RwLock::new(Inner::default()),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    fn read(&self) -> RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(|e| e.into_inner())
    }

    fn ttl_ms(&self) -> i64 {
        i64::try_from(self.config.ttl.as_millis()).unwrap_or(i64::MAX)
    }

    /// Store an event. Returns `true` only if the event is held afterwards: a
    /// duplicate id, a malformed event, or one older than everything in a full
    /// cache all return `false`.
    pub fn put(&self, event: DomainEvent) -> bool {
        if !event.is_valid() {
            tracing::warn!(id = %event.id, "Rejected malformed event");
            return false;
        }
        let id = event.id.clone();
        let mut inner = self.write();
        if !inner.insert(Arc::new(event)) {
            return false;
        }
        inner.shrink_to(self.config.max_size);
        inner.events.contains_key(&id)
    }

    /// Store many events; returns how many were new.
    pub fn put_all(&self, events: impl IntoIterator<Item = DomainEvent>) -> usize {
        events.into_iter().map(|e| self.put(e)).filter(|stored| *stored).count()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.read().events.contains_key(id)
    }

    /// Look up an event by id, counting hits and misses.
    pub fn get(&self, id: &str) -> Option<Arc<DomainEvent>> {
        let mut inner = self.write();
        let found = inner.events.get(id).cloned();
        if found.is_some() {
            inner.counters.cache_hits += 1;
        } else {
            inner.counters.cache_misses += 1;
        }
        found
    }

    pub fn len(&self) -> usize {
        self.read().events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn snapshot(&self, filter: &EventFilter) -> Vec<Arc<DomainEvent>> {
        self.read()
            .events
            .values()
            .filter(|e| filter.matches(e))
            .cloned()
            .collect()
    }

    /// Filter, sort and page over a snapshot of the current contents.
    pub fn query(&self, filter: &EventFilter, options: &QueryOptions) -> PagedResult<DomainEvent> {
        let mut matched = self.snapshot(filter);
        matched.sort_by(|a, b| compare(a, b, options.sort_by, options.sort_order));

        let total = matched.len();
        let items: Vec<DomainEvent> = matched
            .iter()
            .skip(options.offset)
            .take(options.limit)
            .map(|e| DomainEvent::clone(e))
            .collect();

        PagedResult::new(items, total as u64, options.offset as u64, options.limit as u64)
    }

    /// The `n` newest events matching `filter`.
    pub fn latest(&self, n: usize, filter: &EventFilter) -> Vec<DomainEvent> {
        let options = QueryOptions {
            limit: n,
            ..QueryOptions::default()
        };
        self.query(filter, &options).items
    }

    pub fn contract_events(&self, address: &str, limit: usize) -> Vec<DomainEvent> {
        let filter = EventFilter {
            contract_address: Some(address.to_string()),
            ..EventFilter::default()
        };
        self.latest(limit, &filter)
    }

    pub fn stats(&self, filter: &EventFilter) -> EventStats {
        let matched = self.snapshot(filter);
        EventStats::collect(matched.iter().map(|e| e.as_ref()), now_ms())
    }

    /// Drop every event older than the TTL. Returns how many were removed.
    pub fn evict_expired(&self, now_ms: i64) -> usize {
        let cutoff = now_ms.saturating_sub(self.ttl_ms());
        let mut inner = self.write();
        let removed = inner.remove_older_than(cutoff);
        inner.counters.last_cleanup_ms = Some(now_ms);
        if removed > 0 {
            tracing::debug!(removed, "Evicted expired events");
        }
        removed
    }

    /// Evict oldest-first until at most `max` events remain.
    pub fn enforce_capacity(&self, max: usize) -> usize {
        self.write().shrink_to(max)
    }

    pub fn clear(&self) {
        let mut inner = self.write();
        inner.events.clear();
        inner.by_age.clear();
    }

    pub fn status(&self) -> CacheStatus {
        let inner = self.read();
        CacheStatus {
            size: inner.events.len(),
            max_size: self.config.max_size,
            oldest_ms: inner.by_age.first().map(|(ts, _)| *ts),
            newest_ms: inner.by_age.last().map(|(ts, _)| *ts),
            counters: inner.counters,
        }
    }

    /// Most recent non-expired events, newest first.
    fn recent(&self, count: usize, now_ms: i64) -> (Vec<Arc<DomainEvent>>, CacheCounters) {
        let cutoff = now_ms.saturating_sub(self.ttl_ms());
        let inner = self.read();
        let events = inner
            .by_age
            .iter()
            .rev()
            .take_while(|(ts, _)| *ts >= cutoff)
            .take(count)
            .filter_map(|(_, id)| inner.events.get(id).cloned())
            .collect();
        (events, inner.counters)
    }

    fn encode(events: &[Arc<DomainEvent>], stats: CacheCounters, now_ms: i64) -> Result<Vec<u8>, StorageError> {
        let blob = BlobOut {
            events: events.iter().map(|e| e.as_ref()).collect(),
            stats,
            timestamp: now_ms,
            version: BLOB_VERSION,
        };
        Ok(serde_json::to_vec(&blob)?)
    }

    /// Write the most recent events to the blob store.
    ///
    /// On a quota failure the expired entries are evicted and the most recent
    /// [`FALLBACK_PERSIST_COUNT`] events are written instead. If that also fails
    /// the snapshot is skipped with a warning.
    pub async fn persist(&self, store: &dyn BlobStore) -> Result<PersistOutcome, StorageError> {
        let now = now_ms();
        let key = &self.config.storage_key;
        let (events, counters) = self.recent(self.config.max_persisted, now);
        let bytes = Self::encode(&events, counters, now)?;

        match store.write(key, &bytes).await {
            Ok(()) => {
                tracing::debug!(events = events.len(), bytes = bytes.len(), "Persisted event cache");
                return Ok(PersistOutcome::Full(events.len()));
            }
            Err(e) if e.is_quota() => {
                tracing::warn!(error = %e, "Event snapshot over quota, retrying with a smaller subset");
            }
            Err(e) => return Err(e),
        }

        self.evict_expired(now);
        let (events, counters) = self.recent(FALLBACK_PERSIST_COUNT, now);
        let bytes = Self::encode(&events, counters, now)?;
        match store.write(key, &bytes).await {
            Ok(()) => Ok(PersistOutcome::Reduced(events.len())),
            Err(e) if e.is_quota() => {
                tracing::warn!(error = %e, "Reduced event snapshot still over quota, skipping");
                Ok(PersistOutcome::Dropped)
            }
            Err(e) => Err(e),
        }
    }

    /// Merge a persisted snapshot into the cache. Malformed and expired entries are skipped.
    pub async fn load(&self, store: &dyn BlobStore) -> Result<usize, StorageError> {
        let Some(bytes) = store.read(&self.config.storage_key).await? else {
            return Ok(0);
        };
        let blob: BlobIn = match serde_json::from_slice(&bytes) {
            Ok(blob) => blob,
            Err(e) => {
                tracing::warn!(error = %e, "Ignoring unreadable event snapshot");
                return Ok(0);
            }
        };
        if blob.version.as_deref().is_some_and(|v| v != BLOB_VERSION) {
            tracing::warn!(version = ?blob.version, "Loading event snapshot from another version");
        }

        let cutoff = now_ms().saturating_sub(self.ttl_ms());
        let mut skipped = 0usize;
        let mut loaded = 0usize;
        let mut inner = self.write();
        for value in blob.events {
            let event = match serde_json::from_value::<DomainEvent>(value) {
                Ok(event) if event.is_valid() && event.timestamp_ms >= cutoff => event,
                _ => {
                    skipped += 1;
                    continue;
                }
            };
            if inner.insert(Arc::new(event)) {
                loaded += 1;
            }
        }
        if let Some(stats) = blob.stats {
            inner.counters.cache_hits += stats.cache_hits;
            inner.counters.cache_misses += stats.cache_misses;
            inner.counters.duplicates_blocked += stats.duplicates_blocked;
        }
        inner.shrink_to(self.config.max_size);
        drop(inner);

        tracing::info!(loaded, skipped, "Loaded event snapshot");
        Ok(loaded)
    }

    /// Periodically evict expired events and persist until `cancel` fires.
    pub fn spawn_maintenance(
        self: Arc<Self>,
        store: Arc<dyn BlobStore>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        self.evict_expired(now_ms());
                        if let Err(e) = self.persist(store.as_ref()).await {
                            tracing::error!(error = %e, "Failed to persist event cache");
                        }
                    }
                }
            }
            tracing::debug!("Cache maintenance stopped");
        })
    }
}

fn compare(a: &DomainEvent, b: &DomainEvent, field: SortField, order: SortOrder) -> Ordering {
    let primary = match field {
        SortField::Timestamp => a.timestamp_ms.cmp(&b.timestamp_ms),
        SortField::BlockNumber => a
            .block_number
            .cmp(&b.block_number)
            .then(a.log_index.cmp(&b.log_index)),
        SortField::EventName => a.event_name.cmp(&b.event_name),
        SortField::ContractAddress => a.contract_address.cmp(&b.contract_address),
        SortField::Category => a.category.as_str().cmp(b.category.as_str()),
        SortField::Priority => a.priority.rank().cmp(&b.priority.rank()),
        SortField::Id => Ordering::Equal,
    };
    let primary = match order {
        SortOrder::Asc => primary,
        SortOrder::Desc => primary.reverse(),
    };
    // Id tiebreak keeps pages stable across calls.
    primary.then_with(|| match (field, order) {
        (SortField::Id, SortOrder::Desc) => b.id.cmp(&a.id),
        _ => a.id.cmp(&b.id),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::MemoryBlobStore;
    use crate::models::{Category, DisplayData, Priority};
    use serde_json::{Map, json};

    fn event(id: &str, ts: i64) -> DomainEvent {
        DomainEvent {
            id: id.to_string(),
            event_name: "Transfer".into(),
            contract_address: "0x5aAeb6053F3E94C9b9A09f33669435E7Ef1BeAed".into(),
            block_number: ts as u64,
            transaction_hash: format!("0x{id}"),
            log_index: Some(0),
            timestamp_ms: ts,
            formatted_time: String::new(),
            category: Category::TokenTransfer,
            priority: Priority::Low,
            parameters: Map::new(),
            display: DisplayData::default(),
            contract_type: None,
            related: None,
            error: None,
            raw: Value::Null,
        }
    }

    fn cache(max_size: usize) -> EventCache {
        EventCache::new(CacheConfig {
            max_size,
            ..CacheConfig::default()
        })
    }

    #[test]
    fn put_is_idempotent_per_id() {
        let cache = cache(10);
        assert!(cache.put(event("a", 1)));
        assert!(!cache.put(event("a", 1)));
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.status().counters.duplicates_blocked, 1);
    }

    #[test]
    fn malformed_events_are_rejected() {
        let cache = cache(10);
        let mut bad = event("a", 1);
        bad.contract_address.clear();
        assert!(!cache.put(bad));
        assert!(cache.is_empty());
    }

    #[test]
    fn query_sorts_desc_by_timestamp_and_pages() {
        let cache = cache(10);
        cache.put_all([event("x", 100), event("y", 200), event("z", 300)]);

        let page = cache.query(
            &EventFilter::default(),
            &QueryOptions {
                limit: 2,
                ..QueryOptions::default()
            },
        );
        let stamps: Vec<i64> = page.items.iter().map(|e| e.timestamp_ms).collect();
        assert_eq!(stamps, vec![300, 200]);
        assert_eq!(page.total, 3);
        assert!(page.has_more);
    }

    #[test]
    fn equal_timestamps_page_stably() {
        let cache = cache(10);
        cache.put_all((0..6).map(|i| event(&format!("e{i}"), 50)));
        let opts = |offset| QueryOptions {
            limit: 3,
            offset,
            sort_order: SortOrder::Asc,
            ..QueryOptions::default()
        };
        let first = cache.query(&EventFilter::default(), &opts(0));
        let second = cache.query(&EventFilter::default(), &opts(3));
        let ids: Vec<String> = first.items.iter().chain(&second.items).map(|e| e.id.clone()).collect();
        assert_eq!(ids, vec!["e0", "e1", "e2", "e3", "e4", "e5"]);
    }

    #[test]
    fn capacity_evicts_globally_oldest_first() {
        let cache = cache(100);
        for (id, ts) in [("d", 400), ("a", 100), ("e", 500), ("b", 200), ("c", 300)] {
            cache.put(event(id, ts));
        }
        assert_eq!(cache.enforce_capacity(3), 2);
        assert!(!cache.contains("a") && !cache.contains("b"));
        assert!(cache.contains("c") && cache.contains("d") && cache.contains("e"));
    }

    #[test]
    fn put_enforces_configured_capacity() {
        let cache = cache(2);
        cache.put(event("a", 1));
        cache.put(event("b", 2));
        cache.put(event("c", 3));
        assert_eq!(cache.len(), 2);
        assert!(!cache.contains("a"));
    }

    #[test]
    fn event_older_than_a_full_cache_is_not_reported_stored() {
        let cache = cache(2);
        assert!(cache.put(event("b", 200)));
        assert!(cache.put(event("c", 300)));

        assert!(!cache.put(event("a", 100)));
        assert!(!cache.put(event("a", 100)));
        assert!(!cache.contains("a"));
        assert_eq!(cache.len(), 2);

        assert!(cache.put(event("d", 400)));
        assert!(!cache.contains("b"));
    }

    #[test]
    fn expired_events_are_evicted() {
        let cache = EventCache::new(CacheConfig {
            ttl: Duration::from_millis(1_000),
            ..CacheConfig::default()
        });
        cache.put_all([event("old", 1_000), event("new", 9_500)]);
        assert_eq!(cache.evict_expired(10_000), 1);
        assert!(cache.contains("new"));
        assert_eq!(cache.status().counters.last_cleanup_ms, Some(10_000));
    }

    #[test]
    fn get_counts_hits_and_misses() {
        let cache = cache(10);
        cache.put(event("a", 1));
        assert!(cache.get("a").is_some());
        assert!(cache.get("b").is_none());
        let counters = cache.status().counters;
        assert_eq!((counters.cache_hits, counters.cache_misses), (1, 1));
    }

    #[test]
    fn stats_break_down_by_family() {
        let cache = cache(10);
        let now = now_ms();
        let mut purchase = event("p", now);
        purchase.event_name = "TokensPurchased".into();
        purchase.category = Category::PresaleTransaction;
        purchase.priority = Priority::Medium;
        cache.put_all([event("t", now - 2 * 60 * 60 * 1000), purchase]);

        let stats = cache.stats(&EventFilter::default());
        assert_eq!(stats.total_events, 2);
        assert_eq!(stats.by_category.get("presale_transaction"), Some(&1));
        assert_eq!(stats.by_event_name.get("Transfer"), Some(&1));
        assert_eq!(stats.recent_activity.last_hour, 1);
        assert_eq!(stats.recent_activity.last_day, 2);
    }

    #[tokio::test]
    async fn persist_and_load_round_trip() {
        let store = MemoryBlobStore::new();
        let now = now_ms();
        let source = cache(10);
        source.put_all([event("a", now - 10), event("b", now)]);
        assert_eq!(source.persist(&store).await.unwrap(), PersistOutcome::Full(2));

        let restored = cache(10);
        assert_eq!(restored.load(&store).await.unwrap(), 2);
        assert!(restored.contains("a") && restored.contains("b"));
    }

    #[tokio::test]
    async fn load_skips_malformed_and_expired_entries() {
        let store = MemoryBlobStore::new();
        let now = now_ms();
        let good = serde_json::to_value(event("good", now)).unwrap();
        let expired = serde_json::to_value(event("old", 5)).unwrap();
        let blob = json!({
            "events": [good, expired, {"id": "broken"}, 17],
            "stats": {"cacheHits": 4},
            "timestamp": now,
            "version": BLOB_VERSION,
        });
        store
            .write("padwatch_events", &serde_json::to_vec(&blob).unwrap())
            .await
            .unwrap();

        let cache = cache(10);
        assert_eq!(cache.load(&store).await.unwrap(), 1);
        assert!(cache.contains("good"));
        assert_eq!(cache.status().counters.cache_hits, 4);
    }

    #[tokio::test]
    async fn unreadable_snapshot_loads_nothing() {
        let store = MemoryBlobStore::new();
        store.write("padwatch_events", b"{ nope").await.unwrap();
        assert_eq!(cache(10).load(&store).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn persist_falls_back_to_recent_subset_on_quota() {
        let now = now_ms();
        let cache = cache(500);
        cache.put_all((0..300).map(|i| event(&format!("ev{i:03}"), now - 300 + i)));

        let one = serde_json::to_vec(&event("ev000", now)).unwrap().len();
        // Room for roughly 150 events: the full set fails, the subset fits.
        let store = MemoryBlobStore::with_quota(one * 150);
        assert_eq!(
            cache.persist(&store).await.unwrap(),
            PersistOutcome::Reduced(FALLBACK_PERSIST_COUNT)
        );

        let restored = EventCache::new(CacheConfig::default());
        restored.load(&store).await.unwrap();
        assert!(restored.contains("ev299"));
        assert!(!restored.contains("ev000"));
    }

    #[tokio::test]
    async fn persist_gives_up_quietly_when_nothing_fits() {
        let cache = cache(10);
        cache.put(event("a", now_ms()));
        let store = MemoryBlobStore::with_quota(8);
        assert_eq!(cache.persist(&store).await.unwrap(), PersistOutcome::Dropped);
    }

    #[tokio::test]
    async fn maintenance_stops_on_cancel() {
        let cache = Arc::new(cache(10));
        cache.put(event("a", now_ms()));
        let store: Arc<dyn BlobStore> = Arc::new(MemoryBlobStore::new());
        let cancel = CancellationToken::new();

        let handle = cache.clone().spawn_maintenance(store.clone(), Duration::from_millis(10), cancel.clone());
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
        handle.await.unwrap();

        assert!(store.read("padwatch_events").await.unwrap().is_some());
    }
}
