//! Paginated pair listing read straight from the factory contract.
//!
//! The factory only offers a count call and an `(offset, limit)` slice call,
//! and both may change between reads. `total` on a page is advisory; `items`
//! is what was actually retrieved.
//!
//! Each listed pair is decorated with its presale's live status and progress.
//! Those views are read per presale and cached separately; a presale that
//! cannot be read leaves the pair's status `unknown` instead of failing the page.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use padwatch_chain::{Address, ChainError, ChainSource, SliceResult, address};
use padwatch_core::{AppError, Settings};
use padwatch_storage::models::{PageStatus, PagedResult, PresaleInfo, TokenPair};
use serde::Serialize;
use thiserror::Error;

use crate::normalizer::format_amount;
use crate::registry::chain_app_error;

#[derive(Debug, Error)]
pub enum ListError {
    #[error("invalid address `{0}`")]
    InvalidAddress(String),

    #[error(transparent)]
    Chain(#[from] ChainError),
}

impl From<ListError> for AppError {
    fn from(err: ListError) -> Self {
        match err {
            ListError::InvalidAddress(_) => AppError::InvalidInput(err.to_string()),
            ListError::Chain(e) => chain_app_error(e),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ListOptions {
    /// Skip the read cache and refresh it with the result.
    pub bypass_cache: bool,
}

impl ListOptions {
    pub fn fresh() -> Self {
        Self { bypass_cache: true }
    }
}

/// Outcome of a single-entity lookup. A revert means the entity does not exist.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup<T> {
    Found(T),
    NotFound,
}

impl<T> Lookup<T> {
    pub fn found(self) -> Option<T> {
        match self {
            Lookup::Found(value) => Some(value),
            Lookup::NotFound => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ListConfig {
    /// Lifetime of cached pages and presale states.
    pub cache_ttl: Duration,
    pub call_timeout: Duration,
    /// Entry cap for each cache. Zero disables caching.
    pub max_cache_entries: usize,
}

impl ListConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            cache_ttl: settings.list_cache_ttl,
            call_timeout: settings.view_call_timeout,
            max_cache_entries: settings.list_cache_max_entries,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ListCacheStats {
    pub entries: usize,
    pub presale_entries: usize,
    pub hits: u64,
    pub misses: u64,
    pub epoch: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum Query {
    All,
    Creator(Address),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    epoch: u64,
    query: Query,
    offset: u64,
    limit: u64,
}

/// Capped map whose entries expire `ttl` after insertion.
struct ExpiringMap<K, V> {
    ttl: Duration,
    capacity: usize,
    entries: HashMap<K, (Instant, V)>,
}

impl<K: Eq + Hash + Clone, V: Clone> ExpiringMap<K, V> {
    fn new(ttl: Duration, capacity: usize) -> Self {
        Self {
            ttl,
            capacity,
            entries: HashMap::new(),
        }
    }

    /// A fresh entry, or `None`. A stale entry is dropped on the way.
    fn get(&mut self, key: &K) -> Option<V> {
        let fresh = self
            .entries
            .get(key)
            .is_some_and(|(at, _)| at.elapsed() < self.ttl);
        if fresh {
            return self.entries.get(key).map(|(_, value)| value.clone());
        }
        self.entries.remove(key);
        None
    }

    /// Sweep expired entries, then evict oldest-first until there is room.
    fn insert(&mut self, key: K, value: V) {
        if self.capacity == 0 {
            return;
        }
        let ttl = self.ttl;
        self.entries.remove(&key);
        self.entries.retain(|_, (at, _)| at.elapsed() < ttl);
        while self.entries.len() >= self.capacity {
            let oldest = self
                .entries
                .iter()
                .min_by_key(|(_, (at, _))| *at)
                .map(|(k, _)| k.clone());
            match oldest {
                Some(oldest) => self.entries.remove(&oldest),
                None => break,
            };
        }
        self.entries.insert(key, (Instant::now(), value));
    }

    fn clear(&mut self) {
        self.entries.clear();
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

type PageCache = ExpiringMap<CacheKey, PagedResult<TokenPair>>;
type PresaleCache = ExpiringMap<Address, PresaleInfo>;

/// Token/presale pair listing with a short read-through cache.
pub struct PairListService {
    source: Arc<dyn ChainSource>,
    factory: Address,
    config: ListConfig,
    cache: Mutex<PageCache>,
    presales: Mutex<PresaleCache>,
    epoch: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl PairListService {
    pub fn new(source: Arc<dyn ChainSource>, factory: Address, config: ListConfig) -> Self {
        Self {
            source,
            factory,
            cache: Mutex::new(ExpiringMap::new(config.cache_ttl, config.max_cache_entries)),
            presales: Mutex::new(ExpiringMap::new(config.cache_ttl, config.max_cache_entries)),
            config,
            epoch: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    fn cache(&self) -> MutexGuard<'_, PageCache> {
        self.cache.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn presales(&self) -> MutexGuard<'_, PresaleCache> {
        self.presales.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn call<T>(
        &self,
        fut: impl std::future::Future<Output = Result<T, ChainError>>,
    ) -> Result<T, ChainError> {
        tokio::time::timeout(self.config.call_timeout, fut)
            .await
            .unwrap_or(Err(ChainError::Timeout(self.config.call_timeout)))
    }

    /// Every pair the factory has created, newest position last.
    pub async fn list_all(
        &self,
        offset: u64,
        limit: u64,
        options: ListOptions,
    ) -> Result<PagedResult<TokenPair>, ListError> {
        self.read_through(Query::All, offset, limit, options).await
    }

    /// Pairs created by `creator`.
    pub async fn list_by_creator(
        &self,
        creator: &str,
        offset: u64,
        limit: u64,
        options: ListOptions,
    ) -> Result<PagedResult<TokenPair>, ListError> {
        let creator = address::parse_address(creator)
            .map_err(|_| ListError::InvalidAddress(creator.to_string()))?;
        self.read_through(Query::Creator(creator), offset, limit, options).await
    }

    async fn read_through(
        &self,
        query: Query,
        offset: u64,
        limit: u64,
        options: ListOptions,
    ) -> Result<PagedResult<TokenPair>, ListError> {
        let key = CacheKey {
            epoch: self.epoch.load(Ordering::Acquire),
            query,
            offset,
            limit,
        };
        if !options.bypass_cache {
            let cached = self.cache().get(&key);
            if let Some(page) = cached {
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Ok(page.with_status(PageStatus::Cached));
            }
        }
        self.misses.fetch_add(1, Ordering::Relaxed);

        let mut page = match &key.query {
            Query::All => self.fetch_all(offset, limit).await?,
            Query::Creator(creator) => self.fetch_by_creator(*creator, offset, limit).await,
        };
        let pairs = std::mem::take(&mut page.items);
        page.items = futures::future::join_all(pairs.into_iter().map(|pair| self.decorate(pair))).await;
        if !page.status.is_degraded() {
            self.cache().insert(key, page.clone());
        }
        Ok(page)
    }

    /// Fill in display fields and presale state.
    async fn decorate(&self, mut pair: TokenPair) -> TokenPair {
        pair.total_supply_formatted = format_amount(&pair.total_supply);
        pair.created_at_formatted = pair.created_at.map(format_date).unwrap_or_default();
        let presale = pair
            .presale_address
            .as_deref()
            .and_then(|a| address::parse_address(a).ok())
            .filter(|a| !a.is_zero());
        let info = match presale {
            Some(presale) => self.presale_info(presale).await,
            None => None,
        };
        pair.with_presale(info)
    }

    async fn presale_info(&self, presale: Address) -> Option<PresaleInfo> {
        let cached = self.presales().get(&presale);
        if cached.is_some() {
            return cached;
        }
        match self.call(self.source.presale_state(presale)).await {
            Ok(state) => {
                let info = PresaleInfo::from(&state);
                self.presales().insert(presale, info.clone());
                Some(info)
            }
            Err(e) => {
                tracing::debug!(%presale, error = %e, "Presale state unavailable");
                None
            }
        }
    }

    async fn fetch_all(&self, offset: u64, limit: u64) -> Result<PagedResult<TokenPair>, ListError> {
        let total = match self.call(self.source.total_count(self.factory)).await {
            Ok(total) => total,
            Err(e) if e.is_revert() || matches!(e, ChainError::Timeout(_)) => {
                tracing::warn!(error = %e, "Pair count unavailable");
                return Ok(PagedResult::empty(0, offset, limit).with_status(PageStatus::Degraded {
                    reason: e.to_string(),
                }));
            }
            Err(e) => return Err(e.into()),
        };

        // The factory reverts on out-of-range slices, so never ask for one.
        if total == 0 || offset >= total || limit == 0 {
            return Ok(PagedResult::empty(total, offset, limit));
        }

        let slice = self.call(self.source.get_slice(self.factory, offset, limit)).await;
        Ok(self.page_from(slice, total, offset, limit))
    }

    async fn fetch_by_creator(&self, creator: Address, offset: u64, limit: u64) -> PagedResult<TokenPair> {
        if limit == 0 {
            return PagedResult::empty(0, offset, limit);
        }
        let slice = self
            .call(self.source.get_by_creator(self.factory, creator, offset, limit))
            .await;
        let total = match &slice {
            Ok(slice) => slice.total.unwrap_or(offset.saturating_add(slice.rows.len() as u64)),
            Err(_) => 0,
        };
        self.page_from(slice, total, offset, limit)
    }

    fn page_from(
        &self,
        slice: Result<SliceResult, ChainError>,
        total: u64,
        offset: u64,
        limit: u64,
    ) -> PagedResult<TokenPair> {
        let slice = match slice {
            Ok(slice) => slice,
            Err(e) => {
                tracing::warn!(offset, limit, error = %e, "Pair slice unavailable");
                return PagedResult::empty(total, offset, limit).with_status(PageStatus::Degraded {
                    reason: e.to_string(),
                });
            }
        };

        let max = usize::try_from(limit).unwrap_or(usize::MAX);
        let items: Vec<TokenPair> = slice.rows.iter().take(max).map(TokenPair::from_row).collect();
        let page = PagedResult::new(items, total, offset, limit);
        match slice.total {
            Some(reported) if reported != total => {
                tracing::warn!(counted = total, reported, "Pair total changed between reads");
                page.with_status(PageStatus::TotalChanged {
                    counted: total,
                    reported,
                })
            }
            _ => page,
        }
    }

    /// Details for the pair whose token is `token`.
    pub async fn pair_details(&self, token: &str) -> Result<Lookup<TokenPair>, ListError> {
        let target =
            address::parse_address(token).map_err(|_| ListError::InvalidAddress(token.to_string()))?;
        let row = match self.call(self.source.pair_details(self.factory, target)).await {
            Ok(row) => row,
            Err(e) if e.is_revert() => return Ok(Lookup::NotFound),
            Err(e) => return Err(e.into()),
        };
        let pair = TokenPair::from_row(&row);
        // Unknown tokens come back as a zeroed struct rather than a revert.
        let zero = address::to_canonical(Address::ZERO);
        match pair.token_address.as_deref() {
            None => Ok(Lookup::NotFound),
            Some(found) if found == zero => Ok(Lookup::NotFound),
            Some(_) => Ok(Lookup::Found(self.decorate(pair).await)),
        }
    }

    /// Drop every cached page and presale state. Call after a local write so the next read sees it.
    pub fn invalidate(&self) {
        let epoch = self.epoch.fetch_add(1, Ordering::AcqRel) + 1;
        self.cache().clear();
        self.presales().clear();
        tracing::debug!(epoch, "Pair list cache invalidated");
    }

    pub fn cache_stats(&self) -> ListCacheStats {
        ListCacheStats {
            entries: self.cache().len(),
            presale_entries: self.presales().len(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            epoch: self.epoch.load(Ordering::Acquire),
        }
    }
}

/// `YYYY-MM-DD` for an on-chain seconds timestamp.
fn format_date(secs: u64) -> String {
    i64::try_from(secs)
        .ok()
        .and_then(|secs| DateTime::<Utc>::from_timestamp(secs, 0))
        .map(|t| t.format("%Y-%m-%d").to_string())
        .unwrap_or_default()
}
