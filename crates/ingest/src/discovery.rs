//! Factory discovery: watch the root factory, follow every pair it creates,
//! and feed every delivered log through normalize → cache → listeners.

use std::collections::{BTreeMap, HashMap};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use padwatch_chain::{Address, ChainError, ChainSource, ContractAbis, JsonAbi, RawEvent, abi, address};
use padwatch_core::{AppError, Settings, now_ms};
use padwatch_storage::models::{ContractRelation, ContractType, DomainEvent, EventFilter, RelatedContracts};
use padwatch_storage::{BlobStore, EventCache, StorageError};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::normalizer::Normalizer;
use crate::registry::{Delivery, RegistryStatus, SubscriptionRegistry, WatchRequest, chain_app_error};

/// Token events followed for every discovered pair.
pub const TOKEN_EVENTS: &[&str] = &["Transfer", "Approval", "PresaleContractSet", "ExcludeFeeSet"];

/// Presale events followed for every discovered pair.
pub const PRESALE_EVENTS: &[&str] = &[
    "TokensPurchased",
    "TokensClaimed",
    "PresaleStateChanged",
    "LiquidityAdded",
];

const TOKEN_PARAM_KEYS: &[&str] = &["token", "tokenAddress", "childAddressA"];
const PRESALE_PARAM_KEYS: &[&str] = &["presale", "presaleAddress", "childAddressB"];
const CREATOR_PARAM_KEYS: &[&str] = &["creator", "creatorAddress"];

const DELIVERY_BUFFER: usize = 1024;
const BROADCAST_BUFFER: usize = 512;

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("discovery already started")]
    AlreadyStarted,

    #[error("invalid factory address `{0}`")]
    InvalidFactory(String),

    #[error(transparent)]
    Registry(#[from] crate::registry::RegistryError),

    #[error(transparent)]
    Chain(#[from] ChainError),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl From<DiscoveryError> for AppError {
    fn from(err: DiscoveryError) -> Self {
        match err {
            DiscoveryError::AlreadyStarted => AppError::Conflict(err.to_string()),
            DiscoveryError::InvalidFactory(_) => AppError::Config(err.to_string()),
            DiscoveryError::Registry(e) => e.into(),
            DiscoveryError::Chain(e) => chain_app_error(e),
            DiscoveryError::Storage(e) => e.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    pub factory_address: String,
    pub creation_event: String,
    pub discovery_interval: Duration,
    pub backfill_from_block: Option<u64>,
    pub cache_cleanup_interval: Duration,
    pub max_block_range: u64,
    pub call_timeout: Duration,
}

impl DiscoveryConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            factory_address: settings.factory_address.clone(),
            creation_event: settings.creation_event.clone(),
            discovery_interval: settings.discovery_interval,
            backfill_from_block: settings.backfill_from_block,
            cache_cleanup_interval: settings.cache_cleanup_interval,
            max_block_range: settings.max_block_range.max(1),
            call_timeout: settings.view_call_timeout,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveryStatus {
    pub running: bool,
    pub factory_address: String,
    pub relations: usize,
    pub listeners: usize,
    pub callback_errors: u64,
    pub registry: RegistryStatus,
    pub cache: padwatch_storage::cache::CacheStatus,
}

#[derive(Default)]
struct Relations {
    by_token: BTreeMap<String, ContractRelation>,
    token_by_presale: HashMap<String, String>,
}

struct Running {
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

/// Owns the ingest loop and the factory → child relation graph.
pub struct DiscoveryCoordinator {
    source: Arc<dyn ChainSource>,
    registry: Arc<SubscriptionRegistry>,
    cache: Arc<EventCache>,
    store: Arc<dyn BlobStore>,
    normalizer: Normalizer,
    config: DiscoveryConfig,
    factory: Address,
    factory_address: String,
    factory_abi: Arc<JsonAbi>,
    token_abi: Arc<JsonAbi>,
    presale_abi: Arc<JsonAbi>,
    relations: RwLock<Relations>,
    sink: mpsc::Sender<Delivery>,
    inbox: Mutex<Option<mpsc::Receiver<Delivery>>>,
    events: broadcast::Sender<Arc<DomainEvent>>,
    running: Mutex<Option<Running>>,
    listeners: Arc<AtomicU64>,
    callback_errors: Arc<AtomicU64>,
    shutdown: CancellationToken,
}

impl DiscoveryCoordinator {
    pub fn new(
        source: Arc<dyn ChainSource>,
        registry: Arc<SubscriptionRegistry>,
        cache: Arc<EventCache>,
        store: Arc<dyn BlobStore>,
        abis: &ContractAbis,
        config: DiscoveryConfig,
    ) -> Result<Self, DiscoveryError> {
        let factory = address::parse_address(&config.factory_address)
            .map_err(|_| DiscoveryError::InvalidFactory(config.factory_address.clone()))?;
        let (sink, inbox) = mpsc::channel(DELIVERY_BUFFER);
        let (events, _) = broadcast::channel(BROADCAST_BUFFER);

        Ok(Self {
            source,
            registry,
            cache,
            store,
            normalizer: Normalizer::new(),
            factory,
            factory_address: address::to_canonical(factory),
            factory_abi: Arc::new(abis.factory.clone()),
            token_abi: Arc::new(abis.token.clone()),
            presale_abi: Arc::new(abis.presale.clone()),
            config,
            relations: RwLock::new(Relations::default()),
            sink,
            inbox: Mutex::new(Some(inbox)),
            events,
            running: Mutex::new(None),
            listeners: Arc::new(AtomicU64::new(0)),
            callback_errors: Arc::new(AtomicU64::new(0)),
            shutdown: CancellationToken::new(),
        })
    }

    pub fn factory_address(&self) -> &str {
        &self.factory_address
    }

    fn relations_read(&self) -> RwLockReadGuard<'_, Relations> {
        self.relations.read().unwrap_or_else(|e| e.into_inner())
    }

    fn relations_write(&self) -> RwLockWriteGuard<'_, Relations> {
        self.relations.write().unwrap_or_else(|e| e.into_inner())
    }

    fn running(&self) -> MutexGuard<'_, Option<Running>> {
        self.running.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Load the persisted cache, watch the factory and spawn the background loops.
    pub async fn start(self: &Arc<Self>) -> Result<(), DiscoveryError> {
        let inbox = self
            .inbox
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .ok_or(DiscoveryError::AlreadyStarted)?;

        let request = WatchRequest::new(
            self.factory_address.clone(),
            ContractType::Factory,
            self.factory_abi.clone(),
        );
        if let Err(e) = self.registry.watch(request, self.sink.clone()).await {
            *self.inbox.lock().unwrap_or_else(|e| e.into_inner()) = Some(inbox);
            return Err(e.into());
        }

        match self.cache.load(self.store.as_ref()).await {
            Ok(loaded) if loaded > 0 => {
                let resumed = self.resume_from_cache().await;
                tracing::info!(loaded, resumed, "Restored cached events");
            }
            Ok(_) => {}
            Err(e) => tracing::warn!(error = %e, "Could not load cached events, starting empty"),
        }

        let cancel = self.shutdown.child_token();
        let mut tasks = vec![
            tokio::spawn(self.clone().ingest_loop(inbox, cancel.clone())),
            tokio::spawn(self.clone().reconcile_loop(cancel.clone())),
        ];
        tasks.push(self.cache.clone().spawn_maintenance(
            self.store.clone(),
            self.config.cache_cleanup_interval,
            cancel.clone(),
        ));

        if let Some(from) = self.config.backfill_from_block {
            let this = self.clone();
            let token = cancel.clone();
            tasks.push(tokio::spawn(async move {
                tokio::select! {
                    _ = token.cancelled() => {}
                    result = this.backfill(from) => match result {
                        Ok(found) => tracing::info!(from, found, "Backfill complete"),
                        Err(e) => tracing::error!(from, error = %e, "Backfill failed"),
                    },
                }
            }));
        }

        *self.running() = Some(Running { cancel, tasks });
        tracing::info!(
            factory = %self.factory_address,
            creation_event = %self.config.creation_event,
            "Discovery started"
        );
        Ok(())
    }

    /// Stop every task, drop all subscriptions and persist the cache. Safe to call twice.
    pub async fn stop(&self) -> Result<(), DiscoveryError> {
        let Some(running) = self.running().take() else {
            return Ok(());
        };
        running.cancel.cancel();
        self.registry.unwatch_all();
        for task in running.tasks {
            if let Err(e) = task.await {
                if !e.is_cancelled() {
                    tracing::warn!(error = %e, "Discovery task ended abnormally");
                }
            }
        }
        let outcome = self.cache.persist(self.store.as_ref()).await?;
        tracing::info!(?outcome, "Discovery stopped");
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.running().is_some()
    }

    async fn ingest_loop(self: Arc<Self>, mut inbox: mpsc::Receiver<Delivery>, cancel: CancellationToken) {
        loop {
            let delivery = tokio::select! {
                _ = cancel.cancelled() => break,
                next = inbox.recv() => match next {
                    Some(delivery) => delivery,
                    None => break,
                },
            };
            self.handle_delivery(delivery).await;
        }
        tracing::debug!("Ingest loop stopped");
    }

    async fn reconcile_loop(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.discovery_interval);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let registered = self.reconcile().await;
                    if registered > 0 {
                        tracing::info!(registered, "Reconciliation registered missed children");
                    }
                }
            }
        }
    }

    /// Process one delivery. Returns the stored event, or `None` for a duplicate.
    pub async fn handle_delivery(&self, delivery: Delivery) -> Option<Arc<DomainEvent>> {
        self.ingest(&delivery.event, delivery.contract_type).await
    }

    async fn ingest(&self, raw: &RawEvent, contract_type: ContractType) -> Option<Arc<DomainEvent>> {
        let event = self.normalizer.normalize(raw);
        let relation = self.creation_relation(&event);
        let related = match &relation {
            Some(relation) => Some(RelatedContracts {
                token: Some(relation.token_address.clone()),
                presale: Some(relation.presale_address.clone()),
                creator: relation.creator_address.clone(),
                created_at_ms: Some(relation.created_at_ms),
            }),
            None => self.related_for(&event.contract_address),
        };
        let event = event.with_context(Some(contract_type), related);

        if event.is_error() {
            tracing::warn!(
                contract = %event.contract_address,
                error = event.error.as_deref().unwrap_or_default(),
                "Stored degraded event"
            );
        }
        let stored = self.cache.put(event.clone());

        // Re-deliveries still reach here; `watch` is idempotent.
        if let Some(relation) = relation {
            self.follow(relation, Some(event.block_number)).await;
        }

        if !stored {
            return None;
        }
        let event = Arc::new(event);
        // No subscribers is fine.
        let _ = self.events.send(event.clone());
        Some(event)
    }

    /// The relation announced by a factory creation event, if `event` is one.
    fn creation_relation(&self, event: &DomainEvent) -> Option<ContractRelation> {
        if event.event_name != self.config.creation_event || event.contract_address != self.factory_address {
            return None;
        }
        let param = |keys: &[&str]| {
            keys.iter()
                .find_map(|k| event.param_str(k))
                .and_then(|v| address::canonical(v).ok())
        };
        let (Some(token), Some(presale)) = (param(TOKEN_PARAM_KEYS), param(PRESALE_PARAM_KEYS)) else {
            tracing::warn!(id = %event.id, "Creation event without child addresses");
            return None;
        };
        Some(ContractRelation {
            token_address: token,
            presale_address: presale,
            creator_address: param(CREATOR_PARAM_KEYS),
            created_at_ms: event.timestamp_ms,
        })
    }

    /// Record the relation and watch both children. Returns how many were newly watched.
    ///
    /// `from_block` is where polling of the children starts; `None` starts at the head.
    async fn follow(&self, relation: ContractRelation, from_block: Option<u64>) -> usize {
        {
            let mut relations = self.relations_write();
            let token = relation.token_address.clone();
            if !relations.by_token.contains_key(&token) {
                relations
                    .token_by_presale
                    .insert(relation.presale_address.clone(), token.clone());
                relations.by_token.insert(token.clone(), relation.clone());
                tracing::info!(
                    token = %token,
                    presale = %relation.presale_address,
                    creator = relation.creator_address.as_deref().unwrap_or("unknown"),
                    "Discovered token/presale pair"
                );
            }
        }

        let children = [
            (&relation.token_address, ContractType::Token, &self.token_abi, TOKEN_EVENTS),
            (&relation.presale_address, ContractType::Presale, &self.presale_abi, PRESALE_EVENTS),
        ];
        let mut newly_watched = 0;
        for (child, contract_type, child_abi, wanted) in children {
            if self.registry.is_watched(child) {
                continue;
            }
            let events: Vec<&str> = wanted
                .iter()
                .copied()
                .filter(|name| abi::declares_event(child_abi, name))
                .collect();
            let mut request =
                WatchRequest::new(child.clone(), contract_type, child_abi.clone()).events(events);
            if let Some(block) = from_block {
                request = request.from_block(block);
            }
            match self.registry.watch(request, self.sink.clone()).await {
                Ok(_) => newly_watched += 1,
                Err(e) => tracing::error!(
                    address = %child,
                    contract_type = %contract_type,
                    error = %e,
                    "Failed to watch discovered contract"
                ),
            }
        }
        newly_watched
    }

    /// Re-follow every creation event already in the cache.
    async fn resume_from_cache(&self) -> usize {
        let filter = self.creation_filter(None);
        let mut resumed = 0;
        for event in self.cache.latest(usize::MAX, &filter) {
            if let Some(relation) = self.creation_relation(&event) {
                self.follow(relation, None).await;
                resumed += 1;
            }
        }
        resumed
    }

    fn creation_filter(&self, from_ms: Option<i64>) -> EventFilter {
        EventFilter {
            contract_address: Some(self.factory_address.clone()),
            event_name: Some(self.config.creation_event.clone()),
            from_ms,
            ..EventFilter::default()
        }
    }

    /// Watch children of recent creation events that are not watched yet.
    pub async fn reconcile(&self) -> usize {
        let window = i64::try_from(self.config.discovery_interval.as_millis())
            .unwrap_or(i64::MAX)
            .saturating_mul(2);
        let filter = self.creation_filter(Some(now_ms().saturating_sub(window)));

        let mut registered = 0;
        for event in self.cache.latest(usize::MAX, &filter) {
            let Some(relation) = self.creation_relation(&event) else {
                continue;
            };
            if self.registry.is_watched(&relation.token_address)
                && self.registry.is_watched(&relation.presale_address)
            {
                continue;
            }
            registered += self.follow(relation, Some(event.block_number)).await;
        }
        registered
    }

    /// Scan factory history for creation events from `from` to the current head.
    pub async fn backfill(&self, from: u64) -> Result<usize, DiscoveryError> {
        let timeout = self.config.call_timeout;
        let head = tokio::time::timeout(timeout, self.source.block_number())
            .await
            .unwrap_or(Err(ChainError::Timeout(timeout)))?;
        let names = [self.config.creation_event.clone()];

        let mut found = 0;
        let mut start = from;
        while start <= head {
            let end = start.saturating_add(self.config.max_block_range - 1).min(head);
            let logs = tokio::time::timeout(
                timeout,
                self.source.fetch_logs(self.factory, &self.factory_abi, &names, start, end),
            )
            .await
            .unwrap_or(Err(ChainError::Timeout(timeout)))?;
            for raw in &logs {
                self.ingest(raw, ContractType::Factory).await;
            }
            found += logs.len();
            tracing::debug!(from = start, to = end, logs = logs.len(), "Backfilled factory range");
            start = end + 1;
        }
        Ok(found)
    }

    /// Receive every newly stored event.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<DomainEvent>> {
        self.events.subscribe()
    }

    /// Run `callback` for every newly stored event on its own task.
    ///
    /// A callback that errors or panics is logged and counted; other listeners
    /// keep receiving events.
    pub fn on_event<F>(&self, callback: F) -> JoinHandle<()>
    where
        F: Fn(&DomainEvent) -> eyre::Result<()> + Send + Sync + 'static,
    {
        let mut rx = self.events.subscribe();
        let cancel = self.shutdown.clone();
        let errors = self.callback_errors.clone();
        let listeners = self.listeners.clone();
        listeners.fetch_add(1, Ordering::Relaxed);

        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = cancel.cancelled() => break,
                    next = rx.recv() => match next {
                        Ok(event) => event,
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            tracing::warn!(skipped, "Event listener lagged");
                            continue;
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                };
                let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| callback(&event)));
                let failure = match outcome {
                    Ok(Ok(())) => None,
                    Ok(Err(e)) => Some(e.to_string()),
                    Err(_) => Some("listener panicked".to_string()),
                };
                if let Some(error) = failure {
                    errors.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(id = %event.id, error, "Event listener failed");
                }
            }
            listeners.fetch_sub(1, Ordering::Relaxed);
        })
    }

    /// Relations in discovery order.
    pub fn relations(&self) -> Vec<ContractRelation> {
        let mut all: Vec<ContractRelation> = self.relations_read().by_token.values().cloned().collect();
        all.sort_by(|a, b| {
            a.created_at_ms
                .cmp(&b.created_at_ms)
                .then_with(|| a.token_address.cmp(&b.token_address))
        });
        all
    }

    pub fn relation(&self, token: &str) -> Option<ContractRelation> {
        let token = address::canonical(token).ok()?;
        self.relations_read().by_token.get(&token).cloned()
    }

    /// Contracts linked to `address`, whether it is a token or a presale.
    pub fn related_for(&self, address: &str) -> Option<RelatedContracts> {
        let canonical = address::canonical(address).ok()?;
        let relations = self.relations_read();
        let token = match relations.by_token.contains_key(&canonical) {
            true => canonical,
            false => relations.token_by_presale.get(&canonical)?.clone(),
        };
        let relation = relations.by_token.get(&token)?;
        Some(RelatedContracts {
            token: Some(relation.token_address.clone()),
            presale: Some(relation.presale_address.clone()),
            creator: relation.creator_address.clone(),
            created_at_ms: Some(relation.created_at_ms),
        })
    }

    pub fn callback_errors(&self) -> u64 {
        self.callback_errors.load(Ordering::Relaxed)
    }

    pub fn status(&self) -> DiscoveryStatus {
        DiscoveryStatus {
            running: self.is_running(),
            factory_address: self.factory_address.clone(),
            relations: self.relations_read().by_token.len(),
            listeners: usize::try_from(self.listeners.load(Ordering::Relaxed)).unwrap_or(usize::MAX),
            callback_errors: self.callback_errors(),
            registry: self.registry.status(),
            cache: self.cache.status(),
        }
    }
}

impl Drop for DiscoveryCoordinator {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
