//! Watched-contract registry: one subscription per address, delivered over a
//! push stream, block-range polling, or both.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use backon::{BackoffBuilder, ExponentialBuilder};
use futures::StreamExt;
use padwatch_chain::{Address, ChainError, ChainSource, EventStream, JsonAbi, RawEvent, abi, address, decoder};
use padwatch_core::{AppError, Settings, TransportMode, now_ms};
use padwatch_storage::models::ContractType;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct SubscriptionId(u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    Push,
    Poll,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionState {
    Registering,
    Active,
    Reconnecting,
    Failed,
}

/// One raw log handed to the subscriber.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub subscription: SubscriptionId,
    pub address: String,
    pub contract_type: ContractType,
    pub transport: Transport,
    pub event: RawEvent,
}

/// Lifecycle notifications for operators and tests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Notice {
    Active {
        id: SubscriptionId,
        address: String,
    },
    ReconnectAttempt {
        id: SubscriptionId,
        address: String,
        attempt: u32,
        max: u32,
        delay_ms: u64,
    },
    ReconnectSucceeded {
        id: SubscriptionId,
        address: String,
        attempts: u32,
    },
    MaxReconnectAttemptsReached {
        id: SubscriptionId,
        address: String,
        attempts: u32,
    },
    Failed {
        id: SubscriptionId,
        address: String,
        error: String,
    },
    PollError {
        id: SubscriptionId,
        address: String,
        error: String,
    },
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("invalid contract address `{0}`")]
    InvalidAddress(String),

    #[error("ABI error: {0}")]
    Abi(String),

    #[error("subscription failed: {0}")]
    Subscribe(#[from] ChainError),
}

impl From<RegistryError> for AppError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::Subscribe(e) => chain_app_error(e),
            other => AppError::InvalidInput(other.to_string()),
        }
    }
}

/// Service-level class of a chain failure.
pub(crate) fn chain_app_error(err: ChainError) -> AppError {
    match err {
        e if e.is_transient() => AppError::ChainUnavailable(e.to_string()),
        e @ (ChainError::InvalidAddress(_) | ChainError::Abi(_)) => AppError::InvalidInput(e.to_string()),
        e => AppError::Chain(e.to_string()),
    }
}

#[derive(Debug, Clone)]
pub struct RegistryConfig {
    pub mode: TransportMode,
    pub poll_interval: Duration,
    pub max_block_range: u64,
    pub reconnect_base_delay: Duration,
    pub reconnect_max_delay: Duration,
    pub max_reconnect_attempts: u32,
    pub subscribe_timeout: Duration,
    pub call_timeout: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self::from_settings(&Settings::default())
    }
}

impl RegistryConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            mode: settings.transport_mode,
            poll_interval: settings.poll_interval,
            max_block_range: settings.max_block_range.max(1),
            reconnect_base_delay: settings.reconnect_base_delay,
            reconnect_max_delay: settings.reconnect_max_delay,
            max_reconnect_attempts: settings.max_reconnect_attempts.max(1),
            subscribe_timeout: settings.subscribe_timeout,
            call_timeout: settings.view_call_timeout,
        }
    }
}

/// What to watch. Empty `event_names` means every event the ABI declares.
#[derive(Debug, Clone)]
pub struct WatchRequest {
    pub address: String,
    pub contract_type: ContractType,
    pub abi: Arc<JsonAbi>,
    pub event_names: Vec<String>,
    /// First block the poll transport scans; `None` starts at the current head.
    pub start_block: Option<u64>,
}

impl WatchRequest {
    pub fn new(address: impl Into<String>, contract_type: ContractType, abi: Arc<JsonAbi>) -> Self {
        Self {
            address: address.into(),
            contract_type,
            abi,
            event_names: Vec::new(),
            start_block: None,
        }
    }

    pub fn events<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.event_names = names.into_iter().map(Into::into).collect();
        self
    }

    pub fn from_block(mut self, block: u64) -> Self {
        self.start_block = Some(block);
        self
    }
}

/// Snapshot of one watched contract.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WatchedContract {
    pub subscription_id: SubscriptionId,
    pub address: String,
    pub contract_type: ContractType,
    pub event_names: Vec<String>,
    #[serde(skip)]
    pub abi: Arc<JsonAbi>,
    pub is_active: bool,
    pub state: SubscriptionState,
    pub registered_at_ms: i64,
    pub push: bool,
    pub poll: bool,
    pub reconnect_attempts: u32,
    pub last_scanned_block: Option<u64>,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryStatus {
    pub total: usize,
    pub active: usize,
    pub registering: usize,
    pub reconnecting: usize,
    pub failed: usize,
}

#[derive(Debug)]
struct LiveState {
    state: SubscriptionState,
    push: bool,
    poll: bool,
    reconnect_attempts: u32,
    last_scanned_block: Option<u64>,
    last_error: Option<String>,
}

struct Entry {
    ctx: TaskCtx,
    registered_at_ms: i64,
    tasks: Vec<JoinHandle<()>>,
}

impl Entry {
    fn snapshot(&self) -> WatchedContract {
        let live = self.ctx.live();
        WatchedContract {
            subscription_id: self.ctx.id,
            address: self.ctx.address.clone(),
            contract_type: self.ctx.contract_type,
            event_names: self.ctx.event_names.as_ref().clone(),
            abi: self.ctx.abi.clone(),
            is_active: live.state == SubscriptionState::Active,
            state: live.state,
            registered_at_ms: self.registered_at_ms,
            push: live.push,
            poll: live.poll,
            reconnect_attempts: live.reconnect_attempts,
            last_scanned_block: live.last_scanned_block,
            last_error: live.last_error.clone(),
        }
    }

    fn shutdown(self) {
        self.ctx.cancel.cancel();
        for task in self.tasks {
            task.abort();
        }
    }
}

/// Everything a subscription's background tasks need.
#[derive(Clone)]
struct TaskCtx {
    id: SubscriptionId,
    address: String,
    target: Address,
    contract_type: ContractType,
    abi: Arc<JsonAbi>,
    event_names: Arc<Vec<String>>,
    source: Arc<dyn ChainSource>,
    config: RegistryConfig,
    live: Arc<Mutex<LiveState>>,
    cancel: CancellationToken,
    sink: mpsc::Sender<Delivery>,
    notices: broadcast::Sender<Notice>,
}

impl TaskCtx {
    fn live(&self) -> MutexGuard<'_, LiveState> {
        self.live.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_state(&self, state: SubscriptionState) {
        self.live().state = state;
    }

    fn notify(&self, notice: Notice) {
        // No receivers is fine.
        let _ = self.notices.send(notice);
    }

    fn activate(&self) {
        let changed = {
            let mut live = self.live();
            let changed = live.state != SubscriptionState::Active;
            live.state = SubscriptionState::Active;
            changed
        };
        if changed {
            self.notify(Notice::Active {
                id: self.id,
                address: self.address.clone(),
            });
        }
    }

    /// Push is out of reconnect attempts. A running poll transport keeps the
    /// subscription alive on its own; otherwise it fails.
    fn give_up_push(&self) {
        let mut live = self.live();
        live.push = false;
        live.state = if !live.poll {
            SubscriptionState::Failed
        } else if live.last_scanned_block.is_some() {
            SubscriptionState::Active
        } else {
            SubscriptionState::Registering
        };
    }

    fn fail(&self, error: &ChainError) {
        {
            let mut live = self.live();
            live.state = SubscriptionState::Failed;
            live.last_error = Some(error.to_string());
        }
        tracing::error!(address = %self.address, error = %error, "Subscription failed");
        self.notify(Notice::Failed {
            id: self.id,
            address: self.address.clone(),
            error: error.to_string(),
        });
    }

    async fn subscribe(&self) -> Result<EventStream, ChainError> {
        let attempt = self
            .source
            .subscribe_logs(self.target, &self.abi, &self.event_names);
        match tokio::time::timeout(self.config.subscribe_timeout, attempt).await {
            Ok(result) => result,
            Err(_) => Err(ChainError::Timeout(self.config.subscribe_timeout)),
        }
    }

    /// Hand one raw log to the sink. Returns `false` once the subscription is torn down.
    async fn deliver(&self, event: RawEvent, transport: Transport) -> bool {
        if self.cancel.is_cancelled() {
            return false;
        }
        let delivery = Delivery {
            subscription: self.id,
            address: self.address.clone(),
            contract_type: self.contract_type,
            transport,
            event,
        };
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            sent = self.sink.send(delivery) => sent.is_ok(),
        }
    }

    /// Stream push deliveries, reconnecting with backoff until cancelled or failed.
    async fn run_push(self, mut stream: Option<EventStream>) {
        let max = self.config.max_reconnect_attempts;
        let backoff_builder = ExponentialBuilder::default()
            .with_min_delay(self.config.reconnect_base_delay)
            .with_max_delay(self.config.reconnect_max_delay)
            .with_max_times(max.saturating_sub(1) as usize)
            .with_jitter();
        let mut backoff_iter = backoff_builder.build();
        let mut failures: u32 = if stream.is_some() { 0 } else { 1 };

        loop {
            if let Some(mut events) = stream.take() {
                if failures > 0 {
                    self.notify(Notice::ReconnectSucceeded {
                        id: self.id,
                        address: self.address.clone(),
                        attempts: failures,
                    });
                    tracing::info!(address = %self.address, attempts = failures, "Subscription re-established");
                }
                backoff_iter = backoff_builder.build();
                {
                    let mut live = self.live();
                    live.reconnect_attempts = 0;
                    live.last_error = None;
                }
                self.activate();

                let error = loop {
                    let next = tokio::select! {
                        _ = self.cancel.cancelled() => return,
                        next = events.next() => next,
                    };
                    match next {
                        Some(Ok(raw)) => {
                            if !self.deliver(raw, Transport::Push).await {
                                return;
                            }
                        }
                        Some(Err(e)) if e.is_transient() => break e,
                        Some(Err(e)) => {
                            self.fail(&e);
                            return;
                        }
                        None => break ChainError::Disconnected("event stream ended".into()),
                    }
                };
                tracing::warn!(address = %self.address, error = %error, "Push transport dropped");
                self.live().last_error = Some(error.to_string());
                failures = 1;
            }

            if self.cancel.is_cancelled() {
                return;
            }
            self.live().reconnect_attempts = failures;

            let Some(delay) = backoff_iter.next() else {
                self.give_up_push();
                tracing::error!(address = %self.address, attempts = failures, "Max reconnect attempts reached");
                self.notify(Notice::MaxReconnectAttemptsReached {
                    id: self.id,
                    address: self.address.clone(),
                    attempts: failures,
                });
                return;
            };

            self.set_state(SubscriptionState::Reconnecting);
            self.notify(Notice::ReconnectAttempt {
                id: self.id,
                address: self.address.clone(),
                attempt: failures,
                max,
                delay_ms: u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            });
            tracing::info!(
                address = %self.address,
                attempt = failures,
                backoff_ms = %delay.as_millis(),
                "Reconnecting push transport"
            );

            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }

            match self.subscribe().await {
                _ if self.cancel.is_cancelled() => return,
                Ok(events) => stream = Some(events),
                Err(e) if e.is_transient() => {
                    tracing::warn!(address = %self.address, error = %e, "Reconnect attempt failed");
                    self.live().last_error = Some(e.to_string());
                    failures += 1;
                }
                Err(e) => {
                    self.fail(&e);
                    return;
                }
            }
        }
    }

    /// Poll for logs in fixed ticks, scanning only blocks not seen before.
    async fn run_poll(self) {
        let mut ticker = tokio::time::interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = ticker.tick() => {}
            }
            match self.poll_once().await {
                Ok(_) => {}
                Err(e) if e.is_transient() => {
                    tracing::warn!(address = %self.address, error = %e, "Poll failed, retrying next tick");
                    self.live().last_error = Some(e.to_string());
                    self.notify(Notice::PollError {
                        id: self.id,
                        address: self.address.clone(),
                        error: e.to_string(),
                    });
                }
                Err(e) => {
                    let push_alive = {
                        let live = self.live();
                        live.push && live.state != SubscriptionState::Failed
                    };
                    if push_alive {
                        tracing::error!(address = %self.address, error = %e, "Poll transport stopped");
                        self.live().poll = false;
                        self.notify(Notice::PollError {
                            id: self.id,
                            address: self.address.clone(),
                            error: e.to_string(),
                        });
                    } else {
                        self.fail(&e);
                    }
                    return;
                }
            }
        }
    }

    async fn call<T>(
        &self,
        fut: impl std::future::Future<Output = Result<T, ChainError>>,
    ) -> Result<T, ChainError> {
        tokio::time::timeout(self.config.call_timeout, fut)
            .await
            .unwrap_or(Err(ChainError::Timeout(self.config.call_timeout)))
    }

    /// One poll pass. Returns how many logs were delivered.
    async fn poll_once(&self) -> Result<usize, ChainError> {
        let head = self.call(self.source.block_number()).await?;
        let last = self.live().last_scanned_block;
        let Some(last) = last else {
            // First pass only records the baseline.
            self.live().last_scanned_block = Some(head);
            self.mark_polled();
            return Ok(0);
        };
        if head <= last {
            self.mark_polled();
            return Ok(0);
        }

        let mut delivered = 0;
        let mut from = last + 1;
        while from <= head {
            let to = from
                .saturating_add(self.config.max_block_range - 1)
                .min(head);
            let logs = self
                .call(self.source.fetch_logs(self.target, &self.abi, &self.event_names, from, to))
                .await?;
            if self.cancel.is_cancelled() {
                return Ok(delivered);
            }
            for raw in logs {
                if !self.deliver(raw, Transport::Poll).await {
                    return Ok(delivered);
                }
                delivered += 1;
            }
            self.live().last_scanned_block = Some(to);
            from = to + 1;
        }
        if delivered > 0 {
            tracing::debug!(address = %self.address, delivered, head, "Polled logs");
        }
        self.mark_polled();
        Ok(delivered)
    }

    /// Record where polling starts and confirm the node answers.
    async fn baseline(&self) -> Result<(), ChainError> {
        let head = self.call(self.source.block_number()).await?;
        {
            let mut live = self.live();
            if live.last_scanned_block.is_none() {
                live.last_scanned_block = Some(head);
            }
        }
        self.mark_polled();
        Ok(())
    }

    /// A successful poll makes a poll-only subscription active.
    fn mark_polled(&self) {
        let poll_only = {
            let live = self.live();
            !live.push && live.state != SubscriptionState::Failed
        };
        if poll_only {
            self.activate();
        }
    }
}

/// Tracks watched contracts and owns their delivery tasks.
pub struct SubscriptionRegistry {
    source: Arc<dyn ChainSource>,
    config: RegistryConfig,
    entries: Mutex<HashMap<String, Entry>>,
    next_id: AtomicU64,
    notices: broadcast::Sender<Notice>,
    cancel: CancellationToken,
}

impl SubscriptionRegistry {
    pub fn new(source: Arc<dyn ChainSource>, config: RegistryConfig) -> Self {
        let (notices, _) = broadcast::channel(256);
        Self {
            source,
            config,
            entries: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            notices,
            cancel: CancellationToken::new(),
        }
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<String, Entry>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn notices(&self) -> broadcast::Receiver<Notice> {
        self.notices.subscribe()
    }

    /// Start watching a contract. Watching an address that is already watched
    /// returns the existing id; a `Failed` subscription is replaced.
    pub async fn watch(
        &self,
        request: WatchRequest,
        sink: mpsc::Sender<Delivery>,
    ) -> Result<SubscriptionId, RegistryError> {
        let target = address::parse_address(&request.address)
            .map_err(|_| RegistryError::InvalidAddress(request.address.clone()))?;
        let canonical = address::to_canonical(target);

        let event_names = if request.event_names.is_empty() {
            abi::event_names(&request.abi)
        } else {
            request.event_names.clone()
        };
        if event_names.is_empty() {
            return Err(RegistryError::Abi(format!("ABI for {canonical} declares no events")));
        }
        decoder::selectors(&request.abi, &event_names).map_err(|e| RegistryError::Abi(e.to_string()))?;

        let push = self.config.mode.uses_push();
        let poll = self.config.mode.uses_poll();

        let ctx = {
            let mut entries = self.entries();
            if let Some(existing) = entries.get(&canonical) {
                if existing.ctx.live().state != SubscriptionState::Failed {
                    return Ok(existing.ctx.id);
                }
            }
            if let Some(stale) = entries.remove(&canonical) {
                tracing::info!(address = %canonical, "Replacing failed subscription");
                stale.shutdown();
            }

            let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
            let ctx = TaskCtx {
                id,
                address: canonical.clone(),
                target,
                contract_type: request.contract_type,
                abi: request.abi.clone(),
                event_names: Arc::new(event_names),
                source: self.source.clone(),
                config: self.config.clone(),
                live: Arc::new(Mutex::new(LiveState {
                    state: SubscriptionState::Registering,
                    push,
                    poll,
                    reconnect_attempts: 0,
                    last_scanned_block: request.start_block.map(|b| b.saturating_sub(1)),
                    last_error: None,
                })),
                cancel: self.cancel.child_token(),
                sink,
                notices: self.notices.clone(),
            };
            entries.insert(
                canonical.clone(),
                Entry {
                    ctx: ctx.clone(),
                    registered_at_ms: now_ms(),
                    tasks: Vec::new(),
                },
            );
            ctx
        };

        let mut tasks = Vec::new();
        let mut poll = poll;
        if push {
            match ctx.subscribe().await {
                Ok(stream) => {
                    ctx.live().reconnect_attempts = 0;
                    ctx.activate();
                    tasks.push(tokio::spawn(ctx.clone().run_push(Some(stream))));
                }
                Err(ChainError::Unsupported(reason)) => {
                    tracing::info!(address = %canonical, reason, "Push unavailable, polling instead");
                    let mut live = ctx.live();
                    live.push = false;
                    live.poll = true;
                    poll = true;
                }
                Err(e) if e.is_transient() => {
                    tracing::warn!(address = %canonical, error = %e, "Initial subscribe failed, will retry");
                    ctx.live().last_error = Some(e.to_string());
                    tasks.push(tokio::spawn(ctx.clone().run_push(None)));
                }
                Err(e) => {
                    self.discard(&canonical, ctx.id);
                    tracing::error!(address = %canonical, error = %e, "Subscribe rejected");
                    return Err(RegistryError::Subscribe(e));
                }
            }
        }
        let push_enabled = ctx.live().push;
        if poll && !push_enabled {
            match ctx.baseline().await {
                Ok(()) => {}
                Err(e) if e.is_transient() => {
                    tracing::warn!(address = %canonical, error = %e, "Initial poll baseline failed, will retry");
                    ctx.live().last_error = Some(e.to_string());
                }
                Err(e) => {
                    tasks.iter().for_each(JoinHandle::abort);
                    self.discard(&canonical, ctx.id);
                    tracing::error!(address = %canonical, error = %e, "Poll baseline rejected");
                    return Err(RegistryError::Subscribe(e));
                }
            }
        }
        if poll {
            tasks.push(tokio::spawn(ctx.clone().run_poll()));
        }

        let mut entries = self.entries();
        match entries.get_mut(&canonical) {
            Some(entry) if entry.ctx.id == ctx.id => entry.tasks.extend(tasks),
            // Unwatched while we were subscribing.
            _ => {
                ctx.cancel.cancel();
                tasks.iter().for_each(JoinHandle::abort);
            }
        }
        drop(entries);

        tracing::info!(
            address = %canonical,
            contract_type = %ctx.contract_type,
            id = %ctx.id,
            events = ctx.event_names.len(),
            "Watching contract"
        );
        Ok(ctx.id)
    }

    fn discard(&self, address: &str, id: SubscriptionId) {
        let mut entries = self.entries();
        if entries.get(address).is_some_and(|e| e.ctx.id == id) {
            if let Some(entry) = entries.remove(address) {
                entry.shutdown();
            }
        }
    }

    /// Stop a subscription. Returns whether it existed.
    pub fn unwatch(&self, id: SubscriptionId) -> bool {
        let mut entries = self.entries();
        let Some(address) = entries
            .iter()
            .find(|(_, e)| e.ctx.id == id)
            .map(|(a, _)| a.clone())
        else {
            return false;
        };
        if let Some(entry) = entries.remove(&address) {
            entry.shutdown();
            tracing::info!(address = %address, id = %id, "Unwatched contract");
        }
        true
    }

    pub fn unwatch_all(&self) -> usize {
        let drained: Vec<Entry> = self.entries().drain().map(|(_, e)| e).collect();
        let count = drained.len();
        drained.into_iter().for_each(Entry::shutdown);
        if count > 0 {
            tracing::info!(count, "Unwatched all contracts");
        }
        count
    }

    pub fn is_watched(&self, address: &str) -> bool {
        address::canonical(address).is_ok_and(|a| self.entries().contains_key(&a))
    }

    pub fn get(&self, address: &str) -> Option<WatchedContract> {
        let canonical = address::canonical(address).ok()?;
        self.entries().get(&canonical).map(Entry::snapshot)
    }

    pub fn contracts(&self) -> Vec<WatchedContract> {
        let mut all: Vec<WatchedContract> = self.entries().values().map(Entry::snapshot).collect();
        all.sort_by_key(|c| c.subscription_id);
        all
    }

    pub fn status(&self) -> RegistryStatus {
        let mut status = RegistryStatus::default();
        for contract in self.contracts() {
            status.total += 1;
            match contract.state {
                SubscriptionState::Active => status.active += 1,
                SubscriptionState::Registering => status.registering += 1,
                SubscriptionState::Reconnecting => status.reconnecting += 1,
                SubscriptionState::Failed => status.failed += 1,
            }
        }
        status
    }
}

impl Drop for SubscriptionRegistry {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use padwatch_chain::ContractAbis;
    use padwatch_chain::mock::{MockCall, MockSource};
    use serde_json::json;

    const TOKEN: &str = "0x5aAeb6053F3E94C9b9A09f33669435E7Ef1BeAed";

    fn token_addr() -> Address {
        address::parse_address(TOKEN).unwrap()
    }

    fn config(mode: TransportMode) -> RegistryConfig {
        RegistryConfig {
            mode,
            poll_interval: Duration::from_millis(20),
            max_block_range: 100,
            reconnect_base_delay: Duration::from_millis(1),
            reconnect_max_delay: Duration::from_millis(5),
            max_reconnect_attempts: 3,
            subscribe_timeout: Duration::from_millis(500),
            call_timeout: Duration::from_millis(500),
        }
    }

    fn token_request() -> WatchRequest {
        let abis = ContractAbis::builtin().unwrap();
        WatchRequest::new(TOKEN.to_lowercase(), ContractType::Token, Arc::new(abis.token))
            .events(["Transfer", "Approval"])
    }

    async fn wait_until(mut cond: impl FnMut() -> bool) {
        for _ in 0..200 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn watch_is_idempotent_per_address() {
        let mock = Arc::new(MockSource::new());
        let registry = SubscriptionRegistry::new(mock.clone(), config(TransportMode::Push));
        let (tx, _rx) = mpsc::channel(16);

        let first = registry.watch(token_request(), tx.clone()).await.unwrap();
        let second = registry.watch(token_request(), tx).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(registry.contracts().len(), 1);
        assert_eq!(mock.count_calls(|c| matches!(c, MockCall::Subscribe { .. })), 1);
        assert_eq!(mock.live_subscriptions(token_addr()), 1);
        assert!(registry.get(TOKEN).unwrap().is_active);
    }

    #[tokio::test]
    async fn bad_requests_are_terminal() {
        let mock = Arc::new(MockSource::new());
        let registry = SubscriptionRegistry::new(mock.clone(), config(TransportMode::Push));
        let (tx, _rx) = mpsc::channel(16);

        let bad_addr = WatchRequest { address: "0x1234".into(), ..token_request() };
        assert!(matches!(
            registry.watch(bad_addr, tx.clone()).await,
            Err(RegistryError::InvalidAddress(_))
        ));
        let bad_event = token_request().events(["TokensPurchased"]);
        assert!(matches!(registry.watch(bad_event, tx).await, Err(RegistryError::Abi(_))));
        assert!(mock.calls().is_empty());
        assert!(registry.contracts().is_empty());
    }

    #[tokio::test]
    async fn terminal_subscribe_error_removes_the_entry() {
        let mock = Arc::new(MockSource::new());
        mock.fail_next_subscribes([ChainError::Rpc("method not found".into())]);
        let registry = SubscriptionRegistry::new(mock.clone(), config(TransportMode::Push));
        let (tx, _rx) = mpsc::channel(16);

        assert!(matches!(
            registry.watch(token_request(), tx).await,
            Err(RegistryError::Subscribe(ChainError::Rpc(_)))
        ));
        assert!(!registry.is_watched(TOKEN));
    }

    #[tokio::test]
    async fn push_deliveries_carry_subscription_context() {
        let mock = Arc::new(MockSource::new());
        let registry = SubscriptionRegistry::new(mock.clone(), config(TransportMode::Push));
        let (tx, mut rx) = mpsc::channel(16);
        let id = registry.watch(token_request(), tx).await.unwrap();

        mock.emit(token_addr(), json!({"event": "Transfer", "logIndex": 0}));
        let delivery = rx.recv().await.unwrap();
        assert_eq!(delivery.subscription, id);
        assert_eq!(delivery.address, TOKEN);
        assert_eq!(delivery.contract_type, ContractType::Token);
        assert_eq!(delivery.transport, Transport::Push);
    }

    #[tokio::test]
    async fn reconnect_gives_up_after_max_attempts_with_one_notice() {
        let mock = Arc::new(MockSource::new());
        mock.fail_all_subscribes(Some(ChainError::Transport("ECONNRESET".into())));
        let registry = SubscriptionRegistry::new(mock.clone(), config(TransportMode::Push));
        let mut notices = registry.notices();
        let (tx, _rx) = mpsc::channel(16);

        registry.watch(token_request(), tx).await.unwrap();
        wait_until(|| registry.get(TOKEN).unwrap().state == SubscriptionState::Failed).await;
        tokio::time::sleep(Duration::from_millis(30)).await;

        // Three consecutive failures: the first subscribe plus two reconnects.
        assert_eq!(mock.count_calls(|c| matches!(c, MockCall::Subscribe { .. })), 3);
        let mut terminal = 0;
        let mut attempts = Vec::new();
        while let Ok(notice) = notices.try_recv() {
            match notice {
                Notice::MaxReconnectAttemptsReached { attempts, .. } => {
                    assert_eq!(attempts, 3);
                    terminal += 1;
                }
                Notice::ReconnectAttempt { attempt, .. } => attempts.push(attempt),
                _ => {}
            }
        }
        assert_eq!(terminal, 1);
        assert_eq!(attempts, vec![1, 2]);
        assert!(!registry.get(TOKEN).unwrap().is_active);
    }

    #[tokio::test]
    async fn dropped_stream_reconnects_and_resets_attempts() {
        let mock = Arc::new(MockSource::new());
        let registry = SubscriptionRegistry::new(mock.clone(), config(TransportMode::Push));
        let mut notices = registry.notices();
        let (tx, mut rx) = mpsc::channel(16);
        registry.watch(token_request(), tx).await.unwrap();

        mock.fail_next_subscribes([ChainError::Disconnected("socket closed".into())]);
        mock.disconnect(token_addr());
        wait_until(|| {
            mock.live_subscriptions(token_addr()) == 1 && registry.get(TOKEN).unwrap().is_active
        })
        .await;

        let mut succeeded = false;
        while let Ok(notice) = notices.try_recv() {
            if let Notice::ReconnectSucceeded { attempts, .. } = notice {
                assert_eq!(attempts, 2);
                succeeded = true;
            }
        }
        assert!(succeeded);
        let watched = registry.get(TOKEN).unwrap();
        assert!(watched.is_active);
        assert_eq!(watched.reconnect_attempts, 0);

        mock.emit(token_addr(), json!({"event": "Approval", "logIndex": 1}));
        assert_eq!(rx.recv().await.unwrap().event.payload()["event"], "Approval");
    }

    #[tokio::test]
    async fn unsupported_push_falls_back_to_delta_polling() {
        let mock = Arc::new(MockSource::new());
        mock.set_push_supported(false);
        mock.set_head(10);
        let registry = SubscriptionRegistry::new(mock.clone(), config(TransportMode::Push));
        let (tx, mut rx) = mpsc::channel(16);
        registry.watch(token_request(), tx).await.unwrap();

        wait_until(|| registry.get(TOKEN).unwrap().last_scanned_block == Some(10)).await;
        mock.add_log(token_addr(), 12, json!({"event": "Transfer", "logIndex": 0}));
        mock.set_head(15);
        let delivery = rx.recv().await.unwrap();
        assert_eq!(delivery.transport, Transport::Poll);

        wait_until(|| registry.get(TOKEN).unwrap().last_scanned_block == Some(15)).await;
        mock.set_head(20);
        wait_until(|| registry.get(TOKEN).unwrap().last_scanned_block == Some(20)).await;

        let ranges: Vec<(u64, u64)> = mock
            .calls()
            .into_iter()
            .filter_map(|c| match c {
                MockCall::FetchLogs { from, to, .. } => Some((from, to)),
                _ => None,
            })
            .collect();
        assert_eq!(ranges, vec![(11, 15), (16, 20)]);
        let watched = registry.get(TOKEN).unwrap();
        assert!(!watched.push && watched.poll && watched.is_active);
    }

    #[tokio::test]
    async fn poll_from_start_block_is_chunked() {
        let mock = Arc::new(MockSource::new());
        mock.set_head(250);
        let registry = SubscriptionRegistry::new(mock.clone(), config(TransportMode::Poll));
        let (tx, _rx) = mpsc::channel(16);
        registry.watch(token_request().from_block(1), tx).await.unwrap();

        wait_until(|| registry.get(TOKEN).unwrap().last_scanned_block == Some(250)).await;
        let ranges: Vec<(u64, u64)> = mock
            .calls()
            .into_iter()
            .filter_map(|c| match c {
                MockCall::FetchLogs { from, to, .. } => Some((from, to)),
                _ => None,
            })
            .collect();
        assert_eq!(ranges, vec![(1, 100), (101, 200), (201, 250)]);
    }

    #[tokio::test]
    async fn failed_chunk_is_rescanned_next_tick() {
        let mock = Arc::new(MockSource::new());
        mock.set_head(5);
        mock.fail_next_fetches([ChainError::Timeout(Duration::from_millis(1))]);
        let registry = SubscriptionRegistry::new(mock.clone(), config(TransportMode::Poll));
        let (tx, _rx) = mpsc::channel(16);
        registry.watch(token_request().from_block(3), tx).await.unwrap();

        wait_until(|| registry.get(TOKEN).unwrap().last_scanned_block == Some(5)).await;
        let fetches = mock.count_calls(|c| matches!(c, MockCall::FetchLogs { from: 3, to: 5, .. }));
        assert_eq!(fetches, 2);
    }

    #[tokio::test]
    async fn both_transports_deliver_the_same_log() {
        let mock = Arc::new(MockSource::new());
        mock.set_head(1);
        let registry = SubscriptionRegistry::new(mock.clone(), config(TransportMode::Both));
        let (tx, mut rx) = mpsc::channel(16);
        registry.watch(token_request().from_block(2), tx).await.unwrap();

        let log = json!({"event": "Transfer", "logIndex": 4, "blockNumber": 2});
        mock.emit(token_addr(), log.clone());
        mock.add_log(token_addr(), 2, log);
        mock.set_head(2);

        let a = rx.recv().await.unwrap();
        let b = rx.recv().await.unwrap();
        assert_ne!(a.transport, b.transport);
        assert_eq!(a.event, b.event);
    }

    #[tokio::test]
    async fn unwatch_stops_deliveries() {
        let mock = Arc::new(MockSource::new());
        let registry = SubscriptionRegistry::new(mock.clone(), config(TransportMode::Push));
        let (tx, mut rx) = mpsc::channel(16);
        let id = registry.watch(token_request(), tx).await.unwrap();

        assert!(registry.unwatch(id));
        assert!(!registry.unwatch(id));
        wait_until(|| mock.live_subscriptions(token_addr()) == 0).await;
        assert_eq!(mock.emit(token_addr(), json!({"event": "Transfer"})), 0);
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn failed_subscription_can_be_rewatched() {
        let mock = Arc::new(MockSource::new());
        mock.fail_all_subscribes(Some(ChainError::Transport("down".into())));
        let registry = SubscriptionRegistry::new(mock.clone(), config(TransportMode::Push));
        let (tx, _rx) = mpsc::channel(16);
        let first = registry.watch(token_request(), tx.clone()).await.unwrap();
        wait_until(|| registry.status().failed == 1).await;

        mock.fail_all_subscribes(None);
        let second = registry.watch(token_request(), tx).await.unwrap();
        assert_ne!(first, second);
        assert_eq!(registry.status().active, 1);
    }

    #[tokio::test]
    async fn watch_returns_with_the_subscription_active() {
        let mock = Arc::new(MockSource::new());
        let registry = SubscriptionRegistry::new(mock.clone(), config(TransportMode::Push));
        let (tx, _rx) = mpsc::channel(16);
        registry.watch(token_request(), tx).await.unwrap();
        let watched = registry.get(TOKEN).unwrap();
        assert!(watched.is_active);
        assert_eq!(watched.reconnect_attempts, 0);

        mock.set_head(42);
        let poller = SubscriptionRegistry::new(mock.clone(), config(TransportMode::Poll));
        let (tx, _rx) = mpsc::channel(16);
        poller.watch(token_request(), tx).await.unwrap();
        let watched = poller.get(TOKEN).unwrap();
        assert!(watched.is_active);
        assert_eq!(watched.last_scanned_block, Some(42));
    }

    #[tokio::test]
    async fn concurrent_watches_share_one_subscription() {
        let mock = Arc::new(MockSource::new());
        mock.set_subscribe_delay(Some(Duration::from_millis(30)));
        let registry = SubscriptionRegistry::new(mock.clone(), config(TransportMode::Push));
        let (tx, _rx) = mpsc::channel(16);

        let (a, b) = tokio::join!(
            registry.watch(token_request(), tx.clone()),
            registry.watch(token_request(), tx.clone()),
        );
        assert_eq!(a.unwrap(), b.unwrap());
        assert_eq!(registry.contracts().len(), 1);
        assert_eq!(mock.count_calls(|c| matches!(c, MockCall::Subscribe { .. })), 1);
        assert_eq!(mock.live_subscriptions(token_addr()), 1);
    }

    #[tokio::test]
    async fn exhausted_push_falls_back_to_running_poll() {
        let mock = Arc::new(MockSource::new());
        mock.set_head(1);
        mock.fail_all_subscribes(Some(ChainError::Transport("ECONNRESET".into())));
        let registry = SubscriptionRegistry::new(mock.clone(), config(TransportMode::Both));
        let mut notices = registry.notices();
        let (tx, mut rx) = mpsc::channel(16);
        registry.watch(token_request(), tx).await.unwrap();

        wait_until(|| !registry.get(TOKEN).unwrap().push).await;
        wait_until(|| registry.get(TOKEN).unwrap().is_active).await;
        let watched = registry.get(TOKEN).unwrap();
        assert!(watched.poll);
        assert_eq!(watched.state, SubscriptionState::Active);
        assert_eq!(registry.status().failed, 0);

        mock.add_log(token_addr(), 2, json!({"event": "Transfer", "logIndex": 0}));
        mock.set_head(2);
        assert_eq!(rx.recv().await.unwrap().transport, Transport::Poll);

        let mut terminal = 0;
        while let Ok(notice) = notices.try_recv() {
            if matches!(notice, Notice::MaxReconnectAttemptsReached { .. }) {
                terminal += 1;
            }
        }
        assert_eq!(terminal, 1);
    }

    #[test]
    fn registry_errors_keep_their_failure_class() {
        let bad: AppError = RegistryError::InvalidAddress("0x12".into()).into();
        assert!(matches!(bad, AppError::InvalidInput(_)));

        let flaky: AppError = RegistryError::Subscribe(ChainError::Timeout(Duration::from_secs(1))).into();
        assert!(flaky.is_retryable());

        let dead: AppError = RegistryError::Subscribe(ChainError::Rpc("filter not found".into())).into();
        assert!(matches!(dead, AppError::Chain(_)));
    }
}
