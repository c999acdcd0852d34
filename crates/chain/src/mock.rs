//! Scripted in-memory chain for tests.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use alloy::json_abi::JsonAbi;
use alloy::primitives::Address;
use async_trait::async_trait;
use futures::StreamExt;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::source::{
    ChainError, ChainSource, EventStream, PresaleState, RawEvent, RawRow, SliceResult,
};

/// A call the mock received, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockCall {
    BlockNumber,
    FetchLogs { address: Address, from: u64, to: u64 },
    Subscribe { address: Address },
    TotalCount,
    GetSlice { offset: u64, limit: u64 },
    GetByCreator { creator: Address, offset: u64, limit: u64 },
    PairDetails { token: Address },
    PresaleState { presale: Address },
}

type PushSender = mpsc::UnboundedSender<Result<RawEvent, ChainError>>;

struct MockState {
    head: u64,
    push_supported: bool,
    logs: Vec<(Address, u64, RawEvent)>,
    subscribe_failures: VecDeque<ChainError>,
    always_fail_subscribe: Option<ChainError>,
    fetch_failures: VecDeque<ChainError>,
    live: HashMap<Address, Vec<PushSender>>,
    rows: Vec<RawRow>,
    creator_rows: HashMap<Address, Vec<RawRow>>,
    total: Option<Result<u64, ChainError>>,
    reported_total: Option<u64>,
    slice_error: Option<ChainError>,
    details: HashMap<Address, Result<RawRow, ChainError>>,
    presales: HashMap<Address, Result<PresaleState, ChainError>>,
    call_delay: Option<Duration>,
    subscribe_delay: Option<Duration>,
    calls: Vec<MockCall>,
}

/// Scripted [`ChainSource`]. Every knob defaults to the happy path.
pub struct MockSource {
    state: Mutex<MockState>,
}

impl Default for MockSource {
    fn default() -> Self {
        Self::new()
    }
}

impl MockSource {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MockState {
                head: 0,
                push_supported: true,
                logs: Vec::new(),
                subscribe_failures: VecDeque::new(),
                always_fail_subscribe: None,
                fetch_failures: VecDeque::new(),
                live: HashMap::new(),
                rows: Vec::new(),
                creator_rows: HashMap::new(),
                total: None,
                reported_total: None,
                slice_error: None,
                details: HashMap::new(),
                presales: HashMap::new(),
                call_delay: None,
                subscribe_delay: None,
                calls: Vec::new(),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_head(&self, block: u64) {
        self.state().head = block;
    }

    pub fn set_push_supported(&self, supported: bool) {
        self.state().push_supported = supported;
    }

    /// Record a historical log visible to `fetch_logs`.
    pub fn add_log(&self, address: Address, block: u64, event: Value) {
        self.state().logs.push((address, block, RawEvent::new(event)));
    }

    /// Deliver a log to every live subscription on `address`. Returns how many received it.
    pub fn emit(&self, address: Address, event: Value) -> usize {
        let mut state = self.state();
        let Some(senders) = state.live.get_mut(&address) else {
            return 0;
        };
        senders.retain(|tx| !tx.is_closed());
        senders
            .iter()
            .filter(|tx| tx.send(Ok(RawEvent::new(event.clone()))).is_ok())
            .count()
    }

    /// Push an error into every live subscription on `address`.
    pub fn emit_error(&self, address: Address, err: ChainError) {
        if let Some(senders) = self.state().live.get(&address) {
            for tx in senders {
                let _ = tx.send(Err(err.clone()));
            }
        }
    }

    /// End every live stream on `address`, as a dropped connection would.
    pub fn disconnect(&self, address: Address) {
        self.state().live.remove(&address);
    }

    pub fn live_subscriptions(&self, address: Address) -> usize {
        self.state()
            .live
            .get(&address)
            .map_or(0, |senders| senders.iter().filter(|tx| !tx.is_closed()).count())
    }

    /// Fail the next subscribe calls with these errors, in order.
    pub fn fail_next_subscribes(&self, errors: impl IntoIterator<Item = ChainError>) {
        self.state().subscribe_failures.extend(errors);
    }

    pub fn fail_all_subscribes(&self, err: Option<ChainError>) {
        self.state().always_fail_subscribe = err;
    }

    pub fn fail_next_fetches(&self, errors: impl IntoIterator<Item = ChainError>) {
        self.state().fetch_failures.extend(errors);
    }

    pub fn set_rows(&self, rows: Vec<RawRow>) {
        self.state().rows = rows;
    }

    pub fn set_creator_rows(&self, creator: Address, rows: Vec<RawRow>) {
        self.state().creator_rows.insert(creator, rows);
    }

    /// Override what `total_count` answers. `None` means "the number of rows".
    pub fn set_total(&self, total: Option<Result<u64, ChainError>>) {
        self.state().total = total;
    }

    /// Total reported alongside slices. `None` means "the number of rows".
    pub fn set_reported_total(&self, total: Option<u64>) {
        self.state().reported_total = total;
    }

    pub fn set_slice_error(&self, err: Option<ChainError>) {
        self.state().slice_error = err;
    }

    pub fn set_details(&self, token: Address, details: Result<RawRow, ChainError>) {
        self.state().details.insert(token, details);
    }

    /// Answer for `presale_state` on `presale`. Unset presales revert.
    pub fn set_presale(&self, presale: Address, state: Result<PresaleState, ChainError>) {
        self.state().presales.insert(presale, state);
    }

    /// Delay every view call by this much.
    pub fn set_call_delay(&self, delay: Option<Duration>) {
        self.state().call_delay = delay;
    }

    /// Hold every subscribe call open this long before it resolves.
    pub fn set_subscribe_delay(&self, delay: Option<Duration>) {
        self.state().subscribe_delay = delay;
    }

    pub fn calls(&self) -> Vec<MockCall> {
        self.state().calls.clone()
    }

    pub fn count_calls(&self, pred: impl Fn(&MockCall) -> bool) -> usize {
        self.state().calls.iter().filter(|c| pred(c)).count()
    }

    fn record(&self, call: MockCall) -> Option<Duration> {
        let mut state = self.state();
        state.calls.push(call);
        state.call_delay
    }

    async fn delay(&self, call: MockCall) {
        if let Some(delay) = self.record(call) {
            tokio::time::sleep(delay).await;
        }
    }
}

fn page(rows: &[RawRow], offset: u64, limit: u64) -> Vec<RawRow> {
    let start = usize::try_from(offset).unwrap_or(usize::MAX).min(rows.len());
    let end = start
        .saturating_add(usize::try_from(limit).unwrap_or(usize::MAX))
        .min(rows.len());
    rows[start..end].to_vec()
}

#[async_trait]
impl ChainSource for MockSource {
    async fn block_number(&self) -> Result<u64, ChainError> {
        self.record(MockCall::BlockNumber);
        Ok(self.state().head)
    }

    async fn fetch_logs(
        &self,
        address: Address,
        _abi: &JsonAbi,
        events: &[String],
        from: u64,
        to: u64,
    ) -> Result<Vec<RawEvent>, ChainError> {
        self.record(MockCall::FetchLogs { address, from, to });
        let mut state = self.state();
        if let Some(err) = state.fetch_failures.pop_front() {
            return Err(err);
        }
        Ok(state
            .logs
            .iter()
            .filter(|(a, block, _)| *a == address && (from..=to).contains(block))
            .filter(|(_, _, raw)| {
                let name = raw.payload().get("event").and_then(Value::as_str);
                events.is_empty() || name.is_none_or(|n| events.iter().any(|e| e == n))
            })
            .map(|(_, _, raw)| raw.clone())
            .collect())
    }

    async fn subscribe_logs(
        &self,
        address: Address,
        _abi: &JsonAbi,
        _events: &[String],
    ) -> Result<EventStream, ChainError> {
        self.record(MockCall::Subscribe { address });
        let delay = self.state().subscribe_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let mut state = self.state();
        if !state.push_supported {
            return Err(ChainError::Unsupported("mock push disabled".into()));
        }
        if let Some(err) = state.subscribe_failures.pop_front() {
            return Err(err);
        }
        if let Some(err) = state.always_fail_subscribe.clone() {
            return Err(err);
        }
        let (tx, rx) = mpsc::unbounded_channel();
        state.live.entry(address).or_default().push(tx);
        Ok(UnboundedReceiverStream::new(rx).boxed())
    }

    async fn total_count(&self, _factory: Address) -> Result<u64, ChainError> {
        self.delay(MockCall::TotalCount).await;
        let state = self.state();
        match &state.total {
            Some(total) => total.clone(),
            None => Ok(state.rows.len() as u64),
        }
    }

    async fn get_slice(
        &self,
        _factory: Address,
        offset: u64,
        limit: u64,
    ) -> Result<SliceResult, ChainError> {
        self.delay(MockCall::GetSlice { offset, limit }).await;
        let state = self.state();
        if let Some(err) = &state.slice_error {
            return Err(err.clone());
        }
        Ok(SliceResult {
            rows: page(&state.rows, offset, limit),
            total: Some(state.reported_total.unwrap_or(state.rows.len() as u64)),
        })
    }

    async fn get_by_creator(
        &self,
        _factory: Address,
        creator: Address,
        offset: u64,
        limit: u64,
    ) -> Result<SliceResult, ChainError> {
        self.delay(MockCall::GetByCreator { creator, offset, limit }).await;
        let state = self.state();
        if let Some(err) = &state.slice_error {
            return Err(err.clone());
        }
        let rows = state.creator_rows.get(&creator).cloned().unwrap_or_default();
        Ok(SliceResult {
            total: Some(rows.len() as u64),
            rows: page(&rows, offset, limit),
        })
    }

    async fn pair_details(&self, _factory: Address, token: Address) -> Result<RawRow, ChainError> {
        self.delay(MockCall::PairDetails { token }).await;
        self.state()
            .details
            .get(&token)
            .cloned()
            .unwrap_or_else(|| Err(ChainError::Reverted("pair not found".into())))
    }

    async fn presale_state(&self, presale: Address) -> Result<PresaleState, ChainError> {
        self.delay(MockCall::PresaleState { presale }).await;
        self.state()
            .presales
            .get(&presale)
            .cloned()
            .unwrap_or_else(|| Err(ChainError::Reverted("not a presale".into())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::primitives::address;
    use serde_json::json;

    const TOKEN: Address = address!("5aaeb6053f3e94c9b9a09f33669435e7ef1beaed");

    #[tokio::test]
    async fn emitted_events_reach_live_streams_until_disconnect() {
        let mock = MockSource::new();
        let abi = JsonAbi::default();
        let mut stream = mock.subscribe_logs(TOKEN, &abi, &[]).await.unwrap();

        assert_eq!(mock.emit(TOKEN, json!({"event": "Transfer"})), 1);
        let got = stream.next().await.unwrap().unwrap();
        assert_eq!(got.payload()["event"], "Transfer");

        mock.disconnect(TOKEN);
        assert!(stream.next().await.is_none());
        assert_eq!(mock.emit(TOKEN, json!({})), 0);
    }

    #[tokio::test]
    async fn scripted_subscribe_failures_are_consumed_in_order() {
        let mock = MockSource::new();
        let abi = JsonAbi::default();
        mock.fail_next_subscribes([ChainError::Transport("down".into())]);

        assert!(mock.subscribe_logs(TOKEN, &abi, &[]).await.is_err());
        assert!(mock.subscribe_logs(TOKEN, &abi, &[]).await.is_ok());
        assert_eq!(mock.count_calls(|c| matches!(c, MockCall::Subscribe { .. })), 2);
    }

    #[tokio::test]
    async fn logs_are_filtered_by_range_and_name() {
        let mock = MockSource::new();
        let abi = JsonAbi::default();
        mock.add_log(TOKEN, 5, json!({"event": "Transfer"}));
        mock.add_log(TOKEN, 9, json!({"event": "Approval"}));

        let all = mock.fetch_logs(TOKEN, &abi, &[], 0, 10).await.unwrap();
        assert_eq!(all.len(), 2);
        let only = mock
            .fetch_logs(TOKEN, &abi, &["Approval".into()], 0, 10)
            .await
            .unwrap();
        assert_eq!(only.len(), 1);
        assert!(mock.fetch_logs(TOKEN, &abi, &[], 6, 8).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn slices_clamp_to_rows() {
        let mock = MockSource::new();
        mock.set_rows((0..3).map(|i| RawRow::Tuple(vec![json!(i)])).collect());
        let slice = mock.get_slice(Address::ZERO, 2, 10).await.unwrap();
        assert_eq!(slice.rows.len(), 1);
        assert_eq!(slice.total, Some(3));
        assert!(mock.get_slice(Address::ZERO, 7, 10).await.unwrap().rows.is_empty());
    }
}
