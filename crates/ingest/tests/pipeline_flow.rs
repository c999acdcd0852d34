use std::sync::Arc;
use std::time::Duration;

use padwatch_chain::mock::{MockCall, MockSource};
use padwatch_chain::{ContractAbis, RawRow, address};
use padwatch_core::{Settings, TransportMode};
use padwatch_ingest::{ListOptions, Pipeline, SubscriptionState};
use padwatch_storage::models::{ContractType, EventFilter, QueryOptions, SortField, SortOrder};
use padwatch_storage::{BlobStore, FileBlobStore, MemoryBlobStore};
use serde_json::{Value, json};

const FACTORY: &str = "0xfB6916095ca1df60bB79Ce92cE3Ea74c37c5d359";
const TOKEN: &str = "0x5aAeb6053F3E94C9b9A09f33669435E7Ef1BeAed";
const PRESALE: &str = "0xdbF03B407c01E7cD3CBea99509d93f8DDDC8C6FB";
const CREATOR: &str = "0xD1220A0cf47c7B9Be7A2E6BA89F429762e7b9aDb";

fn settings(mode: TransportMode) -> Settings {
    Settings {
        factory_address: FACTORY.to_string(),
        transport_mode: mode,
        poll_interval: Duration::from_millis(20),
        reconnect_base_delay: Duration::from_millis(1),
        reconnect_max_delay: Duration::from_millis(5),
        ..Settings::default()
    }
}

fn pipeline(mock: &Arc<MockSource>, store: Arc<dyn BlobStore>, mode: TransportMode) -> Pipeline {
    let abis = ContractAbis::builtin().unwrap();
    Pipeline::with_parts(settings(mode), mock.clone(), store, &abis).unwrap()
}

fn pair_created(tx: &str, block: u64) -> Value {
    json!({
        "event": "TokenPresalePairCreated",
        "address": FACTORY.to_lowercase(),
        "blockNumber": block,
        "transactionHash": tx,
        "logIndex": 0,
        "args": {
            "token": TOKEN.to_lowercase(),
            "presale": PRESALE.to_lowercase(),
            "creator": CREATOR.to_lowercase(),
            "totalSupply": "1000000000000000000000000"
        }
    })
}

async fn eventually(what: &str, mut cond: impl FnMut() -> bool) {
    for _ in 0..400 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("timed out waiting for {what}");
}

#[tokio::test]
async fn pair_creation_registers_token_and_presale() {
    let mock = Arc::new(MockSource::new());
    let app = pipeline(&mock, Arc::new(MemoryBlobStore::new()), TransportMode::Push);
    app.start().await.unwrap();

    let factory = address::parse_address(FACTORY).unwrap();
    assert_eq!(mock.emit(factory, pair_created("0x01", 10)), 1);
    eventually("children watched", || {
        app.registry.is_watched(TOKEN) && app.registry.is_watched(PRESALE)
    })
    .await;

    let token = app.registry.get(TOKEN).unwrap();
    let presale = app.registry.get(PRESALE).unwrap();
    assert_eq!(token.contract_type, ContractType::Token);
    assert_eq!(presale.contract_type, ContractType::Presale);
    assert_eq!(token.state, SubscriptionState::Active);

    let relations = app.discovery.relations();
    assert_eq!(relations.len(), 1);
    assert_eq!(relations[0].token_address, TOKEN);
    assert_eq!(relations[0].presale_address, PRESALE);
    assert_eq!(relations[0].creator_address.as_deref(), Some(CREATOR));

    // A redelivered creation log changes nothing.
    mock.emit(factory, pair_created("0x01", 10));
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(app.registry.contracts().len(), 3);
    assert_eq!(app.cache.len(), 1);

    app.shutdown().await.unwrap();
}

#[tokio::test]
async fn child_events_reach_cache_and_listeners() {
    let mock = Arc::new(MockSource::new());
    let app = pipeline(&mock, Arc::new(MemoryBlobStore::new()), TransportMode::Push);
    let mut live = app.discovery.subscribe();
    app.start().await.unwrap();

    let factory = address::parse_address(FACTORY).unwrap();
    mock.emit(factory, pair_created("0x01", 10));
    let presale = address::parse_address(PRESALE).unwrap();
    eventually("presale subscribed", || mock.live_subscriptions(presale) == 1).await;

    mock.emit(
        presale,
        json!({
            "event": "TokensPurchased",
            "address": PRESALE,
            "blockNumber": 12,
            "transactionHash": "0x02",
            "logIndex": 1,
            "blockTimestamp": 1_700_000_000u64,
            "args": {"buyer": CREATOR, "amount": "500000000000000000", "tokenAmount": "1000"}
        }),
    );

    let first = live.recv().await.unwrap();
    assert_eq!(first.event_name, "TokenPresalePairCreated");
    let purchase = live.recv().await.unwrap();
    assert_eq!(purchase.event_name, "TokensPurchased");
    assert_eq!(purchase.contract_type, Some(ContractType::Presale));
    assert_eq!(purchase.related.as_ref().unwrap().token.as_deref(), Some(TOKEN));
    assert_eq!(purchase.timestamp_ms, 1_700_000_000_000);

    let filter = EventFilter {
        contract_address: Some(PRESALE.to_lowercase()),
        ..EventFilter::default()
    };
    assert_eq!(app.cache.latest(10, &filter).len(), 1);

    app.shutdown().await.unwrap();
}

#[tokio::test]
async fn poll_and_push_duplicates_are_stored_once() {
    let mock = Arc::new(MockSource::new());
    mock.set_head(9);
    let app = pipeline(&mock, Arc::new(MemoryBlobStore::new()), TransportMode::Both);
    app.start().await.unwrap();

    let factory = address::parse_address(FACTORY).unwrap();
    eventually("factory baseline", || {
        app.registry.get(FACTORY).and_then(|c| c.last_scanned_block) == Some(9)
    })
    .await;

    mock.add_log(factory, 10, pair_created("0x01", 10));
    mock.emit(factory, pair_created("0x01", 10));
    mock.set_head(10);
    eventually("factory poll", || {
        app.registry.get(FACTORY).and_then(|c| c.last_scanned_block) == Some(10)
    })
    .await;
    tokio::time::sleep(Duration::from_millis(30)).await;

    assert_eq!(app.cache.len(), 1);
    assert!(app.cache.status().counters.duplicates_blocked >= 1);
    assert_eq!(app.discovery.relations().len(), 1);

    app.shutdown().await.unwrap();
}

#[tokio::test]
async fn cached_events_survive_restart() {
    let dir = tempfile::tempdir().unwrap();
    let store: Arc<dyn BlobStore> = Arc::new(FileBlobStore::new(dir.path(), 1024 * 1024));
    let factory = address::parse_address(FACTORY).unwrap();

    {
        let mock = Arc::new(MockSource::new());
        let app = pipeline(&mock, store.clone(), TransportMode::Push);
        app.start().await.unwrap();
        mock.emit(factory, pair_created("0x01", 10));
        eventually("pair discovered", || app.discovery.relations().len() == 1).await;
        app.shutdown().await.unwrap();
        app.shutdown().await.unwrap();
    }

    let mock = Arc::new(MockSource::new());
    let app = pipeline(&mock, store, TransportMode::Push);
    app.start().await.unwrap();

    assert_eq!(app.cache.len(), 1);
    assert_eq!(app.discovery.relations().len(), 1);
    assert!(app.registry.is_watched(TOKEN));
    assert!(app.registry.is_watched(PRESALE));

    app.shutdown().await.unwrap();
}

#[tokio::test]
async fn cache_query_orders_newest_first() {
    let mock = Arc::new(MockSource::new());
    let app = pipeline(&mock, Arc::new(MemoryBlobStore::new()), TransportMode::Push);
    let normalizer = padwatch_ingest::Normalizer::new();

    for (i, ts) in [100u64, 200, 300].into_iter().enumerate() {
        let raw = json!({
            "event": "Transfer",
            "address": TOKEN,
            "blockNumber": i,
            "transactionHash": format!("0x{i}"),
            "logIndex": 0,
            "timestamp": ts,
            "args": {"from": CREATOR, "to": PRESALE, "value": "1"}
        });
        assert!(app.cache.put(normalizer.normalize(&raw.into())));
    }

    let options = QueryOptions {
        limit: 2,
        sort_by: SortField::Timestamp,
        sort_order: SortOrder::Desc,
        ..QueryOptions::default()
    };
    let page = app.cache.query(&EventFilter::default(), &options);
    let stamps: Vec<i64> = page.items.iter().map(|e| e.timestamp_ms).collect();
    assert_eq!(stamps, vec![300, 200]);
    assert_eq!(page.total, 3);
}

#[tokio::test]
async fn list_all_slices_once_with_requested_limit() {
    let mock = Arc::new(MockSource::new());
    let rows: Vec<RawRow> = (0..5)
        .map(|i| {
            RawRow::Record(
                json!({
                    "tokenAddress": TOKEN,
                    "presaleAddress": PRESALE,
                    "creator": CREATOR,
                    "createdAt": 1_700_000_000 + i,
                    "tokenName": format!("Pad {i}"),
                    "tokenSymbol": "PAD",
                    "totalSupply": "1000000"
                })
                .as_object()
                .cloned()
                .unwrap(),
            )
        })
        .collect();
    mock.set_rows(rows);
    let app = pipeline(&mock, Arc::new(MemoryBlobStore::new()), TransportMode::Push);

    let page = app.listing.list_all(0, 50, ListOptions::default()).await.unwrap();
    assert_eq!(page.total, 5);
    assert!(page.items.len() <= 5);
    assert_eq!(page.items[4].token_name, "Pad 4");
    assert_eq!(
        mock.calls()
            .into_iter()
            .filter(|c| matches!(c, MockCall::GetSlice { .. }))
            .collect::<Vec<_>>(),
        vec![MockCall::GetSlice { offset: 0, limit: 50 }]
    );
}
