//! HTTP read API over the event cache, the pair listing and pipeline status.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{
        IntoResponse,
        sse::{Event, KeepAlive, Sse},
    },
    routing::{get, post},
};
use futures::{Stream, StreamExt};
use padwatch_core::AppError;
use padwatch_ingest::{ListError, ListOptions, Lookup, Pipeline};
use padwatch_storage::models::{Category, EventFilter, Priority, QueryOptions, SortField, SortOrder};
use serde::{Deserialize, Serialize};
use tokio_stream::wrappers::BroadcastStream;

/// Upper bound on any page size requested over HTTP.
const MAX_PAGE: usize = 500;

pub type AppState = Arc<Pipeline>;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/v1/events", get(list_events))
        .route("/api/v1/events/latest", get(latest_events))
        .route("/api/v1/events/stats", get(event_stats))
        .route("/api/v1/events/stream", get(event_stream))
        .route("/api/v1/tokens", get(list_tokens))
        .route("/api/v1/tokens/refresh", post(refresh_tokens))
        .route("/api/v1/tokens/creator/:creator", get(tokens_by_creator))
        .route("/api/v1/tokens/:address", get(get_token))
        .route("/api/v1/contracts", get(list_contracts))
        .route("/api/v1/relations", get(list_relations))
        .route("/api/v1/status", get(status))
        .route("/health", get(health))
        .with_state(state)
}

// ─── Query Params ───────────────────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EventParams {
    contract: Option<String>,
    event: Option<String>,
    category: Option<String>,
    priority: Option<String>,
    /// Milliseconds since epoch, inclusive.
    from: Option<i64>,
    to: Option<i64>,
    from_block: Option<u64>,
    to_block: Option<u64>,
    limit: Option<usize>,
    offset: Option<usize>,
    sort_by: Option<String>,
    sort_order: Option<String>,
}

impl EventParams {
    fn filter(&self) -> Result<EventFilter, ApiError> {
        Ok(EventFilter {
            contract_address: self.contract.clone(),
            event_name: self.event.clone(),
            category: parse_opt::<Category>(self.category.as_deref())?,
            priority: parse_opt::<Priority>(self.priority.as_deref())?,
            from_ms: self.from,
            to_ms: self.to,
            from_block: self.from_block,
            to_block: self.to_block,
        })
    }

    fn options(&self) -> Result<QueryOptions, ApiError> {
        let defaults = QueryOptions::default();
        Ok(QueryOptions {
            limit: self.limit.unwrap_or(defaults.limit).min(MAX_PAGE),
            offset: self.offset.unwrap_or(0),
            sort_by: parse_opt::<SortField>(self.sort_by.as_deref())?.unwrap_or_default(),
            sort_order: parse_opt::<SortOrder>(self.sort_order.as_deref())?.unwrap_or_default(),
        })
    }
}

fn parse_opt<T>(value: Option<&str>) -> Result<Option<T>, ApiError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value
        .map(|v| v.parse::<T>().map_err(|e| ApiError::bad_request(e.to_string())))
        .transpose()
}

#[derive(Debug, Deserialize)]
struct PageParams {
    offset: Option<u64>,
    limit: Option<u64>,
    /// Skip the read cache.
    #[serde(default)]
    fresh: bool,
}

impl PageParams {
    fn bounds(&self) -> (u64, u64) {
        (self.offset.unwrap_or(0), self.limit.unwrap_or(20).min(MAX_PAGE as u64))
    }

    fn options(&self) -> ListOptions {
        ListOptions {
            bypass_cache: self.fresh,
        }
    }
}

// ─── Response Types ─────────────────────────────────────────────────────────

#[derive(Serialize)]
struct ApiResponse<T: Serialize> {
    success: bool,
    data: T,
}

fn json_ok<T: Serialize>(data: T) -> Json<ApiResponse<T>> {
    Json(ApiResponse {
        success: true,
        data,
    })
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
        }
    }
}

impl From<AppError> for ApiError {
    fn from(err: AppError) -> Self {
        let status = match &err {
            AppError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Conflict(_) => StatusCode::CONFLICT,
            AppError::ChainUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::Chain(_) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if !err.is_client_error() {
            tracing::error!(error = %err, "Request failed");
        }
        Self {
            status,
            message: err.to_string(),
        }
    }
}

impl From<ListError> for ApiError {
    fn from(err: ListError) -> Self {
        AppError::from(err).into()
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        (
            self.status,
            Json(ApiResponse {
                success: false,
                data: self.message,
            }),
        )
            .into_response()
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct StatusResponse {
    discovery: padwatch_ingest::DiscoveryStatus,
    list_cache: padwatch_ingest::listing::ListCacheStats,
}

// ─── Handlers ───────────────────────────────────────────────────────────────

async fn health() -> &'static str {
    "ok"
}

/// GET /api/v1/events: filtered, sorted, paged events from the cache.
async fn list_events(
    State(state): State<AppState>,
    Query(params): Query<EventParams>,
) -> Result<impl IntoResponse, ApiError> {
    let page = state.cache.query(&params.filter()?, &params.options()?);
    Ok(json_ok(page))
}

/// GET /api/v1/events/latest: newest events first.
async fn latest_events(
    State(state): State<AppState>,
    Query(params): Query<EventParams>,
) -> Result<impl IntoResponse, ApiError> {
    let limit = params.limit.unwrap_or(20).min(MAX_PAGE);
    Ok(json_ok(state.cache.latest(limit, &params.filter()?)))
}

/// GET /api/v1/events/stats: counts by category, priority, contract and name.
async fn event_stats(
    State(state): State<AppState>,
    Query(params): Query<EventParams>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(json_ok(state.cache.stats(&params.filter()?)))
}

/// GET /api/v1/events/stream: newly stored events as server-sent events.
async fn event_stream(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let stream = BroadcastStream::new(state.discovery.subscribe()).filter_map(|next| async move {
        match next {
            Ok(event) => Event::default()
                .event(event.category.as_str())
                .id(event.id.clone())
                .json_data(event.as_ref())
                .ok()
                .map(Ok),
            Err(lagged) => {
                tracing::warn!(error = %lagged, "SSE client lagged");
                None
            }
        }
    });
    Sse::new(stream).keep_alive(KeepAlive::new().interval(Duration::from_secs(15)))
}

/// GET /api/v1/tokens: every pair the factory has created.
async fn list_tokens(
    State(state): State<AppState>,
    Query(params): Query<PageParams>,
) -> Result<impl IntoResponse, ApiError> {
    let (offset, limit) = params.bounds();
    let page = state.listing.list_all(offset, limit, params.options()).await?;
    Ok(json_ok(page))
}

/// GET /api/v1/tokens/creator/:creator: pairs created by one account.
async fn tokens_by_creator(
    State(state): State<AppState>,
    Path(creator): Path<String>,
    Query(params): Query<PageParams>,
) -> Result<impl IntoResponse, ApiError> {
    let (offset, limit) = params.bounds();
    let page = state
        .listing
        .list_by_creator(&creator, offset, limit, params.options())
        .await?;
    Ok(json_ok(page))
}

/// GET /api/v1/tokens/:address: pair details by token address.
async fn get_token(
    State(state): State<AppState>,
    Path(address): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    match state.listing.pair_details(&address).await? {
        Lookup::Found(pair) => {
            let related = state.discovery.related_for(&address);
            Ok(json_ok(serde_json::json!({ "pair": pair, "related": related })))
        }
        Lookup::NotFound => Err(ApiError::not_found("Token not found")),
    }
}

/// POST /api/v1/tokens/refresh: drop cached pages after a local write.
async fn refresh_tokens(State(state): State<AppState>) -> impl IntoResponse {
    state.listing.invalidate();
    json_ok(state.listing.cache_stats())
}

/// GET /api/v1/contracts: watched contracts and their subscription state.
async fn list_contracts(State(state): State<AppState>) -> impl IntoResponse {
    json_ok(state.registry.contracts())
}

/// GET /api/v1/relations: discovered token/presale pairs.
async fn list_relations(State(state): State<AppState>) -> impl IntoResponse {
    json_ok(state.discovery.relations())
}

/// GET /api/v1/status: operational counters.
async fn status(State(state): State<AppState>) -> impl IntoResponse {
    json_ok(StatusResponse {
        discovery: state.discovery.status(),
        list_cache: state.listing.cache_stats(),
    })
}
