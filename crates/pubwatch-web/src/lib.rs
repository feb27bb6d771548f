//! Thin JSON boundary over the core operations.
//!
//! Deliberately free of sessions, templates and credential handling: the
//! caller identifies the tenant with the `x-pubwatch-user` header and every
//! lookup answers cross-tenant access with 404, never 403.

use std::sync::Arc;

use axum::extract::{FromRequestParts, Path, Query, State};
use axum::http::request::Parts;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use pubwatch_core::{
    is_valid_scholar_id, normalize_display_name, CrawlRunRecord, IngestionQueueItem,
    PublicationListItem, RunTriggerType, ScholarProfile,
};
use pubwatch_enrich::EnrichmentService;
use pubwatch_ingest::{IngestError, RunSummary, ScholarIngestionService};
use pubwatch_scholar::LiveScholarSource;
use pubwatch_storage::{PgStore, PublicationViewMode, StoreError};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::error;

pub const CRATE_NAME: &str = "pubwatch-web";

const USER_HEADER: &str = "x-pubwatch-user";
const DEFAULT_LIST_LIMIT: i64 = 300;

#[derive(Clone)]
pub struct AppState {
    pub store: PgStore,
    pub ingestion: Arc<ScholarIngestionService<LiveScholarSource>>,
    pub enrichment: EnrichmentService,
    pub enrich_max_items: usize,
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("not found")]
    NotFound,
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    Conflict(String),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::DuplicateScholar => {
                ApiError::Conflict("that scholar is already tracked for this account".to_string())
            }
            StoreError::QueueTransition(message) => ApiError::Conflict(message.to_string()),
            other => ApiError::Internal(other.into()),
        }
    }
}

impl From<IngestError> for ApiError {
    fn from(err: IngestError) -> Self {
        match err {
            IngestError::RunAlreadyInProgress => {
                ApiError::Conflict("a run is already in progress for this account".to_string())
            }
            IngestError::Store(store_err) => store_err.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            ApiError::NotFound => (StatusCode::NOT_FOUND, self.to_string()),
            ApiError::BadRequest(message) => (StatusCode::BAD_REQUEST, message.clone()),
            ApiError::Conflict(message) => (StatusCode::CONFLICT, message.clone()),
            ApiError::Internal(err) => {
                error!(error = %err, "internal error serving request");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal error".to_string(),
                )
            }
        };
        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}

/// Tenant identity taken from a request header; this boundary performs no
/// credential handling of its own.
pub struct UserId(pub i64);

impl<S: Send + Sync> FromRequestParts<S> for UserId {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .headers
            .get(USER_HEADER)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.trim().parse::<i64>().ok())
            .filter(|id| *id > 0)
            .map(UserId)
            .ok_or_else(|| ApiError::BadRequest(format!("missing or invalid {USER_HEADER} header")))
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz_handler))
        .route("/scholars", get(list_scholars_handler).post(create_scholar_handler))
        .route("/scholars/{id}/toggle", post(toggle_scholar_handler))
        .route("/scholars/{id}", delete(delete_scholar_handler))
        .route("/publications", get(list_publications_handler))
        .route("/publications/counts", get(publication_counts_handler))
        .route("/publications/read-all", post(mark_all_read_handler))
        .route("/publications/read", post(mark_selected_read_handler))
        .route(
            "/publications/{scholar_profile_id}/{publication_id}/retry-pdf",
            post(retry_pdf_handler),
        )
        .route("/publications/enrich", post(schedule_enrichment_handler))
        .route("/runs", get(list_runs_handler).post(trigger_run_handler))
        .route("/runs/{run_id}", get(run_detail_handler))
        .route("/queue", get(list_queue_handler))
        .route("/queue/{id}/retry", post(queue_retry_handler))
        .route("/queue/{id}/drop", post(queue_drop_handler))
        .route("/queue/{id}/clear", post(queue_clear_handler))
        .with_state(state)
}

pub async fn serve(state: AppState, bind: &str) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(bind).await?;
    tracing::info!(bind, "web boundary listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn healthz_handler() -> &'static str {
    "ok"
}

// --- scholars -------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct CreateScholarRequest {
    scholar_id: String,
    #[serde(default)]
    display_name: String,
}

async fn list_scholars_handler(
    State(state): State<AppState>,
    UserId(user_id): UserId,
) -> Result<Json<Vec<ScholarProfile>>, ApiError> {
    Ok(Json(state.store.list_scholars_for_user(user_id).await?))
}

async fn create_scholar_handler(
    State(state): State<AppState>,
    UserId(user_id): UserId,
    Json(request): Json<CreateScholarRequest>,
) -> Result<Json<ScholarProfile>, ApiError> {
    let scholar_id = request.scholar_id.trim();
    if !is_valid_scholar_id(scholar_id) {
        return Err(ApiError::BadRequest(
            "scholar id must be 12 characters of [A-Za-z0-9_-]".to_string(),
        ));
    }
    let display_name = normalize_display_name(&request.display_name);
    let profile = state
        .store
        .create_scholar(user_id, scholar_id, display_name.as_deref())
        .await?;
    Ok(Json(profile))
}

async fn toggle_scholar_handler(
    State(state): State<AppState>,
    UserId(user_id): UserId,
    Path(scholar_profile_id): Path<i64>,
) -> Result<Json<ScholarProfile>, ApiError> {
    let profile = state
        .store
        .get_scholar_for_user(user_id, scholar_profile_id)
        .await?
        .ok_or(ApiError::NotFound)?;
    state
        .store
        .set_scholar_enabled_for_user(user_id, scholar_profile_id, !profile.is_enabled)
        .await?;
    state
        .store
        .get_scholar_for_user(user_id, scholar_profile_id)
        .await?
        .map(Json)
        .ok_or(ApiError::NotFound)
}

async fn delete_scholar_handler(
    State(state): State<AppState>,
    UserId(user_id): UserId,
    Path(scholar_profile_id): Path<i64>,
) -> Result<StatusCode, ApiError> {
    let deleted = state
        .store
        .delete_scholar_for_user(user_id, scholar_profile_id)
        .await?;
    if !deleted {
        return Err(ApiError::NotFound);
    }
    Ok(StatusCode::NO_CONTENT)
}

// --- publications ---------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
struct PublicationsQuery {
    #[serde(default)]
    mode: Option<String>,
    #[serde(default)]
    scholar: Option<i64>,
    #[serde(default)]
    limit: Option<i64>,
}

async fn list_publications_handler(
    State(state): State<AppState>,
    UserId(user_id): UserId,
    Query(query): Query<PublicationsQuery>,
) -> Result<Json<Vec<PublicationListItem>>, ApiError> {
    let mode = PublicationViewMode::parse(query.mode.as_deref().unwrap_or("all"));
    let limit = query.limit.unwrap_or(DEFAULT_LIST_LIMIT).clamp(1, 1_000);
    let rows = state
        .store
        .list_publications_for_user(user_id, mode, query.scholar, limit)
        .await?;
    Ok(Json(rows))
}

#[derive(Debug, Serialize)]
struct PublicationCounts {
    all: i64,
    unread: i64,
    latest: i64,
}

async fn publication_counts_handler(
    State(state): State<AppState>,
    UserId(user_id): UserId,
) -> Result<Json<PublicationCounts>, ApiError> {
    let all = state
        .store
        .count_publications_for_user(user_id, PublicationViewMode::All)
        .await?;
    let unread = state
        .store
        .count_publications_for_user(user_id, PublicationViewMode::Unread)
        .await?;
    let latest = state
        .store
        .count_publications_for_user(user_id, PublicationViewMode::Latest)
        .await?;
    Ok(Json(PublicationCounts { all, unread, latest }))
}

#[derive(Debug, Serialize)]
struct MarkReadResponse {
    updated: u64,
}

async fn mark_all_read_handler(
    State(state): State<AppState>,
    UserId(user_id): UserId,
) -> Result<Json<MarkReadResponse>, ApiError> {
    let updated = state.store.mark_all_unread_as_read_for_user(user_id).await?;
    Ok(Json(MarkReadResponse { updated }))
}

#[derive(Debug, Deserialize)]
struct MarkSelectedRequest {
    selections: Vec<(i64, i64)>,
}

async fn mark_selected_read_handler(
    State(state): State<AppState>,
    UserId(user_id): UserId,
    Json(request): Json<MarkSelectedRequest>,
) -> Result<Json<MarkReadResponse>, ApiError> {
    let updated = state
        .store
        .mark_selected_as_read_for_user(user_id, &request.selections)
        .await?;
    Ok(Json(MarkReadResponse { updated }))
}

#[derive(Debug, Default, Deserialize)]
struct EmailQuery {
    #[serde(default)]
    email: Option<String>,
}

async fn retry_pdf_handler(
    State(state): State<AppState>,
    UserId(user_id): UserId,
    Path((scholar_profile_id, publication_id)): Path<(i64, i64)>,
    Query(query): Query<EmailQuery>,
) -> Result<Json<PublicationListItem>, ApiError> {
    let item = state
        .enrichment
        .retry_pdf_for_user(
            user_id,
            scholar_profile_id,
            publication_id,
            query.email.as_deref(),
        )
        .await
        .map_err(ApiError::Internal)?;
    item.map(Json).ok_or(ApiError::NotFound)
}

#[derive(Debug, Default, Deserialize)]
struct EnrichRequest {
    #[serde(default)]
    max_items: Option<usize>,
    #[serde(default)]
    email: Option<String>,
}

#[derive(Debug, Serialize)]
struct EnrichResponse {
    scheduled: usize,
}

/// Claims rows and returns immediately; resolution happens in background
/// tasks owned by the enrichment scheduler.
async fn schedule_enrichment_handler(
    State(state): State<AppState>,
    UserId(user_id): UserId,
    Json(request): Json<EnrichRequest>,
) -> Result<Json<EnrichResponse>, ApiError> {
    let rows = state
        .store
        .list_publications_for_user(user_id, PublicationViewMode::All, None, DEFAULT_LIST_LIMIT)
        .await?;
    let max_items = request.max_items.unwrap_or(state.enrich_max_items);
    let scheduled = state
        .enrichment
        .schedule_missing_pdf_enrichment_for_user(
            user_id,
            &rows,
            max_items,
            request.email.as_deref(),
        )
        .await;
    Ok(Json(EnrichResponse { scheduled }))
}

// --- runs and queue -------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
struct RunsQuery {
    #[serde(default)]
    failed_only: Option<bool>,
    #[serde(default)]
    limit: Option<i64>,
}

async fn list_runs_handler(
    State(state): State<AppState>,
    UserId(user_id): UserId,
    Query(query): Query<RunsQuery>,
) -> Result<Json<Vec<CrawlRunRecord>>, ApiError> {
    let limit = query.limit.unwrap_or(200).clamp(1, 1_000);
    let runs = state
        .store
        .list_runs_for_user(user_id, limit, query.failed_only.unwrap_or(false))
        .await?;
    Ok(Json(runs))
}

async fn trigger_run_handler(
    State(state): State<AppState>,
    UserId(user_id): UserId,
) -> Result<Json<RunSummary>, ApiError> {
    let summary = state
        .ingestion
        .run_for_user(user_id, RunTriggerType::Manual)
        .await?;
    Ok(Json(summary))
}

async fn run_detail_handler(
    State(state): State<AppState>,
    UserId(user_id): UserId,
    Path(run_id): Path<i64>,
) -> Result<Json<CrawlRunRecord>, ApiError> {
    state
        .store
        .get_run_for_user(user_id, run_id)
        .await?
        .map(Json)
        .ok_or(ApiError::NotFound)
}

async fn list_queue_handler(
    State(state): State<AppState>,
    UserId(user_id): UserId,
) -> Result<Json<Vec<IngestionQueueItem>>, ApiError> {
    Ok(Json(state.store.list_queue_items_for_user(user_id, 200).await?))
}

async fn queue_retry_handler(
    State(state): State<AppState>,
    UserId(user_id): UserId,
    Path(queue_item_id): Path<i64>,
) -> Result<Json<IngestionQueueItem>, ApiError> {
    state
        .store
        .retry_queue_item_for_user(user_id, queue_item_id)
        .await?
        .map(Json)
        .ok_or(ApiError::NotFound)
}

async fn queue_drop_handler(
    State(state): State<AppState>,
    UserId(user_id): UserId,
    Path(queue_item_id): Path<i64>,
) -> Result<Json<IngestionQueueItem>, ApiError> {
    state
        .store
        .drop_queue_item_for_user(user_id, queue_item_id)
        .await?
        .map(Json)
        .ok_or(ApiError::NotFound)
}

async fn queue_clear_handler(
    State(state): State<AppState>,
    UserId(user_id): UserId,
    Path(queue_item_id): Path<i64>,
) -> Result<StatusCode, ApiError> {
    state
        .store
        .clear_queue_item_for_user(user_id, queue_item_id)
        .await?
        .map(|_| StatusCode::NO_CONTENT)
        .ok_or(ApiError::NotFound)
}
