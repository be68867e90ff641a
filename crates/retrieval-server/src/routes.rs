//! Thin axum handlers: parse the request, call into `retrieval-core`,
//! serialize the response. No business logic lives here.

use std::sync::Arc;
use std::time::Instant;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Path, Query, State, WebSocketUpgrade};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json};
use axum::routing::{get, post};
use axum::Router;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use retrieval_core::events::{Subscription, Topic};
use retrieval_core::jobs::JobSource;
use retrieval_core::scope::ScopeRequest;
use retrieval_core::types::{DatasetSource, DatasetVisibility, RetrievalResponse};

use crate::AppState;

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/projects/:project/query", post(query))
        .route("/projects/:project/datasets/:dataset/ingest", post(ingest))
        .route("/projects/:project/jobs/:job_id", get(job_status))
        .route("/ws", get(ws_upgrade))
        .with_state(state)
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok", version: env!("CARGO_PKG_VERSION") })
}

#[derive(Deserialize)]
struct QueryRequest {
    text: String,
    #[serde(default)]
    datasets: Vec<String>,
    #[serde(default)]
    include_global: bool,
    #[serde(default = "default_limit")]
    limit: usize,
}

fn default_limit() -> usize {
    10
}

fn api_key(headers: &HeaderMap) -> Option<&str> {
    headers.get("x-api-key").and_then(|v| v.to_str().ok())
}

async fn authorize(state: &AppState, headers: &HeaderMap) -> Result<String, ApiError> {
    let key = api_key(headers);
    if !state.auth.authenticate(key) {
        return Err(ApiError(StatusCode::UNAUTHORIZED, "invalid or missing api key".into()));
    }
    let key = key.unwrap_or("anonymous").to_string();
    if !state.auth.check_rate_limit(&key).await {
        return Err(ApiError(StatusCode::TOO_MANY_REQUESTS, "rate limit exceeded".into()));
    }
    Ok(key)
}

async fn query(
    State(state): State<Arc<AppState>>,
    Path(project): Path<String>,
    headers: HeaderMap,
    Json(body): Json<QueryRequest>,
) -> Result<Json<RetrievalResponse>, ApiError> {
    let start = Instant::now();
    let key = authorize(&state, &headers).await?;
    let scope = ScopeRequest { project, datasets: body.datasets, include_global: body.include_global };
    let response = state
        .retrieval
        .run(&retrieval_core::retrieval::RetrievalQuery { scope, text: body.text, limit: body.limit })
        .await
        .map_err(ApiError::from)?;
    let elapsed = start.elapsed();
    state.metrics.record(elapsed);
    state.usage.record(&key, "query", elapsed.as_millis() as u64).await;
    Ok(Json(response))
}

#[derive(Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum IngestSource {
    LocalPath { path: std::path::PathBuf },
    GitHub { url: String, branch: Option<String> },
    Web { urls: Vec<String> },
}

impl From<IngestSource> for JobSource {
    fn from(source: IngestSource) -> Self {
        match source {
            IngestSource::LocalPath { path } => JobSource::LocalPath(path),
            IngestSource::GitHub { url, branch } => JobSource::GitHub { url, branch },
            IngestSource::Web { urls } => JobSource::Web { urls },
        }
    }
}

#[derive(Deserialize)]
struct IngestRequest {
    source: IngestSource,
    #[serde(default)]
    visibility: Option<String>,
}

#[derive(Serialize)]
struct IngestResponse {
    job_id: Option<Uuid>,
    coalesced: bool,
}

async fn ingest(
    State(state): State<Arc<AppState>>,
    Path((project, dataset)): Path<(String, String)>,
    headers: HeaderMap,
    Json(body): Json<IngestRequest>,
) -> Result<Json<IngestResponse>, ApiError> {
    let start = Instant::now();
    let key = authorize(&state, &headers).await?;
    let project_row = match state.catalog.get_project_by_name(&project).await.map_err(ApiError::from)? {
        Some(p) => p,
        None => state.catalog.create_project(&project).await.map_err(ApiError::from)?,
    };
    let visibility = match body.visibility.as_deref() {
        Some("shared") => DatasetVisibility::Shared,
        _ => DatasetVisibility::Private,
    };
    let dataset_row = match state.catalog.list_datasets(project_row.id).await.map_err(ApiError::from)?.into_iter().find(|d| d.name == dataset) {
        Some(d) => d,
        None => state.catalog.create_dataset(project_row.id, &dataset, DatasetSource::Code, visibility).await.map_err(ApiError::from)?,
    };

    state.resolver.set(dataset_row.id, body.source.into());
    let singleton_key = format!("ingest:{}:{}", project, dataset);
    let job = state.catalog.enqueue_job(dataset_row.id, &singleton_key).await.map_err(ApiError::from)?;
    state.usage.record(&key, "ingest", start.elapsed().as_millis() as u64).await;
    Ok(Json(IngestResponse { job_id: job.as_ref().map(|j| j.id), coalesced: job.is_none() }))
}

async fn job_status(State(state): State<Arc<AppState>>, Path((_project, job_id)): Path<(String, Uuid)>) -> Result<Json<retrieval_core::types::IngestionJob>, ApiError> {
    state
        .catalog
        .get_job(job_id)
        .await
        .map_err(ApiError::from)?
        .map(Json)
        .ok_or_else(|| ApiError(StatusCode::NOT_FOUND, "job not found".into()))
}

#[derive(Deserialize)]
struct WsQuery {
    project: Option<String>,
    /// Comma-separated topic names, e.g. `job_progress,error`.
    topics: Option<String>,
}

async fn ws_upgrade(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>, Query(query): Query<WsQuery>) -> impl IntoResponse {
    let topics = query
        .topics
        .as_deref()
        .map(|csv| csv.split(',').filter_map(parse_topic).collect())
        .unwrap_or_default();
    let subscription = Subscription { project: query.project.unwrap_or_else(|| "all".into()), topics };
    ws.on_upgrade(move |socket| handle_socket(socket, state, subscription))
}

fn parse_topic(name: &str) -> Option<Topic> {
    match name.trim() {
        "node_status" => Some(Topic::NodeStatus),
        "job_progress" => Some(Topic::JobProgress),
        "collection_stats" => Some(Topic::CollectionStats),
        "error" => Some(Topic::Error),
        _ => None,
    }
}

async fn handle_socket(mut socket: WebSocket, state: Arc<AppState>, subscription: Subscription) {
    let mut events = state.events.subscribe();
    loop {
        tokio::select! {
            event = events.recv() => {
                match event {
                    Ok(event) if subscription.matches(&event) => {
                        let Ok(payload) = serde_json::to_string(&event) else { continue };
                        if socket.send(Message::Text(payload.into())).await.is_err() {
                            break;
                        }
                    }
                    Ok(_) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
            incoming = socket.recv() => {
                if incoming.is_none() {
                    break;
                }
            }
        }
    }
}

struct ApiError(StatusCode, String);

impl From<retrieval_core::error::RetrievalError> for ApiError {
    fn from(err: retrieval_core::error::RetrievalError) -> Self {
        let status = match &err {
            retrieval_core::error::RetrievalError::NotFound { .. } => StatusCode::NOT_FOUND,
            retrieval_core::error::RetrievalError::Config { .. } => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        ApiError(status, err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        (self.0, Json(serde_json::json!({ "error": self.1 }))).into_response()
    }
}
