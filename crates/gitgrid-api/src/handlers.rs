//! REST API handlers: routing query, internal events, metrics.
//!
//! Not-found conditions answer 404 and a missing route 503. Store failures
//! answer 500 with the error text.

use std::fmt::Display;

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use tracing::{debug, info};

use gitgrid_capacity::CapacityError;
use gitgrid_queue::QueueError;
use gitgrid_routing::RoutingError;
use gitgrid_state::{NodeId, RepoId, RepositoryInfo, StateError, epoch_millis};

use crate::ApiState;
use crate::auth::{ROUTE_SECRET_HEADER, authorized};

/// Response wrapper for consistent API format.
#[derive(serde::Serialize)]
pub(crate) struct ApiResponse<T: serde::Serialize> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T: serde::Serialize> ApiResponse<T> {
    pub(crate) fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            error: None,
        })
    }
}

pub(crate) fn error_response(msg: &str, status: StatusCode) -> impl IntoResponse {
    (
        status,
        Json(ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(msg.to_string()),
        }),
    )
}

/// HTTP status for a library error.
pub(crate) trait ErrorStatus: Display {
    fn status(&self) -> StatusCode;
}

impl ErrorStatus for StateError {
    fn status(&self) -> StatusCode {
        match self {
            StateError::NotFound(_) => StatusCode::NOT_FOUND,
            StateError::Conflict(_) => StatusCode::CONFLICT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl ErrorStatus for RoutingError {
    fn status(&self) -> StatusCode {
        match self {
            RoutingError::State(e) => e.status(),
        }
    }
}

impl ErrorStatus for QueueError {
    fn status(&self) -> StatusCode {
        match self {
            QueueError::State(e) => e.status(),
            QueueError::LocationMissing(_) => StatusCode::NOT_FOUND,
        }
    }
}

impl ErrorStatus for CapacityError {
    fn status(&self) -> StatusCode {
        match self {
            CapacityError::State(e) => e.status(),
            CapacityError::Queue(e) => e.status(),
            CapacityError::Routing(e) => e.status(),
        }
    }
}

pub(crate) fn failure<E: ErrorStatus>(e: E) -> Response {
    error_response(&e.to_string(), e.status()).into_response()
}

// ── Routing query ──────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RouteMode {
    #[default]
    Read,
    Write,
}

#[derive(Debug, Default, Deserialize)]
pub struct RouteQuery {
    #[serde(default)]
    pub mode: RouteMode,
}

/// GET /api/v1/route/{owner}/{name}?mode=read|write
pub async fn route_query(
    State(state): State<ApiState>,
    Path((owner, name)): Path<(String, String)>,
    Query(query): Query<RouteQuery>,
    headers: HeaderMap,
) -> impl IntoResponse {
    if !authorized(&state.auth.route_secret, &headers, ROUTE_SECRET_HEADER) {
        return error_response("missing or invalid route secret", StatusCode::UNAUTHORIZED).into_response();
    }
    let repo = match state.store.find_repository(&owner, &name) {
        Ok(Some(repo)) => repo,
        Ok(None) => return error_response("repository not found", StatusCode::NOT_FOUND).into_response(),
        Err(e) => return failure(e),
    };

    let decision = match query.mode {
        RouteMode::Read => state.engine.route_for_read(repo.id).await,
        RouteMode::Write => state.engine.route_for_write(repo.id).await,
    };
    match decision {
        Ok(Some(decision)) => {
            state.traffic.record(repo.id).await;
            ApiResponse::ok(decision).into_response()
        }
        Ok(None) => {
            debug!(repo_id = repo.id, mode = ?query.mode, "no route available");
            error_response("no route available", StatusCode::SERVICE_UNAVAILABLE).into_response()
        }
        Err(e) => failure(e),
    }
}

// ── Internal events ────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct RepositoryCreated {
    pub id: RepoId,
    pub owner: String,
    pub name: String,
    #[serde(default)]
    pub stars: u64,
    #[serde(default)]
    pub watchers: u64,
    pub primary_node_id: NodeId,
}

/// POST /api/v1/internal/events/repository-created
pub async fn repository_created(
    State(state): State<ApiState>,
    Json(event): Json<RepositoryCreated>,
) -> impl IntoResponse {
    let now = epoch_millis();
    let repo = RepositoryInfo {
        id: event.id,
        owner: event.owner,
        name: event.name,
        stars: event.stars,
        watchers: event.watchers,
        last_commit_at: None,
        created_at: now,
    };
    match state
        .events
        .on_repository_created(&repo, &event.primary_node_id, now)
        .await
    {
        Ok(seeds) => {
            info!(repo_id = repo.id, "repository created event handled");
            (
                StatusCode::CREATED,
                ApiResponse::ok(serde_json::json!({
                    "repo_id": repo.id,
                    "primary_node_id": event.primary_node_id,
                    "seed_replicas": seeds,
                })),
            )
                .into_response()
        }
        Err(e) => failure(e),
    }
}

#[derive(Debug, Deserialize)]
pub struct RepositoryPushed {
    pub repo_id: RepoId,
    /// Where to place the repository if it has no location yet.
    #[serde(default)]
    pub primary_node_id: Option<NodeId>,
    #[serde(default)]
    pub commit: Option<String>,
    /// Default-branch commit time, epoch milliseconds.
    #[serde(default)]
    pub commit_at: Option<u64>,
}

/// POST /api/v1/internal/events/repository-pushed
pub async fn repository_pushed(
    State(state): State<ApiState>,
    Json(event): Json<RepositoryPushed>,
) -> impl IntoResponse {
    let result = state
        .events
        .on_repository_pushed(
            event.repo_id,
            event.primary_node_id.as_deref(),
            event.commit.as_deref(),
            event.commit_at,
            epoch_millis(),
        )
        .await;
    match result {
        Ok(tasks) => ApiResponse::ok(serde_json::json!({
            "repo_id": event.repo_id,
            "tasks_enqueued": tasks,
        }))
        .into_response(),
        Err(e) => failure(e),
    }
}

// ── Prometheus ─────────────────────────────────────────────────

/// GET /metrics
pub async fn prometheus_metrics(State(state): State<ApiState>) -> impl IntoResponse {
    let traffic = state.traffic.peek_all().await;
    let body = gitgrid_metrics::render_prometheus(&state.counters.snapshot(), &traffic);
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
        body,
    )
}
