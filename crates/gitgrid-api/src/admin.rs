//! Admin handlers — node, location and replica management, promotion,
//! summaries, backfill, dead letters, and the audit log.
//!
//! Every mutation appends a routing audit record. The actor is taken from
//! the `x-gitgrid-actor` header, defaulting to `admin`.

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use serde::{Deserialize, Serialize};
use tracing::info;

use gitgrid_routing::HeartbeatReport;
use gitgrid_state::{
    AuditAction, AuditRecord, HealthStatus, NodeId, NodeInfo, NodeStatus, PromotionOutcome,
    RepoId, RepoLocation, Replica, Requeue, StateResult, TaskStatus, epoch_millis,
};

use crate::ApiState;
use crate::auth::actor;
use crate::handlers::{ApiResponse, error_response, failure};
use crate::summary;

const DEFAULT_LIMIT: usize = 100;

#[derive(Debug, Default, Deserialize)]
pub struct LimitQuery {
    #[serde(default)]
    pub limit: Option<usize>,
}

fn audit(
    state: &ApiState,
    headers: &HeaderMap,
    action: AuditAction,
    repo_id: Option<RepoId>,
    node_id: Option<&str>,
    payload: &impl Serialize,
) -> StateResult<()> {
    let record = AuditRecord {
        actor: actor(headers),
        action,
        repo_id,
        node_id: node_id.map(str::to_string),
        payload: serde_json::to_string(payload).unwrap_or_default(),
    };
    state.store.append_audit(&record, epoch_millis())?;
    Ok(())
}

// ── Nodes ──────────────────────────────────────────────────────

/// Node upsert body. Omitted fields keep their current value; `host` is
/// required when the node is new.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct NodeUpsert {
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub zone: Option<String>,
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    pub status: Option<NodeStatus>,
    #[serde(default)]
    pub disk_usage_pct: Option<f64>,
    #[serde(default)]
    pub iops: Option<f64>,
    #[serde(default)]
    pub repo_count: Option<u64>,
}

/// GET /api/v1/admin/nodes
pub async fn list_nodes(State(state): State<ApiState>) -> impl IntoResponse {
    match state.store.list_nodes() {
        Ok(nodes) => ApiResponse::ok(nodes).into_response(),
        Err(e) => failure(e),
    }
}

/// GET /api/v1/admin/nodes/{id}
pub async fn get_node(State(state): State<ApiState>, Path(id): Path<String>) -> impl IntoResponse {
    match state.store.get_node(&id) {
        Ok(Some(node)) => ApiResponse::ok(node).into_response(),
        Ok(None) => error_response("node not found", StatusCode::NOT_FOUND).into_response(),
        Err(e) => failure(e),
    }
}

/// PUT /api/v1/admin/nodes/{id}
pub async fn upsert_node(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    Json(req): Json<NodeUpsert>,
) -> impl IntoResponse {
    let existing = match state.store.get_node(&id) {
        Ok(existing) => existing,
        Err(e) => return failure(e),
    };
    let created = existing.is_none();
    let mut node = match existing {
        Some(node) => node,
        None => {
            let Some(host) = req.host.clone() else {
                return error_response("host is required for a new node", StatusCode::BAD_REQUEST)
                    .into_response();
            };
            NodeInfo {
                id: id.clone(),
                host,
                zone: None,
                region: None,
                status: NodeStatus::Healthy,
                disk_usage_pct: 0.0,
                iops: 0.0,
                repo_count: 0,
                last_heartbeat: epoch_millis(),
            }
        }
    };
    if let Some(host) = &req.host {
        node.host = host.clone();
    }
    if req.zone.is_some() {
        node.zone = req.zone.clone();
    }
    if req.region.is_some() {
        node.region = req.region.clone();
    }
    if let Some(status) = req.status {
        node.status = status;
    }
    if let Some(disk) = req.disk_usage_pct {
        node.disk_usage_pct = disk;
    }
    if let Some(iops) = req.iops {
        node.iops = iops;
    }
    if let Some(repo_count) = req.repo_count {
        node.repo_count = repo_count;
    }

    if let Err(e) = state.store.put_node(&node) {
        return failure(e);
    }
    if let Err(e) = audit(&state, &headers, AuditAction::UpsertNode, None, Some(id.as_str()), &req) {
        return failure(e);
    }
    state.engine.invalidate_node(&id).await;
    info!(node_id = %id, created, status = ?node.status, "node upserted");

    let status = if created { StatusCode::CREATED } else { StatusCode::OK };
    (status, ApiResponse::ok(node)).into_response()
}

/// DELETE /api/v1/admin/nodes/{id}
pub async fn delete_node(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> impl IntoResponse {
    match state.store.delete_node(&id) {
        Ok(true) => {
            if let Err(e) = audit(&state, &headers, AuditAction::DeleteNode, None, Some(id.as_str()), &id) {
                return failure(e);
            }
            state.engine.invalidate_node(&id).await;
            ApiResponse::ok("deleted").into_response()
        }
        Ok(false) => error_response("node not found", StatusCode::NOT_FOUND).into_response(),
        Err(e) => failure(e),
    }
}

/// POST /api/v1/admin/nodes/{id}/heartbeat
pub async fn heartbeat(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Json(report): Json<HeartbeatReport>,
) -> impl IntoResponse {
    match state.registry.heartbeat(&id, &report, epoch_millis()) {
        Ok(Some(node)) => {
            state.engine.invalidate_node(&id).await;
            ApiResponse::ok(node).into_response()
        }
        Ok(None) => error_response("unknown node must report its host", StatusCode::BAD_REQUEST)
            .into_response(),
        Err(e) => failure(e),
    }
}

// ── Locations ──────────────────────────────────────────────────

#[derive(Debug, Serialize, Deserialize)]
pub struct LocationUpsert {
    pub primary_node_id: NodeId,
    #[serde(default)]
    pub last_write_commit: Option<String>,
}

/// GET /api/v1/admin/repos/{id}/location
pub async fn get_location(State(state): State<ApiState>, Path(id): Path<RepoId>) -> impl IntoResponse {
    match state.store.get_location(id) {
        Ok(Some(location)) => ApiResponse::ok(location).into_response(),
        Ok(None) => error_response("location not found", StatusCode::NOT_FOUND).into_response(),
        Err(e) => failure(e),
    }
}

/// PUT /api/v1/admin/repos/{id}/location
///
/// Creates the location, or overrides it. Changing the primary of an
/// existing location goes through promotion.
pub async fn put_location(
    State(state): State<ApiState>,
    Path(id): Path<RepoId>,
    headers: HeaderMap,
    Json(req): Json<LocationUpsert>,
) -> impl IntoResponse {
    let now = epoch_millis();
    let existing = match state.store.get_location(id) {
        Ok(existing) => existing,
        Err(e) => return failure(e),
    };
    let created = existing.is_none();
    match existing {
        None => {
            let mut location = RepoLocation::new(id, req.primary_node_id.as_str(), now);
            location.last_write_commit = req.last_write_commit.clone();
            if let Err(e) = state.store.put_location(&location) {
                return failure(e);
            }
        }
        Some(location) => {
            if location.primary_node_id != req.primary_node_id {
                if let Err(e) = state
                    .engine
                    .update_primary(id, &req.primary_node_id, &actor(&headers))
                    .await
                {
                    return failure(e);
                }
            }
            if let Some(commit) = &req.last_write_commit {
                if let Err(e) = state.store.record_write(id, commit, now) {
                    return failure(e);
                }
            }
        }
    }
    if let Err(e) = audit(
        &state,
        &headers,
        AuditAction::UpsertLocation,
        Some(id),
        Some(req.primary_node_id.as_str()),
        &req,
    ) {
        return failure(e);
    }
    state.engine.invalidate_location(id).await;

    match state.store.get_location(id) {
        Ok(Some(location)) => {
            let status = if created { StatusCode::CREATED } else { StatusCode::OK };
            (status, ApiResponse::ok(location)).into_response()
        }
        Ok(None) => error_response("location not found", StatusCode::NOT_FOUND).into_response(),
        Err(e) => failure(e),
    }
}

/// DELETE /api/v1/admin/repos/{id}/location
pub async fn delete_location(
    State(state): State<ApiState>,
    Path(id): Path<RepoId>,
    headers: HeaderMap,
) -> impl IntoResponse {
    match state.store.delete_location(id) {
        Ok(true) => {
            if let Err(e) = audit(&state, &headers, AuditAction::DeleteLocation, Some(id), None, &id) {
                return failure(e);
            }
            state.engine.invalidate_location(id).await;
            ApiResponse::ok("deleted").into_response()
        }
        Ok(false) => error_response("location not found", StatusCode::NOT_FOUND).into_response(),
        Err(e) => failure(e),
    }
}

// ── Replicas ───────────────────────────────────────────────────

/// One entry of a bulk replica sync. Health defaults to `unknown`.
#[derive(Debug, Serialize, Deserialize)]
pub struct ReplicaSync {
    pub node_id: NodeId,
    #[serde(default)]
    pub health: Option<HealthStatus>,
    #[serde(default)]
    pub lag_ms: Option<u64>,
    #[serde(default)]
    pub lag_commits: Option<u64>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ReplicaUpdate {
    #[serde(default)]
    pub health: Option<HealthStatus>,
    #[serde(default)]
    pub lag_ms: Option<u64>,
    #[serde(default)]
    pub lag_commits: Option<u64>,
}

/// GET /api/v1/admin/repos/{id}/replicas
pub async fn list_replicas(State(state): State<ApiState>, Path(id): Path<RepoId>) -> impl IntoResponse {
    match state.store.list_replicas_for_repo(id) {
        Ok(replicas) => ApiResponse::ok(replicas).into_response(),
        Err(e) => failure(e),
    }
}

/// PUT /api/v1/admin/repos/{id}/replicas
///
/// Replaces the whole replica set.
pub async fn sync_replicas(
    State(state): State<ApiState>,
    Path(id): Path<RepoId>,
    headers: HeaderMap,
    Json(req): Json<Vec<ReplicaSync>>,
) -> impl IntoResponse {
    match state.store.get_location(id) {
        Ok(Some(_)) => {}
        Ok(None) => return error_response("location not found", StatusCode::NOT_FOUND).into_response(),
        Err(e) => return failure(e),
    }
    let now = epoch_millis();
    let replicas: Vec<Replica> = req
        .iter()
        .map(|r| Replica {
            repo_id: id,
            node_id: r.node_id.clone(),
            health: r.health.unwrap_or(HealthStatus::Unknown),
            lag_ms: r.lag_ms,
            lag_commits: r.lag_commits,
            updated_at: now,
        })
        .collect();

    if let Err(e) = state.store.replace_replicas(id, &replicas) {
        return failure(e);
    }
    if let Err(e) = audit(&state, &headers, AuditAction::SyncReplicas, Some(id), None, &req) {
        return failure(e);
    }
    info!(repo_id = id, count = replicas.len(), "replica set synchronized");
    match state.store.list_replicas_for_repo(id) {
        Ok(replicas) => ApiResponse::ok(replicas).into_response(),
        Err(e) => failure(e),
    }
}

/// PATCH /api/v1/admin/repos/{id}/replicas/{node}
pub async fn update_replica(
    State(state): State<ApiState>,
    Path((id, node)): Path<(RepoId, String)>,
    headers: HeaderMap,
    Json(req): Json<ReplicaUpdate>,
) -> impl IntoResponse {
    let result = state.store.update_replica_status(
        id,
        &node,
        req.health,
        req.lag_ms,
        req.lag_commits,
        epoch_millis(),
    );
    match result {
        Ok(Some(replica)) => {
            if let Err(e) = audit(&state, &headers, AuditAction::UpdateReplica, Some(id), Some(node.as_str()), &req) {
                return failure(e);
            }
            ApiResponse::ok(replica).into_response()
        }
        Ok(None) => error_response("replica not found", StatusCode::NOT_FOUND).into_response(),
        Err(e) => failure(e),
    }
}

// ── Promotion ──────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct PromoteRequest {
    pub node_id: NodeId,
}

/// POST /api/v1/admin/repos/{id}/promote
pub async fn promote(
    State(state): State<ApiState>,
    Path(id): Path<RepoId>,
    headers: HeaderMap,
    Json(req): Json<PromoteRequest>,
) -> impl IntoResponse {
    match state.store.get_node(&req.node_id) {
        Ok(Some(_)) => {}
        Ok(None) => return error_response("node not found", StatusCode::NOT_FOUND).into_response(),
        Err(e) => return failure(e),
    }
    match state.engine.update_primary(id, &req.node_id, &actor(&headers)).await {
        Ok(PromotionOutcome::Promoted { old_primary }) => ApiResponse::ok(serde_json::json!({
            "repo_id": id,
            "old_primary": old_primary,
            "new_primary": req.node_id,
            "changed": true,
        }))
        .into_response(),
        Ok(PromotionOutcome::AlreadyPrimary) => ApiResponse::ok(serde_json::json!({
            "repo_id": id,
            "new_primary": req.node_id,
            "changed": false,
        }))
        .into_response(),
        Ok(PromotionOutcome::LocationMissing) => {
            error_response("location not found", StatusCode::NOT_FOUND).into_response()
        }
        Err(e) => failure(e),
    }
}

// ── Summaries ──────────────────────────────────────────────────

/// GET /api/v1/admin/summary/repos
pub async fn summary_by_repo(State(state): State<ApiState>) -> impl IntoResponse {
    let data = state
        .store
        .list_locations()
        .and_then(|locations| Ok((locations, state.store.list_replicas()?)));
    match data {
        Ok((locations, replicas)) => {
            ApiResponse::ok(summary::by_repository(&locations, &replicas)).into_response()
        }
        Err(e) => failure(e),
    }
}

/// GET /api/v1/admin/summary/nodes
pub async fn summary_by_node(State(state): State<ApiState>) -> impl IntoResponse {
    let data = (|| {
        Ok::<_, gitgrid_state::StateError>((
            state.store.list_nodes()?,
            state.store.list_locations()?,
            state.store.list_replicas()?,
        ))
    })();
    match data {
        Ok((nodes, locations, replicas)) => {
            ApiResponse::ok(summary::by_node(&nodes, &locations, &replicas)).into_response()
        }
        Err(e) => failure(e),
    }
}

/// GET /api/v1/admin/summary/zones
pub async fn summary_by_zone(State(state): State<ApiState>) -> impl IntoResponse {
    let data = state
        .store
        .list_nodes()
        .and_then(|nodes| Ok((nodes, state.store.list_replicas()?)));
    match data {
        Ok((nodes, replicas)) => ApiResponse::ok(summary::by_zone(&nodes, &replicas)).into_response(),
        Err(e) => failure(e),
    }
}

// ── Backfill ───────────────────────────────────────────────────

/// POST /api/v1/admin/backfill
pub async fn run_backfill(State(state): State<ApiState>) -> impl IntoResponse {
    match state.backfill.run(epoch_millis()) {
        Ok(report) => ApiResponse::ok(report).into_response(),
        Err(e) => failure(e),
    }
}

/// GET /api/v1/admin/backfill/stats
pub async fn backfill_stats(State(state): State<ApiState>) -> impl IntoResponse {
    match state.backfill.stats() {
        Ok(stats) => ApiResponse::ok(stats).into_response(),
        Err(e) => failure(e),
    }
}

// ── Dead letters ───────────────────────────────────────────────

/// GET /api/v1/admin/dead-letters
pub async fn list_dead_letters(
    State(state): State<ApiState>,
    Query(query): Query<LimitQuery>,
) -> impl IntoResponse {
    match state.store.list_dead_letters(query.limit.unwrap_or(DEFAULT_LIMIT)) {
        Ok(entries) => ApiResponse::ok(entries).into_response(),
        Err(e) => failure(e),
    }
}

/// POST /api/v1/admin/dead-letters/reprocess
pub async fn reprocess_dead_letters(State(state): State<ApiState>) -> impl IntoResponse {
    match state.dead_letters.reprocess_batch(epoch_millis()) {
        Ok(summary) => ApiResponse::ok(serde_json::json!({
            "requeued": summary.requeued,
            "coalesced": summary.coalesced,
            "failed": summary.failed,
        }))
        .into_response(),
        Err(e) => failure(e),
    }
}

/// POST /api/v1/admin/dead-letters/{id}/reprocess
pub async fn reprocess_dead_letter(
    State(state): State<ApiState>,
    Path(id): Path<u64>,
) -> impl IntoResponse {
    match state.dead_letters.reprocess(id, epoch_millis()) {
        Ok(Some(Requeue::Requeued(task_id))) => ApiResponse::ok(serde_json::json!({
            "entry_id": id,
            "task_id": task_id,
            "coalesced": false,
        }))
        .into_response(),
        Ok(Some(Requeue::Coalesced(task_id))) => ApiResponse::ok(serde_json::json!({
            "entry_id": id,
            "task_id": task_id,
            "coalesced": true,
        }))
        .into_response(),
        Ok(None) => error_response("dead letter not found", StatusCode::NOT_FOUND).into_response(),
        Err(e) => failure(e),
    }
}

// ── Tasks & audit ──────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
pub struct TaskQuery {
    #[serde(default)]
    pub status: Option<TaskStatus>,
    #[serde(default)]
    pub limit: Option<usize>,
}

/// GET /api/v1/admin/tasks?status=PENDING
pub async fn list_tasks(State(state): State<ApiState>, Query(query): Query<TaskQuery>) -> impl IntoResponse {
    match state.store.list_tasks(query.status) {
        Ok(mut tasks) => {
            tasks.truncate(query.limit.unwrap_or(DEFAULT_LIMIT));
            ApiResponse::ok(tasks).into_response()
        }
        Err(e) => failure(e),
    }
}

/// GET /api/v1/admin/audit
pub async fn list_audit(State(state): State<ApiState>, Query(query): Query<LimitQuery>) -> impl IntoResponse {
    match state.store.list_audit(query.limit.unwrap_or(DEFAULT_LIMIT)) {
        Ok(records) => ApiResponse::ok(records).into_response(),
        Err(e) => failure(e),
    }
}
