//! gitgrid-api — REST API for GitGrid.
//!
//! Axum handlers for routing queries, the admin surface, and the internal
//! repository events. The redirect filter for the git protocol layer lives
//! in [`redirect`].
//!
//! # API Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | GET | `/api/v1/route/{owner}/{name}?mode=read\|write` | Routing query |
//! | GET/PUT/DELETE | `/api/v1/admin/nodes/{id}` | Node records |
//! | POST | `/api/v1/admin/nodes/{id}/heartbeat` | Node heartbeat |
//! | GET/PUT/DELETE | `/api/v1/admin/repos/{id}/location` | Primary location |
//! | GET/PUT | `/api/v1/admin/repos/{id}/replicas` | Replica set (bulk sync) |
//! | PATCH | `/api/v1/admin/repos/{id}/replicas/{node}` | Replica health/lag |
//! | POST | `/api/v1/admin/repos/{id}/promote` | Promote a replica |
//! | GET | `/api/v1/admin/summary/{repos,nodes,zones}` | Lag summaries |
//! | POST | `/api/v1/admin/backfill` | Run the legacy backfill |
//! | GET | `/api/v1/admin/backfill/stats` | Backfill progress |
//! | GET | `/api/v1/admin/dead-letters` | Dead letters |
//! | POST | `/api/v1/admin/dead-letters/reprocess` | Reprocess a batch |
//! | POST | `/api/v1/admin/dead-letters/{id}/reprocess` | Reprocess one |
//! | GET | `/api/v1/admin/tasks` | Replication tasks |
//! | GET | `/api/v1/admin/audit` | Routing audit log |
//! | POST | `/api/v1/internal/events/repository-created` | Repository created |
//! | POST | `/api/v1/internal/events/repository-pushed` | Repository pushed |
//! | GET | `/metrics` | Prometheus exposition |

pub mod admin;
pub mod auth;
pub mod handlers;
pub mod redirect;
pub mod summary;

use std::sync::Arc;

use axum::Router;
use axum::middleware;
use axum::routing::{get, patch, post};

use gitgrid_capacity::{Backfill, RepositoryEvents};
use gitgrid_metrics::{ReplicationCounters, TrafficTracker};
use gitgrid_queue::DeadLetterReprocessor;
use gitgrid_routing::{NodeRegistry, RoutingEngine};
use gitgrid_state::StateStore;

/// Configured shared secrets. Blank disables the check.
#[derive(Debug, Clone, Default)]
pub struct AuthConfig {
    pub admin_key: String,
    pub route_secret: String,
}

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub store: StateStore,
    pub engine: Arc<RoutingEngine>,
    pub registry: Arc<NodeRegistry>,
    pub traffic: TrafficTracker,
    pub counters: Arc<ReplicationCounters>,
    pub events: Arc<RepositoryEvents>,
    pub backfill: Arc<Backfill>,
    pub dead_letters: Arc<DeadLetterReprocessor>,
    pub auth: AuthConfig,
}

/// Build the complete API router (routing, admin, internal events, metrics).
pub fn build_router(state: ApiState) -> Router {
    let admin_routes = Router::new()
        .route("/nodes", get(admin::list_nodes))
        .route(
            "/nodes/{id}",
            get(admin::get_node).put(admin::upsert_node).delete(admin::delete_node),
        )
        .route("/nodes/{id}/heartbeat", post(admin::heartbeat))
        .route(
            "/repos/{id}/location",
            get(admin::get_location).put(admin::put_location).delete(admin::delete_location),
        )
        .route("/repos/{id}/replicas", get(admin::list_replicas).put(admin::sync_replicas))
        .route("/repos/{id}/replicas/{node}", patch(admin::update_replica))
        .route("/repos/{id}/promote", post(admin::promote))
        .route("/summary/repos", get(admin::summary_by_repo))
        .route("/summary/nodes", get(admin::summary_by_node))
        .route("/summary/zones", get(admin::summary_by_zone))
        .route("/backfill", post(admin::run_backfill))
        .route("/backfill/stats", get(admin::backfill_stats))
        .route("/dead-letters", get(admin::list_dead_letters))
        .route("/dead-letters/reprocess", post(admin::reprocess_dead_letters))
        .route("/dead-letters/{id}/reprocess", post(admin::reprocess_dead_letter))
        .route("/tasks", get(admin::list_tasks))
        .route("/audit", get(admin::list_audit));

    let internal_routes = Router::new()
        .route("/events/repository-created", post(handlers::repository_created))
        .route("/events/repository-pushed", post(handlers::repository_pushed));

    let guarded = Router::new()
        .nest("/admin", admin_routes)
        .nest("/internal", internal_routes)
        .layer(middleware::from_fn_with_state(state.clone(), auth::require_admin));

    let api_routes = Router::new()
        .route("/route/{owner}/{name}", get(handlers::route_query))
        .merge(guarded)
        .with_state(state.clone());

    Router::new()
        .nest("/api/v1", api_routes)
        .route("/metrics", get(handlers::prometheus_metrics).with_state(state))
}
