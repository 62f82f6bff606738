//! Redirect filter for the git smart-HTTP layer.
//!
//! Requests for `/{owner}/{name}.git/...` are routed through the engine. When
//! the chosen node is not this one the client gets a 307 to the same path
//! and query on that node; otherwise the request is served locally.
//! Routing failures are logged and served locally.

use std::sync::Arc;

use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::{IntoResponse, Redirect, Response};
use tracing::{debug, warn};

use gitgrid_routing::RoutingEngine;
use gitgrid_state::{NodeId, StateStore};

const RECEIVE_PACK: &str = "git-receive-pack";

#[derive(Clone)]
pub struct RedirectState {
    pub store: StateStore,
    pub engine: Arc<RoutingEngine>,
    /// Identity of the node serving this request.
    pub local_node_id: NodeId,
    /// `http` or `https`.
    pub scheme: String,
    pub enabled: bool,
}

/// Owner and repository name from a git HTTP path. The `.git` suffix is
/// optional.
pub fn repository_path(path: &str) -> Option<(&str, &str)> {
    let mut segments = path.trim_start_matches('/').splitn(3, '/');
    let owner = segments.next()?;
    let name = segments.next()?;
    let name = name.strip_suffix(".git").unwrap_or(name);
    if owner.is_empty() || name.is_empty() {
        return None;
    }
    Some((owner, name))
}

/// Pushes hit `git-receive-pack`, either as the endpoint or as the
/// advertised service.
pub fn is_write(path: &str, query: Option<&str>) -> bool {
    if path.ends_with(RECEIVE_PACK) {
        return true;
    }
    query.is_some_and(|q| {
        q.split('&')
            .any(|pair| pair == format!("service={RECEIVE_PACK}"))
    })
}

/// `scheme://host<path>[?query]`
pub fn redirect_location(scheme: &str, host: &str, path: &str, query: Option<&str>) -> String {
    match query {
        Some(q) if !q.is_empty() => format!("{scheme}://{host}{path}?{q}"),
        _ => format!("{scheme}://{host}{path}"),
    }
}

/// Middleware: redirect to the routed node, or pass through.
pub async fn git_redirect(State(state): State<RedirectState>, request: Request, next: Next) -> Response {
    if !state.enabled {
        return next.run(request).await;
    }
    let path = request.uri().path().to_string();
    let query = request.uri().query().map(str::to_string);
    let Some((owner, name)) = repository_path(&path) else {
        return next.run(request).await;
    };

    let repo = match state.store.find_repository(owner, name) {
        Ok(Some(repo)) => repo,
        Ok(None) => return next.run(request).await,
        Err(e) => {
            warn!(%owner, %name, error = %e, "repository lookup failed, serving locally");
            return next.run(request).await;
        }
    };

    let write = is_write(&path, query.as_deref());
    let decision = if write {
        state.engine.route_for_write(repo.id).await
    } else {
        state.engine.route_for_read(repo.id).await
    };
    match decision {
        Ok(Some(decision)) if decision.node_id != state.local_node_id => {
            let location = redirect_location(&state.scheme, &decision.host, &path, query.as_deref());
            debug!(repo_id = repo.id, node_id = %decision.node_id, write, "redirecting git request");
            Redirect::temporary(&location).into_response()
        }
        Ok(_) => next.run(request).await,
        Err(e) => {
            warn!(repo_id = repo.id, error = %e, "routing failed, serving locally");
            next.run(request).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::Router;
    use axum::body::Body;
    use axum::http::{StatusCode, header};
    use axum::middleware;
    use axum::routing::get;
    use tower::ServiceExt;

    use gitgrid_core::{LagMode, RoutingConfig};
    use gitgrid_metrics::NoopMetrics;
    use gitgrid_notify::NoopNotifier;
    use gitgrid_routing::{RoutingSettings, policy_for};
    use gitgrid_state::{
        HealthStatus, NodeInfo, NodeStatus, RepoLocation, Replica, RepositoryInfo,
    };

    fn node(id: &str) -> NodeInfo {
        NodeInfo {
            id: id.to_string(),
            host: format!("{id}.internal:8443"),
            zone: None,
            region: None,
            status: NodeStatus::Healthy,
            disk_usage_pct: 0.0,
            iops: 0.0,
            repo_count: 0,
            last_heartbeat: 0,
        }
    }

    fn redirect_state(enabled: bool) -> RedirectState {
        let store = StateStore::open_in_memory().unwrap();
        store.put_node(&node("node-a")).unwrap();
        store.put_node(&node("node-b")).unwrap();
        store
            .put_repository(&RepositoryInfo {
                id: 1,
                owner: "acme".to_string(),
                name: "widgets".to_string(),
                stars: 0,
                watchers: 0,
                last_commit_at: None,
                created_at: 0,
            })
            .unwrap();
        store.put_location(&RepoLocation::new(1, "node-a", 0)).unwrap();
        store
            .put_replica(&Replica {
                repo_id: 1,
                node_id: "node-b".to_string(),
                health: HealthStatus::Healthy,
                lag_ms: Some(0),
                lag_commits: Some(0),
                updated_at: 0,
            })
            .unwrap();

        let engine = RoutingEngine::new(
            store.clone(),
            policy_for(LagMode::Time),
            RoutingSettings::from_config(&RoutingConfig::default()),
            Arc::new(NoopMetrics),
            Arc::new(NoopNotifier),
        );
        RedirectState {
            store,
            engine: Arc::new(engine),
            local_node_id: "node-a".to_string(),
            scheme: "https".to_string(),
            enabled,
        }
    }

    fn app(state: RedirectState) -> Router {
        Router::new()
            .route("/{*path}", get(|| async { "local" }).post(|| async { "local" }))
            .layer(middleware::from_fn_with_state(state, git_redirect))
    }

    async fn send(app: Router, method: &str, uri: &str) -> Response {
        app.oneshot(axum::http::Request::builder().method(method).uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap()
    }

    #[test]
    fn parses_repository_paths() {
        assert_eq!(repository_path("/acme/widgets.git/info/refs"), Some(("acme", "widgets")));
        assert_eq!(repository_path("/acme/widgets"), Some(("acme", "widgets")));
        assert_eq!(repository_path("/acme"), None);
        assert_eq!(repository_path("//widgets.git"), None);
    }

    #[test]
    fn classifies_pushes() {
        assert!(is_write("/acme/widgets.git/git-receive-pack", None));
        assert!(is_write("/acme/widgets.git/info/refs", Some("service=git-receive-pack")));
        assert!(!is_write("/acme/widgets.git/info/refs", Some("service=git-upload-pack")));
        assert!(!is_write("/acme/widgets.git/git-upload-pack", None));
    }

    #[test]
    fn location_keeps_path_and_query() {
        assert_eq!(
            redirect_location("https", "b:8443", "/a/b.git/info/refs", Some("service=git-upload-pack")),
            "https://b:8443/a/b.git/info/refs?service=git-upload-pack"
        );
        assert_eq!(redirect_location("http", "b", "/a/b.git", None), "http://b/a/b.git");
        assert_eq!(redirect_location("http", "b", "/a/b.git", Some("")), "http://b/a/b.git");
    }

    #[tokio::test]
    async fn read_redirects_to_replica() {
        let resp = send(
            app(redirect_state(true)),
            "GET",
            "/acme/widgets.git/info/refs?service=git-upload-pack",
        )
        .await;
        assert_eq!(resp.status(), StatusCode::TEMPORARY_REDIRECT);
        assert_eq!(
            resp.headers()[header::LOCATION],
            "https://node-b.internal:8443/acme/widgets.git/info/refs?service=git-upload-pack"
        );
    }

    #[tokio::test]
    async fn write_to_local_primary_passes_through() {
        let resp = send(app(redirect_state(true)), "POST", "/acme/widgets.git/git-receive-pack").await;
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn unknown_repository_and_disabled_pass_through() {
        let resp = send(app(redirect_state(true)), "GET", "/acme/missing.git/info/refs").await;
        assert_eq!(resp.status(), StatusCode::OK);

        let resp = send(app(redirect_state(false)), "GET", "/acme/widgets.git/info/refs").await;
        assert_eq!(resp.status(), StatusCode::OK);
    }
}
