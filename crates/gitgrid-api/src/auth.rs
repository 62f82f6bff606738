//! Shared-secret header checks.
//!
//! A blank configured secret disables the check. That default fails open
//! and `GitgridConfig::validate` warns about it at startup.

use axum::extract::{Request, State};
use axum::http::{HeaderMap, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use tracing::debug;

use crate::ApiState;
use crate::handlers::error_response;

pub const ADMIN_KEY_HEADER: &str = "x-gitgrid-admin-key";
pub const ROUTE_SECRET_HEADER: &str = "x-gitgrid-route-secret";
/// Optional caller identity recorded in the audit log.
pub const ACTOR_HEADER: &str = "x-gitgrid-actor";

/// True when `expected` is blank or `header` carries exactly `expected`.
pub fn authorized(expected: &str, headers: &HeaderMap, header: &str) -> bool {
    if expected.is_empty() {
        return true;
    }
    headers
        .get(header)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| constant_time_eq(v.as_bytes(), expected.as_bytes()))
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Audit actor for an admin request.
pub fn actor(headers: &HeaderMap) -> String {
    headers
        .get(ACTOR_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .unwrap_or("admin")
        .to_string()
}

/// Middleware guarding the admin and internal routes.
pub async fn require_admin(State(state): State<ApiState>, request: Request, next: Next) -> Response {
    if !authorized(&state.auth.admin_key, request.headers(), ADMIN_KEY_HEADER) {
        debug!(path = %request.uri().path(), "admin request rejected");
        return error_response("missing or invalid admin key", StatusCode::UNAUTHORIZED).into_response();
    }
    next.run(request).await
}
