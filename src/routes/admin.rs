//! Gateway admin endpoints
//!
//! - GET /admin/routes - current route table
//! - POST /admin/routes/reload - re-read the route file
//! - GET /admin/instances - cached registry snapshot
//! - GET /admin/circuits - per-instance circuit state

use bytes::Bytes;
use http_body_util::Full;
use hyper::{Method, Response, StatusCode};
use serde::Serialize;
use std::sync::Arc;

use crate::discovery::RegistryCache;
use crate::proxy::CircuitBreakers;
use crate::registry::RegistrySnapshot;
use crate::routing::{Route, RouteTableHandle};
use crate::server::response::{
    error_response, json_response, method_not_allowed_response, not_found_response,
};

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RoutesResponse<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    source: Option<String>,
    routes: Vec<&'a Route>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct InstancesResponse<'a> {
    ready: bool,
    #[serde(flatten)]
    snapshot: &'a RegistrySnapshot,
}

/// Route an `/admin/*` request
pub async fn handle_admin_request(
    method: &Method,
    path: &str,
    routes: &RouteTableHandle,
    cache: &RegistryCache,
    circuits: &Arc<CircuitBreakers>,
) -> Response<Full<Bytes>> {
    match (method, path.trim_end_matches('/')) {
        (&Method::GET, "/admin/routes") => list_routes(routes).await,
        (&Method::POST, "/admin/routes/reload") => reload_routes(routes).await,
        (&Method::GET, "/admin/instances") => list_instances(cache).await,
        (&Method::GET, "/admin/circuits") => {
            json_response(StatusCode::OK, &circuits.statuses())
        }
        (_, "/admin/routes" | "/admin/routes/reload" | "/admin/instances" | "/admin/circuits") => {
            method_not_allowed_response()
        }
        _ => not_found_response(path),
    }
}

async fn list_routes(routes: &RouteTableHandle) -> Response<Full<Bytes>> {
    let table = routes.current().await;
    json_response(
        StatusCode::OK,
        &RoutesResponse {
            source: routes.path().map(|p| p.display().to_string()),
            routes: table.routes().iter().map(Arc::as_ref).collect(),
        },
    )
}

async fn reload_routes(routes: &RouteTableHandle) -> Response<Full<Bytes>> {
    match routes.reload().await {
        Ok(count) => json_response(
            StatusCode::OK,
            &serde_json::json!({ "reloaded": true, "routes": count }),
        ),
        Err(e) => error_response(&e),
    }
}

async fn list_instances(cache: &RegistryCache) -> Response<Full<Bytes>> {
    let snapshot = cache.snapshot().await;
    json_response(
        StatusCode::OK,
        &InstancesResponse {
            ready: cache.is_ready(),
            snapshot: &snapshot,
        },
    )
}
