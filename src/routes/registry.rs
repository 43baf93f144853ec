//! Registration API
//!
//! | method | path |
//! |---|---|
//! | POST | `/registry/instances` |
//! | PUT | `/registry/instances/{service}/{id}/heartbeat` |
//! | PUT | `/registry/instances/{service}/{id}/status?value=STATUS` |
//! | GET, DELETE | `/registry/instances/{service}/{id}` |
//! | GET | `/registry/services`, `/registry/services/{service}` |
//! | GET | `/registry/snapshot?sinceVersion=N` |

use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::{Method, Request, Response, StatusCode};
use serde::Deserialize;
use std::borrow::Cow;
use tracing::{debug, warn};

use crate::registry::{InstanceStatus, RegistrationRequest, RegistryStore, SnapshotTag};
use crate::server::body::collect_limited;
use crate::server::response::{
    error_response, json_response, method_not_allowed_response, not_found_response,
    not_modified_response,
};
use crate::types::{GatewayError, Result};

/// Registration payloads are small
const MAX_REGISTRATION_BYTES: usize = 64 * 1024;

#[derive(Debug, Deserialize)]
struct StatusQuery {
    value: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SnapshotQuery {
    since_version: Option<u64>,
    /// Registry run the caller's version belongs to
    epoch: Option<String>,
}

impl SnapshotQuery {
    /// A version from another registry run never counts as current
    fn is_current(&self, tag: &SnapshotTag) -> bool {
        self.since_version == Some(tag.version) && self.epoch.as_deref() == Some(tag.epoch.as_str())
    }
}

/// Split `/registry/...` into percent-decoded segments
fn segments(path: &str) -> Option<Vec<Cow<'_, str>>> {
    let rest = path.strip_prefix("/registry")?;
    rest.split('/')
        .filter(|s| !s.is_empty())
        .map(|s| urlencoding::decode(s).ok())
        .collect()
}

fn parse_query<'a, T: Deserialize<'a> + Default>(query: Option<&'a str>) -> Result<T> {
    match query {
        Some(q) => serde_urlencoded::from_str(q)
            .map_err(|e| GatewayError::Registration(format!("invalid query: {}", e))),
        None => Ok(T::default()),
    }
}

/// Route a `/registry/*` request to its handler
pub async fn handle_registry_request(
    store: &RegistryStore,
    req: Request<Incoming>,
) -> Response<Full<Bytes>> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let query = req.uri().query().map(str::to_string);

    let Some(parts) = segments(&path) else {
        return not_found_response(&path);
    };
    let parts: Vec<&str> = parts.iter().map(|s| s.as_ref()).collect();

    let result = match (method, parts.as_slice()) {
        (Method::POST, ["instances"]) => register(store, req).await,
        (Method::PUT, ["instances", service, id, "heartbeat"]) => {
            renew(store, service, id).await
        }
        (Method::PUT, ["instances", service, id, "status"]) => {
            set_status(store, service, id, query.as_deref()).await
        }
        (Method::GET, ["instances", service, id]) => get_instance(store, service, id).await,
        (Method::DELETE, ["instances", service, id]) => deregister(store, service, id).await,
        (Method::GET, ["services"]) => Ok(json_response(StatusCode::OK, &store.services().await)),
        (Method::GET, ["services", service]) => {
            Ok(json_response(StatusCode::OK, &store.snapshot(service).await))
        }
        (Method::GET, ["snapshot"]) => snapshot(store, query.as_deref()).await,
        (_, ["instances"])
        | (_, ["instances", _, _])
        | (_, ["instances", _, _, "heartbeat" | "status"])
        | (_, ["services"])
        | (_, ["services", _])
        | (_, ["snapshot"]) => Ok(method_not_allowed_response()),
        _ => Ok(not_found_response(&path)),
    };

    result.unwrap_or_else(|e| {
        match &e {
            GatewayError::NotFound(_) => debug!("{}", e),
            _ => warn!("Registry request {} failed: {}", path, e),
        }
        error_response(&e)
    })
}

async fn register(store: &RegistryStore, req: Request<Incoming>) -> Result<Response<Full<Bytes>>> {
    let body = collect_limited(req.into_body(), MAX_REGISTRATION_BYTES).await?;
    let registration: RegistrationRequest = serde_json::from_slice(&body)
        .map_err(|e| GatewayError::Registration(format!("invalid registration: {}", e)))?;

    let instance = store.register(registration).await?;
    Ok(json_response(StatusCode::OK, &instance))
}

async fn renew(store: &RegistryStore, service: &str, id: &str) -> Result<Response<Full<Bytes>>> {
    let instance = store.renew(service, id).await?;
    Ok(json_response(StatusCode::OK, &instance))
}

async fn set_status(
    store: &RegistryStore,
    service: &str,
    id: &str,
    query: Option<&str>,
) -> Result<Response<Full<Bytes>>> {
    let query: StatusQuery = query
        .ok_or_else(|| GatewayError::Registration("missing ?value=STATUS".into()))
        .and_then(|q| {
            serde_urlencoded::from_str(q)
                .map_err(|e| GatewayError::Registration(format!("invalid query: {}", e)))
        })?;
    let status: InstanceStatus = query.value.parse()?;

    let instance = store.set_status(service, id, status).await?;
    Ok(json_response(StatusCode::OK, &instance))
}

async fn get_instance(
    store: &RegistryStore,
    service: &str,
    id: &str,
) -> Result<Response<Full<Bytes>>> {
    let instance = store
        .get(service, id)
        .await
        .ok_or_else(|| GatewayError::NotFound(format!("{}/{}", service, id)))?;
    Ok(json_response(StatusCode::OK, &instance))
}

async fn deregister(
    store: &RegistryStore,
    service: &str,
    id: &str,
) -> Result<Response<Full<Bytes>>> {
    let removed = store.deregister(service, id).await;
    Ok(json_response(
        StatusCode::OK,
        &serde_json::json!({ "removed": removed }),
    ))
}

async fn snapshot(store: &RegistryStore, query: Option<&str>) -> Result<Response<Full<Bytes>>> {
    let query: SnapshotQuery = parse_query(query)?;
    if query.is_current(&store.tag()) {
        return Ok(not_modified_response());
    }
    Ok(json_response(StatusCode::OK, &store.full_snapshot().await))
}
