//! Gateway server
//!
//! Dispatch order: probes, `/admin/*`, `/registry/*` when the registry is
//! embedded, then the route table. Anything unmatched by a route is a 404
//! from the forwarder.

use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response};
use hyper_util::rt::TokioIo;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

use super::body::collect_limited;
use super::registry::RegistryState;
use super::response::{error_response, to_boxed};
use super::BoxBody;
use crate::discovery::{DiscoveryClient, RegistryCache};
use crate::proxy::{ProxyRequest, RequestForwarder};
use crate::routes::{self, HealthResponse};
use crate::routing::RouteTableHandle;
use crate::types::{GatewayError, Result};

/// Shared state of a gateway server
pub struct GatewayState {
    pub forwarder: Arc<RequestForwarder>,
    pub discovery: Arc<DiscoveryClient>,
    pub routes: Arc<RouteTableHandle>,
    pub cache: Arc<RegistryCache>,
    /// Registry served on the same listener, if embedded
    pub embedded: Option<Arc<RegistryState>>,
    pub started_at: Instant,
}

impl GatewayState {
    pub fn new(
        forwarder: Arc<RequestForwarder>,
        discovery: Arc<DiscoveryClient>,
        routes: Arc<RouteTableHandle>,
    ) -> Self {
        Self {
            forwarder,
            cache: discovery.cache(),
            discovery,
            routes,
            embedded: None,
            started_at: Instant::now(),
        }
    }

    pub fn with_embedded_registry(mut self, registry: Arc<RegistryState>) -> Self {
        self.embedded = Some(registry);
        self
    }

    /// Probe report; not ready until the first registry snapshot arrived
    pub async fn health(&self) -> HealthResponse {
        let mut report = HealthResponse::new("gatehouse", self.started_at);
        let snapshot = self.cache.snapshot().await;
        report.instances = Some(snapshot.instance_count());
        report.registry_version = Some(snapshot.version);
        report.routes = Some(self.routes.current().await.len());

        if self.cache.is_ready() {
            report
        } else {
            let failures = self.discovery.consecutive_failures();
            report.not_ready(
                "starting",
                format!("no registry snapshot yet ({} failed fetches)", failures),
            )
        }
    }
}

/// Bind `addr` and serve until the task is dropped
pub async fn run(state: Arc<GatewayState>, addr: SocketAddr) -> Result<()> {
    let listener = TcpListener::bind(addr).await?;
    serve(listener, state).await
}

/// Serve the gateway on an already bound listener
pub async fn serve(listener: TcpListener, state: Arc<GatewayState>) -> Result<()> {
    info!(
        "Gateway listening on {} with {} routes",
        listener.local_addr()?,
        state.routes.current().await.len()
    );
    if state.embedded.is_some() {
        info!("Embedded registry enabled at /registry/*");
    }

    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                let state = Arc::clone(&state);
                tokio::spawn(async move {
                    let io = TokioIo::new(stream);

                    let service = service_fn(move |req| {
                        let state = Arc::clone(&state);
                        async move { handle_request(state, addr, req).await }
                    });

                    if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
                        error!("Error serving connection from {}: {:?}", addr, err);
                    }
                });
            }
            Err(e) => {
                error!("Error accepting connection: {:?}", e);
            }
        }
    }
}

/// Route incoming gateway requests
pub async fn handle_request(
    state: Arc<GatewayState>,
    addr: SocketAddr,
    req: Request<Incoming>,
) -> std::result::Result<Response<BoxBody>, hyper::Error> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    let host = req
        .headers()
        .get("host")
        .and_then(|h| h.to_str().ok())
        .unwrap_or("");
    info!("[{}] {} {} (host: {})", addr, method, path, host);

    let response = match (&method, path.as_str()) {
        (&Method::GET, "/health") | (&Method::GET, "/healthz") => {
            to_boxed(routes::health_check(&state.health().await))
        }
        (&Method::GET, "/ready") | (&Method::GET, "/readyz") => {
            to_boxed(routes::readiness_check(&state.health().await))
        }
        (&Method::GET, "/version") => to_boxed(routes::version_info("gatehouse")),
        _ if path == "/admin" || path.starts_with("/admin/") => to_boxed(
            routes::handle_admin_request(
                &method,
                &path,
                &state.routes,
                &state.cache,
                state.forwarder.circuits(),
            )
            .await,
        ),
        _ if path == "/registry" || path.starts_with("/registry/") => match &state.embedded {
            Some(registry) => to_boxed(routes::handle_registry_request(&registry.store, req).await),
            None => forward(&state, addr, req).await,
        },
        _ => forward(&state, addr, req).await,
    };

    Ok(response)
}

/// Forward to an upstream instance, mapping failures to error bodies
async fn forward(state: &GatewayState, addr: SocketAddr, req: Request<Incoming>) -> Response<BoxBody> {
    let path = req.uri().path().to_string();
    match proxy(state, addr, req).await {
        Ok(response) => response,
        Err(e) => {
            match &e {
                GatewayError::NoRoute(_) => debug!("{}", e),
                _ => warn!("Proxy {} failed: {}", path, e),
            }
            to_boxed(error_response(&e))
        }
    }
}

async fn proxy(
    state: &GatewayState,
    addr: SocketAddr,
    req: Request<Incoming>,
) -> Result<Response<BoxBody>> {
    let (parts, body) = req.into_parts();
    let body = collect_limited(body, state.forwarder.config().max_body_bytes).await?;

    let host = parts
        .headers
        .get(hyper::header::HOST)
        .and_then(|h| h.to_str().ok())
        .map(str::to_string)
        .or_else(|| parts.uri.authority().map(|a| a.to_string()));

    let request = ProxyRequest {
        method: parts.method,
        host,
        path: parts.uri.path().to_string(),
        query: parts.uri.query().map(str::to_string),
        headers: parts.headers,
        body,
        client_addr: Some(addr),
    };

    let forwarded = state.forwarder.forward(&request).await?;
    debug!(
        route = %forwarded.route_id,
        instance = %forwarded.instance,
        attempts = forwarded.attempts,
        status = %forwarded.response.status,
        "Forwarded"
    );

    let upstream = forwarded.response;
    let mut response = Response::new(
        Full::new(upstream.body)
            .map_err(|never| match never {})
            .boxed(),
    );
    *response.status_mut() = upstream.status;
    *response.headers_mut() = upstream.headers;
    Ok(response)
}
