//! Registry server

use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response};
use hyper_util::rt::TokioIo;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tracing::{error, info};

use super::response::{not_found_response, to_boxed};
use super::BoxBody;
use crate::registry::{LeaseManager, RegistryStore};
use crate::routes::{self, HealthResponse};
use crate::types::GatewayError;

/// Shared state of a registry server
pub struct RegistryState {
    pub store: Arc<RegistryStore>,
    pub lease: Arc<LeaseManager>,
    pub started_at: Instant,
}

impl RegistryState {
    pub fn new(store: Arc<RegistryStore>, lease: Arc<LeaseManager>) -> Self {
        Self {
            store,
            lease,
            started_at: Instant::now(),
        }
    }

    /// Probe report; not ready while self-preservation suspends eviction
    pub async fn health(&self) -> HealthResponse {
        let mut report = HealthResponse::new("gatehouse-registry", self.started_at);
        report.instances = Some(self.store.len().await);
        report.registry_version = Some(self.store.version());

        match self.lease.check_degraded() {
            Ok(()) => report,
            Err(e) => report.not_ready("degraded", e.to_string()),
        }
    }
}

/// Bind `addr` and serve until the task is dropped
pub async fn run(state: Arc<RegistryState>, addr: SocketAddr) -> Result<(), GatewayError> {
    let listener = TcpListener::bind(addr).await?;
    serve(listener, state).await
}

/// Serve the registry on an already bound listener
pub async fn serve(listener: TcpListener, state: Arc<RegistryState>) -> Result<(), GatewayError> {
    info!(
        "Registry listening on {} (lease ttl {:?})",
        listener.local_addr()?,
        state.lease.config().ttl
    );

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

/// Route incoming registry requests
pub async fn handle_request(
    state: Arc<RegistryState>,
    addr: SocketAddr,
    req: Request<Incoming>,
) -> Result<Response<BoxBody>, hyper::Error> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    info!("[{}] {} {}", addr, method, path);

    let response = match (&method, path.as_str()) {
        (&Method::GET, "/health") | (&Method::GET, "/healthz") => {
            routes::health_check(&state.health().await)
        }
        (&Method::GET, "/ready") | (&Method::GET, "/readyz") => {
            routes::readiness_check(&state.health().await)
        }
        (&Method::GET, "/version") => routes::version_info("gatehouse-registry"),
        _ if path == "/registry" || path.starts_with("/registry/") => {
            routes::handle_registry_request(&state.store, req).await
        }
        _ => not_found_response(&path),
    };

    Ok(to_boxed(response))
}
