//! Sidecar probe server
//!
//! Exposes only the probes, so the sidecar's readiness can be wired into an
//! orchestrator. Not ready while the instance is unregistered or reports
//! STARTING after repeated registry failures.

use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response};
use hyper_util::rt::TokioIo;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tracing::{debug, error, info};

use super::response::{not_found_response, to_boxed};
use super::BoxBody;
use crate::discovery::DiscoveryClient;
use crate::registry::InstanceStatus;
use crate::routes::{self, HealthResponse};
use crate::types::Result;

pub struct SidecarState {
    pub discovery: Arc<DiscoveryClient>,
    pub started_at: Instant,
}

impl SidecarState {
    pub fn new(discovery: Arc<DiscoveryClient>) -> Self {
        Self {
            discovery,
            started_at: Instant::now(),
        }
    }

    pub async fn health(&self) -> HealthResponse {
        let mut report = HealthResponse::new("gatehouse-sidecar", self.started_at);
        let status = self.discovery.local_status().await;
        report.local_status = status;

        if !self.discovery.is_registered() {
            return report.not_ready("starting", "instance not registered yet".into());
        }
        match status {
            Some(InstanceStatus::Starting) => report.not_ready(
                "starting",
                format!(
                    "registry unreachable ({} consecutive failures)",
                    self.discovery.consecutive_failures()
                ),
            ),
            _ => report,
        }
    }
}

pub async fn run(state: Arc<SidecarState>, addr: SocketAddr) -> Result<()> {
    let listener = TcpListener::bind(addr).await?;
    serve(listener, state).await
}

pub async fn serve(listener: TcpListener, state: Arc<SidecarState>) -> Result<()> {
    info!("Sidecar probes listening on {}", listener.local_addr()?);

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

async fn handle_request(
    state: Arc<SidecarState>,
    addr: SocketAddr,
    req: Request<Incoming>,
) -> std::result::Result<Response<BoxBody>, hyper::Error> {
    let path = req.uri().path();
    debug!("[{}] {} {}", addr, req.method(), path);

    let response = match (req.method(), path) {
        (&Method::GET, "/health") | (&Method::GET, "/healthz") => {
            routes::health_check(&state.health().await)
        }
        (&Method::GET, "/ready") | (&Method::GET, "/readyz") => {
            routes::readiness_check(&state.health().await)
        }
        (&Method::GET, "/version") => routes::version_info("gatehouse-sidecar"),
        _ => not_found_response(path),
    };

    Ok(to_boxed(response))
}
