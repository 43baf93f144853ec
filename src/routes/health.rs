//! Health check endpoints
//!
//! Kubernetes-style probes served by every gatehouse binary:
//! - /health, /healthz - Liveness probe (is the process running?)
//! - /ready, /readyz - Readiness probe (should traffic be sent here?)
//! - /version - Build metadata for deployment verification
//!
//! What "ready" means differs per binary: the registry is not ready while
//! self-preservation holds, the gateway is not ready before its first
//! registry snapshot, and the sidecar is not ready while its instance
//! reports STARTING.

use bytes::Bytes;
use http_body_util::Full;
use hyper::{Response, StatusCode};
use serde::Serialize;
use std::time::Instant;

use crate::registry::InstanceStatus;

/// Probe body shared by all binaries
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    /// Process is up
    pub healthy: bool,
    /// `online`, `degraded` or `starting`
    pub status: &'static str,
    pub service: &'static str,
    pub version: &'static str,
    /// Seconds since the server started
    pub uptime: u64,
    pub timestamp: String,
    /// Instances known to this process
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instances: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub registry_version: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub routes: Option<usize>,
    /// Self-reported status of a sidecar's instance
    #[serde(skip_serializing_if = "Option::is_none")]
    pub local_status: Option<InstanceStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl HealthResponse {
    pub fn new(service: &'static str, started_at: Instant) -> Self {
        Self {
            healthy: true,
            status: "online",
            service,
            version: env!("CARGO_PKG_VERSION"),
            uptime: started_at.elapsed().as_secs(),
            timestamp: chrono::Utc::now().to_rfc3339(),
            instances: None,
            registry_version: None,
            routes: None,
            local_status: None,
            error: None,
        }
    }

    /// Mark not ready, with a reason
    pub fn not_ready(mut self, status: &'static str, error: String) -> Self {
        self.status = status;
        self.error = Some(error);
        self
    }

    pub fn is_ready(&self) -> bool {
        self.error.is_none()
    }
}

fn probe_response(status: StatusCode, report: &HealthResponse) -> Response<Full<Bytes>> {
    let body = serde_json::to_string(report)
        .unwrap_or_else(|_| r#"{"healthy":true,"error":"Serialization failed"}"#.to_string());

    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .header("Cache-Control", "no-store")
        .body(Full::new(Bytes::from(body)))
        .unwrap()
}

/// Liveness probe: always 200 while the process serves requests
pub fn health_check(report: &HealthResponse) -> Response<Full<Bytes>> {
    probe_response(StatusCode::OK, report)
}

/// Readiness probe: 200 when ready, 503 otherwise
pub fn readiness_check(report: &HealthResponse) -> Response<Full<Bytes>> {
    let status = if report.is_ready() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    probe_response(status, report)
}

/// Version information for deployment verification
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionResponse {
    pub version: &'static str,
    /// Git commit hash (short)
    pub commit: &'static str,
    /// Git commit hash (full)
    pub commit_full: &'static str,
    pub build_time: &'static str,
    pub service: &'static str,
}

/// Handle version endpoint (/version)
pub fn version_info(service: &'static str) -> Response<Full<Bytes>> {
    let response = VersionResponse {
        version: env!("CARGO_PKG_VERSION"),
        commit: option_env!("GIT_COMMIT_SHORT").unwrap_or("unknown"),
        commit_full: option_env!("GIT_COMMIT_FULL").unwrap_or("unknown"),
        build_time: option_env!("BUILD_TIMESTAMP").unwrap_or("unknown"),
        service,
    };

    let body = serde_json::to_string(&response)
        .unwrap_or_else(|_| r#"{"version":"unknown","commit":"unknown"}"#.to_string());

    Response::builder()
        .status(StatusCode::OK)
        .header("Content-Type", "application/json")
        .body(Full::new(Bytes::from(body)))
        .unwrap()
}
