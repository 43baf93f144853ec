//! Request forwarder
//!
//! Resolves a live instance for the inbound request, rewrites the request
//! per the route, and calls the instance under the route timeout and the
//! instance's circuit breaker. A transport error or timeout is retried
//! once on a different instance of the same service; a second failure
//! surfaces as `BadGateway`. Upstream 5xx answers go back to the client
//! unchanged but count against the circuit.

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use hyper::header::{self, HeaderMap, HeaderName, HeaderValue};
use hyper::{Method, StatusCode};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use super::circuit::CircuitBreakers;
use super::filters::{apply_request_headers, apply_response_headers, rewrite_path};
use crate::registry::{InstanceKey, ServiceInstance};
use crate::routing::{Route, RouteResolver};
use crate::types::{GatewayError, Result};

/// Header carrying an explicit client identity for client-hash balancing
pub const CLIENT_ID_HEADER: &str = "x-client-id";

const X_FORWARDED_FOR: &str = "x-forwarded-for";
const X_FORWARDED_HOST: &str = "x-forwarded-host";
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";

/// Headers meaningful only for a single transport hop
const HOP_BY_HOP: [&str; 9] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Remove hop-by-hop headers, including any named in `Connection`
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let listed: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();

    for name in listed {
        headers.remove(name);
    }
    for name in HOP_BY_HOP {
        headers.remove(name);
    }
}

/// Call to one upstream instance
#[derive(Debug, Clone)]
pub struct UpstreamRequest {
    pub method: Method,
    pub url: String,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub timeout: Duration,
}

/// Fully buffered upstream answer
#[derive(Debug, Clone)]
pub struct UpstreamResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// Transport to upstream instances
#[async_trait]
pub trait Upstream: Send + Sync {
    /// Send one request. Errors mean the instance did not answer in time.
    async fn send(&self, request: UpstreamRequest) -> Result<UpstreamResponse>;
}

/// Default cap on a buffered upstream response body
pub const DEFAULT_MAX_RESPONSE_BYTES: usize = 64 * 1024 * 1024;

/// Upstream transport over reqwest
pub struct HttpUpstream {
    client: reqwest::Client,
    max_response_bytes: usize,
}

impl HttpUpstream {
    pub fn new(connect_timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .redirect(reqwest::redirect::Policy::none())
            .user_agent(concat!("gatehouse/", env!("CARGO_PKG_VERSION")))
            .build()
            .unwrap_or_default();
        Self {
            client,
            max_response_bytes: DEFAULT_MAX_RESPONSE_BYTES,
        }
    }

    pub fn with_max_response_bytes(mut self, limit: usize) -> Self {
        self.max_response_bytes = limit;
        self
    }
}

fn response_too_large(limit: usize) -> GatewayError {
    GatewayError::BadGateway(format!("upstream response exceeds {} bytes", limit))
}

#[async_trait]
impl Upstream for HttpUpstream {
    async fn send(&self, request: UpstreamRequest) -> Result<UpstreamResponse> {
        let timeout = request.timeout;
        let call = async {
            let mut response = self
                .client
                .request(request.method, &request.url)
                .headers(request.headers)
                .body(request.body)
                .timeout(timeout)
                .send()
                .await?;

            let limit = self.max_response_bytes;
            if response.content_length().is_some_and(|len| len > limit as u64) {
                return Err(response_too_large(limit));
            }

            let status = response.status();
            let headers = response.headers().clone();
            let mut body = BytesMut::new();
            while let Some(chunk) = response.chunk().await? {
                if body.len() + chunk.len() > limit {
                    return Err(response_too_large(limit));
                }
                body.extend_from_slice(&chunk);
            }
            Ok::<_, GatewayError>(UpstreamResponse {
                status,
                headers,
                body: body.freeze(),
            })
        };

        tokio::time::timeout(timeout, call).await?
    }
}

/// Inbound request, body already buffered
#[derive(Debug, Clone)]
pub struct ProxyRequest {
    pub method: Method,
    /// Host header as received
    pub host: Option<String>,
    pub path: String,
    pub query: Option<String>,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub client_addr: Option<SocketAddr>,
}

impl ProxyRequest {
    /// Identity used for client-hash balancing: `X-Client-Id`, else client IP
    pub fn client_key(&self) -> Option<String> {
        self.headers
            .get(CLIENT_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty())
            .map(str::to_string)
            .or_else(|| self.client_addr.map(|addr| addr.ip().to_string()))
    }
}

#[derive(Debug, Clone)]
pub struct ForwarderConfig {
    /// Upstream timeout for routes without `timeoutMs`
    pub default_timeout: Duration,
    /// Largest request body buffered for forwarding
    pub max_body_bytes: usize,
    /// Instances tried per request, including the first
    pub max_attempts: u32,
}

impl Default for ForwarderConfig {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_secs(30),
            max_body_bytes: 10 * 1024 * 1024,
            max_attempts: 2,
        }
    }
}

/// Outcome of a forwarded request
#[derive(Debug)]
pub struct Forwarded {
    pub response: UpstreamResponse,
    pub route_id: String,
    pub instance: InstanceKey,
    pub attempts: u32,
}

pub struct RequestForwarder {
    resolver: Arc<RouteResolver>,
    upstream: Arc<dyn Upstream>,
    circuits: Arc<CircuitBreakers>,
    config: ForwarderConfig,
}

impl RequestForwarder {
    pub fn new(
        resolver: Arc<RouteResolver>,
        upstream: Arc<dyn Upstream>,
        circuits: Arc<CircuitBreakers>,
        config: ForwarderConfig,
    ) -> Self {
        Self {
            resolver,
            upstream,
            circuits,
            config,
        }
    }

    pub fn config(&self) -> &ForwarderConfig {
        &self.config
    }

    pub fn circuits(&self) -> &Arc<CircuitBreakers> {
        &self.circuits
    }

    /// Forward a request to an instance of its route's target
    pub async fn forward(&self, request: &ProxyRequest) -> Result<Forwarded> {
        let route = self
            .resolver
            .match_route(request.host.as_deref(), &request.path)
            .await?;
        let client_key = request.client_key();
        let timeout = route.timeout(self.config.default_timeout);

        let mut exclude: Vec<InstanceKey> = Vec::new();
        let mut circuit_skipped = false;
        let mut attempts = 0u32;
        let mut last_error: Option<GatewayError> = None;

        loop {
            let instance = match self
                .resolver
                .pick(&route, client_key.as_deref(), &exclude)
                .await
            {
                Ok(instance) => instance,
                Err(GatewayError::NoInstanceAvailable(service)) => {
                    return Err(match last_error {
                        Some(e) => GatewayError::BadGateway(format!(
                            "{} failed and no other instance is available: {}",
                            service, e
                        )),
                        None if circuit_skipped => GatewayError::CircuitOpen(service),
                        None => GatewayError::NoInstanceAvailable(service),
                    });
                }
                Err(e) => return Err(e),
            };

            let key = instance.key();
            let Some(permit) = self.circuits.acquire(&key) else {
                debug!(instance = %key, "Circuit open, skipping instance");
                circuit_skipped = true;
                exclude.push(key);
                continue;
            };

            attempts += 1;
            let upstream_request = self.build_request(&route, &instance, request, timeout);
            match self.upstream.send(upstream_request).await {
                Ok(mut response) => {
                    if response.status.is_server_error() {
                        permit.failure();
                    } else {
                        permit.success();
                    }

                    strip_hop_by_hop(&mut response.headers);
                    if request.method != Method::HEAD {
                        response.headers.remove(header::CONTENT_LENGTH);
                    }
                    apply_response_headers(&route.filters, &mut response.headers);

                    return Ok(Forwarded {
                        response,
                        route_id: route.id.clone(),
                        instance: key,
                        attempts,
                    });
                }
                Err(e) => {
                    permit.failure();
                    warn!(
                        route = %route.id,
                        instance = %key,
                        attempt = attempts,
                        "Upstream call failed: {}",
                        e
                    );

                    if attempts >= self.config.max_attempts.max(1) {
                        return Err(GatewayError::BadGateway(format!(
                            "{} failed after {} attempt(s): {}",
                            route.target, attempts, e
                        )));
                    }
                    exclude.push(key);
                    last_error = Some(e);
                }
            }
        }
    }

    fn build_request(
        &self,
        route: &Route,
        instance: &ServiceInstance,
        request: &ProxyRequest,
        timeout: Duration,
    ) -> UpstreamRequest {
        let path = rewrite_path(&route.filters, &request.path);
        let url = match &request.query {
            Some(query) if !query.is_empty() => format!("{}{}?{}", instance.base_url(), path, query),
            _ => format!("{}{}", instance.base_url(), path),
        };

        let mut headers = request.headers.clone();
        strip_hop_by_hop(&mut headers);
        headers.remove(header::HOST);
        headers.remove(header::CONTENT_LENGTH);
        add_forwarded_headers(&mut headers, request);

        if let Some(host) = apply_request_headers(&route.filters, &mut headers) {
            if let Ok(value) = HeaderValue::from_str(&host) {
                headers.insert(header::HOST, value);
            }
        }

        UpstreamRequest {
            method: request.method.clone(),
            url,
            headers,
            body: request.body.clone(),
            timeout,
        }
    }
}

fn add_forwarded_headers(headers: &mut HeaderMap, request: &ProxyRequest) {
    if let Some(addr) = request.client_addr {
        let ip = addr.ip().to_string();
        let chain = match headers.get(X_FORWARDED_FOR).and_then(|v| v.to_str().ok()) {
            Some(existing) if !existing.is_empty() => format!("{}, {}", existing, ip),
            _ => ip,
        };
        if let Ok(value) = HeaderValue::from_str(&chain) {
            headers.insert(X_FORWARDED_FOR, value);
        }
    }

    if !headers.contains_key(X_FORWARDED_HOST) {
        if let Some(value) = request
            .host
            .as_deref()
            .and_then(|h| HeaderValue::from_str(h).ok())
        {
            headers.insert(X_FORWARDED_HOST, value);
        }
    }

    if !headers.contains_key(X_FORWARDED_PROTO) {
        headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static("http"));
    }
}
