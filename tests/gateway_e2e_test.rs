//! Gateway end to end: embedded registry, real upstream servers

use bytes::Bytes;
use futures::future::join_all;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use std::collections::HashMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;

use gatehouse::discovery::{DiscoveryClient, DiscoveryConfig, LocalRegistry, RegistryCache};
use gatehouse::proxy::{
    CircuitBreakers, CircuitConfig, ForwarderConfig, HttpUpstream, RequestForwarder, Upstream,
    UpstreamRequest, UpstreamResponse,
};
use gatehouse::registry::{LeaseConfig, LeaseManager, RegistrationRequest, RegistryStore};
use gatehouse::routing::{Route, RouteResolver, RouteTable, RouteTableHandle};
use gatehouse::server::{gateway, GatewayState, RegistryState};
use gatehouse::types::{GatewayError, Result};

/// Upstream answering `"<port> <uri>"` after `delay`
async fn start_upstream(delay: Duration) -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                continue;
            };
            tokio::spawn(async move {
                let service = service_fn(move |req: Request<Incoming>| async move {
                    tokio::time::sleep(delay).await;
                    let body = format!("{} {}", port, req.uri());
                    Ok::<_, Infallible>(Response::new(Full::new(Bytes::from(body))))
                });
                let _ = http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service)
                    .await;
            });
        }
    });
    port
}

struct Gateway {
    base: String,
    store: Arc<RegistryStore>,
    discovery: Arc<DiscoveryClient>,
    http: reqwest::Client,
}

impl Gateway {
    async fn start(routes: Arc<RouteTableHandle>) -> Self {
        Self::start_with(routes, Arc::new(HttpUpstream::new(Duration::from_secs(1)))).await
    }

    async fn start_with(routes: Arc<RouteTableHandle>, upstream: Arc<dyn Upstream>) -> Self {
        let store = Arc::new(RegistryStore::new());
        let lease = Arc::new(LeaseManager::new(Arc::clone(&store), LeaseConfig::default()));
        let registry = Arc::new(RegistryState::new(Arc::clone(&store), lease));

        let cache = Arc::new(RegistryCache::new());
        let discovery = Arc::new(DiscoveryClient::new(
            Arc::new(LocalRegistry::new(Arc::clone(&store))),
            Arc::clone(&cache),
            DiscoveryConfig::default(),
        ));

        let resolver = Arc::new(RouteResolver::new(Arc::clone(&routes), cache));
        let forwarder = Arc::new(RequestForwarder::new(
            resolver,
            upstream,
            Arc::new(CircuitBreakers::new(CircuitConfig::default())),
            ForwarderConfig {
                default_timeout: Duration::from_secs(5),
                max_body_bytes: 1024,
                ..Default::default()
            },
        ));

        let state = GatewayState::new(forwarder, Arc::clone(&discovery), routes)
            .with_embedded_registry(registry);

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr: SocketAddr = listener.local_addr().unwrap();
        tokio::spawn(gateway::serve(listener, Arc::new(state)));

        Self {
            base: format!("http://{}", addr),
            store,
            discovery,
            http: reqwest::Client::new(),
        }
    }

    async fn with_routes(routes: Vec<Route>) -> Self {
        let table = RouteTable::new(routes).unwrap();
        Self::start(Arc::new(RouteTableHandle::new(table))).await
    }

    async fn register(&self, service: &str, id: &str, port: u16) {
        self.store
            .register(RegistrationRequest::new(service, id, "127.0.0.1", port))
            .await
            .unwrap();
        self.discovery.refresh().await.unwrap();
    }

    async fn get(&self, path: &str) -> (u16, String) {
        let response = self
            .http
            .get(format!("{}{}", self.base, path))
            .send()
            .await
            .unwrap();
        let status = response.status().as_u16();
        (status, response.text().await.unwrap())
    }
}

fn error_kind(body: &str) -> String {
    let json: serde_json::Value = serde_json::from_str(body).unwrap();
    json["error"].as_str().unwrap_or_default().to_string()
}

#[tokio::test]
async fn test_register_route_then_deregister() {
    let upstream = start_upstream(Duration::ZERO).await;
    let gw = Gateway::with_routes(vec![Route::new("users", "/api/users", "user-service")]).await;

    // No snapshot pulled yet
    let (status, _) = gw.get("/ready").await;
    assert_eq!(status, 503);

    // Register through the embedded registry API
    let response = gw
        .http
        .post(format!("{}/registry/instances", gw.base))
        .json(&RegistrationRequest::new("user-service", "a1", "127.0.0.1", upstream))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    gw.discovery.refresh().await.unwrap();

    let (status, _) = gw.get("/ready").await;
    assert_eq!(status, 200);

    let (status, body) = gw.get("/api/users/42?verbose=1").await;
    assert_eq!(status, 200);
    assert_eq!(body, format!("{} /api/users/42?verbose=1", upstream));

    let response = gw
        .http
        .delete(format!("{}/registry/instances/user-service/a1", gw.base))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    gw.discovery.refresh().await.unwrap();

    let (status, body) = gw.get("/api/users/42").await;
    assert_eq!(status, 503);
    assert_eq!(error_kind(&body), "NoInstanceAvailableError");
}

#[tokio::test]
async fn test_round_robin_spreads_evenly() {
    let gw = Gateway::with_routes(vec![Route::new("orders", "/orders", "orders")]).await;
    let mut ports = Vec::new();
    for i in 0..3 {
        let port = start_upstream(Duration::ZERO).await;
        gw.register("orders", &format!("o{}", i), port).await;
        ports.push(port);
    }

    let responses = join_all((0..30).map(|_| gw.get("/orders"))).await;

    let mut hits: HashMap<u16, usize> = HashMap::new();
    for (status, body) in responses {
        assert_eq!(status, 200);
        let port: u16 = body.split(' ').next().unwrap().parse().unwrap();
        *hits.entry(port).or_default() += 1;
    }
    for port in ports {
        let count = hits.get(&port).copied().unwrap_or(0);
        assert!((9..=11).contains(&count), "port {} got {} requests", port, count);
    }
}

#[tokio::test]
async fn test_timeout_retries_other_instance() {
    let mut route = Route::new("reports", "/reports", "reports");
    route.timeout_ms = Some(200);
    let gw = Gateway::with_routes(vec![route]).await;

    let slow = start_upstream(Duration::from_secs(3)).await;
    let fast = start_upstream(Duration::ZERO).await;
    gw.register("reports", "slow", slow).await;
    gw.register("reports", "fast", fast).await;

    for _ in 0..2 {
        let (status, body) = gw.get("/reports/daily").await;
        assert_eq!(status, 200);
        assert!(body.starts_with(&fast.to_string()));
    }
}

#[tokio::test]
async fn test_all_instances_slow_is_bad_gateway() {
    let mut route = Route::new("reports", "/reports", "reports");
    route.timeout_ms = Some(200);
    let gw = Gateway::with_routes(vec![route]).await;

    gw.register("reports", "s1", start_upstream(Duration::from_secs(3)).await).await;
    gw.register("reports", "s2", start_upstream(Duration::from_secs(3)).await).await;

    let (status, body) = gw.get("/reports/daily").await;
    assert_eq!(status, 502);
    assert_eq!(error_kind(&body), "BadGatewayError");
}

#[tokio::test]
async fn test_unrouted_and_oversized_requests() {
    let upstream = start_upstream(Duration::ZERO).await;
    let gw = Gateway::with_routes(vec![Route::new("users", "/api/users", "user-service")]).await;
    gw.register("user-service", "a1", upstream).await;

    let (status, body) = gw.get("/api/userservice").await;
    assert_eq!(status, 404);
    assert_eq!(error_kind(&body), "NoRouteError");

    let response = gw
        .http
        .post(format!("{}/api/users", gw.base))
        .body(vec![b'x'; 2048])
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 413);
}

#[tokio::test]
async fn test_admin_reload_picks_up_new_routes() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("routes.json");
    std::fs::write(
        &path,
        r#"{ "routes": [ { "id": "users", "match": { "pathPrefix": "/users" }, "target": "users" } ] }"#,
    )
    .unwrap();

    let routes = Arc::new(RouteTableHandle::from_file(&path).await.unwrap());
    let gw = Gateway::start(routes).await;
    let upstream = start_upstream(Duration::ZERO).await;
    gw.register("billing", "b1", upstream).await;

    let (status, _) = gw.get("/billing/invoices").await;
    assert_eq!(status, 404);

    std::fs::write(
        &path,
        r#"{ "routes": [
            { "id": "users", "match": { "pathPrefix": "/users" }, "target": "users" },
            { "id": "billing", "match": { "pathPrefix": "/billing" }, "target": "billing",
              "filters": [ { "type": "StripPrefix", "parts": 1 } ] }
        ] }"#,
    )
    .unwrap();

    let response = gw
        .http
        .post(format!("{}/admin/routes/reload", gw.base))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["routes"], 2);

    let (status, body) = gw.get("/billing/invoices").await;
    assert_eq!(status, 200);
    assert_eq!(body, format!("{} /invoices", upstream));

    // A broken file is rejected and the current table stays
    std::fs::write(&path, "{ not json").unwrap();
    let response = gw
        .http
        .post(format!("{}/admin/routes/reload", gw.base))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 500);

    let (status, _) = gw.get("/billing/invoices").await;
    assert_eq!(status, 200);

    let (status, body) = gw.get("/admin/routes").await;
    assert_eq!(status, 200);
    let json: serde_json::Value = serde_json::from_str(&body).unwrap();
    assert_eq!(json["routes"].as_array().unwrap().len(), 2);
}

/// Sets its flag when dropped
struct DropFlag(Arc<AtomicBool>);

impl Drop for DropFlag {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

/// Upstream that never answers, recording when its call is dropped
#[derive(Default)]
struct HangingUpstream {
    called: Notify,
    dropped: Arc<AtomicBool>,
}

#[async_trait::async_trait]
impl Upstream for HangingUpstream {
    async fn send(&self, _request: UpstreamRequest) -> Result<UpstreamResponse> {
        let _flag = DropFlag(Arc::clone(&self.dropped));
        self.called.notify_one();
        tokio::time::sleep(Duration::from_secs(60)).await;
        Err(GatewayError::Timeout("upstream never answered".into()))
    }
}

#[tokio::test]
async fn test_client_disconnect_cancels_upstream_call() {
    let upstream = Arc::new(HangingUpstream::default());
    let gw = Gateway::start_with(
        Arc::new(RouteTableHandle::new(
            RouteTable::new(vec![Route::new("slow", "/slow", "slow-service")]).unwrap(),
        )),
        Arc::clone(&upstream) as Arc<dyn Upstream>,
    )
    .await;
    gw.register("slow-service", "s1", 9).await;

    let addr = gw.base.trim_start_matches("http://").to_string();
    let mut socket = TcpStream::connect(&addr).await.unwrap();
    socket
        .write_all(b"GET /slow/x HTTP/1.1\r\nhost: gw.test\r\n\r\n")
        .await
        .unwrap();

    tokio::time::timeout(Duration::from_secs(5), upstream.called.notified())
        .await
        .unwrap();
    assert!(!upstream.dropped.load(Ordering::SeqCst));

    drop(socket);
    let mut released = false;
    for _ in 0..100 {
        if upstream.dropped.load(Ordering::SeqCst) {
            released = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(released);
}
