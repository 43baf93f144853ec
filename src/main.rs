//! gatehouse - dynamic routing gateway

use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

use gatehouse::{
    config::GatewayArgs,
    discovery::{DiscoveryClient, HttpRegistryClient, LocalRegistry, RegistryApi, RegistryCache},
    logging,
    proxy::{CircuitBreakers, HttpUpstream, RequestForwarder},
    registry::{LeaseManager, RegistryStore},
    routing::{RouteResolver, RouteTableHandle},
    server::{self, GatewayState, RegistryState},
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    let args = GatewayArgs::parse();
    logging::init(&args.log.log_level, args.log.log_format);

    if let Err(e) = args.validate() {
        error!("Configuration error: {}", e);
        std::process::exit(1);
    }

    info!("======================================");
    info!("  gatehouse {}", env!("CARGO_PKG_VERSION"));
    info!("======================================");
    info!("Listen: {}", args.listen);
    info!("Routes: {}", args.routes_file.display());
    match &args.registry_url {
        Some(url) => info!("Registry: {}", url),
        None => info!("Registry: embedded"),
    }
    info!("======================================");

    // Registry: in-process store or remote HTTP client
    let (api, embedded): (Arc<dyn RegistryApi>, Option<Arc<RegistryState>>) =
        match &args.registry_url {
            Some(url) => (
                Arc::new(HttpRegistryClient::new(url, args.backoff.registry_timeout())?)
                    as Arc<dyn RegistryApi>,
                None,
            ),
            None => {
                let store = Arc::new(RegistryStore::new());
                let lease = Arc::new(LeaseManager::new(
                    Arc::clone(&store),
                    args.lease.lease_config(),
                ));
                Arc::clone(&lease).start().await;
                (
                    Arc::new(LocalRegistry::new(Arc::clone(&store))) as Arc<dyn RegistryApi>,
                    Some(Arc::new(RegistryState::new(store, lease))),
                )
            }
        };

    let routes = match RouteTableHandle::from_file(&args.routes_file).await {
        Ok(handle) => Arc::new(handle),
        Err(e) => {
            error!("Failed to load routes: {}", e);
            std::process::exit(1);
        }
    };
    if args.routes_poll_secs > 0 {
        Arc::clone(&routes)
            .watch(Duration::from_secs(args.routes_poll_secs))
            .await;
    }

    let cache = Arc::new(RegistryCache::new());
    let discovery = Arc::new(DiscoveryClient::new(
        api,
        Arc::clone(&cache),
        args.discovery_config(),
    ));
    Arc::clone(&discovery).start().await;

    let resolver = Arc::new(RouteResolver::new(Arc::clone(&routes), cache));
    let forwarder = Arc::new(RequestForwarder::new(
        resolver,
        Arc::new(
            HttpUpstream::new(args.connect_timeout())
                .with_max_response_bytes(args.max_response_bytes),
        ),
        Arc::new(CircuitBreakers::new(args.circuit_config())),
        args.forwarder_config(),
    ));

    let mut state = GatewayState::new(forwarder, Arc::clone(&discovery), Arc::clone(&routes));
    if let Some(registry) = &embedded {
        state = state.with_embedded_registry(Arc::clone(registry));
    }

    tokio::select! {
        result = server::gateway::run(Arc::new(state), args.listen) => {
            if let Err(e) = result {
                error!("Server error: {}", e);
                std::process::exit(1);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down");
        }
    }

    discovery.stop().await;
    routes.stop().await;
    if let Some(registry) = embedded {
        registry.lease.stop().await;
    }
    Ok(())
}
