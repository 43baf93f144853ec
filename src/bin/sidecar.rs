//! gatehouse-sidecar - keeps one service instance registered

use clap::Parser;
use std::sync::Arc;
use tracing::{error, info, warn};

use gatehouse::{
    config::SidecarArgs,
    discovery::{DiscoveryClient, HttpRegistryClient, RegistryCache},
    logging,
    registry::RegistrationRequest,
    server::{self, SidecarState},
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    let args = SidecarArgs::parse();
    logging::init(&args.log.log_level, args.log.log_format);

    if let Err(e) = args.validate() {
        error!("Configuration error: {}", e);
        std::process::exit(1);
    }

    let mut registration =
        RegistrationRequest::new(&args.service_name, &args.instance_id, &args.host, args.port);
    registration.metadata = args.metadata_map().map_err(anyhow::Error::msg)?;

    info!(
        "gatehouse-sidecar {}: {}/{} at {}:{} via {}",
        env!("CARGO_PKG_VERSION"),
        registration.service_name,
        registration.instance_id,
        registration.host,
        registration.port,
        args.registry_url
    );

    let api = Arc::new(HttpRegistryClient::new(
        &args.registry_url,
        args.backoff.registry_timeout(),
    )?);
    let discovery = Arc::new(
        DiscoveryClient::new(api, Arc::new(RegistryCache::new()), args.discovery_config())
            .with_local_instance(registration),
    );
    // The first renewal tick registers the instance
    Arc::clone(&discovery).start().await;

    match args.listen {
        Some(addr) => {
            let state = Arc::new(SidecarState::new(Arc::clone(&discovery)));
            tokio::select! {
                result = server::sidecar::run(state, addr) => {
                    if let Err(e) = result {
                        error!("Probe server error: {}", e);
                    }
                }
                _ = tokio::signal::ctrl_c() => {}
            }
        }
        None => {
            tokio::signal::ctrl_c().await?;
        }
    }

    info!("Shutting down, deregistering");
    if let Err(e) = discovery.shutdown().await {
        warn!("Deregistration failed: {}", e);
    }
    Ok(())
}
