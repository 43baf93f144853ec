//! gatehouse-registry - standalone service registry

use clap::Parser;
use std::sync::Arc;
use tracing::{error, info};

use gatehouse::{
    config::RegistryArgs,
    logging,
    registry::{LeaseManager, RegistryStore},
    server::{self, RegistryState},
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    let args = RegistryArgs::parse();
    logging::init(&args.log.log_level, args.log.log_format);

    if let Err(e) = args.validate() {
        error!("Configuration error: {}", e);
        std::process::exit(1);
    }

    info!(
        "gatehouse-registry {} (lease ttl {}s, sweep every {}s, self-preservation {})",
        env!("CARGO_PKG_VERSION"),
        args.lease.lease_ttl_secs,
        args.lease.sweep_interval_secs,
        if args.lease.self_preservation { "on" } else { "off" }
    );

    let store = Arc::new(RegistryStore::new());
    let lease = Arc::new(LeaseManager::new(Arc::clone(&store), args.lease.lease_config()));
    Arc::clone(&lease).start().await;

    let state = Arc::new(RegistryState::new(store, Arc::clone(&lease)));

    tokio::select! {
        result = server::registry::run(state, args.listen) => {
            if let Err(e) = result {
                error!("Server error: {}", e);
                std::process::exit(1);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down");
        }
    }

    lease.stop().await;
    Ok(())
}
