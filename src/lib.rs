//! gatehouse - service registry and dynamic routing gateway
//!
//! Services register their instances with a registry and keep them alive
//! with periodic renewals. The gateway pulls registry snapshots, matches
//! each request against a route table, picks a healthy instance and proxies
//! the request to it.
//!
//! ## Binaries
//!
//! - **gatehouse**: the gateway, optionally with the registry embedded
//! - **gatehouse-registry**: standalone registry
//! - **gatehouse-sidecar**: registers and renews an instance on behalf of
//!   a service that cannot speak the registry protocol itself

pub mod config;
pub mod discovery;
pub mod logging;
pub mod proxy;
pub mod registry;
pub mod routes;
pub mod routing;
pub mod server;
pub mod types;

pub use config::{GatewayArgs, RegistryArgs, SidecarArgs};
pub use types::{GatewayError, Result};
