//! Discovery client: lease renewal and registry cache refresh

pub mod api;
pub mod backoff;
pub mod cache;
pub mod client;

pub use api::{HttpRegistryClient, LocalRegistry, RegistryApi};
pub use backoff::BackoffConfig;
pub use cache::RegistryCache;
pub use client::{DiscoveryClient, DiscoveryConfig};
