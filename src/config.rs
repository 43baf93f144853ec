//! Configuration for gatehouse
//!
//! CLI arguments and environment variable handling using clap. Each binary
//! has its own `Args` struct; shared groups are flattened in.

use clap::{ArgAction, Parser, ValueEnum};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use uuid::Uuid;

use crate::discovery::{BackoffConfig, DiscoveryConfig};
use crate::proxy::{CircuitConfig, ForwarderConfig};
use crate::registry::LeaseConfig;

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}

/// Logging options
#[derive(Parser, Debug, Clone)]
pub struct LogArgs {
    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Log output format
    #[arg(long, env = "LOG_FORMAT", value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,
}

/// Lease expiry options (registry side)
#[derive(Parser, Debug, Clone)]
pub struct LeaseArgs {
    /// Seconds since last renewal after which an instance expires
    #[arg(long, env = "LEASE_TTL_SECS", default_value = "90")]
    pub lease_ttl_secs: u64,

    /// Seconds between expiry sweeps
    #[arg(long, env = "SWEEP_INTERVAL_SECS", default_value = "30")]
    pub sweep_interval_secs: u64,

    /// Skip sweeps that would expire too much of the registry at once
    #[arg(long, env = "SELF_PRESERVATION", default_value_t = true, action = ArgAction::Set)]
    pub self_preservation: bool,

    /// Expired fraction above which a sweep is skipped
    #[arg(long, env = "SELF_PRESERVATION_THRESHOLD", default_value = "0.85")]
    pub self_preservation_threshold: f64,

    /// Registries smaller than this are always swept
    #[arg(long, env = "SELF_PRESERVATION_MIN_INSTANCES", default_value = "3")]
    pub self_preservation_min_instances: usize,
}

impl LeaseArgs {
    pub fn lease_config(&self) -> LeaseConfig {
        LeaseConfig {
            ttl: Duration::from_secs(self.lease_ttl_secs),
            sweep_interval: Duration::from_secs(self.sweep_interval_secs),
            self_preservation: self.self_preservation,
            self_preservation_threshold: self.self_preservation_threshold,
            self_preservation_min_instances: self.self_preservation_min_instances,
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.lease_ttl_secs == 0 {
            return Err("LEASE_TTL_SECS must be positive".to_string());
        }
        if self.sweep_interval_secs == 0 {
            return Err("SWEEP_INTERVAL_SECS must be positive".to_string());
        }
        if !(0.0..=1.0).contains(&self.self_preservation_threshold) {
            return Err("SELF_PRESERVATION_THRESHOLD must be between 0 and 1".to_string());
        }
        Ok(())
    }
}

/// Retry backoff options for registry calls (client side)
#[derive(Parser, Debug, Clone)]
pub struct BackoffArgs {
    /// First retry delay in milliseconds
    #[arg(long, env = "BACKOFF_INITIAL_MS", default_value = "500")]
    pub backoff_initial_ms: u64,

    /// Retry delay cap in milliseconds
    #[arg(long, env = "BACKOFF_MAX_MS", default_value = "30000")]
    pub backoff_max_ms: u64,

    /// Attempts per registry call, including the first
    #[arg(long, env = "BACKOFF_MAX_ATTEMPTS", default_value = "5")]
    pub backoff_max_attempts: u32,

    /// Consecutive failures before the local instance reports STARTING
    #[arg(long, env = "FAILURE_THRESHOLD", default_value = "3")]
    pub failure_threshold: u32,

    /// Timeout for each registry call in milliseconds
    #[arg(long, env = "REGISTRY_TIMEOUT_MS", default_value = "5000")]
    pub registry_timeout_ms: u64,
}

impl BackoffArgs {
    pub fn backoff_config(&self) -> BackoffConfig {
        BackoffConfig {
            initial: Duration::from_millis(self.backoff_initial_ms),
            max: Duration::from_millis(self.backoff_max_ms),
            max_attempts: self.backoff_max_attempts,
            ..Default::default()
        }
    }

    pub fn registry_timeout(&self) -> Duration {
        Duration::from_millis(self.registry_timeout_ms)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.backoff_max_attempts == 0 {
            return Err("BACKOFF_MAX_ATTEMPTS must be at least 1".to_string());
        }
        if self.backoff_initial_ms > self.backoff_max_ms {
            return Err("BACKOFF_INITIAL_MS must not exceed BACKOFF_MAX_MS".to_string());
        }
        if self.registry_timeout_ms == 0 {
            return Err("REGISTRY_TIMEOUT_MS must be positive".to_string());
        }
        Ok(())
    }
}

/// gatehouse-registry - service registry server
#[derive(Parser, Debug, Clone)]
#[command(name = "gatehouse-registry")]
#[command(about = "Service registry with lease expiry and self-preservation")]
pub struct RegistryArgs {
    /// Address to listen on
    #[arg(long, env = "LISTEN", default_value = "0.0.0.0:8761")]
    pub listen: SocketAddr,

    #[command(flatten)]
    pub lease: LeaseArgs,

    #[command(flatten)]
    pub log: LogArgs,
}

impl RegistryArgs {
    pub fn validate(&self) -> Result<(), String> {
        self.lease.validate()
    }
}

/// gatehouse - dynamic routing gateway
#[derive(Parser, Debug, Clone)]
#[command(name = "gatehouse")]
#[command(about = "Dynamic routing gateway backed by a service registry")]
pub struct GatewayArgs {
    /// Address to listen on
    #[arg(long, env = "LISTEN", default_value = "0.0.0.0:8080")]
    pub listen: SocketAddr,

    /// Base URL of a remote registry (e.g. http://registry:8761)
    #[arg(long, env = "REGISTRY_URL")]
    pub registry_url: Option<String>,

    /// Run the registry in-process and serve its API under /registry
    #[arg(long, env = "EMBEDDED_REGISTRY", default_value = "false")]
    pub embedded_registry: bool,

    /// Route table JSON file
    #[arg(long, env = "ROUTES_FILE", default_value = "routes.json")]
    pub routes_file: PathBuf,

    /// Seconds between route file checks (0 disables polling)
    #[arg(long, env = "ROUTES_POLL_SECS", default_value = "5")]
    pub routes_poll_secs: u64,

    /// Seconds between registry snapshot pulls
    #[arg(long, env = "REGISTRY_FETCH_SECS", default_value = "5")]
    pub registry_fetch_secs: u64,

    /// Upstream timeout for routes without timeoutMs, in milliseconds
    #[arg(long, env = "UPSTREAM_TIMEOUT_MS", default_value = "30000")]
    pub upstream_timeout_ms: u64,

    /// Upstream connect timeout in milliseconds
    #[arg(long, env = "CONNECT_TIMEOUT_MS", default_value = "2000")]
    pub connect_timeout_ms: u64,

    /// Largest request body forwarded, in bytes
    #[arg(long, env = "MAX_BODY_BYTES", default_value = "10485760")]
    pub max_body_bytes: usize,

    /// Largest upstream response body buffered, in bytes
    #[arg(long, env = "MAX_RESPONSE_BYTES", default_value = "67108864")]
    pub max_response_bytes: usize,

    /// Consecutive failures before an instance's circuit opens
    #[arg(long, env = "CIRCUIT_FAILURE_THRESHOLD", default_value = "5")]
    pub circuit_failure_threshold: u32,

    /// Seconds an open circuit waits before a probe
    #[arg(long, env = "CIRCUIT_COOL_DOWN_SECS", default_value = "30")]
    pub circuit_cool_down_secs: u64,

    /// Lease options for the embedded registry
    #[command(flatten)]
    pub lease: LeaseArgs,

    #[command(flatten)]
    pub backoff: BackoffArgs,

    #[command(flatten)]
    pub log: LogArgs,
}

impl GatewayArgs {
    pub fn forwarder_config(&self) -> ForwarderConfig {
        ForwarderConfig {
            default_timeout: Duration::from_millis(self.upstream_timeout_ms),
            max_body_bytes: self.max_body_bytes,
            ..Default::default()
        }
    }

    pub fn circuit_config(&self) -> CircuitConfig {
        CircuitConfig {
            failure_threshold: self.circuit_failure_threshold,
            cool_down: Duration::from_secs(self.circuit_cool_down_secs),
        }
    }

    /// Fetch-only discovery: the gateway never registers itself
    pub fn discovery_config(&self) -> DiscoveryConfig {
        DiscoveryConfig {
            fetch_interval: Duration::from_secs(self.registry_fetch_secs),
            failure_threshold: self.backoff.failure_threshold,
            fetch_registry: true,
            backoff: self.backoff.backoff_config(),
            ..Default::default()
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn validate(&self) -> Result<(), String> {
        match (&self.registry_url, self.embedded_registry) {
            (None, false) => {
                return Err("one of REGISTRY_URL or EMBEDDED_REGISTRY is required".to_string())
            }
            (Some(_), true) => {
                return Err("REGISTRY_URL and EMBEDDED_REGISTRY are mutually exclusive".to_string())
            }
            _ => {}
        }
        if self.registry_fetch_secs == 0 {
            return Err("REGISTRY_FETCH_SECS must be positive".to_string());
        }
        if self.upstream_timeout_ms == 0 {
            return Err("UPSTREAM_TIMEOUT_MS must be positive".to_string());
        }
        if self.circuit_failure_threshold == 0 {
            return Err("CIRCUIT_FAILURE_THRESHOLD must be at least 1".to_string());
        }
        if self.embedded_registry {
            self.lease.validate()?;
        }
        self.backoff.validate()
    }
}

/// gatehouse-sidecar - keeps one opaque service registered
#[derive(Parser, Debug, Clone)]
#[command(name = "gatehouse-sidecar")]
#[command(about = "Registers a service instance and renews its lease")]
pub struct SidecarArgs {
    /// Base URL of the registry
    #[arg(long, env = "REGISTRY_URL")]
    pub registry_url: String,

    /// Logical service name
    #[arg(long, env = "SERVICE_NAME")]
    pub service_name: String,

    /// Instance identifier, unique within the service
    #[arg(long, env = "INSTANCE_ID", default_value_t = Uuid::new_v4().to_string())]
    pub instance_id: String,

    /// Host the gateway should forward to
    #[arg(long, env = "INSTANCE_HOST", default_value = "127.0.0.1")]
    pub host: String,

    /// Port the gateway should forward to
    #[arg(long, env = "INSTANCE_PORT")]
    pub port: u16,

    /// Instance metadata as comma-separated key=value pairs
    #[arg(long, env = "INSTANCE_METADATA", value_delimiter = ',')]
    pub metadata: Vec<String>,

    /// Seconds between lease renewals
    #[arg(long, env = "RENEW_INTERVAL_SECS", default_value = "30")]
    pub renew_interval_secs: u64,

    /// Optional address for the sidecar's own probes
    #[arg(long, env = "LISTEN")]
    pub listen: Option<SocketAddr>,

    #[command(flatten)]
    pub backoff: BackoffArgs,

    #[command(flatten)]
    pub log: LogArgs,
}

impl SidecarArgs {
    /// Parse `key=value` metadata pairs
    pub fn metadata_map(&self) -> Result<HashMap<String, String>, String> {
        self.metadata
            .iter()
            .filter(|pair| !pair.trim().is_empty())
            .map(|pair| match pair.split_once('=') {
                Some((k, v)) if !k.trim().is_empty() => {
                    Ok((k.trim().to_string(), v.trim().to_string()))
                }
                _ => Err(format!("invalid metadata entry '{}', expected key=value", pair)),
            })
            .collect()
    }

    /// Register-only discovery: the sidecar never pulls the table
    pub fn discovery_config(&self) -> DiscoveryConfig {
        DiscoveryConfig {
            renew_interval: Duration::from_secs(self.renew_interval_secs),
            failure_threshold: self.backoff.failure_threshold,
            fetch_registry: false,
            backoff: self.backoff.backoff_config(),
            ..Default::default()
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.service_name.trim().is_empty() {
            return Err("SERVICE_NAME must not be empty".to_string());
        }
        if self.port == 0 {
            return Err("INSTANCE_PORT must be non-zero".to_string());
        }
        if self.renew_interval_secs == 0 {
            return Err("RENEW_INTERVAL_SECS must be positive".to_string());
        }
        self.metadata_map()?;
        self.backoff.validate()
    }
}
