//! Route definitions and the route table
//!
//! Routes are loaded from a JSON file:
//!
//! ```json
//! { "routes": [
//!     { "id": "accounts", "match": { "pathPrefix": "/accounts" },
//!       "target": "accounts", "timeoutMs": 2000,
//!       "filters": [ { "type": "StripPrefix", "parts": 1 } ] }
//! ] }
//! ```

use hyper::header::{HeaderName, HeaderValue};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::registry::normalize_service_name;
use crate::types::{GatewayError, Result};

/// Request predicates; every present predicate must match
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteMatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path_prefix: Option<String>,
}

impl RouteMatch {
    /// Match a request. Returns the matched prefix length (0 without a
    /// path predicate), used to rank equal-order routes.
    pub fn matches(&self, host: Option<&str>, path: &str) -> Option<usize> {
        if let Some(pattern) = &self.host {
            let host = host?;
            if !host_matches(pattern, strip_port(host)) {
                return None;
            }
        }

        match &self.path_prefix {
            Some(prefix) => {
                let prefix = trim_prefix(prefix);
                path_matches(prefix, path).then_some(prefix.len())
            }
            None => Some(0),
        }
    }
}

/// Drop the port from a Host header value (`[::1]:80` keeps its brackets)
fn strip_port(host: &str) -> &str {
    if host.starts_with('[') {
        return match host.find(']') {
            Some(end) => &host[..=end],
            None => host,
        };
    }
    match host.rsplit_once(':') {
        Some((name, port)) if port.chars().all(|c| c.is_ascii_digit()) => name,
        _ => host,
    }
}

fn host_matches(pattern: &str, host: &str) -> bool {
    let host = host.trim_end_matches('.');
    match pattern.strip_prefix("*.") {
        Some(suffix) => {
            let (host, suffix) = (host.as_bytes(), suffix.as_bytes());
            host.len() > suffix.len() + 1
                && host[host.len() - suffix.len()..].eq_ignore_ascii_case(suffix)
                && host[host.len() - suffix.len() - 1] == b'.'
        }
        None => pattern.eq_ignore_ascii_case(host),
    }
}

/// `/accounts/` and `/accounts` are the same prefix; `/` stays `/`
fn trim_prefix(prefix: &str) -> &str {
    let trimmed = prefix.trim_end_matches('/');
    if trimmed.is_empty() {
        "/"
    } else {
        trimmed
    }
}

/// Prefix match on path-segment boundaries
fn path_matches(prefix: &str, path: &str) -> bool {
    if prefix == "/" {
        return true;
    }
    match path.strip_prefix(prefix) {
        Some(rest) => rest.is_empty() || rest.starts_with('/'),
        None => false,
    }
}

/// How an instance is picked among the UP candidates
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum LoadBalancePolicy {
    #[default]
    RoundRobin,
    /// Stable per client: SHA-256 of the client key
    ClientHash,
}

/// Request/response rewrites applied by the forwarder, in order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Filter {
    /// Drop the first `parts` path segments
    StripPrefix { parts: usize },
    PrefixPath { prefix: String },
    SetPath { path: String },
    AddRequestHeader { name: String, value: String },
    RemoveRequestHeader { name: String },
    AddResponseHeader { name: String, value: String },
    /// Override the Host header sent upstream
    SetRequestHost { host: String },
}

impl Filter {
    fn validate(&self) -> std::result::Result<(), String> {
        fn header(name: &str, value: Option<&str>) -> std::result::Result<(), String> {
            HeaderName::from_bytes(name.as_bytes())
                .map_err(|_| format!("invalid header name '{}'", name))?;
            if let Some(value) = value {
                HeaderValue::from_str(value)
                    .map_err(|_| format!("invalid value for header '{}'", name))?;
            }
            Ok(())
        }

        match self {
            Filter::StripPrefix { .. } => Ok(()),
            Filter::PrefixPath { prefix } if !prefix.starts_with('/') => {
                Err(format!("PrefixPath '{}' must start with '/'", prefix))
            }
            Filter::SetPath { path } if !path.starts_with('/') => {
                Err(format!("SetPath '{}' must start with '/'", path))
            }
            Filter::PrefixPath { .. } | Filter::SetPath { .. } => Ok(()),
            Filter::AddRequestHeader { name, value } | Filter::AddResponseHeader { name, value } => {
                header(name, Some(value))
            }
            Filter::RemoveRequestHeader { name } => header(name, None),
            Filter::SetRequestHost { host } => header("host", Some(host)),
        }
    }
}

/// One route: predicates, target service, and forwarding options
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Route {
    pub id: String,
    #[serde(rename = "match")]
    pub matcher: RouteMatch,
    /// Target service name
    pub target: String,
    /// Priority rank, lower first
    #[serde(default)]
    pub order: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub policy: LoadBalancePolicy,
    #[serde(default)]
    pub filters: Vec<Filter>,
}

impl Route {
    /// Route on a path prefix with defaults for everything else
    pub fn new(id: &str, path_prefix: &str, target: &str) -> Self {
        Self {
            id: id.to_string(),
            matcher: RouteMatch {
                host: None,
                path_prefix: Some(path_prefix.to_string()),
            },
            target: target.to_string(),
            order: 0,
            timeout_ms: None,
            policy: LoadBalancePolicy::default(),
            filters: Vec::new(),
        }
    }

    /// Upstream timeout, falling back to the gateway default
    pub fn timeout(&self, default: Duration) -> Duration {
        self.timeout_ms.map(Duration::from_millis).unwrap_or(default)
    }

    fn validate(&self) -> std::result::Result<(), String> {
        if self.id.trim().is_empty() {
            return Err("route id is empty".into());
        }
        if self.target.trim().is_empty() {
            return Err(format!("route '{}' has no target", self.id));
        }
        if self.matcher.host.is_none() && self.matcher.path_prefix.is_none() {
            return Err(format!(
                "route '{}' needs at least one of match.host or match.pathPrefix",
                self.id
            ));
        }
        if let Some(prefix) = &self.matcher.path_prefix {
            if !prefix.starts_with('/') {
                return Err(format!(
                    "route '{}': pathPrefix '{}' must start with '/'",
                    self.id, prefix
                ));
            }
        }
        if let Some(host) = &self.matcher.host {
            if host.trim().is_empty() {
                return Err(format!("route '{}': match.host is empty", self.id));
            }
        }
        if self.timeout_ms == Some(0) {
            return Err(format!("route '{}': timeoutMs must be positive", self.id));
        }
        for filter in &self.filters {
            filter
                .validate()
                .map_err(|e| format!("route '{}': {}", self.id, e))?;
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct RouteFile {
    routes: Vec<Route>,
}

/// Immutable, validated set of routes in file order
#[derive(Debug, Clone, Default)]
pub struct RouteTable {
    routes: Vec<Arc<Route>>,
}

impl RouteTable {
    /// Validate and build a table; targets are normalized like service names
    pub fn new(routes: Vec<Route>) -> Result<Self> {
        let mut ids = HashSet::new();
        let mut table = Vec::with_capacity(routes.len());

        for mut route in routes {
            route.validate().map_err(GatewayError::Config)?;
            if !ids.insert(route.id.clone()) {
                return Err(GatewayError::Config(format!(
                    "duplicate route id '{}'",
                    route.id
                )));
            }
            route.target = normalize_service_name(&route.target);
            table.push(Arc::new(route));
        }

        Ok(Self { routes: table })
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let file: RouteFile = serde_json::from_str(json)
            .map_err(|e| GatewayError::Config(format!("invalid route file: {}", e)))?;
        Self::new(file.routes)
    }

    pub async fn load(path: &Path) -> Result<Self> {
        let json = tokio::fs::read_to_string(path).await.map_err(|e| {
            GatewayError::Config(format!("cannot read route file {}: {}", path.display(), e))
        })?;
        Self::from_json(&json)
    }

    pub fn routes(&self) -> &[Arc<Route>] {
        &self.routes
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Best route for a request: lowest `order`, then longest path
    /// prefix, then file order
    pub fn find(&self, host: Option<&str>, path: &str) -> Option<Arc<Route>> {
        self.routes
            .iter()
            .enumerate()
            .filter_map(|(idx, route)| {
                route
                    .matcher
                    .matches(host, path)
                    .map(|len| ((route.order, std::cmp::Reverse(len), idx), route))
            })
            .min_by_key(|(rank, _)| *rank)
            .map(|(_, route)| Arc::clone(route))
    }
}
