//! Service instance model
//!
//! The wire shape of an instance is camelCase JSON:
//! `{serviceName, instanceId, host, port, status, lastRenewalTimestamp}`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;

use crate::types::GatewayError;

/// Lifecycle status of a registered instance
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InstanceStatus {
    #[default]
    Up,
    Down,
    Starting,
    OutOfService,
}

impl InstanceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceStatus::Up => "UP",
            InstanceStatus::Down => "DOWN",
            InstanceStatus::Starting => "STARTING",
            InstanceStatus::OutOfService => "OUT_OF_SERVICE",
        }
    }
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for InstanceStatus {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "UP" => Ok(InstanceStatus::Up),
            "DOWN" => Ok(InstanceStatus::Down),
            "STARTING" => Ok(InstanceStatus::Starting),
            "OUT_OF_SERVICE" => Ok(InstanceStatus::OutOfService),
            other => Err(GatewayError::Registration(format!(
                "unknown instance status '{}'",
                other
            ))),
        }
    }
}

/// Normalize a service name for keying (case-insensitive match)
pub fn normalize_service_name(name: &str) -> String {
    name.trim().to_ascii_lowercase()
}

/// Unique key of an instance inside the registry
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstanceKey {
    pub service_name: String,
    pub instance_id: String,
}

impl InstanceKey {
    pub fn new(service_name: &str, instance_id: &str) -> Self {
        Self {
            service_name: normalize_service_name(service_name),
            instance_id: instance_id.to_string(),
        }
    }
}

impl fmt::Display for InstanceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.service_name, self.instance_id)
    }
}

/// Registration payload accepted by the registry
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistrationRequest {
    pub service_name: String,
    pub instance_id: String,
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub status: InstanceStatus,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl RegistrationRequest {
    pub fn new(service_name: &str, instance_id: &str, host: &str, port: u16) -> Self {
        Self {
            service_name: service_name.to_string(),
            instance_id: instance_id.to_string(),
            host: host.to_string(),
            port,
            status: InstanceStatus::Up,
            metadata: HashMap::new(),
        }
    }

    pub fn with_status(mut self, status: InstanceStatus) -> Self {
        self.status = status;
        self
    }

    /// Reject payloads the registry must never store
    pub fn validate(&self) -> Result<(), GatewayError> {
        if self.service_name.trim().is_empty() {
            return Err(GatewayError::Registration("serviceName is empty".into()));
        }
        if self.service_name.contains('/') {
            return Err(GatewayError::Registration(
                "serviceName must not contain '/'".into(),
            ));
        }
        if self.instance_id.trim().is_empty() {
            return Err(GatewayError::Registration("instanceId is empty".into()));
        }
        if self.instance_id.contains('/') {
            return Err(GatewayError::Registration(
                "instanceId must not contain '/'".into(),
            ));
        }
        if self.host.trim().is_empty() {
            return Err(GatewayError::Registration("host is empty".into()));
        }
        if self.port == 0 {
            return Err(GatewayError::Registration("port must be non-zero".into()));
        }
        Ok(())
    }

    pub fn key(&self) -> InstanceKey {
        InstanceKey::new(&self.service_name, &self.instance_id)
    }
}

/// A registered service instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceInstance {
    pub service_name: String,
    pub instance_id: String,
    pub host: String,
    pub port: u16,
    pub status: InstanceStatus,
    pub last_renewal_timestamp: DateTime<Utc>,
    pub registered_at: DateTime<Utc>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl ServiceInstance {
    /// Build an instance from a validated registration
    pub fn from_registration(req: RegistrationRequest, now: DateTime<Utc>) -> Self {
        Self {
            service_name: normalize_service_name(&req.service_name),
            instance_id: req.instance_id,
            host: req.host,
            port: req.port,
            status: req.status,
            last_renewal_timestamp: now,
            registered_at: now,
            metadata: req.metadata,
        }
    }

    pub fn key(&self) -> InstanceKey {
        InstanceKey::new(&self.service_name, &self.instance_id)
    }

    pub fn is_up(&self) -> bool {
        self.status == InstanceStatus::Up
    }

    /// `host:port` authority for upstream URLs
    pub fn authority(&self) -> String {
        if self.host.contains(':') && !self.host.starts_with('[') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    pub fn base_url(&self) -> String {
        format!("http://{}", self.authority())
    }
}

/// Identifies one state of one registry process.
///
/// Versions restart from zero when a registry restarts, so the epoch
/// (chosen at startup) is part of the identity.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SnapshotTag {
    pub epoch: String,
    pub version: u64,
}

/// Full registry table as handed to discovery clients
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistrySnapshot {
    #[serde(default)]
    pub epoch: String,
    pub version: u64,
    pub services: BTreeMap<String, Vec<ServiceInstance>>,
}

impl RegistrySnapshot {
    pub fn tag(&self) -> SnapshotTag {
        SnapshotTag {
            epoch: self.epoch.clone(),
            version: self.version,
        }
    }

    /// Whether this snapshot is the registry state `tag` names
    pub fn is_tagged(&self, tag: &SnapshotTag) -> bool {
        self.version == tag.version && self.epoch == tag.epoch
    }

    /// UP instances of a service, sorted by instance id
    pub fn up_instances(&self, service_name: &str) -> Vec<ServiceInstance> {
        let name = normalize_service_name(service_name);
        let mut up: Vec<ServiceInstance> = self
            .services
            .get(&name)
            .map(|instances| instances.iter().filter(|i| i.is_up()).cloned().collect())
            .unwrap_or_default();
        up.sort_by(|a, b| a.instance_id.cmp(&b.instance_id));
        up
    }

    pub fn instance_count(&self) -> usize {
        self.services.values().map(Vec::len).sum()
    }
}

/// Per-service summary for `GET /registry/services`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceSummary {
    pub service_name: String,
    pub instances: usize,
    pub up: usize,
}
