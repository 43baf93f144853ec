//! In-memory registry store
//!
//! Authoritative table of service instances keyed by (service name,
//! instance id). All mutations go through one write guard and bump the
//! registry version; readers clone under the read guard and so always see
//! a complete table.

use chrono::Utc;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, info};
use uuid::Uuid;

use super::instance::{
    normalize_service_name, InstanceKey, InstanceStatus, RegistrationRequest, RegistrySnapshot,
    ServiceInstance, ServiceSummary, SnapshotTag,
};
use crate::types::{GatewayError, Result};

/// Stored instance plus the monotonic instant of its last renewal
#[derive(Debug, Clone)]
struct LeaseEntry {
    instance: ServiceInstance,
    renewed_at: Instant,
}

impl LeaseEntry {
    fn is_expired(&self, ttl: Duration, now: Instant) -> bool {
        now.saturating_duration_since(self.renewed_at) > ttl
    }
}

/// Outcome of an eviction pass
#[derive(Debug, Clone, Default)]
pub struct EvictionOutcome {
    /// Instances whose lease had lapsed
    pub expired: usize,
    /// Instances in the registry when the pass started
    pub total: usize,
    /// Instances actually removed (empty when the guard refused)
    pub evicted: Vec<ServiceInstance>,
}

/// Registry of live service instances
pub struct RegistryStore {
    /// service name -> instance id -> lease entry
    services: RwLock<HashMap<String, HashMap<String, LeaseEntry>>>,
    /// Bumped on every mutation
    version: AtomicU64,
    /// Random per process, so versions from different runs never compare equal
    epoch: String,
}

impl Default for RegistryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl RegistryStore {
    pub fn new() -> Self {
        Self {
            services: RwLock::new(HashMap::new()),
            version: AtomicU64::new(0),
            epoch: Uuid::new_v4().to_string(),
        }
    }

    pub fn epoch(&self) -> &str {
        &self.epoch
    }

    /// Epoch and current version
    pub fn tag(&self) -> SnapshotTag {
        SnapshotTag {
            epoch: self.epoch.clone(),
            version: self.version(),
        }
    }

    /// Current registry version
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::SeqCst)
    }

    fn bump(&self) -> u64 {
        self.version.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Insert or replace an instance under its (service, id) key
    pub async fn register(&self, req: RegistrationRequest) -> Result<ServiceInstance> {
        req.validate()?;

        let key = req.key();
        let mut instance = ServiceInstance::from_registration(req, Utc::now());

        let mut services = self.services.write().await;
        let bucket = services.entry(key.service_name.clone()).or_default();

        let replaced = match bucket.get(&key.instance_id) {
            Some(existing) => {
                instance.registered_at = existing.instance.registered_at;
                true
            }
            None => false,
        };

        bucket.insert(
            key.instance_id.clone(),
            LeaseEntry {
                instance: instance.clone(),
                renewed_at: Instant::now(),
            },
        );
        let version = self.bump();

        if replaced {
            debug!(instance = %key, status = %instance.status, version, "Re-registered instance");
        } else {
            info!(
                instance = %key,
                addr = %instance.authority(),
                status = %instance.status,
                version,
                "Registered instance"
            );
        }

        Ok(instance)
    }

    /// Refresh the lease of a known instance
    pub async fn renew(&self, service_name: &str, instance_id: &str) -> Result<ServiceInstance> {
        let key = InstanceKey::new(service_name, instance_id);
        let mut services = self.services.write().await;

        let entry = services
            .get_mut(&key.service_name)
            .and_then(|bucket| bucket.get_mut(&key.instance_id))
            .ok_or_else(|| GatewayError::NotFound(key.to_string()))?;

        entry.renewed_at = Instant::now();
        entry.instance.last_renewal_timestamp = Utc::now();
        let instance = entry.instance.clone();
        self.bump();

        debug!(instance = %key, "Renewed lease");
        Ok(instance)
    }

    /// Remove an instance; returns whether anything was removed
    pub async fn deregister(&self, service_name: &str, instance_id: &str) -> bool {
        let key = InstanceKey::new(service_name, instance_id);
        let mut services = self.services.write().await;

        let removed = match services.get_mut(&key.service_name) {
            Some(bucket) => {
                let removed = bucket.remove(&key.instance_id).is_some();
                if bucket.is_empty() {
                    services.remove(&key.service_name);
                }
                removed
            }
            None => false,
        };

        if removed {
            let version = self.bump();
            info!(instance = %key, version, "Deregistered instance");
        } else {
            debug!(instance = %key, "Deregister of unknown instance ignored");
        }

        removed
    }

    /// Override the status of a known instance
    pub async fn set_status(
        &self,
        service_name: &str,
        instance_id: &str,
        status: InstanceStatus,
    ) -> Result<ServiceInstance> {
        let key = InstanceKey::new(service_name, instance_id);
        let mut services = self.services.write().await;

        let entry = services
            .get_mut(&key.service_name)
            .and_then(|bucket| bucket.get_mut(&key.instance_id))
            .ok_or_else(|| GatewayError::NotFound(key.to_string()))?;

        let previous = entry.instance.status;
        entry.instance.status = status;
        let instance = entry.instance.clone();
        self.bump();

        info!(instance = %key, from = %previous, to = %status, "Instance status changed");
        Ok(instance)
    }

    /// UP instances of one service, sorted by instance id
    pub async fn snapshot(&self, service_name: &str) -> Vec<ServiceInstance> {
        let name = normalize_service_name(service_name);
        let services = self.services.read().await;

        let mut up: Vec<ServiceInstance> = services
            .get(&name)
            .map(|bucket| {
                bucket
                    .values()
                    .filter(|e| e.instance.is_up())
                    .map(|e| e.instance.clone())
                    .collect()
            })
            .unwrap_or_default();
        up.sort_by(|a, b| a.instance_id.cmp(&b.instance_id));
        up
    }

    /// Look up one instance regardless of status
    pub async fn get(&self, service_name: &str, instance_id: &str) -> Option<ServiceInstance> {
        let key = InstanceKey::new(service_name, instance_id);
        let services = self.services.read().await;
        services
            .get(&key.service_name)
            .and_then(|bucket| bucket.get(&key.instance_id))
            .map(|e| e.instance.clone())
    }

    /// Every instance of every service, tagged with the version it was read at
    pub async fn full_snapshot(&self) -> RegistrySnapshot {
        let services = self.services.read().await;
        let version = self.version();

        let services = services
            .iter()
            .map(|(name, bucket)| {
                let mut instances: Vec<ServiceInstance> =
                    bucket.values().map(|e| e.instance.clone()).collect();
                instances.sort_by(|a, b| a.instance_id.cmp(&b.instance_id));
                (name.clone(), instances)
            })
            .collect::<BTreeMap<_, _>>();

        RegistrySnapshot {
            epoch: self.epoch.clone(),
            version,
            services,
        }
    }

    /// Per-service instance counts, sorted by name
    pub async fn services(&self) -> Vec<ServiceSummary> {
        let services = self.services.read().await;
        let mut summary: Vec<ServiceSummary> = services
            .iter()
            .map(|(name, bucket)| ServiceSummary {
                service_name: name.clone(),
                instances: bucket.len(),
                up: bucket.values().filter(|e| e.instance.is_up()).count(),
            })
            .collect();
        summary.sort_by(|a, b| a.service_name.cmp(&b.service_name));
        summary
    }

    /// Total number of registered instances
    pub async fn len(&self) -> usize {
        self.services.read().await.values().map(HashMap::len).sum()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Count expired leases without mutating: (expired, total)
    pub async fn expired_count(&self, ttl: Duration, now: Instant) -> (usize, usize) {
        let services = self.services.read().await;
        let mut expired = 0;
        let mut total = 0;
        for entry in services.values().flat_map(HashMap::values) {
            total += 1;
            if entry.is_expired(ttl, now) {
                expired += 1;
            }
        }
        (expired, total)
    }

    /// Remove lapsed leases in one write section.
    ///
    /// `allow` sees `(expired, total)` before anything is removed and may
    /// veto the eviction; the registry is untouched in that case.
    pub async fn evict_expired<F>(&self, ttl: Duration, now: Instant, allow: F) -> EvictionOutcome
    where
        F: FnOnce(usize, usize) -> bool,
    {
        let mut services = self.services.write().await;

        let mut total = 0;
        let mut lapsed: Vec<InstanceKey> = Vec::new();
        for (name, bucket) in services.iter() {
            for (id, entry) in bucket.iter() {
                total += 1;
                if entry.is_expired(ttl, now) {
                    lapsed.push(InstanceKey {
                        service_name: name.clone(),
                        instance_id: id.clone(),
                    });
                }
            }
        }

        let mut outcome = EvictionOutcome {
            expired: lapsed.len(),
            total,
            evicted: Vec::new(),
        };

        if lapsed.is_empty() || !allow(outcome.expired, total) {
            return outcome;
        }

        for key in lapsed {
            if let Some(bucket) = services.get_mut(&key.service_name) {
                if let Some(entry) = bucket.remove(&key.instance_id) {
                    outcome.evicted.push(entry.instance);
                }
                if bucket.is_empty() {
                    services.remove(&key.service_name);
                }
            }
        }
        self.bump();

        outcome
    }
}

#[cfg(test)]
impl RegistryStore {
    /// Hold the write lock so a concurrent eviction has to wait
    pub(crate) async fn lock_for_test(&self) -> impl Sized + '_ {
        self.services.write().await
    }
}
