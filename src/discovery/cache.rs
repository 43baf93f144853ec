//! Local copy of the registry table
//!
//! Readers get an `Arc` of the whole snapshot, so a resolve never sees a
//! half-applied update. Entries may be stale by up to one fetch interval.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

use crate::registry::{RegistrySnapshot, ServiceInstance, SnapshotTag};

/// Version-tagged registry snapshot shared by the resolver and admin routes
#[derive(Default)]
pub struct RegistryCache {
    snapshot: RwLock<Arc<RegistrySnapshot>>,
    /// Set once the first snapshot has been applied
    ready: AtomicBool,
}

impl RegistryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether at least one snapshot has been received
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    /// Version of the currently held snapshot
    pub async fn version(&self) -> u64 {
        self.snapshot.read().await.version
    }

    /// Epoch and version of the currently held snapshot
    pub async fn tag(&self) -> SnapshotTag {
        self.snapshot.read().await.tag()
    }

    /// Current snapshot
    pub async fn snapshot(&self) -> Arc<RegistrySnapshot> {
        Arc::clone(&*self.snapshot.read().await)
    }

    /// UP instances of one service, sorted by instance ID
    pub async fn up_instances(&self, service_name: &str) -> Vec<ServiceInstance> {
        self.snapshot.read().await.up_instances(service_name)
    }

    /// Replace the held snapshot. Returns false if epoch and version are
    /// both unchanged.
    ///
    /// Any different version is accepted, including a lower one: a
    /// restarted registry starts counting again from zero under a new epoch.
    pub async fn apply(&self, snapshot: RegistrySnapshot) -> bool {
        let mut current = self.snapshot.write().await;
        let first = !self.ready.swap(true, Ordering::SeqCst);
        if !first && snapshot.is_tagged(&current.tag()) {
            return false;
        }

        debug!(
            from = current.version,
            to = snapshot.version,
            epoch = %snapshot.epoch,
            instances = snapshot.instance_count(),
            "Registry cache updated"
        );
        *current = Arc::new(snapshot);
        true
    }
}
