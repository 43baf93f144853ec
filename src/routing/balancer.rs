//! Instance selection among UP candidates

use dashmap::DashMap;
use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicUsize, Ordering};

use super::route::LoadBalancePolicy;
use crate::registry::ServiceInstance;

/// Per-service round-robin counters plus stable client hashing
#[derive(Default)]
pub struct LoadBalancer {
    counters: DashMap<String, AtomicUsize>,
}

/// Stable 64-bit hash of a client key; identical on every gateway replica
pub fn client_hash(key: &str) -> u64 {
    let digest = Sha256::digest(key.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(bytes)
}

impl LoadBalancer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pick one of `candidates`. Client hashing without a key falls back
    /// to round-robin.
    pub fn choose<'a>(
        &self,
        policy: LoadBalancePolicy,
        service_name: &str,
        candidates: &'a [ServiceInstance],
        client_key: Option<&str>,
    ) -> Option<&'a ServiceInstance> {
        if candidates.is_empty() {
            return None;
        }

        let idx = match (policy, client_key) {
            (LoadBalancePolicy::ClientHash, Some(key)) => {
                (client_hash(key) % candidates.len() as u64) as usize
            }
            _ => self.next(service_name) % candidates.len(),
        };
        candidates.get(idx)
    }

    fn next(&self, service_name: &str) -> usize {
        if let Some(counter) = self.counters.get(service_name) {
            return counter.fetch_add(1, Ordering::Relaxed);
        }
        self.counters
            .entry(service_name.to_string())
            .or_insert_with(|| AtomicUsize::new(0))
            .fetch_add(1, Ordering::Relaxed)
    }
}
