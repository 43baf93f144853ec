//! Lease manager: periodic expiry sweep with self-preservation
//!
//! Any instance whose last renewal is older than the TTL is evicted on the
//! next sweep. When a single sweep would evict more than the configured
//! fraction of the registry, the sweep is skipped and the manager enters
//! degraded mode instead (mass expiry usually means the registry lost its
//! network, not that every service died).

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use super::store::RegistryStore;
use crate::types::GatewayError;

/// Default sweep interval
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(30);

/// Default lease TTL
pub const DEFAULT_LEASE_TTL: Duration = Duration::from_secs(90);

/// Lease expiry configuration
#[derive(Debug, Clone)]
pub struct LeaseConfig {
    /// Lease time-to-live since last renewal
    pub ttl: Duration,
    /// How often to sweep
    pub sweep_interval: Duration,
    /// Whether self-preservation is enabled at all
    pub self_preservation: bool,
    /// Expired fraction above which a sweep is skipped
    pub self_preservation_threshold: f64,
    /// Registries smaller than this are always swept
    pub self_preservation_min_instances: usize,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            ttl: DEFAULT_LEASE_TTL,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
            self_preservation: true,
            self_preservation_threshold: 0.85,
            self_preservation_min_instances: 3,
        }
    }
}

/// What one sweep did
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SweepReport {
    pub expired: usize,
    pub total: usize,
    pub evicted: usize,
    /// Self-preservation vetoed the eviction
    pub skipped: bool,
    /// Another sweep was already running
    pub overlapped: bool,
}

/// Marks a sweep in progress; cleared on drop, including when the
/// sweeping future is cancelled
struct SweepGuard<'a>(&'a AtomicBool);

impl Drop for SweepGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Periodic lease sweeper
pub struct LeaseManager {
    store: Arc<RegistryStore>,
    config: LeaseConfig,
    /// Raised when self-preservation skips a sweep
    degraded: AtomicBool,
    /// Held for the duration of a sweep
    sweeping: AtomicBool,
    /// Sweeps that ran to completion
    completed: AtomicU64,
    running: Arc<RwLock<bool>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl LeaseManager {
    pub fn new(store: Arc<RegistryStore>, config: LeaseConfig) -> Self {
        Self {
            store,
            config,
            degraded: AtomicBool::new(false),
            sweeping: AtomicBool::new(false),
            completed: AtomicU64::new(0),
            running: Arc::new(RwLock::new(false)),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn config(&self) -> &LeaseConfig {
        &self.config
    }

    /// Whether the last sweep was skipped by self-preservation
    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::SeqCst)
    }

    /// Degraded state as an error, for readiness probes
    pub fn check_degraded(&self) -> Result<(), GatewayError> {
        if self.is_degraded() {
            Err(GatewayError::DegradedMode(
                "lease expiry suspended by self-preservation".into(),
            ))
        } else {
            Ok(())
        }
    }

    /// Number of sweeps that ran to completion
    pub fn sweeps(&self) -> u64 {
        self.completed.load(Ordering::SeqCst)
    }

    fn begin_sweep(&self) -> Option<SweepGuard<'_>> {
        self.sweeping
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| SweepGuard(&self.sweeping))
    }

    fn should_preserve(&self, expired: usize, total: usize) -> bool {
        if !self.config.self_preservation || total == 0 {
            return false;
        }
        if total < self.config.self_preservation_min_instances {
            return false;
        }
        (expired as f64 / total as f64) > self.config.self_preservation_threshold
    }

    /// Run one expiry sweep now
    pub async fn sweep(&self) -> SweepReport {
        let Some(_guard) = self.begin_sweep() else {
            debug!("Lease sweep already in progress, skipping");
            return SweepReport {
                overlapped: true,
                ..Default::default()
            };
        };

        let mut preserved = false;
        let outcome = self
            .store
            .evict_expired(self.config.ttl, Instant::now(), |expired, total| {
                preserved = self.should_preserve(expired, total);
                !preserved
            })
            .await;

        let report = SweepReport {
            expired: outcome.expired,
            total: outcome.total,
            evicted: outcome.evicted.len(),
            skipped: preserved,
            overlapped: false,
        };

        if preserved {
            let was_degraded = self.degraded.swap(true, Ordering::SeqCst);
            let err = GatewayError::DegradedMode(format!(
                "{} of {} leases expired in one sweep",
                report.expired, report.total
            ));
            if !was_degraded {
                warn!(
                    expired = report.expired,
                    total = report.total,
                    threshold = self.config.self_preservation_threshold,
                    "Self-preservation engaged: {}",
                    err
                );
            } else {
                debug!(expired = report.expired, total = report.total, "Still in self-preservation");
            }
        } else {
            if self.degraded.swap(false, Ordering::SeqCst) {
                info!("Self-preservation released, lease expiry resumed");
            }
            for instance in &outcome.evicted {
                info!(
                    instance = %instance.key(),
                    last_renewal = %instance.last_renewal_timestamp,
                    "Evicted expired instance"
                );
            }
        }

        self.completed.fetch_add(1, Ordering::SeqCst);
        report
    }

    /// Start the periodic sweep task
    pub async fn start(self: Arc<Self>) {
        {
            let mut running = self.running.write().await;
            if *running {
                warn!("Lease manager already running");
                return;
            }
            *running = true;
        }

        info!(
            ttl = ?self.config.ttl,
            interval = ?self.config.sweep_interval,
            self_preservation = self.config.self_preservation,
            "Starting lease manager"
        );

        let manager = Arc::clone(&self);
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(manager.config.sweep_interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // First tick completes immediately; nothing can have expired yet
            interval.tick().await;

            loop {
                interval.tick().await;

                if !*manager.running.read().await {
                    info!("Lease manager stopped");
                    break;
                }

                let report = manager.sweep().await;
                if report.overlapped {
                    error!("Lease sweep overlapped a previous sweep");
                }
            }
        });
        self.tasks.lock().await.push(handle);
    }

    /// Stop sweeping. The loop is aborted, so a later `start` runs alone.
    pub async fn stop(&self) {
        *self.running.write().await = false;
        for handle in self.tasks.lock().await.drain(..) {
            handle.abort();
        }
        info!("Stopping lease manager");
    }

    pub async fn is_running(&self) -> bool {
        *self.running.read().await
    }
}
