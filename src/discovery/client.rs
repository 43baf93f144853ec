//! Discovery client
//!
//! Keeps one local instance registered (register-only mode, used by the
//! sidecar), keeps a local registry cache fresh (fetch-only mode, used by
//! the gateway), or both.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use super::api::RegistryApi;
use super::backoff::{retry, BackoffConfig};
use super::cache::RegistryCache;
use crate::registry::{InstanceStatus, RegistrationRequest, ServiceInstance};
use crate::types::{GatewayError, Result};

/// Discovery client configuration
#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    /// How often the local instance renews its lease
    pub renew_interval: Duration,
    /// How often the registry table is pulled
    pub fetch_interval: Duration,
    /// Consecutive failed calls before the local instance marks itself STARTING
    pub failure_threshold: u32,
    /// Whether to pull the registry table at all
    pub fetch_registry: bool,
    pub backoff: BackoffConfig,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            renew_interval: Duration::from_secs(30),
            fetch_interval: Duration::from_secs(30),
            failure_threshold: 3,
            fetch_registry: true,
            backoff: BackoffConfig::default(),
        }
    }
}

pub struct DiscoveryClient {
    api: Arc<dyn RegistryApi>,
    cache: Arc<RegistryCache>,
    config: DiscoveryConfig,
    /// Registration payload for the local instance, if any
    local: Option<RegistrationRequest>,
    /// Status the local instance believes it has
    local_status: RwLock<InstanceStatus>,
    registered: AtomicBool,
    consecutive_failures: AtomicU32,
    running: Arc<RwLock<bool>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl DiscoveryClient {
    pub fn new(api: Arc<dyn RegistryApi>, cache: Arc<RegistryCache>, config: DiscoveryConfig) -> Self {
        Self {
            api,
            cache,
            config,
            local: None,
            local_status: RwLock::new(InstanceStatus::Up),
            registered: AtomicBool::new(false),
            consecutive_failures: AtomicU32::new(0),
            running: Arc::new(RwLock::new(false)),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Manage the lease of a local instance
    pub fn with_local_instance(mut self, req: RegistrationRequest) -> Self {
        self.local_status = RwLock::new(req.status);
        self.local = Some(req);
        self
    }

    pub fn cache(&self) -> Arc<RegistryCache> {
        Arc::clone(&self.cache)
    }

    pub fn local_instance(&self) -> Option<&RegistrationRequest> {
        self.local.as_ref()
    }

    /// Status the local instance currently reports for itself
    pub async fn local_status(&self) -> Option<InstanceStatus> {
        match self.local {
            Some(_) => Some(*self.local_status.read().await),
            None => None,
        }
    }

    pub fn is_registered(&self) -> bool {
        self.registered.load(Ordering::SeqCst)
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::SeqCst)
    }

    fn local_or_err(&self) -> Result<&RegistrationRequest> {
        self.local
            .as_ref()
            .ok_or_else(|| GatewayError::Config("no local instance configured".into()))
    }

    async fn record_failure(&self) {
        let failures = self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
        if self.local.is_none() || failures < self.config.failure_threshold {
            return;
        }

        let mut status = self.local_status.write().await;
        if *status != InstanceStatus::Starting {
            warn!(
                failures,
                "Registry unreachable, local instance marked {}",
                InstanceStatus::Starting
            );
            *status = InstanceStatus::Starting;
        }
    }

    async fn record_success(&self) {
        self.consecutive_failures.store(0, Ordering::SeqCst);
    }

    async fn is_starting(&self) -> bool {
        *self.local_status.read().await == InstanceStatus::Starting
    }

    /// Status to announce on registration: STARTING while recovering from
    /// an outage, the configured status otherwise
    async fn announced(&self, req: &RegistrationRequest) -> RegistrationRequest {
        if self.is_starting().await {
            req.clone().with_status(InstanceStatus::Starting)
        } else {
            req.clone()
        }
    }

    /// Count a call outcome towards the consecutive-failure tally.
    /// Permanent errors prove the registry is reachable.
    async fn observe<T>(&self, result: &Result<T>) {
        match result {
            Err(e) if e.is_transient() => self.record_failure().await,
            _ => self.record_success().await,
        }
    }

    /// Register the local instance, retrying transient failures.
    ///
    /// After an outage the instance is first registered as STARTING and
    /// then re-registered with its configured status.
    pub async fn register(&self) -> Result<ServiceInstance> {
        let req = self.local_or_err()?;

        let mut instance = retry(&self.config.backoff, "register", |_| async move {
            let payload = self.announced(req).await;
            let result = self.api.register(&payload).await;
            self.observe(&result).await;
            result
        })
        .await?;

        self.registered.store(true, Ordering::SeqCst);
        info!(instance = %instance.key(), status = %instance.status, "Registered with registry");

        if self.is_starting().await && req.status != InstanceStatus::Starting {
            instance = retry(&self.config.backoff, "register", |_| async move {
                let result = self.api.register(req).await;
                self.observe(&result).await;
                result
            })
            .await?;

            *self.local_status.write().await = req.status;
            info!(
                instance = %instance.key(),
                "Registry reachable again, local instance back to {}",
                req.status
            );
        }
        Ok(instance)
    }

    /// Renew the local lease. Re-registers if the registry no longer
    /// knows the instance.
    pub async fn renew(&self) -> Result<()> {
        let req = self.local_or_err()?;
        if !self.is_registered() {
            return self.register().await.map(|_| ());
        }

        let result = retry(&self.config.backoff, "renew", |_| async move {
            let result = self.api.renew(&req.service_name, &req.instance_id).await;
            self.observe(&result).await;
            result
        })
        .await;

        match result {
            Ok(()) if self.is_starting().await => {
                info!(instance = %req.key(), "Lease renewed after outage, re-announcing");
                self.register().await.map(|_| ())
            }
            Ok(()) => {
                debug!(instance = %req.key(), "Lease renewed");
                Ok(())
            }
            Err(GatewayError::NotFound(_)) => {
                info!(instance = %req.key(), "Lease unknown to registry, re-registering");
                self.registered.store(false, Ordering::SeqCst);
                self.register().await.map(|_| ())
            }
            Err(e) => Err(e),
        }
    }

    /// Remove the local instance from the registry
    pub async fn deregister(&self) -> Result<bool> {
        let req = self.local_or_err()?;

        let removed = retry(&self.config.backoff, "deregister", |_| async move {
            let result = self.api.deregister(&req.service_name, &req.instance_id).await;
            self.observe(&result).await;
            result
        })
        .await?;

        self.registered.store(false, Ordering::SeqCst);
        info!(instance = %req.key(), removed, "Deregistered from registry");
        Ok(removed)
    }

    /// Pull the registry table into the local cache.
    /// Returns whether the cache changed.
    pub async fn refresh(&self) -> Result<bool> {
        let since = if self.cache.is_ready() {
            Some(self.cache.tag().await)
        } else {
            None
        };
        let since = since.as_ref();

        let snapshot = retry(&self.config.backoff, "fetch", |_| async move {
            let result = self.api.fetch_snapshot(since).await;
            self.observe(&result).await;
            result
        })
        .await?;

        match snapshot {
            Some(snapshot) => Ok(self.cache.apply(snapshot).await),
            None => Ok(false),
        }
    }

    /// Start the renewal and fetch loops
    pub async fn start(self: Arc<Self>) {
        {
            let mut running = self.running.write().await;
            if *running {
                warn!("Discovery client already running");
                return;
            }
            *running = true;
        }

        if let Some(local) = &self.local {
            info!(
                instance = %local.key(),
                interval = ?self.config.renew_interval,
                "Starting lease renewal"
            );
            let client = Arc::clone(&self);
            let handle = tokio::spawn(async move {
                let mut interval = tokio::time::interval(client.config.renew_interval);
                interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

                loop {
                    interval.tick().await;
                    if !*client.running.read().await {
                        info!("Lease renewal stopped");
                        break;
                    }
                    if let Err(e) = client.renew().await {
                        error!("Failed to renew lease: {}", e);
                    }
                }
            });
            self.tasks.lock().await.push(handle);
        }

        if self.config.fetch_registry {
            info!(interval = ?self.config.fetch_interval, "Starting registry fetch");
            let client = Arc::clone(&self);
            let handle = tokio::spawn(async move {
                let mut interval = tokio::time::interval(client.config.fetch_interval);
                interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

                loop {
                    interval.tick().await;
                    if !*client.running.read().await {
                        info!("Registry fetch stopped");
                        break;
                    }
                    if let Err(e) = client.refresh().await {
                        error!("Failed to fetch registry: {}", e);
                    }
                }
            });
            self.tasks.lock().await.push(handle);
        }
    }

    /// Stop the loops. A later `start` runs fresh loops only.
    pub async fn stop(&self) {
        *self.running.write().await = false;
        for handle in self.tasks.lock().await.drain(..) {
            handle.abort();
        }
        info!("Stopping discovery client");
    }

    pub async fn is_running(&self) -> bool {
        *self.running.read().await
    }

    /// Stop the loops and deregister the local instance, if registered
    pub async fn shutdown(&self) -> Result<()> {
        self.stop().await;
        if self.local.is_some() && self.is_registered() {
            self.deregister().await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::api::LocalRegistry;
    use crate::registry::{RegistrySnapshot, RegistryStore, SnapshotTag};
    use async_trait::async_trait;

    /// Fails the next `fail_next` calls with a transient error and records
    /// the statuses it was asked to register
    struct FlakyRegistry {
        inner: LocalRegistry,
        fail_next: AtomicU32,
        lease_calls: AtomicU32,
        registered: std::sync::Mutex<Vec<InstanceStatus>>,
    }

    impl FlakyRegistry {
        fn new(store: Arc<RegistryStore>) -> Self {
            Self {
                inner: LocalRegistry::new(store),
                fail_next: AtomicU32::new(0),
                lease_calls: AtomicU32::new(0),
                registered: std::sync::Mutex::new(Vec::new()),
            }
        }

        fn registered_statuses(&self) -> Vec<InstanceStatus> {
            self.registered.lock().unwrap().clone()
        }

        fn fail(&self, n: u32) {
            self.fail_next.store(n, Ordering::SeqCst);
        }

        fn check(&self) -> Result<()> {
            let remaining = self.fail_next.load(Ordering::SeqCst);
            if remaining > 0 {
                self.fail_next.store(remaining - 1, Ordering::SeqCst);
                return Err(GatewayError::Http("connection refused".into()));
            }
            Ok(())
        }
    }

    #[async_trait]
    impl RegistryApi for FlakyRegistry {
        async fn register(&self, req: &RegistrationRequest) -> Result<ServiceInstance> {
            self.lease_calls.fetch_add(1, Ordering::SeqCst);
            self.check()?;
            self.registered.lock().unwrap().push(req.status);
            self.inner.register(req).await
        }

        async fn renew(&self, service_name: &str, instance_id: &str) -> Result<()> {
            self.lease_calls.fetch_add(1, Ordering::SeqCst);
            self.check()?;
            self.inner.renew(service_name, instance_id).await
        }

        async fn deregister(&self, service_name: &str, instance_id: &str) -> Result<bool> {
            self.check()?;
            self.inner.deregister(service_name, instance_id).await
        }

        async fn fetch_snapshot(&self, since: Option<&SnapshotTag>) -> Result<Option<RegistrySnapshot>> {
            self.check()?;
            self.inner.fetch_snapshot(since).await
        }
    }

    fn config() -> DiscoveryConfig {
        DiscoveryConfig {
            renew_interval: Duration::from_secs(10),
            fetch_interval: Duration::from_secs(5),
            backoff: BackoffConfig {
                initial: Duration::from_millis(100),
                max: Duration::from_secs(1),
                max_attempts: 2,
                jitter: 0.0,
            },
            ..Default::default()
        }
    }

    fn setup() -> (Arc<RegistryStore>, Arc<FlakyRegistry>, DiscoveryClient) {
        let store = Arc::new(RegistryStore::new());
        let api = Arc::new(FlakyRegistry::new(Arc::clone(&store)));
        let client = DiscoveryClient::new(
            Arc::clone(&api) as Arc<dyn RegistryApi>,
            Arc::new(RegistryCache::new()),
            config(),
        )
        .with_local_instance(RegistrationRequest::new("accounts", "A1", "10.0.0.1", 8080));
        (store, api, client)
    }

    #[tokio::test(start_paused = true)]
    async fn test_register_and_renew() {
        let (store, _api, client) = setup();
        client.register().await.unwrap();
        assert!(client.is_registered());
        assert!(store.get("accounts", "A1").await.is_some());

        client.renew().await.unwrap();
        assert_eq!(client.consecutive_failures(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_renew_not_found_reregisters() {
        let (store, _api, client) = setup();
        client.register().await.unwrap();

        // Registry evicted us behind our back
        assert!(store.deregister("accounts", "A1").await);

        client.renew().await.unwrap();
        assert!(store.get("accounts", "A1").await.is_some());
        assert!(client.is_registered());
    }

    #[tokio::test(start_paused = true)]
    async fn test_marks_starting_after_consecutive_failures() {
        let (_store, api, client) = setup();
        client.register().await.unwrap();
        assert_eq!(client.local_status().await, Some(InstanceStatus::Up));

        // Two attempts per renew: 4 failures, threshold is 3
        api.fail(4);
        assert!(client.renew().await.is_err());
        assert!(client.renew().await.is_err());
        assert_eq!(client.consecutive_failures(), 4);
        assert_eq!(client.local_status().await, Some(InstanceStatus::Starting));

        // One success restores UP
        client.renew().await.unwrap();
        assert_eq!(client.consecutive_failures(), 0);
        assert_eq!(client.local_status().await, Some(InstanceStatus::Up));
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovery_announces_starting_then_up() {
        let (store, api, client) = setup();
        client.register().await.unwrap();

        api.fail(4);
        assert!(client.renew().await.is_err());
        assert!(client.renew().await.is_err());
        assert_eq!(client.local_status().await, Some(InstanceStatus::Starting));

        client.renew().await.unwrap();
        assert_eq!(
            api.registered_statuses(),
            [InstanceStatus::Up, InstanceStatus::Starting, InstanceStatus::Up]
        );
        assert_eq!(
            store.get("accounts", "A1").await.unwrap().status,
            InstanceStatus::Up
        );
        assert_eq!(client.local_status().await, Some(InstanceStatus::Up));
    }

    #[tokio::test(start_paused = true)]
    async fn test_register_during_outage_announces_starting_first() {
        let (store, api, client) = setup();

        // Threshold is 3, two attempts per call
        api.fail(3);
        assert!(client.register().await.is_err());
        assert_eq!(client.local_status().await, Some(InstanceStatus::Up));
        client.register().await.unwrap();

        assert_eq!(
            api.registered_statuses(),
            [InstanceStatus::Starting, InstanceStatus::Up]
        );
        assert_eq!(
            store.get("accounts", "A1").await.unwrap().status,
            InstanceStatus::Up
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_runs_a_single_renew_loop() {
        let (_store, api, client) = setup();
        let client = Arc::new(client);

        Arc::clone(&client).start().await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(api.lease_calls.load(Ordering::SeqCst), 1);

        client.stop().await;
        Arc::clone(&client).start().await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(api.lease_calls.load(Ordering::SeqCst), 2);

        // One renew interval later only the new loop ticks
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(api.lease_calls.load(Ordering::SeqCst), 3);
        client.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_absorbs_single_failure() {
        let (_store, api, client) = setup();
        api.fail(1);
        client.register().await.unwrap();
        assert_eq!(client.local_status().await, Some(InstanceStatus::Up));
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_updates_cache() {
        let (store, _api, client) = setup();
        assert!(!client.cache().is_ready());

        client.register().await.unwrap();
        assert!(client.refresh().await.unwrap());
        assert_eq!(client.cache().up_instances("accounts").await.len(), 1);

        // Unchanged registry: not modified
        assert!(!client.refresh().await.unwrap());

        store.deregister("accounts", "A1").await;
        assert!(client.refresh().await.unwrap());
        assert!(client.cache().up_instances("accounts").await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_deregisters() {
        let (store, _api, client) = setup();
        let client = Arc::new(client);
        Arc::clone(&client).start().await;

        // First renewal tick registers immediately
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(client.is_registered());
        assert!(store.get("accounts", "A1").await.is_some());

        client.shutdown().await.unwrap();
        assert!(!client.is_running().await);
        assert!(store.get("accounts", "A1").await.is_none());
    }

    #[tokio::test]
    async fn test_fetch_only_client_has_no_local_instance() {
        let store = Arc::new(RegistryStore::new());
        let client = DiscoveryClient::new(
            Arc::new(LocalRegistry::new(store)),
            Arc::new(RegistryCache::new()),
            config(),
        );
        assert!(client.local_status().await.is_none());
        assert!(matches!(client.register().await, Err(GatewayError::Config(_))));
        client.shutdown().await.unwrap();
    }
}
