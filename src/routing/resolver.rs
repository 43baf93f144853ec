//! Route resolver: request -> route -> live instance
//!
//! Never retries on its own. The forwarder asks again with an `exclude`
//! list when it wants a different instance.

use dashmap::DashMap;
use std::sync::Arc;
use tracing::debug;

use super::balancer::LoadBalancer;
use super::reload::RouteTableHandle;
use super::route::Route;
use crate::discovery::RegistryCache;
use crate::registry::{InstanceKey, ServiceInstance, SnapshotTag};
use crate::types::{GatewayError, Result};

/// A matched route and the instance chosen for it
#[derive(Debug, Clone)]
pub struct Resolution {
    pub route: Arc<Route>,
    pub instance: ServiceInstance,
}

/// UP instances of one service as of one cache snapshot
struct CandidateSet {
    tag: SnapshotTag,
    instances: Arc<Vec<ServiceInstance>>,
}

pub struct RouteResolver {
    routes: Arc<RouteTableHandle>,
    cache: Arc<RegistryCache>,
    balancer: LoadBalancer,
    candidates: DashMap<String, CandidateSet>,
}

impl RouteResolver {
    pub fn new(routes: Arc<RouteTableHandle>, cache: Arc<RegistryCache>) -> Self {
        Self {
            routes,
            cache,
            balancer: LoadBalancer::new(),
            candidates: DashMap::new(),
        }
    }

    pub fn routes(&self) -> &Arc<RouteTableHandle> {
        &self.routes
    }

    pub fn cache(&self) -> &Arc<RegistryCache> {
        &self.cache
    }

    /// Best matching route, or `NoRoute`
    pub async fn match_route(&self, host: Option<&str>, path: &str) -> Result<Arc<Route>> {
        self.routes.current().await.find(host, path).ok_or_else(|| {
            GatewayError::NoRoute(match host {
                Some(host) => format!("{}{}", host, path),
                None => path.to_string(),
            })
        })
    }

    /// UP instances of a service, sorted by instance ID.
    /// Rebuilt when the registry cache version moves.
    pub async fn candidates(&self, service_name: &str) -> Arc<Vec<ServiceInstance>> {
        let snapshot = self.cache.snapshot().await;

        if let Some(set) = self.candidates.get(service_name) {
            if snapshot.is_tagged(&set.tag) {
                return Arc::clone(&set.instances);
            }
        }

        let instances = Arc::new(snapshot.up_instances(service_name));
        debug!(
            service = service_name,
            version = snapshot.version,
            count = instances.len(),
            "Rebuilt candidate list"
        );
        self.candidates.insert(
            service_name.to_string(),
            CandidateSet {
                tag: snapshot.tag(),
                instances: Arc::clone(&instances),
            },
        );
        instances
    }

    /// Pick an instance of the route's target, skipping `exclude`
    pub async fn pick(
        &self,
        route: &Route,
        client_key: Option<&str>,
        exclude: &[InstanceKey],
    ) -> Result<ServiceInstance> {
        let all = self.candidates(&route.target).await;
        if all.is_empty() {
            return Err(GatewayError::NoInstanceAvailable(route.target.clone()));
        }

        let eligible: Vec<ServiceInstance> = if exclude.is_empty() {
            all.as_ref().clone()
        } else {
            all.iter()
                .filter(|i| !exclude.contains(&i.key()))
                .cloned()
                .collect()
        };

        self.balancer
            .choose(route.policy, &route.target, &eligible, client_key)
            .cloned()
            .ok_or_else(|| GatewayError::NoInstanceAvailable(route.target.clone()))
    }

    /// Match a route and pick an instance for it
    pub async fn resolve(
        &self,
        host: Option<&str>,
        path: &str,
        client_key: Option<&str>,
        exclude: &[InstanceKey],
    ) -> Result<Resolution> {
        let route = self.match_route(host, path).await?;
        let instance = self.pick(&route, client_key, exclude).await?;
        Ok(Resolution { route, instance })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{InstanceStatus, RegistrationRequest, RegistryStore};
    use crate::routing::route::RouteTable;

    async fn setup(routes: &str) -> (Arc<RegistryStore>, Arc<RegistryCache>, RouteResolver) {
        let store = Arc::new(RegistryStore::new());
        let cache = Arc::new(RegistryCache::new());
        let handle = Arc::new(RouteTableHandle::new(RouteTable::from_json(routes).unwrap()));
        let resolver = RouteResolver::new(handle, Arc::clone(&cache));
        (store, cache, resolver)
    }

    const ROUTES: &str = r#"{"routes":[
        {"id":"accounts","match":{"pathPrefix":"/accounts"},"target":"accounts"}
    ]}"#;

    async fn sync(store: &RegistryStore, cache: &RegistryCache) {
        cache.apply(store.full_snapshot().await).await;
    }

    #[tokio::test]
    async fn test_resolve_to_registered_instance() {
        let (store, cache, resolver) = setup(ROUTES).await;
        store
            .register(RegistrationRequest::new("accounts", "A1", "10.0.0.1", 8080))
            .await
            .unwrap();
        sync(&store, &cache).await;

        let res = resolver.resolve(None, "/accounts/42", None, &[]).await.unwrap();
        assert_eq!(res.route.id, "accounts");
        assert_eq!(res.instance.host, "10.0.0.1");

        store.deregister("accounts", "A1").await;
        sync(&store, &cache).await;
        assert!(matches!(
            resolver.resolve(None, "/accounts/42", None, &[]).await,
            Err(GatewayError::NoInstanceAvailable(_))
        ));
    }

    #[tokio::test]
    async fn test_no_route() {
        let (_store, _cache, resolver) = setup(ROUTES).await;
        assert!(matches!(
            resolver.resolve(Some("gw.local"), "/orders", None, &[]).await,
            Err(GatewayError::NoRoute(_))
        ));
    }

    #[tokio::test]
    async fn test_non_up_instances_never_returned() {
        let (store, cache, resolver) = setup(ROUTES).await;
        store
            .register(
                RegistrationRequest::new("accounts", "A1", "10.0.0.1", 8080)
                    .with_status(InstanceStatus::OutOfService),
            )
            .await
            .unwrap();
        sync(&store, &cache).await;

        assert!(matches!(
            resolver.resolve(None, "/accounts", None, &[]).await,
            Err(GatewayError::NoInstanceAvailable(_))
        ));
    }

    #[tokio::test]
    async fn test_exclude_picks_other_instance() {
        let (store, cache, resolver) = setup(ROUTES).await;
        for (id, port) in [("A1", 8081), ("A2", 8082)] {
            store
                .register(RegistrationRequest::new("accounts", id, "10.0.0.1", port))
                .await
                .unwrap();
        }
        sync(&store, &cache).await;

        let exclude = [InstanceKey::new("accounts", "A1")];
        for _ in 0..5 {
            let res = resolver.resolve(None, "/accounts", None, &exclude).await.unwrap();
            assert_eq!(res.instance.instance_id, "A2");
        }

        let both = [
            InstanceKey::new("accounts", "A1"),
            InstanceKey::new("accounts", "A2"),
        ];
        assert!(matches!(
            resolver.resolve(None, "/accounts", None, &both).await,
            Err(GatewayError::NoInstanceAvailable(_))
        ));
    }

    #[tokio::test]
    async fn test_round_robin_split() {
        let (store, cache, resolver) = setup(ROUTES).await;
        for (id, port) in [("A2", 8082), ("A1", 8081)] {
            store
                .register(RegistrationRequest::new("accounts", id, "10.0.0.1", port))
                .await
                .unwrap();
        }
        sync(&store, &cache).await;

        let mut a1 = 0;
        let mut a2 = 0;
        for _ in 0..101 {
            match resolver
                .resolve(None, "/accounts", None, &[])
                .await
                .unwrap()
                .instance
                .instance_id
                .as_str()
            {
                "A1" => a1 += 1,
                _ => a2 += 1,
            }
        }
        assert!((a1 as i32 - a2 as i32).abs() <= 1, "a1={} a2={}", a1, a2);
    }

    #[tokio::test]
    async fn test_candidates_follow_cache_version() {
        let (store, cache, resolver) = setup(ROUTES).await;
        store
            .register(RegistrationRequest::new("accounts", "A1", "10.0.0.1", 8081))
            .await
            .unwrap();
        sync(&store, &cache).await;
        assert_eq!(resolver.candidates("accounts").await.len(), 1);

        store
            .register(RegistrationRequest::new("accounts", "A2", "10.0.0.2", 8082))
            .await
            .unwrap();
        // Cache not refreshed yet: still one candidate
        assert_eq!(resolver.candidates("accounts").await.len(), 1);

        sync(&store, &cache).await;
        let ids: Vec<_> = resolver
            .candidates("accounts")
            .await
            .iter()
            .map(|i| i.instance_id.clone())
            .collect();
        assert_eq!(ids, ["A1", "A2"]);
    }
}
