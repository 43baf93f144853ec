//! Transport seam between discovery clients and the registry
//!
//! `HttpRegistryClient` talks to a remote `gatehouse-registry` over JSON;
//! `LocalRegistry` wraps an in-process store (embedded registry mode).

use async_trait::async_trait;
use reqwest::{StatusCode, Url};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::registry::{
    RegistrationRequest, RegistrySnapshot, RegistryStore, ServiceInstance, SnapshotTag,
};
use crate::types::{GatewayError, Result};

/// Operations a discovery client needs from the registry
#[async_trait]
pub trait RegistryApi: Send + Sync {
    /// Register or re-register an instance
    async fn register(&self, req: &RegistrationRequest) -> Result<ServiceInstance>;

    /// Renew a lease; `NotFound` means the caller must re-register
    async fn renew(&self, service_name: &str, instance_id: &str) -> Result<()>;

    /// Remove an instance; returns whether it was present
    async fn deregister(&self, service_name: &str, instance_id: &str) -> Result<bool>;

    /// Full registry table, or `None` if the registry is still at `since`
    async fn fetch_snapshot(&self, since: Option<&SnapshotTag>) -> Result<Option<RegistrySnapshot>>;
}

/// In-process registry access
pub struct LocalRegistry {
    store: Arc<RegistryStore>,
}

impl LocalRegistry {
    pub fn new(store: Arc<RegistryStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl RegistryApi for LocalRegistry {
    async fn register(&self, req: &RegistrationRequest) -> Result<ServiceInstance> {
        self.store.register(req.clone()).await
    }

    async fn renew(&self, service_name: &str, instance_id: &str) -> Result<()> {
        self.store.renew(service_name, instance_id).await.map(|_| ())
    }

    async fn deregister(&self, service_name: &str, instance_id: &str) -> Result<bool> {
        Ok(self.store.deregister(service_name, instance_id).await)
    }

    async fn fetch_snapshot(&self, since: Option<&SnapshotTag>) -> Result<Option<RegistrySnapshot>> {
        if since == Some(&self.store.tag()) {
            return Ok(None);
        }
        Ok(Some(self.store.full_snapshot().await))
    }
}

/// Error body returned by the registry API
#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    message: String,
}

/// Registry client over HTTP
pub struct HttpRegistryClient {
    base: Url,
    client: reqwest::Client,
}

impl HttpRegistryClient {
    /// Create a client; `timeout` bounds every call
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let base = Url::parse(base_url)
            .map_err(|e| GatewayError::Config(format!("invalid registry URL '{}': {}", base_url, e)))?;
        if base.cannot_be_a_base() {
            return Err(GatewayError::Config(format!(
                "registry URL '{}' cannot be a base",
                base_url
            )));
        }
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .build()?;
        Ok(Self { base, client })
    }

    pub fn base_url(&self) -> &Url {
        &self.base
    }

    fn url(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| GatewayError::Config("registry URL cannot be a base".into()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    /// Map a non-success response onto the error taxonomy
    async fn error_from(response: reqwest::Response, what: &str) -> GatewayError {
        let status = response.status();
        let message = response
            .json::<ErrorBody>()
            .await
            .map(|b| b.message)
            .unwrap_or_default();
        let message = if message.is_empty() {
            format!("{} returned {}", what, status)
        } else {
            message
        };

        match status {
            StatusCode::NOT_FOUND => GatewayError::NotFound(message),
            StatusCode::BAD_REQUEST => GatewayError::Registration(message),
            _ => GatewayError::Http(message),
        }
    }
}

#[async_trait]
impl RegistryApi for HttpRegistryClient {
    async fn register(&self, req: &RegistrationRequest) -> Result<ServiceInstance> {
        let url = self.url(&["registry", "instances"])?;
        let response = self.client.post(url).json(req).send().await?;
        if !response.status().is_success() {
            return Err(Self::error_from(response, "register").await);
        }
        Ok(response.json::<ServiceInstance>().await?)
    }

    async fn renew(&self, service_name: &str, instance_id: &str) -> Result<()> {
        let url = self.url(&["registry", "instances", service_name, instance_id, "heartbeat"])?;
        let response = self.client.put(url).send().await?;
        if !response.status().is_success() {
            return Err(Self::error_from(response, "renew").await);
        }
        Ok(())
    }

    async fn deregister(&self, service_name: &str, instance_id: &str) -> Result<bool> {
        #[derive(Deserialize)]
        struct Removed {
            removed: bool,
        }

        let url = self.url(&["registry", "instances", service_name, instance_id])?;
        let response = self.client.delete(url).send().await?;
        if !response.status().is_success() {
            return Err(Self::error_from(response, "deregister").await);
        }
        Ok(response.json::<Removed>().await?.removed)
    }

    async fn fetch_snapshot(&self, since: Option<&SnapshotTag>) -> Result<Option<RegistrySnapshot>> {
        let mut url = self.url(&["registry", "snapshot"])?;
        if let Some(tag) = since {
            url.query_pairs_mut()
                .append_pair("sinceVersion", &tag.version.to_string())
                .append_pair("epoch", &tag.epoch);
        }

        let response = self.client.get(url).send().await?;
        if response.status() == StatusCode::NOT_MODIFIED {
            debug!(?since, "Registry snapshot not modified");
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(Self::error_from(response, "snapshot").await);
        }
        Ok(Some(response.json::<RegistrySnapshot>().await?))
    }
}
