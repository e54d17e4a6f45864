//! Orchestration facade over the registry
//!
//! Every call resolves the connector for a backend through the registry and
//! retries exactly once when the connector reports a stale transport.

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::connector::Factories;
use crate::driver::{
    BackendKind, BackendUrl, ConfigureOptions, Device, Driver, ForeignServer, InterfaceStats,
    PeerStats,
};
use crate::error::{WgctlError, WgctlResult};
use crate::registry::{BackendInfo, Registry};

/// The `(entity_id, backend_type, url)` tuple a connector is built from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendTarget {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: BackendKind,
    pub url: String,
}

impl BackendTarget {
    pub fn new(id: impl Into<String>, kind: BackendKind, url: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind,
            url: url.into(),
        }
    }

    /// Target whose type is taken from the URL scheme
    pub fn from_url(id: impl Into<String>, url: &str) -> WgctlResult<Self> {
        let parsed = BackendUrl::parse(url)?;
        let kind: BackendKind = parsed.kind.parse()?;
        Ok(Self::new(id, kind, url))
    }
}

pub struct WireguardService {
    registry: Registry,
}

impl WireguardService {
    pub fn new(factories: Arc<Factories>) -> Self {
        Self {
            registry: Registry::new(factories),
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Run `op` against the target's connector, rebuilding it once if stale
    async fn with_backend_retry<T, F, Fut>(&self, target: &BackendTarget, op: F) -> WgctlResult<T>
    where
        F: Fn(Arc<dyn Driver>) -> Fut,
        Fut: Future<Output = WgctlResult<T>>,
    {
        let driver = self
            .registry
            .get_or_create(&target.id, target.kind.as_str(), &target.url)
            .await?;

        match op(driver).await {
            Err(e) if e.is_stale() => {
                warn!("Backend {} is stale, reconnecting: {}", target.id, e);
                if let Err(close_err) = self.registry.remove(&target.id).await {
                    return Err(WgctlError::Multiple(vec![e, close_err]));
                }
                let driver = self
                    .registry
                    .get_or_create(&target.id, target.kind.as_str(), &target.url)
                    .await?;
                debug!("Retrying operation on fresh {} backend {}", target.kind, target.id);
                op(driver).await
            }
            result => result,
        }
    }

    pub async fn device(&self, target: &BackendTarget, name: &str) -> WgctlResult<Device> {
        self.with_backend_retry(target, |driver| async move { driver.device(name).await })
            .await
    }

    pub async fn up(&self, target: &BackendTarget, options: &ConfigureOptions) -> WgctlResult<Device> {
        self.with_backend_retry(target, |driver| async move { driver.up(options).await })
            .await
    }

    pub async fn down(&self, target: &BackendTarget, name: &str) -> WgctlResult<()> {
        self.with_backend_retry(target, |driver| async move { driver.down(name).await })
            .await
    }

    pub async fn status(&self, target: &BackendTarget, name: &str) -> WgctlResult<bool> {
        self.with_backend_retry(target, |driver| async move { driver.status(name).await })
            .await
    }

    pub async fn stats(&self, target: &BackendTarget, name: &str) -> WgctlResult<Option<InterfaceStats>> {
        self.with_backend_retry(target, |driver| async move { driver.stats(name).await })
            .await
    }

    pub async fn peer_stats(
        &self,
        target: &BackendTarget,
        name: &str,
        peer_public_key: &str,
    ) -> WgctlResult<Option<PeerStats>> {
        self.with_backend_retry(target, |driver| async move {
            driver.peer_stats(name, peer_public_key).await
        })
        .await
    }

    /// Foreign servers on the target, each stamped with the target's id
    pub async fn find_foreign_servers(
        &self,
        target: &BackendTarget,
        known_interfaces: &[String],
    ) -> WgctlResult<Vec<ForeignServer>> {
        let mut servers = self
            .with_backend_retry(target, |driver| async move {
                driver.find_foreign_servers(known_interfaces).await
            })
            .await?;
        for server in &mut servers {
            server.backend_id = Some(target.id.clone());
        }
        Ok(servers)
    }

    pub async fn remove_backend(&self, entity_id: &str) -> WgctlResult<()> {
        self.registry.remove(entity_id).await
    }

    pub async fn backends(&self) -> Vec<BackendInfo> {
        self.registry.list().await
    }

    pub fn supported_types(&self) -> Vec<BackendKind> {
        self.registry.factories().supported_types()
    }

    pub async fn close(&self) -> WgctlResult<()> {
        self.registry.close_all().await
    }
}
