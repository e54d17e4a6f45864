//! Connectors for each WireGuard control plane and the factory table that builds them

pub mod exec;
#[cfg(target_os = "linux")]
pub mod netlink;
#[cfg(all(target_os = "linux", feature = "dbus-nm"))]
pub mod networkmanager;
pub mod routeros;
#[cfg(unix)]
pub mod userspace;

use futures::future::BoxFuture;
use futures::FutureExt;
use std::collections::BTreeMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::debug;

use crate::driver::{BackendKind, Driver};
use crate::error::{WgctlError, WgctlResult};

pub type DriverFuture = BoxFuture<'static, WgctlResult<Arc<dyn Driver>>>;

/// Async constructor taking the raw connection URL
pub type DriverFactory = Arc<dyn Fn(String) -> DriverFuture + Send + Sync>;

#[derive(Clone)]
struct FactoryEntry {
    create: DriverFactory,
    supported: bool,
}

/// Table mapping backend types to connector constructors
///
/// Built once at startup and shared by `Arc`; nothing registers itself.
#[derive(Clone, Default)]
pub struct Factories {
    entries: BTreeMap<BackendKind, FactoryEntry>,
}

impl Factories {
    /// Table without any backend
    pub fn empty() -> Self {
        Self::default()
    }

    /// Every connector this crate ships, flagged by platform support
    pub fn builtin() -> Self {
        let mut factories = Self::empty();

        #[cfg(target_os = "linux")]
        factories.register(BackendKind::Linux, true, |url| async move {
            let driver: Arc<dyn Driver> = Arc::new(netlink::NetlinkConnector::connect(&url).await?);
            Ok(driver)
        });
        #[cfg(not(target_os = "linux"))]
        factories.register(BackendKind::Linux, false, |_| async {
            Err(WgctlError::UnsupportedBackend(BackendKind::Linux.to_string()))
        });

        #[cfg(all(target_os = "linux", feature = "dbus-nm"))]
        factories.register(BackendKind::NetworkManager, true, |url| async move {
            let driver: Arc<dyn Driver> =
                Arc::new(networkmanager::NetworkManagerConnector::connect(&url).await?);
            Ok(driver)
        });
        #[cfg(not(all(target_os = "linux", feature = "dbus-nm")))]
        factories.register(BackendKind::NetworkManager, false, |_| async {
            Err(WgctlError::UnsupportedBackend(BackendKind::NetworkManager.to_string()))
        });

        factories.register(BackendKind::RouterOs, true, |url| async move {
            let driver: Arc<dyn Driver> = Arc::new(routeros::RouterOsConnector::new(&url)?);
            Ok(driver)
        });

        factories.register(
            BackendKind::Exec,
            cfg!(any(target_os = "linux", target_os = "macos")),
            |url| async move {
                let driver: Arc<dyn Driver> = Arc::new(exec::ExecConnector::new(&url)?);
                Ok(driver)
            },
        );

        #[cfg(unix)]
        factories.register(BackendKind::Darwin, cfg!(target_os = "macos"), |url| async move {
            let driver: Arc<dyn Driver> = Arc::new(userspace::UserspaceConnector::new(&url)?);
            Ok(driver)
        });

        factories
    }

    /// Add or replace the constructor for a backend type
    pub fn register<F, Fut>(&mut self, kind: BackendKind, supported: bool, create: F)
    where
        F: Fn(String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = WgctlResult<Arc<dyn Driver>>> + Send + 'static,
    {
        debug!("Registering backend factory: {} (supported: {})", kind, supported);
        let create: DriverFactory = Arc::new(move |url| create(url).boxed());
        self.entries.insert(kind, FactoryEntry { create, supported });
    }

    /// Backend types that can be created on this platform
    pub fn supported_types(&self) -> Vec<BackendKind> {
        self.entries
            .iter()
            .filter(|(_, entry)| entry.supported)
            .map(|(kind, _)| *kind)
            .collect()
    }

    pub fn is_supported(&self, backend_type: &str) -> bool {
        backend_type
            .parse::<BackendKind>()
            .ok()
            .and_then(|kind| self.entries.get(&kind))
            .map(|entry| entry.supported)
            .unwrap_or(false)
    }

    /// Build a connector for `backend_type` from `url`
    pub async fn create(&self, backend_type: &str, url: &str) -> WgctlResult<Arc<dyn Driver>> {
        let kind: BackendKind = backend_type.parse()?;
        let entry = self
            .entries
            .get(&kind)
            .ok_or_else(|| WgctlError::UnknownBackend(backend_type.trim().to_string()))?;
        if !entry.supported {
            return Err(WgctlError::UnsupportedBackend(kind.to_string()));
        }
        (entry.create)(url.to_string()).await
    }
}

/// Resolve a `host:port` endpoint to a socket address
///
/// Literal addresses never hit the resolver. IPv4 results are preferred.
pub async fn resolve_endpoint(endpoint: &str) -> WgctlResult<SocketAddr> {
    if let Ok(addr) = endpoint.parse::<SocketAddr>() {
        return Ok(addr);
    }
    let candidates: Vec<SocketAddr> = tokio::net::lookup_host(endpoint)
        .await
        .map_err(|e| WgctlError::Validation(format!("cannot resolve endpoint {}: {}", endpoint, e)))?
        .collect();
    candidates
        .iter()
        .find(|addr| addr.is_ipv4())
        .or_else(|| candidates.first())
        .copied()
        .ok_or_else(|| WgctlError::Validation(format!("endpoint {} resolved to no address", endpoint)))
}

/// Reject a URL whose scheme does not match the connector being built
pub(crate) fn expect_kind(url: &crate::driver::BackendUrl, kind: BackendKind) -> WgctlResult<()> {
    if url.kind != kind.as_str() {
        return Err(WgctlError::Validation(format!(
            "invalid backend type {} for {} connector",
            url.kind, kind
        )));
    }
    Ok(())
}
