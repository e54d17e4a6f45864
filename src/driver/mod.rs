//! Driver contract shared by every WireGuard control plane

pub mod keys;
pub mod model;
pub mod options;
pub mod url;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{WgctlError, WgctlResult};

pub use model::{
    Device, ForeignInterface, ForeignServer, Interface, InterfaceStats, LinkState, Peer,
    PeerStats, WireguardState,
};
pub use options::{ConfigureOptions, HookOptions, InterfaceOptions, PeerOptions, WireguardOptions};
pub use url::BackendUrl;

/// Control planes a connector can drive; the URL scheme names one
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Kernel WireGuard over netlink
    Linux,
    #[serde(rename = "networkmanager")]
    NetworkManager,
    #[serde(rename = "routeros")]
    RouterOs,
    /// `wg` and `wg-quick` tooling
    Exec,
    /// `wireguard-go` over its UAPI socket
    Darwin,
}

impl BackendKind {
    pub const ALL: [BackendKind; 5] = [
        BackendKind::Linux,
        BackendKind::NetworkManager,
        BackendKind::RouterOs,
        BackendKind::Exec,
        BackendKind::Darwin,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Linux => "linux",
            BackendKind::NetworkManager => "networkmanager",
            BackendKind::RouterOs => "routeros",
            BackendKind::Exec => "exec",
            BackendKind::Darwin => "darwin",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = WgctlError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase();
        BackendKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == wanted)
            .ok_or_else(|| WgctlError::UnknownBackend(s.trim().to_string()))
    }
}

/// Common interface every connector implements
///
/// A connector owns one transport handle (netlink socket, D-Bus connection,
/// HTTP client, resolved tool paths) and converges WireGuard interfaces on
/// the control plane behind it.
#[async_trait]
pub trait Driver: Send + Sync {
    /// Backend type this connector was created for
    fn kind(&self) -> BackendKind;

    /// Read the current snapshot of an interface
    ///
    /// Falls back to a previously written configuration file when the
    /// interface is down; `NotFound` only when neither exists.
    async fn device(&self, name: &str) -> WgctlResult<Device>;

    /// Create the interface or converge it in place to `options`
    async fn up(&self, options: &ConfigureOptions) -> WgctlResult<Device>;

    /// Tear the interface down; a missing interface is success
    async fn down(&self, name: &str) -> WgctlResult<()>;

    /// Whether the interface is currently active
    async fn status(&self, name: &str) -> WgctlResult<bool>;

    /// Interface counters, `None` when the interface does not exist
    async fn stats(&self, name: &str) -> WgctlResult<Option<InterfaceStats>>;

    /// Counters for one peer, `None` when the interface or peer does not exist
    async fn peer_stats(&self, name: &str, peer_public_key: &str) -> WgctlResult<Option<PeerStats>>;

    /// WireGuard interfaces on this control plane whose names are not in `known_interfaces`
    async fn find_foreign_servers(&self, known_interfaces: &[String]) -> WgctlResult<Vec<ForeignServer>>;

    /// Release transport resources; calling it twice is harmless
    async fn close(&self) -> WgctlResult<()>;
}
