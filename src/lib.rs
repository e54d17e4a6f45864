//! wgctl - WireGuard Lifecycle Library
//!
//! Converges WireGuard interfaces to a desired configuration on one of
//! several control planes:
//! - Linux kernel over netlink
//! - NetworkManager over D-Bus
//! - RouterOS over its REST API
//! - `wg` / `wg-quick` tooling
//! - `wireguard-go` over its UAPI socket
//!
//! Interfaces the caller does not manage can be discovered for import as
//! foreign servers.

pub mod error;
pub mod validation;
pub mod driver;
pub mod codec;
pub mod reconcile;
pub mod connector;
pub mod registry;
pub mod service;
pub mod poller;
pub mod config;

// Re-export commonly used types
pub use error::{WgctlError, WgctlResult};
pub use driver::{
    BackendKind, BackendUrl, ConfigureOptions, Device, Driver, ForeignServer, HookOptions,
    Interface, InterfaceOptions, InterfaceStats, Peer, PeerOptions, PeerStats, WireguardOptions,
    WireguardState,
};
pub use connector::Factories;
pub use registry::{BackendInfo, Registry};
pub use service::{BackendTarget, WireguardService};
pub use poller::{StatsEvent, StatsPoller, StatsSubscription, StatsTarget};
pub use config::WgctlConfig;
