//! Convergence planning shared by the connectors
//!
//! Each submodule compares a live view with the desired configuration and
//! returns only the changes that are actually needed, so a converged
//! interface costs zero writes.

pub mod address;
pub mod patch;
pub mod peers;
pub mod routes;

pub use address::{plan_addresses, plan_mtu, AddressEntry, AddressPlan};
pub use peers::{diff_peers, PeerChange, PeerPlan, PeerUpdate};
pub use routes::{desired_routes, diff_routes, RouteEntry, RoutePlan};

use crate::driver::{ConfigureOptions, Device};

/// One device-level configuration write
///
/// Fields left as `None` are not touched on the device.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceUpdate {
    pub private_key: Option<String>,
    pub listen_port: Option<u16>,
    pub firewall_mark: Option<u32>,
    pub replace_peers: bool,
    pub peers: Vec<PeerUpdate>,
}

impl DeviceUpdate {
    pub fn is_empty(&self) -> bool {
        self.private_key.is_none()
            && self.listen_port.is_none()
            && self.firewall_mark.is_none()
            && !self.replace_peers
            && self.peers.is_empty()
    }
}

/// Everything that has to change on `current` to match `desired`
///
/// An empty desired private key leaves the current one alone.
pub fn plan_device(current: &Device, desired: &ConfigureOptions) -> DeviceUpdate {
    let wg = &desired.wireguard;

    let private_key = (!wg.private_key.is_empty() && wg.private_key != current.wireguard.private_key)
        .then(|| wg.private_key.clone());
    let listen_port = wg
        .listen_port
        .filter(|port| *port != current.wireguard.listen_port);
    let firewall_mark = wg
        .firewall_mark
        .filter(|mark| *mark != current.wireguard.firewall_mark);

    DeviceUpdate {
        private_key,
        listen_port,
        firewall_mark,
        replace_peers: false,
        peers: diff_peers(&current.wireguard.peers, &wg.peers).writes(),
    }
}
