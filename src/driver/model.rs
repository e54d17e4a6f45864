//! Device snapshot model returned by every connector

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use super::options::HookOptions;

/// Link-level view of a WireGuard interface
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Interface {
    pub name: String,
    pub description: String,
    /// Interface addresses in CIDR form; compare with `validation::normalize_cidr`
    pub addresses: Vec<String>,
    pub mtu: u32,
}

/// WireGuard-level view of an interface
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireguardState {
    pub name: String,
    pub public_key: String,
    #[serde(skip_serializing)]
    pub private_key: String,
    pub listen_port: u16,
    pub firewall_mark: u32,
    pub peers: Vec<Peer>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Peer {
    pub name: Option<String>,
    pub description: Option<String>,
    pub public_key: String,
    pub endpoint: Option<String>,
    pub allowed_ips: Vec<String>,
    #[serde(skip_serializing)]
    pub preshared_key: Option<String>,
    pub persistent_keepalive: Duration,
    pub stats: PeerStats,
}

/// Observed per-peer counters, never part of a desired configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerStats {
    pub endpoint: Option<String>,
    pub last_handshake_time: Option<DateTime<Utc>>,
    pub receive_bytes: u64,
    pub transmit_bytes: u64,
    pub protocol_version: u32,
}

/// Interface statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterfaceStats {
    pub rx_packets: u64,
    pub tx_packets: u64,
    pub rx_bytes: u64,
    pub tx_bytes: u64,
    pub rx_errors: u64,
    pub tx_errors: u64,
    pub rx_dropped: u64,
    pub tx_dropped: u64,
    pub multicast: u64,
    pub collisions: u64,
}

/// Interface plus WireGuard state; the unit returned by `device()` and `up()`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    pub interface: Interface,
    pub wireguard: WireguardState,
}

impl Device {
    pub fn named(name: &str) -> Self {
        Device {
            interface: Interface {
                name: name.to_string(),
                ..Default::default()
            },
            wireguard: WireguardState {
                name: name.to_string(),
                ..Default::default()
            },
        }
    }

    pub fn peer(&self, public_key: &str) -> Option<&Peer> {
        self.wireguard
            .peers
            .iter()
            .find(|p| p.public_key == public_key)
    }

    /// Per-peer statistics, with the observed endpoint folded in
    pub fn peer_stats(&self, public_key: &str) -> Option<PeerStats> {
        self.peer(public_key).map(|peer| {
            let mut stats = peer.stats.clone();
            if stats.endpoint.is_none() {
                stats.endpoint = peer.endpoint.clone();
            }
            stats
        })
    }
}

/// Coarse link state reported for foreign interfaces
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkState {
    Up,
    #[default]
    Down,
}

impl LinkState {
    pub fn from_up(up: bool) -> Self {
        if up {
            LinkState::Up
        } else {
            LinkState::Down
        }
    }
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkState::Up => write!(f, "up"),
            LinkState::Down => write!(f, "down"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForeignInterface {
    pub name: String,
    pub addresses: Vec<String>,
    pub mtu: u32,
    pub state: LinkState,
}

/// A WireGuard interface found on a control plane that the caller does not manage
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForeignServer {
    /// Registry entity the server was discovered through, stamped by the service
    pub backend_id: Option<String>,
    pub interface: ForeignInterface,
    pub hooks: Vec<HookOptions>,
    pub name: String,
    pub description: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub public_key: String,
    pub listen_port: u16,
    pub firewall_mark: u32,
    pub peers: Vec<Peer>,
}

impl ForeignServer {
    /// Build a foreign server from a device snapshot
    pub fn from_device(device: Device, state: LinkState, kind: &str) -> Self {
        ForeignServer {
            backend_id: None,
            interface: ForeignInterface {
                name: device.interface.name.clone(),
                addresses: device.interface.addresses,
                mtu: device.interface.mtu,
                state,
            },
            hooks: Vec::new(),
            name: device.wireguard.name,
            description: device.interface.description,
            kind: kind.to_string(),
            public_key: device.wireguard.public_key,
            listen_port: device.wireguard.listen_port,
            firewall_mark: device.wireguard.firewall_mark,
            peers: device.wireguard.peers,
        }
    }
}
