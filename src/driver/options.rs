//! Desired configuration passed to `Driver::up`

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::IpAddr;
use std::time::Duration;

use super::keys;
use super::model::{Device, Peer};
use crate::error::{WgctlError, WgctlResult};
use crate::validation::{
    normalize_cidr, parse_interface_address, sanitize_config_value, validate_endpoint,
    validate_interface_name, validate_key, validate_mtu,
};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigureOptions {
    pub interface: InterfaceOptions,
    pub wireguard: WireguardOptions,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterfaceOptions {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Interface address in CIDR form, host bits included (`10.0.0.1/24`)
    pub address: String,
    #[serde(default)]
    pub dns: Vec<String>,
    #[serde(default)]
    pub mtu: u32,
    #[serde(default)]
    pub hooks: Vec<HookOptions>,
}

/// A shell command run by wg-quick around interface transitions
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HookOptions {
    pub command: String,
    #[serde(default)]
    pub run_on_pre_up: bool,
    #[serde(default)]
    pub run_on_post_up: bool,
    #[serde(default)]
    pub run_on_pre_down: bool,
    #[serde(default)]
    pub run_on_post_down: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireguardOptions {
    /// Base64 private key; empty keeps the interface's current key, or
    /// generates one for a new interface
    #[serde(default)]
    pub private_key: String,
    pub listen_port: Option<u16>,
    pub firewall_mark: Option<u32>,
    #[serde(default)]
    pub peers: Vec<PeerOptions>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerOptions {
    pub public_key: String,
    pub endpoint: Option<String>,
    pub allowed_ips: Vec<String>,
    pub preshared_key: Option<String>,
    /// Keepalive interval in seconds, 0 disables it
    #[serde(default)]
    pub persistent_keepalive: u32,
}

impl HookOptions {
    pub fn validate(&self) -> WgctlResult<()> {
        if self.command.trim().is_empty() {
            return Err(WgctlError::Validation("hook command is required".to_string()));
        }
        sanitize_config_value(&self.command)?;
        if !(self.run_on_pre_up || self.run_on_post_up || self.run_on_pre_down || self.run_on_post_down) {
            return Err(WgctlError::Validation(format!(
                "hook '{}' must run on at least one transition",
                self.command
            )));
        }
        Ok(())
    }
}

impl PeerOptions {
    pub fn validate(&self) -> WgctlResult<()> {
        if self.public_key.trim().is_empty() {
            return Err(WgctlError::Validation("peer public key is required".to_string()));
        }
        validate_key(&self.public_key)?;

        if self.allowed_ips.is_empty() {
            return Err(WgctlError::Validation(format!(
                "peer {} has no allowed IPs",
                self.public_key
            )));
        }
        for allowed_ip in &self.allowed_ips {
            normalize_cidr(allowed_ip).map_err(|_| {
                WgctlError::Validation(format!(
                    "peer {} has invalid allowed IP {}",
                    self.public_key, allowed_ip
                ))
            })?;
        }

        if let Some(endpoint) = self.endpoint.as_deref().filter(|e| !e.is_empty()) {
            validate_endpoint(endpoint)?;
        }
        if let Some(psk) = self.preshared_key.as_deref().filter(|k| !k.is_empty()) {
            validate_key(psk)?;
        }
        if self.persistent_keepalive > u16::MAX as u32 {
            return Err(WgctlError::Validation(format!(
                "peer {} keepalive {} out of range",
                self.public_key, self.persistent_keepalive
            )));
        }
        Ok(())
    }

    /// Normalized allowed-IP set used for comparisons
    pub fn normalized_allowed_ips(&self) -> Vec<String> {
        normalize_allowed_ips(&self.allowed_ips)
    }

    pub fn endpoint(&self) -> Option<&str> {
        self.endpoint.as_deref().filter(|e| !e.is_empty())
    }

    pub fn preshared_key(&self) -> Option<&str> {
        self.preshared_key.as_deref().filter(|k| !k.is_empty())
    }
}

/// Sorted, deduplicated masked CIDRs; entries that fail to parse are kept verbatim
pub fn normalize_allowed_ips(allowed_ips: &[String]) -> Vec<String> {
    let mut normalized: Vec<String> = allowed_ips
        .iter()
        .filter(|ip| !ip.trim().is_empty())
        .map(|ip| normalize_cidr(ip).unwrap_or_else(|_| ip.trim().to_string()))
        .collect();
    normalized.sort();
    normalized.dedup();
    normalized
}

impl From<&Peer> for PeerOptions {
    fn from(peer: &Peer) -> Self {
        PeerOptions {
            public_key: peer.public_key.clone(),
            endpoint: peer.endpoint.clone(),
            allowed_ips: peer.allowed_ips.clone(),
            preshared_key: peer.preshared_key.clone(),
            persistent_keepalive: peer.persistent_keepalive.as_secs() as u32,
        }
    }
}

impl From<&PeerOptions> for Peer {
    fn from(options: &PeerOptions) -> Self {
        Peer {
            public_key: options.public_key.clone(),
            endpoint: options.endpoint().map(str::to_string),
            allowed_ips: options.allowed_ips.clone(),
            preshared_key: options.preshared_key().map(str::to_string),
            persistent_keepalive: Duration::from_secs(options.persistent_keepalive as u64),
            ..Default::default()
        }
    }
}

impl ConfigureOptions {
    /// Reject malformed configuration before any transport call is made
    pub fn validate(&self) -> WgctlResult<()> {
        let iface = &self.interface;
        validate_interface_name(&iface.name)?;
        sanitize_config_value(&iface.description)?;

        if iface.address.trim().is_empty() {
            return Err(WgctlError::Validation("interface address is required".to_string()));
        }
        parse_interface_address(&iface.address)?;
        validate_mtu(iface.mtu)?;

        for dns in &iface.dns {
            dns.trim()
                .parse::<IpAddr>()
                .map_err(|_| WgctlError::Validation(format!("invalid DNS server: {}", dns)))?;
        }
        for hook in &iface.hooks {
            hook.validate()?;
        }

        if !self.wireguard.private_key.is_empty() {
            validate_key(&self.wireguard.private_key)?;
        }

        let mut seen = HashSet::new();
        for peer in &self.wireguard.peers {
            peer.validate()?;
            if !seen.insert(peer.public_key.as_str()) {
                return Err(WgctlError::Validation(format!(
                    "duplicate peer public key {}",
                    peer.public_key
                )));
            }
        }
        Ok(())
    }

    /// Validated copy, private key left as supplied
    pub fn validated(&self) -> WgctlResult<ConfigureOptions> {
        self.validate()?;
        Ok(self.clone())
    }

    /// Fill an empty private key from the live one, generating a key only
    /// when the interface holds none yet.
    pub fn with_private_key(mut self, current: Option<&str>) -> ConfigureOptions {
        if self.wireguard.private_key.is_empty() {
            self.wireguard.private_key = match current.map(str::trim).filter(|k| !k.is_empty()) {
                Some(existing) => existing.to_string(),
                None => keys::generate_private_key(),
            };
        }
        self
    }

    pub fn name(&self) -> &str {
        &self.interface.name
    }

    /// The device this configuration converges to, as far as it can be known up front
    pub fn expected_device(&self) -> WgctlResult<Device> {
        let mut device = Device::named(&self.interface.name);
        device.interface.description = self.interface.description.clone();
        device.interface.addresses = vec![parse_interface_address(&self.interface.address)?.to_string()];
        device.interface.mtu = self.interface.mtu;
        device.wireguard.private_key = self.wireguard.private_key.clone();
        if !self.wireguard.private_key.is_empty() {
            device.wireguard.public_key = keys::public_key_from_private(&self.wireguard.private_key)?;
        }
        device.wireguard.listen_port = self.wireguard.listen_port.unwrap_or_default();
        device.wireguard.firewall_mark = self.wireguard.firewall_mark.unwrap_or_default();
        device.wireguard.peers = self.wireguard.peers.iter().map(Peer::from).collect();
        Ok(device)
    }
}
