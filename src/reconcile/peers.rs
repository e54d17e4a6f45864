//! Peer diffing keyed by public key

use std::collections::HashMap;
use std::net::SocketAddr;

use crate::driver::options::normalize_allowed_ips;
use crate::driver::{Peer, PeerOptions};

/// A single peer entry of a configuration write
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PeerUpdate {
    pub public_key: String,
    pub remove: bool,
    /// Only touch the peer if it already exists
    pub update_only: bool,
    pub replace_allowed_ips: bool,
    /// `Some("")` clears the key
    pub preshared_key: Option<String>,
    pub endpoint: Option<String>,
    pub persistent_keepalive: Option<u16>,
    pub allowed_ips: Vec<String>,
}

/// A peer present on both sides, with the fields that drifted
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerChange {
    pub desired: PeerOptions,
    pub endpoint: bool,
    pub preshared_key: bool,
    pub persistent_keepalive: bool,
    pub replace_allowed_ips: bool,
}

impl PeerChange {
    pub fn is_noop(&self) -> bool {
        !(self.endpoint || self.preshared_key || self.persistent_keepalive || self.replace_allowed_ips)
    }

    fn to_update(&self) -> PeerUpdate {
        let desired = &self.desired;
        PeerUpdate {
            public_key: desired.public_key.clone(),
            update_only: true,
            replace_allowed_ips: self.replace_allowed_ips,
            preshared_key: self
                .preshared_key
                .then(|| desired.preshared_key().unwrap_or_default().to_string()),
            endpoint: desired.endpoint().filter(|_| self.endpoint).map(str::to_string),
            persistent_keepalive: self
                .persistent_keepalive
                .then_some(desired.persistent_keepalive as u16),
            allowed_ips: if self.replace_allowed_ips {
                desired.normalized_allowed_ips()
            } else {
                Vec::new()
            },
            ..Default::default()
        }
    }
}

/// Partition of `current ∪ desired` by public key
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PeerPlan {
    pub add: Vec<PeerOptions>,
    /// Every key present on both sides, including ones that need no write
    pub update: Vec<PeerChange>,
    pub remove: Vec<String>,
}

impl PeerPlan {
    /// Whether applying the plan would change anything
    pub fn is_noop(&self) -> bool {
        self.add.is_empty() && self.remove.is_empty() && self.update.iter().all(PeerChange::is_noop)
    }

    /// Flatten into peer writes: removals first, then updates, then additions
    pub fn writes(&self) -> Vec<PeerUpdate> {
        let mut writes: Vec<PeerUpdate> = self
            .remove
            .iter()
            .map(|key| PeerUpdate {
                public_key: key.clone(),
                remove: true,
                ..Default::default()
            })
            .collect();

        writes.extend(
            self.update
                .iter()
                .filter(|change| !change.is_noop())
                .map(PeerChange::to_update),
        );

        writes.extend(self.add.iter().map(|peer| PeerUpdate {
            public_key: peer.public_key.clone(),
            preshared_key: peer.preshared_key().map(str::to_string),
            endpoint: peer.endpoint().map(str::to_string),
            persistent_keepalive: (peer.persistent_keepalive > 0)
                .then_some(peer.persistent_keepalive as u16),
            allowed_ips: peer.normalized_allowed_ips(),
            ..Default::default()
        }));
        writes
    }
}

/// Classify every peer of `current` and `desired`
pub fn diff_peers(current: &[Peer], desired: &[PeerOptions]) -> PeerPlan {
    let current_by_key: HashMap<&str, &Peer> = current
        .iter()
        .map(|peer| (peer.public_key.as_str(), peer))
        .collect();
    let desired_by_key: HashMap<&str, &PeerOptions> = desired
        .iter()
        .map(|peer| (peer.public_key.as_str(), peer))
        .collect();

    let mut plan = PeerPlan::default();

    for peer in current {
        if !desired_by_key.contains_key(peer.public_key.as_str())
            && !plan.remove.contains(&peer.public_key)
        {
            plan.remove.push(peer.public_key.clone());
        }
    }

    for options in desired {
        match current_by_key.get(options.public_key.as_str()) {
            Some(peer) => plan.update.push(compare(peer, options)),
            None => plan.add.push(options.clone()),
        }
    }

    plan
}

fn compare(current: &Peer, desired: &PeerOptions) -> PeerChange {
    PeerChange {
        desired: desired.clone(),
        endpoint: endpoint_differs(current.endpoint.as_deref(), desired.endpoint()),
        preshared_key: current.preshared_key.as_deref().unwrap_or_default()
            != desired.preshared_key().unwrap_or_default(),
        persistent_keepalive: current.persistent_keepalive.as_secs()
            != desired.persistent_keepalive as u64,
        replace_allowed_ips: normalize_allowed_ips(&current.allowed_ips)
            != desired.normalized_allowed_ips(),
    }
}

/// Endpoints are never cleared; a hostname only counts once the peer has none
fn endpoint_differs(current: Option<&str>, desired: Option<&str>) -> bool {
    let Some(desired) = desired else {
        return false;
    };
    let Some(current) = current.filter(|c| !c.is_empty()) else {
        return true;
    };
    match (desired.parse::<SocketAddr>(), current.parse::<SocketAddr>()) {
        (Ok(d), Ok(c)) => d != c,
        (Ok(_), Err(_)) => desired != current,
        (Err(_), _) => false,
    }
}
