//! Route diffing for transports that manage the routing table themselves
//!
//! Routes installed for peers carry scope link, protocol boot and type
//! unicast. Only routes bearing the boot protocol are treated as ours;
//! kernel, DHCP or routing-daemon routes on the same interface are left alone.

use std::collections::{BTreeSet, HashMap};

use ipnet::IpNet;

use crate::driver::PeerOptions;
use crate::error::WgctlResult;
use crate::validation::normalize_cidr;

/// `RT_SCOPE_LINK`
pub const SCOPE_LINK: u8 = 253;
/// `RTPROT_BOOT`
pub const PROTOCOL_BOOT: u8 = 3;
/// `RTPROT_KERNEL`
pub const PROTOCOL_KERNEL: u8 = 2;
/// `RTN_UNICAST`
pub const TYPE_UNICAST: u8 = 1;

/// A route on the managed interface
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RouteEntry {
    /// Masked CIDR destination
    pub destination: String,
    pub scope: u8,
    pub protocol: u8,
    pub kind: u8,
}

impl RouteEntry {
    /// A route the way this crate installs it
    pub fn owned(destination: impl Into<String>) -> Self {
        RouteEntry {
            destination: destination.into(),
            scope: SCOPE_LINK,
            protocol: PROTOCOL_BOOT,
            kind: TYPE_UNICAST,
        }
    }

    pub fn is_owned(&self) -> bool {
        self.protocol == PROTOCOL_BOOT
    }

    pub fn is_ipv6(&self) -> bool {
        self.destination.contains(':')
    }

    pub fn network(&self) -> Option<IpNet> {
        self.destination.parse().ok()
    }

    fn drifted(&self) -> bool {
        self.scope != SCOPE_LINK || self.protocol != PROTOCOL_BOOT || self.kind != TYPE_UNICAST
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoutePlan {
    pub add: Vec<RouteEntry>,
    /// Desired destinations whose attributes drifted, already carrying the wanted tags
    pub update: Vec<RouteEntry>,
    pub remove: Vec<RouteEntry>,
}

impl RoutePlan {
    pub fn is_empty(&self) -> bool {
        self.add.is_empty() && self.update.is_empty() && self.remove.is_empty()
    }
}

/// Union of every peer's allowed IPs, masked and sorted
pub fn desired_routes(peers: &[PeerOptions]) -> WgctlResult<BTreeSet<String>> {
    let mut routes = BTreeSet::new();
    for peer in peers {
        for allowed_ip in &peer.allowed_ips {
            routes.insert(normalize_cidr(allowed_ip)?);
        }
    }
    Ok(routes)
}

/// Plan route changes on one interface
///
/// `preserve` holds destinations that must never be touched, usually the
/// interface's own subnet.
pub fn diff_routes(
    existing: &[RouteEntry],
    desired: &BTreeSet<String>,
    preserve: &[String],
) -> RoutePlan {
    let preserved = |destination: &str| preserve.iter().any(|p| p == destination);

    let by_destination: HashMap<&str, &RouteEntry> = existing
        .iter()
        .map(|route| (route.destination.as_str(), route))
        .collect();

    let mut plan = RoutePlan::default();

    for destination in desired {
        match by_destination.get(destination.as_str()) {
            None => plan.add.push(RouteEntry::owned(destination.clone())),
            Some(route) if route.drifted() && !preserved(destination) => {
                plan.update.push(RouteEntry::owned(destination.clone()))
            }
            Some(_) => {}
        }
    }

    for route in existing {
        if route.is_owned()
            && !desired.contains(&route.destination)
            && !preserved(&route.destination)
        {
            plan.remove.push(route.clone());
        }
    }

    plan
}
