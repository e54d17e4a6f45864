//! iproute2 driven link, address and route handling

use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;

use super::command::{failure_text, CommandRunner};
use super::{LinkDetails, NetworkTool};
use crate::driver::InterfaceStats;
use crate::error::{WgctlError, WgctlResult};
use crate::reconcile::routes::{PROTOCOL_BOOT, PROTOCOL_KERNEL, SCOPE_LINK, TYPE_UNICAST};
use crate::reconcile::{AddressEntry, RouteEntry};
use crate::validation::normalize_cidr;

#[derive(Debug, Deserialize)]
struct IpLink {
    #[serde(default)]
    ifname: String,
    #[serde(default)]
    mtu: u32,
    #[serde(default)]
    operstate: String,
    #[serde(default)]
    flags: Vec<String>,
    #[serde(default)]
    addr_info: Vec<IpAddressInfo>,
    stats64: Option<IpStats64>,
}

#[derive(Debug, Deserialize)]
struct IpAddressInfo {
    #[serde(default)]
    family: String,
    #[serde(default)]
    local: String,
    #[serde(default)]
    prefixlen: u8,
    #[serde(default)]
    scope: String,
    #[serde(default)]
    dynamic: bool,
}

#[derive(Debug, Default, Deserialize)]
struct IpStats64 {
    #[serde(default)]
    rx: IpCounters,
    #[serde(default)]
    tx: IpCounters,
}

#[derive(Debug, Default, Deserialize)]
struct IpCounters {
    #[serde(default)]
    bytes: u64,
    #[serde(default)]
    packets: u64,
    #[serde(default)]
    errors: u64,
    #[serde(default)]
    dropped: u64,
    #[serde(default)]
    multicast: u64,
    #[serde(default)]
    collisions: u64,
}

#[derive(Debug, Deserialize)]
struct IpRoute {
    #[serde(default)]
    dst: String,
    #[serde(default)]
    protocol: Option<String>,
    #[serde(default)]
    scope: Option<String>,
    #[serde(default, rename = "type")]
    kind: Option<String>,
}

fn is_missing_link(error: &WgctlError) -> bool {
    failure_text(error)
        .map(|text| text.contains("does not exist") || text.contains("cannot find device"))
        .unwrap_or(false)
}

fn parse_links(output: &str) -> WgctlResult<Vec<IpLink>> {
    let trimmed = output.trim();
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }
    Ok(serde_json::from_str(trimmed)?)
}

/// `ip -j address show dev <name>`
pub fn parse_link_details(output: &str) -> WgctlResult<Option<LinkDetails>> {
    let Some(link) = parse_links(output)?.into_iter().next() else {
        return Ok(None);
    };

    let addresses = link
        .addr_info
        .iter()
        .filter(|info| info.family == "inet" || info.family == "inet6")
        .filter(|info| !info.local.is_empty() && info.prefixlen > 0)
        .map(|info| AddressEntry {
            address: format!("{}/{}", info.local, info.prefixlen),
            dynamic: info.dynamic,
            link_scope: info.scope == "link",
        })
        .collect();

    let up = link.flags.iter().any(|flag| flag == "UP")
        || link.operstate.eq_ignore_ascii_case("up")
        || link.operstate.eq_ignore_ascii_case("unknown");

    Ok(Some(LinkDetails {
        name: link.ifname,
        addresses,
        mtu: link.mtu,
        up,
    }))
}

/// `ip -s -j link show dev <name>`
pub fn parse_link_stats(output: &str) -> WgctlResult<Option<InterfaceStats>> {
    let Some(link) = parse_links(output)?.into_iter().next() else {
        return Ok(None);
    };
    let stats = link.stats64.unwrap_or_default();
    Ok(Some(InterfaceStats {
        rx_packets: stats.rx.packets,
        tx_packets: stats.tx.packets,
        rx_bytes: stats.rx.bytes,
        tx_bytes: stats.tx.bytes,
        rx_errors: stats.rx.errors,
        tx_errors: stats.tx.errors,
        rx_dropped: stats.rx.dropped,
        tx_dropped: stats.tx.dropped,
        multicast: stats.rx.multicast,
        collisions: stats.tx.collisions,
    }))
}

fn protocol_number(name: Option<&str>) -> u8 {
    match name.map(str::trim) {
        Some("kernel") => PROTOCOL_KERNEL,
        Some("boot") | None => PROTOCOL_BOOT,
        Some("static") => 4,
        Some("ra") => 9,
        Some("dhcp") => 16,
        Some(other) => other.parse().unwrap_or(0),
    }
}

fn scope_number(name: Option<&str>) -> u8 {
    match name.map(str::trim) {
        Some("link") => SCOPE_LINK,
        Some("host") => 254,
        Some("site") => 200,
        Some("global") | Some("universe") | None => 0,
        Some(other) => other.parse().unwrap_or(0),
    }
}

fn type_number(name: Option<&str>) -> u8 {
    match name.map(str::trim) {
        Some("unicast") | None => TYPE_UNICAST,
        Some("local") => 2,
        Some("broadcast") => 3,
        Some("anycast") => 4,
        Some("multicast") => 5,
        Some("blackhole") => 6,
        Some("unreachable") => 7,
        Some("prohibit") => 8,
        Some(other) => other.parse().unwrap_or(0),
    }
}

/// `ip -j -4 route show dev <name>`; `default` maps to the family's zero prefix
pub fn parse_routes(output: &str, ipv6: bool) -> WgctlResult<Vec<RouteEntry>> {
    let trimmed = output.trim();
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }
    let routes: Vec<IpRoute> = serde_json::from_str(trimmed)?;

    Ok(routes
        .into_iter()
        .filter_map(|route| {
            let dst = route.dst.trim();
            let dst = match dst {
                "" => return None,
                "default" if ipv6 => "::/0",
                "default" => "0.0.0.0/0",
                other => other,
            };
            Some(RouteEntry {
                destination: normalize_cidr(dst).ok()?,
                // iproute2 omits `protocol` for boot routes only on old versions
                protocol: protocol_number(route.protocol.as_deref()),
                scope: scope_number(route.scope.as_deref()),
                kind: type_number(route.kind.as_deref()),
            })
        })
        .collect())
}

/// Linux `ip` tool
pub struct IpTool {
    runner: Arc<dyn CommandRunner>,
}

impl IpTool {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }

    async fn ip(&self, args: &[&str]) -> WgctlResult<String> {
        self.runner.run("ip", args).await
    }

    fn family(route: &RouteEntry) -> &'static str {
        if route.is_ipv6() {
            "-6"
        } else {
            "-4"
        }
    }
}

#[async_trait]
impl NetworkTool for IpTool {
    async fn link(&self, name: &str) -> WgctlResult<Option<LinkDetails>> {
        match self.ip(&["-j", "address", "show", "dev", name]).await {
            Ok(output) => parse_link_details(&output),
            Err(e) if is_missing_link(&e) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn stats(&self, name: &str) -> WgctlResult<Option<InterfaceStats>> {
        match self.ip(&["-s", "-j", "link", "show", "dev", name]).await {
            Ok(output) => parse_link_stats(&output),
            Err(e) if is_missing_link(&e) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn routes(&self, name: &str) -> WgctlResult<Vec<RouteEntry>> {
        let mut routes = parse_routes(&self.ip(&["-j", "-4", "route", "show", "dev", name]).await?, false)?;
        routes.extend(parse_routes(
            &self.ip(&["-j", "-6", "route", "show", "dev", name]).await?,
            true,
        )?);
        Ok(routes)
    }

    async fn add_address(&self, name: &str, address: &str) -> WgctlResult<()> {
        self.ip(&["address", "add", address, "dev", name]).await.map(|_| ())
    }

    async fn remove_address(&self, name: &str, address: &str) -> WgctlResult<()> {
        self.ip(&["address", "del", address, "dev", name]).await.map(|_| ())
    }

    async fn set_mtu(&self, name: &str, mtu: u32) -> WgctlResult<()> {
        let mtu = mtu.to_string();
        self.ip(&["link", "set", "dev", name, "mtu", &mtu]).await.map(|_| ())
    }

    async fn replace_route(&self, name: &str, route: &RouteEntry) -> WgctlResult<()> {
        self.ip(&[
            Self::family(route),
            "route",
            "replace",
            &route.destination,
            "dev",
            name,
            "proto",
            "boot",
            "scope",
            "link",
        ])
        .await
        .map(|_| ())
    }

    async fn remove_route(&self, name: &str, route: &RouteEntry) -> WgctlResult<()> {
        self.ip(&[Self::family(route), "route", "del", &route.destination, "dev", name])
            .await
            .map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ADDRESS_JSON: &str = r#"[{"ifindex":7,"ifname":"wg0","flags":["POINTOPOINT","NOARP","UP","LOWER_UP"],"mtu":1420,"qdisc":"noqueue","operstate":"UNKNOWN","addr_info":[{"family":"inet","local":"10.0.0.1","prefixlen":24,"scope":"global","label":"wg0"},{"family":"inet6","local":"fe80::1","prefixlen":64,"scope":"link"},{"family":"inet6","local":"2001:db8::5","prefixlen":64,"scope":"global","dynamic":true}]}]"#;

    #[test]
    fn test_parse_link_details() {
        let details = parse_link_details(ADDRESS_JSON).unwrap().unwrap();
        assert_eq!(details.name, "wg0");
        assert_eq!(details.mtu, 1420);
        assert!(details.up);
        assert_eq!(details.addresses.len(), 3);
        assert_eq!(details.addresses[0].address, "10.0.0.1/24");
        assert!(details.addresses[1].link_scope);
        assert!(details.addresses[2].dynamic);

        assert!(parse_link_details("[]").unwrap().is_none());
    }

    #[test]
    fn test_parse_link_stats() {
        let json = r#"[{"ifname":"wg0","mtu":1420,"stats64":{"rx":{"bytes":100,"packets":2,"errors":0,"dropped":1,"over_errors":0,"multicast":0},"tx":{"bytes":200,"packets":3,"errors":0,"dropped":0,"carrier_errors":0,"collisions":0}}}]"#;
        let stats = parse_link_stats(json).unwrap().unwrap();
        assert_eq!(stats.rx_bytes, 100);
        assert_eq!(stats.tx_packets, 3);
        assert_eq!(stats.rx_dropped, 1);
    }

    #[test]
    fn test_parse_routes() {
        let json = r#"[{"dst":"10.0.0.0/24","protocol":"kernel","scope":"link","prefsrc":"10.0.0.1","flags":[]},{"dst":"10.0.1.0/24","protocol":"boot","scope":"link","flags":[]},{"dst":"default","protocol":"static","flags":[]}]"#;
        let routes = parse_routes(json, false).unwrap();
        assert_eq!(routes.len(), 3);
        assert_eq!(routes[0].protocol, PROTOCOL_KERNEL);
        assert!(!routes[0].is_owned());
        assert_eq!(routes[1], RouteEntry::owned("10.0.1.0/24"));
        assert_eq!(routes[2].destination, "0.0.0.0/0");
        assert_eq!(routes[2].protocol, 4);

        let v6 = parse_routes(r#"[{"dst":"default","protocol":"boot","scope":"link"}]"#, true).unwrap();
        assert_eq!(v6[0].destination, "::/0");
    }
}
