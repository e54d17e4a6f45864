//! macOS link, address and route handling through `ifconfig`, `netstat` and `route`
//!
//! wg-quick on macOS runs the interface as `utunN` and records the mapping in
//! `/var/run/wireguard/<name>.name`; every operation resolves through it.

use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;

use super::command::{failure_text, CommandRunner};
use super::{LinkDetails, NetworkTool};
use crate::driver::InterfaceStats;
use crate::error::{WgctlError, WgctlResult};
use crate::reconcile::routes::{PROTOCOL_BOOT, PROTOCOL_KERNEL, SCOPE_LINK, TYPE_UNICAST};
use crate::reconcile::{AddressEntry, RouteEntry};
use crate::validation::normalize_cidr;

pub const RUN_DIR: &str = "/var/run/wireguard";

fn is_missing_interface(error: &WgctlError) -> bool {
    failure_text(error)
        .map(|text| text.contains("does not exist") || text.contains("no such interface"))
        .unwrap_or(false)
}

/// Prefix length of an `ifconfig` netmask, hex (`0xffffff00`) or dotted
pub fn mask_prefix(mask: &str) -> Option<u8> {
    let bits = if let Some(hex) = mask.strip_prefix("0x").or_else(|| mask.strip_prefix("0X")) {
        u32::from_str_radix(hex, 16).ok()?
    } else {
        u32::from(mask.parse::<std::net::Ipv4Addr>().ok()?)
    };
    Some(bits.count_ones() as u8)
}

/// `ifconfig <utun>` output
pub fn parse_ifconfig(output: &str) -> LinkDetails {
    let mut details = LinkDetails {
        up: true,
        ..Default::default()
    };

    for (index, raw) in output.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() {
            continue;
        }
        let fields: Vec<&str> = line.split_whitespace().collect();

        if index == 0 {
            if let Some(name) = fields.first() {
                details.name = name.trim_end_matches(':').to_string();
            }
            if let Some(flags) = line.split_once('<').and_then(|(_, rest)| rest.split_once('>')) {
                details.up = flags.0.split(',').any(|flag| flag == "UP");
            }
        }

        if let Some(status) = line.strip_prefix("status:") {
            details.up = status.trim() == "active";
            continue;
        }

        if let Some(mtu) = fields
            .windows(2)
            .find(|pair| pair[0] == "mtu")
            .and_then(|pair| pair[1].parse().ok())
        {
            details.mtu = mtu;
        }

        match fields.first() {
            Some(&"inet") if fields.len() > 1 => {
                let prefix = fields
                    .windows(2)
                    .find(|pair| pair[0] == "netmask")
                    .and_then(|pair| mask_prefix(pair[1]))
                    .unwrap_or(32);
                details.addresses.push(AddressEntry::new(format!("{}/{}", fields[1], prefix)));
            }
            Some(&"inet6") if fields.len() > 1 => {
                let address = fields[1].split('%').next().unwrap_or(fields[1]);
                let prefix = fields
                    .windows(2)
                    .find(|pair| pair[0] == "prefixlen")
                    .and_then(|pair| pair[1].parse::<u8>().ok())
                    .unwrap_or(128);
                details.addresses.push(AddressEntry {
                    address: format!("{}/{}", address, prefix),
                    dynamic: fields.contains(&"autoconf"),
                    link_scope: address.to_ascii_lowercase().starts_with("fe80:"),
                });
            }
            _ => {}
        }
    }

    details
}

/// netstat abbreviates IPv4 networks: `10.0.1/24` is `10.0.1.0/24`
pub fn expand_ipv4(destination: &str) -> String {
    let (address, prefix) = match destination.split_once('/') {
        Some((address, prefix)) => (address, Some(prefix)),
        None => (destination, None),
    };
    let mut octets: Vec<&str> = address.split('.').collect();
    while octets.len() < 4 {
        octets.push("0");
    }
    let address = octets.join(".");
    match prefix {
        Some(prefix) => format!("{}/{}", address, prefix),
        None => address,
    }
}

fn header_index(fields: &[&str], name: &str) -> Option<usize> {
    fields.iter().position(|field| *field == name)
}

/// `netstat -bI <utun>` output; the first row for the interface wins
pub fn parse_netstat_stats(name: &str, output: &str) -> InterfaceStats {
    let mut lines = output.lines().map(str::trim).filter(|line| !line.is_empty());
    let Some(header) = lines.by_ref().find(|line| line.starts_with("Name")) else {
        return InterfaceStats::default();
    };
    let header: Vec<&str> = header.split_whitespace().collect();

    for line in lines {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.first() != Some(&name) {
            continue;
        }
        // Rows without an address column are shifted left by one
        let shift = header.len().saturating_sub(fields.len());
        let counter = |column: &str| -> u64 {
            header_index(&header, column)
                .and_then(|idx| idx.checked_sub(shift))
                .and_then(|idx| fields.get(idx))
                .and_then(|value| value.parse().ok())
                .unwrap_or(0)
        };
        return InterfaceStats {
            rx_packets: counter("Ipkts"),
            tx_packets: counter("Opkts"),
            rx_errors: counter("Ierrs"),
            tx_errors: counter("Oerrs"),
            rx_bytes: counter("Ibytes"),
            tx_bytes: counter("Obytes"),
            rx_dropped: counter("Drop"),
            collisions: counter("Coll"),
            ..Default::default()
        };
    }

    InterfaceStats::default()
}

/// `netstat -rn -f inet|inet6` rows bound to `netif`
///
/// Static routes (`S` flag) count as installed by wg-quick; the rest were
/// created by the kernel for the interface itself.
pub fn parse_netstat_routes(netif: &str, output: &str, ipv6: bool) -> Vec<RouteEntry> {
    let mut columns: Option<(usize, usize, Option<usize>)> = None;
    let mut routes = Vec::new();

    for line in output.lines().map(str::trim).filter(|line| !line.is_empty()) {
        let fields: Vec<&str> = line.split_whitespace().collect();
        let Some((destination, interface, flags)) = columns else {
            if let (Some(d), Some(n)) = (header_index(&fields, "Destination"), header_index(&fields, "Netif")) {
                columns = Some((d, n, header_index(&fields, "Flags")));
            }
            continue;
        };
        if line.starts_with("Internet") || fields.get(interface) != Some(&netif) {
            continue;
        }
        let Some(raw) = fields.get(destination) else {
            continue;
        };
        let raw = match *raw {
            "default" if ipv6 => "::/0".to_string(),
            "default" => "0.0.0.0/0".to_string(),
            other if ipv6 => other.to_string(),
            other => expand_ipv4(other),
        };
        let Ok(destination) = normalize_cidr(&raw) else {
            continue;
        };
        let is_static = flags
            .and_then(|idx| fields.get(idx))
            .map(|flags| flags.contains('S'))
            .unwrap_or(false);

        routes.push(RouteEntry {
            destination,
            scope: SCOPE_LINK,
            protocol: if is_static { PROTOCOL_BOOT } else { PROTOCOL_KERNEL },
            kind: TYPE_UNICAST,
        });
    }

    routes
}

/// macOS network tool
pub struct DarwinTool {
    runner: Arc<dyn CommandRunner>,
    run_dir: PathBuf,
}

impl DarwinTool {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self::with_run_dir(runner, RUN_DIR)
    }

    pub fn with_run_dir(runner: Arc<dyn CommandRunner>, run_dir: impl Into<PathBuf>) -> Self {
        Self {
            runner,
            run_dir: run_dir.into(),
        }
    }

    /// `utunN` behind `name`, or `name` itself when no mapping is recorded
    pub async fn resolve(&self, name: &str) -> String {
        let path = self.run_dir.join(format!("{}.name", name));
        match tokio::fs::read_to_string(&path).await {
            Ok(content) if !content.trim().is_empty() => content.trim().to_string(),
            _ => name.to_string(),
        }
    }

    fn family(route: &RouteEntry) -> &'static str {
        if route.is_ipv6() {
            "-inet6"
        } else {
            "-inet"
        }
    }

    async fn route(&self, action: &str, name: &str, route: &RouteEntry) -> WgctlResult<String> {
        let netif = self.resolve(name).await;
        self.runner
            .run(
                "route",
                &["-n", "-q", action, Self::family(route), "-net", &route.destination, "-interface", &netif],
            )
            .await
    }
}

#[async_trait]
impl NetworkTool for DarwinTool {
    async fn link(&self, name: &str) -> WgctlResult<Option<LinkDetails>> {
        let netif = self.resolve(name).await;
        match self.runner.run("ifconfig", &[netif.as_str()]).await {
            Ok(output) => Ok(Some(parse_ifconfig(&output))),
            Err(e) if is_missing_interface(&e) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn stats(&self, name: &str) -> WgctlResult<Option<InterfaceStats>> {
        let netif = self.resolve(name).await;
        match self.runner.run("netstat", &["-bI", &netif]).await {
            Ok(output) => Ok(Some(parse_netstat_stats(&netif, &output))),
            Err(e) if is_missing_interface(&e) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn routes(&self, name: &str) -> WgctlResult<Vec<RouteEntry>> {
        let netif = self.resolve(name).await;
        let mut routes = parse_netstat_routes(&netif, &self.runner.run("netstat", &["-rn", "-f", "inet"]).await?, false);
        routes.extend(parse_netstat_routes(
            &netif,
            &self.runner.run("netstat", &["-rn", "-f", "inet6"]).await?,
            true,
        ));
        Ok(routes)
    }

    async fn add_address(&self, name: &str, address: &str) -> WgctlResult<()> {
        let netif = self.resolve(name).await;
        let host = address.split('/').next().unwrap_or(address);
        if address.contains(':') {
            self.runner.run("ifconfig", &[&netif, "inet6", address, "alias"]).await?;
        } else {
            self.runner
                .run("ifconfig", &[&netif, "inet", address, host, "alias"])
                .await?;
        }
        Ok(())
    }

    async fn remove_address(&self, name: &str, address: &str) -> WgctlResult<()> {
        let netif = self.resolve(name).await;
        let host = address.split('/').next().unwrap_or(address);
        let family = if address.contains(':') { "inet6" } else { "inet" };
        self.runner
            .run("ifconfig", &[&netif, family, host, "-alias"])
            .await
            .map(|_| ())
    }

    async fn set_mtu(&self, name: &str, mtu: u32) -> WgctlResult<()> {
        let netif = self.resolve(name).await;
        let mtu = mtu.to_string();
        self.runner.run("ifconfig", &[&netif, "mtu", &mtu]).await.map(|_| ())
    }

    async fn replace_route(&self, name: &str, route: &RouteEntry) -> WgctlResult<()> {
        match self.route("add", name, route).await {
            Ok(_) => Ok(()),
            Err(e) if failure_text(&e).map(|t| t.contains("exists")).unwrap_or(false) => {
                self.route("change", name, route).await.map(|_| ())
            }
            Err(e) => Err(e),
        }
    }

    async fn remove_route(&self, name: &str, route: &RouteEntry) -> WgctlResult<()> {
        match self.route("delete", name, route).await {
            Ok(_) => Ok(()),
            Err(e)
                if failure_text(&e)
                    .map(|t| t.contains("not in table") || t.contains("no such process"))
                    .unwrap_or(false) =>
            {
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn logical_name(&self, reported: &str) -> WgctlResult<String> {
        let mut entries = match tokio::fs::read_dir(&self.run_dir).await {
            Ok(entries) => entries,
            Err(_) => return Ok(reported.to_string()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().map(|ext| ext != "name").unwrap_or(true) {
                continue;
            }
            let Ok(content) = tokio::fs::read_to_string(&path).await else {
                continue;
            };
            if content.trim() == reported {
                if let Some(stem) = path.file_stem().and_then(|stem| stem.to_str()) {
                    return Ok(stem.to_string());
                }
            }
        }
        Ok(reported.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::ScriptedRunner;
    use super::*;
    use tempfile::TempDir;

    const IFCONFIG: &str = "utun3: flags=8051<UP,POINTOPOINT,RUNNING,MULTICAST> mtu 1420
\toptions=6463<RXCSUM,TXCSUM,TSO4,TSO6,CHANNEL_IO,PARTIAL_CSUM,ZEROINVERT_CSUM>
\tinet 10.0.0.1 --> 10.0.0.1 netmask 0xffffff00
\tinet6 fe80::1%utun3 prefixlen 64 scopeid 0x10
\tinet6 fd00::1 prefixlen 64
";

    #[test]
    fn test_mask_prefix() {
        assert_eq!(mask_prefix("0xffffff00"), Some(24));
        assert_eq!(mask_prefix("255.255.0.0"), Some(16));
        assert_eq!(mask_prefix("bogus"), None);
    }

    #[test]
    fn test_parse_ifconfig() {
        let details = parse_ifconfig(IFCONFIG);
        assert_eq!(details.name, "utun3");
        assert_eq!(details.mtu, 1420);
        assert!(details.up);
        assert_eq!(details.addresses[0].address, "10.0.0.1/24");
        assert!(details.addresses[1].link_scope);
        assert_eq!(details.reported_addresses(), vec!["10.0.0.1/24", "fd00::1/64"]);

        let inactive = parse_ifconfig("utun4: flags=8051<UP,RUNNING> mtu 1380\n\tstatus: inactive\n");
        assert!(!inactive.up);
    }

    #[test]
    fn test_parse_netstat_stats() {
        let output = "Name       Mtu   Network       Address            Ipkts Ierrs     Ibytes    Opkts Oerrs     Obytes  Coll
utun3      1420  <Link#16>                          120     0      14400      130     0      16800     0
utun3      1420  10.0.0/24     10.0.0.1             120     -      14400      130     -      16800     -
";
        let stats = parse_netstat_stats("utun3", output);
        assert_eq!(stats.rx_packets, 120);
        assert_eq!(stats.tx_bytes, 16800);
        assert_eq!(stats.rx_errors, 0);
        assert_eq!(parse_netstat_stats("utun9", output), InterfaceStats::default());
    }

    #[test]
    fn test_parse_netstat_routes() {
        let output = "Routing tables

Internet:
Destination        Gateway            Flags               Netif Expire
default            192.168.1.1        UGScg                 en0
10.0.0.1           10.0.0.1           UH                  utun3
10.0.1/24          utun3              USc                 utun3
";
        let routes = parse_netstat_routes("utun3", output, false);
        assert_eq!(routes.len(), 2);
        assert_eq!(routes[0].destination, "10.0.0.1/32");
        assert!(!routes[0].is_owned());
        assert!(routes[1].is_owned());
        assert_eq!(routes[1].destination, "10.0.1.0/24");
        assert_eq!(expand_ipv4("10/8"), "10.0.0.0/8");
    }

    #[tokio::test]
    async fn test_name_file_resolution() {
        let run_dir = TempDir::new().unwrap();
        std::fs::write(run_dir.path().join("wg0.name"), "utun3\n").unwrap();
        let runner = Arc::new(ScriptedRunner::new());
        runner.ok("ifconfig utun3", IFCONFIG);
        let tool = DarwinTool::with_run_dir(runner.clone(), run_dir.path());

        assert_eq!(tool.resolve("wg0").await, "utun3");
        assert_eq!(tool.resolve("wg1").await, "wg1");
        assert_eq!(tool.logical_name("utun3").await.unwrap(), "wg0");
        assert_eq!(tool.logical_name("utun8").await.unwrap(), "utun8");

        let link = tool.link("wg0").await.unwrap().unwrap();
        assert_eq!(link.mtu, 1420);

        tool.replace_route("wg0", &RouteEntry::owned("10.0.2.0/24")).await.unwrap();
        assert!(runner.called("route -n -q add -inet -net 10.0.2.0/24 -interface utun3"));
    }
}
