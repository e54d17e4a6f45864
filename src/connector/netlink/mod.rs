//! Kernel WireGuard connector
//!
//! Links, addresses and routes are handled over rtnetlink; keys and peers
//! over the `wireguard` generic netlink family (see `genl`). Routes for peer
//! allowed IPs are installed with scope link, protocol boot and type unicast
//! in the main table, which is how they are told apart from routes that
//! belong to someone else.

pub mod genl;

use async_trait::async_trait;
use futures::TryStreamExt;
use netlink_packet_route::address::{AddressAttribute, AddressFlags, AddressMessage, AddressScope};
use netlink_packet_route::link::{InfoKind, LinkAttribute, LinkFlags, LinkInfo, LinkMessage};
use netlink_packet_route::route::{
    RouteAddress, RouteAttribute, RouteHeader, RouteMessage, RouteProtocol, RouteScope, RouteType,
};
use netlink_packet_route::AddressFamily;
use rtnetlink::Handle;
use std::net::IpAddr;
use std::sync::Mutex;
use tokio::sync::OnceCell;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use self::genl::WireguardSocket;
use super::{expect_kind, resolve_endpoint};
use crate::driver::{
    BackendKind, BackendUrl, ConfigureOptions, Device, Driver, ForeignServer, InterfaceStats,
    LinkState, PeerStats,
};
use crate::error::{WgctlError, WgctlResult};
use crate::reconcile::{
    desired_routes, diff_routes, plan_addresses, plan_device, plan_mtu, AddressEntry, RouteEntry,
};
use crate::validation::{normalize_cidr, parse_interface_address, validate_interface_name};

/// What the connector needs to know about one link
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LinkView {
    pub index: u32,
    pub name: String,
    pub mtu: u32,
    pub up: bool,
    pub wireguard: bool,
    pub stats: Option<InterfaceStats>,
}

impl LinkView {
    pub fn from_message(link: &LinkMessage) -> Self {
        let mut view = LinkView {
            index: link.header.index,
            up: link.header.flags.contains(LinkFlags::Up),
            ..Default::default()
        };
        for attr in &link.attributes {
            match attr {
                LinkAttribute::IfName(name) => view.name = name.clone(),
                LinkAttribute::Mtu(mtu) => view.mtu = *mtu,
                LinkAttribute::LinkInfo(infos) => {
                    view.wireguard = infos
                        .iter()
                        .any(|info| matches!(info, LinkInfo::Kind(InfoKind::Wireguard)));
                }
                LinkAttribute::Stats64(stats) => {
                    view.stats = Some(InterfaceStats {
                        rx_packets: stats.rx_packets,
                        tx_packets: stats.tx_packets,
                        rx_bytes: stats.rx_bytes,
                        tx_bytes: stats.tx_bytes,
                        rx_errors: stats.rx_errors,
                        tx_errors: stats.tx_errors,
                        rx_dropped: stats.rx_dropped,
                        tx_dropped: stats.tx_dropped,
                        multicast: stats.multicast,
                        collisions: stats.collisions,
                    });
                }
                _ => {}
            }
        }
        view
    }
}

/// Address entry of an rtnetlink address message, host bits kept
pub fn address_entry(message: &AddressMessage) -> Option<AddressEntry> {
    let mut local = None;
    let mut address = None;
    let mut permanent = false;
    for attr in &message.attributes {
        match attr {
            AddressAttribute::Local(ip) => local = Some(*ip),
            AddressAttribute::Address(ip) => address = Some(*ip),
            AddressAttribute::Flags(flags) => permanent = flags.contains(AddressFlags::Permanent),
            _ => {}
        }
    }
    let ip = local.or(address)?;
    Some(AddressEntry {
        address: format!("{}/{}", ip, message.header.prefix_len),
        dynamic: !permanent,
        link_scope: message.header.scope == AddressScope::Link,
    })
}

/// Route on interface `index` in the main table, `None` for anything else
pub fn route_entry(message: &RouteMessage, index: u32) -> Option<RouteEntry> {
    let mut oif = None;
    let mut table = u32::from(message.header.table);
    let mut destination = None;
    for attr in &message.attributes {
        match attr {
            RouteAttribute::Oif(value) => oif = Some(*value),
            RouteAttribute::Table(value) => table = *value,
            RouteAttribute::Destination(RouteAddress::Inet(ip)) => destination = Some(IpAddr::V4(*ip)),
            RouteAttribute::Destination(RouteAddress::Inet6(ip)) => destination = Some(IpAddr::V6(*ip)),
            _ => {}
        }
    }
    if oif != Some(index) || table != u32::from(RouteHeader::RT_TABLE_MAIN) {
        return None;
    }

    let prefix = message.header.destination_prefix_length;
    let ip = match destination {
        Some(ip) => ip,
        None if message.header.address_family == AddressFamily::Inet6 => IpAddr::from([0u16; 8]),
        None => IpAddr::from([0u8; 4]),
    };
    Some(RouteEntry {
        destination: normalize_cidr(&format!("{}/{}", ip, prefix)).ok()?,
        scope: u8::from(message.header.scope),
        protocol: u8::from(message.header.protocol),
        kind: u8::from(message.header.kind),
    })
}

/// Route message for installing or removing `route` on interface `index`
pub fn route_message(route: &RouteEntry, index: u32) -> WgctlResult<RouteMessage> {
    let network = route
        .network()
        .ok_or_else(|| WgctlError::Validation(format!("invalid route destination: {}", route.destination)))?;

    let mut message = RouteMessage::default();
    message.header.table = RouteHeader::RT_TABLE_MAIN;
    message.header.destination_prefix_length = network.prefix_len();
    message.header.scope = RouteScope::from(route.scope);
    message.header.protocol = RouteProtocol::from(route.protocol);
    message.header.kind = RouteType::from(route.kind);
    let destination = match network.addr() {
        IpAddr::V4(ip) => {
            message.header.address_family = AddressFamily::Inet;
            RouteAddress::Inet(ip)
        }
        IpAddr::V6(ip) => {
            message.header.address_family = AddressFamily::Inet6;
            RouteAddress::Inet6(ip)
        }
    };
    message.attributes.push(RouteAttribute::Destination(destination));
    message.attributes.push(RouteAttribute::Oif(index));
    Ok(message)
}

fn errno(error: &rtnetlink::Error) -> Option<i32> {
    match error {
        rtnetlink::Error::NetlinkError(message) => message.code.map(|code| -code.get()),
        _ => None,
    }
}

fn netlink_error(context: &str, error: rtnetlink::Error) -> WgctlError {
    WgctlError::Netlink(format!("{}: {}", context, error))
}

pub struct NetlinkConnector {
    handle: Handle,
    connection: Mutex<Option<JoinHandle<()>>>,
    wireguard: OnceCell<WireguardSocket>,
}

impl NetlinkConnector {
    /// Open the rtnetlink connection; the genl socket is opened on first use
    /// so creating the first link can load the kernel module
    pub async fn connect(raw_url: &str) -> WgctlResult<Self> {
        let url = BackendUrl::parse(raw_url)?;
        expect_kind(&url, BackendKind::Linux)?;
        if url.has_authority() {
            return Err(WgctlError::Validation(
                "linux backend only manages the local kernel".to_string(),
            ));
        }

        Self::open()
    }

    /// Local kernel connector, shared with connectors that only manage profiles
    pub(crate) fn open() -> WgctlResult<Self> {
        let (connection, handle, _) = rtnetlink::new_connection()?;
        let task = tokio::spawn(connection);
        debug!("Opened rtnetlink connection");

        Ok(Self {
            handle,
            connection: Mutex::new(Some(task)),
            wireguard: OnceCell::new(),
        })
    }

    async fn wireguard(&self) -> WgctlResult<&WireguardSocket> {
        self.wireguard.get_or_try_init(WireguardSocket::open).await
    }

    pub(crate) async fn find_link(&self, name: &str) -> WgctlResult<Option<LinkView>> {
        let mut links = self.handle.link().get().match_name(name.to_string()).execute();
        match links.try_next().await {
            Ok(Some(link)) => Ok(Some(LinkView::from_message(&link))),
            Ok(None) => Ok(None),
            Err(e) if errno(&e) == Some(libc::ENODEV) => Ok(None),
            Err(e) => Err(netlink_error(&format!("get link {}", name), e)),
        }
    }

    async fn all_links(&self) -> WgctlResult<Vec<LinkView>> {
        let mut links = self.handle.link().get().execute();
        let mut views = Vec::new();
        while let Some(link) = links
            .try_next()
            .await
            .map_err(|e| netlink_error("list links", e))?
        {
            views.push(LinkView::from_message(&link));
        }
        Ok(views)
    }

    async fn addresses(&self, index: u32) -> WgctlResult<Vec<(AddressEntry, AddressMessage)>> {
        let mut stream = self
            .handle
            .address()
            .get()
            .set_link_index_filter(index)
            .execute();
        let mut addresses = Vec::new();
        while let Some(message) = stream
            .try_next()
            .await
            .map_err(|e| netlink_error("list addresses", e))?
        {
            if message.header.index != index {
                continue;
            }
            if let Some(entry) = address_entry(&message) {
                addresses.push((entry, message));
            }
        }
        Ok(addresses)
    }

    async fn routes(&self, index: u32) -> WgctlResult<Vec<RouteEntry>> {
        let mut routes = Vec::new();
        for family in [AddressFamily::Inet, AddressFamily::Inet6] {
            let mut filter = RouteMessage::default();
            filter.header.address_family = family;
            let mut stream = self.handle.route().get(filter).execute();
            while let Some(message) = stream
                .try_next()
                .await
                .map_err(|e| netlink_error("list routes", e))?
            {
                routes.extend(route_entry(&message, index));
            }
        }
        Ok(routes)
    }

    async fn create_link(&self, name: &str) -> WgctlResult<LinkView> {
        info!("Creating wireguard interface {}", name);
        let mut message = LinkMessage::default();
        message.attributes.push(LinkAttribute::IfName(name.to_string()));
        message
            .attributes
            .push(LinkAttribute::LinkInfo(vec![LinkInfo::Kind(InfoKind::Wireguard)]));

        match self.handle.link().add(message).execute().await {
            Ok(()) => {}
            Err(e) if errno(&e) == Some(libc::EEXIST) => {}
            Err(e) => return Err(netlink_error(&format!("add link {}", name), e)),
        }
        self.find_link(name)
            .await?
            .ok_or_else(|| WgctlError::NotFound(format!("interface {} vanished after creation", name)))
    }

    async fn delete_link(&self, link: &LinkView) -> WgctlResult<()> {
        info!("Deleting interface {}", link.name);
        match self.handle.link().del(link.index).execute().await {
            Ok(()) => Ok(()),
            Err(e) if errno(&e) == Some(libc::ENODEV) => Ok(()),
            Err(e) => Err(netlink_error(&format!("delete link {}", link.name), e)),
        }
    }

    async fn configure_link(&self, link: &LinkView, options: &ConfigureOptions) -> WgctlResult<()> {
        let addresses = self.addresses(link.index).await?;
        let entries: Vec<AddressEntry> = addresses.iter().map(|(entry, _)| entry.clone()).collect();
        let plan = plan_addresses(&entries, &options.interface.address)?;

        for remove in &plan.remove {
            if let Some((_, message)) = addresses.iter().find(|(entry, _)| entry.address == *remove) {
                debug!("Removing address {} from {}", remove, link.name);
                self.handle
                    .address()
                    .del(message.clone())
                    .execute()
                    .await
                    .map_err(|e| netlink_error(&format!("delete address {}", remove), e))?;
            }
        }
        if let Some(add) = &plan.add {
            debug!("Adding address {} to {}", add, link.name);
            let network = parse_interface_address(add)?;
            match self
                .handle
                .address()
                .add(link.index, network.addr(), network.prefix_len())
                .execute()
                .await
            {
                Ok(()) => {}
                Err(e) if errno(&e) == Some(libc::EEXIST) => {}
                Err(e) => return Err(netlink_error(&format!("add address {}", add), e)),
            }
        }

        let mtu = plan_mtu(link.mtu, options.interface.mtu);
        if mtu.is_some() || !link.up {
            let mut message = LinkMessage::default();
            message.header.index = link.index;
            message.header.flags = LinkFlags::Up;
            message.header.change_mask = LinkFlags::Up;
            if let Some(mtu) = mtu {
                debug!("Setting MTU of {} to {}", link.name, mtu);
                message.attributes.push(LinkAttribute::Mtu(mtu));
            }
            self.handle
                .link()
                .set(message)
                .execute()
                .await
                .map_err(|e| netlink_error(&format!("set link {}", link.name), e))?;
        }
        Ok(())
    }

    async fn configure_wireguard(&self, name: &str, options: &ConfigureOptions) -> WgctlResult<()> {
        let wireguard = self.wireguard().await?;
        let current = wireguard.get_device(name).await?;
        let mut update = plan_device(&current, options);
        if update.is_empty() {
            debug!("{} already matches the desired peers", name);
            return Ok(());
        }
        for peer in update.peers.iter_mut() {
            if let Some(endpoint) = peer.endpoint.take() {
                peer.endpoint = Some(resolve_endpoint(&endpoint).await?.to_string());
            }
        }
        debug!("Applying {} peer change(s) to {}", update.peers.len(), name);
        wireguard.set_device(name, &update).await
    }

    async fn configure_routes(&self, link: &LinkView, options: &ConfigureOptions) -> WgctlResult<()> {
        let desired = desired_routes(&options.wireguard.peers)?;
        let preserve = vec![normalize_cidr(&options.interface.address)?];
        let plan = diff_routes(&self.routes(link.index).await?, &desired, &preserve);

        for route in plan.add.iter().chain(plan.update.iter()) {
            debug!("Installing route {} via {}", route.destination, link.name);
            self.handle
                .route()
                .add(route_message(route, link.index)?)
                .replace()
                .execute()
                .await
                .map_err(|e| netlink_error(&format!("replace route {}", route.destination), e))?;
        }
        for route in &plan.remove {
            debug!("Removing route {} from {}", route.destination, link.name);
            match self
                .handle
                .route()
                .del(route_message(route, link.index)?)
                .execute()
                .await
            {
                Ok(()) => {}
                Err(e) if errno(&e) == Some(libc::ESRCH) => {}
                Err(e) => return Err(netlink_error(&format!("delete route {}", route.destination), e)),
            }
        }
        Ok(())
    }

    async fn converge(&self, link: &LinkView, options: &ConfigureOptions) -> WgctlResult<()> {
        self.configure_link(link, options).await?;
        self.configure_wireguard(&link.name, options).await?;
        self.configure_routes(link, options).await
    }

    /// Private key the kernel holds for `name`, if the device exists
    async fn current_private_key(&self, name: &str) -> WgctlResult<Option<String>> {
        match self.wireguard().await?.get_device(name).await {
            Ok(device) => Ok(Some(device.wireguard.private_key)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub(crate) async fn read_device(&self, link: &LinkView) -> WgctlResult<Device> {
        let mut device = self.wireguard().await?.get_device(&link.name).await?;
        device.interface.name = link.name.clone();
        device.interface.mtu = link.mtu;
        device.interface.addresses = self
            .addresses(link.index)
            .await?
            .into_iter()
            .filter(|(entry, _)| !entry.link_scope)
            .filter_map(|(entry, _)| normalize_cidr(&entry.address).ok())
            .collect();
        Ok(device)
    }
}

#[async_trait]
impl Driver for NetlinkConnector {
    fn kind(&self) -> BackendKind {
        BackendKind::Linux
    }

    async fn device(&self, name: &str) -> WgctlResult<Device> {
        validate_interface_name(name)?;
        match self.find_link(name).await? {
            Some(link) if link.wireguard => self.read_device(&link).await,
            Some(_) => Err(WgctlError::NotFound(format!("{} is not a wireguard interface", name))),
            None => Err(WgctlError::NotFound(format!("wireguard interface {}", name))),
        }
    }

    async fn up(&self, options: &ConfigureOptions) -> WgctlResult<Device> {
        let options = options.validated()?;
        let name = options.name();

        let existing = self.find_link(name).await?;
        let current_key = match &existing {
            Some(link) if !link.wireguard => {
                return Err(WgctlError::Validation(format!(
                    "interface {} exists and is not a wireguard interface",
                    name
                )))
            }
            Some(link) => self.current_private_key(&link.name).await?,
            None => None,
        };
        let options = options.clone().with_private_key(current_key.as_deref());

        let link = match existing {
            Some(link) => {
                if let Err(e) = self.converge(&link, &options).await {
                    warn!("live reconfiguration of {} failed, recreating interface: {}", name, e);
                    self.delete_link(&link).await?;
                    let fresh = self.create_link(name).await?;
                    self.converge(&fresh, &options).await?;
                }
                link
            }
            None => {
                let link = self.create_link(name).await?;
                self.converge(&link, &options).await?;
                link
            }
        };

        let link = self.find_link(name).await?.unwrap_or(link);
        self.read_device(&link).await
    }

    async fn down(&self, name: &str) -> WgctlResult<()> {
        validate_interface_name(name)?;
        match self.find_link(name).await? {
            Some(link) => self.delete_link(&link).await,
            None => {
                debug!("{} does not exist, nothing to tear down", name);
                Ok(())
            }
        }
    }

    async fn status(&self, name: &str) -> WgctlResult<bool> {
        validate_interface_name(name)?;
        Ok(self
            .find_link(name)
            .await?
            .map(|link| link.wireguard && link.up)
            .unwrap_or(false))
    }

    async fn stats(&self, name: &str) -> WgctlResult<Option<InterfaceStats>> {
        validate_interface_name(name)?;
        Ok(self
            .find_link(name)
            .await?
            .map(|link| link.stats.unwrap_or_default()))
    }

    async fn peer_stats(&self, name: &str, peer_public_key: &str) -> WgctlResult<Option<PeerStats>> {
        validate_interface_name(name)?;
        match self.wireguard().await?.get_device(name).await {
            Ok(device) => Ok(device.peer_stats(peer_public_key)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn find_foreign_servers(&self, known_interfaces: &[String]) -> WgctlResult<Vec<ForeignServer>> {
        let mut servers = Vec::new();
        for link in self.all_links().await? {
            if !link.wireguard || known_interfaces.iter().any(|known| *known == link.name) {
                continue;
            }
            let device = self.read_device(&link).await?;
            servers.push(ForeignServer::from_device(
                device,
                LinkState::from_up(link.up),
                "wireguard",
            ));
        }
        servers.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(servers)
    }

    async fn close(&self) -> WgctlResult<()> {
        let task = match self.connection.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(task) = task {
            debug!("Closing rtnetlink connection");
            task.abort();
        }
        Ok(())
    }
}
