//! NetworkManager WireGuard connector
//!
//! Interfaces are owned by NetworkManager connection profiles of type
//! `wireguard`, written over the system bus. NetworkManager itself creates
//! the kernel link on activation, so live state (keys, peers, counters) is
//! read back through the kernel connector.

use async_trait::async_trait;
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;
use zbus::zvariant::{ObjectPath, OwnedObjectPath, OwnedValue, Value};
use zbus::Connection;

use super::expect_kind;
use super::netlink::NetlinkConnector;
use crate::driver::keys::public_key_from_private;
use crate::driver::{
    BackendKind, BackendUrl, ConfigureOptions, Device, Driver, ForeignServer, InterfaceStats,
    LinkState, Peer, PeerStats,
};
use crate::error::{WgctlError, WgctlResult};
use crate::reconcile::{plan_addresses, plan_device, plan_mtu, AddressEntry};
use crate::validation::{parse_interface_address, validate_interface_name};

const NM_SERVICE: &str = "org.freedesktop.NetworkManager";
const NM_PATH: &str = "/org/freedesktop/NetworkManager";
const NM_IFACE: &str = "org.freedesktop.NetworkManager";
const SETTINGS_PATH: &str = "/org/freedesktop/NetworkManager/Settings";
const SETTINGS_IFACE: &str = "org.freedesktop.NetworkManager.Settings";
const CONNECTION_IFACE: &str = "org.freedesktop.NetworkManager.Settings.Connection";
const DEVICE_IFACE: &str = "org.freedesktop.NetworkManager.Device";
const ACTIVE_IFACE: &str = "org.freedesktop.NetworkManager.Connection.Active";
const PROPERTIES_IFACE: &str = "org.freedesktop.DBus.Properties";

/// `NM_DEVICE_TYPE_WIREGUARD`
pub const DEVICE_TYPE_WIREGUARD: u32 = 29;
/// `NM_DEVICE_STATE_ACTIVATED`
pub const STATE_ACTIVATED: u32 = 100;

const ACTIVATION_POLLS: usize = 10;
const ACTIVATION_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Lower-cased fragments of errors raised by a dead bus connection
const STALE_INDICATORS: [&str; 8] = [
    "connection closed",
    "disconnected",
    "connection is closed",
    "transport endpoint is not connected",
    "broken pipe",
    "closed network connection",
    "connection reset by peer",
    "connection refused",
];

/// `a{sa{sv}}` connection settings as sent to NetworkManager
pub type Settings = HashMap<String, HashMap<String, Value<'static>>>;

/// Settings as returned by `GetSettings` and `GetSecrets`
pub type ReadSettings = HashMap<String, HashMap<String, OwnedValue>>;

pub fn is_stale_message(message: &str) -> bool {
    let lower = message.to_lowercase();
    STALE_INDICATORS.iter().any(|indicator| lower.contains(indicator))
}

fn mark_stale<T>(result: WgctlResult<T>) -> WgctlResult<T> {
    result.map_err(|e| {
        if !e.is_stale() && is_stale_message(&e.to_string()) {
            e.stale()
        } else {
            e
        }
    })
}

fn object_path(path: &str) -> WgctlResult<ObjectPath<'_>> {
    ObjectPath::try_from(path).map_err(|e| WgctlError::DBus(format!("invalid object path {}: {}", path, e)))
}

fn setting<'s>(settings: &'s ReadSettings, section: &str, key: &str) -> Option<&'s Value<'static>> {
    settings.get(section)?.get(key).map(|value| &**value)
}

fn setting_str(settings: &ReadSettings, section: &str, key: &str) -> Option<String> {
    setting(settings, section, key).and_then(as_string)
}

/// Strip the `v` wrappers NetworkManager puts around `a{sv}` values
fn plain<'a, 'v>(value: &'a Value<'v>) -> &'a Value<'v> {
    match value {
        Value::Value(inner) => plain(inner),
        other => other,
    }
}

fn as_string(value: &Value<'_>) -> Option<String> {
    match plain(value) {
        Value::Str(s) => Some(s.as_str().to_string()),
        _ => None,
    }
}

fn as_u32(value: &Value<'_>) -> Option<u32> {
    match plain(value) {
        Value::U32(v) => Some(*v),
        _ => None,
    }
}

fn as_list<'a, 'v>(value: &'a Value<'v>) -> Vec<&'a Value<'v>> {
    match plain(value) {
        Value::Array(array) => array.iter().collect(),
        _ => Vec::new(),
    }
}

fn as_fields<'a, 'v>(value: &'a Value<'v>) -> HashMap<String, &'a Value<'v>> {
    match plain(value) {
        Value::Dict(dict) => dict
            .iter()
            .filter_map(|(key, value)| as_string(key).map(|key| (key, value)))
            .collect(),
        _ => HashMap::new(),
    }
}

/// Profile id for `options`: the description, or the interface name without one
fn profile_id(options: &ConfigureOptions) -> String {
    let description = options.interface.description.trim();
    if description.is_empty() {
        options.interface.name.clone()
    } else {
        description.to_string()
    }
}

fn peer_from_settings(value: &Value<'_>) -> Option<Peer> {
    let fields = as_fields(value);
    let text = |key: &str| {
        fields
            .get(key)
            .and_then(|value| as_string(value))
            .filter(|text| !text.is_empty())
    };
    let allowed_ips = fields
        .get("allowed-ips")
        .map(|value| as_list(value))
        .unwrap_or_default()
        .into_iter()
        .filter_map(as_string)
        .collect();
    let keepalive = fields
        .get("persistent-keepalive")
        .and_then(|value| as_u32(value))
        .unwrap_or_default();

    Some(Peer {
        public_key: text("public-key")?,
        endpoint: text("endpoint"),
        preshared_key: text("preshared-key"),
        allowed_ips,
        persistent_keepalive: Duration::from_secs(keepalive as u64),
        ..Default::default()
    })
}

/// Device as a profile stores it, for interfaces NetworkManager has not activated
pub fn device_from_settings(name: &str, settings: &ReadSettings) -> Device {
    let mut device = Device::named(name);
    if let Some(id) = setting_str(settings, "connection", "id") {
        if id != name {
            device.interface.description = id;
        }
    }

    for section in ["ipv4", "ipv6"] {
        let entries = setting(settings, section, "address-data")
            .map(as_list)
            .unwrap_or_default();
        for entry in entries {
            let fields = as_fields(entry);
            let address = fields.get("address").and_then(|value| as_string(value));
            let prefix = fields.get("prefix").and_then(|value| as_u32(value));
            if let (Some(address), Some(prefix)) = (address, prefix) {
                device.interface.addresses.push(format!("{}/{}", address, prefix));
            }
        }
    }

    let wireguard = |key: &str| setting(settings, "wireguard", key);
    device.interface.mtu = wireguard("mtu").and_then(as_u32).unwrap_or_default();
    device.wireguard.listen_port = wireguard("listen-port").and_then(as_u32).unwrap_or_default() as u16;
    device.wireguard.firewall_mark = wireguard("fwmark").and_then(as_u32).unwrap_or_default();
    if let Some(key) = wireguard("private-key").and_then(as_string).filter(|key| !key.is_empty()) {
        device.wireguard.public_key = public_key_from_private(&key).unwrap_or_default();
        device.wireguard.private_key = key;
    }
    device.wireguard.peers = wireguard("peers")
        .map(as_list)
        .unwrap_or_default()
        .into_iter()
        .filter_map(peer_from_settings)
        .collect();
    device
}

/// DNS servers of a profile, sorted
pub fn dns_from_settings(settings: &ReadSettings) -> Vec<IpAddr> {
    let mut servers = Vec::new();
    for value in setting(settings, "ipv4", "dns").map(as_list).unwrap_or_default() {
        if let Some(raw) = as_u32(value) {
            servers.push(IpAddr::V4(Ipv4Addr::from(raw.to_ne_bytes())));
        }
    }
    for value in setting(settings, "ipv6", "dns").map(as_list).unwrap_or_default() {
        let bytes: Vec<u8> = as_list(value)
            .into_iter()
            .filter_map(|byte| match plain(byte) {
                Value::U8(byte) => Some(*byte),
                _ => None,
            })
            .collect();
        if let Ok(octets) = <[u8; 16]>::try_from(bytes) {
            servers.push(IpAddr::V6(Ipv6Addr::from(octets)));
        }
    }
    servers.sort();
    servers.dedup();
    servers
}

/// Whether the profile-only settings (id and DNS) already match `options`
///
/// Keys, peers, addresses and MTU are compared against the live device instead.
pub fn profile_matches(settings: &ReadSettings, options: &ConfigureOptions) -> bool {
    if setting_str(settings, "connection", "id").unwrap_or_default() != profile_id(options) {
        return false;
    }
    let mut wanted: Vec<IpAddr> = options
        .interface
        .dns
        .iter()
        .filter_map(|server| server.trim().parse().ok())
        .collect();
    wanted.sort();
    wanted.dedup();
    dns_from_settings(settings) == wanted
}

/// Build the connection profile for `options`
///
/// The profile never autoconnects; it is activated explicitly by `up()`.
pub fn build_settings(options: &ConfigureOptions, uuid: &str) -> WgctlResult<Settings> {
    let iface = &options.interface;
    let wg = &options.wireguard;
    let id = profile_id(options);

    let mut connection = HashMap::new();
    connection.insert("id".to_string(), Value::new(id));
    connection.insert("uuid".to_string(), Value::new(uuid.to_string()));
    connection.insert("type".to_string(), Value::new("wireguard".to_string()));
    connection.insert("interface-name".to_string(), Value::new(iface.name.clone()));
    connection.insert("autoconnect".to_string(), Value::new(false));

    let mut wireguard = HashMap::new();
    wireguard.insert("private-key".to_string(), Value::new(wg.private_key.clone()));
    if let Some(port) = wg.listen_port {
        wireguard.insert("listen-port".to_string(), Value::new(port as u32));
    }
    if let Some(mark) = wg.firewall_mark {
        wireguard.insert("fwmark".to_string(), Value::new(mark));
    }
    if iface.mtu > 0 {
        wireguard.insert("mtu".to_string(), Value::new(iface.mtu));
    }

    let peers: Vec<HashMap<String, Value<'static>>> = wg
        .peers
        .iter()
        .map(|peer| {
            let mut entry = HashMap::new();
            entry.insert("public-key".to_string(), Value::new(peer.public_key.clone()));
            if let Some(psk) = peer.preshared_key() {
                entry.insert("preshared-key".to_string(), Value::new(psk.to_string()));
                entry.insert("preshared-key-flags".to_string(), Value::new(0u32));
            }
            if let Some(endpoint) = peer.endpoint() {
                entry.insert("endpoint".to_string(), Value::new(endpoint.to_string()));
            }
            if peer.persistent_keepalive > 0 {
                entry.insert(
                    "persistent-keepalive".to_string(),
                    Value::new(peer.persistent_keepalive),
                );
            }
            entry.insert(
                "allowed-ips".to_string(),
                Value::new(peer.normalized_allowed_ips()),
            );
            entry
        })
        .collect();
    if !peers.is_empty() {
        wireguard.insert("peers".to_string(), Value::new(peers));
    }

    let address = parse_interface_address(&iface.address)?;
    let mut address_data = HashMap::new();
    address_data.insert("address".to_string(), Value::new(address.addr().to_string()));
    address_data.insert("prefix".to_string(), Value::new(address.prefix_len() as u32));

    let mut ipv4 = HashMap::new();
    let mut ipv6 = HashMap::new();
    if address.addr().is_ipv4() {
        ipv4.insert("method".to_string(), Value::new("manual".to_string()));
        ipv4.insert("address-data".to_string(), Value::new(vec![address_data]));
        ipv6.insert("method".to_string(), Value::new("ignore".to_string()));
    } else {
        ipv4.insert("method".to_string(), Value::new("disabled".to_string()));
        ipv6.insert("method".to_string(), Value::new("manual".to_string()));
        ipv6.insert("address-data".to_string(), Value::new(vec![address_data]));
    }

    // ipv4.dns is network-order u32, ipv6.dns raw 16-byte arrays
    let mut dns4 = Vec::new();
    let mut dns6 = Vec::new();
    for server in &iface.dns {
        match server.trim().parse::<IpAddr>() {
            Ok(IpAddr::V4(ip)) => dns4.push(u32::from_ne_bytes(ip.octets())),
            Ok(IpAddr::V6(ip)) => dns6.push(ip.octets().to_vec()),
            Err(_) => {
                return Err(WgctlError::Validation(format!("invalid DNS server: {}", server)));
            }
        }
    }
    if !dns4.is_empty() {
        ipv4.insert("dns".to_string(), Value::new(dns4));
    }
    if !dns6.is_empty() {
        ipv6.insert("dns".to_string(), Value::new(dns6));
    }

    let mut settings = HashMap::new();
    settings.insert("connection".to_string(), connection);
    settings.insert("wireguard".to_string(), wireguard);
    settings.insert("ipv4".to_string(), ipv4);
    settings.insert("ipv6".to_string(), ipv6);
    Ok(settings)
}

/// A saved `wireguard` connection profile
#[derive(Debug)]
struct Profile {
    path: String,
    uuid: String,
    id: String,
    settings: ReadSettings,
}

pub struct NetworkManagerConnector {
    connection: Connection,
    kernel: NetlinkConnector,
}

impl NetworkManagerConnector {
    /// Connect to NetworkManager on the system bus
    pub async fn connect(raw_url: &str) -> WgctlResult<Self> {
        let url = BackendUrl::parse(raw_url)?;
        expect_kind(&url, BackendKind::NetworkManager)?;
        if url.has_authority() {
            return Err(WgctlError::Validation(
                "networkmanager backend only talks to the local system bus".to_string(),
            ));
        }

        let connection = Connection::system()
            .await
            .map_err(|e| WgctlError::DBus(format!("Failed to connect to D-Bus: {}", e)))?;
        let connector = Self {
            connection,
            kernel: NetlinkConnector::open()?,
        };

        let version = connector.property(NM_PATH, NM_IFACE, "Version").await?;
        match &*version {
            Value::Str(version) => info!("Connected to NetworkManager {}", version.as_str()),
            _ => info!("Connected to NetworkManager"),
        }
        Ok(connector)
    }

    async fn call<B, R>(&self, path: &str, interface: &str, method: &str, body: &B) -> WgctlResult<R>
    where
        B: serde::ser::Serialize + zbus::zvariant::DynamicType,
        R: serde::de::DeserializeOwned + zbus::zvariant::Type,
    {
        self.connection
            .call_method(Some(NM_SERVICE), path, Some(interface), method, body)
            .await
            .map_err(|e| WgctlError::DBus(format!("{}.{} on {} failed: {}", interface, method, path, e)))?
            .body()
            .deserialize()
            .map_err(|e| WgctlError::DBus(format!("Failed to deserialize {} response: {}", method, e)))
    }

    async fn property(&self, path: &str, interface: &str, name: &str) -> WgctlResult<OwnedValue> {
        self.call(path, PROPERTIES_IFACE, "Get", &(interface, name)).await
    }

    async fn property_u32(&self, path: &str, interface: &str, name: &str) -> WgctlResult<u32> {
        match &*self.property(path, interface, name).await? {
            Value::U32(value) => Ok(*value),
            other => Err(WgctlError::Parse(format!("{} is not a u32: {:?}", name, other))),
        }
    }

    async fn property_str(&self, path: &str, interface: &str, name: &str) -> WgctlResult<String> {
        match &*self.property(path, interface, name).await? {
            Value::Str(value) => Ok(value.as_str().to_string()),
            other => Err(WgctlError::Parse(format!("{} is not a string: {:?}", name, other))),
        }
    }

    async fn property_path(&self, path: &str, interface: &str, name: &str) -> WgctlResult<Option<String>> {
        match &*self.property(path, interface, name).await? {
            Value::ObjectPath(value) if value.as_str() != "/" => Ok(Some(value.as_str().to_string())),
            Value::ObjectPath(_) => Ok(None),
            other => Err(WgctlError::Parse(format!("{} is not an object path: {:?}", name, other))),
        }
    }

    async fn find_profile(&self, name: &str) -> WgctlResult<Option<Profile>> {
        let paths: Vec<OwnedObjectPath> = self
            .call(SETTINGS_PATH, SETTINGS_IFACE, "ListConnections", &())
            .await?;

        for path in paths {
            let path = path.as_str().to_string();
            let settings: ReadSettings = match self.call(&path, CONNECTION_IFACE, "GetSettings", &()).await {
                Ok(settings) => settings,
                Err(e) if is_stale_message(&e.to_string()) => return Err(e),
                Err(e) => {
                    debug!("Skipping unreadable connection {}: {}", path, e);
                    continue;
                }
            };
            if setting_str(&settings, "connection", "type").as_deref() != Some("wireguard") {
                continue;
            }
            if setting_str(&settings, "connection", "interface-name").as_deref() != Some(name) {
                continue;
            }
            return Ok(Some(Profile {
                uuid: setting_str(&settings, "connection", "uuid").unwrap_or_default(),
                id: setting_str(&settings, "connection", "id").unwrap_or_default(),
                path,
                settings,
            }));
        }
        Ok(None)
    }

    /// Private key held in the profile's secrets; `GetSettings` never returns it
    async fn stored_private_key(&self, profile: &Profile) -> WgctlResult<Option<String>> {
        match self
            .call::<_, ReadSettings>(&profile.path, CONNECTION_IFACE, "GetSecrets", &("wireguard",))
            .await
        {
            Ok(secrets) => Ok(setting_str(&secrets, "wireguard", "private-key").filter(|key| !key.is_empty())),
            Err(e) if is_stale_message(&e.to_string()) => Err(e),
            Err(e) => {
                debug!("No stored private key for {}: {}", profile.path, e);
                Ok(None)
            }
        }
    }

    /// Key the interface runs with, else the one its profile stores
    async fn current_private_key(&self, name: &str, profile: &Profile) -> WgctlResult<Option<String>> {
        match self.read_live(name, &profile.id).await {
            Ok(device) if !device.wireguard.private_key.is_empty() => {
                return Ok(Some(device.wireguard.private_key))
            }
            Ok(_) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }
        self.stored_private_key(profile).await
    }

    /// Device object for an interface, `None` when NetworkManager does not know it
    async fn device_path(&self, name: &str) -> WgctlResult<Option<String>> {
        let reply = self
            .connection
            .call_method(Some(NM_SERVICE), NM_PATH, Some(NM_IFACE), "GetDeviceByIpIface", &(name,))
            .await;
        match reply {
            Ok(message) => {
                let path: OwnedObjectPath = message.body().deserialize()?;
                Ok(Some(path.as_str().to_string()))
            }
            Err(zbus::Error::MethodError(error_name, _, _))
                if error_name.as_str().ends_with("UnknownDevice") =>
            {
                Ok(None)
            }
            Err(e) => Err(WgctlError::DBus(format!("GetDeviceByIpIface {} failed: {}", name, e))),
        }
    }

    async fn is_activated(&self, device: &str) -> WgctlResult<bool> {
        Ok(self.property_u32(device, DEVICE_IFACE, "State").await? == STATE_ACTIVATED)
    }

    async fn add_profile(&self, settings: &Settings) -> WgctlResult<String> {
        let path: OwnedObjectPath = self
            .call(SETTINGS_PATH, SETTINGS_IFACE, "AddConnection", &(settings,))
            .await?;
        debug!("Added connection profile {}", path.as_str());
        Ok(path.as_str().to_string())
    }

    async fn update_profile(&self, profile: &Profile, settings: &Settings) -> WgctlResult<()> {
        self.call::<_, ()>(&profile.path, CONNECTION_IFACE, "Update", &(settings,))
            .await
    }

    async fn delete_profile(&self, profile: &Profile) -> WgctlResult<()> {
        debug!("Deleting connection profile {}", profile.path);
        self.call::<_, ()>(&profile.path, CONNECTION_IFACE, "Delete", &())
            .await
    }

    /// Activate `profile_path` and wait for the device to reach the activated state
    async fn activate(&self, profile_path: &str, name: &str) -> WgctlResult<()> {
        let device = self.device_path(name).await?;
        let body = (
            object_path(profile_path)?,
            object_path(device.as_deref().unwrap_or("/"))?,
            object_path("/")?,
        );
        let active: OwnedObjectPath = self.call(NM_PATH, NM_IFACE, "ActivateConnection", &body).await?;
        debug!("Activation of {} requested: {}", name, active.as_str());

        for _ in 0..ACTIVATION_POLLS {
            if let Some(device) = self.device_path(name).await? {
                if self.is_activated(&device).await? {
                    return Ok(());
                }
            }
            tokio::time::sleep(ACTIVATION_POLL_INTERVAL).await;
        }
        Err(WgctlError::Transport(format!(
            "device {} not activated after {} ms",
            name,
            ACTIVATION_POLLS as u128 * ACTIVATION_POLL_INTERVAL.as_millis()
        )))
    }

    async fn deactivate(&self, name: &str) -> WgctlResult<()> {
        let Some(device) = self.device_path(name).await? else {
            return Ok(());
        };
        if let Some(active) = self.property_path(&device, DEVICE_IFACE, "ActiveConnection").await? {
            debug!("Deactivating {} ({})", name, active);
            self.call::<_, ()>(NM_PATH, NM_IFACE, "DeactivateConnection", &(object_path(&active)?,))
                .await?;
        }
        Ok(())
    }

    /// Live device read through the kernel, labelled with the profile id
    async fn read_live(&self, name: &str, profile_id: &str) -> WgctlResult<Device> {
        let link = self
            .kernel
            .find_link(name)
            .await?
            .filter(|link| link.wireguard)
            .ok_or_else(|| WgctlError::NotFound(format!("wireguard interface {} is not active", name)))?;
        let mut device = self.kernel.read_device(&link).await?;
        if profile_id != name {
            device.interface.description = profile_id.to_string();
        }
        Ok(device)
    }

    /// Whether the profile and its active device already match `options`
    async fn is_converged(&self, profile: &Profile, options: &ConfigureOptions) -> WgctlResult<bool> {
        let name = options.name();
        if !profile_matches(&profile.settings, options) {
            return Ok(false);
        }
        let Some(device) = self.device_path(name).await? else {
            return Ok(false);
        };
        if !self.is_activated(&device).await? {
            return Ok(false);
        }
        let current = match self.read_live(name, name).await {
            Ok(current) => current,
            Err(e) if e.is_not_found() => return Ok(false),
            Err(e) => return Err(e),
        };
        let addresses: Vec<AddressEntry> = current
            .interface
            .addresses
            .iter()
            .map(AddressEntry::new)
            .collect();

        Ok(plan_device(&current, options).is_empty()
            && plan_addresses(&addresses, &options.interface.address)?.is_empty()
            && plan_mtu(current.interface.mtu, options.interface.mtu).is_none())
    }

    async fn apply(&self, options: &ConfigureOptions) -> WgctlResult<Device> {
        let options = options.validated()?;
        let name = options.name();
        let existing = self.find_profile(name).await?;

        let current_key = match &existing {
            Some(profile) => self.current_private_key(name, profile).await?,
            None => None,
        };
        let options = options.clone().with_private_key(current_key.as_deref());

        if let Some(profile) = &existing {
            if self.is_converged(profile, &options).await? {
                debug!("{} already matches the desired configuration", name);
                return self.read_live(name, &profile.id).await;
            }
        }

        let uuid = existing
            .as_ref()
            .map(|profile| profile.uuid.clone())
            .filter(|uuid| !uuid.is_empty())
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let settings = build_settings(&options, &uuid)?;

        match existing {
            Some(profile) => {
                let updated = match self.update_profile(&profile, &settings).await {
                    Ok(()) => self.activate(&profile.path, name).await,
                    Err(e) => Err(e),
                };
                if let Err(e) = updated {
                    if is_stale_message(&e.to_string()) {
                        return Err(e);
                    }
                    warn!("live reconfiguration of {} failed, recreating profile: {}", name, e);
                    self.deactivate(name).await?;
                    self.delete_profile(&profile).await?;
                    let path = self.add_profile(&settings).await?;
                    self.activate(&path, name).await?;
                }
            }
            None => {
                info!("Creating NetworkManager profile for {}", name);
                let path = self.add_profile(&settings).await?;
                self.activate(&path, name).await?;
            }
        }

        let id = self
            .find_profile(name)
            .await?
            .map(|profile| profile.id)
            .unwrap_or_default();
        self.read_live(name, &id).await
    }

    async fn read(&self, name: &str) -> WgctlResult<Device> {
        validate_interface_name(name)?;
        let profile = self
            .find_profile(name)
            .await?
            .ok_or_else(|| WgctlError::NotFound(format!("networkmanager profile for {}", name)))?;
        match self.read_live(name, &profile.id).await {
            Err(e) if e.is_not_found() => {
                debug!("{} is not active, reporting its profile", name);
                let mut device = device_from_settings(name, &profile.settings);
                if let Some(key) = self.stored_private_key(&profile).await? {
                    device.wireguard.public_key = public_key_from_private(&key)?;
                    device.wireguard.private_key = key;
                }
                Ok(device)
            }
            other => other,
        }
    }

    async fn teardown(&self, name: &str) -> WgctlResult<()> {
        validate_interface_name(name)?;
        let Some(profile) = self.find_profile(name).await? else {
            debug!("No profile for {}, nothing to tear down", name);
            return Ok(());
        };
        self.deactivate(name).await?;
        self.delete_profile(&profile).await
    }

    async fn active(&self, name: &str) -> WgctlResult<bool> {
        validate_interface_name(name)?;
        match self.device_path(name).await? {
            Some(device) => self.is_activated(&device).await,
            None => Ok(false),
        }
    }

    async fn foreign_server(&self, device: &str, known: &[String]) -> WgctlResult<Option<ForeignServer>> {
        if self.property_u32(device, DEVICE_IFACE, "DeviceType").await? != DEVICE_TYPE_WIREGUARD {
            return Ok(None);
        }
        let name = self.property_str(device, DEVICE_IFACE, "Interface").await?;
        if known.iter().any(|known| *known == name) {
            return Ok(None);
        }

        let description = match self.property_path(device, DEVICE_IFACE, "ActiveConnection").await? {
            Some(active) => self.property_str(&active, ACTIVE_IFACE, "Id").await?,
            None => String::new(),
        };
        let state = LinkState::from_up(self.is_activated(device).await?);
        let current = self.read_live(&name, &description).await?;
        Ok(Some(ForeignServer::from_device(current, state, "wireguard")))
    }

    async fn foreign_servers(&self, known: &[String]) -> WgctlResult<Vec<ForeignServer>> {
        let devices: Vec<OwnedObjectPath> = self.call(NM_PATH, NM_IFACE, "GetAllDevices", &()).await?;

        let mut servers = Vec::new();
        for device in devices {
            match self.foreign_server(device.as_str(), known).await {
                Ok(Some(server)) => servers.push(server),
                Ok(None) => {}
                Err(e) if is_stale_message(&e.to_string()) => return Err(e),
                Err(e) => warn!("Skipping device {}: {}", device.as_str(), e),
            }
        }
        servers.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(servers)
    }
}

#[async_trait]
impl Driver for NetworkManagerConnector {
    fn kind(&self) -> BackendKind {
        BackendKind::NetworkManager
    }

    async fn device(&self, name: &str) -> WgctlResult<Device> {
        mark_stale(self.read(name).await)
    }

    async fn up(&self, options: &ConfigureOptions) -> WgctlResult<Device> {
        mark_stale(self.apply(options).await)
    }

    async fn down(&self, name: &str) -> WgctlResult<()> {
        mark_stale(self.teardown(name).await)
    }

    async fn status(&self, name: &str) -> WgctlResult<bool> {
        mark_stale(self.active(name).await)
    }

    async fn stats(&self, name: &str) -> WgctlResult<Option<InterfaceStats>> {
        self.kernel.stats(name).await
    }

    async fn peer_stats(&self, name: &str, peer_public_key: &str) -> WgctlResult<Option<PeerStats>> {
        self.kernel.peer_stats(name, peer_public_key).await
    }

    async fn find_foreign_servers(&self, known_interfaces: &[String]) -> WgctlResult<Vec<ForeignServer>> {
        mark_stale(self.foreign_servers(known_interfaces).await)
    }

    async fn close(&self) -> WgctlResult<()> {
        self.kernel.close().await
    }
}
