//! WireGuard generic netlink family
//!
//! Link creation and addressing go through rtnetlink; keys, listen port,
//! firewall mark and peers only exist on the `wireguard` genl family.
//! Messages are encoded by hand: a `nlmsghdr`, a `genlmsghdr` and a flat
//! or nested list of 4-byte aligned attributes.

use chrono::DateTime;
use ipnet::IpNet;
use netlink_sys::{protocols, Socket};
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tokio::io::unix::AsyncFd;
use tokio::io::Interest;
use tokio::sync::Mutex;
use tracing::debug;

use crate::driver::keys::{encode_key, is_zero_key};
use crate::driver::{Device, Peer};
use crate::error::{WgctlError, WgctlResult};
use crate::reconcile::DeviceUpdate;
use crate::validation::{decode_key, KEY_LEN};

pub const WG_GENL_NAME: &str = "wireguard";
const WG_GENL_VERSION: u8 = 1;

const NLMSG_HDRLEN: usize = 16;
const GENL_HDRLEN: usize = 4;
const NLA_HDRLEN: usize = 4;

const NLMSG_ERROR: u16 = 2;
const NLMSG_DONE: u16 = 3;

const NLM_F_REQUEST: u16 = 0x1;
const NLM_F_ACK: u16 = 0x4;
const NLM_F_DUMP: u16 = 0x300;

const NLA_F_NESTED: u16 = 0x8000;
const NLA_TYPE_MASK: u16 = 0x3fff;

const GENL_ID_CTRL: u16 = 0x10;
const CTRL_CMD_GETFAMILY: u8 = 3;
const CTRL_ATTR_FAMILY_ID: u16 = 1;
const CTRL_ATTR_FAMILY_NAME: u16 = 2;

const WG_CMD_GET_DEVICE: u8 = 0;
const WG_CMD_SET_DEVICE: u8 = 1;

const WGDEVICE_A_IFNAME: u16 = 2;
const WGDEVICE_A_PRIVATE_KEY: u16 = 3;
const WGDEVICE_A_PUBLIC_KEY: u16 = 4;
const WGDEVICE_A_FLAGS: u16 = 5;
const WGDEVICE_A_LISTEN_PORT: u16 = 6;
const WGDEVICE_A_FWMARK: u16 = 7;
const WGDEVICE_A_PEERS: u16 = 8;

const WGDEVICE_F_REPLACE_PEERS: u32 = 1 << 0;

const WGPEER_A_PUBLIC_KEY: u16 = 1;
const WGPEER_A_PRESHARED_KEY: u16 = 2;
const WGPEER_A_FLAGS: u16 = 3;
const WGPEER_A_ENDPOINT: u16 = 4;
const WGPEER_A_PERSISTENT_KEEPALIVE_INTERVAL: u16 = 5;
const WGPEER_A_LAST_HANDSHAKE_TIME: u16 = 6;
const WGPEER_A_RX_BYTES: u16 = 7;
const WGPEER_A_TX_BYTES: u16 = 8;
const WGPEER_A_ALLOWEDIPS: u16 = 9;
const WGPEER_A_PROTOCOL_VERSION: u16 = 10;

const WGPEER_F_REMOVE_ME: u32 = 1 << 0;
const WGPEER_F_REPLACE_ALLOWEDIPS: u32 = 1 << 1;
const WGPEER_F_UPDATE_ONLY: u32 = 1 << 2;

const WGALLOWEDIP_A_FAMILY: u16 = 1;
const WGALLOWEDIP_A_IPADDR: u16 = 2;
const WGALLOWEDIP_A_CIDR_MASK: u16 = 3;

const fn align(len: usize) -> usize {
    (len + 3) & !3
}

/// Attribute payload writer with nesting support
#[derive(Debug, Default)]
pub(crate) struct AttrWriter {
    buf: Vec<u8>,
}

impl AttrWriter {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn put(&mut self, kind: u16, payload: &[u8]) {
        let len = NLA_HDRLEN + payload.len();
        self.buf.extend_from_slice(&(len as u16).to_ne_bytes());
        self.buf.extend_from_slice(&kind.to_ne_bytes());
        self.buf.extend_from_slice(payload);
        self.buf.resize(align(self.buf.len()), 0);
    }

    pub(crate) fn put_u8(&mut self, kind: u16, value: u8) {
        self.put(kind, &[value]);
    }

    pub(crate) fn put_u16(&mut self, kind: u16, value: u16) {
        self.put(kind, &value.to_ne_bytes());
    }

    pub(crate) fn put_u32(&mut self, kind: u16, value: u32) {
        self.put(kind, &value.to_ne_bytes());
    }

    pub(crate) fn put_str(&mut self, kind: u16, value: &str) {
        let mut bytes = value.as_bytes().to_vec();
        bytes.push(0);
        self.put(kind, &bytes);
    }

    /// Open a nested attribute; close it with `nest_end`
    pub(crate) fn nest_start(&mut self, kind: u16) -> usize {
        let offset = self.buf.len();
        self.buf.extend_from_slice(&0u16.to_ne_bytes());
        self.buf.extend_from_slice(&(kind | NLA_F_NESTED).to_ne_bytes());
        offset
    }

    pub(crate) fn nest_end(&mut self, offset: usize) {
        let len = (self.buf.len() - offset) as u16;
        self.buf[offset..offset + 2].copy_from_slice(&len.to_ne_bytes());
    }

    pub(crate) fn finish(self) -> Vec<u8> {
        self.buf
    }
}

/// Iterates `(type, payload)` pairs of an attribute block
pub(crate) struct Attrs<'a> {
    data: &'a [u8],
}

impl<'a> Attrs<'a> {
    pub(crate) fn new(data: &'a [u8]) -> Self {
        Self { data }
    }
}

impl<'a> Iterator for Attrs<'a> {
    type Item = (u16, &'a [u8]);

    fn next(&mut self) -> Option<Self::Item> {
        if self.data.len() < NLA_HDRLEN {
            return None;
        }
        let len = u16::from_ne_bytes([self.data[0], self.data[1]]) as usize;
        let kind = u16::from_ne_bytes([self.data[2], self.data[3]]) & NLA_TYPE_MASK;
        if len < NLA_HDRLEN || len > self.data.len() {
            return None;
        }
        let payload = &self.data[NLA_HDRLEN..len];
        self.data = &self.data[align(len).min(self.data.len())..];
        Some((kind, payload))
    }
}

fn read_u16(payload: &[u8]) -> WgctlResult<u16> {
    payload
        .get(..2)
        .and_then(|b| b.try_into().ok())
        .map(u16::from_ne_bytes)
        .ok_or_else(|| WgctlError::Parse("truncated u16 attribute".to_string()))
}

fn read_u32(payload: &[u8]) -> WgctlResult<u32> {
    payload
        .get(..4)
        .and_then(|b| b.try_into().ok())
        .map(u32::from_ne_bytes)
        .ok_or_else(|| WgctlError::Parse("truncated u32 attribute".to_string()))
}

fn read_u64(payload: &[u8]) -> WgctlResult<u64> {
    payload
        .get(..8)
        .and_then(|b| b.try_into().ok())
        .map(u64::from_ne_bytes)
        .ok_or_else(|| WgctlError::Parse("truncated u64 attribute".to_string()))
}

fn read_key(payload: &[u8]) -> Option<[u8; KEY_LEN]> {
    payload.get(..KEY_LEN).and_then(|b| b.try_into().ok())
}

fn read_string(payload: &[u8]) -> String {
    let end = payload.iter().position(|b| *b == 0).unwrap_or(payload.len());
    String::from_utf8_lossy(&payload[..end]).into_owned()
}

/// A netlink header plus the bytes after it
#[derive(Debug)]
pub(crate) struct RawMessage<'a> {
    pub kind: u16,
    pub seq: u32,
    pub payload: &'a [u8],
}

/// Split a receive buffer into netlink messages
pub(crate) fn split_messages(data: &[u8]) -> Vec<RawMessage<'_>> {
    let mut messages = Vec::new();
    let mut rest = data;
    while rest.len() >= NLMSG_HDRLEN {
        let len = u32::from_ne_bytes([rest[0], rest[1], rest[2], rest[3]]) as usize;
        if len < NLMSG_HDRLEN || len > rest.len() {
            break;
        }
        messages.push(RawMessage {
            kind: u16::from_ne_bytes([rest[4], rest[5]]),
            seq: u32::from_ne_bytes([rest[8], rest[9], rest[10], rest[11]]),
            payload: &rest[NLMSG_HDRLEN..len],
        });
        rest = &rest[align(len).min(rest.len())..];
    }
    messages
}

/// Build a complete genl request
pub(crate) fn encode_request(family: u16, flags: u16, seq: u32, cmd: u8, attrs: &[u8]) -> Vec<u8> {
    let len = NLMSG_HDRLEN + GENL_HDRLEN + attrs.len();
    let mut msg = Vec::with_capacity(len);
    msg.extend_from_slice(&(len as u32).to_ne_bytes());
    msg.extend_from_slice(&family.to_ne_bytes());
    msg.extend_from_slice(&flags.to_ne_bytes());
    msg.extend_from_slice(&seq.to_ne_bytes());
    msg.extend_from_slice(&0u32.to_ne_bytes());
    msg.push(cmd);
    msg.push(WG_GENL_VERSION);
    msg.extend_from_slice(&0u16.to_ne_bytes());
    msg.extend_from_slice(attrs);
    msg
}

/// `struct sockaddr_in` / `struct sockaddr_in6` bytes
pub(crate) fn encode_sockaddr(addr: &SocketAddr) -> Vec<u8> {
    match addr {
        SocketAddr::V4(v4) => {
            let mut buf = vec![0u8; 16];
            buf[0..2].copy_from_slice(&(libc::AF_INET as u16).to_ne_bytes());
            buf[2..4].copy_from_slice(&v4.port().to_be_bytes());
            buf[4..8].copy_from_slice(&v4.ip().octets());
            buf
        }
        SocketAddr::V6(v6) => {
            let mut buf = vec![0u8; 28];
            buf[0..2].copy_from_slice(&(libc::AF_INET6 as u16).to_ne_bytes());
            buf[2..4].copy_from_slice(&v6.port().to_be_bytes());
            buf[4..8].copy_from_slice(&v6.flowinfo().to_ne_bytes());
            buf[8..24].copy_from_slice(&v6.ip().octets());
            buf[24..28].copy_from_slice(&v6.scope_id().to_ne_bytes());
            buf
        }
    }
}

pub(crate) fn decode_sockaddr(data: &[u8]) -> Option<SocketAddr> {
    let family = i32::from(u16::from_ne_bytes([*data.first()?, *data.get(1)?]));
    let port = u16::from_be_bytes([*data.get(2)?, *data.get(3)?]);
    match family {
        libc::AF_INET => {
            let octets: [u8; 4] = data.get(4..8)?.try_into().ok()?;
            Some(SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::from(octets), port)))
        }
        libc::AF_INET6 => {
            let flowinfo = u32::from_ne_bytes(data.get(4..8)?.try_into().ok()?);
            let octets: [u8; 16] = data.get(8..24)?.try_into().ok()?;
            let scope_id = u32::from_ne_bytes(data.get(24..28)?.try_into().ok()?);
            Some(SocketAddr::V6(SocketAddrV6::new(
                Ipv6Addr::from(octets),
                port,
                flowinfo,
                scope_id,
            )))
        }
        _ => None,
    }
}

/// Attributes of a `WG_CMD_SET_DEVICE` request
///
/// Peer endpoints must already be resolved to `ip:port`.
pub fn encode_set_device(name: &str, update: &DeviceUpdate) -> WgctlResult<Vec<u8>> {
    let mut w = AttrWriter::new();
    w.put_str(WGDEVICE_A_IFNAME, name);

    if update.replace_peers {
        w.put_u32(WGDEVICE_A_FLAGS, WGDEVICE_F_REPLACE_PEERS);
    }
    if let Some(private_key) = &update.private_key {
        w.put(WGDEVICE_A_PRIVATE_KEY, &decode_key(private_key)?);
    }
    if let Some(port) = update.listen_port {
        w.put_u16(WGDEVICE_A_LISTEN_PORT, port);
    }
    if let Some(mark) = update.firewall_mark {
        w.put_u32(WGDEVICE_A_FWMARK, mark);
    }

    if update.peers.is_empty() {
        return Ok(w.finish());
    }

    let peers = w.nest_start(WGDEVICE_A_PEERS);
    for (index, peer) in update.peers.iter().enumerate() {
        let entry = w.nest_start(index as u16);
        w.put(WGPEER_A_PUBLIC_KEY, &decode_key(&peer.public_key)?);

        let mut flags = 0;
        if peer.remove {
            flags |= WGPEER_F_REMOVE_ME;
        }
        if peer.update_only {
            flags |= WGPEER_F_UPDATE_ONLY;
        }
        if peer.replace_allowed_ips {
            flags |= WGPEER_F_REPLACE_ALLOWEDIPS;
        }
        if flags != 0 {
            w.put_u32(WGPEER_A_FLAGS, flags);
        }

        if !peer.remove {
            match peer.preshared_key.as_deref() {
                Some("") => w.put(WGPEER_A_PRESHARED_KEY, &[0u8; KEY_LEN]),
                Some(psk) => w.put(WGPEER_A_PRESHARED_KEY, &decode_key(psk)?),
                None => {}
            }
            if let Some(endpoint) = &peer.endpoint {
                let addr: SocketAddr = endpoint.parse().map_err(|_| {
                    WgctlError::Validation(format!("unresolved peer endpoint: {}", endpoint))
                })?;
                w.put(WGPEER_A_ENDPOINT, &encode_sockaddr(&addr));
            }
            if let Some(keepalive) = peer.persistent_keepalive {
                w.put_u16(WGPEER_A_PERSISTENT_KEEPALIVE_INTERVAL, keepalive);
            }
            if !peer.allowed_ips.is_empty() {
                let ips = w.nest_start(WGPEER_A_ALLOWEDIPS);
                for (ip_index, allowed_ip) in peer.allowed_ips.iter().enumerate() {
                    let net: IpNet = allowed_ip.parse().map_err(|_| {
                        WgctlError::Validation(format!("invalid allowed ip: {}", allowed_ip))
                    })?;
                    let item = w.nest_start(ip_index as u16);
                    match net.addr() {
                        IpAddr::V4(ip) => {
                            w.put_u16(WGALLOWEDIP_A_FAMILY, libc::AF_INET as u16);
                            w.put(WGALLOWEDIP_A_IPADDR, &ip.octets());
                        }
                        IpAddr::V6(ip) => {
                            w.put_u16(WGALLOWEDIP_A_FAMILY, libc::AF_INET6 as u16);
                            w.put(WGALLOWEDIP_A_IPADDR, &ip.octets());
                        }
                    }
                    w.put_u8(WGALLOWEDIP_A_CIDR_MASK, net.prefix_len());
                    w.nest_end(item);
                }
                w.nest_end(ips);
            }
        }
        w.nest_end(entry);
    }
    w.nest_end(peers);

    Ok(w.finish())
}

fn decode_allowed_ip(data: &[u8]) -> WgctlResult<Option<String>> {
    let mut family = None;
    let mut addr: Option<&[u8]> = None;
    let mut cidr = None;
    for (kind, payload) in Attrs::new(data) {
        match kind {
            WGALLOWEDIP_A_FAMILY => family = Some(i32::from(read_u16(payload)?)),
            WGALLOWEDIP_A_IPADDR => addr = Some(payload),
            WGALLOWEDIP_A_CIDR_MASK => cidr = payload.first().copied(),
            _ => {}
        }
    }
    let (Some(family), Some(addr), Some(cidr)) = (family, addr, cidr) else {
        return Ok(None);
    };
    let ip = match family {
        libc::AF_INET => match <[u8; 4]>::try_from(addr.get(..4).unwrap_or_default()) {
            Ok(octets) => IpAddr::V4(Ipv4Addr::from(octets)),
            Err(_) => return Ok(None),
        },
        libc::AF_INET6 => match <[u8; 16]>::try_from(addr.get(..16).unwrap_or_default()) {
            Ok(octets) => IpAddr::V6(Ipv6Addr::from(octets)),
            Err(_) => return Ok(None),
        },
        _ => return Ok(None),
    };
    Ok(Some(format!("{}/{}", ip, cidr)))
}

fn decode_peer(data: &[u8]) -> WgctlResult<Peer> {
    let mut peer = Peer::default();
    for (kind, payload) in Attrs::new(data) {
        match kind {
            WGPEER_A_PUBLIC_KEY => {
                if let Some(key) = read_key(payload) {
                    peer.public_key = encode_key(&key);
                }
            }
            WGPEER_A_PRESHARED_KEY => {
                if let Some(key) = read_key(payload).filter(|k| !is_zero_key(k)) {
                    peer.preshared_key = Some(encode_key(&key));
                }
            }
            WGPEER_A_ENDPOINT => {
                let endpoint = decode_sockaddr(payload).map(|addr| addr.to_string());
                peer.endpoint = endpoint.clone();
                peer.stats.endpoint = endpoint;
            }
            WGPEER_A_PERSISTENT_KEEPALIVE_INTERVAL => {
                peer.persistent_keepalive = Duration::from_secs(u64::from(read_u16(payload)?));
            }
            WGPEER_A_LAST_HANDSHAKE_TIME => {
                // struct __kernel_timespec
                let secs = read_u64(payload)? as i64;
                let nsecs = payload.get(8..).map(read_u64).transpose()?.unwrap_or(0) as u32;
                if secs > 0 || nsecs > 0 {
                    peer.stats.last_handshake_time = DateTime::from_timestamp(secs, nsecs);
                }
            }
            WGPEER_A_RX_BYTES => peer.stats.receive_bytes = read_u64(payload)?,
            WGPEER_A_TX_BYTES => peer.stats.transmit_bytes = read_u64(payload)?,
            WGPEER_A_PROTOCOL_VERSION => peer.stats.protocol_version = read_u32(payload)?,
            WGPEER_A_ALLOWEDIPS => {
                for (_, item) in Attrs::new(payload) {
                    if let Some(allowed_ip) = decode_allowed_ip(item)? {
                        peer.allowed_ips.push(allowed_ip);
                    }
                }
            }
            _ => {}
        }
    }
    Ok(peer)
}

/// Fold the genl payloads of a `WG_CMD_GET_DEVICE` dump into a device
///
/// Large devices arrive split over several messages; a peer repeated at the
/// start of a message continues the previous one.
pub fn decode_device(name: &str, payloads: &[&[u8]]) -> WgctlResult<Device> {
    let mut device = Device::named(name);

    for payload in payloads {
        let Some(attrs) = payload.get(GENL_HDRLEN..) else {
            continue;
        };
        for (kind, value) in Attrs::new(attrs) {
            match kind {
                WGDEVICE_A_IFNAME => device.wireguard.name = read_string(value),
                WGDEVICE_A_PRIVATE_KEY => {
                    if let Some(key) = read_key(value).filter(|k| !is_zero_key(k)) {
                        device.wireguard.private_key = encode_key(&key);
                    }
                }
                WGDEVICE_A_PUBLIC_KEY => {
                    if let Some(key) = read_key(value).filter(|k| !is_zero_key(k)) {
                        device.wireguard.public_key = encode_key(&key);
                    }
                }
                WGDEVICE_A_LISTEN_PORT => device.wireguard.listen_port = read_u16(value)?,
                WGDEVICE_A_FWMARK => device.wireguard.firewall_mark = read_u32(value)?,
                WGDEVICE_A_PEERS => {
                    for (_, entry) in Attrs::new(value) {
                        let peer = decode_peer(entry)?;
                        match device.wireguard.peers.last_mut() {
                            Some(last) if last.public_key == peer.public_key => {
                                last.allowed_ips.extend(peer.allowed_ips);
                            }
                            _ => device.wireguard.peers.push(peer),
                        }
                    }
                }
                _ => {}
            }
        }
    }

    if device.wireguard.name.is_empty() {
        device.wireguard.name = name.to_string();
    }
    Ok(device)
}

fn errno_error(errno: i32, context: &str) -> WgctlError {
    match errno {
        libc::ENODEV => WgctlError::NotFound(format!("wireguard interface {}", context)),
        libc::EOPNOTSUPP => WgctlError::NotFound(format!("{} is not a wireguard interface", context)),
        _ => WgctlError::Netlink(format!(
            "{}: {}",
            context,
            io::Error::from_raw_os_error(errno)
        )),
    }
}

/// Generic netlink socket bound to the `wireguard` family
pub struct WireguardSocket {
    fd: AsyncFd<Socket>,
    family: u16,
    seq: AtomicU32,
    /// One request in flight; replies are matched by sequence number only
    in_flight: Mutex<()>,
}

impl WireguardSocket {
    /// Open a genl socket and resolve the family id
    pub async fn open() -> WgctlResult<Self> {
        let mut socket = Socket::new(protocols::NETLINK_GENERIC)?;
        socket.set_non_blocking(true)?;
        socket.bind_auto()?;

        let mut wg = Self {
            fd: AsyncFd::new(socket)?,
            family: GENL_ID_CTRL,
            seq: AtomicU32::new(1),
            in_flight: Mutex::new(()),
        };
        wg.family = wg.resolve_family().await?;
        debug!("Resolved genl family {} to id {}", WG_GENL_NAME, wg.family);
        Ok(wg)
    }

    async fn resolve_family(&self) -> WgctlResult<u16> {
        let mut attrs = AttrWriter::new();
        attrs.put_str(CTRL_ATTR_FAMILY_NAME, WG_GENL_NAME);
        let replies = match self
            .exchange(GENL_ID_CTRL, NLM_F_ACK, CTRL_CMD_GETFAMILY, &attrs.finish())
            .await?
        {
            Ok(replies) => replies,
            Err(libc::ENOENT) => {
                return Err(WgctlError::NotSupported(
                    "wireguard genl family is missing, is the kernel module loaded?".to_string(),
                ))
            }
            Err(errno) => return Err(errno_error(errno, WG_GENL_NAME)),
        };

        for reply in &replies {
            let Some(attrs) = reply.get(GENL_HDRLEN..) else {
                continue;
            };
            for (kind, value) in Attrs::new(attrs) {
                if kind == CTRL_ATTR_FAMILY_ID {
                    return read_u16(value);
                }
            }
        }
        Err(WgctlError::Netlink(format!("no family id for {}", WG_GENL_NAME)))
    }

    async fn send(&self, msg: &[u8]) -> WgctlResult<()> {
        loop {
            let mut guard = self.fd.ready(Interest::WRITABLE).await?;
            match guard.try_io(|inner| inner.get_ref().send(msg, 0)) {
                Ok(result) => {
                    result?;
                    return Ok(());
                }
                Err(_would_block) => continue,
            }
        }
    }

    async fn recv(&self) -> WgctlResult<Vec<u8>> {
        loop {
            let mut guard = self.fd.ready(Interest::READABLE).await?;
            match guard.try_io(|inner| inner.get_ref().recv_from_full()) {
                Ok(result) => return Ok(result?.0),
                Err(_would_block) => continue,
            }
        }
    }

    /// Send one request and collect the genl payloads of its replies
    ///
    /// Ends on the ACK of a plain request or on `NLMSG_DONE` of a dump. A
    /// kernel rejection comes back as `Ok(Err(errno))`.
    async fn exchange(
        &self,
        family: u16,
        flags: u16,
        cmd: u8,
        attrs: &[u8],
    ) -> WgctlResult<Result<Vec<Vec<u8>>, i32>> {
        let _guard = self.in_flight.lock().await;
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        self.send(&encode_request(family, NLM_F_REQUEST | flags, seq, cmd, attrs))
            .await?;

        let mut payloads = Vec::new();
        loop {
            let data = self.recv().await?;
            for message in split_messages(&data) {
                if message.seq != seq {
                    continue;
                }
                match message.kind {
                    NLMSG_DONE => return Ok(Ok(payloads)),
                    NLMSG_ERROR => {
                        let errno = message
                            .payload
                            .get(..4)
                            .and_then(|b| b.try_into().ok())
                            .map(i32::from_ne_bytes)
                            .unwrap_or(0);
                        if errno == 0 {
                            return Ok(Ok(payloads));
                        }
                        return Ok(Err(-errno));
                    }
                    _ => payloads.push(message.payload.to_vec()),
                }
            }
        }
    }

    pub async fn get_device(&self, name: &str) -> WgctlResult<Device> {
        let mut attrs = AttrWriter::new();
        attrs.put_str(WGDEVICE_A_IFNAME, name);
        let payloads = self
            .exchange(self.family, NLM_F_DUMP, WG_CMD_GET_DEVICE, &attrs.finish())
            .await?
            .map_err(|errno| errno_error(errno, name))?;
        if payloads.is_empty() {
            return Err(WgctlError::NotFound(format!("wireguard interface {}", name)));
        }
        let slices: Vec<&[u8]> = payloads.iter().map(Vec::as_slice).collect();
        decode_device(name, &slices)
    }

    pub async fn set_device(&self, name: &str, update: &DeviceUpdate) -> WgctlResult<()> {
        let attrs = encode_set_device(name, update)?;
        self.exchange(self.family, NLM_F_ACK, WG_CMD_SET_DEVICE, &attrs)
            .await?
            .map_err(|errno| errno_error(errno, name))?;
        Ok(())
    }
}
