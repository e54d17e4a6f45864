//! Userspace WireGuard configuration protocol
//!
//! Daemons such as `wireguard-go` listen on `/var/run/wireguard/<iface>.sock`.
//! A request is `get=1` or `set=1` followed by `key=value` lines and an empty
//! line; every reply ends with `errno=<n>` and an empty line. Keys are hex.

use chrono::DateTime;
use std::fmt::Write as _;
use std::time::Duration;

use crate::driver::keys::{is_zero_key, key_from_hex, key_to_hex, public_key_from_private};
use crate::driver::{Device, Peer};
use crate::error::{WgctlError, WgctlResult};
use crate::reconcile::DeviceUpdate;

pub const GET_REQUEST: &str = "get=1\n\n";

/// Render a `set=1` request; endpoints must already be resolved to `ip:port`
pub fn render_set(update: &DeviceUpdate) -> WgctlResult<String> {
    let mut out = String::from("set=1\n");

    if let Some(private_key) = &update.private_key {
        let _ = writeln!(out, "private_key={}", key_to_hex(private_key)?);
    }
    if let Some(port) = update.listen_port {
        let _ = writeln!(out, "listen_port={}", port);
    }
    if let Some(mark) = update.firewall_mark {
        let _ = writeln!(out, "fwmark={}", mark);
    }
    if update.replace_peers {
        out.push_str("replace_peers=true\n");
    }

    for peer in &update.peers {
        let _ = writeln!(out, "public_key={}", key_to_hex(&peer.public_key)?);
        if peer.remove {
            out.push_str("remove=true\n");
            continue;
        }
        if peer.update_only {
            out.push_str("update_only=true\n");
        }
        match peer.preshared_key.as_deref() {
            Some("") => {
                let _ = writeln!(out, "preshared_key={}", "0".repeat(64));
            }
            Some(psk) => {
                let _ = writeln!(out, "preshared_key={}", key_to_hex(psk)?);
            }
            None => {}
        }
        if let Some(endpoint) = &peer.endpoint {
            let _ = writeln!(out, "endpoint={}", endpoint);
        }
        if let Some(keepalive) = peer.persistent_keepalive {
            let _ = writeln!(out, "persistent_keepalive_interval={}", keepalive);
        }
        if peer.replace_allowed_ips {
            out.push_str("replace_allowed_ips=true\n");
        }
        for allowed_ip in &peer.allowed_ips {
            let _ = writeln!(out, "allowed_ip={}", allowed_ip);
        }
    }

    out.push('\n');
    Ok(out)
}

/// Check the trailing `errno=` of a reply
pub fn parse_errno(reply: &str) -> WgctlResult<()> {
    let errno = reply
        .lines()
        .filter_map(|l| l.trim().strip_prefix("errno="))
        .last()
        .ok_or_else(|| WgctlError::Parse("uapi reply without errno".to_string()))?;

    match errno.trim().parse::<i64>() {
        Ok(0) => Ok(()),
        Ok(code) => Err(WgctlError::Transport(format!("uapi request failed with errno {}", code))),
        Err(_) => Err(WgctlError::Parse(format!("invalid uapi errno: {}", errno))),
    }
}

/// Parse a `get=1` reply into a device snapshot
pub fn parse_get(name: &str, reply: &str) -> WgctlResult<Device> {
    parse_errno(reply)?;

    let mut device = Device::named(name);
    let mut handshake_secs: i64 = 0;
    let mut handshake_nsecs: u32 = 0;

    for line in reply.lines() {
        let line = line.trim();
        if line.is_empty() {
            break;
        }
        let Some((key, value)) = line.split_once('=') else {
            return Err(WgctlError::Parse(format!("invalid uapi line: {:?}", line)));
        };

        match key {
            "private_key" => {
                if !is_hex_zero(value) {
                    device.wireguard.private_key = key_from_hex(value)?;
                }
            }
            "listen_port" => device.wireguard.listen_port = parse_number(key, value)?,
            "fwmark" => device.wireguard.firewall_mark = parse_number(key, value)?,
            "public_key" => {
                finish_handshake(&mut device, handshake_secs, handshake_nsecs);
                handshake_secs = 0;
                handshake_nsecs = 0;
                device.wireguard.peers.push(Peer {
                    public_key: key_from_hex(value)?,
                    ..Default::default()
                });
            }
            _ => {
                let Some(peer) = device.wireguard.peers.last_mut() else {
                    continue;
                };
                match key {
                    "preshared_key" => {
                        if !is_hex_zero(value) {
                            peer.preshared_key = Some(key_from_hex(value)?);
                        }
                    }
                    "endpoint" => {
                        peer.endpoint = Some(value.to_string());
                        peer.stats.endpoint = Some(value.to_string());
                    }
                    "persistent_keepalive_interval" => {
                        peer.persistent_keepalive = Duration::from_secs(parse_number(key, value)?);
                    }
                    "allowed_ip" => peer.allowed_ips.push(value.to_string()),
                    "last_handshake_time_sec" => handshake_secs = parse_number(key, value)?,
                    "last_handshake_time_nsec" => handshake_nsecs = parse_number(key, value)?,
                    "rx_bytes" => peer.stats.receive_bytes = parse_number(key, value)?,
                    "tx_bytes" => peer.stats.transmit_bytes = parse_number(key, value)?,
                    "protocol_version" => peer.stats.protocol_version = parse_number(key, value)?,
                    _ => {}
                }
            }
        }
    }
    finish_handshake(&mut device, handshake_secs, handshake_nsecs);

    if !device.wireguard.private_key.is_empty() {
        device.wireguard.public_key = public_key_from_private(&device.wireguard.private_key)?;
    }
    Ok(device)
}

fn finish_handshake(device: &mut Device, secs: i64, nsecs: u32) {
    if let Some(peer) = device.wireguard.peers.last_mut() {
        if secs > 0 || nsecs > 0 {
            peer.stats.last_handshake_time = DateTime::from_timestamp(secs, nsecs);
        }
    }
}

fn is_hex_zero(value: &str) -> bool {
    hex::decode(value.trim()).map(|b| is_zero_key(&b)).unwrap_or(false)
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> WgctlResult<T> {
    value
        .trim()
        .parse::<T>()
        .map_err(|_| WgctlError::Parse(format!("invalid uapi value for {}: {}", key, value)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::keys::encode_key;
    use crate::reconcile::PeerUpdate;

    fn key(byte: u8) -> String {
        encode_key(&[byte; 32])
    }

    #[test]
    fn test_render_set() {
        let update = DeviceUpdate {
            private_key: Some(key(1)),
            listen_port: Some(51820),
            firewall_mark: None,
            replace_peers: false,
            peers: vec![
                PeerUpdate {
                    public_key: key(2),
                    replace_allowed_ips: true,
                    endpoint: Some("203.0.113.10:51820".to_string()),
                    persistent_keepalive: Some(25),
                    allowed_ips: vec!["10.0.0.2/32".to_string()],
                    ..Default::default()
                },
                PeerUpdate {
                    public_key: key(3),
                    remove: true,
                    ..Default::default()
                },
            ],
        };

        let rendered = render_set(&update).unwrap();
        let expected = format!(
            "set=1\nprivate_key={}\nlisten_port=51820\npublic_key={}\nendpoint=203.0.113.10:51820\npersistent_keepalive_interval=25\nreplace_allowed_ips=true\nallowed_ip=10.0.0.2/32\npublic_key={}\nremove=true\n\n",
            "01".repeat(32),
            "02".repeat(32),
            "03".repeat(32)
        );
        assert_eq!(rendered, expected);
    }

    #[test]
    fn test_render_clears_preshared_key() {
        let update = DeviceUpdate {
            peers: vec![PeerUpdate {
                public_key: key(2),
                update_only: true,
                preshared_key: Some(String::new()),
                ..Default::default()
            }],
            ..Default::default()
        };
        let rendered = render_set(&update).unwrap();
        assert!(rendered.contains("update_only=true\n"));
        assert!(rendered.contains(&format!("preshared_key={}\n", "0".repeat(64))));
    }

    #[test]
    fn test_parse_get() {
        let reply = format!(
            "private_key={}\nlisten_port=51820\nfwmark=0\npublic_key={}\npreshared_key={}\nendpoint=203.0.113.10:51820\npersistent_keepalive_interval=25\nallowed_ip=10.0.0.2/32\nallowed_ip=fd00::2/128\nlast_handshake_time_sec=1700000000\nlast_handshake_time_nsec=0\nrx_bytes=123\ntx_bytes=456\nprotocol_version=1\nerrno=0\n\n",
            "01".repeat(32),
            "02".repeat(32),
            "0".repeat(64)
        );
        let device = parse_get("utun7", &reply).unwrap();
        assert_eq!(device.wireguard.private_key, key(1));
        assert_eq!(device.wireguard.public_key, public_key_from_private(&key(1)).unwrap());
        assert_eq!(device.wireguard.listen_port, 51820);

        let peer = &device.wireguard.peers[0];
        assert_eq!(peer.public_key, key(2));
        assert!(peer.preshared_key.is_none());
        assert_eq!(peer.allowed_ips, vec!["10.0.0.2/32", "fd00::2/128"]);
        assert_eq!(peer.persistent_keepalive, Duration::from_secs(25));
        assert_eq!(peer.stats.receive_bytes, 123);
        assert_eq!(peer.stats.protocol_version, 1);
        assert_eq!(
            peer.stats.last_handshake_time.map(|t| t.timestamp()),
            Some(1_700_000_000)
        );
    }

    #[test]
    fn test_errno() {
        assert!(parse_errno("errno=0\n\n").is_ok());
        assert!(parse_errno("errno=-22\n\n").is_err());
        assert!(parse_errno("\n").is_err());
        assert!(parse_get("wg0", "errno=2\n\n").is_err());
    }
}
