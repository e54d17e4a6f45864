//! `wg show <iface> dump` parser
//!
//! Line 1 describes the interface:
//! `private_key  public_key  listen_port  fwmark`
//!
//! Every following line is one peer:
//! `public_key  preshared_key  endpoint  allowed_ips  latest_handshake  rx  tx  keepalive`

use chrono::DateTime;
use std::time::Duration;

use crate::driver::{Device, Peer, PeerStats};
use crate::error::{WgctlError, WgctlResult};

use super::{parse_config_int, split_csv};

const INTERFACE_FIELDS: usize = 4;
const PEER_FIELDS: usize = 8;

/// Parse dump output for interface `name`
pub fn parse_dump(name: &str, output: &str) -> WgctlResult<Device> {
    let mut lines = output.lines().filter(|l| !l.trim().is_empty());

    let header = lines
        .next()
        .ok_or_else(|| WgctlError::Parse("wireguard dump output is empty".to_string()))?;
    let fields = split_fields(header);
    if fields.len() < INTERFACE_FIELDS {
        return Err(WgctlError::Parse(format!("invalid interface dump line: {:?}", header)));
    }

    let listen_port = strict_number(fields[2])
        .and_then(|v| u16::try_from(v).map_err(|e| e.to_string()))
        .map_err(|e| WgctlError::Parse(format!("failed to parse listen port: {}", e)))?;
    // `wg` prints the mark in hex
    let firewall_mark = parse_config_int(fields[3])
        .map_err(|e| e.to_string())
        .and_then(|v| u32::try_from(v).map_err(|e| e.to_string()))
        .map_err(|e| WgctlError::Parse(format!("failed to parse firewall mark: {}", e)))?;

    let mut device = Device::named(name);
    device.wireguard.private_key = dump_string(fields[0]).unwrap_or_default();
    device.wireguard.public_key = dump_string(fields[1]).unwrap_or_default();
    device.wireguard.listen_port = listen_port;
    device.wireguard.firewall_mark = firewall_mark;

    for line in lines {
        device.wireguard.peers.push(parse_peer_line(line)?);
    }

    Ok(device)
}

fn parse_peer_line(line: &str) -> WgctlResult<Peer> {
    let fields = split_fields(line);
    if fields.len() < PEER_FIELDS {
        return Err(WgctlError::Parse(format!("invalid peer dump line: {:?}", line)));
    }

    let public_key = dump_string(fields[0])
        .ok_or_else(|| WgctlError::Parse(format!("peer without public key: {:?}", line)))?;

    let allowed_ips = match dump_string(fields[3]) {
        Some(list) => split_csv(&list),
        None => Vec::new(),
    };

    let handshake = lenient_number(fields[4]);
    let last_handshake_time = if handshake > 0 {
        DateTime::from_timestamp(handshake as i64, 0)
    } else {
        None
    };

    Ok(Peer {
        public_key,
        preshared_key: dump_string(fields[1]),
        endpoint: dump_string(fields[2]),
        allowed_ips,
        persistent_keepalive: Duration::from_secs(lenient_number(fields[7])),
        stats: PeerStats {
            endpoint: dump_string(fields[2]),
            last_handshake_time,
            receive_bytes: lenient_number(fields[5]),
            transmit_bytes: lenient_number(fields[6]),
            protocol_version: 0,
        },
        ..Default::default()
    })
}

/// Tab separated, falling back to any whitespace when no tab is present
fn split_fields(line: &str) -> Vec<&str> {
    if line.contains('\t') {
        line.split('\t').map(str::trim).collect()
    } else {
        line.split_whitespace().collect()
    }
}

fn dump_string(value: &str) -> Option<String> {
    let value = value.trim();
    if value.is_empty() || value == "(none)" {
        None
    } else {
        Some(value.to_string())
    }
}

fn is_absent(value: &str) -> bool {
    let value = value.trim();
    value.is_empty() || value == "off" || value == "(none)"
}

fn strict_number(value: &str) -> Result<u64, String> {
    if is_absent(value) {
        return Ok(0);
    }
    value.trim().parse::<u64>().map_err(|e| format!("'{}': {}", value.trim(), e))
}

/// Counters and timestamps are informational; garbage reads as 0
fn lenient_number(value: &str) -> u64 {
    strict_number(value).unwrap_or(0)
}
