//! Textual formats spoken by WireGuard tooling
//!
//! - `dump`: output of `wg show <iface> dump`
//! - `wgquick`: wg-quick style `[Interface]` / `[Peer]` documents
//! - `uapi`: the cross-platform configuration protocol of userspace daemons
//!
//! All functions here are pure; connectors feed them command output or
//! socket replies.

pub mod dump;
pub mod uapi;
pub mod wgquick;

use crate::error::{WgctlError, WgctlResult};

/// Split a comma-separated list, trimming entries and dropping empty ones
pub fn split_csv(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .collect()
}

/// Parse an integer the way wg-quick does: `0x` hex, `0o` octal, `0b` binary
/// or decimal; `off`, `(none)` and empty mean 0
pub fn parse_config_int(value: &str) -> WgctlResult<u64> {
    let value = value.trim();
    if value.is_empty() || value.eq_ignore_ascii_case("off") || value.eq_ignore_ascii_case("(none)") {
        return Ok(0);
    }

    let lower = value.to_ascii_lowercase();
    let parsed = if let Some(hex) = lower.strip_prefix("0x") {
        u64::from_str_radix(hex, 16)
    } else if let Some(oct) = lower.strip_prefix("0o") {
        u64::from_str_radix(oct, 8)
    } else if let Some(bin) = lower.strip_prefix("0b") {
        u64::from_str_radix(bin, 2)
    } else {
        lower.parse::<u64>()
    };

    parsed.map_err(|e| WgctlError::Parse(format!("invalid integer '{}': {}", value, e)))
}
