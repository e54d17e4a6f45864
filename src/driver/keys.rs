//! WireGuard key handling
//!
//! Keys travel through the model as base64 strings, the same form `wg`,
//! wg-quick documents, NetworkManager and RouterOS use. The raw 32-byte form
//! only appears at the netlink and UAPI edges.

use crate::error::{WgctlError, WgctlResult};
use crate::validation::{decode_key, KEY_LEN};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use rand::rngs::OsRng;
use x25519_dalek::{PublicKey, StaticSecret};

/// Generate a new base64 private key
pub fn generate_private_key() -> String {
    let secret = StaticSecret::random_from_rng(OsRng);
    BASE64.encode(secret.to_bytes())
}

/// Derive the base64 public key for a base64 private key
pub fn public_key_from_private(private_key: &str) -> WgctlResult<String> {
    let bytes = decode_key(private_key)?;
    Ok(encode_key(&public_key_bytes(bytes)))
}

/// Derive the raw public key for a raw private key
pub fn public_key_bytes(private_key: [u8; KEY_LEN]) -> [u8; KEY_LEN] {
    let secret = StaticSecret::from(private_key);
    PublicKey::from(&secret).to_bytes()
}

pub fn encode_key(bytes: &[u8; KEY_LEN]) -> String {
    BASE64.encode(bytes)
}

/// Convert a base64 key to the lowercase hex form used by the UAPI protocol
pub fn key_to_hex(key: &str) -> WgctlResult<String> {
    Ok(hex::encode(decode_key(key)?))
}

/// Convert a hex UAPI key back to base64
pub fn key_from_hex(value: &str) -> WgctlResult<String> {
    let bytes = hex::decode(value.trim())
        .map_err(|e| WgctlError::Parse(format!("invalid hex key: {}", e)))?;
    let bytes: [u8; KEY_LEN] = bytes
        .try_into()
        .map_err(|_| WgctlError::Parse(format!("hex key must be {} bytes", KEY_LEN)))?;
    Ok(encode_key(&bytes))
}

/// All-zero keys mean "unset" on every transport that reports raw keys
pub fn is_zero_key(bytes: &[u8]) -> bool {
    bytes.iter().all(|b| *b == 0)
}
