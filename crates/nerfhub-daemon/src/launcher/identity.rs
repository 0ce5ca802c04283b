//! Deterministic viewer identity.

use sha2::{Digest, Sha256};

/// Key shared by every start request for the same checkpoint and port.
///
/// First eight bytes of SHA-256 over `"{load_config}:{port}"`, read as a
/// big-endian integer and printed in decimal.
pub fn identity_key(load_config: &str, port: u16) -> String {
    let digest = Sha256::digest(format!("{load_config}:{port}").as_bytes());
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(prefix).to_string()
}
