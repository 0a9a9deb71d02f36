use serde::Serialize;
use sha2::{Digest, Sha256};

/// Lowercase hex SHA-256 of `bytes`.
pub fn sha256_hex(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

/// Serialize `value` to compact JSON and return `(sha256 hex, byte length)`.
///
/// `serde_json::Map` is BTreeMap-backed, so object keys come out sorted and
/// the digest is stable for equal values.
pub fn json_digest<T: Serialize + ?Sized>(value: &T) -> Result<(String, u64), serde_json::Error> {
    let bytes = serde_json::to_vec(value)?;
    Ok((sha256_hex(&bytes), bytes.len() as u64))
}
