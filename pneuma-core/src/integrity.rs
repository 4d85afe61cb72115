//! Integrity: bind a `RoutingRequest` to the prompt that travels out-of-band.

use sha2::{Digest, Sha256};

/// Hex SHA-256 of the UTF-8 prompt. Always 64 lowercase hex characters.
pub fn hash_payload(payload: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(payload.as_bytes());
    hex::encode(hasher.finalize())
}

/// Verify a decrypted prompt against the hash announced in its request.
pub fn verify_payload(payload: &str, expected_hash: &str) -> bool {
    hash_payload(payload).eq_ignore_ascii_case(expected_hash)
}
