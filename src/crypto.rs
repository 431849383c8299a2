//! SHA-256, HMAC-SHA-256, Merkle root, and proof-of-work hash primitives (C1).

use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

type HmacSha256 = Hmac<Sha256>;

/// SHA-256 of `data`, returned as the raw 32-byte digest.
pub fn sha256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// SHA-256 of `data`, hex-encoded.
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(sha256(data))
}

/// hex(HMAC-SHA-256(secret, message)).
///
/// `secret` is typically a company's signing key; `message` is the
/// canonicalized payload concatenated with a nonce (see `envelope.rs`).
pub fn hmac_sha256_hex(secret: &[u8], message: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(secret).expect("HMAC accepts keys of any length");
    mac.update(message);
    hex::encode(mac.finalize().into_bytes())
}

/// Constant-time verification of a hex-encoded HMAC-SHA-256 tag.
///
/// Returns `false` on malformed hex input rather than erroring, since a
/// caller only cares whether the signature matches.
pub fn hmac_sha256_verify(secret: &[u8], message: &[u8], expected_hex: &str) -> bool {
    let Ok(expected) = hex::decode(expected_hex) else {
        return false;
    };
    let mut mac = HmacSha256::new_from_slice(secret).expect("HMAC accepts keys of any length");
    mac.update(message);
    mac.verify_slice(&expected).is_ok()
}

/// Binary Merkle root over ordered leaves, SHA-256 internal nodes,
/// duplicate-last-on-odd. Leaves are already-hashed 32-byte values
/// (e.g. `payload_hash`es), not raw payloads.
///
/// Per the data model, an empty input must never occur for a well-formed
/// Batch; callers should guard against it before calling this function.
/// A caller that does pass an empty slice gets the all-zero root rather
/// than a panic.
pub fn merkle_root(leaves: &[[u8; 32]]) -> [u8; 32] {
    if leaves.is_empty() {
        return [0u8; 32];
    }
    let mut level: Vec<[u8; 32]> = leaves.to_vec();
    while level.len() > 1 {
        let mut next = Vec::with_capacity(level.len().div_ceil(2));
        let mut i = 0;
        while i < level.len() {
            let left = level[i];
            let right = if i + 1 < level.len() { level[i + 1] } else { level[i] };
            let mut buf = Vec::with_capacity(64);
            buf.extend_from_slice(&left);
            buf.extend_from_slice(&right);
            next.push(sha256(&buf));
            i += 2;
        }
        level = next;
    }
    level[0]
}

/// `⌊unix_seconds / 3600⌋`. Binds proof-of-work to a one-hour window.
pub fn hour_bucket(unix_seconds: u64) -> u64 {
    unix_seconds / 3600
}

/// Builds the proof-of-work preimage:
/// `miner ∥ batch_id ∥ events_count ∥ merkle_root ∥ hour_bucket ∥ nonce`.
pub fn pow_preimage(
    miner: &str,
    batch_id: &str,
    events_count: u64,
    merkle_root: &[u8; 32],
    bucket: u64,
    nonce: u64,
) -> Vec<u8> {
    let mut buf = Vec::with_capacity(miner.len() + batch_id.len() + 32 + 32);
    buf.extend_from_slice(miner.as_bytes());
    buf.extend_from_slice(batch_id.as_bytes());
    buf.extend_from_slice(&events_count.to_be_bytes());
    buf.extend_from_slice(merkle_root);
    buf.extend_from_slice(&bucket.to_be_bytes());
    buf.extend_from_slice(&nonce.to_be_bytes());
    buf
}

/// Number of leading hex-zero characters in a digest.
pub fn leading_hex_zeros(digest: &[u8; 32]) -> u32 {
    let hex_str = hex::encode(digest);
    hex_str.chars().take_while(|c| *c == '0').count() as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hmac_is_deterministic_and_nonce_sensitive() {
        let secret = b"super-secret-key-that-is-long-enough";
        let msg_a = b"canonical-payload-nonce-aaaa";
        let msg_b = b"canonical-payload-nonce-bbbb";
        let sig_a1 = hmac_sha256_hex(secret, msg_a);
        let sig_a2 = hmac_sha256_hex(secret, msg_a);
        let sig_b = hmac_sha256_hex(secret, msg_b);
        assert_eq!(sig_a1, sig_a2);
        assert_ne!(sig_a1, sig_b);
        assert!(hmac_sha256_verify(secret, msg_a, &sig_a1));
        assert!(!hmac_sha256_verify(secret, msg_a, &sig_b));
    }

    #[test]
    fn merkle_root_matches_scenario_s4() {
        // S4: three leaves, odd count duplicates the last at the first level.
        let h1 = sha256(b"e1");
        let h2 = sha256(b"e2");
        let h3 = sha256(b"e3");
        let mut left = Vec::new();
        left.extend_from_slice(&h1);
        left.extend_from_slice(&h2);
        let node_left = sha256(&left);
        let mut right = Vec::new();
        right.extend_from_slice(&h3);
        right.extend_from_slice(&h3);
        let node_right = sha256(&right);
        let mut top = Vec::new();
        top.extend_from_slice(&node_left);
        top.extend_from_slice(&node_right);
        let expected = sha256(&top);

        assert_eq!(merkle_root(&[h1, h2, h3]), expected);
    }

    #[test]
    fn merkle_root_changes_when_leaves_swap() {
        let h1 = sha256(b"e1");
        let h2 = sha256(b"e2");
        let h3 = sha256(b"e3");
        let h4 = sha256(b"e4");
        let root_a = merkle_root(&[h1, h2, h3, h4]);
        let root_b = merkle_root(&[h2, h1, h3, h4]);
        assert_ne!(root_a, root_b);
    }

    #[test]
    fn leading_zeros_counts_correctly() {
        let mut digest = [0xffu8; 32];
        digest[0] = 0x00;
        assert_eq!(leading_hex_zeros(&digest), 2);
        digest[1] = 0x0f;
        assert_eq!(leading_hex_zeros(&digest), 3);
    }
}
