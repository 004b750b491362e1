//! # Hashing Utilities
//!
//! - **BLAKE3** for Harvest-native structures: the per-wallet history chain.
//! - **SHA-256** for the PIN verifier, where the salted-digest format is
//!   shared with the enrollment tooling.

use sha2::{Digest, Sha256};

/// BLAKE3 digest of `data`.
pub fn blake3_hash(data: &[u8]) -> [u8; 32] {
    *blake3::hash(data).as_bytes()
}

/// SHA-256 digest of `data`.
pub fn sha256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Link a payload into a hash chain: `BLAKE3(prev || payload)`.
///
/// The first entry of every chain links to the all-zero hash.
pub fn chain_hash(prev: &[u8; 32], payload: &[u8]) -> [u8; 32] {
    let mut hasher = blake3::Hasher::new();
    hasher.update(prev);
    hasher.update(payload);
    *hasher.finalize().as_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sha256_known_vector() {
        // SHA-256("abc") from FIPS 180-2.
        assert_eq!(
            hex::encode(sha256(b"abc")),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_chain_hash_depends_on_prev() {
        let a = chain_hash(&[0u8; 32], b"entry");
        let b = chain_hash(&[1u8; 32], b"entry");
        assert_ne!(a, b);
        assert_eq!(a, chain_hash(&[0u8; 32], b"entry"));
    }

    #[test]
    fn test_blake3_differs_from_sha256() {
        assert_ne!(blake3_hash(b"harvest"), sha256(b"harvest"));
    }
}
