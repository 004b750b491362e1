//! # Cryptographic Primitives
//!
//! Thin, type-safe wrappers over audited implementations:
//!
//! - **Ed25519** (`ed25519-dalek`) signs QR credentials.
//! - **BLAKE3** chains the authority's per-wallet history.
//! - **SHA-256** digests PINs for the on-device verifier.
//!
//! Nothing here is novel. If you're tempted to optimize it, don't.

pub mod hash;
pub mod keys;

pub use hash::{blake3_hash, chain_hash, sha256};
pub use keys::{IssuerKeypair, IssuerPublicKey, IssuerSignature, KeyError};
