//! # Key Management
//!
//! Ed25519 keypairs for credential issuers (merchants, co-op offices) and
//! the public halves that devices and the authority trust.
//!
//! Private keys never leave the issuer. Devices only ever hold
//! [`IssuerPublicKey`] values, distributed with the wallet snapshot.

use ed25519_dalek::{Signature as DalekSignature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::config::SIGNATURE_LENGTH;

/// Errors that can occur during key operations.
///
/// Deliberately terse: the reason a key failed to parse is not something
/// to echo back to whoever supplied it.
#[derive(Debug, Error)]
pub enum KeyError {
    #[error("invalid secret key bytes")]
    InvalidSecretKey,

    #[error("invalid public key bytes")]
    InvalidPublicKey,

    #[error("invalid signature bytes: expected {SIGNATURE_LENGTH} bytes")]
    InvalidSignature,
}

// ---------------------------------------------------------------------------
// IssuerKeypair
// ---------------------------------------------------------------------------

/// Signing identity of a credential issuer.
///
/// Intentionally not `Serialize`. Exporting secret material is an explicit
/// call to [`secret_key_hex`](Self::secret_key_hex), never a side effect of
/// dumping a struct to JSON.
pub struct IssuerKeypair {
    signing_key: SigningKey,
}

impl IssuerKeypair {
    /// Generate a fresh keypair from the OS RNG.
    pub fn generate() -> Self {
        Self {
            signing_key: SigningKey::generate(&mut OsRng),
        }
    }

    /// Deterministic keypair from a 32-byte seed. Tests and fixtures only
    /// should reach for this with anything but CSPRNG output.
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(seed),
        }
    }

    /// Load a keypair from a hex-encoded 32-byte secret.
    pub fn from_hex(hex_str: &str) -> Result<Self, KeyError> {
        let bytes = hex::decode(hex_str.trim()).map_err(|_| KeyError::InvalidSecretKey)?;
        let seed: [u8; 32] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| KeyError::InvalidSecretKey)?;
        Ok(Self::from_seed(&seed))
    }

    /// Hex-encoded secret. Handle with care.
    pub fn secret_key_hex(&self) -> String {
        hex::encode(self.signing_key.to_bytes())
    }

    pub fn public_key(&self) -> IssuerPublicKey {
        IssuerPublicKey {
            bytes: self.signing_key.verifying_key().to_bytes(),
        }
    }

    /// Sign a message. Ed25519 is deterministic, so the same message always
    /// yields the same signature.
    pub fn sign(&self, message: &[u8]) -> IssuerSignature {
        IssuerSignature {
            bytes: self.signing_key.sign(message).to_bytes().to_vec(),
        }
    }
}

impl Clone for IssuerKeypair {
    fn clone(&self) -> Self {
        Self::from_seed(&self.signing_key.to_bytes())
    }
}

impl fmt::Debug for IssuerKeypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Never print secret material, not even partially.
        write!(f, "IssuerKeypair(pub={})", self.public_key().to_base58())
    }
}

// ---------------------------------------------------------------------------
// IssuerPublicKey
// ---------------------------------------------------------------------------

/// Public half of an issuer identity. Safe to ship to every device.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IssuerPublicKey {
    bytes: [u8; 32],
}

impl IssuerPublicKey {
    /// Parse from raw bytes, rejecting points that aren't valid Ed25519 keys.
    pub fn try_from_slice(slice: &[u8]) -> Result<Self, KeyError> {
        let bytes: [u8; 32] = slice.try_into().map_err(|_| KeyError::InvalidPublicKey)?;
        VerifyingKey::from_bytes(&bytes).map_err(|_| KeyError::InvalidPublicKey)?;
        Ok(Self { bytes })
    }

    /// Parse a base58 string (the form printed in provisioning files).
    pub fn from_base58(s: &str) -> Result<Self, KeyError> {
        let bytes = bs58::decode(s)
            .into_vec()
            .map_err(|_| KeyError::InvalidPublicKey)?;
        Self::try_from_slice(&bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.bytes
    }

    pub fn to_base58(&self) -> String {
        bs58::encode(self.bytes).into_string()
    }

    /// Strict verification. A boolean because callers only care whether
    /// the signature holds, and a detailed failure reason is an oracle.
    pub fn verify(&self, message: &[u8], signature: &IssuerSignature) -> bool {
        let Ok(verifying_key) = VerifyingKey::from_bytes(&self.bytes) else {
            return false;
        };
        let Ok(sig_bytes) = <[u8; SIGNATURE_LENGTH]>::try_from(signature.bytes.as_slice()) else {
            return false;
        };
        let sig = DalekSignature::from_bytes(&sig_bytes);
        verifying_key.verify_strict(message, &sig).is_ok()
    }
}

impl fmt::Debug for IssuerPublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "IssuerPublicKey({})", self.to_base58())
    }
}

impl fmt::Display for IssuerPublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_base58())
    }
}

// ---------------------------------------------------------------------------
// IssuerSignature
// ---------------------------------------------------------------------------

/// An Ed25519 signature. Kept as a `Vec<u8>` so a wrong-length signature
/// off the wire simply fails verification instead of failing to parse.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssuerSignature {
    bytes: Vec<u8>,
}

impl IssuerSignature {
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_and_verify() {
        let kp = IssuerKeypair::generate();
        let sig = kp.sign(b"market stall 7");
        assert!(kp.public_key().verify(b"market stall 7", &sig));
    }

    #[test]
    fn test_wrong_key_fails() {
        let kp1 = IssuerKeypair::generate();
        let kp2 = IssuerKeypair::generate();
        let sig = kp1.sign(b"payload");
        assert!(!kp2.public_key().verify(b"payload", &sig));
    }

    #[test]
    fn test_truncated_signature_fails_cleanly() {
        let kp = IssuerKeypair::generate();
        let mut bytes = kp.sign(b"payload").as_bytes().to_vec();
        bytes.truncate(40);
        assert!(!kp.public_key().verify(b"payload", &IssuerSignature::from_bytes(bytes)));
    }

    #[test]
    fn test_hex_roundtrip_preserves_identity() {
        let kp = IssuerKeypair::generate();
        let restored = IssuerKeypair::from_hex(&kp.secret_key_hex()).unwrap();
        assert_eq!(kp.public_key(), restored.public_key());
    }

    #[test]
    fn test_base58_public_key_parse() {
        let kp = IssuerKeypair::from_seed(&[7u8; 32]);
        let pk = IssuerPublicKey::from_base58(&kp.public_key().to_base58()).unwrap();
        assert_eq!(pk, kp.public_key());
        assert!(IssuerPublicKey::from_base58("not-base58!").is_err());
    }

    #[test]
    fn test_debug_hides_secret() {
        let kp = IssuerKeypair::from_seed(&[9u8; 32]);
        let dbg = format!("{:?}", kp);
        assert!(!dbg.contains(&kp.secret_key_hex()));
    }
}
