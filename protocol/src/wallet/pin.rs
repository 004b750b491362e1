//! Device-side PIN check.
//!
//! A device stores a [`PinVerifier`] (salt plus digest), never the PIN.
//! Comparison is constant-time so response timing leaks nothing about how
//! many leading bytes matched.

use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use thiserror::Error;

use crate::config::{MAX_PIN_LENGTH, MIN_PIN_LENGTH};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PinError {
    #[error("PIN must be {MIN_PIN_LENGTH}-{MAX_PIN_LENGTH} digits")]
    InvalidFormat,
}

/// Salted SHA-256 digest of a member PIN.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PinVerifier {
    salt: [u8; 16],
    digest: [u8; 32],
}

impl PinVerifier {
    /// Enroll a PIN under a fresh random salt.
    pub fn new(pin: &str) -> Result<Self, PinError> {
        let mut salt = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut salt);
        Self::with_salt(pin, salt)
    }

    pub fn with_salt(pin: &str, salt: [u8; 16]) -> Result<Self, PinError> {
        if !is_well_formed(pin) {
            return Err(PinError::InvalidFormat);
        }
        Ok(Self {
            salt,
            digest: digest(&salt, pin),
        })
    }

    /// Check a candidate PIN. Malformed candidates simply fail.
    pub fn verify(&self, candidate: &str) -> bool {
        if !is_well_formed(candidate) {
            return false;
        }
        let computed = digest(&self.salt, candidate);
        computed.ct_eq(&self.digest).into()
    }
}

impl std::fmt::Debug for PinVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("PinVerifier(..)")
    }
}

fn is_well_formed(pin: &str) -> bool {
    (MIN_PIN_LENGTH..=MAX_PIN_LENGTH).contains(&pin.len()) && pin.bytes().all(|b| b.is_ascii_digit())
}

fn digest(salt: &[u8; 16], pin: &str) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(salt);
    hasher.update(pin.as_bytes());
    hasher.finalize().into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_correct_pin_verifies() {
        let v = PinVerifier::new("4821").unwrap();
        assert!(v.verify("4821"));
        assert!(!v.verify("4822"));
        assert!(!v.verify("48210"));
    }

    #[test]
    fn test_format_enforced() {
        assert_eq!(PinVerifier::new("123").unwrap_err(), PinError::InvalidFormat);
        assert_eq!(PinVerifier::new("123456789").unwrap_err(), PinError::InvalidFormat);
        assert_eq!(PinVerifier::new("12a4").unwrap_err(), PinError::InvalidFormat);
        assert!(PinVerifier::new("12345678").is_ok());
    }

    #[test]
    fn test_salt_changes_digest() {
        let a = PinVerifier::with_salt("4821", [1u8; 16]).unwrap();
        let b = PinVerifier::with_salt("4821", [2u8; 16]).unwrap();
        assert_ne!(a, b);
        assert!(a.verify("4821") && b.verify("4821"));
    }

    #[test]
    fn test_debug_hides_digest() {
        let v = PinVerifier::with_salt("4821", [1u8; 16]).unwrap();
        assert_eq!(format!("{:?}", v), "PinVerifier(..)");
    }
}
