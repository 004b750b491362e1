//! # QR Credential Verifier
//!
//! Merchants and wallets identify themselves at the point of sale with a
//! short-lived signed token rendered as a QR code. Field devices verify it
//! offline against the issuer keys distributed in the wallet snapshot.
//!
//! ```text
//!   issuer (office)                      field device
//!   ───────────────                      ────────────
//!   CredentialIssuer::issue ──QR──▶ CredentialVerifier::verify
//!                                          │
//!                                          ├─ Malformed         (decode / signature / untrusted)
//!                                          ├─ Expired           (outside [iat - skew, exp])
//!                                          └─ AudienceMismatch  (minted for another context)
//! ```

pub mod token;
pub mod verifier;

pub use token::{CredentialClaims, CredentialError, CredentialIssuer, CredentialSubject, SubjectKind};
pub use verifier::{verify, CredentialVerifier, VerifiedCredential};
