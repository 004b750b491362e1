//! Offline credential verification.
//!
//! Verification is pure: it reads the token, the trusted issuer set and a
//! caller-supplied clock, and touches nothing else. Replay protection is
//! the authority's job (it records every nonce it has accepted).

use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::time::Duration;

use super::token::{CredentialClaims, CredentialSubject, RawToken};
use crate::config::CREDENTIAL_CLOCK_SKEW;
use crate::crypto::IssuerPublicKey;
use crate::error::AuthorizationError;

/// A credential that passed every check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedCredential {
    pub subject: CredentialSubject,
    pub nonce: String,
    pub issuer: IssuerPublicKey,
    pub expires_at: DateTime<Utc>,
}

/// Verifies QR tokens against a set of trusted issuer keys.
#[derive(Debug, Clone)]
pub struct CredentialVerifier {
    trusted: HashSet<IssuerPublicKey>,
    skew: Duration,
}

impl CredentialVerifier {
    pub fn new(trusted: impl IntoIterator<Item = IssuerPublicKey>) -> Self {
        Self {
            trusted: trusted.into_iter().collect(),
            skew: CREDENTIAL_CLOCK_SKEW,
        }
    }

    /// Override the clock skew tolerance (default 30 s).
    pub fn with_skew(mut self, skew: Duration) -> Self {
        self.skew = skew;
        self
    }

    pub fn trusts(&self, key: &IssuerPublicKey) -> bool {
        self.trusted.contains(key)
    }

    /// Decode and check `token`.
    ///
    /// Checks run in a fixed order: structure and signature (`Malformed`),
    /// validity window (`Expired`), then audience (`AudienceMismatch`).
    pub fn verify(
        &self,
        token: &str,
        expected_audience: &str,
        now: DateTime<Utc>,
    ) -> Result<VerifiedCredential, AuthorizationError> {
        let raw = RawToken::parse(token).ok_or(AuthorizationError::Malformed)?;
        let claims: CredentialClaims =
            serde_json::from_slice(&raw.payload).map_err(|_| AuthorizationError::Malformed)?;

        let issuer = IssuerPublicKey::from_base58(&claims.iss)
            .map_err(|_| AuthorizationError::Malformed)?;
        if !self.trusted.contains(&issuer) || !issuer.verify(&raw.payload, &raw.signature) {
            return Err(AuthorizationError::Malformed);
        }
        let subject = claims.subject().ok_or(AuthorizationError::Malformed)?;
        if claims.nonce.is_empty() || claims.exp < claims.iat {
            return Err(AuthorizationError::Malformed);
        }

        let skew = self.skew.as_secs() as i64;
        let now_s = now.timestamp();
        if now_s < claims.iat.saturating_sub(skew) || now_s > claims.exp {
            return Err(AuthorizationError::Expired);
        }

        if claims.aud != expected_audience {
            return Err(AuthorizationError::AudienceMismatch {
                expected: expected_audience.to_string(),
                actual: claims.aud,
            });
        }

        let expires_at =
            DateTime::<Utc>::from_timestamp(claims.exp, 0).ok_or(AuthorizationError::Malformed)?;

        Ok(VerifiedCredential {
            subject,
            nonce: claims.nonce,
            issuer,
            expires_at,
        })
    }
}

/// One-shot verification without building a [`CredentialVerifier`].
pub fn verify(
    token: &str,
    expected_audience: &str,
    trusted: &[IssuerPublicKey],
    now: DateTime<Utc>,
) -> Result<VerifiedCredential, AuthorizationError> {
    CredentialVerifier::new(trusted.iter().copied()).verify(token, expected_audience, now)
}
