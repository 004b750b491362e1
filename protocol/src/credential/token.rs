//! QR credential encoding and issuance.
//!
//! ## Wire format
//!
//! ```text
//! hv1.<base58(claims JSON)>.<base58(ed25519 signature over claims JSON)>
//! ```
//!
//! The signature covers the exact payload bytes carried in the token, so
//! the verifier never re-serializes claims before checking them.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

use crate::config::{CREDENTIAL_PREFIX, MAX_CREDENTIAL_LIFETIME};
use crate::crypto::{IssuerKeypair, IssuerPublicKey, IssuerSignature};
use crate::transaction::types::{MerchantId, WalletId};

/// Errors minting a credential.
#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("requested lifetime {requested:?} exceeds maximum {max:?}")]
    LifetimeTooLong { requested: Duration, max: Duration },

    #[error("audience must not be empty")]
    EmptyAudience,

    #[error("failed to encode claims: {0}")]
    Encoding(#[from] serde_json::Error),
}

/// Who a credential speaks for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CredentialSubject {
    Merchant(MerchantId),
    Wallet(WalletId),
}

impl CredentialSubject {
    fn kind(&self) -> SubjectKind {
        match self {
            Self::Merchant(_) => SubjectKind::Merchant,
            Self::Wallet(_) => SubjectKind::Wallet,
        }
    }

    fn id(&self) -> String {
        match self {
            Self::Merchant(m) => m.as_str().to_string(),
            Self::Wallet(w) => w.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubjectKind {
    Merchant,
    Wallet,
}

/// Signed claims embedded in a QR token. Times are unix seconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialClaims {
    /// Base58 public key of the issuer; must be in the verifier's trust set.
    pub iss: String,
    /// Merchant reference or wallet UUID, interpreted according to `kind`.
    pub sub: String,
    /// Scanning context the token was minted for (e.g. a co-op id).
    pub aud: String,
    /// Single-use nonce, enforced by the authority.
    pub nonce: String,
    pub iat: i64,
    pub exp: i64,
    pub kind: SubjectKind,
}

impl CredentialClaims {
    /// Typed subject, or `None` when `sub` does not parse for its `kind`.
    pub fn subject(&self) -> Option<CredentialSubject> {
        match self.kind {
            SubjectKind::Merchant if !self.sub.is_empty() => {
                Some(CredentialSubject::Merchant(MerchantId::new(self.sub.clone())))
            }
            SubjectKind::Merchant => None,
            SubjectKind::Wallet => self.sub.parse().ok().map(CredentialSubject::Wallet),
        }
    }
}

/// A decoded, not yet verified token.
#[derive(Debug, Clone)]
pub(crate) struct RawToken {
    pub payload: Vec<u8>,
    pub signature: IssuerSignature,
}

impl RawToken {
    pub(crate) fn parse(token: &str) -> Option<Self> {
        let mut parts = token.trim().split('.');
        let prefix = parts.next()?;
        let payload = parts.next()?;
        let signature = parts.next()?;
        if prefix != CREDENTIAL_PREFIX || parts.next().is_some() {
            return None;
        }
        let payload = bs58::decode(payload).into_vec().ok()?;
        let signature = bs58::decode(signature).into_vec().ok()?;
        Some(Self {
            payload,
            signature: IssuerSignature::from_bytes(signature),
        })
    }
}

/// Mints credentials on behalf of a merchant or co-op office.
#[derive(Debug, Clone)]
pub struct CredentialIssuer {
    keypair: IssuerKeypair,
}

impl CredentialIssuer {
    pub fn new(keypair: IssuerKeypair) -> Self {
        Self { keypair }
    }

    pub fn public_key(&self) -> IssuerPublicKey {
        self.keypair.public_key()
    }

    /// Issue a token valid from `now` for `lifetime`.
    pub fn issue(
        &self,
        subject: CredentialSubject,
        audience: &str,
        lifetime: Duration,
        now: DateTime<Utc>,
    ) -> Result<String, CredentialError> {
        if lifetime > MAX_CREDENTIAL_LIFETIME {
            return Err(CredentialError::LifetimeTooLong {
                requested: lifetime,
                max: MAX_CREDENTIAL_LIFETIME,
            });
        }
        if audience.is_empty() {
            return Err(CredentialError::EmptyAudience);
        }

        let mut nonce = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut nonce);

        let exp = now + ChronoDuration::seconds(lifetime.as_secs() as i64);
        let claims = CredentialClaims {
            iss: self.keypair.public_key().to_base58(),
            sub: subject.id(),
            aud: audience.to_string(),
            nonce: hex::encode(nonce),
            iat: now.timestamp(),
            exp: exp.timestamp(),
            kind: subject.kind(),
        };
        Ok(self.encode(&claims)?)
    }

    /// Sign arbitrary claims. Exposed for tooling that needs to mint
    /// deliberately odd tokens (expired, future-dated) for field testing.
    pub fn encode(&self, claims: &CredentialClaims) -> Result<String, serde_json::Error> {
        let payload = serde_json::to_vec(claims)?;
        let signature = self.keypair.sign(&payload);
        Ok(format!(
            "{}.{}.{}",
            CREDENTIAL_PREFIX,
            bs58::encode(&payload).into_string(),
            bs58::encode(signature.as_bytes()).into_string()
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn issuer() -> CredentialIssuer {
        CredentialIssuer::new(IssuerKeypair::from_seed(&[3u8; 32]))
    }

    #[test]
    fn test_issued_token_has_three_parts() {
        let token = issuer()
            .issue(
                CredentialSubject::Merchant(MerchantId::new("m-1")),
                "coop-nakuru",
                Duration::from_secs(60),
                Utc::now(),
            )
            .unwrap();
        assert!(token.starts_with("hv1."));
        assert_eq!(token.split('.').count(), 3);
        assert!(RawToken::parse(&token).is_some());
    }

    #[test]
    fn test_lifetime_is_capped() {
        let err = issuer()
            .issue(
                CredentialSubject::Wallet(WalletId::new()),
                "coop-nakuru",
                Duration::from_secs(3600),
                Utc::now(),
            )
            .unwrap_err();
        assert!(matches!(err, CredentialError::LifetimeTooLong { .. }));
    }

    #[test]
    fn test_nonces_differ_between_issues() {
        let iss = issuer();
        let now = Utc::now();
        let subject = CredentialSubject::Merchant(MerchantId::new("m-1"));
        let a = iss.issue(subject.clone(), "aud", Duration::from_secs(60), now).unwrap();
        let b = iss.issue(subject, "aud", Duration::from_secs(60), now).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_claims_subject_roundtrips_kind() {
        let wallet = WalletId::new();
        let token = issuer()
            .issue(CredentialSubject::Wallet(wallet), "aud", Duration::from_secs(60), Utc::now())
            .unwrap();
        let raw = RawToken::parse(&token).unwrap();
        let claims: CredentialClaims = serde_json::from_slice(&raw.payload).unwrap();
        assert_eq!(claims.kind, SubjectKind::Wallet);
        assert_eq!(claims.subject(), Some(CredentialSubject::Wallet(wallet)));
    }

    #[test]
    fn test_parse_rejects_wrong_prefix_and_extra_parts() {
        assert!(RawToken::parse("hv2.abc.def").is_none());
        assert!(RawToken::parse("hv1.abc").is_none());
        assert!(RawToken::parse("hv1.abc.def.ghi").is_none());
        assert!(RawToken::parse("hv1.0OIl.def").is_none()); // not base58
    }
}
