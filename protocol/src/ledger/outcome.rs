//! Decisions and history records produced by the authority.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::crypto::chain_hash;
use crate::error::ErrorClass;
use crate::transaction::types::{IdempotencyKey, MerchantId, Transaction, TransactionStatus, WalletId};

// ---------------------------------------------------------------------------
// RejectionReason
// ---------------------------------------------------------------------------

/// Why the authority refused a transaction. Recorded against the
/// idempotency key forever; resubmitting never changes it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RejectionReason {
    WalletSuspended,
    WalletClosed,
    UnknownWallet,
    OutOfRange { distance_m: f64, radius_m: f64 },
    LocationRequired,
    UnknownMerchant(MerchantId),
    LimitExceeded { available: u64, requested: u64 },
    InvalidAmount,
    DescriptionTooLong { len: usize, max: usize },
    /// The scanned credential's nonce was already spent by another transaction.
    CredentialReplayed,
}

impl RejectionReason {
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::WalletSuspended
            | Self::WalletClosed
            | Self::UnknownWallet
            | Self::LimitExceeded { .. } => ErrorClass::State,
            Self::OutOfRange { .. }
            | Self::LocationRequired
            | Self::UnknownMerchant(_)
            | Self::CredentialReplayed => ErrorClass::Authorization,
            Self::InvalidAmount | Self::DescriptionTooLong { .. } => ErrorClass::Validation,
        }
    }
}

impl fmt::Display for RejectionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::WalletSuspended => write!(f, "wallet suspended"),
            Self::WalletClosed => write!(f, "wallet closed"),
            Self::UnknownWallet => write!(f, "unknown wallet"),
            Self::OutOfRange {
                distance_m,
                radius_m,
            } => write!(f, "out of range: {distance_m:.0} m from merchant (fence {radius_m:.0} m)"),
            Self::LocationRequired => write!(f, "location required"),
            Self::UnknownMerchant(m) => write!(f, "unknown merchant {m}"),
            Self::LimitExceeded {
                available,
                requested,
            } => write!(f, "limit exceeded: available {available}, requested {requested}"),
            Self::InvalidAmount => write!(f, "invalid amount"),
            Self::DescriptionTooLong { len, max } => {
                write!(f, "description too long: {len} > {max}")
            }
            Self::CredentialReplayed => write!(f, "credential already used"),
        }
    }
}

// ---------------------------------------------------------------------------
// Outcome
// ---------------------------------------------------------------------------

/// Final decision for one idempotency key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Outcome {
    Accepted {
        /// Wallet revision after this transaction was applied.
        revision: u64,
        spent_after: u64,
        balance_after: u64,
        applied_at: DateTime<Utc>,
    },
    Rejected {
        reason: RejectionReason,
        decided_at: DateTime<Utc>,
    },
}

impl Outcome {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Outcome::Accepted { .. })
    }

    pub fn status(&self) -> TransactionStatus {
        match self {
            Outcome::Accepted { .. } => TransactionStatus::Accepted,
            Outcome::Rejected { .. } => TransactionStatus::Rejected,
        }
    }

    pub fn rejection(&self) -> Option<&RejectionReason> {
        match self {
            Outcome::Rejected { reason, .. } => Some(reason),
            Outcome::Accepted { .. } => None,
        }
    }
}

/// The record the authority persists per idempotency key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionRecord {
    pub key: IdempotencyKey,
    pub wallet_id: WalletId,
    pub outcome: Outcome,
}

/// What a submitter sees: the outcome, and whether it was decided earlier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmissionResult {
    pub key: IdempotencyKey,
    pub outcome: Outcome,
    /// `true` when this key had already been decided and the stored outcome
    /// was returned unchanged.
    pub replayed: bool,
}

// ---------------------------------------------------------------------------
// LedgerEntry
// ---------------------------------------------------------------------------

/// Append-only history record of an accepted transaction.
///
/// Entries of one wallet form a BLAKE3 hash chain starting from the
/// all-zero hash. Rewriting any stored entry breaks every link after it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub transaction: Transaction,
    pub revision: u64,
    pub spent_after: u64,
    pub applied_at: DateTime<Utc>,
    pub prev_hash: [u8; 32],
    pub hash: [u8; 32],
}

impl LedgerEntry {
    pub const GENESIS_HASH: [u8; 32] = [0u8; 32];

    pub fn new(
        prev_hash: [u8; 32],
        transaction: Transaction,
        revision: u64,
        spent_after: u64,
        applied_at: DateTime<Utc>,
    ) -> Self {
        let hash = Self::compute_hash(&prev_hash, &transaction, revision, spent_after, applied_at);
        Self {
            transaction,
            revision,
            spent_after,
            applied_at,
            prev_hash,
            hash,
        }
    }

    /// Whether the stored hash matches the entry's content and `prev`.
    pub fn verify_link(&self, prev: &[u8; 32]) -> bool {
        &self.prev_hash == prev
            && self.hash
                == Self::compute_hash(
                    prev,
                    &self.transaction,
                    self.revision,
                    self.spent_after,
                    self.applied_at,
                )
    }

    pub fn hash_hex(&self) -> String {
        hex::encode(self.hash)
    }

    fn compute_hash(
        prev: &[u8; 32],
        tx: &Transaction,
        revision: u64,
        spent_after: u64,
        applied_at: DateTime<Utc>,
    ) -> [u8; 32] {
        let mut payload = tx.canonical_bytes();
        payload.extend_from_slice(&revision.to_le_bytes());
        payload.extend_from_slice(&spent_after.to_le_bytes());
        payload.extend_from_slice(&applied_at.timestamp_micros().to_le_bytes());
        chain_hash(prev, &payload)
    }
}
