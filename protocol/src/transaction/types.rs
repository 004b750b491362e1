//! Core type definitions for Harvest transactions.
//!
//! Identifiers are newtypes so a wallet id can never be passed where an
//! idempotency key is expected. Amounts are `u64` in the smallest currency
//! unit; the direction of a transaction comes from its [`TransactionKind`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::geo::Coordinate;

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

/// Identifier of a wallet at the authority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WalletId(Uuid);

impl WalletId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }
}

impl Default for WalletId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for WalletId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl FromStr for WalletId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Client-generated idempotency key. Unique for all time at the authority:
/// a replay with the same key never applies twice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdempotencyKey(Uuid);

impl IdempotencyKey {
    /// Fresh random (v4) key.
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }
}

impl fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl FromStr for IdempotencyKey {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Merchant reference as assigned by merchant provisioning.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MerchantId(String);

impl MerchantId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MerchantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifier of a field device. Only used for logging and cursor
/// bookkeeping; the authority never orders by device.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(String);

impl DeviceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ---------------------------------------------------------------------------
// TransactionKind
// ---------------------------------------------------------------------------

/// What a transaction does to the wallet's spent amount.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionKind {
    /// Funds returned to the wallet (repayment, co-op top-up). Lowers spent.
    Credit,
    /// Purchase against the wallet. Raises spent, bounded by the credit limit.
    Debit,
    /// Reversal of an earlier purchase. Lowers spent.
    Refund,
}

impl TransactionKind {
    pub fn is_debit(&self) -> bool {
        matches!(self, TransactionKind::Debit)
    }
}

impl fmt::Display for TransactionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Credit => write!(f, "credit"),
            Self::Debit => write!(f, "debit"),
            Self::Refund => write!(f, "refund"),
        }
    }
}

// ---------------------------------------------------------------------------
// TransactionStatus
// ---------------------------------------------------------------------------

/// Lifecycle of a transaction as seen by the device.
///
/// `Pending → Submitted → Accepted | Rejected`. A `Submitted` entry whose
/// session failed goes back to `Pending`; `Accepted` and `Rejected` are
/// final.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    Pending,
    Submitted,
    Accepted,
    Rejected,
}

impl TransactionStatus {
    pub fn is_final(&self) -> bool {
        matches!(self, Self::Accepted | Self::Rejected)
    }
}

impl fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Submitted => write!(f, "submitted"),
            Self::Accepted => write!(f, "accepted"),
            Self::Rejected => write!(f, "rejected"),
        }
    }
}

// ---------------------------------------------------------------------------
// Transaction
// ---------------------------------------------------------------------------

/// An immutable wallet transaction.
///
/// Created on-device by [`super::TransactionBuilder`]. The same record is
/// queued locally, shipped to the authority, and stored in history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    /// Idempotency key. Unique for all time.
    pub key: IdempotencyKey,

    pub wallet_id: WalletId,

    /// Device that created the transaction.
    pub device_id: DeviceId,

    /// Per-device monotonic sequence number. Assigned at enqueue.
    pub sequence: u64,

    pub kind: TransactionKind,

    /// Magnitude in the smallest currency unit. Direction comes from `kind`.
    pub amount: u64,

    pub description: String,

    /// Device wall clock at creation. Informational only: the authority
    /// orders by arrival, never by this field.
    pub client_timestamp: DateTime<Utc>,

    pub location: Option<Coordinate>,

    pub merchant: Option<MerchantId>,

    /// Nonce of the QR credential scanned for this transaction, if any.
    pub credential_nonce: Option<String>,
}

impl Transaction {
    /// Effect on the wallet balance: negative for debits, positive otherwise.
    pub fn signed_amount(&self) -> i128 {
        match self.kind {
            TransactionKind::Debit => -(self.amount as i128),
            TransactionKind::Credit | TransactionKind::Refund => self.amount as i128,
        }
    }

    /// Canonical bytes for the authority's history chain. Fixed-width
    /// integers and length-prefixed strings, so the encoding never depends
    /// on serializer field order.
    pub fn canonical_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(128 + self.description.len());
        buf.extend_from_slice(self.key.as_bytes());
        buf.extend_from_slice(self.wallet_id.as_bytes());
        push_str(&mut buf, self.device_id.as_str());
        buf.extend_from_slice(&self.sequence.to_le_bytes());
        push_str(&mut buf, &self.kind.to_string());
        buf.extend_from_slice(&self.amount.to_le_bytes());
        push_str(&mut buf, &self.description);
        buf.extend_from_slice(&self.client_timestamp.timestamp_millis().to_le_bytes());
        match &self.location {
            Some(c) => {
                buf.push(0x01);
                buf.extend_from_slice(&c.latitude().to_le_bytes());
                buf.extend_from_slice(&c.longitude().to_le_bytes());
            }
            None => buf.push(0x00),
        }
        match &self.merchant {
            Some(m) => {
                buf.push(0x01);
                push_str(&mut buf, m.as_str());
            }
            None => buf.push(0x00),
        }
        match &self.credential_nonce {
            Some(n) => {
                buf.push(0x01);
                push_str(&mut buf, n);
            }
            None => buf.push(0x00),
        }
        buf
    }
}

fn push_str(buf: &mut Vec<u8>, s: &str) {
    buf.extend_from_slice(&(s.len() as u32).to_le_bytes());
    buf.extend_from_slice(s.as_bytes());
}
