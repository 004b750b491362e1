//! Transaction construction via the builder pattern.
//!
//! [`TransactionBuilder`] sets sensible defaults (fresh idempotency key,
//! current wall clock, empty description) so call sites only name what
//! they care about. The local queue overrides `key` and `sequence` at
//! enqueue time; tests pin them for determinism.

use chrono::{DateTime, Utc};

use super::types::{
    DeviceId, IdempotencyKey, MerchantId, Transaction, TransactionKind, WalletId,
};
use crate::geo::Coordinate;

/// Fluent builder for [`Transaction`].
///
/// # Example
///
/// ```
/// use harvest_protocol::transaction::{TransactionBuilder, TransactionKind, WalletId};
///
/// let tx = TransactionBuilder::new(WalletId::new(), TransactionKind::Debit, 2_500)
///     .description("maize seed, 10kg")
///     .build();
/// assert_eq!(tx.amount, 2_500);
/// ```
#[derive(Debug, Clone)]
pub struct TransactionBuilder {
    key: Option<IdempotencyKey>,
    wallet_id: WalletId,
    device_id: DeviceId,
    sequence: u64,
    kind: TransactionKind,
    amount: u64,
    description: String,
    client_timestamp: Option<DateTime<Utc>>,
    location: Option<Coordinate>,
    merchant: Option<MerchantId>,
    credential_nonce: Option<String>,
}

impl TransactionBuilder {
    pub fn new(wallet_id: WalletId, kind: TransactionKind, amount: u64) -> Self {
        Self {
            key: None,
            wallet_id,
            device_id: DeviceId::new("unassigned"),
            sequence: 0,
            kind,
            amount,
            description: String::new(),
            client_timestamp: None,
            location: None,
            merchant: None,
            credential_nonce: None,
        }
    }

    /// Pin the idempotency key. Without this a fresh key is generated.
    pub fn key(mut self, key: IdempotencyKey) -> Self {
        self.key = Some(key);
        self
    }

    pub fn device(mut self, device_id: DeviceId) -> Self {
        self.device_id = device_id;
        self
    }

    pub fn sequence(mut self, sequence: u64) -> Self {
        self.sequence = sequence;
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn timestamp(mut self, ts: DateTime<Utc>) -> Self {
        self.client_timestamp = Some(ts);
        self
    }

    pub fn location(mut self, location: Coordinate) -> Self {
        self.location = Some(location);
        self
    }

    pub fn merchant(mut self, merchant: MerchantId) -> Self {
        self.merchant = Some(merchant);
        self
    }

    pub fn credential_nonce(mut self, nonce: impl Into<String>) -> Self {
        self.credential_nonce = Some(nonce.into());
        self
    }

    pub fn build(self) -> Transaction {
        Transaction {
            key: self.key.unwrap_or_else(IdempotencyKey::generate),
            wallet_id: self.wallet_id,
            device_id: self.device_id,
            sequence: self.sequence,
            kind: self.kind,
            amount: self.amount,
            description: self.description,
            client_timestamp: self.client_timestamp.unwrap_or_else(Utc::now),
            location: self.location,
            merchant: self.merchant,
            credential_nonce: self.credential_nonce,
        }
    }
}
