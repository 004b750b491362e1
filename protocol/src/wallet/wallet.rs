//! # Co-op Wallet
//!
//! A [`Wallet`] is a credit line a co-op extends to one of its members.
//! The member draws against it with debits; repayments and refunds give
//! headroom back.
//!
//! ## State Machine
//!
//! ```text
//!    ┌──────────┐  suspend   ┌───────────┐
//!    │  Active  │ ─────────▶ │ Suspended │
//!    └────┬─────┘ ◀───────── └─────┬─────┘
//!         │       reactivate       │
//!         │ close                  │ close
//!         ▼                        ▼
//!    ┌─────────────────────────────────┐
//!    │             Closed              │ ← terminal, nothing is accepted
//!    └─────────────────────────────────┘
//! ```
//!
//! ## Invariant
//!
//! `0 ≤ spent ≤ credit_limit` after every mutation, and the balance is
//! always derived as `credit_limit - spent`. It is never stored on its own,
//! so the two can't drift apart.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::crypto::IssuerPublicKey;
use crate::geo::Geofence;
use crate::transaction::types::{MerchantId, TransactionKind, WalletId};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors from mutating a wallet record.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WalletError {
    /// A debit would push spent past the credit limit.
    #[error("credit limit exceeded: available {available}, requested {requested}")]
    LimitExceeded { available: u64, requested: u64 },

    /// The wallet does not accept transactions in its current status.
    #[error("wallet is {0}")]
    NotActive(WalletStatus),

    /// The requested status change is not a legal transition.
    #[error("cannot move wallet from {from} to {to}")]
    InvalidTransition { from: WalletStatus, to: WalletStatus },

    /// Lowering the limit below what is already spent would break the invariant.
    #[error("credit limit {limit} is below spent amount {spent}")]
    LimitBelowSpent { limit: u64, spent: u64 },

    #[error("zero-amount transactions are not permitted")]
    ZeroAmount,
}

// ---------------------------------------------------------------------------
// WalletStatus
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WalletStatus {
    Active,
    /// Temporarily barred (missed repayment, compliance review).
    Suspended,
    Closed,
}

impl WalletStatus {
    pub fn accepts_transactions(&self) -> bool {
        matches!(self, WalletStatus::Active)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, WalletStatus::Closed)
    }
}

impl fmt::Display for WalletStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Active => write!(f, "active"),
            Self::Suspended => write!(f, "suspended"),
            Self::Closed => write!(f, "closed"),
        }
    }
}

// ---------------------------------------------------------------------------
// Wallet
// ---------------------------------------------------------------------------

/// The authority's record of a wallet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Wallet {
    pub id: WalletId,

    /// Member reference from the co-op's registry. Opaque here.
    pub owner: String,

    pub credit_limit: u64,

    /// Cumulative amount drawn and not yet repaid.
    ///
    /// Invariant: `spent <= credit_limit` (enforced by [`apply`](Self::apply)).
    pub spent: u64,

    pub status: WalletStatus,

    /// Bumped on every mutation. Devices use it to tell whether their
    /// snapshot is stale.
    pub revision: u64,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Wallet {
    pub fn new(id: WalletId, owner: impl Into<String>, credit_limit: u64, now: DateTime<Utc>) -> Self {
        Self {
            id,
            owner: owner.into(),
            credit_limit,
            spent: 0,
            status: WalletStatus::Active,
            revision: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// `credit_limit - spent`.
    pub fn balance(&self) -> u64 {
        self.credit_limit.saturating_sub(self.spent)
    }

    /// Apply a transaction's effect on `spent`.
    ///
    /// Debits fail with [`WalletError::LimitExceeded`] instead of
    /// overdrawing. Credits and refunds saturate at zero spent.
    pub fn apply(
        &mut self,
        kind: TransactionKind,
        amount: u64,
        now: DateTime<Utc>,
    ) -> Result<(), WalletError> {
        if !self.status.accepts_transactions() {
            return Err(WalletError::NotActive(self.status));
        }
        if amount == 0 {
            return Err(WalletError::ZeroAmount);
        }

        match kind {
            TransactionKind::Debit => {
                let available = self.balance();
                if amount > available {
                    return Err(WalletError::LimitExceeded {
                        available,
                        requested: amount,
                    });
                }
                self.spent += amount;
            }
            TransactionKind::Credit | TransactionKind::Refund => {
                self.spent = self.spent.saturating_sub(amount);
            }
        }
        self.touch(now);
        Ok(())
    }

    pub fn set_credit_limit(&mut self, limit: u64, now: DateTime<Utc>) -> Result<(), WalletError> {
        if self.status.is_terminal() {
            return Err(WalletError::NotActive(self.status));
        }
        if limit < self.spent {
            return Err(WalletError::LimitBelowSpent {
                limit,
                spent: self.spent,
            });
        }
        self.credit_limit = limit;
        self.touch(now);
        Ok(())
    }

    pub fn suspend(&mut self, now: DateTime<Utc>) -> Result<(), WalletError> {
        self.transition(WalletStatus::Active, WalletStatus::Suspended, now)
    }

    pub fn reactivate(&mut self, now: DateTime<Utc>) -> Result<(), WalletError> {
        self.transition(WalletStatus::Suspended, WalletStatus::Active, now)
    }

    /// Close permanently. Allowed from any non-terminal status.
    pub fn close(&mut self, now: DateTime<Utc>) -> Result<(), WalletError> {
        if self.status.is_terminal() {
            return Err(WalletError::InvalidTransition {
                from: self.status,
                to: WalletStatus::Closed,
            });
        }
        self.status = WalletStatus::Closed;
        self.touch(now);
        Ok(())
    }

    /// The device-facing view of this wallet.
    pub fn snapshot(
        &self,
        geofences: Vec<Geofence>,
        trusted_issuers: Vec<IssuerPublicKey>,
        now: DateTime<Utc>,
    ) -> WalletSnapshot {
        WalletSnapshot {
            wallet_id: self.id,
            credit_limit: self.credit_limit,
            spent: self.spent,
            balance: self.balance(),
            status: self.status,
            revision: self.revision,
            geofences,
            trusted_issuers,
            taken_at: now,
        }
    }

    fn transition(
        &mut self,
        from: WalletStatus,
        to: WalletStatus,
        now: DateTime<Utc>,
    ) -> Result<(), WalletError> {
        if self.status != from {
            return Err(WalletError::InvalidTransition {
                from: self.status,
                to,
            });
        }
        self.status = to;
        self.touch(now);
        Ok(())
    }

    fn touch(&mut self, now: DateTime<Utc>) {
        self.revision += 1;
        self.updated_at = now;
    }
}

// ---------------------------------------------------------------------------
// WalletSnapshot
// ---------------------------------------------------------------------------

/// A device's cached copy of the authority's view of one wallet, plus the
/// rule inputs (geofences, trusted issuers) needed to validate offline.
///
/// Refreshed on every sync. Never authoritative.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WalletSnapshot {
    pub wallet_id: WalletId,
    pub credit_limit: u64,
    pub spent: u64,
    pub balance: u64,
    pub status: WalletStatus,
    pub revision: u64,
    pub geofences: Vec<Geofence>,
    pub trusted_issuers: Vec<IssuerPublicKey>,
    pub taken_at: DateTime<Utc>,
}

impl WalletSnapshot {
    pub fn geofence_for(&self, merchant: &MerchantId) -> Option<&Geofence> {
        self.geofences.iter().find(|f| &f.merchant == merchant)
    }

    /// Whether `other` reflects a later authority state than `self`.
    pub fn is_older_than(&self, other: &WalletSnapshot) -> bool {
        self.revision < other.revision
    }
}
