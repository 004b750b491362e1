//! Authority-side decision function.
//!
//! [`ConflictResolver::resolve`] is pure: given the current wallet record,
//! the merchant fences and one transaction, it either produces the wallet
//! as it would look after applying the transaction, or the reason it must
//! be refused. Persisting the result is the authority's job.

use chrono::{DateTime, Utc};

use crate::config::MAX_DESCRIPTION_LENGTH;
use crate::geo::{self, GeoCheck, Geofence};
use crate::transaction::types::Transaction;
use crate::wallet::{Wallet, WalletError, WalletStatus};

use super::outcome::RejectionReason;

/// What the authority should do with a transaction.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// Apply it. `wallet` is the post-application record.
    Apply { wallet: Wallet },
    Reject(RejectionReason),
}

/// Orders checks and applies the limit rule.
#[derive(Debug, Clone)]
pub struct ConflictResolver {
    max_description: usize,
}

impl Default for ConflictResolver {
    fn default() -> Self {
        Self {
            max_description: MAX_DESCRIPTION_LENGTH,
        }
    }
}

impl ConflictResolver {
    pub fn new(max_description: usize) -> Self {
        Self { max_description }
    }

    /// Decide one transaction.
    ///
    /// Check order: wallet state, location, then amount and limit. The
    /// first failing check names the rejection.
    pub fn resolve(
        &self,
        wallet: Option<&Wallet>,
        fences: &[Geofence],
        tx: &Transaction,
        now: DateTime<Utc>,
    ) -> Resolution {
        let Some(wallet) = wallet else {
            return Resolution::Reject(RejectionReason::UnknownWallet);
        };
        match wallet.status {
            WalletStatus::Active => {}
            WalletStatus::Suspended => return Resolution::Reject(RejectionReason::WalletSuspended),
            WalletStatus::Closed => return Resolution::Reject(RejectionReason::WalletClosed),
        }

        if let Some(merchant) = &tx.merchant {
            let Some(fence) = fences.iter().find(|f| &f.merchant == merchant) else {
                return Resolution::Reject(RejectionReason::UnknownMerchant(merchant.clone()));
            };
            match geo::validate(tx.location.as_ref(), fence) {
                GeoCheck::WithinFence => {}
                GeoCheck::OutOfRange { distance_m } => {
                    return Resolution::Reject(RejectionReason::OutOfRange {
                        distance_m,
                        radius_m: fence.radius_m,
                    })
                }
                GeoCheck::LocationRequired => {
                    return Resolution::Reject(RejectionReason::LocationRequired)
                }
            }
        }

        if tx.description.len() > self.max_description {
            return Resolution::Reject(RejectionReason::DescriptionTooLong {
                len: tx.description.len(),
                max: self.max_description,
            });
        }

        let mut next = wallet.clone();
        match next.apply(tx.kind, tx.amount, now) {
            Ok(()) => Resolution::Apply { wallet: next },
            Err(WalletError::ZeroAmount) => Resolution::Reject(RejectionReason::InvalidAmount),
            Err(WalletError::LimitExceeded {
                available,
                requested,
            }) => Resolution::Reject(RejectionReason::LimitExceeded {
                available,
                requested,
            }),
            // Status was checked above; anything else is a state rejection.
            Err(WalletError::NotActive(WalletStatus::Closed)) => {
                Resolution::Reject(RejectionReason::WalletClosed)
            }
            Err(_) => Resolution::Reject(RejectionReason::WalletSuspended),
        }
    }
}
