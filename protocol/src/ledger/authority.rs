//! # Wallet Ledger Authority
//!
//! The single source of truth for wallet balances, limits and history.
//!
//! ## Submission Pipeline
//!
//! ```text
//!  submit(tx)
//!     │
//!     ├─ 1. idempotency ── key already decided? ──▶ stored outcome (replayed)
//!     │
//!     ├─ lock wallet (one in-flight mutation per wallet)
//!     │
//!     ├─ 2. wallet state ─┐
//!     ├─ 3. geofence      ├─ ConflictResolver::resolve
//!     ├─ 4. amount/limit ─┘
//!     │
//!     └─ 5. commit ── wallet + outcome + history entry + nonce
//!                     in one sled transaction
//! ```
//!
//! Arrival order is the only order. Client timestamps are recorded but
//! never consulted.

use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

use super::outcome::{DecisionRecord, LedgerEntry, Outcome, RejectionReason, SubmissionResult};
use super::resolver::{ConflictResolver, Resolution};
use crate::crypto::IssuerPublicKey;
use crate::geo::Geofence;
use crate::storage::{AuthorityDb, CommitStatus, DbError, DecisionCommit};
use crate::transaction::types::{IdempotencyKey, Transaction, WalletId};
use crate::wallet::{Wallet, WalletError, WalletSnapshot};

/// Attempts at committing a decision before giving up on a wallet that
/// another writer keeps changing underneath us.
const MAX_COMMIT_ATTEMPTS: usize = 8;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Failures of the authority itself, as opposed to rejections of a
/// transaction (which are ordinary [`Outcome`]s).
#[derive(Debug, Error)]
pub enum AuthorityError {
    #[error("storage error: {0}")]
    Db(#[from] DbError),

    #[error("wallet {0} not found")]
    UnknownWallet(WalletId),

    #[error("wallet {0} already exists")]
    WalletExists(WalletId),

    #[error(transparent)]
    Wallet(#[from] WalletError),

    #[error("wallet {0} is changing too fast to commit a decision")]
    Contention(WalletId),
}

/// Result of walking a wallet's history chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HistoryVerification {
    /// Every link holds.
    Intact { entries: usize },
    /// The entry at `revision` does not link to its predecessor.
    Broken { revision: u64 },
}

// ---------------------------------------------------------------------------
// WalletLedgerAuthority
// ---------------------------------------------------------------------------

/// Authoritative ledger.
///
/// Cheap to share: wrap in an `Arc` and hand a clone to every request
/// handler. Submissions for different wallets run in parallel; two
/// submissions for the same wallet queue on that wallet's lock.
pub struct WalletLedgerAuthority {
    db: Arc<AuthorityDb>,
    resolver: ConflictResolver,
    locks: DashMap<WalletId, Arc<Mutex<()>>>,
}

impl WalletLedgerAuthority {
    pub fn new(db: Arc<AuthorityDb>) -> Self {
        Self::with_resolver(db, ConflictResolver::default())
    }

    pub fn with_resolver(db: Arc<AuthorityDb>, resolver: ConflictResolver) -> Self {
        Self {
            db,
            resolver,
            locks: DashMap::new(),
        }
    }

    /// Authority over a throwaway database.
    pub fn open_temporary() -> Result<Self, AuthorityError> {
        Ok(Self::new(Arc::new(AuthorityDb::open_temporary()?)))
    }

    pub fn db(&self) -> &Arc<AuthorityDb> {
        &self.db
    }

    // -- Submission ---------------------------------------------------------

    /// Decide a transaction and return its outcome.
    ///
    /// Submitting the same idempotency key again, from any device, any
    /// number of times, returns the stored outcome and changes nothing.
    pub fn submit(&self, tx: &Transaction) -> Result<Outcome, AuthorityError> {
        Ok(self.submit_detailed(tx)?.outcome)
    }

    /// Like [`submit`](Self::submit), also reporting whether the outcome
    /// was a replay of an earlier decision.
    pub fn submit_detailed(&self, tx: &Transaction) -> Result<SubmissionResult, AuthorityError> {
        if let Some(record) = self.db.get_decision(&tx.key)? {
            debug!(key = %tx.key, wallet = %tx.wallet_id, "replayed stored outcome");
            return Ok(replayed(record));
        }

        // Lock entries exist only for provisioned wallets.
        if self.db.get_wallet(&tx.wallet_id)?.is_none() {
            return self.decide(tx);
        }
        let lock = self.wallet_lock(&tx.wallet_id);
        let _guard = lock.lock();
        self.decide(tx)
    }

    /// Resolve and commit, retrying while another writer changes the wallet.
    /// Callers hold the wallet lock when the wallet exists.
    fn decide(&self, tx: &Transaction) -> Result<SubmissionResult, AuthorityError> {
        for attempt in 1..=MAX_COMMIT_ATTEMPTS {
            // Re-check under the lock: a concurrent submit of the same key
            // may have committed while we waited.
            if let Some(record) = self.db.get_decision(&tx.key)? {
                return Ok(replayed(record));
            }

            let wallet = self.db.get_wallet(&tx.wallet_id)?;
            let fences = match &tx.merchant {
                Some(m) => self.db.get_geofence(m)?.into_iter().collect(),
                None => Vec::new(),
            };
            let now = Utc::now();

            let mut resolution = self.resolver.resolve(wallet.as_ref(), &fences, tx, now);
            let nonce_spent = match (&resolution, &tx.credential_nonce) {
                (Resolution::Apply { .. }, Some(nonce)) => self
                    .db
                    .nonce_owner(&tx.wallet_id, nonce)?
                    .is_some_and(|owner| owner != tx.key),
                _ => false,
            };
            if nonce_spent {
                resolution = Resolution::Reject(RejectionReason::CredentialReplayed);
            }

            let base_revision = wallet.as_ref().map(|w| w.revision);
            let (record, updated, entry) = match resolution {
                Resolution::Apply { wallet: updated } => {
                    let entry = LedgerEntry::new(
                        self.db.chain_head(&tx.wallet_id)?,
                        tx.clone(),
                        updated.revision,
                        updated.spent,
                        now,
                    );
                    let record = DecisionRecord {
                        key: tx.key,
                        wallet_id: tx.wallet_id,
                        outcome: Outcome::Accepted {
                            revision: updated.revision,
                            spent_after: updated.spent,
                            balance_after: updated.balance(),
                            applied_at: now,
                        },
                    };
                    (record, Some(updated), Some(entry))
                }
                Resolution::Reject(reason) => {
                    let record = DecisionRecord {
                        key: tx.key,
                        wallet_id: tx.wallet_id,
                        outcome: Outcome::Rejected {
                            reason,
                            decided_at: now,
                        },
                    };
                    (record, None, None)
                }
            };

            let status = self.db.commit_decision(&DecisionCommit {
                record: &record,
                base_revision,
                wallet: updated.as_ref(),
                entry: entry.as_ref(),
                nonce: tx.credential_nonce.as_deref(),
            })?;

            match status {
                CommitStatus::Committed => {
                    log_decision(tx, &record.outcome);
                    return Ok(SubmissionResult {
                        key: tx.key,
                        outcome: record.outcome,
                        replayed: false,
                    });
                }
                CommitStatus::AlreadyDecided(existing) => return Ok(replayed(existing)),
                CommitStatus::StaleWallet => {
                    debug!(wallet = %tx.wallet_id, attempt, "wallet changed during decision, retrying");
                }
            }
        }

        warn!(wallet = %tx.wallet_id, key = %tx.key, "gave up committing decision");
        Err(AuthorityError::Contention(tx.wallet_id))
    }

    /// Decide a batch in order. Each transaction sees the effects of the
    /// ones before it.
    pub fn submit_batch(&self, txs: &[Transaction]) -> Result<Vec<SubmissionResult>, AuthorityError> {
        txs.iter().map(|tx| self.submit_detailed(tx)).collect()
    }

    // -- Provisioning -------------------------------------------------------

    /// Create a wallet with a fresh id.
    pub fn provision_wallet(&self, owner: &str, credit_limit: u64) -> Result<Wallet, AuthorityError> {
        self.provision_wallet_with_id(WalletId::new(), owner, credit_limit)
    }

    /// Create a wallet under an id assigned by the co-op's registry.
    pub fn provision_wallet_with_id(
        &self,
        id: WalletId,
        owner: &str,
        credit_limit: u64,
    ) -> Result<Wallet, AuthorityError> {
        let wallet = Wallet::new(id, owner, credit_limit, Utc::now());
        if !self.db.insert_wallet(&wallet)? {
            return Err(AuthorityError::WalletExists(id));
        }
        info!(wallet = %id, owner, credit_limit, "wallet provisioned");
        Ok(wallet)
    }

    pub fn set_credit_limit(&self, id: &WalletId, limit: u64) -> Result<Wallet, AuthorityError> {
        self.mutate_wallet(id, "credit limit changed", |w| w.set_credit_limit(limit, Utc::now()))
    }

    pub fn suspend_wallet(&self, id: &WalletId) -> Result<Wallet, AuthorityError> {
        self.mutate_wallet(id, "wallet suspended", |w| w.suspend(Utc::now()))
    }

    pub fn reactivate_wallet(&self, id: &WalletId) -> Result<Wallet, AuthorityError> {
        self.mutate_wallet(id, "wallet reactivated", |w| w.reactivate(Utc::now()))
    }

    pub fn close_wallet(&self, id: &WalletId) -> Result<Wallet, AuthorityError> {
        self.mutate_wallet(id, "wallet closed", |w| w.close(Utc::now()))
    }

    /// Register or replace a merchant's geofence.
    pub fn register_geofence(&self, fence: Geofence) -> Result<(), AuthorityError> {
        self.db.put_geofence(&fence)?;
        info!(merchant = %fence.merchant, radius_m = fence.radius_m, "geofence registered");
        Ok(())
    }

    /// Add an issuer key to the set distributed to devices.
    pub fn trust_issuer(&self, key: IssuerPublicKey) -> Result<(), AuthorityError> {
        if self.db.add_trusted_issuer(key)? {
            info!(issuer = %key, "issuer trusted");
        }
        Ok(())
    }

    // -- Reads --------------------------------------------------------------

    pub fn wallet(&self, id: &WalletId) -> Result<Option<Wallet>, AuthorityError> {
        Ok(self.db.get_wallet(id)?)
    }

    /// Device-facing snapshot: wallet state plus every registered fence and
    /// trusted issuer key.
    pub fn snapshot(&self, id: &WalletId) -> Result<Option<WalletSnapshot>, AuthorityError> {
        let Some(wallet) = self.db.get_wallet(id)? else {
            return Ok(None);
        };
        Ok(Some(wallet.snapshot(
            self.db.geofences()?,
            self.db.trusted_issuers()?,
            Utc::now(),
        )))
    }

    pub fn history(&self, id: &WalletId) -> Result<Vec<LedgerEntry>, AuthorityError> {
        Ok(self.db.history(id)?)
    }

    pub fn outcome(&self, key: &IdempotencyKey) -> Result<Option<DecisionRecord>, AuthorityError> {
        Ok(self.db.get_decision(key)?)
    }

    /// Walk a wallet's history chain from genesis and check every link,
    /// and that the last entry is the recorded head.
    pub fn verify_history(&self, id: &WalletId) -> Result<HistoryVerification, AuthorityError> {
        let entries = self.db.history(id)?;
        let mut prev = LedgerEntry::GENESIS_HASH;
        for entry in &entries {
            if !entry.verify_link(&prev) {
                warn!(wallet = %id, revision = entry.revision, "history chain broken");
                return Ok(HistoryVerification::Broken {
                    revision: entry.revision,
                });
            }
            prev = entry.hash;
        }
        if prev != self.db.chain_head(id)? {
            let revision = entries.last().map(|e| e.revision).unwrap_or(0);
            return Ok(HistoryVerification::Broken { revision });
        }
        Ok(HistoryVerification::Intact {
            entries: entries.len(),
        })
    }

    // -- Internals ----------------------------------------------------------

    fn wallet_lock(&self, id: &WalletId) -> Arc<Mutex<()>> {
        self.locks
            .entry(*id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn mutate_wallet<F>(&self, id: &WalletId, what: &str, f: F) -> Result<Wallet, AuthorityError>
    where
        F: Fn(&mut Wallet) -> Result<(), WalletError>,
    {
        if self.db.get_wallet(id)?.is_none() {
            return Err(AuthorityError::UnknownWallet(*id));
        }
        let lock = self.wallet_lock(id);
        let _guard = lock.lock();

        for _ in 0..MAX_COMMIT_ATTEMPTS {
            let before = self
                .db
                .get_wallet(id)?
                .ok_or(AuthorityError::UnknownWallet(*id))?;
            let mut after = before.clone();
            f(&mut after)?;
            if self.db.swap_wallet(&before, &after)? {
                info!(wallet = %id, revision = after.revision, status = %after.status, "{what}");
                return Ok(after);
            }
        }
        Err(AuthorityError::Contention(*id))
    }
}

fn replayed(record: DecisionRecord) -> SubmissionResult {
    SubmissionResult {
        key: record.key,
        outcome: record.outcome,
        replayed: true,
    }
}

fn log_decision(tx: &Transaction, outcome: &Outcome) {
    match outcome {
        Outcome::Accepted {
            revision,
            spent_after,
            ..
        } => debug!(
            key = %tx.key,
            wallet = %tx.wallet_id,
            kind = %tx.kind,
            amount = tx.amount,
            revision,
            spent_after,
            "transaction accepted"
        ),
        Outcome::Rejected { reason, .. } => debug!(
            key = %tx.key,
            wallet = %tx.wallet_id,
            kind = %tx.kind,
            amount = tx.amount,
            reason = %reason,
            "transaction rejected"
        ),
    }
}
