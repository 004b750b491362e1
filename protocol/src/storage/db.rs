//! # AuthorityDb: Ledger Persistence
//!
//! The authority's record store, built on sled's embedded key-value store.
//!
//! ## Tree Layout
//!
//! | Tree         | Key                               | Value                     |
//! |--------------|-----------------------------------|---------------------------|
//! | `wallets`    | `wallet_id` (16B)                 | `bincode(Wallet)`         |
//! | `outcomes`   | `idempotency_key` (16B)           | `bincode(DecisionRecord)` |
//! | `history`    | `wallet_id` (16B) ‖ `revision` (8B BE) | `bincode(LedgerEntry)` |
//! | `heads`      | `wallet_id` (16B)                 | chain head hash (32B)     |
//! | `nonces`     | `wallet_id` (16B) ‖ nonce (UTF-8) | `idempotency_key` (16B)   |
//! | `geofences`  | `merchant_id` (UTF-8)             | `bincode(Geofence)`       |
//! | `metadata`   | key (UTF-8)                       | value (bytes)             |
//!
//! Revisions are stored big-endian so sled's lexicographic ordering within
//! a wallet prefix matches numeric ordering. A prefix scan over `history`
//! returns a wallet's entries oldest first.
//!
//! ## Atomicity
//!
//! A decision writes the wallet record, the outcome, the history entry,
//! the chain head and the credential nonce in one multi-tree sled
//! transaction. The transaction re-checks inside itself that the key is
//! still undecided and that the wallet revision is the one the decision
//! was computed from, so two processes sharing a store can never both
//! apply the same key or build on the same stale wallet.

use sled::transaction::{
    ConflictableTransactionError, ConflictableTransactionResult, TransactionError,
};
use sled::{Db, IVec, Transactional, Tree};
use std::path::Path;

use crate::crypto::IssuerPublicKey;
use crate::geo::Geofence;
use crate::ledger::outcome::{DecisionRecord, LedgerEntry};
use crate::transaction::types::{IdempotencyKey, MerchantId, WalletId};
use crate::wallet::Wallet;

// ---------------------------------------------------------------------------
// Error Type
// ---------------------------------------------------------------------------

/// Errors that can occur during database operations.
#[derive(Debug, thiserror::Error)]
pub enum DbError {
    #[error("sled error: {0}")]
    Sled(#[from] sled::Error),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("corrupt record in {tree}: {detail}")]
    Corrupt { tree: &'static str, detail: String },
}

pub type DbResult<T> = Result<T, DbError>;

pub(crate) fn encode<T: serde::Serialize>(value: &T) -> DbResult<Vec<u8>> {
    bincode::serialize(value).map_err(|e| DbError::Serialization(e.to_string()))
}

pub(crate) fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> DbResult<T> {
    bincode::deserialize(bytes).map_err(|e| DbError::Serialization(e.to_string()))
}

// ---------------------------------------------------------------------------
// Metadata Keys
// ---------------------------------------------------------------------------

const META_TRUSTED_ISSUERS: &[u8] = b"trusted_issuers";

// ---------------------------------------------------------------------------
// Commit types
// ---------------------------------------------------------------------------

/// Everything one decision writes.
#[derive(Debug, Clone)]
pub struct DecisionCommit<'a> {
    pub record: &'a DecisionRecord,
    /// Revision of the wallet record the decision was computed from, or
    /// `None` when the wallet was not found.
    pub base_revision: Option<u64>,
    /// Updated wallet, present only for accepted transactions.
    pub wallet: Option<&'a Wallet>,
    pub entry: Option<&'a LedgerEntry>,
    pub nonce: Option<&'a str>,
}

/// Result of [`AuthorityDb::commit_decision`].
#[derive(Debug, Clone, PartialEq)]
pub enum CommitStatus {
    Committed,
    /// Another writer decided this key first. Its record is returned.
    AlreadyDecided(DecisionRecord),
    /// The wallet changed since the decision was computed. Re-read and retry.
    StaleWallet,
}

#[derive(Debug, Clone)]
enum CommitAbort {
    AlreadyDecided(IVec),
    StaleWallet,
}

// ---------------------------------------------------------------------------
// AuthorityDb
// ---------------------------------------------------------------------------

/// Persistent storage for the Wallet Ledger Authority.
///
/// sled trees are safe for concurrent use, so `AuthorityDb` is shared as
/// `Arc<AuthorityDb>` without external locking. Serializing mutations of
/// one wallet is the authority's job.
#[derive(Debug, Clone)]
pub struct AuthorityDb {
    db: Db,
    wallets: Tree,
    outcomes: Tree,
    history: Tree,
    heads: Tree,
    nonces: Tree,
    geofences: Tree,
    metadata: Tree,
}

impl AuthorityDb {
    /// Open or create a database at the given filesystem path.
    pub fn open<P: AsRef<Path>>(path: P) -> DbResult<Self> {
        let db = sled::open(path)?;
        Self::from_db(db)
    }

    /// A database that is deleted when dropped. For tests and benches.
    pub fn open_temporary() -> DbResult<Self> {
        let db = sled::Config::new().temporary(true).open()?;
        Self::from_db(db)
    }

    fn from_db(db: Db) -> DbResult<Self> {
        Ok(Self {
            wallets: db.open_tree("wallets")?,
            outcomes: db.open_tree("outcomes")?,
            history: db.open_tree("history")?,
            heads: db.open_tree("heads")?,
            nonces: db.open_tree("nonces")?,
            geofences: db.open_tree("geofences")?,
            metadata: db.open_tree("metadata")?,
            db,
        })
    }

    // -- Wallets ------------------------------------------------------------

    pub fn get_wallet(&self, id: &WalletId) -> DbResult<Option<Wallet>> {
        self.wallets
            .get(id.as_bytes())?
            .map(|bytes| decode(&bytes))
            .transpose()
    }

    /// Unconditionally write a wallet record. Provisioning goes through
    /// [`insert_wallet`](Self::insert_wallet) and
    /// [`swap_wallet`](Self::swap_wallet) instead.
    pub fn put_wallet(&self, wallet: &Wallet) -> DbResult<()> {
        self.wallets.insert(wallet.id.as_bytes(), encode(wallet)?)?;
        Ok(())
    }

    /// Insert a new wallet. Returns `false` if the id is already taken.
    pub fn insert_wallet(&self, wallet: &Wallet) -> DbResult<bool> {
        let swapped = self.wallets.compare_and_swap(
            wallet.id.as_bytes(),
            None as Option<&[u8]>,
            Some(encode(wallet)?),
        )?;
        self.db.flush()?;
        Ok(swapped.is_ok())
    }

    /// Replace `before` with `after` only if the stored record is still
    /// exactly `before`. Returns `false` when someone else wrote first.
    pub fn swap_wallet(&self, before: &Wallet, after: &Wallet) -> DbResult<bool> {
        let swapped = self.wallets.compare_and_swap(
            after.id.as_bytes(),
            Some(encode(before)?),
            Some(encode(after)?),
        )?;
        self.db.flush()?;
        Ok(swapped.is_ok())
    }

    pub fn wallet_count(&self) -> usize {
        self.wallets.len()
    }

    // -- Decisions ----------------------------------------------------------

    pub fn get_decision(&self, key: &IdempotencyKey) -> DbResult<Option<DecisionRecord>> {
        self.outcomes
            .get(key.as_bytes())?
            .map(|bytes| decode(&bytes))
            .transpose()
    }

    pub fn decision_count(&self) -> usize {
        self.outcomes.len()
    }

    /// Idempotency key that already consumed `nonce` on this wallet, if any.
    pub fn nonce_owner(&self, wallet: &WalletId, nonce: &str) -> DbResult<Option<IdempotencyKey>> {
        match self.nonces.get(nonce_key(wallet, nonce))? {
            Some(bytes) => {
                let raw: [u8; 16] = bytes.as_ref().try_into().map_err(|_| DbError::Corrupt {
                    tree: "nonces",
                    detail: format!("expected 16 bytes, got {}", bytes.len()),
                })?;
                Ok(Some(IdempotencyKey::from_uuid(uuid::Uuid::from_bytes(raw))))
            }
            None => Ok(None),
        }
    }

    /// Current head of a wallet's history chain.
    pub fn chain_head(&self, wallet: &WalletId) -> DbResult<[u8; 32]> {
        match self.heads.get(wallet.as_bytes())? {
            Some(bytes) => bytes.as_ref().try_into().map_err(|_| DbError::Corrupt {
                tree: "heads",
                detail: format!("expected 32 bytes, got {}", bytes.len()),
            }),
            None => Ok(LedgerEntry::GENESIS_HASH),
        }
    }

    /// Commit one decision atomically across every tree it touches.
    pub fn commit_decision(&self, commit: &DecisionCommit<'_>) -> DbResult<CommitStatus> {
        let key = commit.record.key.as_bytes().to_vec();
        let wallet_key = commit.record.wallet_id.as_bytes().to_vec();
        let record_bytes = encode(commit.record)?;
        let wallet_bytes = commit.wallet.map(encode).transpose()?;
        let entry_bytes = commit.entry.map(encode).transpose()?;
        let head = commit.entry.map(|e| e.hash);
        let history_key = commit
            .entry
            .map(|e| history_key(&commit.record.wallet_id, e.revision));
        let nonce_key = commit
            .nonce
            .filter(|_| commit.wallet.is_some())
            .map(|n| nonce_key(&commit.record.wallet_id, n));
        let base_revision = commit.base_revision;

        let result = (
            &self.wallets,
            &self.outcomes,
            &self.history,
            &self.heads,
            &self.nonces,
        )
            .transaction(
                |(wallets, outcomes, history, heads, nonces)| -> ConflictableTransactionResult<(), CommitAbort> {
                if let Some(existing) = outcomes.get(&key[..])? {
                    return Err(ConflictableTransactionError::Abort(
                        CommitAbort::AlreadyDecided(existing),
                    ));
                }

                let current = match wallets.get(&wallet_key[..])? {
                    Some(bytes) => Some(
                        bincode::deserialize::<Wallet>(&bytes)
                            .map(|w| w.revision)
                            .map_err(|_| {
                                ConflictableTransactionError::Abort(CommitAbort::StaleWallet)
                            })?,
                    ),
                    None => None,
                };
                if current != base_revision {
                    return Err(ConflictableTransactionError::Abort(CommitAbort::StaleWallet));
                }

                if let Some(bytes) = &wallet_bytes {
                    wallets.insert(&wallet_key[..], &bytes[..])?;
                }
                if let (Some(hk), Some(bytes)) = (&history_key, &entry_bytes) {
                    history.insert(&hk[..], &bytes[..])?;
                }
                if let Some(h) = &head {
                    heads.insert(&wallet_key[..], &h[..])?;
                }
                if let Some(nk) = &nonce_key {
                    nonces.insert(&nk[..], &key[..])?;
                }
                outcomes.insert(&key[..], &record_bytes[..])?;
                Ok(())
            });

        match result {
            Ok(()) => {
                self.db.flush()?;
                Ok(CommitStatus::Committed)
            }
            Err(TransactionError::Abort(CommitAbort::AlreadyDecided(bytes))) => {
                Ok(CommitStatus::AlreadyDecided(decode(&bytes)?))
            }
            Err(TransactionError::Abort(CommitAbort::StaleWallet)) => Ok(CommitStatus::StaleWallet),
            Err(TransactionError::Storage(e)) => Err(DbError::Sled(e)),
        }
    }

    // -- History ------------------------------------------------------------

    /// A wallet's accepted transactions, oldest first.
    pub fn history(&self, wallet: &WalletId) -> DbResult<Vec<LedgerEntry>> {
        let mut entries = Vec::new();
        for item in self.history.scan_prefix(wallet.as_bytes()) {
            let (_key, value) = item?;
            entries.push(decode(&value)?);
        }
        Ok(entries)
    }

    // -- Geofences ----------------------------------------------------------

    pub fn put_geofence(&self, fence: &Geofence) -> DbResult<()> {
        self.geofences
            .insert(fence.merchant.as_str().as_bytes(), encode(fence)?)?;
        Ok(())
    }

    pub fn get_geofence(&self, merchant: &MerchantId) -> DbResult<Option<Geofence>> {
        self.geofences
            .get(merchant.as_str().as_bytes())?
            .map(|bytes| decode(&bytes))
            .transpose()
    }

    pub fn geofences(&self) -> DbResult<Vec<Geofence>> {
        let mut fences = Vec::new();
        for item in self.geofences.iter() {
            let (_key, value) = item?;
            fences.push(decode(&value)?);
        }
        Ok(fences)
    }

    // -- Metadata -----------------------------------------------------------

    pub fn trusted_issuers(&self) -> DbResult<Vec<IssuerPublicKey>> {
        match self.metadata.get(META_TRUSTED_ISSUERS)? {
            Some(bytes) => decode(&bytes),
            None => Ok(Vec::new()),
        }
    }

    /// Add `key` to the trusted set. Returns `false` if it was already
    /// there. Compare-and-swap loop: concurrent adds are all kept.
    pub fn add_trusted_issuer(&self, key: IssuerPublicKey) -> DbResult<bool> {
        loop {
            let current = self.metadata.get(META_TRUSTED_ISSUERS)?;
            let mut issuers: Vec<IssuerPublicKey> = match &current {
                Some(bytes) => decode(bytes)?,
                None => Vec::new(),
            };
            if issuers.contains(&key) {
                return Ok(false);
            }
            issuers.push(key);
            let swapped = self.metadata.compare_and_swap(
                META_TRUSTED_ISSUERS,
                current,
                Some(encode(&issuers)?),
            )?;
            if swapped.is_ok() {
                self.db.flush()?;
                return Ok(true);
            }
        }
    }

    /// Force a flush of all pending writes to disk.
    pub fn flush(&self) -> DbResult<()> {
        self.db.flush()?;
        Ok(())
    }
}

fn history_key(wallet: &WalletId, revision: u64) -> Vec<u8> {
    let mut key = Vec::with_capacity(24);
    key.extend_from_slice(wallet.as_bytes());
    key.extend_from_slice(&revision.to_be_bytes());
    key
}

fn nonce_key(wallet: &WalletId, nonce: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(16 + nonce.len());
    key.extend_from_slice(wallet.as_bytes());
    key.extend_from_slice(nonce.as_bytes());
    key
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::outcome::{Outcome, RejectionReason};
    use crate::transaction::{TransactionBuilder, TransactionKind};
    use chrono::Utc;

    fn provisioned(db: &AuthorityDb, limit: u64) -> Wallet {
        let wallet = Wallet::new(WalletId::new(), "member-7", limit, Utc::now());
        db.put_wallet(&wallet).unwrap();
        wallet
    }

    fn accept(db: &AuthorityDb, wallet: &Wallet, amount: u64) -> (DecisionRecord, CommitStatus) {
        let tx = TransactionBuilder::new(wallet.id, TransactionKind::Debit, amount).build();
        let mut updated = wallet.clone();
        updated.apply(tx.kind, amount, Utc::now()).unwrap();
        let entry = LedgerEntry::new(
            db.chain_head(&wallet.id).unwrap(),
            tx.clone(),
            updated.revision,
            updated.spent,
            updated.updated_at,
        );
        let record = DecisionRecord {
            key: tx.key,
            wallet_id: wallet.id,
            outcome: Outcome::Accepted {
                revision: updated.revision,
                spent_after: updated.spent,
                balance_after: updated.balance(),
                applied_at: updated.updated_at,
            },
        };
        let status = db
            .commit_decision(&DecisionCommit {
                record: &record,
                base_revision: Some(wallet.revision),
                wallet: Some(&updated),
                entry: Some(&entry),
                nonce: Some("n-1"),
            })
            .unwrap();
        (record, status)
    }

    #[test]
    fn open_temporary_database() {
        let db = AuthorityDb::open_temporary().expect("should create temp db");
        assert_eq!(db.wallet_count(), 0);
        assert_eq!(db.decision_count(), 0);
        assert!(db.trusted_issuers().unwrap().is_empty());
    }

    #[test]
    fn committed_decision_updates_every_tree() {
        let db = AuthorityDb::open_temporary().unwrap();
        let wallet = provisioned(&db, 100);
        let (record, status) = accept(&db, &wallet, 40);

        assert_eq!(status, CommitStatus::Committed);
        assert_eq!(db.get_decision(&record.key).unwrap(), Some(record.clone()));
        assert_eq!(db.get_wallet(&wallet.id).unwrap().unwrap().spent, 40);
        let history = db.history(&wallet.id).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(db.chain_head(&wallet.id).unwrap(), history[0].hash);
        assert_eq!(db.nonce_owner(&wallet.id, "n-1").unwrap(), Some(record.key));
    }

    #[test]
    fn stale_base_revision_is_refused() {
        let db = AuthorityDb::open_temporary().unwrap();
        let wallet = provisioned(&db, 100);
        let (_, first) = accept(&db, &wallet, 10);
        assert_eq!(first, CommitStatus::Committed);

        // Second decision computed from the pre-first wallet state.
        let (_, second) = accept(&db, &wallet, 10);
        assert_eq!(second, CommitStatus::StaleWallet);
        assert_eq!(db.get_wallet(&wallet.id).unwrap().unwrap().spent, 10);
    }

    #[test]
    fn second_writer_sees_existing_decision() {
        let db = AuthorityDb::open_temporary().unwrap();
        let wallet = provisioned(&db, 100);
        let key = IdempotencyKey::generate();
        let rejected = DecisionRecord {
            key,
            wallet_id: wallet.id,
            outcome: Outcome::Rejected {
                reason: RejectionReason::LocationRequired,
                decided_at: Utc::now(),
            },
        };
        let commit = DecisionCommit {
            record: &rejected,
            base_revision: Some(wallet.revision),
            wallet: None,
            entry: None,
            nonce: None,
        };
        assert_eq!(db.commit_decision(&commit).unwrap(), CommitStatus::Committed);
        assert_eq!(
            db.commit_decision(&commit).unwrap(),
            CommitStatus::AlreadyDecided(rejected)
        );
    }

    #[test]
    fn history_is_scoped_and_ordered() {
        let db = AuthorityDb::open_temporary().unwrap();
        let a = provisioned(&db, 1_000);
        let b = provisioned(&db, 1_000);

        let mut current = a.clone();
        for _ in 0..3 {
            let (_, status) = accept(&db, &current, 5);
            assert_eq!(status, CommitStatus::Committed);
            current = db.get_wallet(&a.id).unwrap().unwrap();
        }
        accept(&db, &b, 7);

        let history = db.history(&a.id).unwrap();
        assert_eq!(history.len(), 3);
        assert!(history.windows(2).all(|w| w[0].revision < w[1].revision));
        assert!(history.windows(2).all(|w| w[1].prev_hash == w[0].hash));
        assert_eq!(db.history(&b.id).unwrap().len(), 1);
    }

    #[test]
    fn concurrent_issuer_adds_are_all_kept() {
        use crate::crypto::IssuerKeypair;
        use std::sync::{Arc, Barrier};

        let db = Arc::new(AuthorityDb::open_temporary().unwrap());
        let keys: Vec<_> = (0..8).map(|_| IssuerKeypair::generate().public_key()).collect();
        let barrier = Arc::new(Barrier::new(keys.len()));
        let handles: Vec<_> = keys
            .iter()
            .map(|key| {
                let (db, barrier, key) = (db.clone(), barrier.clone(), *key);
                std::thread::spawn(move || {
                    barrier.wait();
                    db.add_trusted_issuer(key).unwrap()
                })
            })
            .collect();
        for h in handles {
            assert!(h.join().unwrap());
        }

        let stored = db.trusted_issuers().unwrap();
        assert_eq!(stored.len(), keys.len());
        assert!(keys.iter().all(|k| stored.contains(k)));
        assert!(!db.add_trusted_issuer(keys[0]).unwrap());
    }

    #[test]
    fn persistent_database_survives_reopen() {
        let dir = tempfile::tempdir().expect("tempdir");
        let wallet_id;
        {
            let db = AuthorityDb::open(dir.path()).unwrap();
            let wallet = provisioned(&db, 100);
            wallet_id = wallet.id;
            accept(&db, &wallet, 25);
            db.flush().unwrap();
        }
        let db = AuthorityDb::open(dir.path()).unwrap();
        assert_eq!(db.get_wallet(&wallet_id).unwrap().unwrap().spent, 25);
        assert_eq!(db.history(&wallet_id).unwrap().len(), 1);
    }
}
