//! # Local Transaction Queue
//!
//! The device-side half of the ledger: a durable, ordered log of
//! transactions the authority has not yet decided.
//!
//! ```text
//!   enqueue ──▶ [ Pending ] ──drain──▶ [ Submitted ] ──acknowledge──▶ settled history
//!                    ▲                      │
//!                    └──── reset_submitted ─┘   (session failed, outcome unknown)
//! ```
//!
//! Entries leave the queue only when the authority has returned a
//! definitive outcome for them. A transaction whose fate is unknown stays
//! queued, and is resubmitted under the same idempotency key.

use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use super::cursor::SyncCursor;
use crate::config::MAX_DESCRIPTION_LENGTH;
use crate::credential::{CredentialSubject, CredentialVerifier};
use crate::error::{AuthorizationError, ErrorClass};
use crate::geo::{self, Coordinate};
use crate::ledger::outcome::{Outcome, SubmissionResult};
use crate::storage::{DbError, DbResult, DeviceDb};
use crate::transaction::types::{
    DeviceId, IdempotencyKey, MerchantId, Transaction, TransactionKind, TransactionStatus,
    WalletId,
};
use crate::transaction::TransactionBuilder;
use crate::wallet::{PinVerifier, WalletSnapshot, WalletStatus};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Local checks that failed before a transaction was queued. Never sent
/// to the authority.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("amount must be greater than zero")]
    NonPositiveAmount,

    #[error("PIN rejected")]
    PinRejected,

    #[error("wallet is {0} in the last known snapshot")]
    WalletNotActive(WalletStatus),

    #[error("would exceed projected limit: available {available}, requested {requested}")]
    WouldExceedLimit { available: u64, requested: u64 },

    #[error("description is {len} bytes, maximum is {max}")]
    DescriptionTooLong { len: usize, max: usize },

    /// The device has never synced this wallet, so it has no rules to check against.
    #[error("no wallet snapshot on this device")]
    NoSnapshot,

    /// The scanned credential names a different wallet or merchant.
    #[error("credential subject does not match the transaction")]
    CredentialSubjectMismatch,

    #[error("storage error: {0}")]
    Storage(#[from] DbError),
}

/// Why [`LocalTransactionQueue::enqueue`] refused a request.
#[derive(Debug, Error)]
pub enum EnqueueError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Authorization(#[from] AuthorizationError),
}

impl EnqueueError {
    pub fn class(&self) -> ErrorClass {
        match self {
            EnqueueError::Validation(_) => ErrorClass::Validation,
            EnqueueError::Authorization(e) => e.class(),
        }
    }
}

impl From<DbError> for EnqueueError {
    fn from(err: DbError) -> Self {
        EnqueueError::Validation(ValidationError::Storage(err))
    }
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Per-device queue settings.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub device_id: DeviceId,
    pub wallet_id: WalletId,
    /// Scanning context expected in QR credentials (usually the co-op id).
    pub audience: String,
    pub max_description: usize,
    /// Refuse debits that would overdraw the optimistic projection.
    pub enforce_projected_limit: bool,
}

impl QueueConfig {
    pub fn new(device_id: DeviceId, wallet_id: WalletId, audience: impl Into<String>) -> Self {
        Self {
            device_id,
            wallet_id,
            audience: audience.into(),
            max_description: MAX_DESCRIPTION_LENGTH,
            enforce_projected_limit: true,
        }
    }
}

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// A transaction waiting in the queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueEntry {
    pub transaction: Transaction,
    pub status: TransactionStatus,
    pub enqueued_at: DateTime<Utc>,
}

/// A transaction the authority has decided.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SettledEntry {
    pub transaction: Transaction,
    pub outcome: Outcome,
    pub settled_at: DateTime<Utc>,
}

/// What a member asks the device to record.
#[derive(Debug, Clone)]
pub struct TransactionRequest {
    pub kind: TransactionKind,
    pub amount: u64,
    pub description: String,
    pub pin: String,
    pub location: Option<Coordinate>,
    pub merchant: Option<MerchantId>,
    /// Raw QR token, if one was scanned.
    pub credential: Option<String>,
}

impl TransactionRequest {
    pub fn new(kind: TransactionKind, amount: u64, pin: impl Into<String>) -> Self {
        Self {
            kind,
            amount,
            description: String::new(),
            pin: pin.into(),
            location: None,
            merchant: None,
            credential: None,
        }
    }

    pub fn debit(amount: u64, pin: impl Into<String>) -> Self {
        Self::new(TransactionKind::Debit, amount, pin)
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
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

    pub fn credential(mut self, token: impl Into<String>) -> Self {
        self.credential = Some(token.into());
        self
    }
}

/// Optimistic local estimate. Only the authority's numbers are final.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectedBalance {
    /// Balance in the last authority snapshot.
    pub settled_balance: u64,
    /// Balance after applying every queued transaction.
    pub projected_balance: u64,
    pub projected_spent: u64,
    pub credit_limit: u64,
    pub pending_count: usize,
    /// `true` whenever some queued transaction is still undecided.
    pub is_provisional: bool,
}

/// Summary of one acknowledgement.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AckReport {
    pub accepted: usize,
    pub rejected: usize,
    /// Outcomes for keys that were not (or no longer) queued.
    pub ignored: usize,
}

// ---------------------------------------------------------------------------
// LocalTransactionQueue
// ---------------------------------------------------------------------------

/// Durable per-device queue for one wallet.
///
/// All mutating operations are serialized through an internal lock, so the
/// queue can be shared as `Arc<LocalTransactionQueue>` between the UI and
/// the sync engine.
pub struct LocalTransactionQueue {
    db: DeviceDb,
    config: QueueConfig,
    write: Mutex<()>,
    session_active: AtomicBool,
}

/// Exclusive right to sync a queue. Released on drop.
#[must_use]
pub struct SessionLease<'a> {
    active: &'a AtomicBool,
}

impl Drop for SessionLease<'_> {
    fn drop(&mut self) {
        self.active.store(false, Ordering::Release);
    }
}

impl LocalTransactionQueue {
    /// Open the queue. Entries left `Submitted` by a session that never
    /// finished (crash, power loss) go back to `Pending`.
    pub fn open(db: DeviceDb, config: QueueConfig) -> DbResult<Self> {
        let queue = Self {
            db,
            config,
            write: Mutex::new(()),
            session_active: AtomicBool::new(false),
        };
        let reset = queue.reset_submitted()?;
        if reset > 0 {
            info!(device = %queue.config.device_id, reset, "recovered in-flight entries after restart");
        }
        Ok(queue)
    }

    pub fn open_temporary(config: QueueConfig) -> DbResult<Self> {
        Self::open(DeviceDb::open_temporary()?, config)
    }

    pub fn device_id(&self) -> &DeviceId {
        &self.config.device_id
    }

    pub fn wallet_id(&self) -> WalletId {
        self.config.wallet_id
    }

    /// Store the member's PIN verifier (at enrollment).
    pub fn set_pin_verifier(&self, verifier: &PinVerifier) -> DbResult<()> {
        self.db.put_pin_verifier(verifier)
    }

    /// Seed or replace the cached snapshot outside a sync session (device
    /// provisioning). Older snapshots never replace newer ones.
    pub fn install_snapshot(&self, snapshot: &WalletSnapshot) -> DbResult<bool> {
        let _guard = self.write.lock();
        if let Some(current) = self.db.snapshot()? {
            if snapshot.is_older_than(&current) {
                return Ok(false);
            }
        }
        self.db.put_snapshot(snapshot)?;
        Ok(true)
    }

    // -- Enqueue ------------------------------------------------------------

    pub fn enqueue(&self, request: TransactionRequest) -> Result<Transaction, EnqueueError> {
        self.enqueue_at(request, Utc::now())
    }

    /// Validate `request` against the cached rules and append it.
    ///
    /// Checks run cheapest first: snapshot present, amount, description,
    /// PIN, wallet status, credential, geofence, projected limit.
    pub fn enqueue_at(
        &self,
        request: TransactionRequest,
        now: DateTime<Utc>,
    ) -> Result<Transaction, EnqueueError> {
        let _guard = self.write.lock();

        let snapshot = self.db.snapshot()?.ok_or(ValidationError::NoSnapshot)?;
        if request.amount == 0 {
            return Err(ValidationError::NonPositiveAmount.into());
        }
        if request.description.len() > self.config.max_description {
            return Err(ValidationError::DescriptionTooLong {
                len: request.description.len(),
                max: self.config.max_description,
            }
            .into());
        }
        let pin_ok = self
            .db
            .pin_verifier()?
            .is_some_and(|v| v.verify(&request.pin));
        if !pin_ok {
            return Err(ValidationError::PinRejected.into());
        }
        if !snapshot.status.accepts_transactions() {
            return Err(ValidationError::WalletNotActive(snapshot.status).into());
        }

        let mut merchant = request.merchant.clone();
        let mut nonce = None;
        if let Some(token) = &request.credential {
            let verified = CredentialVerifier::new(snapshot.trusted_issuers.iter().copied())
                .verify(token, &self.config.audience, now)?;
            match verified.subject {
                CredentialSubject::Merchant(m) => match &merchant {
                    Some(requested) if requested != &m => {
                        return Err(ValidationError::CredentialSubjectMismatch.into())
                    }
                    _ => merchant = Some(m),
                },
                CredentialSubject::Wallet(w) if w != self.config.wallet_id => {
                    return Err(ValidationError::CredentialSubjectMismatch.into())
                }
                CredentialSubject::Wallet(_) => {}
            }
            nonce = Some(verified.nonce);
        }

        if let Some(m) = &merchant {
            // A merchant the snapshot doesn't know yet is left to the authority.
            if let Some(fence) = snapshot.geofence_for(m) {
                geo::validate(request.location.as_ref(), fence).into_result(fence)?;
            }
        }

        let entries = self.db.entries()?;
        if self.config.enforce_projected_limit && request.kind.is_debit() {
            let projected = project(&snapshot, &entries);
            if request.amount > projected.projected_balance {
                return Err(ValidationError::WouldExceedLimit {
                    available: projected.projected_balance,
                    requested: request.amount,
                }
                .into());
            }
        }

        let sequence = self.db.next_sequence()?;
        let mut builder = TransactionBuilder::new(self.config.wallet_id, request.kind, request.amount)
            .key(IdempotencyKey::generate())
            .device(self.config.device_id.clone())
            .sequence(sequence)
            .description(request.description)
            .timestamp(now);
        if let Some(location) = request.location {
            builder = builder.location(location);
        }
        if let Some(m) = merchant {
            builder = builder.merchant(m);
        }
        if let Some(n) = nonce {
            builder = builder.credential_nonce(n);
        }
        let tx = builder.build();

        self.db.append(&QueueEntry {
            transaction: tx.clone(),
            status: TransactionStatus::Pending,
            enqueued_at: now,
        })?;
        debug!(key = %tx.key, sequence, kind = %tx.kind, amount = tx.amount, "transaction queued");
        Ok(tx)
    }

    // -- Reads --------------------------------------------------------------

    pub fn projected_balance(&self) -> Result<ProjectedBalance, ValidationError> {
        let snapshot = self.db.snapshot()?.ok_or(ValidationError::NoSnapshot)?;
        Ok(project(&snapshot, &self.db.entries()?))
    }

    /// Everything still waiting for a decision, in sequence order.
    pub fn pending(&self) -> DbResult<Vec<QueueEntry>> {
        self.db.entries()
    }

    pub fn len(&self) -> usize {
        self.db.queue_len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Current status of a key this device created, if it knows the key.
    pub fn outcome_of(&self, key: &IdempotencyKey) -> DbResult<Option<TransactionStatus>> {
        if let Some(settled) = self.db.settled(key)? {
            return Ok(Some(settled.outcome.status()));
        }
        Ok(self
            .db
            .entries()?
            .into_iter()
            .find(|e| &e.transaction.key == key)
            .map(|e| e.status))
    }

    pub fn settled(&self, key: &IdempotencyKey) -> DbResult<Option<SettledEntry>> {
        self.db.settled(key)
    }

    pub fn settled_history(&self) -> DbResult<Vec<SettledEntry>> {
        self.db.settled_all()
    }

    pub fn snapshot(&self) -> DbResult<Option<WalletSnapshot>> {
        self.db.snapshot()
    }

    pub fn cursor(&self) -> DbResult<SyncCursor> {
        Ok(self.db.cursor()?.unwrap_or_default())
    }

    // -- Sync-side operations -----------------------------------------------

    /// Up to `up_to` undecided transactions, oldest first, marked `Submitted`.
    pub fn drain(&self, up_to: usize) -> DbResult<Vec<Transaction>> {
        let _guard = self.write.lock();
        let mut batch: Vec<QueueEntry> = self.db.entries()?.into_iter().take(up_to).collect();
        for entry in &mut batch {
            entry.status = TransactionStatus::Submitted;
        }
        self.db.update_entries(&batch)?;
        Ok(batch.into_iter().map(|e| e.transaction).collect())
    }

    /// Claim the queue for one sync session. `None` while another session,
    /// from any engine, holds it.
    pub fn try_begin_session(&self) -> Option<SessionLease<'_>> {
        self.session_active
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| SessionLease {
                active: &self.session_active,
            })
    }

    /// Put every `Submitted` entry back to `Pending`. Returns how many moved.
    pub fn reset_submitted(&self) -> DbResult<usize> {
        let _guard = self.write.lock();
        let mut submitted: Vec<QueueEntry> = self
            .db
            .entries()?
            .into_iter()
            .filter(|e| e.status == TransactionStatus::Submitted)
            .collect();
        for entry in &mut submitted {
            entry.status = TransactionStatus::Pending;
        }
        self.db.update_entries(&submitted)?;
        Ok(submitted.len())
    }

    /// Record definitive outcomes without a snapshot refresh.
    pub fn acknowledge(&self, outcomes: &[SubmissionResult]) -> DbResult<AckReport> {
        self.reconcile(outcomes, None, Utc::now())
    }

    /// Record outcomes, advance the cursor and refresh the snapshot in one
    /// local commit.
    pub fn reconcile(
        &self,
        outcomes: &[SubmissionResult],
        snapshot: Option<&WalletSnapshot>,
        now: DateTime<Utc>,
    ) -> DbResult<AckReport> {
        let _guard = self.write.lock();
        let entries = self.db.entries()?;

        let mut report = AckReport::default();
        let mut settled = Vec::new();
        for result in outcomes {
            match entries.iter().find(|e| e.transaction.key == result.key) {
                Some(entry) => {
                    if result.outcome.is_accepted() {
                        report.accepted += 1;
                    } else {
                        report.rejected += 1;
                    }
                    settled.push(SettledEntry {
                        transaction: entry.transaction.clone(),
                        outcome: result.outcome.clone(),
                        settled_at: now,
                    });
                }
                None => report.ignored += 1,
            }
        }

        let lowest_remaining = entries
            .iter()
            .map(|e| e.transaction.sequence)
            .filter(|seq| !settled.iter().any(|s| s.transaction.sequence == *seq))
            .min();
        let acked_sequence = match lowest_remaining {
            Some(seq) => seq.saturating_sub(1),
            None => self.db.next_sequence()?.saturating_sub(1),
        };

        let current_snapshot = self.db.snapshot()?;
        let fresh = snapshot.filter(|s| {
            current_snapshot
                .as_ref()
                .map_or(true, |current| !s.is_older_than(current))
        });
        let observed_revision = fresh
            .map(|s| s.revision)
            .or_else(|| current_snapshot.as_ref().map(|s| s.revision))
            .unwrap_or(0);

        let cursor = self
            .db
            .cursor()?
            .unwrap_or_default()
            .advance(acked_sequence, observed_revision, now);
        self.db.reconcile(&settled, &cursor, fresh)?;

        debug!(
            device = %self.config.device_id,
            accepted = report.accepted,
            rejected = report.rejected,
            ignored = report.ignored,
            acked_sequence = cursor.acked_sequence,
            "outcomes acknowledged"
        );
        Ok(report)
    }
}

/// Apply queued entries to the snapshot with the same rules the authority
/// uses: debits add to spent, credits and refunds subtract, floored at zero.
fn project(snapshot: &WalletSnapshot, entries: &[QueueEntry]) -> ProjectedBalance {
    let mut spent = snapshot.spent;
    for entry in entries {
        let tx = &entry.transaction;
        spent = match tx.kind {
            TransactionKind::Debit => spent.saturating_add(tx.amount),
            TransactionKind::Credit | TransactionKind::Refund => spent.saturating_sub(tx.amount),
        };
    }
    ProjectedBalance {
        settled_balance: snapshot.balance,
        projected_balance: snapshot.credit_limit.saturating_sub(spent),
        projected_spent: spent,
        credit_limit: snapshot.credit_limit,
        pending_count: entries.len(),
        is_provisional: !entries.is_empty(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credential::CredentialIssuer;
    use crate::crypto::IssuerKeypair;
    use crate::geo::Geofence;
    use crate::ledger::outcome::RejectionReason;
    use crate::wallet::Wallet;
    use std::time::Duration;

    const PIN: &str = "4821";
    const AUD: &str = "coop-nakuru";

    struct Fixture {
        queue: LocalTransactionQueue,
        wallet: Wallet,
        issuer: CredentialIssuer,
    }

    fn fixture(limit: u64, spent: u64) -> Fixture {
        let mut wallet = Wallet::new(WalletId::new(), "member-9", limit, Utc::now());
        wallet.spent = spent;
        let issuer = CredentialIssuer::new(IssuerKeypair::from_seed(&[5u8; 32]));
        let fence = Geofence::new(
            MerchantId::new("agro-dealer-17"),
            Coordinate::new(-1.2921, 36.8219).unwrap(),
            100.0,
            true,
        )
        .unwrap();

        let queue = LocalTransactionQueue::open_temporary(QueueConfig::new(
            DeviceId::new("phone-1"),
            wallet.id,
            AUD,
        ))
        .unwrap();
        queue.set_pin_verifier(&PinVerifier::new(PIN).unwrap()).unwrap();
        queue
            .install_snapshot(&wallet.snapshot(vec![fence], vec![issuer.public_key()], Utc::now()))
            .unwrap();
        Fixture {
            queue,
            wallet,
            issuer,
        }
    }

    fn accepted(key: IdempotencyKey, revision: u64) -> SubmissionResult {
        SubmissionResult {
            key,
            outcome: Outcome::Accepted {
                revision,
                spent_after: 0,
                balance_after: 0,
                applied_at: Utc::now(),
            },
            replayed: false,
        }
    }

    #[test]
    fn test_one_session_lease_at_a_time() {
        let f = fixture(100, 0);
        let lease = f.queue.try_begin_session().unwrap();
        assert!(f.queue.try_begin_session().is_none());
        drop(lease);
        assert!(f.queue.try_begin_session().is_some());
    }

    #[test]
    fn test_enqueue_assigns_sequence_and_projects() {
        let f = fixture(100, 20);
        let a = f.queue.enqueue(TransactionRequest::debit(30, PIN)).unwrap();
        let b = f
            .queue
            .enqueue(TransactionRequest::new(TransactionKind::Credit, 10, PIN))
            .unwrap();
        assert_eq!(a.sequence, 1);
        assert_eq!(b.sequence, 2);
        assert_ne!(a.key, b.key);

        let p = f.queue.projected_balance().unwrap();
        assert_eq!(p.settled_balance, 80);
        assert_eq!(p.projected_spent, 40);
        assert_eq!(p.projected_balance, 60);
        assert!(p.is_provisional);
    }

    #[test]
    fn test_enqueue_validation_failures() {
        let f = fixture(100, 0);
        assert!(matches!(
            f.queue.enqueue(TransactionRequest::debit(0, PIN)),
            Err(EnqueueError::Validation(ValidationError::NonPositiveAmount))
        ));
        assert!(matches!(
            f.queue.enqueue(TransactionRequest::debit(5, "0000")),
            Err(EnqueueError::Validation(ValidationError::PinRejected))
        ));
        assert!(matches!(
            f.queue.enqueue(TransactionRequest::debit(5, PIN).description("x".repeat(300))),
            Err(EnqueueError::Validation(ValidationError::DescriptionTooLong { .. }))
        ));
        assert!(matches!(
            f.queue.enqueue(TransactionRequest::debit(101, PIN)),
            Err(EnqueueError::Validation(ValidationError::WouldExceedLimit {
                available: 100,
                requested: 101
            }))
        ));
        assert!(f.queue.is_empty());
    }

    #[test]
    fn test_enqueue_without_snapshot() {
        let queue = LocalTransactionQueue::open_temporary(QueueConfig::new(
            DeviceId::new("phone-2"),
            WalletId::new(),
            AUD,
        ))
        .unwrap();
        assert!(matches!(
            queue.enqueue(TransactionRequest::debit(5, PIN)),
            Err(EnqueueError::Validation(ValidationError::NoSnapshot))
        ));
    }

    #[test]
    fn test_suspended_snapshot_blocks_enqueue() {
        let f = fixture(100, 0);
        let mut w = f.wallet.clone();
        w.suspend(Utc::now()).unwrap();
        f.queue.install_snapshot(&w.snapshot(vec![], vec![], Utc::now())).unwrap();
        let err = f.queue.enqueue(TransactionRequest::debit(5, PIN)).unwrap_err();
        assert!(matches!(
            err,
            EnqueueError::Validation(ValidationError::WalletNotActive(WalletStatus::Suspended))
        ));
        assert_eq!(err.class(), ErrorClass::Validation);
    }

    #[test]
    fn test_local_geofence_fails_fast() {
        let f = fixture(100, 0);
        let far = Coordinate::new(-1.2921 + 0.0045, 36.8219).unwrap();
        let err = f
            .queue
            .enqueue(
                TransactionRequest::debit(5, PIN)
                    .merchant(MerchantId::new("agro-dealer-17"))
                    .location(far),
            )
            .unwrap_err();
        assert!(matches!(
            err,
            EnqueueError::Authorization(AuthorizationError::OutOfRange { .. })
        ));
        assert_eq!(err.class(), ErrorClass::Authorization);

        let err = f
            .queue
            .enqueue(TransactionRequest::debit(5, PIN).merchant(MerchantId::new("agro-dealer-17")))
            .unwrap_err();
        assert!(matches!(
            err,
            EnqueueError::Authorization(AuthorizationError::LocationRequired)
        ));
    }

    #[test]
    fn test_credential_sets_merchant_and_nonce() {
        let f = fixture(100, 0);
        let now = Utc::now();
        let token = f
            .issuer
            .issue(
                CredentialSubject::Merchant(MerchantId::new("agro-dealer-17")),
                AUD,
                Duration::from_secs(120),
                now,
            )
            .unwrap();
        let tx = f
            .queue
            .enqueue_at(
                TransactionRequest::debit(5, PIN)
                    .credential(token)
                    .location(Coordinate::new(-1.2921, 36.8219).unwrap()),
                now,
            )
            .unwrap();
        assert_eq!(tx.merchant, Some(MerchantId::new("agro-dealer-17")));
        assert!(tx.credential_nonce.is_some());
    }

    #[test]
    fn test_expired_and_foreign_credentials() {
        let f = fixture(100, 0);
        let issued = Utc::now();
        let wallet_token = f
            .issuer
            .issue(
                CredentialSubject::Wallet(WalletId::new()),
                AUD,
                Duration::from_secs(60),
                issued,
            )
            .unwrap();
        assert!(matches!(
            f.queue.enqueue_at(
                TransactionRequest::debit(5, PIN).credential(wallet_token.clone()),
                issued
            ),
            Err(EnqueueError::Validation(ValidationError::CredentialSubjectMismatch))
        ));
        assert!(matches!(
            f.queue.enqueue_at(
                TransactionRequest::debit(5, PIN).credential(wallet_token),
                issued + chrono::Duration::seconds(61)
            ),
            Err(EnqueueError::Authorization(AuthorizationError::Expired))
        ));
    }

    #[test]
    fn test_drain_marks_submitted_in_order() {
        let f = fixture(1_000, 0);
        for amount in [1, 2, 3] {
            f.queue.enqueue(TransactionRequest::debit(amount, PIN)).unwrap();
        }
        let batch = f.queue.drain(2).unwrap();
        assert_eq!(batch.iter().map(|t| t.amount).collect::<Vec<_>>(), vec![1, 2]);
        assert_eq!(
            f.queue.outcome_of(&batch[0].key).unwrap(),
            Some(TransactionStatus::Submitted)
        );
        assert_eq!(f.queue.reset_submitted().unwrap(), 2);
        assert_eq!(
            f.queue.outcome_of(&batch[0].key).unwrap(),
            Some(TransactionStatus::Pending)
        );
    }

    #[test]
    fn test_acknowledge_removes_only_decided_entries() {
        let f = fixture(1_000, 0);
        let a = f.queue.enqueue(TransactionRequest::debit(10, PIN)).unwrap();
        let b = f.queue.enqueue(TransactionRequest::debit(20, PIN)).unwrap();
        f.queue.drain(10).unwrap();

        let rejected_b = SubmissionResult {
            key: b.key,
            outcome: Outcome::Rejected {
                reason: RejectionReason::LimitExceeded {
                    available: 0,
                    requested: 20,
                },
                decided_at: Utc::now(),
            },
            replayed: false,
        };
        let stranger = accepted(IdempotencyKey::generate(), 9);
        let report = f.queue.acknowledge(&[rejected_b, stranger]).unwrap();
        assert_eq!(
            report,
            AckReport {
                accepted: 0,
                rejected: 1,
                ignored: 1
            }
        );

        // `a` has no outcome yet, so it stays and holds the cursor back.
        assert_eq!(f.queue.len(), 1);
        assert_eq!(
            f.queue.outcome_of(&a.key).unwrap(),
            Some(TransactionStatus::Submitted)
        );
        assert_eq!(
            f.queue.outcome_of(&b.key).unwrap(),
            Some(TransactionStatus::Rejected)
        );
        assert_eq!(f.queue.cursor().unwrap().acked_sequence, 0);

        f.queue.acknowledge(&[accepted(a.key, 1)]).unwrap();
        assert!(f.queue.is_empty());
        assert_eq!(f.queue.cursor().unwrap().acked_sequence, 2);
        assert_eq!(f.queue.settled_history().unwrap().len(), 2);
    }

    #[test]
    fn test_reconcile_refreshes_snapshot_but_never_regresses() {
        let f = fixture(100, 0);
        let mut newer = f.wallet.clone();
        newer.set_credit_limit(200, Utc::now()).unwrap();
        let newer_snap = newer.snapshot(vec![], vec![], Utc::now());
        f.queue.reconcile(&[], Some(&newer_snap), Utc::now()).unwrap();
        assert_eq!(f.queue.snapshot().unwrap().unwrap().credit_limit, 200);
        assert_eq!(f.queue.cursor().unwrap().observed_revision, 1);

        let stale = f.wallet.snapshot(vec![], vec![], Utc::now());
        f.queue.reconcile(&[], Some(&stale), Utc::now()).unwrap();
        assert_eq!(f.queue.snapshot().unwrap().unwrap().credit_limit, 200);
    }

    #[test]
    fn test_restart_resets_submitted_and_keeps_everything() {
        let dir = tempfile::tempdir().unwrap();
        let wallet = Wallet::new(WalletId::new(), "member-3", 100, Utc::now());
        let config = QueueConfig::new(DeviceId::new("phone-3"), wallet.id, AUD);
        let key;
        {
            let queue =
                LocalTransactionQueue::open(DeviceDb::open(dir.path()).unwrap(), config.clone())
                    .unwrap();
            queue.set_pin_verifier(&PinVerifier::new(PIN).unwrap()).unwrap();
            queue
                .install_snapshot(&wallet.snapshot(vec![], vec![], Utc::now()))
                .unwrap();
            key = queue.enqueue(TransactionRequest::debit(15, PIN)).unwrap().key;
            queue.drain(1).unwrap();
        }
        let queue = LocalTransactionQueue::open(DeviceDb::open(dir.path()).unwrap(), config).unwrap();
        assert_eq!(queue.outcome_of(&key).unwrap(), Some(TransactionStatus::Pending));
        assert_eq!(queue.projected_balance().unwrap().projected_balance, 85);
        let next = queue.enqueue(TransactionRequest::debit(1, PIN)).unwrap();
        assert_eq!(next.sequence, 2);
    }
}
