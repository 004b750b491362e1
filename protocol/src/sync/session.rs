//! # Sync Engine
//!
//! Drives one device's queue through sessions with the authority.
//!
//! ```text
//!            trigger
//!   Idle ─────────────▶ Connecting ──▶ Exchanging ⇄ Reconciling ──▶ Idle
//!                          │              │
//!                          └──────────────┴──▶ Disconnected ──▶ Idle
//! ```
//!
//! A session opens, then loops `drain → exchange → reconcile` until the
//! queue is empty. Every reconcile is one local commit. Transport failures,
//! timeouts and a dropped session future all end the same way: entries the
//! authority has not answered for go back to `Pending`, and nothing the
//! device did not hear back about is acknowledged.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep, timeout, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::messages::{ExchangeRequest, SessionOpenRequest};
use super::transport::{AuthorityTransport, TransportError};
use crate::config::{
    DEFAULT_CONNECT_TIMEOUT, DEFAULT_EXCHANGE_TIMEOUT, DEFAULT_RETRY_BASE_DELAY,
    DEFAULT_SYNC_BATCH_SIZE, DEFAULT_SYNC_INTERVAL, DEFAULT_SYNC_MAX_RETRIES, MAX_RETRY_DELAY,
};
use crate::device::LocalTransactionQueue;
use crate::storage::DbError;

// ---------------------------------------------------------------------------
// State, triggers, config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    Idle,
    Connecting,
    Exchanging,
    Reconciling,
    Disconnected,
}

/// Why a session started.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncTrigger {
    ConnectivityRegained,
    Timer,
    UserRequested,
}

/// Tuning knobs for the sync engine.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Transactions per exchange.
    pub batch_size: usize,
    pub exchange_timeout: Duration,
    pub connect_timeout: Duration,
    /// Retries of a failed session in [`SyncEngine::sync_with_retry`].
    pub max_retries: u32,
    /// First retry delay. Doubles per retry, capped at `MAX_RETRY_DELAY`.
    pub retry_base_delay: Duration,
    /// Background sync period while online.
    pub timer_interval: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_SYNC_BATCH_SIZE,
            exchange_timeout: DEFAULT_EXCHANGE_TIMEOUT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            max_retries: DEFAULT_SYNC_MAX_RETRIES,
            retry_base_delay: DEFAULT_RETRY_BASE_DELAY,
            timer_interval: DEFAULT_SYNC_INTERVAL,
        }
    }
}

impl SyncConfig {
    fn backoff(&self, attempt: u32) -> Duration {
        self.retry_base_delay
            .saturating_mul(2u32.saturating_pow(attempt))
            .min(MAX_RETRY_DELAY)
    }
}

/// Summary of one completed session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub batches: usize,
    pub submitted: usize,
    pub accepted: usize,
    pub rejected: usize,
    /// Results that were stored outcomes of earlier submissions.
    pub replayed: usize,
    /// Wallet revision in the snapshot installed at the end.
    pub revision: u64,
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("a sync session is already running on this device")]
    SessionInProgress,

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("local storage error: {0}")]
    Storage(#[from] DbError),
}

// ---------------------------------------------------------------------------
// SyncEngine
// ---------------------------------------------------------------------------

pub struct SyncEngine {
    queue: Arc<LocalTransactionQueue>,
    transport: Arc<dyn AuthorityTransport>,
    config: SyncConfig,
    state: watch::Sender<SyncState>,
}

/// Restores the queue and state if a session ends without finishing,
/// whether by error or by its future being dropped.
struct SessionGuard<'a> {
    engine: &'a SyncEngine,
    finished: bool,
}

impl Drop for SessionGuard<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.engine.set_state(SyncState::Disconnected);
            match self.engine.queue.reset_submitted() {
                Ok(n) if n > 0 => debug!(reverted = n, "submitted entries returned to pending"),
                Ok(_) => {}
                Err(e) => warn!(error = %e, "could not revert submitted entries"),
            }
        }
        self.engine.set_state(SyncState::Idle);
    }
}

impl SyncEngine {
    pub fn new(
        queue: Arc<LocalTransactionQueue>,
        transport: Arc<dyn AuthorityTransport>,
        config: SyncConfig,
    ) -> Self {
        let (state, _) = watch::channel(SyncState::Idle);
        Self {
            queue,
            transport,
            config,
            state,
        }
    }

    pub fn queue(&self) -> &Arc<LocalTransactionQueue> {
        &self.queue
    }

    pub fn state(&self) -> SyncState {
        *self.state.borrow()
    }

    /// Observe state transitions.
    pub fn subscribe(&self) -> watch::Receiver<SyncState> {
        self.state.subscribe()
    }

    fn set_state(&self, state: SyncState) {
        self.state.send_replace(state);
    }

    /// Run one session to completion.
    pub async fn sync_once(&self, trigger: SyncTrigger) -> Result<SyncReport, SyncError> {
        let _lease = self
            .queue
            .try_begin_session()
            .ok_or(SyncError::SessionInProgress)?;
        let mut guard = SessionGuard {
            engine: self,
            finished: false,
        };

        match self.run_session(trigger).await {
            Ok(report) => {
                guard.finished = true;
                info!(
                    device = %self.queue.device_id(),
                    ?trigger,
                    batches = report.batches,
                    accepted = report.accepted,
                    rejected = report.rejected,
                    replayed = report.replayed,
                    revision = report.revision,
                    "sync session complete"
                );
                Ok(report)
            }
            Err(e) => {
                warn!(device = %self.queue.device_id(), ?trigger, error = %e, "sync session failed");
                Err(e)
            }
        }
    }

    /// [`sync_once`](Self::sync_once), retrying retryable transport
    /// failures with exponential backoff.
    pub async fn sync_with_retry(&self, trigger: SyncTrigger) -> Result<SyncReport, SyncError> {
        let mut attempt = 0;
        loop {
            match self.sync_once(trigger).await {
                Err(SyncError::Transport(e))
                    if e.is_retryable() && attempt < self.config.max_retries =>
                {
                    let delay = self.config.backoff(attempt);
                    debug!(attempt, ?delay, error = %e, "retrying sync");
                    sleep(delay).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    /// Background loop: sync when connectivity comes back, on every timer
    /// tick while online, and on explicit requests. Returns once both the
    /// connectivity sender and the trigger sender are gone.
    pub async fn run(
        &self,
        mut connectivity: watch::Receiver<bool>,
        mut requests: mpsc::Receiver<SyncTrigger>,
    ) {
        let mut ticker = tokio::time::interval(self.config.timer_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut watching = true;
        let mut listening = true;

        while watching || listening {
            let trigger = tokio::select! {
                changed = connectivity.changed(), if watching => {
                    if changed.is_err() {
                        watching = false;
                        continue;
                    }
                    if !*connectivity.borrow_and_update() {
                        continue;
                    }
                    SyncTrigger::ConnectivityRegained
                }
                request = requests.recv(), if listening => match request {
                    Some(trigger) => trigger,
                    None => {
                        listening = false;
                        continue;
                    }
                },
                _ = ticker.tick() => {
                    if !*connectivity.borrow() {
                        continue;
                    }
                    SyncTrigger::Timer
                }
            };

            match self.sync_with_retry(trigger).await {
                Ok(_) | Err(SyncError::SessionInProgress) => {}
                Err(e) => debug!(error = %e, "giving up until next trigger"),
            }
        }
    }

    async fn run_session(&self, trigger: SyncTrigger) -> Result<SyncReport, SyncError> {
        let device_id = self.queue.device_id().clone();
        let wallet_id = self.queue.wallet_id();

        self.set_state(SyncState::Connecting);
        let open_req = SessionOpenRequest::new(device_id.clone(), wallet_id, self.queue.cursor()?);
        let opened = timeout(self.config.connect_timeout, self.transport.open_session(open_req))
            .await
            .map_err(|_| TransportError::Timeout)??;
        debug!(session = %opened.session_id, ?trigger, revision = opened.snapshot.revision, "session open");
        let mut snapshot = opened.snapshot;
        let mut report = SyncReport::default();

        loop {
            self.set_state(SyncState::Exchanging);
            let batch = self.queue.drain(self.config.batch_size)?;
            if batch.is_empty() {
                break;
            }

            let req = ExchangeRequest {
                session_id: opened.session_id,
                device_id: device_id.clone(),
                wallet_id,
                cursor: self.queue.cursor()?,
                transactions: batch.clone(),
            };
            let resp = timeout(self.config.exchange_timeout, self.transport.exchange(req))
                .await
                .map_err(|_| TransportError::Timeout)??;

            if let Some(missing) = batch
                .iter()
                .find(|tx| !resp.results.iter().any(|r| r.key == tx.key))
            {
                return Err(TransportError::Protocol(format!("no outcome for {}", missing.key)).into());
            }

            self.set_state(SyncState::Reconciling);
            let ack = self.queue.reconcile(&resp.results, Some(&resp.snapshot), Utc::now())?;
            report.batches += 1;
            report.submitted += batch.len();
            report.accepted += ack.accepted;
            report.rejected += ack.rejected;
            report.replayed += resp.results.iter().filter(|r| r.replayed).count();
            snapshot = resp.snapshot;
        }

        if report.batches == 0 {
            self.set_state(SyncState::Reconciling);
            self.queue.reconcile(&[], Some(&snapshot), Utc::now())?;
        }
        report.revision = snapshot.revision;
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{QueueConfig, TransactionRequest};
    use crate::ledger::WalletLedgerAuthority;
    use crate::sync::InProcessTransport;
    use crate::transaction::types::{DeviceId, TransactionStatus};
    use crate::wallet::PinVerifier;

    const PIN: &str = "2468";

    struct Rig {
        authority: Arc<WalletLedgerAuthority>,
        transport: InProcessTransport,
        engine: SyncEngine,
    }

    fn rig(limit: u64, batch_size: usize) -> Rig {
        let authority = Arc::new(WalletLedgerAuthority::open_temporary().unwrap());
        let wallet = authority.provision_wallet("member-1", limit).unwrap();
        let queue = LocalTransactionQueue::open_temporary(QueueConfig::new(
            DeviceId::new("phone-1"),
            wallet.id,
            "coop",
        ))
        .unwrap();
        queue.set_pin_verifier(&PinVerifier::new(PIN).unwrap()).unwrap();
        queue
            .install_snapshot(&authority.snapshot(&wallet.id).unwrap().unwrap())
            .unwrap();
        let transport = InProcessTransport::new(authority.clone());
        let engine = SyncEngine::new(
            Arc::new(queue),
            Arc::new(transport.clone()),
            SyncConfig {
                batch_size,
                retry_base_delay: Duration::from_millis(1),
                ..SyncConfig::default()
            },
        );
        Rig {
            authority,
            transport,
            engine,
        }
    }

    #[tokio::test]
    async fn test_session_drains_queue_in_batches() {
        let r = rig(1_000, 2);
        for amount in [10, 20, 30, 40, 50] {
            r.engine.queue().enqueue(TransactionRequest::debit(amount, PIN)).unwrap();
        }
        let report = r.engine.sync_once(SyncTrigger::UserRequested).await.unwrap();
        assert_eq!(report.batches, 3);
        assert_eq!(report.accepted, 5);
        assert!(r.engine.queue().is_empty());
        assert_eq!(r.engine.state(), SyncState::Idle);

        let wallet = r.authority.wallet(&r.engine.queue().wallet_id()).unwrap().unwrap();
        assert_eq!(wallet.spent, 150);
        let p = r.engine.queue().projected_balance().unwrap();
        assert_eq!(p.settled_balance, 850);
        assert!(!p.is_provisional);
        assert_eq!(r.engine.queue().cursor().unwrap().acked_sequence, 5);
    }

    #[tokio::test]
    async fn test_lost_response_is_resubmitted_without_double_apply() {
        let r = rig(100, 64);
        let tx = r.engine.queue().enqueue(TransactionRequest::debit(60, PIN)).unwrap();

        r.transport.drop_next_responses(1);
        let err = r.engine.sync_once(SyncTrigger::Timer).await.unwrap_err();
        assert!(matches!(err, SyncError::Transport(TransportError::Timeout)));
        assert_eq!(
            r.engine.queue().outcome_of(&tx.key).unwrap(),
            Some(TransactionStatus::Pending)
        );

        let report = r.engine.sync_once(SyncTrigger::Timer).await.unwrap();
        assert_eq!(report.replayed, 1);
        assert_eq!(
            r.engine.queue().outcome_of(&tx.key).unwrap(),
            Some(TransactionStatus::Accepted)
        );
        let wallet = r.authority.wallet(&tx.wallet_id).unwrap().unwrap();
        assert_eq!(wallet.spent, 60);
    }

    #[tokio::test]
    async fn test_retry_recovers_from_transient_failures() {
        let r = rig(100, 64);
        r.engine.queue().enqueue(TransactionRequest::debit(5, PIN)).unwrap();
        r.transport.fail_next_opens(2);
        let report = r.engine.sync_with_retry(SyncTrigger::UserRequested).await.unwrap();
        assert_eq!(report.accepted, 1);
    }

    #[tokio::test]
    async fn test_retry_budget_is_bounded() {
        let r = rig(100, 64);
        r.engine.queue().enqueue(TransactionRequest::debit(5, PIN)).unwrap();
        r.transport.set_offline(true);
        let err = r.engine.sync_with_retry(SyncTrigger::UserRequested).await.unwrap_err();
        assert!(matches!(err, SyncError::Transport(TransportError::Unreachable(_))));
        assert_eq!(r.engine.queue().len(), 1);
        assert_eq!(r.transport.exchange_count(), 0);
    }

    #[tokio::test]
    async fn test_second_concurrent_session_is_refused() {
        let r = rig(100, 64);
        let _held = r.engine.queue().try_begin_session().unwrap();
        assert!(matches!(
            r.engine.sync_once(SyncTrigger::UserRequested).await,
            Err(SyncError::SessionInProgress)
        ));
    }

    #[tokio::test]
    async fn test_engines_sharing_a_queue_take_turns() {
        let r = rig(100, 64);
        let tx = r.engine.queue().enqueue(TransactionRequest::debit(30, PIN)).unwrap();
        let other = SyncEngine::new(
            r.engine.queue().clone(),
            Arc::new(r.transport.clone()),
            SyncConfig::default(),
        );

        {
            let _held = r.engine.queue().try_begin_session().unwrap();
            assert!(matches!(
                other.sync_once(SyncTrigger::UserRequested).await,
                Err(SyncError::SessionInProgress)
            ));
            assert_eq!(r.transport.exchange_count(), 0);
        }

        let report = other.sync_once(SyncTrigger::UserRequested).await.unwrap();
        assert_eq!(report.accepted, 1);
        assert_eq!(
            r.engine.queue().outcome_of(&tx.key).unwrap(),
            Some(TransactionStatus::Accepted)
        );
        // Released after the session, so the first engine can sync again.
        assert!(r.engine.sync_once(SyncTrigger::Timer).await.is_ok());
    }

    #[tokio::test]
    async fn test_empty_queue_still_refreshes_snapshot() {
        let r = rig(100, 64);
        let id = r.engine.queue().wallet_id();
        r.authority.set_credit_limit(&id, 250).unwrap();
        let report = r.engine.sync_once(SyncTrigger::ConnectivityRegained).await.unwrap();
        assert_eq!(report.batches, 0);
        assert_eq!(report.revision, 1);
        let snap = r.engine.queue().snapshot().unwrap().unwrap();
        assert_eq!(snap.credit_limit, 250);
        assert!(r.engine.queue().cursor().unwrap().last_session_at.is_some());
    }

    #[tokio::test]
    async fn test_rejections_settle_and_leave_queue() {
        let r = rig(100, 64);
        let q = r.engine.queue();
        let a = q.enqueue(TransactionRequest::debit(50, PIN)).unwrap();
        // The authority tightens the limit while the device is offline.
        r.authority.set_credit_limit(&a.wallet_id, 60).unwrap();
        let b = q.enqueue(TransactionRequest::debit(40, PIN)).unwrap();

        let report = r.engine.sync_once(SyncTrigger::UserRequested).await.unwrap();
        assert_eq!((report.accepted, report.rejected), (1, 1));
        assert_eq!(q.outcome_of(&b.key).unwrap(), Some(TransactionStatus::Rejected));
        assert!(q.is_empty());
        assert_eq!(q.projected_balance().unwrap().projected_balance, 10);
    }

    #[tokio::test]
    async fn test_run_syncs_on_connectivity_and_requests() {
        let r = rig(100, 64);
        r.engine.queue().enqueue(TransactionRequest::debit(5, PIN)).unwrap();

        let (online_tx, online_rx) = watch::channel(false);
        let (req_tx, req_rx) = mpsc::channel(4);
        let engine = Arc::new(r.engine);
        let runner = {
            let engine = engine.clone();
            tokio::spawn(async move { engine.run(online_rx, req_rx).await })
        };

        let states = engine.subscribe();
        online_tx.send(true).unwrap();
        for _ in 0..100 {
            if engine.queue().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(engine.queue().is_empty());

        engine.queue().enqueue(TransactionRequest::debit(7, PIN)).unwrap();
        req_tx.send(SyncTrigger::UserRequested).await.unwrap();
        for _ in 0..100 {
            if engine.queue().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(engine.queue().is_empty());

        assert_eq!(*states.borrow(), SyncState::Idle);

        drop(online_tx);
        drop(req_tx);
        tokio::time::timeout(Duration::from_secs(5), runner)
            .await
            .unwrap()
            .unwrap();
    }
}
