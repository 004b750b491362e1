//! Authority side of the sync protocol.
//!
//! [`SyncService`] turns wire messages into [`WalletLedgerAuthority`] calls.
//! Both the in-process transport and the node's HTTP handlers go through
//! it, so the two paths cannot drift apart.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

use super::messages::{
    ExchangeRequest, ExchangeResponse, SessionId, SessionOpenRequest, SessionOpenResponse,
};
use crate::config::{
    MAX_EXCHANGE_BATCH, PROTOCOL_FINGERPRINT, SESSION_IDLE_TIMEOUT, WIRE_PROTOCOL_VERSION,
};
use crate::ledger::{AuthorityError, WalletLedgerAuthority};
use crate::transaction::types::{DeviceId, WalletId};

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("unsupported protocol {fingerprint} v{version}")]
    UnsupportedProtocol { fingerprint: String, version: u16 },

    #[error("wallet {0} not found")]
    UnknownWallet(WalletId),

    /// The session expired, was never opened, or belongs to another device.
    #[error("unknown session {0}")]
    UnknownSession(SessionId),

    #[error("batch of {len} transactions exceeds the limit of {max}")]
    BatchTooLarge { len: usize, max: usize },

    #[error("transaction for wallet {found} in a session for wallet {expected}")]
    WalletMismatch { expected: WalletId, found: WalletId },

    #[error(transparent)]
    Authority(#[from] AuthorityError),
}

impl ServiceError {
    /// Whether the device should try again later with the same data.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ServiceError::UnknownSession(_)
                | ServiceError::Authority(AuthorityError::Db(_))
                | ServiceError::Authority(AuthorityError::Contention(_))
        )
    }
}

#[derive(Debug, Clone)]
struct OpenSession {
    device_id: DeviceId,
    wallet_id: WalletId,
    last_seen: DateTime<Utc>,
}

/// Session bookkeeping in front of the authority.
pub struct SyncService {
    authority: Arc<WalletLedgerAuthority>,
    sessions: DashMap<SessionId, OpenSession>,
    idle_timeout: Duration,
}

impl SyncService {
    pub fn new(authority: Arc<WalletLedgerAuthority>) -> Self {
        Self {
            authority,
            sessions: DashMap::new(),
            idle_timeout: SESSION_IDLE_TIMEOUT,
        }
    }

    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    pub fn authority(&self) -> &Arc<WalletLedgerAuthority> {
        &self.authority
    }

    pub fn open_sessions(&self) -> usize {
        self.sessions.len()
    }

    pub fn open(&self, req: SessionOpenRequest) -> Result<SessionOpenResponse, ServiceError> {
        if req.fingerprint != PROTOCOL_FINGERPRINT || req.wire_version != WIRE_PROTOCOL_VERSION {
            return Err(ServiceError::UnsupportedProtocol {
                fingerprint: req.fingerprint,
                version: req.wire_version,
            });
        }
        let snapshot = self
            .authority
            .snapshot(&req.wallet_id)?
            .ok_or(ServiceError::UnknownWallet(req.wallet_id))?;

        let now = Utc::now();
        self.expire_idle(now);
        let session_id = Uuid::new_v4();
        self.sessions.insert(
            session_id,
            OpenSession {
                device_id: req.device_id.clone(),
                wallet_id: req.wallet_id,
                last_seen: now,
            },
        );
        info!(
            session = %session_id,
            device = %req.device_id,
            wallet = %req.wallet_id,
            acked_sequence = req.cursor.acked_sequence,
            "sync session opened"
        );
        Ok(SessionOpenResponse {
            session_id,
            snapshot,
            server_time: now,
        })
    }

    /// Decide a batch in request order and return the refreshed snapshot.
    pub fn exchange(&self, req: ExchangeRequest) -> Result<ExchangeResponse, ServiceError> {
        let now = Utc::now();
        let expired = {
            let mut session = self
                .sessions
                .get_mut(&req.session_id)
                .filter(|s| s.device_id == req.device_id && s.wallet_id == req.wallet_id)
                .ok_or(ServiceError::UnknownSession(req.session_id))?;
            if self.is_idle(&session, now) {
                true
            } else {
                session.last_seen = now;
                false
            }
        };
        if expired {
            self.sessions.remove(&req.session_id);
            debug!(session = %req.session_id, "exchange on expired session");
            return Err(ServiceError::UnknownSession(req.session_id));
        }
        if req.transactions.len() > MAX_EXCHANGE_BATCH {
            return Err(ServiceError::BatchTooLarge {
                len: req.transactions.len(),
                max: MAX_EXCHANGE_BATCH,
            });
        }
        if let Some(tx) = req.transactions.iter().find(|t| t.wallet_id != req.wallet_id) {
            return Err(ServiceError::WalletMismatch {
                expected: req.wallet_id,
                found: tx.wallet_id,
            });
        }

        let results = self.authority.submit_batch(&req.transactions)?;
        let snapshot = self
            .authority
            .snapshot(&req.wallet_id)?
            .ok_or(ServiceError::UnknownWallet(req.wallet_id))?;
        debug!(
            session = %req.session_id,
            submitted = req.transactions.len(),
            revision = snapshot.revision,
            "exchange complete"
        );
        Ok(ExchangeResponse { results, snapshot })
    }

    fn is_idle(&self, session: &OpenSession, now: DateTime<Utc>) -> bool {
        match chrono::Duration::from_std(self.idle_timeout) {
            Ok(ttl) => now - session.last_seen > ttl,
            Err(_) => false,
        }
    }

    fn expire_idle(&self, now: DateTime<Utc>) {
        self.sessions.retain(|_, s| !self.is_idle(s, now));
    }
}
