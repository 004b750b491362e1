//! How a device reaches the authority.
//!
//! The sync engine only sees [`AuthorityTransport`]. Production devices
//! use [`super::http::HttpTransport`]; tests and single-process deployments
//! use [`InProcessTransport`], which can also inject failures.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use super::messages::{ExchangeRequest, ExchangeResponse, SessionOpenRequest, SessionOpenResponse};
use super::service::{ServiceError, SyncService};
use crate::error::ErrorClass;
use crate::ledger::WalletLedgerAuthority;

/// Connectivity failures. Always safe to retry: every request is either
/// read-only or idempotent by key.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("authority unreachable: {0}")]
    Unreachable(String),

    #[error("authority did not answer in time")]
    Timeout,

    /// The response could not be understood.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The authority answered with an error.
    #[error("authority error: {message}")]
    Server { message: String, retryable: bool },
}

impl TransportError {
    pub fn class(&self) -> ErrorClass {
        ErrorClass::Transport
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            TransportError::Unreachable(_) | TransportError::Timeout => true,
            TransportError::Protocol(_) => false,
            TransportError::Server { retryable, .. } => *retryable,
        }
    }
}

impl From<ServiceError> for TransportError {
    fn from(err: ServiceError) -> Self {
        TransportError::Server {
            retryable: err.is_retryable(),
            message: err.to_string(),
        }
    }
}

#[async_trait]
pub trait AuthorityTransport: Send + Sync {
    async fn open_session(
        &self,
        req: SessionOpenRequest,
    ) -> Result<SessionOpenResponse, TransportError>;

    async fn exchange(&self, req: ExchangeRequest) -> Result<ExchangeResponse, TransportError>;
}

// ---------------------------------------------------------------------------
// InProcessTransport
// ---------------------------------------------------------------------------

/// Calls a [`SyncService`] directly.
///
/// Fault switches (all off by default):
/// - `set_offline(true)`: every call fails with `Unreachable`.
/// - `fail_next_opens(n)` / `fail_next_exchanges(n)`: the next `n` calls
///   fail before reaching the authority.
/// - `drop_next_responses(n)`: the next `n` exchanges are applied by the
///   authority, then the response is lost. The device cannot tell this
///   apart from a request that never arrived.
#[derive(Clone)]
pub struct InProcessTransport {
    service: Arc<SyncService>,
    offline: Arc<AtomicBool>,
    fail_opens: Arc<AtomicUsize>,
    fail_exchanges: Arc<AtomicUsize>,
    drop_responses: Arc<AtomicUsize>,
    exchanges: Arc<AtomicUsize>,
}

impl InProcessTransport {
    pub fn new(authority: Arc<WalletLedgerAuthority>) -> Self {
        Self::with_service(Arc::new(SyncService::new(authority)))
    }

    pub fn with_service(service: Arc<SyncService>) -> Self {
        Self {
            service,
            offline: Arc::new(AtomicBool::new(false)),
            fail_opens: Arc::new(AtomicUsize::new(0)),
            fail_exchanges: Arc::new(AtomicUsize::new(0)),
            drop_responses: Arc::new(AtomicUsize::new(0)),
            exchanges: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn service(&self) -> &Arc<SyncService> {
        &self.service
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn fail_next_opens(&self, n: usize) {
        self.fail_opens.store(n, Ordering::SeqCst);
    }

    pub fn fail_next_exchanges(&self, n: usize) {
        self.fail_exchanges.store(n, Ordering::SeqCst);
    }

    pub fn drop_next_responses(&self, n: usize) {
        self.drop_responses.store(n, Ordering::SeqCst);
    }

    /// Exchanges that reached the authority.
    pub fn exchange_count(&self) -> usize {
        self.exchanges.load(Ordering::SeqCst)
    }

    fn check_link(&self) -> Result<(), TransportError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(TransportError::Unreachable("device offline".into()));
        }
        Ok(())
    }
}

/// Decrement `counter` if positive. Returns whether it was.
fn take_one(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

#[async_trait]
impl AuthorityTransport for InProcessTransport {
    async fn open_session(
        &self,
        req: SessionOpenRequest,
    ) -> Result<SessionOpenResponse, TransportError> {
        self.check_link()?;
        if take_one(&self.fail_opens) {
            return Err(TransportError::Unreachable("injected open failure".into()));
        }
        Ok(self.service.open(req)?)
    }

    async fn exchange(&self, req: ExchangeRequest) -> Result<ExchangeResponse, TransportError> {
        self.check_link()?;
        if take_one(&self.fail_exchanges) {
            return Err(TransportError::Unreachable("injected exchange failure".into()));
        }
        let resp = self.service.exchange(req)?;
        self.exchanges.fetch_add(1, Ordering::SeqCst);
        if take_one(&self.drop_responses) {
            return Err(TransportError::Timeout);
        }
        Ok(resp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::SyncCursor;
    use crate::transaction::types::{DeviceId, WalletId};

    #[tokio::test]
    async fn test_offline_and_injected_failures() {
        let authority = Arc::new(WalletLedgerAuthority::open_temporary().unwrap());
        let wallet = authority.provision_wallet("member-1", 10).unwrap();
        let transport = InProcessTransport::new(authority);
        let req = || SessionOpenRequest::new(DeviceId::new("d"), wallet.id, SyncCursor::default());

        transport.set_offline(true);
        let err = transport.open_session(req()).await.unwrap_err();
        assert!(matches!(err, TransportError::Unreachable(_)));
        assert!(err.is_retryable());
        assert_eq!(err.class(), ErrorClass::Transport);

        transport.set_offline(false);
        transport.fail_next_opens(1);
        assert!(transport.open_session(req()).await.is_err());
        assert!(transport.open_session(req()).await.is_ok());
    }

    #[tokio::test]
    async fn test_server_errors_carry_retryability() {
        let authority = Arc::new(WalletLedgerAuthority::open_temporary().unwrap());
        let transport = InProcessTransport::new(authority);
        let err = transport
            .open_session(SessionOpenRequest::new(
                DeviceId::new("d"),
                WalletId::new(),
                SyncCursor::default(),
            ))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Server { retryable: false, .. }));
    }
}
