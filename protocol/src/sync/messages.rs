//! Wire messages exchanged between a device and the authority.
//!
//! ```text
//! Device                               Authority
//! ──────                               ─────────
//!   │  SessionOpenRequest                  │
//!   │─────────────────────────────────────>│
//!   │  SessionOpenResponse { snapshot }    │
//!   │<─────────────────────────────────────│
//!   │  ExchangeRequest { transactions }    │
//!   │─────────────────────────────────────>│
//!   │  ExchangeResponse { results }        │
//!   │<─────────────────────────────────────│
//!   │  ... one exchange per batch ...      │
//! ```
//!
//! All messages are plain serde structs. Over HTTP they travel as JSON.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::{PROTOCOL_FINGERPRINT, WIRE_PROTOCOL_VERSION};
use crate::device::SyncCursor;
use crate::transaction::types::{DeviceId, Transaction, WalletId};
use crate::wallet::WalletSnapshot;

pub use crate::ledger::outcome::SubmissionResult;

/// Session identifier minted by the authority.
pub type SessionId = Uuid;

/// First message of every session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionOpenRequest {
    pub device_id: DeviceId,
    pub wallet_id: WalletId,
    pub cursor: SyncCursor,
    pub fingerprint: String,
    pub wire_version: u16,
}

impl SessionOpenRequest {
    pub fn new(device_id: DeviceId, wallet_id: WalletId, cursor: SyncCursor) -> Self {
        Self {
            device_id,
            wallet_id,
            cursor,
            fingerprint: PROTOCOL_FINGERPRINT.to_string(),
            wire_version: WIRE_PROTOCOL_VERSION,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionOpenResponse {
    pub session_id: SessionId,
    pub snapshot: WalletSnapshot,
    pub server_time: DateTime<Utc>,
}

/// One batch of transactions, in local sequence order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExchangeRequest {
    pub session_id: SessionId,
    pub device_id: DeviceId,
    pub wallet_id: WalletId,
    pub cursor: SyncCursor,
    pub transactions: Vec<Transaction>,
}

/// One result per submitted transaction, in request order, plus the
/// wallet state after the whole batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExchangeResponse {
    pub results: Vec<SubmissionResult>,
    pub snapshot: WalletSnapshot,
}

/// Body of every non-2xx HTTP response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    /// Whether retrying the same request later can succeed.
    pub retryable: bool,
}
