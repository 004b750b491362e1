//! # Device Side
//!
//! What runs on a field device: the durable [`LocalTransactionQueue`] and
//! the [`SyncCursor`] that records how far the device has synchronized.

pub mod cursor;
pub mod queue;

pub use cursor::SyncCursor;
pub use queue::{
    AckReport, EnqueueError, LocalTransactionQueue, ProjectedBalance, QueueConfig, QueueEntry,
    SessionLease, SettledEntry, TransactionRequest, ValidationError,
};
