//! # Ledger Module
//!
//! The authority side of Harvest.
//!
//! ```text
//! outcome.rs  : Outcome, RejectionReason, DecisionRecord, LedgerEntry
//! resolver.rs : ConflictResolver: the pure accept/reject decision
//! authority.rs: WalletLedgerAuthority: idempotency, locking, persistence
//! ```

pub mod authority;
pub mod outcome;
pub mod resolver;

pub use authority::{AuthorityError, HistoryVerification, WalletLedgerAuthority};
pub use outcome::{DecisionRecord, LedgerEntry, Outcome, RejectionReason, SubmissionResult};
pub use resolver::{ConflictResolver, Resolution};
