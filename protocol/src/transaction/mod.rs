//! # Transaction Module
//!
//! The vocabulary shared by the device and the authority: identifiers,
//! [`TransactionKind`], [`TransactionStatus`], and the immutable
//! [`Transaction`] record.
//!
//! ```text
//! types.rs  : identifiers, kinds, statuses, the Transaction record
//! builder.rs: fluent TransactionBuilder with fresh-key defaults
//! ```
//!
//! A transaction is created once, on a device, and never mutated. Its
//! *status* lives beside it (in the device queue and in the authority's
//! outcome cache), not inside it.

pub mod builder;
pub mod types;

pub use builder::TransactionBuilder;
pub use types::{
    DeviceId, IdempotencyKey, MerchantId, Transaction, TransactionKind, TransactionStatus,
    WalletId,
};
