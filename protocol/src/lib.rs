// Copyright (c) 2026 Harvest Co-op Engineering. MIT License.
// See LICENSE for details.

//! # Harvest: Core Library
//!
//! An offline-first wallet ledger for agricultural co-ops. Field devices
//! record debits and credits while disconnected, validate them against
//! cached rules, and later synchronize them with a central authority that
//! applies each one exactly once.
//!
//! ## Architecture
//!
//! - **config**: Protocol constants and runtime defaults.
//! - **crypto**: Hashing and Ed25519 issuer keys.
//! - **transaction**: Transaction records, identifiers, builder.
//! - **wallet**: Wallet state machine, snapshots, PIN verifier.
//! - **geo**: Coordinates, merchant geofences, the geo-validator.
//! - **credential**: QR credential tokens: issue and verify.
//! - **ledger**: The authority: conflict resolution, outcomes, history.
//! - **device**: The per-device transaction queue and sync cursor.
//! - **sync**: Session protocol, transports, the device sync engine.
//! - **storage**: sled-backed stores for the authority and devices.
//! - **error**: Error classes shared by both sides of the wire.
//!
//! ## Ground Rules
//!
//! 1. Money is `u64` in the smallest unit. No floats near a balance.
//! 2. The authority decides. Device-side checks only fail fast.
//! 3. An idempotency key is decided once, and the decision never changes.
//! 4. Arrival order at the authority is the order. Client clocks are not.

pub mod config;
pub mod credential;
pub mod crypto;
pub mod device;
pub mod error;
pub mod geo;
pub mod ledger;
pub mod storage;
pub mod sync;
pub mod transaction;
pub mod wallet;

pub use device::{LocalTransactionQueue, QueueConfig, TransactionRequest};
pub use error::{AuthorizationError, ErrorClass};
pub use ledger::{Outcome, RejectionReason, WalletLedgerAuthority};
pub use sync::{SyncConfig, SyncEngine};
pub use transaction::{Transaction, TransactionBuilder, TransactionKind};
pub use wallet::{Wallet, WalletSnapshot, WalletStatus};
