//! # Storage Module
//!
//! sled-backed persistence for both sides of the wire.
//!
//! ```text
//! db.rs    : AuthorityDb: wallets, decisions, history chain, geofences
//! device.rs: DeviceDb: local queue, settled history, cursor, snapshot
//! ```
//!
//! Bincode for on-disk records, JSON only at the API edge. Multi-record
//! updates go through sled transactions so a crash never leaves half a
//! decision or half a reconciliation on disk.

pub mod db;
pub mod device;

pub use db::{AuthorityDb, CommitStatus, DbError, DbResult, DecisionCommit};
pub use device::DeviceDb;
