//! # Wallet Module
//!
//! ```text
//! wallet.rs: Wallet record, status machine, WalletSnapshot
//! pin.rs   : salted PIN verifier held by devices
//! ```
//!
//! All amounts are `u64` in the smallest currency unit. No floating point
//! touches money.

pub mod pin;
pub mod wallet;

pub use pin::{PinError, PinVerifier};
pub use wallet::{Wallet, WalletError, WalletSnapshot, WalletStatus};
