//! Error classes shared across the device and the authority.
//!
//! Each module owns its own error enum (`ValidationError` in the queue,
//! `TransportError` in sync, `DbError` in storage). The one enum that lives
//! here is [`AuthorizationError`], because the geo-validator and the
//! credential verifier both produce it and both run on either side of the
//! wire.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Which bucket of the error taxonomy a failure belongs to. Drives how a
/// failure is surfaced: validation and authorization errors go back to the
/// user for correction, state errors are final for that transaction, and
/// transport errors are retried silently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorClass {
    /// Malformed or locally invalid input. Never leaves the device.
    Validation,
    /// Location or credential checks failed. User may retry with corrected input.
    Authorization,
    /// Wallet state forbids the transaction. Terminal, never auto-retried.
    State,
    /// Connectivity failure. Retried with idempotent resubmission.
    Transport,
}

/// Location and credential failures.
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
pub enum AuthorizationError {
    /// The claimed location lies outside the merchant's geofence.
    #[error("location is {distance_m:.0} m from the merchant, fence radius is {radius_m:.0} m")]
    OutOfRange { distance_m: f64, radius_m: f64 },

    /// The merchant's fence is mandatory and the transaction carries no location.
    #[error("merchant requires a location and none was supplied")]
    LocationRequired,

    /// The credential is outside its validity window.
    #[error("credential expired or not yet valid")]
    Expired,

    /// The credential failed to decode or its signature does not verify.
    #[error("credential is malformed or its signature does not verify")]
    Malformed,

    /// The credential was minted for a different scanning context.
    #[error("credential audience mismatch: expected {expected}, got {actual}")]
    AudienceMismatch { expected: String, actual: String },
}

impl AuthorizationError {
    pub fn class(&self) -> ErrorClass {
        ErrorClass::Authorization
    }
}
