//! # Geo-Validator
//!
//! Merchant transactions must originate near the merchant. A merchant
//! registers a circular [`Geofence`]; [`validate`] compares a transaction's
//! claimed [`Coordinate`] against it using the haversine distance.
//!
//! ```text
//!            radius_m
//!         ┌───────────┐
//!         │     ●     │  ● center        ✓ WithinFence      (distance ≤ radius)
//!         │   ✓       │                  ✗ OutOfRange       (distance > radius)
//!         └───────────┘       ✗          ? LocationRequired (no fix, mandatory fence)
//! ```
//!
//! The same function runs on the device (fail fast, before the transaction
//! is queued) and at the authority (never trust the client).

pub mod coordinate;
pub mod geofence;

pub use coordinate::{Coordinate, GeoError};
pub use geofence::{validate, GeoCheck, Geofence};
