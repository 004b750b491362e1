//! Merchant geofences and the validation that checks a transaction against one.

use serde::{Deserialize, Serialize};

use super::coordinate::{Coordinate, GeoError};
use crate::config::MAX_GEOFENCE_RADIUS_METERS;
use crate::error::AuthorizationError;
use crate::transaction::types::MerchantId;

/// A circular region a merchant's transactions must originate within.
///
/// Owned by merchant provisioning; read-only to the ledger engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Geofence {
    pub merchant: MerchantId,
    pub center: Coordinate,
    pub radius_m: f64,
    /// Inactive fences don't constrain anything (merchant moved, fence
    /// pending re-survey).
    pub active: bool,
    /// When set, a transaction with no location is refused instead of
    /// waved through.
    pub mandatory: bool,
}

impl Geofence {
    pub fn new(
        merchant: MerchantId,
        center: Coordinate,
        radius_m: f64,
        mandatory: bool,
    ) -> Result<Self, GeoError> {
        if !radius_m.is_finite() || radius_m <= 0.0 || radius_m > MAX_GEOFENCE_RADIUS_METERS {
            return Err(GeoError::InvalidRadius(radius_m));
        }
        Ok(Self {
            merchant,
            center,
            radius_m,
            active: true,
            mandatory,
        })
    }
}

/// Result of checking a location against a fence.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum GeoCheck {
    WithinFence,
    OutOfRange { distance_m: f64 },
    LocationRequired,
}

impl GeoCheck {
    pub fn is_within(&self) -> bool {
        matches!(self, GeoCheck::WithinFence)
    }

    /// Convert a failed check into the authorization error surfaced to users.
    pub fn into_result(self, fence: &Geofence) -> Result<(), AuthorizationError> {
        match self {
            GeoCheck::WithinFence => Ok(()),
            GeoCheck::OutOfRange { distance_m } => Err(AuthorizationError::OutOfRange {
                distance_m,
                radius_m: fence.radius_m,
            }),
            GeoCheck::LocationRequired => Err(AuthorizationError::LocationRequired),
        }
    }
}

/// Check a transaction's claimed location against a merchant fence.
///
/// Pure. The device runs it to fail fast; the authority runs it again on
/// its own copy of the fence and only the authority's answer counts.
/// The boundary is inclusive: a point exactly `radius_m` away is inside.
pub fn validate(location: Option<&Coordinate>, fence: &Geofence) -> GeoCheck {
    if !fence.active {
        return GeoCheck::WithinFence;
    }
    match location {
        None if fence.mandatory => GeoCheck::LocationRequired,
        None => GeoCheck::WithinFence,
        Some(point) => {
            let distance_m = point.distance_to(&fence.center);
            if distance_m <= fence.radius_m {
                GeoCheck::WithinFence
            } else {
                GeoCheck::OutOfRange { distance_m }
            }
        }
    }
}
