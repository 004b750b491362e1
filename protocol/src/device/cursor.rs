//! Per-device sync watermark.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// How far a device has synchronized with the authority.
///
/// Both counters only move forward. A session that observed an older
/// authority revision than a previous one (a lagging replica, a reordered
/// response) leaves `observed_revision` where it was.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncCursor {
    /// Highest local sequence such that it and everything before it have
    /// a definitive outcome.
    pub acked_sequence: u64,
    /// Latest wallet revision seen in an authority snapshot.
    pub observed_revision: u64,
    pub last_session_at: Option<DateTime<Utc>>,
}

impl SyncCursor {
    pub fn advance(&self, acked_sequence: u64, observed_revision: u64, now: DateTime<Utc>) -> Self {
        Self {
            acked_sequence: self.acked_sequence.max(acked_sequence),
            observed_revision: self.observed_revision.max(observed_revision),
            last_session_at: Some(now),
        }
    }
}
