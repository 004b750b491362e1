//! # Protocol Configuration & Constants
//!
//! Every magic number in Harvest lives here. If you're hardcoding a constant
//! somewhere else, move it here and give it a name.
//!
//! Runtime knobs that operators are expected to tune (batch sizes, timeouts,
//! retry budgets) live in `Default`-implementing config structs next to the
//! component that consumes them, e.g. [`crate::sync::SyncConfig`]. The values
//! below are the defaults those structs start from.

use std::time::Duration;

// ---------------------------------------------------------------------------
// Protocol Version
// ---------------------------------------------------------------------------

/// Protocol fingerprint sent in every session open. The authority rejects
/// devices speaking a different protocol family outright.
pub const PROTOCOL_FINGERPRINT: &str = "HARVEST-LEDGER-2026";

/// Major version. Bump on breaking wire changes to the sync messages.
pub const PROTOCOL_VERSION_MAJOR: u16 = 0;

/// Minor version. Bump on backward-compatible additions.
pub const PROTOCOL_VERSION_MINOR: u16 = 1;

/// The full version string.
pub const PROTOCOL_VERSION: &str = "0.1.0";

/// Wire version carried by sync messages. Separate from the crate version
/// because ledger rule changes don't always mean wire changes.
pub const WIRE_PROTOCOL_VERSION: u16 = 1;

// ---------------------------------------------------------------------------
// Credentials
// ---------------------------------------------------------------------------

/// Prefix of every QR credential token. Versioned so the verifier can
/// reject tokens from a future encoding instead of misparsing them.
pub const CREDENTIAL_PREFIX: &str = "hv1";

/// Longest validity window the issuer will sign. QR codes printed at a
/// market stall are re-minted by the merchant app well within this.
pub const MAX_CREDENTIAL_LIFETIME: Duration = Duration::from_secs(600);

/// Clock skew tolerated between the device that scans a credential and the
/// device that minted it. Field devices drift; 30 seconds is plenty.
pub const CREDENTIAL_CLOCK_SKEW: Duration = Duration::from_secs(30);

/// Ed25519 signature length.
pub const SIGNATURE_LENGTH: usize = 64;

// ---------------------------------------------------------------------------
// Geography
// ---------------------------------------------------------------------------

/// Mean earth radius in metres (IUGG). Used by the haversine distance.
pub const EARTH_RADIUS_METERS: f64 = 6_371_008.8;

/// Upper bound for a registered geofence radius. Anything larger than a
/// small town is a provisioning mistake, not a merchant location.
pub const MAX_GEOFENCE_RADIUS_METERS: f64 = 50_000.0;

// ---------------------------------------------------------------------------
// Transactions
// ---------------------------------------------------------------------------

/// Maximum description length in bytes.
pub const MAX_DESCRIPTION_LENGTH: usize = 256;

/// Minimum and maximum PIN length (ASCII digits).
pub const MIN_PIN_LENGTH: usize = 4;
pub const MAX_PIN_LENGTH: usize = 8;

// ---------------------------------------------------------------------------
// Sync
// ---------------------------------------------------------------------------

/// Transactions sent per exchange round trip.
pub const DEFAULT_SYNC_BATCH_SIZE: usize = 64;

/// How long a device waits for the authority to answer an exchange before
/// declaring the session disconnected.
pub const DEFAULT_EXCHANGE_TIMEOUT: Duration = Duration::from_secs(15);

/// How long establishing a session may take.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Background sync interval when the device believes it is online.
pub const DEFAULT_SYNC_INTERVAL: Duration = Duration::from_secs(60);

/// Retry budget for a single triggered sync before waiting for the next
/// trigger.
pub const DEFAULT_SYNC_MAX_RETRIES: u32 = 3;

/// First backoff delay; doubles on every retry.
pub const DEFAULT_RETRY_BASE_DELAY: Duration = Duration::from_millis(500);

/// Ceiling for the doubled backoff delay.
pub const MAX_RETRY_DELAY: Duration = Duration::from_secs(30);

/// Authority-side: sessions with no exchange for this long are forgotten.
/// The device simply opens a new one.
pub const SESSION_IDLE_TIMEOUT: Duration = Duration::from_secs(300);

/// Authority-side: largest batch accepted in one exchange.
pub const MAX_EXCHANGE_BATCH: usize = 512;

// ---------------------------------------------------------------------------
// Network
// ---------------------------------------------------------------------------

/// Default authority API port.
pub const DEFAULT_API_PORT: u16 = 9841;

/// Default metrics (Prometheus) port.
pub const DEFAULT_METRICS_PORT: u16 = 9842;
