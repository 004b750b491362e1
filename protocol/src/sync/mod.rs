//! # Sync Protocol
//!
//! Moves a device's queue to the authority and the authority's decisions
//! back to the device.
//!
//! ```text
//! messages.rs : wire types (SessionOpen*, Exchange*)
//! service.rs  : SyncService: authority-side session handling
//! transport.rs: AuthorityTransport trait, InProcessTransport
//! http.rs     : HttpTransport (reqwest)
//! session.rs  : SyncEngine: the device-side state machine
//! ```

pub mod http;
pub mod messages;
pub mod service;
pub mod session;
pub mod transport;

pub use http::HttpTransport;
pub use messages::{
    ErrorBody, ExchangeRequest, ExchangeResponse, SessionId, SessionOpenRequest,
    SessionOpenResponse, SubmissionResult,
};
pub use service::{ServiceError, SyncService};
pub use session::{SyncConfig, SyncEngine, SyncError, SyncReport, SyncState, SyncTrigger};
pub use transport::{AuthorityTransport, InProcessTransport, TransportError};
