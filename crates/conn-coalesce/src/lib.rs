//! Connection coalescing: keep "ensure connection" traffic to one in-flight
//! call per connection name.
//!
//! Responsibilities:
//! - single-flight deduplication of ensure operations keyed by connection name
//! - the async seam for the remote ensure call, with a coalescing wrapper
//! - automatic reconnection with countdown, bounded attempts and backoff
//! - summarising connection and reconnection state for status indicators

pub mod coalescer;
pub mod config;
pub mod ensure;
pub mod error;
pub mod reconnect;
pub mod status;

pub use coalescer::{EnsureHandle, RequestCoalescer};
pub use config::ReconnectPolicy;
pub use ensure::{CoalescingEnsurer, ConnectionEnsurer};
pub use error::{EnsureError, EnsureResult};
pub use reconnect::{ReconnectSnapshot, ReconnectionState, Reconnector};
pub use status::{ConnState, ConnStatus, StatusSummary};
