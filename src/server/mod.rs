//! HTTP server
//!
//! Hello endpoint, per-request metric recording, and the listener with
//! its drain-bounded lifecycle.

mod handler;
mod instrument;
mod listener;

pub use handler::{build_router, HELLO_BODY};
pub use instrument::{track_requests, HttpMetrics, REQUEST_COUNTER, REQUEST_DURATION, UNMATCHED_ROUTE};
pub use listener::HttpServer;

/// Listener lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    /// Constructed, socket not yet bound
    Created,
    /// Bound and accepting
    Listening,
    /// No longer accepting, draining in-flight requests
    ShuttingDown,
    /// Drained or abandoned; socket closed
    Stopped,
}
