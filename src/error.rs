//! Error types
//!
//! Typed errors for the metrics pipeline and the HTTP listener. The binary
//! wraps these in `anyhow` at the top level.

use std::net::SocketAddr;
use std::time::Duration;

use opentelemetry_sdk::error::OTelSdkError;
use opentelemetry_sdk::metrics::MetricError;
use thiserror::Error;

/// Errors raised by the metrics pipeline
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Collector endpoint could not be parsed into a URI
    #[error("invalid collector endpoint {endpoint:?}: {reason}")]
    InvalidEndpoint { endpoint: String, reason: String },

    /// Dial did not complete within the configured bound
    #[error("timed out after {timeout:?} dialing collector at {endpoint}")]
    DialTimeout { endpoint: String, timeout: Duration },

    /// Dial failed (refused, unresolvable, TLS setup)
    #[error("failed to dial collector at {endpoint}: {source}")]
    Dial {
        endpoint: String,
        #[source]
        source: tonic::transport::Error,
    },

    /// TLS material could not be loaded
    #[error("failed to load TLS configuration: {0}")]
    Tls(String),

    /// OTLP exporter could not be built on the dialed channel
    #[error("failed to build metric exporter: {0}")]
    ExporterBuild(#[source] MetricError),

    /// An instrument name is already registered with a different kind
    #[error("instrument {name:?} already registered as {existing}, requested {requested}")]
    InstrumentConflict {
        name: String,
        existing: &'static str,
        requested: &'static str,
    },

    /// Pipeline has been shut down
    #[error("metrics pipeline is shut down")]
    Closed,

    /// `shutdown` was already called
    #[error("metrics pipeline shutdown already performed")]
    AlreadyShutdown,

    /// An export attempt failed
    #[error("metric export failed: {0}")]
    Export(#[from] ExportError),

    /// Final flush did not finish before the shutdown deadline
    #[error("final metric flush did not complete within {0:?}")]
    ShutdownTimeout(Duration),
}

/// Errors surfaced by an export, flush or exporter shutdown
#[derive(Debug, Error)]
pub enum ExportError {
    /// Exporter reported a failure (gRPC status, transport error, closed client)
    #[error("exporter failed: {0}")]
    Sdk(#[from] OTelSdkError),

    /// Flush did not complete within the configured bound
    #[error("export timed out after {0:?}")]
    Timeout(Duration),

    /// Reader thread went away before answering
    #[error("metric reader stopped: {0}")]
    ReaderGone(String),
}

/// Reasons a single measurement was not recorded
///
/// Returned by instrument `add`/`record`/`set` calls. Callers on the request
/// path discard it; the pipeline already counts the sample as dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RecordError {
    /// Pipeline no longer accepts samples
    #[error("pipeline is shut down")]
    PipelineClosed,

    /// Observation was NaN or infinite
    #[error("value is not finite")]
    NonFinite,

    /// Counter increment below zero
    #[error("counter increment is negative")]
    Negative,
}

/// Errors raised by the HTTP listener
#[derive(Debug, Error)]
pub enum ServerError {
    /// Socket could not be bound (port in use, permission denied)
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    /// Operation not valid in the current lifecycle state
    #[error("listener is {0:?}, operation not allowed")]
    InvalidState(crate::server::ServerState),

    /// In-flight requests outlived the drain timeout and were abandoned
    #[error("drain timed out after {timeout:?} with {abandoned} request(s) in flight")]
    DrainTimeout { timeout: Duration, abandoned: usize },

    /// Accept loop terminated with an I/O error
    #[error("listener failed: {0}")]
    Serve(#[source] std::io::Error),
}
