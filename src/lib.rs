//! meterd - minimal HTTP service with exported request metrics
//!
//! Every request to the hello endpoint is counted and timed; measurements
//! are aggregated in process and pushed to an OTLP collector on a fixed
//! interval. Shutdown drains the listener before the final metric flush.

pub mod config;
pub mod error;
pub mod metrics;
pub mod server;
pub mod service;
pub mod util;

pub use config::Config;
pub use error::{ExportError, PipelineError, RecordError, ServerError};
pub use metrics::MetricsPipeline;
pub use server::HttpServer;
pub use service::{Service, ShutdownReport};

/// Crate version for display
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
