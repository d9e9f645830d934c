//! Metrics and observability
//!
//! OpenTelemetry SDK aggregation with periodic OTLP export. Instruments are
//! handed out by an explicitly constructed [`MetricsPipeline`]; there is no
//! global provider.

mod export;
mod instruments;
mod pipeline;
mod runtime;

pub use export::{dial, otlp_exporter};
pub use instruments::{
    Counter, Gauge, Histogram, InstrumentDescriptor, InstrumentKind, DEFAULT_LATENCY_BOUNDS,
};
pub use opentelemetry::KeyValue;
pub use pipeline::{MetricsPipeline, PipelineSettings, PipelineStats};
pub use runtime::{ProcessVitals, RuntimeReporter, MIN_SAMPLE_INTERVAL};
