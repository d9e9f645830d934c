//! Instrument handles
//!
//! Thin wrappers over the SDK instruments. Every recording call reports
//! whether the sample was taken; samples refused after shutdown or for
//! invalid values are counted as dropped on the owning pipeline. Callers on
//! the request path discard the result.

use opentelemetry::metrics::{
    Counter as SdkCounter, Gauge as SdkGauge, Histogram as SdkHistogram,
};
use opentelemetry::KeyValue;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use crate::error::RecordError;

/// Default latency buckets in seconds
pub const DEFAULT_LATENCY_BOUNDS: [f64; 14] = [
    0.005, 0.01, 0.025, 0.05, 0.075, 0.1, 0.25, 0.5, 0.75, 1.0, 2.5, 5.0, 7.5, 10.0,
];

/// State shared by a pipeline and every instrument it hands out
#[derive(Debug, Default)]
pub(crate) struct PipelineShared {
    closed: AtomicBool,
    dropped_samples: AtomicU64,
}

impl PipelineShared {
    #[inline]
    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Mark closed; returns whether this call performed the transition
    pub(crate) fn close(&self) -> bool {
        !self.closed.swap(true, Ordering::AcqRel)
    }

    pub(crate) fn dropped_samples(&self) -> u64 {
        self.dropped_samples.load(Ordering::Relaxed)
    }

    #[inline]
    fn admit(&self) -> Result<(), RecordError> {
        if self.is_closed() {
            return Err(self.reject(RecordError::PipelineClosed));
        }
        Ok(())
    }

    #[inline]
    fn reject(&self, reason: RecordError) -> RecordError {
        self.dropped_samples.fetch_add(1, Ordering::Relaxed);
        reason
    }
}

/// Instrument kind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstrumentKind {
    Counter,
    FloatCounter,
    Histogram,
    Gauge,
}

impl InstrumentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstrumentKind::Counter => "counter",
            InstrumentKind::FloatCounter => "f64 counter",
            InstrumentKind::Histogram => "histogram",
            InstrumentKind::Gauge => "gauge",
        }
    }
}

/// Name, unit and description of an instrument
#[derive(Debug, Clone, PartialEq)]
pub struct InstrumentDescriptor {
    pub name: String,
    pub unit: String,
    pub description: String,
    /// Histogram bucket boundaries; ignored by other kinds
    pub boundaries: Option<Vec<f64>>,
}

impl InstrumentDescriptor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            unit: String::new(),
            description: String::new(),
            boundaries: None,
        }
    }

    pub fn with_unit(mut self, unit: impl Into<String>) -> Self {
        self.unit = unit.into();
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_boundaries(mut self, boundaries: Vec<f64>) -> Self {
        self.boundaries = Some(boundaries);
        self
    }

    /// Finite, ascending, deduplicated bucket boundaries
    pub(crate) fn histogram_bounds(&self) -> Vec<f64> {
        let mut bounds: Vec<f64> = self
            .boundaries
            .clone()
            .unwrap_or_else(|| DEFAULT_LATENCY_BOUNDS.to_vec())
            .into_iter()
            .filter(|b| b.is_finite())
            .collect();
        bounds.sort_by(f64::total_cmp);
        bounds.dedup();
        bounds
    }
}

/// Monotonic counter handle
#[derive(Clone)]
pub struct Counter<T = u64> {
    inner: SdkCounter<T>,
    shared: Arc<PipelineShared>,
}

impl<T> Counter<T> {
    pub(crate) fn new(inner: SdkCounter<T>, shared: Arc<PipelineShared>) -> Self {
        Self { inner, shared }
    }
}

impl Counter<u64> {
    /// Add `value` to the series identified by `attributes`
    #[inline]
    pub fn add(&self, value: u64, attributes: &[KeyValue]) -> Result<(), RecordError> {
        self.shared.admit()?;
        self.inner.add(value, attributes);
        Ok(())
    }
}

impl Counter<f64> {
    /// Add a non-negative, finite `value`
    #[inline]
    pub fn add(&self, value: f64, attributes: &[KeyValue]) -> Result<(), RecordError> {
        self.shared.admit()?;
        if !value.is_finite() {
            return Err(self.shared.reject(RecordError::NonFinite));
        }
        if value < 0.0 {
            return Err(self.shared.reject(RecordError::Negative));
        }
        self.inner.add(value, attributes);
        Ok(())
    }
}

/// Explicit-bucket histogram handle
#[derive(Clone)]
pub struct Histogram {
    inner: SdkHistogram<f64>,
    shared: Arc<PipelineShared>,
}

impl Histogram {
    pub(crate) fn new(inner: SdkHistogram<f64>, shared: Arc<PipelineShared>) -> Self {
        Self { inner, shared }
    }

    /// Record one observation
    #[inline]
    pub fn record(&self, value: f64, attributes: &[KeyValue]) -> Result<(), RecordError> {
        self.shared.admit()?;
        if !value.is_finite() {
            return Err(self.shared.reject(RecordError::NonFinite));
        }
        self.inner.record(value, attributes);
        Ok(())
    }
}

/// Last-value gauge handle
#[derive(Clone)]
pub struct Gauge {
    inner: SdkGauge<f64>,
    shared: Arc<PipelineShared>,
}

impl Gauge {
    pub(crate) fn new(inner: SdkGauge<f64>, shared: Arc<PipelineShared>) -> Self {
        Self { inner, shared }
    }

    /// Replace the current value of the series identified by `attributes`
    #[inline]
    pub fn set(&self, value: f64, attributes: &[KeyValue]) -> Result<(), RecordError> {
        self.shared.admit()?;
        if !value.is_finite() {
            return Err(self.shared.reject(RecordError::NonFinite));
        }
        self.inner.record(value, attributes);
        Ok(())
    }
}

/// Registry entry; one per instrument name
#[derive(Clone)]
pub(crate) enum Registered {
    Counter(Counter<u64>),
    FloatCounter(Counter<f64>),
    Histogram(Histogram),
    Gauge(Gauge),
}

impl Registered {
    pub(crate) fn kind(&self) -> InstrumentKind {
        match self {
            Registered::Counter(_) => InstrumentKind::Counter,
            Registered::FloatCounter(_) => InstrumentKind::FloatCounter,
            Registered::Histogram(_) => InstrumentKind::Histogram,
            Registered::Gauge(_) => InstrumentKind::Gauge,
        }
    }
}
