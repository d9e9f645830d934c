//! Metrics pipeline
//!
//! Wraps the SDK meter provider and its periodic reader. One pipeline is
//! built at startup and passed explicitly to everything that records
//! measurements; no global provider is installed.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use opentelemetry::metrics::{Meter, MeterProvider};
use opentelemetry::{InstrumentationScope, KeyValue};
use opentelemetry_sdk::metrics::exporter::PushMetricExporter;
use opentelemetry_sdk::metrics::{PeriodicReader, SdkMeterProvider};
use opentelemetry_sdk::Resource;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::export::{self, ExportControl, InterruptibleExporter};
use super::instruments::{
    Counter, Gauge, Histogram, InstrumentDescriptor, InstrumentKind, PipelineShared, Registered,
};
use crate::config::TelemetryConfig;
use crate::error::{ExportError, PipelineError};

/// Pipeline construction parameters
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub service_name: String,
    pub environment: String,
    pub export_interval: Duration,
    /// Bound on a forced flush
    pub export_timeout: Duration,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self::from(&TelemetryConfig::default())
    }
}

impl From<&TelemetryConfig> for PipelineSettings {
    fn from(config: &TelemetryConfig) -> Self {
        Self {
            service_name: config.service_name.clone(),
            environment: config.environment.clone(),
            export_interval: config.export_interval(),
            export_timeout: config.export_timeout(),
        }
    }
}

/// Export counters, reported at shutdown
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineStats {
    pub exports_succeeded: u64,
    pub exports_failed: u64,
    pub dropped_samples: u64,
    pub instruments: usize,
    /// The reader has shut its exporter down
    pub exporter_released: bool,
}

struct PipelineInner {
    provider: SdkMeterProvider,
    meter: Meter,
    shared: Arc<PipelineShared>,
    registry: DashMap<String, Registered>,
    control: Arc<ExportControl>,
    settings: PipelineSettings,
    stop_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    runtime_reporter_started: AtomicBool,
}

/// Handle to the process metrics pipeline
///
/// Cheap to clone. Instruments obtained from it stay valid after shutdown
/// but reject further samples.
#[derive(Clone)]
pub struct MetricsPipeline {
    inner: Arc<PipelineInner>,
}

impl MetricsPipeline {
    /// Dial the configured collector and start the periodic reader
    pub async fn connect(config: &TelemetryConfig) -> Result<Self, PipelineError> {
        let channel = export::dial(config).await?;
        let exporter = export::otlp_exporter(channel)?;
        Ok(Self::start(PipelineSettings::from(config), exporter))
    }

    /// Build a pipeline whose periodic reader pushes to `exporter`
    pub fn start(settings: PipelineSettings, exporter: impl PushMetricExporter) -> Self {
        let control = ExportControl::new();
        let reader = PeriodicReader::builder(InterruptibleExporter::new(exporter, control.clone()))
            .with_interval(settings.export_interval)
            .build();
        let provider = SdkMeterProvider::builder()
            .with_resource(build_resource(&settings))
            .with_reader(reader)
            .build();
        let meter = provider.meter_with_scope(
            InstrumentationScope::builder(env!("CARGO_PKG_NAME"))
                .with_version(env!("CARGO_PKG_VERSION"))
                .build(),
        );

        info!(
            service = %settings.service_name,
            environment = %settings.environment,
            interval = ?settings.export_interval,
            "Metrics pipeline started"
        );

        Self {
            inner: Arc::new(PipelineInner {
                provider,
                meter,
                shared: Arc::new(PipelineShared::default()),
                registry: DashMap::new(),
                control,
                settings,
                stop_tx: watch::channel(false).0,
                tasks: Mutex::new(Vec::new()),
                runtime_reporter_started: AtomicBool::new(false),
            }),
        }
    }

    /// Counter named `name`, created on first use
    pub fn counter(&self, name: &str) -> Result<Counter, PipelineError> {
        self.counter_with(InstrumentDescriptor::new(name))
    }

    pub fn counter_with(&self, descriptor: InstrumentDescriptor) -> Result<Counter, PipelineError> {
        let name = descriptor.name.clone();
        let registered = self.register(descriptor, InstrumentKind::Counter, |meter, d, shared| {
            let inner = meter
                .u64_counter(d.name.clone())
                .with_unit(d.unit.clone())
                .with_description(d.description.clone())
                .build();
            Registered::Counter(Counter::new(inner, shared))
        })?;
        match registered {
            Registered::Counter(counter) => Ok(counter),
            other => Err(conflict(name, &other, InstrumentKind::Counter)),
        }
    }

    /// Floating point counter, for cumulative quantities such as CPU seconds
    pub fn f64_counter_with(
        &self,
        descriptor: InstrumentDescriptor,
    ) -> Result<Counter<f64>, PipelineError> {
        let name = descriptor.name.clone();
        let registered = self.register(descriptor, InstrumentKind::FloatCounter, |meter, d, shared| {
            let inner = meter
                .f64_counter(d.name.clone())
                .with_unit(d.unit.clone())
                .with_description(d.description.clone())
                .build();
            Registered::FloatCounter(Counter::new(inner, shared))
        })?;
        match registered {
            Registered::FloatCounter(counter) => Ok(counter),
            other => Err(conflict(name, &other, InstrumentKind::FloatCounter)),
        }
    }

    /// Histogram named `name`, created on first use
    pub fn histogram(&self, name: &str) -> Result<Histogram, PipelineError> {
        self.histogram_with(InstrumentDescriptor::new(name))
    }

    pub fn histogram_with(
        &self,
        descriptor: InstrumentDescriptor,
    ) -> Result<Histogram, PipelineError> {
        let name = descriptor.name.clone();
        let registered = self.register(descriptor, InstrumentKind::Histogram, |meter, d, shared| {
            let inner = meter
                .f64_histogram(d.name.clone())
                .with_unit(d.unit.clone())
                .with_description(d.description.clone())
                .with_boundaries(d.histogram_bounds())
                .build();
            Registered::Histogram(Histogram::new(inner, shared))
        })?;
        match registered {
            Registered::Histogram(histogram) => Ok(histogram),
            other => Err(conflict(name, &other, InstrumentKind::Histogram)),
        }
    }

    /// Gauge named `name`, created on first use
    pub fn gauge(&self, name: &str) -> Result<Gauge, PipelineError> {
        self.gauge_with(InstrumentDescriptor::new(name))
    }

    pub fn gauge_with(&self, descriptor: InstrumentDescriptor) -> Result<Gauge, PipelineError> {
        let name = descriptor.name.clone();
        let registered = self.register(descriptor, InstrumentKind::Gauge, |meter, d, shared| {
            let inner = meter
                .f64_gauge(d.name.clone())
                .with_unit(d.unit.clone())
                .with_description(d.description.clone())
                .build();
            Registered::Gauge(Gauge::new(inner, shared))
        })?;
        match registered {
            Registered::Gauge(gauge) => Ok(gauge),
            other => Err(conflict(name, &other, InstrumentKind::Gauge)),
        }
    }

    /// Look up or create the instrument; names are unique across kinds
    fn register(
        &self,
        descriptor: InstrumentDescriptor,
        kind: InstrumentKind,
        build: impl FnOnce(&Meter, &InstrumentDescriptor, Arc<PipelineShared>) -> Registered,
    ) -> Result<Registered, PipelineError> {
        if self.inner.shared.is_closed() {
            return Err(PipelineError::Closed);
        }
        match self.inner.registry.entry(descriptor.name.clone()) {
            Entry::Occupied(existing) => {
                let existing = existing.get();
                if existing.kind() != kind {
                    return Err(PipelineError::InstrumentConflict {
                        name: descriptor.name,
                        existing: existing.kind().as_str(),
                        requested: kind.as_str(),
                    });
                }
                Ok(existing.clone())
            }
            Entry::Vacant(slot) => {
                debug!(name = %descriptor.name, kind = kind.as_str(), "Instrument registered");
                let instrument = build(&self.inner.meter, &descriptor, self.inner.shared.clone());
                slot.insert(instrument.clone());
                Ok(instrument)
            }
        }
    }

    /// Collect and export immediately, bounded by the export timeout
    pub async fn force_flush(&self) -> Result<(), PipelineError> {
        if self.inner.shared.is_closed() {
            return Err(PipelineError::Closed);
        }
        let provider = self.inner.provider.clone();
        let timeout = self.inner.settings.export_timeout;

        // The provider blocks until the reader thread answers
        let flush = tokio::task::spawn_blocking(move || provider.force_flush());
        match tokio::time::timeout(timeout, flush).await {
            Ok(Ok(Ok(()))) => Ok(()),
            Ok(Ok(Err(e))) => Err(ExportError::Sdk(e).into()),
            Ok(Err(e)) => Err(ExportError::ReaderGone(e.to_string()).into()),
            Err(_) => Err(ExportError::Timeout(timeout).into()),
        }
    }

    /// Register a background task to be stopped and joined on shutdown
    pub(crate) fn track_task(&self, task: JoinHandle<()>) {
        self.inner.tasks.lock().push(task);
    }

    /// Receiver that flips to `true` when shutdown begins
    pub(crate) fn stop_signal(&self) -> watch::Receiver<bool> {
        self.inner.stop_tx.subscribe()
    }

    /// Claim the single runtime reporter slot; `false` if already claimed
    pub(crate) fn claim_runtime_reporter(&self) -> bool {
        !self.inner.runtime_reporter_started.swap(true, Ordering::AcqRel)
    }

    pub fn is_closed(&self) -> bool {
        self.inner.shared.is_closed()
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.inner.settings
    }

    pub fn stats(&self) -> PipelineStats {
        PipelineStats {
            exports_succeeded: self.inner.control.succeeded(),
            exports_failed: self.inner.control.failed(),
            dropped_samples: self.inner.shared.dropped_samples(),
            instruments: self.inner.registry.len(),
            exporter_released: self.inner.control.is_released(),
        }
    }

    /// Stop background tasks, export once more, and release the exporter
    ///
    /// A quarter of `timeout` goes to stopping samplers and letting a running
    /// periodic export finish; if it has not, it is interrupted so the final
    /// export gets the rest. The reader releases the exporter whether or not
    /// the final export completes, and shutdown is never retried.
    pub async fn shutdown(&self, timeout: Duration) -> Result<(), PipelineError> {
        if !self.inner.shared.close() {
            return Err(PipelineError::AlreadyShutdown);
        }
        let deadline = Instant::now() + timeout;
        let grace = timeout / 4;
        info!(timeout = ?timeout, "Shutting down metrics pipeline");

        // Samples recorded from here on are refused
        let _ = self.inner.stop_tx.send(true);
        let tasks = std::mem::take(&mut *self.inner.tasks.lock());
        let abort_handles: Vec<_> = tasks.iter().map(|t| t.abort_handle()).collect();
        let (joined, idle) = tokio::join!(
            tokio::time::timeout(grace, futures::future::join_all(tasks)),
            tokio::time::timeout(grace, self.inner.control.wait_idle()),
        );
        if joined.is_err() {
            warn!("Background metric tasks did not stop in time, aborting");
            abort_handles.iter().for_each(|h| h.abort());
        }
        if idle.is_err() {
            warn!(grace = ?grace, "Periodic export still running, interrupting it");
            self.inner.control.interrupt();
        }

        let provider = self.inner.provider.clone();
        let final_export = tokio::task::spawn_blocking(move || provider.shutdown());
        let result = match tokio::time::timeout_at(deadline, final_export).await {
            Ok(Ok(Ok(()))) => Ok(()),
            Ok(Ok(Err(e))) => Err(ExportError::Sdk(e).into()),
            Ok(Err(e)) => Err(ExportError::ReaderGone(e.to_string()).into()),
            Err(_) => {
                // Cut the final export short; the reader then releases the exporter
                self.inner.control.interrupt();
                Err(PipelineError::ShutdownTimeout(timeout))
            }
        };

        let stats = self.stats();
        info!(
            exports_succeeded = stats.exports_succeeded,
            exports_failed = stats.exports_failed,
            dropped_samples = stats.dropped_samples,
            "Metrics pipeline stopped"
        );
        result
    }
}

fn conflict(name: String, existing: &Registered, requested: InstrumentKind) -> PipelineError {
    PipelineError::InstrumentConflict {
        name,
        existing: existing.kind().as_str(),
        requested: requested.as_str(),
    }
}

fn build_resource(settings: &PipelineSettings) -> Resource {
    Resource::builder()
        .with_service_name(settings.service_name.clone())
        .with_attributes([
            KeyValue::new("service.version", env!("CARGO_PKG_VERSION")),
            KeyValue::new("deployment.environment.name", settings.environment.clone()),
        ])
        .build()
}
