//! Collector connection and exporter control
//!
//! The collector is dialed once at startup with a hard time bound; the
//! resulting channel backs the OTLP tonic exporter. Every exporter handed to
//! the periodic reader is wrapped in an [`InterruptibleExporter`] so shutdown
//! can cut a stuck periodic export short and keep its budget for the final
//! one.

use async_trait::async_trait;
use futures::future::{self, Either};
use opentelemetry_otlp::{MetricExporter as OtlpMetricExporter, WithTonicConfig};
use opentelemetry_sdk::error::{OTelSdkError, OTelSdkResult};
use opentelemetry_sdk::metrics::data::ResourceMetrics;
use opentelemetry_sdk::metrics::exporter::PushMetricExporter;
use opentelemetry_sdk::metrics::Temporality;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tonic::transport::{Certificate, Channel, ClientTlsConfig, Endpoint};
use tracing::{debug, info, warn};

use crate::config::TelemetryConfig;
use crate::error::PipelineError;

/// Dial the collector
///
/// The whole attempt, including TLS setup, is bounded by the configured dial
/// timeout. Failure is reported to the caller and not retried.
pub async fn dial(config: &TelemetryConfig) -> Result<Channel, PipelineError> {
    let uri = endpoint_uri(&config.endpoint, config.tls);
    let mut endpoint = Endpoint::from_shared(uri.clone())
        .map_err(|e| PipelineError::InvalidEndpoint {
            endpoint: config.endpoint.clone(),
            reason: e.to_string(),
        })?
        .connect_timeout(config.dial_timeout())
        .timeout(config.export_timeout())
        .tcp_nodelay(true);

    if config.tls {
        endpoint = endpoint
            .tls_config(tls_config(config)?)
            .map_err(|e| PipelineError::Tls(e.to_string()))?;
    }

    debug!(endpoint = %uri, timeout = ?config.dial_timeout(), "Dialing collector");

    let channel = match tokio::time::timeout(config.dial_timeout(), endpoint.connect()).await {
        Ok(Ok(channel)) => channel,
        Ok(Err(source)) => {
            return Err(PipelineError::Dial {
                endpoint: uri,
                source,
            })
        }
        Err(_) => {
            return Err(PipelineError::DialTimeout {
                endpoint: uri,
                timeout: config.dial_timeout(),
            })
        }
    };

    info!(endpoint = %uri, tls = config.tls, "Connected to collector");
    Ok(channel)
}

/// OTLP/gRPC metric exporter on an already dialed channel, delta temporality
pub fn otlp_exporter(channel: Channel) -> Result<OtlpMetricExporter, PipelineError> {
    OtlpMetricExporter::builder()
        .with_tonic()
        .with_channel(channel)
        .with_temporality(Temporality::Delta)
        .build()
        .map_err(PipelineError::ExporterBuild)
}

/// Prefix a bare `host:port` with the scheme matching the transport
fn endpoint_uri(endpoint: &str, tls: bool) -> String {
    if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
        endpoint.to_string()
    } else if tls {
        format!("https://{endpoint}")
    } else {
        format!("http://{endpoint}")
    }
}

fn tls_config(config: &TelemetryConfig) -> Result<ClientTlsConfig, PipelineError> {
    let tls = ClientTlsConfig::new();
    match &config.ca_cert_path {
        Some(path) => {
            let pem = std::fs::read(path)
                .map_err(|e| PipelineError::Tls(format!("reading {}: {e}", path.display())))?;
            Ok(tls.ca_certificate(Certificate::from_pem(pem)))
        }
        None => Ok(tls.with_webpki_roots()),
    }
}

/// Shared between the pipeline and the exporter running on the reader thread
#[derive(Debug)]
pub(crate) struct ExportControl {
    /// Bumped to abandon whatever export is currently running
    interrupt: watch::Sender<u64>,
    busy: watch::Sender<bool>,
    succeeded: AtomicU64,
    failed: AtomicU64,
    released: AtomicBool,
}

impl ExportControl {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            interrupt: watch::channel(0).0,
            busy: watch::channel(false).0,
            succeeded: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            released: AtomicBool::new(false),
        })
    }

    /// Abandon the export in progress, if any; later exports are unaffected
    pub(crate) fn interrupt(&self) {
        self.interrupt.send_modify(|epoch| *epoch += 1);
    }

    /// Resolves once no export is running
    pub(crate) async fn wait_idle(&self) {
        let mut busy = self.busy.subscribe();
        let _ = busy.wait_for(|busy| !*busy).await;
    }

    pub(crate) fn is_busy(&self) -> bool {
        *self.busy.borrow()
    }

    pub(crate) fn succeeded(&self) -> u64 {
        self.succeeded.load(Ordering::Relaxed)
    }

    pub(crate) fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    pub(crate) fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }
}

/// Exporter wrapper owned by the periodic reader
///
/// Skips batches without metrics, counts outcomes, and gives up on an export
/// as soon as [`ExportControl::interrupt`] is called. Runs under the reader
/// thread's executor, so only runtime-agnostic primitives are used here.
pub(crate) struct InterruptibleExporter<E> {
    inner: E,
    control: Arc<ExportControl>,
}

impl<E: PushMetricExporter> InterruptibleExporter<E> {
    pub(crate) fn new(inner: E, control: Arc<ExportControl>) -> Self {
        Self { inner, control }
    }
}

#[async_trait]
impl<E: PushMetricExporter> PushMetricExporter for InterruptibleExporter<E> {
    async fn export(&self, metrics: &mut ResourceMetrics) -> OTelSdkResult {
        if metrics.scope_metrics.iter().all(|scope| scope.metrics.is_empty()) {
            return Ok(());
        }

        // Subscribing marks the current epoch as seen
        let mut interrupt = self.control.interrupt.subscribe();
        self.control.busy.send_replace(true);

        let export = self.inner.export(metrics);
        let interrupted = Box::pin(interrupt.changed());
        let result = match future::select(export, interrupted).await {
            Either::Left((result, _)) => result,
            Either::Right(_) => Err(OTelSdkError::InternalFailure(
                "export interrupted by shutdown".into(),
            )),
        };

        self.control.busy.send_replace(false);
        match &result {
            Ok(()) => {
                self.control.succeeded.fetch_add(1, Ordering::Relaxed);
                debug!("Metrics exported");
            }
            Err(e) => {
                self.control.failed.fetch_add(1, Ordering::Relaxed);
                warn!(error = %e, "Metric export failed, batch dropped");
            }
        }
        result
    }

    async fn force_flush(&self) -> OTelSdkResult {
        self.inner.force_flush().await
    }

    fn shutdown(&self) -> OTelSdkResult {
        self.control.released.store(true, Ordering::Release);
        let result = self.inner.shutdown();
        debug!(?result, "Exporter released");
        result
    }

    fn temporality(&self) -> Temporality {
        self.inner.temporality()
    }
}
