//! Service lifecycle
//!
//! Wires the pipeline, the instrumented router and the listener together,
//! then tears them down in a fixed order: listener first, pipeline second.

use anyhow::{Context, Result};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::signal;
use tracing::{info, warn};

use crate::config::Config;
use crate::error::{PipelineError, ServerError};
use crate::metrics::{MetricsPipeline, RuntimeReporter};
use crate::server::{build_router, HttpMetrics, HttpServer, ServerState};

/// Outcome of the shutdown phase
///
/// Errors here are warnings: they are logged and never change the exit code.
#[derive(Debug, Default)]
pub struct ShutdownReport {
    pub listener: Option<ServerError>,
    pub pipeline: Option<PipelineError>,
}

impl ShutdownReport {
    pub fn is_clean(&self) -> bool {
        self.listener.is_none() && self.pipeline.is_none()
    }
}

/// A running service
pub struct Service {
    config: Arc<Config>,
    pipeline: MetricsPipeline,
    server: HttpServer,
    local_addr: SocketAddr,
}

impl Service {
    /// Register request instruments, bind the listener, start the runtime reporter
    ///
    /// On any failure everything already started is torn down, and the
    /// pipeline shut down, before the error is returned.
    pub async fn start(config: Arc<Config>, pipeline: MetricsPipeline) -> Result<Self> {
        let metrics = match HttpMetrics::new(&pipeline) {
            Ok(metrics) => metrics,
            Err(e) => {
                release_pipeline(&pipeline, &config).await;
                return Err(e).context("failed to register request instruments");
            }
        };
        let router = build_router(metrics, config.server.response_delay());

        let mut server = HttpServer::new(config.server.bind_addr, router);
        let local_addr = match server.start() {
            Ok(addr) => addr,
            Err(e) => {
                release_pipeline(&pipeline, &config).await;
                return Err(e).context("failed to start HTTP listener");
            }
        };

        if config.runtime.enabled {
            if let Err(e) = RuntimeReporter::start(&pipeline, config.runtime.sample_interval()) {
                if let Err(e) = server.shutdown(config.server.drain_timeout()).await {
                    warn!(error = %e, "HTTP listener shutdown after failed start");
                }
                release_pipeline(&pipeline, &config).await;
                return Err(e).context("failed to start runtime metrics reporter");
            }
        }

        Ok(Self {
            config,
            pipeline,
            server,
            local_addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn listener_state(&self) -> ServerState {
        self.server.state()
    }

    /// Requests currently being handled by the listener
    pub fn in_flight(&self) -> usize {
        self.server.in_flight()
    }

    pub fn pipeline(&self) -> &MetricsPipeline {
        &self.pipeline
    }

    /// Drain the listener, then flush and close the pipeline
    ///
    /// Each phase has its own timeout and runs even if the previous one failed.
    pub async fn shutdown(mut self) -> ShutdownReport {
        let mut report = ShutdownReport::default();

        if let Err(e) = self.server.shutdown(self.config.server.drain_timeout()).await {
            warn!(error = %e, "HTTP listener shutdown incomplete");
            report.listener = Some(e);
        }

        if let Err(e) = self
            .pipeline
            .shutdown(self.config.telemetry.shutdown_timeout())
            .await
        {
            warn!(error = %e, "Metrics pipeline shutdown incomplete");
            report.pipeline = Some(e);
        }

        report
    }
}

async fn release_pipeline(pipeline: &MetricsPipeline, config: &Config) {
    if let Err(e) = pipeline.shutdown(config.telemetry.shutdown_timeout()).await {
        warn!(error = %e, "Metrics pipeline shutdown after failed start");
    }
}

/// Run until `interrupt` resolves, then shut down in order
///
/// Startup failures (collector dial, bind) are returned as errors; shutdown
/// problems are only reported.
pub async fn run<F>(config: Config, interrupt: F) -> Result<ShutdownReport>
where
    F: Future<Output = ()>,
{
    let config = Arc::new(config);

    let pipeline = MetricsPipeline::connect(&config.telemetry)
        .await
        .context("failed to initialize metrics pipeline")?;
    info!(endpoint = %config.telemetry.endpoint, "Metrics pipeline connected");

    let service = Service::start(config, pipeline).await?;
    info!(addr = %service.local_addr(), "Service ready");

    interrupt.await;
    info!("Shutdown signal received, draining");

    let report = service.shutdown().await;
    if report.is_clean() {
        info!("Service stopped");
    } else {
        warn!(
            listener = report.listener.is_some(),
            pipeline = report.pipeline.is_some(),
            "Service stopped with warnings"
        );
    }
    Ok(report)
}

/// Resolves on Ctrl+C or SIGTERM
///
/// A handler that cannot be installed is logged and treated as never firing.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
