//! Process runtime vitals reporter
//!
//! Periodically samples memory, thread, file descriptor and CPU figures for
//! the current process plus tokio runtime counts, and publishes them on the
//! shared pipeline. CPU time goes out as a monotonic counter, everything
//! else as gauges.

use nix::sys::resource::{getrusage, UsageWho};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info};

use opentelemetry::KeyValue;

use super::instruments::{Counter, Gauge, InstrumentDescriptor};
use super::pipeline::MetricsPipeline;
use crate::error::PipelineError;

/// Lower bound on the sampling period
pub const MIN_SAMPLE_INTERVAL: Duration = Duration::from_secs(1);

/// One reading of process vitals; `None` where the platform has no source
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProcessVitals {
    pub resident_bytes: Option<u64>,
    pub virtual_bytes: Option<u64>,
    pub peak_resident_bytes: Option<u64>,
    pub threads: Option<u64>,
    pub open_fds: Option<u64>,
    pub cpu_user_secs: Option<f64>,
    pub cpu_system_secs: Option<f64>,
}

impl ProcessVitals {
    pub fn sample() -> Self {
        let mut vitals = Self::default();

        if let Ok(usage) = getrusage(UsageWho::RUSAGE_SELF) {
            let user = usage.user_time();
            let system = usage.system_time();
            vitals.cpu_user_secs = Some(user.tv_sec() as f64 + user.tv_usec() as f64 / 1e6);
            vitals.cpu_system_secs = Some(system.tv_sec() as f64 + system.tv_usec() as f64 / 1e6);
            // Linux reports kilobytes, macOS bytes
            let max_rss = usage.max_rss().max(0) as u64;
            vitals.peak_resident_bytes = Some(if cfg!(target_os = "macos") {
                max_rss
            } else {
                max_rss * 1024
            });
        }

        #[cfg(target_os = "linux")]
        linux::fill(&mut vitals);

        vitals
    }
}

#[cfg(target_os = "linux")]
mod linux {
    use super::ProcessVitals;
    use nix::unistd::{sysconf, SysconfVar};

    pub(super) fn fill(vitals: &mut ProcessVitals) {
        let page_size = sysconf(SysconfVar::PAGE_SIZE)
            .ok()
            .flatten()
            .map(|p| p as u64)
            .unwrap_or(4096);

        if let Ok(statm) = std::fs::read_to_string("/proc/self/statm") {
            let mut fields = statm.split_whitespace().map(|f| f.parse::<u64>().ok());
            if let Some(Some(size)) = fields.next() {
                vitals.virtual_bytes = Some(size * page_size);
            }
            if let Some(Some(resident)) = fields.next() {
                vitals.resident_bytes = Some(resident * page_size);
            }
        }

        if let Ok(status) = std::fs::read_to_string("/proc/self/status") {
            vitals.threads = status
                .lines()
                .find_map(|l| l.strip_prefix("Threads:"))
                .and_then(|v| v.trim().parse().ok());
        }

        if let Ok(entries) = std::fs::read_dir("/proc/self/fd") {
            vitals.open_fds = Some(entries.count() as u64);
        }
    }
}

/// Background sampler bound to one pipeline
pub struct RuntimeReporter {
    memory: Gauge,
    memory_peak: Gauge,
    memory_virtual: Gauge,
    threads: Gauge,
    open_fds: Gauge,
    cpu_time: Counter<f64>,
    uptime: Gauge,
    workers: Gauge,
    alive_tasks: Gauge,
    user_mode: [KeyValue; 1],
    system_mode: [KeyValue; 1],
    /// CPU seconds already added per mode
    cpu_user_seen: f64,
    cpu_system_seen: f64,
    started: Instant,
    runtime: tokio::runtime::Handle,
}

impl RuntimeReporter {
    /// Start the reporter for `pipeline`
    ///
    /// Returns `Ok(false)` when a reporter is already running for this
    /// pipeline, and `PipelineError::Closed` once it has been shut down.
    /// Must be called from within a tokio runtime.
    pub fn start(pipeline: &MetricsPipeline, interval: Duration) -> Result<bool, PipelineError> {
        if pipeline.is_closed() {
            return Err(PipelineError::Closed);
        }
        if !pipeline.claim_runtime_reporter() {
            debug!("Runtime reporter already running");
            return Ok(false);
        }

        let mut reporter = Self::new(pipeline)?;
        reporter.report(&ProcessVitals::sample());

        let interval = interval.max(MIN_SAMPLE_INTERVAL);
        let task = tokio::spawn(reporter.run(interval, pipeline.stop_signal()));
        pipeline.track_task(task);

        info!(interval = ?interval, "Runtime metrics reporter started");
        Ok(true)
    }

    fn new(pipeline: &MetricsPipeline) -> Result<Self, PipelineError> {
        let bytes = |name: &str, description: &str| {
            pipeline.gauge_with(
                InstrumentDescriptor::new(name)
                    .with_unit("By")
                    .with_description(description),
            )
        };

        Ok(Self {
            memory: bytes("process.memory.usage", "Resident set size")?,
            memory_peak: bytes("process.memory.peak", "Peak resident set size")?,
            memory_virtual: bytes("process.memory.virtual", "Virtual memory size")?,
            threads: pipeline.gauge_with(
                InstrumentDescriptor::new("process.thread.count")
                    .with_unit("{thread}")
                    .with_description("OS threads in the process"),
            )?,
            open_fds: pipeline.gauge_with(
                InstrumentDescriptor::new("process.open_file_descriptor.count")
                    .with_unit("{file_descriptor}")
                    .with_description("Open file descriptors"),
            )?,
            cpu_time: pipeline.f64_counter_with(
                InstrumentDescriptor::new("process.cpu.time")
                    .with_unit("s")
                    .with_description("CPU time by mode"),
            )?,
            uptime: pipeline.gauge_with(
                InstrumentDescriptor::new("process.uptime")
                    .with_unit("s")
                    .with_description("Time since the reporter started"),
            )?,
            workers: pipeline.gauge_with(
                InstrumentDescriptor::new("runtime.tokio.workers")
                    .with_unit("{thread}")
                    .with_description("Async runtime worker threads"),
            )?,
            alive_tasks: pipeline.gauge_with(
                InstrumentDescriptor::new("runtime.tokio.tasks.alive")
                    .with_unit("{task}")
                    .with_description("Async tasks currently alive"),
            )?,
            user_mode: [KeyValue::new("cpu.mode", "user")],
            system_mode: [KeyValue::new("cpu.mode", "system")],
            cpu_user_seen: 0.0,
            cpu_system_seen: 0.0,
            started: Instant::now(),
            runtime: tokio::runtime::Handle::current(),
        })
    }

    async fn run(mut self, interval: Duration, mut stop_rx: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        while !*stop_rx.borrow() {
            tokio::select! {
                _ = ticker.tick() => self.report(&ProcessVitals::sample()),
                changed = stop_rx.changed() => {
                    if changed.is_err() || *stop_rx.borrow() {
                        break;
                    }
                }
            }
        }
        debug!("Runtime metrics reporter stopped");
    }

    /// Publish one sample; recording failures are ignored
    fn report(&mut self, vitals: &ProcessVitals) {
        let set = |gauge: &Gauge, value: Option<f64>| {
            if let Some(value) = value {
                let _ = gauge.set(value, &[]);
            }
        };

        set(&self.memory, vitals.resident_bytes.map(|v| v as f64));
        set(&self.memory_peak, vitals.peak_resident_bytes.map(|v| v as f64));
        set(&self.memory_virtual, vitals.virtual_bytes.map(|v| v as f64));
        set(&self.threads, vitals.threads.map(|v| v as f64));
        set(&self.open_fds, vitals.open_fds.map(|v| v as f64));
        set(&self.uptime, Some(self.started.elapsed().as_secs_f64()));

        if let Some(user) = vitals.cpu_user_secs {
            let _ = self.cpu_time.add(cpu_delta(&mut self.cpu_user_seen, user), &self.user_mode);
        }
        if let Some(system) = vitals.cpu_system_secs {
            let _ = self
                .cpu_time
                .add(cpu_delta(&mut self.cpu_system_seen, system), &self.system_mode);
        }

        let metrics = self.runtime.metrics();
        set(&self.workers, Some(metrics.num_workers() as f64));
        set(&self.alive_tasks, Some(metrics.num_alive_tasks() as f64));
    }
}

/// Increment since the last reading; never negative
fn cpu_delta(seen: &mut f64, current: f64) -> f64 {
    let delta = (current - *seen).max(0.0);
    *seen = seen.max(current);
    delta
}
