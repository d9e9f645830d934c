//! Configuration management
//!
//! Handles loading and validating service configuration from TOML files.
//! Every field has a default, so an empty file yields the reference setup.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Upper bound for the artificial handler delay
pub const MAX_RESPONSE_DELAY_MS: u64 = 30_000;

/// Upper bound for the collector dial timeout
pub const MAX_DIAL_TIMEOUT_SECS: u64 = 5;

/// Root configuration structure
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// HTTP listener configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    /// Address to bind the HTTP listener
    #[serde(default = "default_bind_addr")]
    pub bind_addr: SocketAddr,
    /// Maximum time to wait for in-flight requests on shutdown
    #[serde(default = "default_drain_timeout")]
    pub drain_timeout_secs: u64,
    /// Artificial processing delay in the hello handler (0 = none)
    #[serde(default)]
    pub response_delay_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            drain_timeout_secs: default_drain_timeout(),
            response_delay_ms: 0,
        }
    }
}

impl ServerConfig {
    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }

    pub fn response_delay(&self) -> Duration {
        Duration::from_millis(self.response_delay_ms)
    }
}

/// Metrics export configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TelemetryConfig {
    /// Collector address (`host:port`, or a full `http(s)://` URI)
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    /// Reported as `service.name`
    #[serde(default = "default_service_name")]
    pub service_name: String,
    /// Reported as `deployment.environment.name`
    #[serde(default = "default_environment")]
    pub environment: String,
    /// Period of the batching reader
    #[serde(default = "default_export_interval")]
    pub export_interval_secs: u64,
    /// Bound on a single export call
    #[serde(default = "default_export_timeout")]
    pub export_timeout_secs: u64,
    /// Bound on the initial connection attempt
    #[serde(default = "default_dial_timeout")]
    pub dial_timeout_secs: u64,
    /// Bound on the final flush during shutdown
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: u64,
    /// Use TLS for the collector connection
    #[serde(default)]
    pub tls: bool,
    /// PEM bundle used to verify the collector (defaults to webpki roots)
    #[serde(default)]
    pub ca_cert_path: Option<PathBuf>,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            service_name: default_service_name(),
            environment: default_environment(),
            export_interval_secs: default_export_interval(),
            export_timeout_secs: default_export_timeout(),
            dial_timeout_secs: default_dial_timeout(),
            shutdown_timeout_secs: default_shutdown_timeout(),
            tls: false,
            ca_cert_path: None,
        }
    }
}

impl TelemetryConfig {
    pub fn export_interval(&self) -> Duration {
        Duration::from_secs(self.export_interval_secs)
    }

    pub fn export_timeout(&self) -> Duration {
        Duration::from_secs(self.export_timeout_secs)
    }

    pub fn dial_timeout(&self) -> Duration {
        Duration::from_secs(self.dial_timeout_secs)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

/// Process runtime reporter configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RuntimeConfig {
    /// Enable the runtime vitals reporter
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Sampling period
    #[serde(default = "default_runtime_interval")]
    pub sample_interval_secs: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            sample_interval_secs: default_runtime_interval(),
        }
    }
}

impl RuntimeConfig {
    pub fn sample_interval(&self) -> Duration {
        Duration::from_secs(self.sample_interval_secs)
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Output format: "json" or "pretty"
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

// Default value functions
fn default_bind_addr() -> SocketAddr { SocketAddr::from(([0, 0, 0, 0], 8080)) }
fn default_drain_timeout() -> u64 { 10 }
fn default_endpoint() -> String { "otel-collector:4317".to_string() }
fn default_service_name() -> String { "meterd".to_string() }
fn default_environment() -> String { "dev".to_string() }
fn default_export_interval() -> u64 { 10 }
fn default_export_timeout() -> u64 { 10 }
fn default_dial_timeout() -> u64 { 5 }
fn default_shutdown_timeout() -> u64 { 10 }
fn default_true() -> bool { true }
fn default_runtime_interval() -> u64 { 10 }
fn default_log_level() -> String { "info".to_string() }
fn default_log_format() -> String { "pretty".to_string() }

impl Config {
    /// Load configuration from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        Self::from_toml(&contents)
    }

    /// Parse and validate configuration from TOML text
    pub fn from_toml(contents: &str) -> Result<Self> {
        let config: Config = toml::from_str(contents)
            .with_context(|| "Failed to parse config file")?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        let t = &self.telemetry;
        if t.endpoint.trim().is_empty() {
            anyhow::bail!("telemetry.endpoint must not be empty");
        }
        if t.service_name.trim().is_empty() {
            anyhow::bail!("telemetry.service_name must not be empty");
        }
        if !(1..=60).contains(&t.export_interval_secs) {
            anyhow::bail!("telemetry.export_interval_secs must be within 1..=60");
        }
        if t.export_timeout_secs == 0 {
            anyhow::bail!("telemetry.export_timeout_secs must be > 0");
        }
        if !(1..=MAX_DIAL_TIMEOUT_SECS).contains(&t.dial_timeout_secs) {
            anyhow::bail!("telemetry.dial_timeout_secs must be within 1..={MAX_DIAL_TIMEOUT_SECS}");
        }
        if t.shutdown_timeout_secs == 0 {
            anyhow::bail!("telemetry.shutdown_timeout_secs must be > 0");
        }
        if t.ca_cert_path.is_some() && !t.tls {
            anyhow::bail!("telemetry.ca_cert_path requires telemetry.tls = true");
        }
        if self.server.drain_timeout_secs == 0 {
            anyhow::bail!("server.drain_timeout_secs must be > 0");
        }
        if self.server.response_delay_ms > MAX_RESPONSE_DELAY_MS {
            anyhow::bail!("server.response_delay_ms must be <= {MAX_RESPONSE_DELAY_MS}");
        }
        if self.runtime.sample_interval_secs == 0 {
            anyhow::bail!("runtime.sample_interval_secs must be > 0");
        }
        if !matches!(self.logging.format.as_str(), "json" | "pretty") {
            anyhow::bail!("logging.format must be \"json\" or \"pretty\"");
        }
        Ok(())
    }
}
