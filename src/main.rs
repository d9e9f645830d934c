//! meterd - Entry Point

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing::{error, info};

use meterd::{service, Config, VERSION};

const DEFAULT_CONFIG_FILE: &str = "meterd.toml";

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            // Tracing may not be up yet if config loading failed
            error!(error = ?e, "Fatal startup error");
            eprintln!("meterd: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<()> {
    let (config, config_path) = load_config()?;

    meterd::util::init_tracing(&config.logging)?;

    info!(
        version = VERSION,
        config_path = ?config_path,
        bind_addr = %config.server.bind_addr,
        endpoint = %config.telemetry.endpoint,
        "Starting meterd"
    );

    service::run(config, service::shutdown_signal()).await?;
    Ok(())
}

/// Explicit path argument, else `meterd.toml` if present, else defaults
fn load_config() -> Result<(Config, Option<PathBuf>)> {
    if let Some(path) = std::env::args().nth(1).map(PathBuf::from) {
        let config = Config::load(&path)
            .with_context(|| format!("Failed to load config from {:?}", path))?;
        return Ok((config, Some(path)));
    }

    let fallback = Path::new(DEFAULT_CONFIG_FILE);
    if fallback.exists() {
        let config = Config::load(fallback)
            .with_context(|| format!("Failed to load config from {:?}", fallback))?;
        return Ok((config, Some(fallback.to_path_buf())));
    }

    Ok((Config::default(), None))
}
