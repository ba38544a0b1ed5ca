use anyhow::Result;
use tracing::info;

use opensentinel_core::config::SentinelConfig;
use opensentinel_core::fs;
use opensentinel_daemon::{logging, Stack};

/// Config file name inside the data directory. The daemon takes no
/// command-line flags; this file (when present) is the only input.
const CONFIG_FILE_NAME: &str = "opensentinel.toml";

#[tokio::main]
async fn main() -> Result<()> {
    let config_path = fs::data_path().join(CONFIG_FILE_NAME);
    let config = SentinelConfig::load_or_default(&config_path)
        .await
        .map_err(|e| anyhow::anyhow!("failed to load config: {}", e))?;

    let data_dir = config.resolved_data_dir();
    fs::create_path(&data_dir)
        .map_err(|e| anyhow::anyhow!("failed to create data dir {}: {}", data_dir.display(), e))?;

    logging::init_tracing(&config.general, &data_dir)?;

    info!("opensentinel-daemon starting");

    let mut stack =
        Stack::build(config).map_err(|e| anyhow::anyhow!("failed to build stack: {}", e))?;
    stack
        .start()
        .await
        .map_err(|e| anyhow::anyhow!("failed to start stack: {}", e))?;

    info!("opensentinel-daemon running — sensors active");
    let signal = wait_for_shutdown_signal().await?;
    info!(signal, "shutdown signal received");

    if let Err(e) = stack.stop().await {
        tracing::error!(error = %e, "failed to stop stack cleanly");
    }

    info!("opensentinel-daemon shut down");
    Ok(())
}

/// Wait for a termination signal and return its name.
#[cfg(unix)]
async fn wait_for_shutdown_signal() -> Result<&'static str> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate())
        .map_err(|e| anyhow::anyhow!("failed to install SIGTERM handler: {}", e))?;
    let mut sigint = signal(SignalKind::interrupt())
        .map_err(|e| anyhow::anyhow!("failed to install SIGINT handler: {}", e))?;

    Ok(tokio::select! {
        _ = sigterm.recv() => "SIGTERM",
        _ = sigint.recv() => "SIGINT",
    })
}

/// Wait for a termination signal and return its name.
#[cfg(not(unix))]
async fn wait_for_shutdown_signal() -> Result<&'static str> {
    tokio::signal::ctrl_c().await?;
    Ok("CTRL_C")
}
