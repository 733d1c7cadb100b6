// MIT License - Copyright (c) 2026 Peter Wright

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::signal::unix::{SignalKind, signal};
use tracing::info;

use sia2imou::{Bridge, BridgeConfig, ImouClient};

fn init_tracing(default_level: &str) {
    // RUST_LOG overrides the LOG_LEVEL environment variable
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));

    // systemd journal already adds timestamps, so omit them when running under systemd
    if std::env::var_os("JOURNAL_STREAM").is_some() {
        tracing_subscriber::fmt()
            .without_time()
            .with_env_filter(env_filter)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(env_filter).init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = match BridgeConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            // Logging is not up yet; make sure the reason still lands somewhere
            eprintln!("configuration error: {e}");
            std::process::exit(1);
        }
    };
    init_tracing(&config.log_level);

    info!(
        addr = %config.listen_addr(),
        account = %config.account,
        encrypted = config.encryption_key.is_some(),
        "starting SIA to Imou bridge"
    );

    let cloud = Arc::new(ImouClient::new(&config).context("failed to build Imou client")?);
    let bridge = Bridge::start(config, cloud)
        .await
        .context("failed to start bridge")?;

    let mut sigterm = signal(SignalKind::terminate()).context("cannot install SIGTERM handler")?;
    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("received SIGINT, shutting down"),
        _ = sigterm.recv() => info!("received SIGTERM, shutting down"),
    }

    bridge.shutdown().await;
    info!("shutdown complete");
    Ok(())
}
