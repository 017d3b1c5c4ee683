use anyhow::Context;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

use fleet_core::config::FleetConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cfg = FleetConfig::from_env().context("load config")?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let monitor = tokio::spawn(async move { fleet_monitor::run(&cfg, shutdown_rx).await });

    tokio::signal::ctrl_c().await.context("wait for ctrl-c")?;
    let _ = shutdown_tx.send(true);
    monitor.await.context("join monitor")?
}
