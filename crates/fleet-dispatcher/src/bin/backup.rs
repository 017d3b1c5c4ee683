use anyhow::Context;
use clap::Parser;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

use fleet_core::config::FleetConfig;
use fleet_core::grid::validate_grid;
use fleet_core::store::Store;
use fleet_dispatcher::{backup, DispatcherSettings};

#[derive(Parser, Debug)]
#[command(name = "fleet-backup-dispatcher")]
#[command(about = "Backup taxi dispatcher (passive until activated)", long_about = None)]
struct Cli {
    /// Grid rows (N).
    n: i64,

    /// Grid columns (M).
    m: i64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let cfg = FleetConfig::from_env().context("load config")?;
    let grid = validate_grid(cli.n, cli.m, cfg.max_n, cfg.max_m)?;

    let store = Store::connect(&cfg.database_url, 5).await?;
    store.migrate().await?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let controller = tokio::spawn(backup::run(
        store,
        grid,
        DispatcherSettings::from_config(&cfg),
        cfg.backup_bind(),
        cfg.activation_bind(),
        shutdown_rx,
    ));

    tokio::signal::ctrl_c().await.context("wait for ctrl-c")?;
    let _ = shutdown_tx.send(true);
    controller.await.context("join backup controller")?
}
