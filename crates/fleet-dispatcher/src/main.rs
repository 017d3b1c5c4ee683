use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use fleet_core::config::FleetConfig;
use fleet_core::grid::validate_grid;
use fleet_core::store::Store;
use fleet_dispatcher::{Dispatcher, DispatcherSettings};

#[derive(Parser, Debug)]
#[command(name = "fleet-dispatcher")]
#[command(about = "Primary taxi dispatcher", long_about = None)]
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

    let dispatcher = Dispatcher::start(
        store,
        grid,
        DispatcherSettings::from_config(&cfg),
        cfg.primary_bind(),
        Some(cfg.probe_bind()),
    )
    .await
    .context("start dispatcher")?;

    tracing::info!(
        event = "fleet.dispatcher.serving",
        rows = grid.rows,
        cols = grid.cols,
        "primary dispatcher running; ctrl-c to stop"
    );

    tokio::signal::ctrl_c().await.context("wait for ctrl-c")?;
    dispatcher.shutdown().await
}
