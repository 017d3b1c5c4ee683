use anyhow::Context;
use clap::Parser;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

use fleet_core::config::FleetConfig;
use fleet_taxi::{TaxiAgent, TaxiParams};

#[derive(Parser, Debug)]
#[command(name = "fleet-taxi")]
#[command(about = "Mobile taxi agent", long_about = None)]
struct Cli {
    /// Taxi identifier.
    taxi_id: i64,

    /// Grid rows (N).
    n: i64,

    /// Grid columns (M).
    m: i64,

    /// Initial column (0 <= x < M).
    pos_x: i64,

    /// Initial row (0 <= y < N).
    pos_y: i64,

    /// Speed in cells per interval (1, 2, or 4).
    speed: i64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let cfg = FleetConfig::from_env().context("load config")?;
    let params = TaxiParams {
        taxi_id: cli.taxi_id,
        rows: cli.n,
        cols: cli.m,
        pos_x: cli.pos_x,
        pos_y: cli.pos_y,
        speed: cli.speed,
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let agent = TaxiAgent::new(&cfg, params, shutdown_rx)?;
    let run = tokio::spawn(agent.run());

    tokio::signal::ctrl_c().await.context("wait for ctrl-c")?;
    let _ = shutdown_tx.send(true);
    run.await.context("join taxi agent")?
}
