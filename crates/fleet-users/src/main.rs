use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

use fleet_core::config::FleetConfig;

#[derive(Parser, Debug)]
#[command(name = "fleet-users")]
#[command(about = "Ride-request runner", long_about = None)]
struct Cli {
    /// Roster file: one `id x y waiting_time` record per line.
    users_file: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let cfg = FleetConfig::from_env().context("load config")?;
    let users = fleet_users::load_roster(&cli.users_file).await?;
    anyhow::ensure!(!users.is_empty(), "roster {} is empty", cli.users_file.display());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut runner = tokio::spawn({
        let cfg = cfg.clone();
        async move { fleet_users::run_all(&cfg, users, shutdown_rx).await }
    });

    let reports = tokio::select! {
        reports = &mut runner => reports.context("join user runner")?,
        _ = tokio::signal::ctrl_c() => {
            // Interrupt waiting users; in-flight requests still finish.
            let _ = shutdown_tx.send(true);
            runner.await.context("join user runner")?
        }
    };

    println!("{}", serde_json::to_string_pretty(&reports)?);
    Ok(())
}
