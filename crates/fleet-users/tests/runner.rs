use anyhow::Context;
use clap::Parser;
use std::io::Write;
use tokio::sync::watch;

use fleet_core::config::FleetConfig;
use fleet_core::fabric::RepServer;
use fleet_core::wire;
use fleet_users::{load_roster, run_all, RideOutcome};

fn base_config() -> FleetConfig {
    let mut cfg = FleetConfig::parse_from(["fleet"]);
    cfg.dispatcher_ip = "127.0.0.1".to_string();
    cfg.backup_dispatcher_ip = "127.0.0.1".to_string();
    cfg.user_reply_timeout_secs = 2;
    cfg
}

async fn reply_server(reply: &'static str, shutdown: watch::Receiver<bool>) -> anyhow::Result<u16> {
    let server = RepServer::bind("127.0.0.1:0").await?;
    let port = server.local_addr().port();
    tokio::spawn(server.serve(
        move |line: String| async move {
            match wire::parse_user_request(&line) {
                Ok(_) => reply.to_string(),
                Err(_) => wire::INVALID_REQUEST.to_string(),
            }
        },
        shutdown,
    ));
    Ok(port)
}

fn dead_port() -> anyhow::Result<u16> {
    let listener = std::net::TcpListener::bind("127.0.0.1:0")?;
    let port = listener.local_addr()?.port();
    drop(listener);
    Ok(port)
}

#[tokio::test]
async fn users_are_served_by_the_primary() -> anyhow::Result<()> {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut cfg = base_config();
    cfg.user_req_port = reply_server("assign_taxi 9", shutdown_rx.clone()).await?;

    let users = fleet_users::parse_roster("1 3 4 0\n2 5 6 0\n")?;
    let reports = run_all(&cfg, users, shutdown_rx).await;

    anyhow::ensure!(reports.len() == 2);
    for report in &reports {
        anyhow::ensure!(
            report.outcome == RideOutcome::Assigned { taxi_id: 9 },
            "unexpected outcome {:?}",
            report.outcome
        );
        anyhow::ensure!(!report.served_by_backup);
    }
    anyhow::ensure!(reports[0].user_id == 1 && reports[1].user_id == 2);

    let _ = shutdown_tx.send(true);
    Ok(())
}

#[tokio::test]
async fn unreachable_primary_falls_back_to_backup_once() -> anyhow::Result<()> {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut cfg = base_config();
    cfg.user_req_port = dead_port()?;
    cfg.b_user_req_port = reply_server("no_taxi_available", shutdown_rx.clone()).await?;

    let users = fleet_users::parse_roster("7 1 1 0\n")?;
    let reports = run_all(&cfg, users, shutdown_rx).await;

    anyhow::ensure!(reports.len() == 1);
    anyhow::ensure!(reports[0].outcome == RideOutcome::NoTaxiAvailable);
    anyhow::ensure!(reports[0].served_by_backup, "retry must target the backup");

    let _ = shutdown_tx.send(true);
    Ok(())
}

#[tokio::test]
async fn both_dispatchers_dead_times_out() -> anyhow::Result<()> {
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut cfg = base_config();
    cfg.user_req_port = dead_port()?;
    cfg.b_user_req_port = dead_port()?;

    let users = fleet_users::parse_roster("3 0 0 0\n")?;
    let reports = run_all(&cfg, users, shutdown_rx).await;

    anyhow::ensure!(reports.len() == 1);
    anyhow::ensure!(reports[0].outcome == RideOutcome::TimedOut);
    anyhow::ensure!(reports[0].served_by_backup);
    Ok(())
}

#[tokio::test]
async fn roster_loads_from_disk() -> anyhow::Result<()> {
    let mut file = tempfile::NamedTempFile::new().context("create roster file")?;
    writeln!(file, "1 2 3 4")?;
    writeln!(file, "9, 8, 7, 6")?;

    let users = load_roster(file.path()).await?;
    anyhow::ensure!(users.len() == 2);
    anyhow::ensure!(users[1].user_id == 9 && users[1].wait_secs == 6);
    Ok(())
}
