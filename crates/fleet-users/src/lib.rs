//! User runner.
//!
//! Loads a roster of ride requests, runs one task per user (sleep the
//! configured waiting time, send the request, await the reply), and collects
//! per-user outcomes with response times. A request that times out against
//! the primary is re-sent exactly once against the backup.

use anyhow::Context;
use serde::Serialize;
use std::path::Path;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;

use fleet_core::config::FleetConfig;
use fleet_core::fabric;
use fleet_core::wire::{self, RideReply, RideRequest};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct UserRecord {
    pub user_id: i64,
    pub pos_x: i64,
    pub pos_y: i64,
    pub wait_secs: u64,
}

/// Parse the roster: one `id x y waiting_time` record per line, whitespace or
/// comma separated, all integers. Blank lines are skipped.
pub fn parse_roster(text: &str) -> anyhow::Result<Vec<UserRecord>> {
    let mut users = Vec::new();
    for (idx, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let fields: Vec<&str> = line
            .split(|c: char| c == ',' || c.is_ascii_whitespace())
            .filter(|field| !field.is_empty())
            .collect();
        anyhow::ensure!(
            fields.len() == 4,
            "roster line {}: expected `id x y waiting_time`, got `{line}`",
            idx + 1
        );
        let parse = |field: &str, what: &str| {
            field
                .parse::<i64>()
                .with_context(|| format!("roster line {}: parse {what} `{field}`", idx + 1))
        };
        let wait = parse(fields[3], "waiting_time")?;
        anyhow::ensure!(wait >= 0, "roster line {}: negative waiting_time", idx + 1);
        users.push(UserRecord {
            user_id: parse(fields[0], "id")?,
            pos_x: parse(fields[1], "x")?,
            pos_y: parse(fields[2], "y")?,
            wait_secs: wait as u64,
        });
    }
    Ok(users)
}

pub async fn load_roster(path: &Path) -> anyhow::Result<Vec<UserRecord>> {
    let text = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("read roster {}", path.display()))?;
    parse_roster(&text)
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RideOutcome {
    Assigned { taxi_id: i64 },
    NoTaxiAvailable,
    Unexpected { reply: String },
    TimedOut,
    Interrupted,
}

#[derive(Clone, Debug, Serialize)]
pub struct UserReport {
    pub user_id: i64,
    pub outcome: RideOutcome,
    pub response_ms: u64,
    pub served_by_backup: bool,
}

/// One user's life: wait, ask, record. On a reply timeout the request is
/// retried once against the backup endpoint; a second timeout is final.
pub async fn run_user(
    cfg: &FleetConfig,
    record: UserRecord,
    mut shutdown: watch::Receiver<bool>,
) -> UserReport {
    tracing::info!(
        event = "fleet.user.waiting",
        user_id = record.user_id,
        wait_secs = record.wait_secs,
        "user will request a taxi"
    );

    tokio::select! {
        _ = tokio::time::sleep(Duration::from_secs(record.wait_secs)) => {}
        _ = wait_for_stop(&mut shutdown) => {
            return UserReport {
                user_id: record.user_id,
                outcome: RideOutcome::Interrupted,
                response_ms: 0,
                served_by_backup: false,
            };
        }
    }

    let request = RideRequest {
        user_id: record.user_id,
        pos_x: record.pos_x,
        pos_y: record.pos_y,
    };
    let started = Instant::now();

    let (reply, served_by_backup) = match ask(
        &cfg.primary_endpoints().user_requests,
        &request,
        cfg.user_reply_timeout(),
    )
    .await
    {
        Some(reply) => (Some(reply), false),
        None => {
            tracing::warn!(
                event = "fleet.user.primary_timeout",
                user_id = record.user_id,
                "primary did not answer; retrying once on the backup"
            );
            (
                ask(
                    &cfg.backup_endpoints().user_requests,
                    &request,
                    cfg.user_reply_timeout(),
                )
                .await,
                true,
            )
        }
    };

    let response_ms = started.elapsed().as_millis() as u64;
    let outcome = match reply {
        None => RideOutcome::TimedOut,
        Some(reply) => match wire::parse_ride_reply(&reply) {
            Ok(RideReply::AssignTaxi(taxi_id)) => RideOutcome::Assigned { taxi_id },
            Ok(RideReply::NoTaxiAvailable) => RideOutcome::NoTaxiAvailable,
            Ok(RideReply::Invalid) | Err(_) => RideOutcome::Unexpected { reply },
        },
    };

    match &outcome {
        RideOutcome::Assigned { taxi_id } => tracing::info!(
            event = "fleet.user.assigned",
            user_id = record.user_id,
            taxi_id,
            response_ms,
            served_by_backup,
            "taxi assigned"
        ),
        other => tracing::warn!(
            event = "fleet.user.unserved",
            user_id = record.user_id,
            outcome = ?other,
            response_ms,
            served_by_backup,
            "request not served"
        ),
    }

    UserReport {
        user_id: record.user_id,
        outcome,
        response_ms,
        served_by_backup,
    }
}

async fn ask(addr: &str, request: &RideRequest, timeout: Duration) -> Option<String> {
    match fabric::request(addr, &request.encode(), timeout).await {
        Ok(reply) => Some(reply),
        Err(err) => {
            tracing::debug!(
                event = "fleet.user.request_failed",
                user_id = request.user_id,
                error = %err,
                "request attempt failed"
            );
            None
        }
    }
}

async fn wait_for_stop(shutdown: &mut watch::Receiver<bool>) {
    while !*shutdown.borrow() {
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

/// Run every user concurrently and gather their reports, ordered by user id.
pub async fn run_all(
    cfg: &FleetConfig,
    users: Vec<UserRecord>,
    shutdown: watch::Receiver<bool>,
) -> Vec<UserReport> {
    let mut joins = Vec::with_capacity(users.len());
    for record in users {
        let cfg = cfg.clone();
        let shutdown = shutdown.clone();
        joins.push(tokio::spawn(
            async move { run_user(&cfg, record, shutdown).await },
        ));
    }

    let mut reports = Vec::with_capacity(joins.len());
    for join in joins {
        match join.await {
            Ok(report) => reports.push(report),
            Err(err) => tracing::warn!(
                event = "fleet.user.task_failed",
                error = %err,
                "user task aborted"
            ),
        }
    }
    reports.sort_by_key(|report| report.user_id);
    reports
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roster_accepts_whitespace_and_commas() -> anyhow::Result<()> {
        let users = parse_roster("1 3 4 10\n2,5,6,0\n\n3\t7\t8\t2\n")?;
        anyhow::ensure!(users.len() == 3);
        anyhow::ensure!(
            users[0]
                == UserRecord {
                    user_id: 1,
                    pos_x: 3,
                    pos_y: 4,
                    wait_secs: 10
                }
        );
        anyhow::ensure!(users[1].pos_x == 5 && users[1].wait_secs == 0);
        anyhow::ensure!(users[2].user_id == 3);
        Ok(())
    }

    #[test]
    fn roster_rejects_bad_records() {
        assert!(parse_roster("1 2 3").is_err());
        assert!(parse_roster("1 2 3 4 5").is_err());
        assert!(parse_roster("a 2 3 4").is_err());
        assert!(parse_roster("1 2 3 -4").is_err());
    }
}
