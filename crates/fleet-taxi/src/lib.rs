//! Taxi agent.
//!
//! Registers against the primary dispatcher and then runs three concurrent
//! activities: the position publisher (random walk + active probe), the
//! heartbeat publisher, and the assignment subscriber. Any send error or
//! probe failure funnels into one reconnect path that rebuilds the push
//! sockets under the link mutex, so no publisher can race a half-rebuilt
//! socket; the subscriber watches a generation counter and resubscribes
//! after every rebuild.
//!
//! Failover: after `connect_retry_limit` consecutive failed connects the
//! agent escalates to the other dispatcher's endpoints. While on the backup
//! it probes the primary on every position tick and moves back on the first
//! successful reply.

use anyhow::{bail, Context};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex, MutexGuard};
use tokio::task::JoinHandle;

use fleet_core::config::{DispatcherEndpoints, FleetConfig};
use fleet_core::fabric::{self, PushClient, SubClient};
use fleet_core::grid::validate_grid;
use fleet_core::wire::{self, ConnectReply, TaxiReport, TaxiStatus, VALID_SPEEDS};

pub mod motion;

use motion::{Motion, Step};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Target {
    Primary,
    Backup,
}

impl Target {
    fn other(self) -> Target {
        match self {
            Target::Primary => Target::Backup,
            Target::Backup => Target::Primary,
        }
    }

    fn name(self) -> &'static str {
        match self {
            Target::Primary => "primary",
            Target::Backup => "backup",
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct TaxiParams {
    pub taxi_id: i64,
    pub rows: i64,
    pub cols: i64,
    pub pos_x: i64,
    pub pos_y: i64,
    pub speed: i64,
}

struct Links {
    target: Target,
    positions: PushClient,
    heartbeats: PushClient,
}

struct AgentState {
    motion: Motion,
    status: TaxiStatus,
    ever_connected: bool,
}

struct AgentInner {
    taxi_id: i64,
    primary: DispatcherEndpoints,
    backup: DispatcherEndpoints,
    connect_timeout: Duration,
    backoff: Duration,
    retry_limit: u32,
    heartbeat_interval: Duration,
    position_tick: Duration,
    // Lock order where both are held: links before state.
    links: Mutex<Links>,
    state: Mutex<AgentState>,
    generation: watch::Sender<u64>,
    shutdown: watch::Receiver<bool>,
}

pub struct TaxiAgent {
    inner: Arc<AgentInner>,
}

impl TaxiAgent {
    pub fn new(
        cfg: &FleetConfig,
        params: TaxiParams,
        shutdown: watch::Receiver<bool>,
    ) -> anyhow::Result<Self> {
        let grid = validate_grid(params.rows, params.cols, cfg.max_n, cfg.max_m)?;
        if !VALID_SPEEDS.contains(&params.speed) {
            bail!("invalid speed {} (must be one of {VALID_SPEEDS:?})", params.speed);
        }
        if !grid.contains(params.pos_x, params.pos_y) {
            bail!(
                "initial position ({}, {}) outside the {}x{} grid",
                params.pos_x,
                params.pos_y,
                params.rows,
                params.cols,
            );
        }

        let primary = cfg.primary_endpoints();
        let (generation, _) = watch::channel(0);
        let inner = Arc::new(AgentInner {
            taxi_id: params.taxi_id,
            links: Mutex::new(Links {
                target: Target::Primary,
                positions: PushClient::new(primary.positions.clone()),
                heartbeats: PushClient::new(primary.heartbeats.clone()),
            }),
            primary,
            backup: cfg.backup_endpoints(),
            connect_timeout: cfg.connect_reply_timeout(),
            backoff: cfg.reconnect_backoff(),
            retry_limit: cfg.connect_retry_limit,
            heartbeat_interval: cfg.heartbeat_interval(),
            position_tick: cfg.position_tick(),
            state: Mutex::new(AgentState {
                motion: Motion::new(grid, params.pos_x, params.pos_y, params.speed),
                status: TaxiStatus::Available,
                ever_connected: false,
            }),
            generation,
            shutdown,
        });
        Ok(Self { inner })
    }

    /// Connect, then run the publisher and subscriber activities until the
    /// shutdown watch flips.
    pub async fn run(self) -> anyhow::Result<()> {
        let inner = self.inner;

        {
            let mut links = inner.links.lock().await;
            // reconnect() only errors when the shutdown watch flips, which is
            // a clean exit here.
            if inner.reconnect(&mut links).await.is_err() {
                return Ok(());
            }
        }

        let mut workers: Vec<JoinHandle<()>> = vec![
            tokio::spawn(heartbeat_loop(inner.clone())),
            tokio::spawn(position_loop(inner.clone())),
            tokio::spawn(assignment_loop(inner.clone())),
        ];

        let mut shutdown = inner.shutdown.clone();
        while !*shutdown.borrow() {
            if shutdown.changed().await.is_err() {
                break;
            }
        }

        for worker in workers.drain(..) {
            worker.await.context("join taxi worker")?;
        }
        tracing::info!(
            event = "fleet.taxi.stopped",
            taxi_id = inner.taxi_id,
            "taxi agent stopped"
        );
        Ok(())
    }
}

impl AgentInner {
    fn endpoints(&self, target: Target) -> &DispatcherEndpoints {
        match target {
            Target::Primary => &self.primary,
            Target::Backup => &self.backup,
        }
    }

    async fn current_report(&self) -> TaxiReport {
        let state = self.state.lock().await;
        TaxiReport {
            taxi_id: self.taxi_id,
            pos_x: state.motion.pos_x,
            pos_y: state.motion.pos_y,
            speed: state.motion.speed,
            status: state.status,
        }
    }

    /// One registration round-trip against `target`. Doubles as the active
    /// probe: a dispatcher that acks is alive, and the upsert is idempotent.
    async fn connect_once(&self, target: Target) -> anyhow::Result<()> {
        let report = self.current_report().await;
        let reply = fabric::request(
            &self.endpoints(target).registration,
            &report.encode_connect(),
            self.connect_timeout,
        )
        .await?;
        match wire::parse_connect_reply(&reply)? {
            ConnectReply::Ack(taxi_id) if taxi_id == self.taxi_id => Ok(()),
            other => bail!("unexpected connect reply {other:?}"),
        }
    }

    /// Point the push links at `target` after a successful ack, replaying the
    /// last known position (at-least-once) on anything but the first connect.
    async fn adopt_target(&self, links: &mut MutexGuard<'_, Links>, target: Target) {
        let endpoints = self.endpoints(target);
        links.target = target;
        links.positions = PushClient::new(endpoints.positions.clone());
        links.heartbeats = PushClient::new(endpoints.heartbeats.clone());

        let (report, replay) = {
            let mut state = self.state.lock().await;
            let replay = state.ever_connected;
            state.ever_connected = true;
            (
                TaxiReport {
                    taxi_id: self.taxi_id,
                    pos_x: state.motion.pos_x,
                    pos_y: state.motion.pos_y,
                    speed: state.motion.speed,
                    status: state.status,
                },
                replay,
            )
        };

        if replay {
            if let Err(err) = links.positions.send(&report.encode_position()).await {
                tracing::warn!(
                    event = "fleet.taxi.replay_failed",
                    taxi_id = self.taxi_id,
                    error = %err,
                    "could not replay last position"
                );
            }
        }

        self.generation.send_modify(|generation| *generation += 1);
        tracing::info!(
            event = "fleet.taxi.connected",
            taxi_id = self.taxi_id,
            dispatcher = target.name(),
            "connected"
        );
    }

    /// Reconnect protocol. Runs with the link mutex held so no publisher can
    /// send through a half-rebuilt socket; escalates to the other dispatcher
    /// after `retry_limit` consecutive failures. Errors only on shutdown.
    async fn reconnect(&self, links: &mut MutexGuard<'_, Links>) -> anyhow::Result<()> {
        let mut shutdown = self.shutdown.clone();
        let mut target = links.target;
        let mut failures = 0u32;

        loop {
            if *shutdown.borrow() {
                bail!("shutting down");
            }
            match self.connect_once(target).await {
                Ok(()) => {
                    self.adopt_target(links, target).await;
                    return Ok(());
                }
                Err(err) => {
                    failures += 1;
                    tracing::warn!(
                        event = "fleet.taxi.connect_failed",
                        taxi_id = self.taxi_id,
                        dispatcher = target.name(),
                        attempt = failures,
                        error = %err,
                        "connect attempt failed"
                    );
                    if failures >= self.retry_limit {
                        target = target.other();
                        failures = 0;
                        tracing::info!(
                            event = "fleet.taxi.escalating",
                            taxi_id = self.taxi_id,
                            dispatcher = target.name(),
                            "escalating to the other dispatcher"
                        );
                    }
                    tokio::select! {
                        _ = tokio::time::sleep(self.backoff) => {}
                        _ = shutdown.changed() => {}
                    }
                }
            }
        }
    }
}

async fn heartbeat_loop(inner: Arc<AgentInner>) {
    let mut shutdown = inner.shutdown.clone();
    loop {
        if *shutdown.borrow() {
            return;
        }
        tokio::select! {
            _ = tokio::time::sleep(inner.heartbeat_interval) => {}
            _ = shutdown.changed() => { continue }
        }

        let mut links = inner.links.lock().await;
        let frame = wire::encode_heartbeat(inner.taxi_id);
        if let Err(err) = links.heartbeats.send(&frame).await {
            tracing::warn!(
                event = "fleet.taxi.heartbeat_failed",
                taxi_id = inner.taxi_id,
                error = %err,
                "heartbeat send failed; reconnecting"
            );
            if inner.reconnect(&mut links).await.is_err() {
                return;
            }
        }
    }
}

async fn position_loop(inner: Arc<AgentInner>) {
    let mut shutdown = inner.shutdown.clone();
    loop {
        if *shutdown.borrow() {
            return;
        }
        tokio::select! {
            _ = tokio::time::sleep(inner.position_tick) => {}
            _ = shutdown.changed() => { continue }
        }

        // The whole tick (probes + send) runs under the link mutex so the
        // active probe can never race a reconnect or another sender.
        let mut links = inner.links.lock().await;

        // Fall back to the primary as soon as it answers again.
        if links.target == Target::Backup && inner.connect_once(Target::Primary).await.is_ok() {
            tracing::info!(
                event = "fleet.taxi.failback",
                taxi_id = inner.taxi_id,
                "primary answered; re-selecting it"
            );
            inner.adopt_target(&mut links, Target::Primary).await;
        }

        if let Err(err) = inner.connect_once(links.target).await {
            tracing::warn!(
                event = "fleet.taxi.probe_failed",
                taxi_id = inner.taxi_id,
                dispatcher = links.target.name(),
                error = %err,
                "dispatcher probe failed; reconnecting"
            );
            if inner.reconnect(&mut links).await.is_err() {
                return;
            }
        }

        let (report, step) = {
            let mut state = inner.state.lock().await;
            let step = {
                let mut rng = rand::rng();
                state.motion.tick(&mut rng)
            };
            if matches!(step, Step::Stopped { .. }) {
                // Parked for good: report unavailable so the dispatcher never
                // assigns it again.
                state.status = TaxiStatus::Unavailable;
            }
            (
                TaxiReport {
                    taxi_id: inner.taxi_id,
                    pos_x: state.motion.pos_x,
                    pos_y: state.motion.pos_y,
                    speed: state.motion.speed,
                    status: state.status,
                },
                step,
            )
        };

        match step {
            Step::Hold => {
                tracing::debug!(
                    event = "fleet.taxi.hold",
                    taxi_id = inner.taxi_id,
                    "no movement this tick"
                );
            }
            Step::Moved { pos_x, pos_y } => {
                if let Err(err) = links.positions.send(&report.encode_position()).await {
                    tracing::warn!(
                        event = "fleet.taxi.position_failed",
                        taxi_id = inner.taxi_id,
                        error = %err,
                        "position send failed; reconnecting"
                    );
                    if inner.reconnect(&mut links).await.is_err() {
                        return;
                    }
                } else {
                    tracing::info!(
                        event = "fleet.taxi.moved",
                        taxi_id = inner.taxi_id,
                        pos_x,
                        pos_y,
                        "position published"
                    );
                }
            }
            Step::Stopped { pos_x, pos_y } => {
                // Best-effort final report; the publisher halts either way.
                if let Err(err) = links.positions.send(&report.encode_position()).await {
                    tracing::warn!(
                        event = "fleet.taxi.final_report_failed",
                        taxi_id = inner.taxi_id,
                        error = %err,
                        "could not publish final position"
                    );
                }
                tracing::info!(
                    event = "fleet.taxi.parked",
                    taxi_id = inner.taxi_id,
                    pos_x,
                    pos_y,
                    "reached a border after leaving them; position publisher halting"
                );
                return;
            }
        }
    }
}

async fn assignment_loop(inner: Arc<AgentInner>) {
    let mut shutdown = inner.shutdown.clone();
    let mut generation = inner.generation.subscribe();
    let topic = wire::assignment_topic(inner.taxi_id);

    loop {
        if *shutdown.borrow() {
            return;
        }

        let target = inner.links.lock().await.target;
        let addr = inner.endpoints(target).assignments.clone();

        let mut sub = match SubClient::connect(&addr, &topic).await {
            Ok(sub) => sub,
            Err(err) => {
                tracing::debug!(
                    event = "fleet.taxi.subscribe_failed",
                    taxi_id = inner.taxi_id,
                    error = %err,
                    "assignment subscribe failed; retrying"
                );
                tokio::select! {
                    _ = tokio::time::sleep(inner.backoff) => {}
                    _ = shutdown.changed() => {}
                }
                continue;
            }
        };

        loop {
            if *shutdown.borrow() {
                return;
            }
            tokio::select! {
                frame = sub.recv() => {
                    match frame {
                        Ok(Some(line)) => handle_assignment(&inner, &line),
                        Ok(None) | Err(_) => break,
                    }
                }
                // Links were rebuilt (possibly toward the other dispatcher):
                // resubscribe there.
                _ = generation.changed() => break,
                _ = shutdown.changed() => {}
            }
        }
    }
}

fn handle_assignment(inner: &AgentInner, line: &str) {
    match wire::parse_assignment(line) {
        Ok(notice) if notice.taxi_id == inner.taxi_id => {
            tracing::info!(
                event = "fleet.taxi.assigned",
                taxi_id = inner.taxi_id,
                user_id = notice.user_id,
                "ride assignment received"
            );
        }
        Ok(notice) => {
            tracing::debug!(
                event = "fleet.taxi.assignment_ignored",
                taxi_id = inner.taxi_id,
                for_taxi = notice.taxi_id,
                "assignment for another taxi"
            );
        }
        Err(err) => {
            tracing::warn!(
                event = "fleet.taxi.assignment_malformed",
                taxi_id = inner.taxi_id,
                error = %err,
                "dropping assignment frame"
            );
        }
    }
}
