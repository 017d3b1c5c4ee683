//! Taxi dispatch service.
//!
//! One [`Dispatcher`] instance runs the full handler set of a dispatch node:
//! taxi registration, position and heartbeat ingestion, the heartbeat sweep,
//! user ride requests, assignment broadcast, and the service-release timer. A
//! primary node starts it once and also answers the monitor's liveness probe;
//! the backup node (see [`backup`]) starts and stops it on activation
//! commands.
//!
//! The store is authoritative for fleet state. The only in-memory state is
//! the liveness view (last-heard stamps), rebuilt from the store on start.

use anyhow::Context;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use fleet_core::config::{DispatcherEndpoints, FleetConfig};
use fleet_core::fabric::{PubServer, PullServer, RepServer};
use fleet_core::grid::Grid;
use fleet_core::liveness::LivenessView;
use fleet_core::store::Store;
use fleet_core::wire::{
    self, AssignmentNotice, RideReply, TaxiReport, HEARTBEAT_ACK, HEARTBEAT_SRV, INVALID_REQUEST,
    VALID_SPEEDS,
};

pub mod backup;
pub mod matching;

const SERVICE_QUEUE_DEPTH: usize = 256;

/// Runtime knobs, split from [`FleetConfig`] so tests can shrink the timers.
#[derive(Clone, Debug)]
pub struct DispatcherSettings {
    pub heartbeat_timeout: Duration,
    pub sweep_period: Duration,
    pub service_duration: Duration,
}

impl DispatcherSettings {
    pub fn from_config(cfg: &FleetConfig) -> Self {
        Self {
            heartbeat_timeout: cfg.heartbeat_timeout(),
            sweep_period: cfg.sweep_period(),
            service_duration: cfg.service_duration(),
        }
    }
}

/// Addresses the instance actually bound (relevant when configured with
/// ephemeral ports).
#[derive(Clone, Debug)]
pub struct BoundChannels {
    pub registration: SocketAddr,
    pub positions: SocketAddr,
    pub heartbeats: SocketAddr,
    pub assignments: SocketAddr,
    pub user_requests: SocketAddr,
    pub probe: Option<SocketAddr>,
}

struct Shared {
    store: Store,
    grid: Grid,
    settings: DispatcherSettings,
    liveness: Mutex<LivenessView>,
    /// Serializes candidate scan + claim + broadcast per user request.
    assignment_gate: Mutex<()>,
    assignments: PubServer,
    service_tx: mpsc::Sender<ServiceTicket>,
}

struct ServiceTicket {
    taxi_id: i64,
    user_id: i64,
    release_at: Instant,
}

pub struct Dispatcher {
    channels: BoundChannels,
    shutdown_tx: watch::Sender<bool>,
    workers: Vec<JoinHandle<()>>,
}

impl Dispatcher {
    /// Bind every channel, rebuild the liveness view from the store, and
    /// spawn the worker set. `probe_bind` is given on the primary only.
    pub async fn start(
        store: Store,
        grid: Grid,
        settings: DispatcherSettings,
        bind: DispatcherEndpoints,
        probe_bind: Option<String>,
    ) -> anyhow::Result<Self> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let registration = RepServer::bind(&bind.registration)
            .await
            .context("bind registration channel")?;
        let user_requests = RepServer::bind(&bind.user_requests)
            .await
            .context("bind user request channel")?;
        let positions = PullServer::bind(&bind.positions, shutdown_rx.clone())
            .await
            .context("bind position channel")?;
        let heartbeats = PullServer::bind(&bind.heartbeats, shutdown_rx.clone())
            .await
            .context("bind heartbeat channel")?;
        let assignments = PubServer::bind(&bind.assignments, shutdown_rx.clone())
            .await
            .context("bind assignment channel")?;

        let probe = match &probe_bind {
            Some(addr) => Some(RepServer::bind(addr).await.context("bind probe channel")?),
            None => None,
        };

        let mut channels = BoundChannels {
            registration: registration.local_addr(),
            positions: positions.local_addr(),
            heartbeats: heartbeats.local_addr(),
            assignments: assignments.local_addr(),
            user_requests: user_requests.local_addr(),
            probe: None,
        };

        // The store is authoritative; seed the liveness view with every taxi
        // it believes reachable so takeover does not orphan the fleet.
        let mut liveness = LivenessView::new();
        for taxi_id in store
            .connected_taxi_ids()
            .await
            .context("load connected taxis")?
        {
            liveness.stamp(taxi_id);
        }
        tracing::info!(
            event = "fleet.dispatcher.started",
            known_taxis = liveness.len(),
            registration = %channels.registration,
            user_requests = %channels.user_requests,
            "dispatcher handlers starting"
        );

        let (service_tx, service_rx) = mpsc::channel(SERVICE_QUEUE_DEPTH);
        let shared = Arc::new(Shared {
            store,
            grid,
            settings,
            liveness: Mutex::new(liveness),
            assignment_gate: Mutex::new(()),
            assignments,
            service_tx,
        });

        let mut workers = Vec::new();

        let reg_shared = shared.clone();
        workers.push(tokio::spawn(registration.serve(
            move |line: String| {
                let shared = reg_shared.clone();
                async move { handle_registration(&shared, &line).await }
            },
            shutdown_rx.clone(),
        )));

        let user_shared = shared.clone();
        workers.push(tokio::spawn(user_requests.serve(
            move |line: String| {
                let shared = user_shared.clone();
                async move { handle_user_request(&shared, &line).await }
            },
            shutdown_rx.clone(),
        )));

        if let Some(probe) = probe {
            channels.probe = Some(probe.local_addr());
            workers.push(tokio::spawn(probe.serve(
                |line: String| async move {
                    if line.trim() == HEARTBEAT_SRV {
                        HEARTBEAT_ACK.to_string()
                    } else {
                        INVALID_REQUEST.to_string()
                    }
                },
                shutdown_rx.clone(),
            )));
        }

        workers.push(tokio::spawn(position_ingest_loop(
            positions,
            shared.clone(),
            shutdown_rx.clone(),
        )));
        workers.push(tokio::spawn(heartbeat_ingest_loop(
            heartbeats,
            shared.clone(),
            shutdown_rx.clone(),
        )));
        workers.push(tokio::spawn(sweep_loop(shared.clone(), shutdown_rx.clone())));
        workers.push(tokio::spawn(service_release_loop(
            service_rx,
            shared,
            shutdown_rx,
        )));

        Ok(Self {
            channels,
            shutdown_tx,
            workers,
        })
    }

    pub fn channels(&self) -> &BoundChannels {
        &self.channels
    }

    /// Signal every worker to stop and join them before returning. Bound
    /// ports are released once the workers are gone.
    pub async fn shutdown(self) -> anyhow::Result<()> {
        let _ = self.shutdown_tx.send(true);
        for worker in self.workers {
            worker.await.context("join dispatcher worker")?;
        }
        tracing::info!(event = "fleet.dispatcher.stopped", "dispatcher handlers stopped");
        Ok(())
    }
}

fn valid_report(grid: &Grid, report: &TaxiReport) -> bool {
    grid.contains(report.pos_x, report.pos_y) && VALID_SPEEDS.contains(&report.speed)
}

async fn handle_registration(shared: &Shared, line: &str) -> String {
    let report = match wire::parse_connect_request(line) {
        Ok(report) => report,
        Err(err) => {
            tracing::warn!(
                event = "fleet.dispatcher.connect.malformed",
                error = %err,
                "rejecting connect request"
            );
            return INVALID_REQUEST.to_string();
        }
    };

    if !valid_report(&shared.grid, &report) {
        tracing::warn!(
            event = "fleet.dispatcher.connect.out_of_range",
            taxi_id = report.taxi_id,
            pos_x = report.pos_x,
            pos_y = report.pos_y,
            speed = report.speed,
            "rejecting connect request"
        );
        return INVALID_REQUEST.to_string();
    }

    let registered: anyhow::Result<()> = async {
        shared.store.upsert_taxi(&report).await?;
        shared.store.record_heartbeat(report.taxi_id).await?;
        Ok(())
    }
    .await;

    if let Err(err) = registered {
        tracing::warn!(
            event = "fleet.dispatcher.connect.store_error",
            taxi_id = report.taxi_id,
            error = %err,
            "connect request failed against store"
        );
        return INVALID_REQUEST.to_string();
    }

    shared.liveness.lock().await.stamp(report.taxi_id);
    tracing::info!(
        event = "fleet.dispatcher.taxi_connected",
        taxi_id = report.taxi_id,
        pos_x = report.pos_x,
        pos_y = report.pos_y,
        speed = report.speed,
        status = %report.status,
        "taxi registered"
    );
    wire::encode_connect_ack(report.taxi_id)
}

async fn handle_user_request(shared: &Shared, line: &str) -> String {
    let request = match wire::parse_user_request(line) {
        Ok(request) => request,
        Err(err) => {
            tracing::warn!(
                event = "fleet.dispatcher.user_request.malformed",
                error = %err,
                "rejecting user request"
            );
            return RideReply::Invalid.encode();
        }
    };

    tracing::info!(
        event = "fleet.dispatcher.user_request",
        user_id = request.user_id,
        pos_x = request.pos_x,
        pos_y = request.pos_y,
        "ride requested"
    );

    // The waiting time is a client-side delay the wire does not carry.
    if let Err(err) = shared
        .store
        .insert_user_request(request.user_id, request.pos_x, request.pos_y, None)
        .await
    {
        tracing::warn!(
            event = "fleet.dispatcher.user_request.store_error",
            user_id = request.user_id,
            error = %err,
            "failed to persist user request"
        );
        return RideReply::NoTaxiAvailable.encode();
    }

    let _gate = shared.assignment_gate.lock().await;

    let candidates = match shared.store.list_available_taxis().await {
        Ok(candidates) => candidates,
        Err(err) => {
            tracing::warn!(
                event = "fleet.dispatcher.matching.store_error",
                user_id = request.user_id,
                error = %err,
                "failed to list candidates"
            );
            return RideReply::NoTaxiAvailable.encode();
        }
    };

    let ranked = matching::rank_candidates(candidates, request.pos_x, request.pos_y);
    for candidate in ranked {
        match shared
            .store
            .claim_and_assign(candidate.taxi_id, request.user_id)
            .await
        {
            Ok(Some(assignment_id)) => {
                tracing::info!(
                    event = "fleet.dispatcher.assigned",
                    user_id = request.user_id,
                    taxi_id = candidate.taxi_id,
                    assignment_id,
                    "taxi assigned"
                );

                let notice = AssignmentNotice {
                    taxi_id: candidate.taxi_id,
                    user_id: request.user_id,
                };
                shared.assignments.publish(&notice.encode()).await;

                let ticket = ServiceTicket {
                    taxi_id: candidate.taxi_id,
                    user_id: request.user_id,
                    release_at: Instant::now() + shared.settings.service_duration,
                };
                if shared.service_tx.send(ticket).await.is_err() {
                    tracing::warn!(
                        event = "fleet.dispatcher.service.queue_closed",
                        taxi_id = candidate.taxi_id,
                        "service timer queue closed; taxi will stay busy"
                    );
                }

                return RideReply::AssignTaxi(candidate.taxi_id).encode();
            }
            // Lost the race for this candidate; try the next one.
            Ok(None) => continue,
            Err(err) => {
                tracing::warn!(
                    event = "fleet.dispatcher.claim.store_error",
                    user_id = request.user_id,
                    taxi_id = candidate.taxi_id,
                    error = %err,
                    "claim failed against store"
                );
                return RideReply::NoTaxiAvailable.encode();
            }
        }
    }

    tracing::info!(
        event = "fleet.dispatcher.no_taxi",
        user_id = request.user_id,
        "no eligible taxi"
    );
    RideReply::NoTaxiAvailable.encode()
}

async fn position_ingest_loop(
    mut positions: PullServer,
    shared: Arc<Shared>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        if *shutdown.borrow() {
            return;
        }
        tokio::select! {
            frame = positions.recv() => {
                let Some(frame) = frame else { return };
                handle_position(&shared, &frame).await;
            }
            _ = shutdown.changed() => {}
        }
    }
}

async fn handle_position(shared: &Shared, frame: &str) {
    let report = match wire::parse_position_update(frame) {
        Ok(report) => report,
        Err(err) => {
            tracing::warn!(
                event = "fleet.dispatcher.position.malformed",
                error = %err,
                "dropping position update"
            );
            return;
        }
    };

    if !valid_report(&shared.grid, &report) {
        tracing::warn!(
            event = "fleet.dispatcher.position.out_of_range",
            taxi_id = report.taxi_id,
            pos_x = report.pos_x,
            pos_y = report.pos_y,
            "dropping position update"
        );
        return;
    }

    match shared.store.apply_position_report(&report).await {
        Ok(true) => {
            if let Err(err) = shared.store.record_heartbeat(report.taxi_id).await {
                tracing::warn!(
                    event = "fleet.dispatcher.position.heartbeat_error",
                    taxi_id = report.taxi_id,
                    error = %err,
                    "failed to stamp heartbeat"
                );
            }
            shared.liveness.lock().await.stamp(report.taxi_id);
            tracing::debug!(
                event = "fleet.dispatcher.position",
                taxi_id = report.taxi_id,
                pos_x = report.pos_x,
                pos_y = report.pos_y,
                "position updated"
            );
        }
        Ok(false) => {
            tracing::warn!(
                event = "fleet.dispatcher.position.unknown_taxi",
                taxi_id = report.taxi_id,
                "dropping position update from unknown or disconnected taxi"
            );
        }
        Err(err) => {
            tracing::warn!(
                event = "fleet.dispatcher.position.store_error",
                taxi_id = report.taxi_id,
                error = %err,
                "failed to persist position"
            );
        }
    }
}

async fn heartbeat_ingest_loop(
    mut heartbeats: PullServer,
    shared: Arc<Shared>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        if *shutdown.borrow() {
            return;
        }
        tokio::select! {
            frame = heartbeats.recv() => {
                let Some(frame) = frame else { return };
                handle_heartbeat(&shared, &frame).await;
            }
            _ = shutdown.changed() => {}
        }
    }
}

async fn handle_heartbeat(shared: &Shared, frame: &str) {
    let taxi_id = match wire::parse_heartbeat(frame) {
        Ok(taxi_id) => taxi_id,
        Err(err) => {
            tracing::warn!(
                event = "fleet.dispatcher.heartbeat.malformed",
                error = %err,
                "dropping heartbeat"
            );
            return;
        }
    };

    match shared.store.set_taxi_connected(taxi_id, true).await {
        Ok(true) => {
            if let Err(err) = shared.store.record_heartbeat(taxi_id).await {
                tracing::warn!(
                    event = "fleet.dispatcher.heartbeat.store_error",
                    taxi_id,
                    error = %err,
                    "failed to record heartbeat"
                );
                return;
            }
            shared.liveness.lock().await.stamp(taxi_id);
            tracing::debug!(event = "fleet.dispatcher.heartbeat", taxi_id, "heartbeat");
        }
        Ok(false) => {
            tracing::warn!(
                event = "fleet.dispatcher.heartbeat.unknown_taxi",
                taxi_id,
                "dropping heartbeat from unknown taxi"
            );
        }
        Err(err) => {
            tracing::warn!(
                event = "fleet.dispatcher.heartbeat.store_error",
                taxi_id,
                error = %err,
                "failed to record heartbeat"
            );
        }
    }
}

async fn sweep_loop(shared: Arc<Shared>, mut shutdown: watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow() {
            return;
        }
        tokio::select! {
            _ = tokio::time::sleep(shared.settings.sweep_period) => {
                let expired = shared
                    .liveness
                    .lock()
                    .await
                    .sweep(shared.settings.heartbeat_timeout);
                if expired.is_empty() {
                    continue;
                }
                tracing::warn!(
                    event = "fleet.dispatcher.heartbeat_timeout",
                    taxi_ids = ?expired,
                    "marking silent taxis disconnected"
                );
                if let Err(err) = shared.store.set_taxis_disconnected(&expired).await {
                    tracing::warn!(
                        event = "fleet.dispatcher.sweep.store_error",
                        error = %err,
                        "failed to mark taxis disconnected"
                    );
                }
            }
            _ = shutdown.changed() => {}
        }
    }
}

/// Single worker draining the service-timer queue: one task bounds the
/// release work no matter how many rides are in flight.
async fn service_release_loop(
    mut tickets: mpsc::Receiver<ServiceTicket>,
    shared: Arc<Shared>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut pending: Vec<ServiceTicket> = Vec::new();
    loop {
        if *shutdown.borrow() {
            return;
        }
        let next_release = pending.iter().map(|t| t.release_at).min();
        tokio::select! {
            ticket = tickets.recv() => {
                match ticket {
                    Some(ticket) => pending.push(ticket),
                    None => return,
                }
            }
            _ = async {
                match next_release {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending::<()>().await,
                }
            } => {
                let now = Instant::now();
                let (due, rest): (Vec<_>, Vec<_>) =
                    pending.drain(..).partition(|t| t.release_at <= now);
                pending = rest;
                for ticket in due {
                    release_taxi(&shared, &ticket).await;
                }
            }
            _ = shutdown.changed() => {}
        }
    }
}

async fn release_taxi(shared: &Shared, ticket: &ServiceTicket) {
    match shared.store.finish_service(ticket.taxi_id).await {
        Ok(()) => {
            shared.liveness.lock().await.stamp(ticket.taxi_id);
            tracing::info!(
                event = "fleet.dispatcher.service_complete",
                taxi_id = ticket.taxi_id,
                user_id = ticket.user_id,
                "taxi released back to the pool"
            );
        }
        Err(err) => {
            tracing::warn!(
                event = "fleet.dispatcher.service.store_error",
                taxi_id = ticket.taxi_id,
                error = %err,
                "failed to release taxi"
            );
        }
    }
}
