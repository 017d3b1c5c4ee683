//! Heartbeat monitor.
//!
//! A standalone prober and the single source of truth for failover: every
//! probe period it sends `heartbeat_srv` to the primary dispatcher and
//! expects `heartbeat_ack` within the reply timeout. The first failure after
//! a healthy stretch activates the backup; the first success after a failed
//! stretch deactivates it. Dispatchers never negotiate with each other.

use std::time::Duration;
use tokio::sync::watch;

use fleet_core::config::FleetConfig;
use fleet_core::fabric::{self, PushClient};
use fleet_core::wire::{BackupCommand, HEARTBEAT_ACK, HEARTBEAT_SRV};

/// Pure transition function: feed in probe results, get the command to send,
/// if any. `main_active` starts true.
#[derive(Clone, Copy, Debug)]
pub struct MonitorState {
    main_active: bool,
}

impl Default for MonitorState {
    fn default() -> Self {
        Self { main_active: true }
    }
}

impl MonitorState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn main_active(&self) -> bool {
        self.main_active
    }

    pub fn observe(&mut self, probe_ok: bool) -> Option<BackupCommand> {
        match (self.main_active, probe_ok) {
            (true, false) => {
                self.main_active = false;
                Some(BackupCommand::Activate)
            }
            (false, true) => {
                self.main_active = true;
                Some(BackupCommand::Deactivate)
            }
            _ => None,
        }
    }
}

/// One synchronous probe round-trip against the primary.
pub async fn probe_primary(addr: &str, timeout: Duration) -> bool {
    match fabric::request(addr, HEARTBEAT_SRV, timeout).await {
        Ok(reply) => reply == HEARTBEAT_ACK,
        Err(err) => {
            tracing::debug!(
                event = "fleet.monitor.probe_error",
                error = %err,
                "probe failed"
            );
            false
        }
    }
}

pub async fn run(cfg: &FleetConfig, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
    let probe_addr = cfg.probe_endpoint();
    let mut commands = PushClient::new(cfg.activation_endpoint());
    let mut state = MonitorState::new();

    tracing::info!(
        event = "fleet.monitor.started",
        primary = %probe_addr,
        backup = %commands.addr(),
        "heartbeat monitor running"
    );

    loop {
        if *shutdown.borrow() {
            return Ok(());
        }

        let ok = probe_primary(&probe_addr, cfg.connect_reply_timeout()).await;
        if let Some(command) = state.observe(ok) {
            tracing::warn!(
                event = "fleet.monitor.transition",
                probe_ok = ok,
                command = command.as_str(),
                "primary liveness changed"
            );
            if let Err(err) = commands.send(command.as_str()).await {
                // The backup is unreachable; roll back so the transition is
                // retried on the next probe.
                state = MonitorState {
                    main_active: !matches!(command, BackupCommand::Deactivate),
                };
                tracing::warn!(
                    event = "fleet.monitor.signal_failed",
                    command = command.as_str(),
                    error = %err,
                    "could not signal the backup"
                );
            }
        } else {
            tracing::debug!(
                event = "fleet.monitor.probe",
                probe_ok = ok,
                "probe round complete"
            );
        }

        tokio::select! {
            _ = tokio::time::sleep(cfg.heartbeat_interval()) => {}
            _ = shutdown.changed() => {}
        }
    }
}
