//! Backup dispatcher controller.
//!
//! Passive until the heartbeat monitor says otherwise: the activation channel
//! is the only socket polled. `activate_backup` starts a full [`Dispatcher`]
//! on the backup port set (which reloads the fleet view from the store, since
//! the primary may have onboarded taxis this process never saw);
//! `deactivate_backup` shuts it down, joins its workers, and releases the
//! ports. The monitor is the single source of truth; this process never
//! negotiates with the primary.

use tokio::sync::watch;

use fleet_core::config::DispatcherEndpoints;
use fleet_core::fabric::PullServer;
use fleet_core::grid::Grid;
use fleet_core::store::Store;
use fleet_core::wire::{self, BackupCommand};

use crate::{Dispatcher, DispatcherSettings};

pub async fn run(
    store: Store,
    grid: Grid,
    settings: DispatcherSettings,
    bind: DispatcherEndpoints,
    activation_bind: String,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let mut activation = PullServer::bind(&activation_bind, shutdown.clone()).await?;
    tracing::info!(
        event = "fleet.backup.passive",
        activation = %activation.local_addr(),
        "backup dispatcher waiting for activation"
    );

    let mut active: Option<Dispatcher> = None;

    loop {
        if *shutdown.borrow() {
            break;
        }
        tokio::select! {
            frame = activation.recv() => {
                let Some(frame) = frame else { break };
                let command = match wire::parse_backup_command(&frame) {
                    Ok(command) => command,
                    Err(err) => {
                        tracing::warn!(
                            event = "fleet.backup.bad_command",
                            error = %err,
                            "dropping activation frame"
                        );
                        continue;
                    }
                };
                match command {
                    BackupCommand::Activate => {
                        if active.is_some() {
                            continue;
                        }
                        tracing::info!(
                            event = "fleet.backup.activating",
                            "primary reported down; taking over"
                        );
                        match Dispatcher::start(
                            store.clone(),
                            grid,
                            settings.clone(),
                            bind.clone(),
                            None,
                        )
                        .await
                        {
                            Ok(dispatcher) => active = Some(dispatcher),
                            Err(err) => {
                                tracing::error!(
                                    event = "fleet.backup.activation_failed",
                                    error = %err,
                                    "could not start handler set"
                                );
                            }
                        }
                    }
                    BackupCommand::Deactivate => {
                        let Some(dispatcher) = active.take() else {
                            continue;
                        };
                        tracing::info!(
                            event = "fleet.backup.deactivating",
                            "primary recovered; standing down"
                        );
                        if let Err(err) = dispatcher.shutdown().await {
                            tracing::warn!(
                                event = "fleet.backup.deactivation_error",
                                error = %err,
                                "handler shutdown reported an error"
                            );
                        }
                    }
                }
            }
            _ = shutdown.changed() => {}
        }
    }

    if let Some(dispatcher) = active.take() {
        dispatcher.shutdown().await?;
    }
    tracing::info!(event = "fleet.backup.stopped", "backup dispatcher stopped");
    Ok(())
}
