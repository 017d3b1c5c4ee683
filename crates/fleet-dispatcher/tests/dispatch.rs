//! End-to-end dispatcher tests over loopback channels and a real store.
//! They need a reachable Postgres and skip when DATABASE_URL is unset.
//! Tests share one database, so they serialize on a lock and reset the
//! dispatch tables before starting.

use anyhow::Context;
use std::sync::OnceLock;
use std::time::Duration;

use fleet_core::config::DispatcherEndpoints;
use fleet_core::fabric::{request, PushClient, SubClient};
use fleet_core::grid::Grid;
use fleet_core::store::Store;
use fleet_core::wire::{RideRequest, TaxiReport, TaxiStatus};
use fleet_dispatcher::{Dispatcher, DispatcherSettings};

const REPLY_TIMEOUT: Duration = Duration::from_secs(2);

async fn integration_lock() -> tokio::sync::MutexGuard<'static, ()> {
    static LOCK: OnceLock<tokio::sync::Mutex<()>> = OnceLock::new();
    LOCK.get_or_init(|| tokio::sync::Mutex::new(()))
        .lock()
        .await
}

async fn test_store() -> anyhow::Result<Option<Store>> {
    let Ok(url) = std::env::var("DATABASE_URL") else {
        eprintln!("skipping dispatcher test: DATABASE_URL unset");
        return Ok(None);
    };
    let store = Store::connect(&url, 5).await.context("connect test store")?;
    store.migrate().await.context("migrate test store")?;

    sqlx::query("TRUNCATE assignments, heartbeat, users, taxis CASCADE")
        .execute(store.pool())
        .await
        .context("reset dispatch tables")?;
    Ok(Some(store))
}

fn ephemeral_bind() -> DispatcherEndpoints {
    DispatcherEndpoints {
        registration: "127.0.0.1:0".to_string(),
        positions: "127.0.0.1:0".to_string(),
        heartbeats: "127.0.0.1:0".to_string(),
        assignments: "127.0.0.1:0".to_string(),
        user_requests: "127.0.0.1:0".to_string(),
    }
}

fn fast_settings() -> DispatcherSettings {
    DispatcherSettings {
        heartbeat_timeout: Duration::from_millis(400),
        sweep_period: Duration::from_millis(150),
        service_duration: Duration::from_millis(300),
    }
}

async fn start_dispatcher(store: &Store) -> anyhow::Result<Dispatcher> {
    Dispatcher::start(
        store.clone(),
        Grid::new(10, 10),
        fast_settings(),
        ephemeral_bind(),
        Some("127.0.0.1:0".to_string()),
    )
    .await
    .context("start dispatcher")
}

fn taxi(taxi_id: i64, x: i64, y: i64, speed: i64) -> TaxiReport {
    TaxiReport {
        taxi_id,
        pos_x: x,
        pos_y: y,
        speed,
        status: TaxiStatus::Available,
    }
}

async fn register(dispatcher: &Dispatcher, report: &TaxiReport) -> anyhow::Result<String> {
    request(
        &dispatcher.channels().registration.to_string(),
        &report.encode_connect(),
        REPLY_TIMEOUT,
    )
    .await
}

async fn ride(dispatcher: &Dispatcher, user_id: i64, x: i64, y: i64) -> anyhow::Result<String> {
    let req = RideRequest {
        user_id,
        pos_x: x,
        pos_y: y,
    };
    request(
        &dispatcher.channels().user_requests.to_string(),
        &req.encode(),
        REPLY_TIMEOUT,
    )
    .await
}

#[tokio::test]
async fn happy_path_assigns_broadcasts_and_releases() -> anyhow::Result<()> {
    let _guard = integration_lock().await;
    let Some(store) = test_store().await? else {
        return Ok(());
    };
    let dispatcher = start_dispatcher(&store).await?;

    let ack = register(&dispatcher, &taxi(1, 0, 0, 2)).await?;
    anyhow::ensure!(ack == "connect_ack 1", "unexpected ack {ack}");

    let mut sub = SubClient::connect(
        &dispatcher.channels().assignments.to_string(),
        "assign 1 ",
    )
    .await?;
    // Let the subscription hello land before the broadcast fires.
    tokio::time::sleep(Duration::from_millis(200)).await;

    let reply = ride(&dispatcher, 1, 3, 4).await?;
    anyhow::ensure!(reply == "assign_taxi 1", "unexpected reply {reply}");

    let frame = tokio::time::timeout(Duration::from_secs(2), sub.recv())
        .await
        .context("broadcast timed out")??;
    anyhow::ensure!(frame.as_deref() == Some("assign 1 1"));

    anyhow::ensure!(store.active_assignment_count(1).await? == 1);
    let row = store.taxi(1).await?.context("taxi row missing")?;
    anyhow::ensure!(row.status == TaxiStatus::Unavailable);

    // After the service duration the taxi is back at its initial pose,
    // available, with the assignment closed.
    tokio::time::sleep(Duration::from_millis(600)).await;
    let row = store.taxi(1).await?.context("taxi row missing")?;
    anyhow::ensure!(row.status == TaxiStatus::Available, "taxi not released");
    anyhow::ensure!(row.connected);
    anyhow::ensure!(row.pos_x == 0 && row.pos_y == 0);
    anyhow::ensure!(store.active_assignment_count(1).await? == 0);

    dispatcher.shutdown().await
}

#[tokio::test]
async fn equidistant_taxis_tie_break_on_id() -> anyhow::Result<()> {
    let _guard = integration_lock().await;
    let Some(store) = test_store().await? else {
        return Ok(());
    };
    let dispatcher = start_dispatcher(&store).await?;

    register(&dispatcher, &taxi(7, 5, 5, 2)).await?;
    register(&dispatcher, &taxi(3, 5, 5, 2)).await?;

    let reply = ride(&dispatcher, 1, 5, 5).await?;
    anyhow::ensure!(reply == "assign_taxi 3", "tie must break to taxi 3, got {reply}");

    dispatcher.shutdown().await
}

#[tokio::test]
async fn no_taxi_available_when_fleet_is_empty() -> anyhow::Result<()> {
    let _guard = integration_lock().await;
    let Some(store) = test_store().await? else {
        return Ok(());
    };
    let dispatcher = start_dispatcher(&store).await?;

    let reply = ride(&dispatcher, 42, 0, 0).await?;
    anyhow::ensure!(reply == "no_taxi_available", "unexpected reply {reply}");

    dispatcher.shutdown().await
}

#[tokio::test]
async fn concurrent_requests_get_exactly_one_taxi() -> anyhow::Result<()> {
    let _guard = integration_lock().await;
    let Some(store) = test_store().await? else {
        return Ok(());
    };
    let dispatcher = start_dispatcher(&store).await?;

    register(&dispatcher, &taxi(5, 2, 2, 2)).await?;

    let (a, b) = tokio::join!(ride(&dispatcher, 10, 2, 2), ride(&dispatcher, 11, 2, 2));
    let (a, b) = (a?, b?);

    let assigned = [&a, &b]
        .iter()
        .filter(|reply| reply.as_str() == "assign_taxi 5")
        .count();
    let refused = [&a, &b]
        .iter()
        .filter(|reply| reply.as_str() == "no_taxi_available")
        .count();
    anyhow::ensure!(
        assigned == 1 && refused == 1,
        "expected one winner and one refusal, got {a} / {b}"
    );
    anyhow::ensure!(store.active_assignment_count(5).await? == 1);

    dispatcher.shutdown().await
}

#[tokio::test]
async fn concurrent_requests_get_distinct_taxis() -> anyhow::Result<()> {
    let _guard = integration_lock().await;
    let Some(store) = test_store().await? else {
        return Ok(());
    };
    let dispatcher = start_dispatcher(&store).await?;

    register(&dispatcher, &taxi(1, 1, 1, 2)).await?;
    register(&dispatcher, &taxi(2, 8, 8, 2)).await?;

    let (a, b) = tokio::join!(ride(&dispatcher, 20, 1, 1), ride(&dispatcher, 21, 8, 8));
    let (a, b) = (a?, b?);

    anyhow::ensure!(a.starts_with("assign_taxi "), "first request refused: {a}");
    anyhow::ensure!(b.starts_with("assign_taxi "), "second request refused: {b}");
    anyhow::ensure!(a != b, "both users got the same taxi: {a}");

    dispatcher.shutdown().await
}

#[tokio::test]
async fn malformed_and_out_of_range_requests_are_rejected() -> anyhow::Result<()> {
    let _guard = integration_lock().await;
    let Some(store) = test_store().await? else {
        return Ok(());
    };
    let dispatcher = start_dispatcher(&store).await?;
    let registration = dispatcher.channels().registration.to_string();
    let user_requests = dispatcher.channels().user_requests.to_string();

    for line in [
        "connect_request 1 2",
        "connect_request x 0 0 2 available",
        "connect_request 1 40 0 2 available",
        "connect_request 1 0 0 3 available",
        "nonsense",
    ] {
        let reply = request(&registration, line, REPLY_TIMEOUT).await?;
        anyhow::ensure!(reply == "invalid_request", "`{line}` got {reply}");
    }

    for line in ["user_request 1", "user_request a b c", "ride please"] {
        let reply = request(&user_requests, line, REPLY_TIMEOUT).await?;
        anyhow::ensure!(reply == "invalid_request", "`{line}` got {reply}");
    }

    dispatcher.shutdown().await
}

#[tokio::test]
async fn silent_taxi_is_disconnected_and_skipped() -> anyhow::Result<()> {
    let _guard = integration_lock().await;
    let Some(store) = test_store().await? else {
        return Ok(());
    };
    let dispatcher = start_dispatcher(&store).await?;

    register(&dispatcher, &taxi(9, 4, 4, 2)).await?;

    // No heartbeats: past timeout + one sweep period the taxi must be out.
    tokio::time::sleep(Duration::from_millis(900)).await;
    let row = store.taxi(9).await?.context("taxi row missing")?;
    anyhow::ensure!(!row.connected, "silent taxi still marked connected");

    let reply = ride(&dispatcher, 30, 4, 4).await?;
    anyhow::ensure!(reply == "no_taxi_available", "unexpected reply {reply}");

    dispatcher.shutdown().await
}

#[tokio::test]
async fn heartbeats_keep_a_taxi_eligible() -> anyhow::Result<()> {
    let _guard = integration_lock().await;
    let Some(store) = test_store().await? else {
        return Ok(());
    };
    let dispatcher = start_dispatcher(&store).await?;

    register(&dispatcher, &taxi(6, 3, 3, 2)).await?;
    let mut pusher = PushClient::connect(dispatcher.channels().heartbeats.to_string()).await?;

    for _ in 0..8 {
        pusher.send("heartbeat 6").await?;
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    let reply = ride(&dispatcher, 31, 3, 3).await?;
    anyhow::ensure!(reply == "assign_taxi 6", "unexpected reply {reply}");

    dispatcher.shutdown().await
}

#[tokio::test]
async fn position_replay_after_reconnect_is_idempotent() -> anyhow::Result<()> {
    let _guard = integration_lock().await;
    let Some(store) = test_store().await? else {
        return Ok(());
    };
    let dispatcher = start_dispatcher(&store).await?;

    register(&dispatcher, &taxi(4, 2, 2, 2)).await?;
    let mut pusher = PushClient::connect(dispatcher.channels().positions.to_string()).await?;

    let moved = taxi(4, 3, 3, 2);
    pusher.send(&moved.encode_position()).await?;

    // Reconnect and replay the last known position, as the agent does.
    register(&dispatcher, &moved).await?;
    pusher.send(&moved.encode_position()).await?;

    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        let row = store.taxi(4).await?.context("taxi row missing")?;
        if row.pos_x == 3 && row.pos_y == 3 {
            anyhow::ensure!(row.initial_pos_x == 2 && row.initial_pos_y == 2);
            break;
        }
        anyhow::ensure!(
            tokio::time::Instant::now() < deadline,
            "position update never landed"
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    dispatcher.shutdown().await
}

#[tokio::test]
async fn backup_activates_serves_and_stands_down() -> anyhow::Result<()> {
    let _guard = integration_lock().await;
    let Some(store) = test_store().await? else {
        return Ok(());
    };

    // The backup controller binds its public ports only while active, so the
    // test must know them up front.
    let bind = DispatcherEndpoints {
        registration: "127.0.0.1:17164".to_string(),
        positions: "127.0.0.1:17165".to_string(),
        heartbeats: "127.0.0.1:17167".to_string(),
        assignments: "127.0.0.1:17162".to_string(),
        user_requests: "127.0.0.1:17168".to_string(),
    };
    let activation_addr = "127.0.0.1:17170".to_string();

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let controller = tokio::spawn(fleet_dispatcher::backup::run(
        store.clone(),
        Grid::new(10, 10),
        fast_settings(),
        bind.clone(),
        activation_addr.clone(),
        shutdown_rx,
    ));
    tokio::time::sleep(Duration::from_millis(200)).await;

    // Passive: public ports are not bound.
    anyhow::ensure!(
        request(&bind.registration, "connect_request 2 1 1 2 available", REPLY_TIMEOUT)
            .await
            .is_err(),
        "passive backup must not answer registrations"
    );

    let mut activation = PushClient::connect(activation_addr).await?;
    activation.send("activate_backup").await?;
    tokio::time::sleep(Duration::from_millis(300)).await;

    let ack = request(
        &bind.registration,
        "connect_request 2 1 1 2 available",
        REPLY_TIMEOUT,
    )
    .await
    .context("active backup must answer registrations")?;
    anyhow::ensure!(ack == "connect_ack 2");

    let reply = request(&bind.user_requests, "user_request 50 1 1", REPLY_TIMEOUT).await?;
    anyhow::ensure!(reply == "assign_taxi 2", "unexpected reply {reply}");

    activation.send("deactivate_backup").await?;
    tokio::time::sleep(Duration::from_millis(300)).await;
    anyhow::ensure!(
        request(&bind.registration, "connect_request 2 1 1 2 available", REPLY_TIMEOUT)
            .await
            .is_err(),
        "deactivated backup must release its ports"
    );

    // A second activation cycle rebinds cleanly.
    activation.send("activate_backup").await?;
    tokio::time::sleep(Duration::from_millis(300)).await;
    let ack = request(
        &bind.registration,
        "connect_request 2 1 1 2 available",
        REPLY_TIMEOUT,
    )
    .await
    .context("reactivated backup must answer registrations")?;
    anyhow::ensure!(ack == "connect_ack 2");

    let _ = shutdown_tx.send(true);
    controller.await.context("join backup controller")?
}

#[tokio::test]
async fn probe_endpoint_acknowledges_monitor() -> anyhow::Result<()> {
    let _guard = integration_lock().await;
    let Some(store) = test_store().await? else {
        return Ok(());
    };
    let dispatcher = start_dispatcher(&store).await?;
    let probe = dispatcher
        .channels()
        .probe
        .context("primary must bind a probe endpoint")?
        .to_string();

    let reply = request(&probe, "heartbeat_srv", REPLY_TIMEOUT).await?;
    anyhow::ensure!(reply == "heartbeat_ack", "unexpected reply {reply}");

    let reply = request(&probe, "who goes there", REPLY_TIMEOUT).await?;
    anyhow::ensure!(reply == "invalid_request", "unexpected reply {reply}");

    dispatcher.shutdown().await
}
