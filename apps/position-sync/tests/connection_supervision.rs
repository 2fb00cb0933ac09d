//! Connection Supervision Integration Tests
//!
//! Drives the supervisor against the paper broker's fault hooks on paused
//! time.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use position_sync::infrastructure::reconnect::BackoffConfig;
use position_sync::{
    BrokerEndpoint, BrokerPort, ConnectionState, ConnectionSupervisor, PaperBroker,
    PaperBrokerConfig, SupervisorConfig,
};

fn endpoint() -> BrokerEndpoint {
    BrokerEndpoint::new("paper", 7497, 1)
}

fn config() -> SupervisorConfig {
    SupervisorConfig {
        idle_timeout: Duration::from_secs(5),
        probe_timeout: Duration::from_secs(2),
        settle_delay: Duration::ZERO,
        backoff: BackoffConfig::fixed(Duration::from_secs(1)),
        ..SupervisorConfig::new(endpoint())
    }
}

async fn start(
    broker: &PaperBroker,
) -> (watch::Receiver<ConnectionState>, CancellationToken, JoinHandle<()>) {
    start_with(broker, config()).await
}

async fn start_with(
    broker: &PaperBroker,
    config: SupervisorConfig,
) -> (watch::Receiver<ConnectionState>, CancellationToken, JoinHandle<()>) {
    broker.connect(&endpoint(), Duration::from_secs(1)).await.unwrap();
    let cancel = CancellationToken::new();
    let supervisor = ConnectionSupervisor::new(Arc::new(broker.clone()), config, cancel.clone());
    let state = supervisor.state();
    let handle = tokio::spawn(supervisor.run());
    (state, cancel, handle)
}

async fn wait_for(state: &mut watch::Receiver<ConnectionState>, wanted: ConnectionState) {
    timeout(Duration::from_secs(60), state.wait_for(|s| *s == wanted))
        .await
        .unwrap_or_else(|_| panic!("never reached {wanted}"))
        .unwrap();
}

#[tokio::test(start_paused = true)]
async fn healthy_connection_is_kept() {
    let broker = PaperBroker::new(PaperBrokerConfig::default());
    let (mut state, cancel, handle) = start(&broker).await;

    wait_for(&mut state, ConnectionState::ConnectedIdle).await;

    // Several probe cycles.
    tokio::time::sleep(Duration::from_secs(32)).await;
    assert!(broker.is_connected());
    assert_eq!(*state.borrow(), ConnectionState::ConnectedIdle);

    cancel.cancel();
    handle.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn silent_hang_forces_reconnect() {
    let broker = PaperBroker::new(PaperBrokerConfig::default());
    let (mut state, cancel, handle) = start(&broker).await;
    wait_for(&mut state, ConnectionState::ConnectedIdle).await;

    broker.simulate_hang();

    wait_for(&mut state, ConnectionState::Reconnecting).await;
    wait_for(&mut state, ConnectionState::ConnectedIdle).await;

    // The reconnect cleared the hang.
    assert!(broker.positions().await.is_ok());

    cancel.cancel();
    handle.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn dropped_connection_is_restored() {
    let broker = PaperBroker::new(PaperBrokerConfig::default());
    let (mut state, cancel, handle) = start(&broker).await;
    wait_for(&mut state, ConnectionState::ConnectedIdle).await;

    broker.drop_connection();

    wait_for(&mut state, ConnectionState::Reconnecting).await;
    wait_for(&mut state, ConnectionState::ConnectedIdle).await;
    assert!(broker.is_connected());

    cancel.cancel();
    handle.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn disconnect_error_code_forces_reconnect() {
    let broker = PaperBroker::new(PaperBrokerConfig::default());
    let (mut state, cancel, handle) = start(&broker).await;
    wait_for(&mut state, ConnectionState::ConnectedIdle).await;

    broker.emit_error(1100, "Connectivity between IB and TWS has been lost");

    wait_for(&mut state, ConnectionState::Reconnecting).await;

    cancel.cancel();
    handle.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn unreachable_broker_is_retried() {
    let broker = PaperBroker::new(PaperBrokerConfig::default());
    let (mut state, cancel, handle) = start(&broker).await;
    wait_for(&mut state, ConnectionState::ConnectedIdle).await;

    broker.set_reachable(false);
    broker.drop_connection();
    wait_for(&mut state, ConnectionState::Reconnecting).await;

    tokio::time::sleep(Duration::from_secs(10)).await;
    assert!(!broker.is_connected());

    broker.set_reachable(true);
    wait_for(&mut state, ConnectionState::ConnectedIdle).await;
    assert!(broker.is_connected());

    cancel.cancel();
    handle.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn broker_idle_timeout_checks_health_early() {
    let broker = PaperBroker::new(PaperBrokerConfig::default());
    let config = SupervisorConfig {
        idle_timeout: Duration::from_secs(3600),
        ..config()
    };
    let (mut state, cancel, handle) = start_with(&broker, config).await;
    wait_for(&mut state, ConnectionState::ConnectedIdle).await;

    broker.simulate_hang();
    broker.emit_idle_timeout();

    // The idle timer alone would not fire for an hour.
    timeout(
        Duration::from_secs(30),
        state.wait_for(|s| *s == ConnectionState::Reconnecting),
    )
    .await
    .expect("idle timeout event did not trigger a health check")
    .unwrap();
    wait_for(&mut state, ConnectionState::ConnectedIdle).await;
    assert!(broker.positions().await.is_ok());

    cancel.cancel();
    handle.await.unwrap();
}
