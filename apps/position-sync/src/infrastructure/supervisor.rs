//! Connection Health Supervisor
//!
//! Keeps one brokerage connection alive. An open socket can stop delivering
//! data without an error or a disconnect ever surfacing, so after a quiet
//! period the supervisor issues a small historical-data probe and forces a
//! reconnect when the probe fails or times out.
//!
//! ```text
//!  Connecting ──ok──► ConnectedIdle ──idle timer / IdleTimeout──► Probing
//!      ▲                   │                                      │   │
//!      │        disconnect error / Disconnected             bars  │   │ timeout / error
//!      │                   ▼                                      │   ▼
//!      └────────────── Reconnecting ◄─────────────────────────────┘ ─┘
//!                                          (bars → ConnectedIdle)
//! ```
//!
//! Runs concurrently with every reconciler sharing the connection. A
//! forced reconnect fails their in-flight requests; they retry on their
//! next pass.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::application::ports::{
    BrokerEndpoint, BrokerError, BrokerEvent, BrokerPort, ProbeRequest, bounded,
};
use crate::domain::connection::ConnectionState;
use crate::infrastructure::metrics;
use crate::infrastructure::reconnect::{Backoff, BackoffConfig};

/// Broker error codes meaning the session is gone.
pub const DEFAULT_DISCONNECT_ERROR_CODES: [i32; 3] = [100, 1100, 1102];

// =============================================================================
// Configuration
// =============================================================================

/// Supervisor timings and classification.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Connection to supervise.
    pub endpoint: BrokerEndpoint,
    /// Limit for a connect attempt.
    pub connect_timeout: Duration,
    /// Quiet period before probing.
    pub idle_timeout: Duration,
    /// Limit for a probe.
    pub probe_timeout: Duration,
    /// Pause after connecting before the connection is used.
    pub settle_delay: Duration,
    /// Error codes treated as a lost session.
    pub disconnect_error_codes: HashSet<i32>,
    /// Probe request.
    pub probe: ProbeRequest,
    /// Delay schedule between failed sessions.
    pub backoff: BackoffConfig,
}

impl SupervisorConfig {
    /// Defaults for `endpoint`.
    #[must_use]
    pub fn new(endpoint: BrokerEndpoint) -> Self {
        Self {
            endpoint,
            connect_timeout: Duration::from_secs(4),
            idle_timeout: Duration::from_secs(30),
            probe_timeout: Duration::from_secs(4),
            settle_delay: Duration::from_millis(250),
            disconnect_error_codes: DEFAULT_DISCONNECT_ERROR_CODES.into_iter().collect(),
            probe: ProbeRequest::default(),
            backoff: BackoffConfig::default(),
        }
    }
}

/// Why a session ended.
#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    /// Connect attempt failed or timed out.
    #[error("connect failed: {0}")]
    Connect(#[source] BrokerError),

    /// Probe failed or timed out.
    #[error("probe failed: {0}")]
    Probe(#[source] BrokerError),

    /// Probe completed without data.
    #[error("probe returned no data")]
    EmptyProbe,

    /// Broker reported a disconnect-class error.
    #[error("broker error {code}: {message}")]
    DisconnectError {
        /// Broker error code.
        code: i32,
        /// Broker error text.
        message: String,
    },

    /// Broker reported the connection dropped.
    #[error("connection dropped")]
    Disconnected,

    /// Broker event channel closed.
    #[error("broker event channel closed")]
    EventsClosed,
}

// =============================================================================
// Supervisor
// =============================================================================

/// Health supervisor for one brokerage connection.
pub struct ConnectionSupervisor {
    broker: Arc<dyn BrokerPort>,
    config: SupervisorConfig,
    label: String,
    state_tx: watch::Sender<ConnectionState>,
    cancel: CancellationToken,
}

impl ConnectionSupervisor {
    /// Create a supervisor. Nothing happens until [`run`](Self::run).
    #[must_use]
    pub fn new(
        broker: Arc<dyn BrokerPort>,
        config: SupervisorConfig,
        cancel: CancellationToken,
    ) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Connecting);
        let label = config.endpoint.to_string();
        metrics::set_connection_state(&label, ConnectionState::Connecting);
        Self {
            broker,
            config,
            label,
            state_tx,
            cancel,
        }
    }

    /// Observe state transitions.
    #[must_use]
    pub fn state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    /// Supervise until cancelled.
    pub async fn run(self) {
        let mut backoff = Backoff::new(self.config.backoff.clone());
        let mut first_session = true;

        loop {
            let result = tokio::select! {
                () = self.cancel.cancelled() => break,
                result = self.session(first_session, &mut backoff) => result,
            };
            first_session = false;

            let Err(reason) = result;
            self.set_state(ConnectionState::Reconnecting);
            metrics::record_broker_reconnect(&self.label);
            tracing::warn!(
                endpoint = %self.config.endpoint,
                reason = %reason,
                "Reconnecting to broker"
            );
            self.broker.disconnect().await;

            let delay = backoff.next_delay();
            tracing::debug!(
                delay = ?delay,
                attempt = backoff.attempts(),
                "Waiting before reconnect"
            );
            tokio::select! {
                () = self.cancel.cancelled() => break,
                () = tokio::time::sleep(delay) => {}
            }
        }

        tracing::debug!(endpoint = %self.config.endpoint, "Supervisor stopped");
    }

    /// One connection lifetime. Only returns when the session is lost.
    async fn session(
        &self,
        adopt_existing: bool,
        backoff: &mut Backoff,
    ) -> Result<std::convert::Infallible, SupervisorError> {
        self.set_state(ConnectionState::Connecting);

        // Subscribe first so nothing emitted during connect is missed.
        let mut events = self.broker.subscribe();

        if adopt_existing && self.broker.is_connected() {
            tracing::info!(endpoint = %self.config.endpoint, "Adopting existing broker connection");
        } else {
            self.broker.disconnect().await;
            tracing::info!(endpoint = %self.config.endpoint, "Connecting to broker");
            bounded(
                "connect",
                self.config.connect_timeout,
                self.broker
                    .connect(&self.config.endpoint, self.config.connect_timeout),
            )
            .await
            .map_err(SupervisorError::Connect)?;
            tracing::info!(endpoint = %self.config.endpoint, "Broker connected");
            tokio::time::sleep(self.config.settle_delay).await;
        }
        backoff.reset();

        loop {
            self.set_state(ConnectionState::ConnectedIdle);
            self.wait_idle(&mut events).await?;

            self.set_state(ConnectionState::Probing);
            self.probe().await?;
        }
    }

    /// Wait out the idle period, restarting it on inbound traffic.
    async fn wait_idle(
        &self,
        events: &mut broadcast::Receiver<BrokerEvent>,
    ) -> Result<(), SupervisorError> {
        let mut deadline = Instant::now() + self.config.idle_timeout;

        loop {
            tokio::select! {
                () = tokio::time::sleep_until(deadline) => {
                    tracing::debug!("Idle timer fired");
                    return Ok(());
                }
                event = events.recv() => match event {
                    Ok(BrokerEvent::Error { code, message, request_id }) => {
                        if self.config.disconnect_error_codes.contains(&code) {
                            return Err(SupervisorError::DisconnectError { code, message });
                        }
                        tracing::warn!(code, request_id = ?request_id, message = %message, "Broker error");
                    }
                    Ok(BrokerEvent::Disconnected) => return Err(SupervisorError::Disconnected),
                    Ok(BrokerEvent::IdleTimeout) => {
                        tracing::debug!("Broker reported idle timeout");
                        return Ok(());
                    }
                    Ok(BrokerEvent::OrderStatus(_)) => {
                        deadline = Instant::now() + self.config.idle_timeout;
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "Supervisor lagged behind broker events");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        return Err(SupervisorError::EventsClosed);
                    }
                },
            }
        }
    }

    async fn probe(&self) -> Result<(), SupervisorError> {
        let started = Instant::now();
        let result = bounded(
            "probe",
            self.config.probe_timeout,
            self.broker.historical_bars(&self.config.probe),
        )
        .await;
        metrics::record_probe(&self.label, matches!(&result, Ok(bars) if !bars.is_empty()));

        let bars = result.map_err(SupervisorError::Probe)?;
        if bars.is_empty() {
            return Err(SupervisorError::EmptyProbe);
        }

        tracing::debug!(
            bars = bars.len(),
            elapsed = ?started.elapsed(),
            "Probe succeeded"
        );
        Ok(())
    }

    fn set_state(&self, state: ConnectionState) {
        self.state_tx.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                tracing::debug!(from = current.as_str(), to = state.as_str(), "Connection state");
                *current = state;
                true
            }
        });
        metrics::set_connection_state(&self.label, state);
    }
}
