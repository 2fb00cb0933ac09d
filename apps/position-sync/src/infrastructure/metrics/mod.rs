//! Prometheus Metrics Module
//!
//! # Metrics Categories
//!
//! - **Reconciliation**: passes by outcome, failed passes, orders placed and
//!   cancelled
//! - **Source**: records received by kind, source reconnects
//! - **Broker**: probe results, forced reconnects, connection state
//!
//! # Integration
//!
//! Metrics are served at `/metrics` on `POSITION_SYNC_METRICS_PORT`. Without
//! an installed recorder every call below is a no-op.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::OnceLock;

use metrics::{counter, describe_counter, describe_gauge, gauge};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};

use crate::application::services::ReconcileOutcome;
use crate::domain::connection::ConnectionState;

static INSTALLED: OnceLock<SocketAddr> = OnceLock::new();

/// Install the Prometheus recorder and its HTTP listener on `port`.
///
/// Port 0 disables metrics. Must be called from within a tokio runtime.
/// Later calls are no-ops.
///
/// # Errors
///
/// Returns the exporter's build error if the listener or recorder cannot be
/// installed.
pub fn init_metrics(port: u16) -> Result<Option<SocketAddr>, BuildError> {
    if port == 0 {
        return Ok(None);
    }
    if let Some(addr) = INSTALLED.get() {
        return Ok(Some(*addr));
    }

    let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    register_metrics();

    Ok(Some(*INSTALLED.get_or_init(|| addr)))
}

// =============================================================================
// Metric Registration
// =============================================================================

fn register_metrics() {
    describe_counter!(
        "position_sync_reconcile_passes_total",
        "Completed reconciliation passes by outcome"
    );
    describe_counter!(
        "position_sync_reconcile_errors_total",
        "Reconciliation passes aborted by an error"
    );
    describe_counter!("position_sync_orders_placed_total", "Orders placed");
    describe_counter!("position_sync_orders_cancelled_total", "Orders cancelled");

    describe_counter!(
        "position_sync_source_records_total",
        "Records read from position sources by kind"
    );
    describe_counter!(
        "position_sync_source_reconnects_total",
        "Position source reconnects by reason"
    );

    describe_counter!("position_sync_probes_total", "Broker liveness probes by result");
    describe_counter!(
        "position_sync_broker_reconnects_total",
        "Forced brokerage reconnects"
    );
    describe_gauge!(
        "position_sync_connection_state",
        "Supervisor state (0 connecting, 1 idle, 2 probing, 3 reconnecting)"
    );
}

// =============================================================================
// Metric Recording Functions
// =============================================================================

/// Kind of record read from a position source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordKind {
    /// Carried a `position`.
    Position,
    /// Well-formed record without a `position`.
    Heartbeat,
    /// Undecodable line.
    Invalid,
}

impl RecordKind {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Position => "position",
            Self::Heartbeat => "heartbeat",
            Self::Invalid => "invalid",
        }
    }
}

/// Record a completed reconciliation pass and the orders it touched.
pub fn record_reconcile(instrument: &str, outcome: &ReconcileOutcome) {
    counter!(
        "position_sync_reconcile_passes_total",
        "instrument" => instrument.to_string(),
        "outcome" => outcome.as_str()
    )
    .increment(1);

    let (cancelled, placed) = match outcome {
        ReconcileOutcome::Placed { .. } => (0, 1),
        ReconcileOutcome::Replaced { .. } => (1, 1),
        _ => (0, 0),
    };
    if cancelled > 0 {
        counter!("position_sync_orders_cancelled_total", "instrument" => instrument.to_string())
            .increment(cancelled);
    }
    if placed > 0 {
        counter!("position_sync_orders_placed_total", "instrument" => instrument.to_string())
            .increment(placed);
    }
}

/// Record an aborted reconciliation pass.
pub fn record_reconcile_error(instrument: &str) {
    counter!(
        "position_sync_reconcile_errors_total",
        "instrument" => instrument.to_string()
    )
    .increment(1);
}

/// Record a line read from a position source.
pub fn record_source_record(instrument: &str, kind: RecordKind) {
    counter!(
        "position_sync_source_records_total",
        "instrument" => instrument.to_string(),
        "kind" => kind.as_str()
    )
    .increment(1);
}

/// Record a position source reconnect.
pub fn record_source_reconnect(instrument: &str, reason: &'static str) {
    counter!(
        "position_sync_source_reconnects_total",
        "instrument" => instrument.to_string(),
        "reason" => reason
    )
    .increment(1);
}

/// Record a liveness probe result.
pub fn record_probe(endpoint: &str, ok: bool) {
    counter!(
        "position_sync_probes_total",
        "endpoint" => endpoint.to_string(),
        "result" => if ok { "ok" } else { "failed" }
    )
    .increment(1);
}

/// Record a forced brokerage reconnect.
pub fn record_broker_reconnect(endpoint: &str) {
    counter!(
        "position_sync_broker_reconnects_total",
        "endpoint" => endpoint.to_string()
    )
    .increment(1);
}

/// Publish the supervisor state.
pub fn set_connection_state(endpoint: &str, state: ConnectionState) {
    gauge!(
        "position_sync_connection_state",
        "endpoint" => endpoint.to_string()
    )
    .set(state.as_gauge());
}
