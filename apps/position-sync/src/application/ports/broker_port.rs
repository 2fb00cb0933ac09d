//! Broker Port (Driven Port)
//!
//! Interface for the brokerage connection shared by every reconciler and
//! the health supervisor of one account.
//!
//! Implementations serialize requests through their own dispatch point;
//! callers never wrap the port in an additional lock. Notifications
//! (errors, unsolicited disconnects, idle timeouts, order status changes)
//! are delivered as [`BrokerEvent`] values on a broadcast channel rather
//! than through callback lists.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::domain::instrument::{ContractId, Instrument, InstrumentSpec};
use crate::domain::order::{OrderAck, OrderId, OrderRequest, OrderSnapshot};

/// Address and session identity of a brokerage connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BrokerEndpoint {
    /// Gateway host.
    pub host: String,
    /// Gateway port.
    pub port: u16,
    /// API client identifier; must be unique per gateway.
    pub client_id: i32,
}

impl BrokerEndpoint {
    /// Create an endpoint.
    #[must_use]
    pub fn new(host: impl Into<String>, port: u16, client_id: i32) -> Self {
        Self {
            host: host.into(),
            port,
            client_id,
        }
    }
}

impl fmt::Display for BrokerEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}#{}", self.host, self.port, self.client_id)
    }
}

/// One entry of the broker's live position list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerPosition {
    /// Contract held.
    pub contract_id: ContractId,
    /// Signed quantity in broker units.
    pub quantity: Decimal,
}

/// Historical-data request used purely to test connection liveness.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeRequest {
    /// Contract to request bars for; unrelated to any tracked instrument.
    pub contract: InstrumentSpec,
    /// Length of the history window.
    pub duration: Duration,
    /// Bar size.
    pub bar_size: Duration,
    /// Data type (e.g. `MIDPOINT`).
    pub what_to_show: String,
}

impl Default for ProbeRequest {
    fn default() -> Self {
        Self {
            contract: InstrumentSpec::forex("EURUSD"),
            duration: Duration::from_secs(30),
            bar_size: Duration::from_secs(5),
            what_to_show: "MIDPOINT".to_string(),
        }
    }
}

/// Historical bar.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bar {
    /// Bar open time.
    pub time: DateTime<Utc>,
    /// Open.
    pub open: Decimal,
    /// High.
    pub high: Decimal,
    /// Low.
    pub low: Decimal,
    /// Close.
    pub close: Decimal,
}

/// Notification pushed by the broker connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerEvent {
    /// Broker-reported error. `request_id` is `None` for session-level errors.
    Error {
        /// Request the error refers to.
        request_id: Option<i64>,
        /// Broker error code.
        code: i32,
        /// Broker error text.
        message: String,
    },
    /// The connection dropped without a `disconnect()` call.
    Disconnected,
    /// The broker saw no inbound traffic for its configured idle period.
    IdleTimeout,
    /// An order changed status.
    OrderStatus(OrderSnapshot),
}

/// Broker port error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BrokerError {
    /// No session is established.
    #[error("broker not connected")]
    NotConnected,

    /// Connection attempt failed.
    #[error("broker connection failed: {message}")]
    ConnectionFailed {
        /// Error details.
        message: String,
    },

    /// The operation did not complete in time.
    #[error("broker {operation} timed out after {timeout:?}")]
    Timeout {
        /// Operation name.
        operation: &'static str,
        /// Limit that elapsed.
        timeout: Duration,
    },

    /// Order rejected by broker.
    #[error("order rejected: {reason}")]
    OrderRejected {
        /// Rejection reason.
        reason: String,
    },

    /// Order not found.
    #[error("order not found: {order_id}")]
    OrderNotFound {
        /// The missing order ID.
        order_id: OrderId,
    },

    /// Broker-reported API error.
    #[error("broker error {code}: {message}")]
    Api {
        /// Broker error code.
        code: i32,
        /// Broker error text.
        message: String,
    },
}

impl BrokerError {
    /// Whether the error indicates the connection itself is unusable.
    #[must_use]
    pub const fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::NotConnected | Self::ConnectionFailed { .. } | Self::Timeout { .. }
        )
    }
}

/// Port for the shared brokerage connection.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BrokerPort: Send + Sync {
    /// Open a session. Completes once the session is usable.
    async fn connect(&self, endpoint: &BrokerEndpoint, timeout: Duration)
    -> Result<(), BrokerError>;

    /// Close the session. Does not emit [`BrokerEvent::Disconnected`].
    async fn disconnect(&self);

    /// Whether a session is currently established.
    fn is_connected(&self) -> bool;

    /// Live position list for the account.
    async fn positions(&self) -> Result<Vec<BrokerPosition>, BrokerError>;

    /// Resolve a specification to exactly one contract.
    ///
    /// Returns `Ok(None)` when no contract matches.
    async fn qualify(&self, spec: &InstrumentSpec) -> Result<Option<Instrument>, BrokerError>;

    /// Place an order. Completes on the broker's acknowledgment.
    async fn place_order(
        &self,
        instrument: &Instrument,
        request: &OrderRequest,
    ) -> Result<OrderAck, BrokerError>;

    /// Cancel an order. Completes once the broker confirms the order is no
    /// longer live.
    async fn cancel_order(&self, order_id: OrderId) -> Result<(), BrokerError>;

    /// Current state of an order.
    async fn order_status(&self, order_id: OrderId) -> Result<OrderSnapshot, BrokerError>;

    /// Subscribe to connection notifications.
    fn subscribe(&self) -> broadcast::Receiver<BrokerEvent>;

    /// Request historical bars.
    async fn historical_bars(&self, request: &ProbeRequest) -> Result<Vec<Bar>, BrokerError>;
}

/// Await a broker call with an explicit time limit.
///
/// An elapsed limit becomes [`BrokerError::Timeout`], so callers route it
/// through the same recovery path as any other broker failure.
///
/// # Errors
///
/// Returns the call's own error, or `BrokerError::Timeout` if `limit`
/// elapses first.
pub async fn bounded<T, F>(operation: &'static str, limit: Duration, call: F) -> Result<T, BrokerError>
where
    F: Future<Output = Result<T, BrokerError>>,
{
    tokio::time::timeout(limit, call)
        .await
        .map_err(|_| BrokerError::Timeout {
            operation,
            timeout: limit,
        })?
}
