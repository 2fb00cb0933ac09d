//! Order Types
//!
//! Sides, statuses, routing and the single working order a reconciler may
//! hold. Liveness and remaining quantity are read from the broker on every
//! pass; `WorkingOrder` only remembers what is needed to ask.

use std::cmp::Ordering;
use std::fmt;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::instrument::{ContractId, SecurityType};

/// Broker-assigned order identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OrderId(u64);

impl OrderId {
    /// Create an order identifier.
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Raw identifier value.
    #[must_use]
    pub const fn value(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for OrderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Order side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderSide {
    /// Buy order.
    Buy,
    /// Sell order.
    Sell,
}

impl OrderSide {
    /// Side needed to move the position by `delta`.
    ///
    /// Returns `None` for a zero delta.
    #[must_use]
    pub fn for_delta(delta: Decimal) -> Option<Self> {
        match delta.cmp(&Decimal::ZERO) {
            Ordering::Greater => Some(Self::Buy),
            Ordering::Less => Some(Self::Sell),
            Ordering::Equal => None,
        }
    }

    /// Returns the sign for position calculations.
    ///
    /// Buy = +1, Sell = -1
    #[must_use]
    pub const fn sign(&self) -> i32 {
        match self {
            Self::Buy => 1,
            Self::Sell => -1,
        }
    }

    /// Signed position change of filling `quantity` on this side.
    #[must_use]
    pub fn signed(&self, quantity: Decimal) -> Decimal {
        quantity * Decimal::from(self.sign())
    }
}

impl fmt::Display for OrderSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Buy => write!(f, "BUY"),
            Self::Sell => write!(f, "SELL"),
        }
    }
}

/// Broker order status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OrderStatus {
    /// Sent, not yet acknowledged.
    PendingSubmit,
    /// Accepted but held (e.g. outside trading hours).
    PreSubmitted,
    /// Working at the exchange.
    Submitted,
    /// Cancel requested, not yet confirmed.
    PendingCancel,
    /// Cancelled.
    Cancelled,
    /// Completely filled.
    Filled,
    /// Rejected or otherwise dead.
    Inactive,
}

impl OrderStatus {
    /// Whether the order can still trade.
    #[must_use]
    pub const fn is_live(&self) -> bool {
        matches!(
            self,
            Self::PendingSubmit | Self::PreSubmitted | Self::Submitted | Self::PendingCancel
        )
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::PendingSubmit => "PendingSubmit",
            Self::PreSubmitted => "PreSubmitted",
            Self::Submitted => "Submitted",
            Self::PendingCancel => "PendingCancel",
            Self::Cancelled => "Cancelled",
            Self::Filled => "Filled",
            Self::Inactive => "Inactive",
        };
        f.write_str(s)
    }
}

/// Urgency of the broker's Adaptive algo.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum AdaptivePriority {
    /// Favour price over speed.
    Patient,
    /// Balanced.
    Normal,
    /// Favour speed over price.
    #[default]
    Urgent,
}

impl AdaptivePriority {
    /// Broker parameter value.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Patient => "Patient",
            Self::Normal => "Normal",
            Self::Urgent => "Urgent",
        }
    }
}

/// How a market order is routed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Routing {
    /// Plain market order.
    Market,
    /// Market order worked by the Adaptive algo.
    Adaptive {
        /// Algo urgency.
        priority: AdaptivePriority,
    },
}

impl Routing {
    /// Default routing for a security type: Adaptive/Urgent for exchange
    /// traded contracts, plain market for spot cash.
    #[must_use]
    pub const fn default_for(security_type: SecurityType) -> Self {
        if security_type.is_exchange_traded() {
            Self::Adaptive {
                priority: AdaptivePriority::Urgent,
            }
        } else {
            Self::Market
        }
    }
}

impl fmt::Display for Routing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Market => f.write_str("MKT"),
            Self::Adaptive { priority } => write!(f, "MKT/Adaptive({})", priority.as_str()),
        }
    }
}

/// Order to place.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderRequest {
    /// Side.
    pub side: OrderSide,
    /// Unsigned quantity in broker units.
    pub quantity: Decimal,
    /// Routing.
    pub routing: Routing,
}

impl OrderRequest {
    /// Create a market order request.
    #[must_use]
    pub const fn market(side: OrderSide, quantity: Decimal, routing: Routing) -> Self {
        Self {
            side,
            quantity,
            routing,
        }
    }
}

impl fmt::Display for OrderRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.side, self.quantity, self.routing)
    }
}

/// Acknowledgment from broker after order submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderAck {
    /// Broker-assigned order ID.
    pub order_id: OrderId,
    /// Status at acknowledgment time.
    pub status: OrderStatus,
}

/// Point-in-time view of an order at the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderSnapshot {
    /// Order identifier.
    pub order_id: OrderId,
    /// Contract the order trades.
    pub contract_id: ContractId,
    /// Current status.
    pub status: OrderStatus,
    /// Side.
    pub side: OrderSide,
    /// Original quantity.
    pub quantity: Decimal,
    /// Filled so far.
    pub filled: Decimal,
}

impl OrderSnapshot {
    /// Unfilled quantity.
    #[must_use]
    pub fn remaining(&self) -> Decimal {
        (self.quantity - self.filled).max(Decimal::ZERO)
    }
}

/// The one order a reconciler instance may have working.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkingOrder {
    /// Broker identity, used for status queries and cancellation.
    pub order_id: OrderId,
    /// Side as placed.
    pub side: OrderSide,
    /// Quantity as placed.
    pub quantity: Decimal,
}
