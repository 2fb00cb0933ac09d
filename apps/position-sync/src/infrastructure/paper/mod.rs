//! Paper Brokerage Adapter
//!
//! In-process implementation of [`BrokerPort`]. Contracts are resolved from
//! a configured catalog, market orders fill in full after a configurable
//! delay (or only when [`PaperBroker::fill_order`] is called), and the
//! account's positions follow the fills.
//!
//! Fault hooks simulate the failure modes the supervisor exists for:
//! a silent hang (every request blocks until the next connect), a dropped
//! connection, and broker error codes.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde::Deserialize;
use tokio::sync::broadcast;

use crate::application::ports::{
    Bar, BrokerEndpoint, BrokerError, BrokerEvent, BrokerPort, BrokerPosition, ProbeRequest,
};
use crate::domain::instrument::{ContractId, Instrument, InstrumentSpec};
use crate::domain::order::{OrderAck, OrderId, OrderRequest, OrderSnapshot, OrderStatus};

const EVENT_CAPACITY: usize = 256;
const FIRST_AUTO_CONTRACT_ID: i64 = 900_000;

/// Catalog entry.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PaperContract {
    /// Contract identifier returned by qualification.
    pub contract_id: ContractId,
    /// Fully specified contract.
    #[serde(flatten)]
    pub spec: InstrumentSpec,
}

/// Paper broker settings.
#[derive(Debug, Clone, Default)]
pub struct PaperBrokerConfig {
    /// Delay before a new order fills. `None` leaves orders working until
    /// filled by hand.
    pub fill_delay: Option<Duration>,
    /// Contracts available for qualification.
    pub contracts: Vec<PaperContract>,
}

#[derive(Debug, Default)]
struct PaperState {
    reachable: bool,
    connected: bool,
    hung: bool,
    endpoint: Option<BrokerEndpoint>,
    catalog: Vec<PaperContract>,
    next_order_id: u64,
    orders: BTreeMap<OrderId, OrderSnapshot>,
    positions: BTreeMap<ContractId, Decimal>,
}

struct Inner {
    fill_delay: Option<Duration>,
    state: Mutex<PaperState>,
    events: broadcast::Sender<BrokerEvent>,
}

impl Inner {
    fn publish(&self, event: BrokerEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn fill(&self, order_id: OrderId, quantity: Option<Decimal>) -> Result<OrderSnapshot, BrokerError> {
        let snapshot = {
            let mut state = self.state.lock();
            let order = state
                .orders
                .get_mut(&order_id)
                .ok_or(BrokerError::OrderNotFound { order_id })?;
            if !order.status.is_live() {
                return Err(BrokerError::OrderRejected {
                    reason: format!("order {order_id} is {}", order.status),
                });
            }

            let qty = quantity.unwrap_or_else(|| order.remaining()).min(order.remaining());
            order.filled += qty;
            if order.remaining().is_zero() {
                order.status = OrderStatus::Filled;
            }
            let snapshot = order.clone();

            *state.positions.entry(snapshot.contract_id).or_default() += snapshot.side.signed(qty);
            snapshot
        };

        tracing::debug!(
            order_id = %order_id,
            filled = %snapshot.filled,
            status = %snapshot.status,
            "Paper fill"
        );
        self.publish(BrokerEvent::OrderStatus(snapshot.clone()));
        Ok(snapshot)
    }
}

/// In-process paper brokerage.
#[derive(Clone)]
pub struct PaperBroker {
    inner: Arc<Inner>,
}

impl PaperBroker {
    /// Create a disconnected paper broker.
    #[must_use]
    pub fn new(config: PaperBrokerConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let state = PaperState {
            reachable: true,
            catalog: config.contracts,
            next_order_id: 1,
            ..PaperState::default()
        };
        Self {
            inner: Arc::new(Inner {
                fill_delay: config.fill_delay,
                state: Mutex::new(state),
                events,
            }),
        }
    }

    /// Add `spec` to the catalog unless an entry already matches it.
    ///
    /// Returns the contract identifier `spec` resolves to.
    pub fn register(&self, spec: &InstrumentSpec) -> ContractId {
        let mut state = self.inner.state.lock();
        if let Some(existing) = state.catalog.iter().find(|c| spec.matches(&c.spec)) {
            return existing.contract_id;
        }

        let next = state
            .catalog
            .iter()
            .map(|c| c.contract_id.value() + 1)
            .max()
            .unwrap_or(FIRST_AUTO_CONTRACT_ID)
            .max(FIRST_AUTO_CONTRACT_ID);
        let contract_id = ContractId::new(next);
        state.catalog.push(PaperContract {
            contract_id,
            spec: spec.clone(),
        });
        contract_id
    }

    // =========================================================================
    // Fault and test hooks
    // =========================================================================

    /// Every request blocks until the next connect.
    pub fn simulate_hang(&self) {
        tracing::warn!("Paper broker hanging");
        self.inner.state.lock().hung = true;
    }

    /// Drop the session and emit [`BrokerEvent::Disconnected`].
    pub fn drop_connection(&self) {
        {
            let mut state = self.inner.state.lock();
            state.connected = false;
            state.hung = false;
        }
        self.inner.publish(BrokerEvent::Disconnected);
    }

    /// Refuse (or accept again) connection attempts.
    pub fn set_reachable(&self, reachable: bool) {
        self.inner.state.lock().reachable = reachable;
    }

    /// Emit a broker error.
    pub fn emit_error(&self, code: i32, message: impl Into<String>) {
        self.inner.publish(BrokerEvent::Error {
            request_id: None,
            code,
            message: message.into(),
        });
    }

    /// Emit [`BrokerEvent::IdleTimeout`].
    pub fn emit_idle_timeout(&self) {
        self.inner.publish(BrokerEvent::IdleTimeout);
    }

    /// Fill the rest of an order now.
    ///
    /// # Errors
    ///
    /// Returns `OrderNotFound` or `OrderRejected` if the order is unknown or
    /// no longer live.
    pub fn fill_order(&self, order_id: OrderId) -> Result<OrderSnapshot, BrokerError> {
        self.inner.fill(order_id, None)
    }

    /// Fill part of an order now.
    ///
    /// # Errors
    ///
    /// As [`fill_order`](Self::fill_order).
    pub fn fill_partially(&self, order_id: OrderId, quantity: Decimal) -> Result<OrderSnapshot, BrokerError> {
        self.inner.fill(order_id, Some(quantity))
    }

    /// Overwrite the position held in a contract.
    pub fn set_position(&self, contract_id: ContractId, quantity: Decimal) {
        self.inner.state.lock().positions.insert(contract_id, quantity);
    }

    /// Position held in a contract.
    #[must_use]
    pub fn position(&self, contract_id: ContractId) -> Decimal {
        self.inner
            .state
            .lock()
            .positions
            .get(&contract_id)
            .copied()
            .unwrap_or_default()
    }

    /// Live orders for a contract.
    #[must_use]
    pub fn live_orders(&self, contract_id: ContractId) -> Vec<OrderSnapshot> {
        self.inner
            .state
            .lock()
            .orders
            .values()
            .filter(|o| o.contract_id == contract_id && o.status.is_live())
            .cloned()
            .collect()
    }

    /// Every order ever placed, oldest first.
    #[must_use]
    pub fn orders(&self) -> Vec<OrderSnapshot> {
        self.inner.state.lock().orders.values().cloned().collect()
    }

    /// Wait while hung, then require a session.
    async fn ready(&self) -> Result<(), BrokerError> {
        let (connected, hung) = {
            let state = self.inner.state.lock();
            (state.connected, state.hung)
        };
        if hung {
            std::future::pending::<()>().await;
        }
        if connected {
            Ok(())
        } else {
            Err(BrokerError::NotConnected)
        }
    }
}

#[async_trait]
impl BrokerPort for PaperBroker {
    async fn connect(&self, endpoint: &BrokerEndpoint, _timeout: Duration) -> Result<(), BrokerError> {
        let mut state = self.inner.state.lock();
        if !state.reachable {
            return Err(BrokerError::ConnectionFailed {
                message: format!("{endpoint} unreachable"),
            });
        }
        state.connected = true;
        state.hung = false;
        state.endpoint = Some(endpoint.clone());
        drop(state);

        tracing::info!(endpoint = %endpoint, "Paper broker session opened");
        Ok(())
    }

    async fn disconnect(&self) {
        let mut state = self.inner.state.lock();
        state.connected = false;
        state.hung = false;
    }

    fn is_connected(&self) -> bool {
        self.inner.state.lock().connected
    }

    async fn positions(&self) -> Result<Vec<BrokerPosition>, BrokerError> {
        self.ready().await?;
        Ok(self
            .inner
            .state
            .lock()
            .positions
            .iter()
            .filter(|(_, qty)| !qty.is_zero())
            .map(|(contract_id, quantity)| BrokerPosition {
                contract_id: *contract_id,
                quantity: *quantity,
            })
            .collect())
    }

    async fn qualify(&self, spec: &InstrumentSpec) -> Result<Option<Instrument>, BrokerError> {
        self.ready().await?;
        let state = self.inner.state.lock();
        let mut matches = state.catalog.iter().filter(|c| spec.matches(&c.spec));

        match (matches.next(), matches.next()) {
            (None, _) => Ok(None),
            (Some(contract), None) => Ok(Some(Instrument::new(
                contract.contract_id,
                contract.spec.clone(),
            ))),
            (Some(_), Some(_)) => Err(BrokerError::Api {
                code: 200,
                message: format!("ambiguous contract specification for {}", spec.label()),
            }),
        }
    }

    async fn place_order(
        &self,
        instrument: &Instrument,
        request: &OrderRequest,
    ) -> Result<OrderAck, BrokerError> {
        self.ready().await?;
        if request.quantity <= Decimal::ZERO {
            return Err(BrokerError::OrderRejected {
                reason: format!("invalid quantity {}", request.quantity),
            });
        }

        let snapshot = {
            let mut state = self.inner.state.lock();
            let order_id = OrderId::new(state.next_order_id);
            state.next_order_id += 1;
            let snapshot = OrderSnapshot {
                order_id,
                contract_id: instrument.contract_id(),
                status: OrderStatus::Submitted,
                side: request.side,
                quantity: request.quantity,
                filled: Decimal::ZERO,
            };
            state.orders.insert(order_id, snapshot.clone());
            snapshot
        };

        tracing::debug!(order_id = %snapshot.order_id, order = %request, instrument = %instrument, "Paper order accepted");
        self.inner.publish(BrokerEvent::OrderStatus(snapshot.clone()));

        if let Some(delay) = self.inner.fill_delay {
            let inner = Arc::clone(&self.inner);
            let order_id = snapshot.order_id;
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                // Cancelled or filled by hand in the meantime.
                let _ = inner.fill(order_id, None);
            });
        }

        Ok(OrderAck {
            order_id: snapshot.order_id,
            status: snapshot.status,
        })
    }

    async fn cancel_order(&self, order_id: OrderId) -> Result<(), BrokerError> {
        self.ready().await?;
        let snapshot = {
            let mut state = self.inner.state.lock();
            let order = state
                .orders
                .get_mut(&order_id)
                .ok_or(BrokerError::OrderNotFound { order_id })?;
            if !order.status.is_live() {
                return Err(BrokerError::OrderRejected {
                    reason: format!("order {order_id} is {}, not cancellable", order.status),
                });
            }
            order.status = OrderStatus::Cancelled;
            order.clone()
        };

        self.inner.publish(BrokerEvent::OrderStatus(snapshot));
        Ok(())
    }

    async fn order_status(&self, order_id: OrderId) -> Result<OrderSnapshot, BrokerError> {
        self.ready().await?;
        self.inner
            .state
            .lock()
            .orders
            .get(&order_id)
            .cloned()
            .ok_or(BrokerError::OrderNotFound { order_id })
    }

    fn subscribe(&self) -> broadcast::Receiver<BrokerEvent> {
        self.inner.events.subscribe()
    }

    async fn historical_bars(&self, request: &ProbeRequest) -> Result<Vec<Bar>, BrokerError> {
        self.ready().await?;

        let bar_secs = request.bar_size.as_secs().max(1);
        let count = (request.duration.as_secs() / bar_secs).max(1);
        let now = Utc::now();
        let price = Decimal::new(10_850, 4);

        Ok((0..count)
            .rev()
            .map(|i| {
                let offset = i64::try_from((i + 1) * bar_secs).unwrap_or(i64::MAX);
                Bar {
                    time: now - chrono::Duration::seconds(offset),
                    open: price,
                    high: price,
                    low: price,
                    close: price,
                }
            })
            .collect())
    }
}
