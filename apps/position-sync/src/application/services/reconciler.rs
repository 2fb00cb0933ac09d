//! Order Reconciler
//!
//! Compares the scaled target position with the live broker position and
//! keeps at most one working order per instrument moving the account
//! towards the target.
//!
//! # Pass
//!
//! 1. Query the actual position.
//! 2. Re-read the working order (if any); drop the reference once it is no
//!    longer live.
//! 3. `delta = multiplier * target - actual`.
//! 4. A live working order is kept only if its side and remaining quantity
//!    match `delta` exactly; otherwise it is cancelled (and the cancel
//!    acknowledged) before anything new is placed.
//!
//! Every broker call is bounded by the configured request timeout. A failed
//! step aborts the pass; the next target update retries from a fresh query.

use std::sync::Arc;
use std::time::Duration;

use rust_decimal::Decimal;

use crate::application::ports::{BrokerError, BrokerPort, bounded};
use crate::application::services::position_query::query_position;
use crate::domain::instrument::Instrument;
use crate::domain::order::{
    OrderId, OrderRequest, OrderSide, OrderSnapshot, OrderStatus, Routing, WorkingOrder,
};

/// Default limit for a single broker request.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Per-instrument reconciliation settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcilerConfig {
    /// External units → broker units.
    pub multiplier: Decimal,
    /// Routing for new orders.
    pub routing: Routing,
    /// Limit for each broker request.
    pub request_timeout: Duration,
}

impl ReconcilerConfig {
    /// Create a configuration with the default request timeout.
    #[must_use]
    pub const fn new(multiplier: Decimal, routing: Routing) -> Self {
        Self {
            multiplier,
            routing,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    /// Set the request timeout.
    #[must_use]
    pub const fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }
}

/// What a reconciliation pass did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// No target received yet.
    AwaitingTarget,
    /// Position already at target. A live working order, if any, is kept.
    NoChange {
        /// Actual position.
        actual: Decimal,
    },
    /// The working order already covers the delta.
    Holding {
        /// Working order.
        order_id: OrderId,
        /// Its remaining quantity.
        remaining: Decimal,
    },
    /// New order placed, nothing was working.
    Placed {
        /// New order.
        order_id: OrderId,
        /// Side.
        side: OrderSide,
        /// Quantity.
        quantity: Decimal,
    },
    /// Working order cancelled and a new one placed.
    Replaced {
        /// Cancelled order.
        cancelled: OrderId,
        /// New order.
        order_id: OrderId,
        /// Side.
        side: OrderSide,
        /// Quantity.
        quantity: Decimal,
    },
}

impl ReconcileOutcome {
    /// Outcome name for logs and metric labels.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::AwaitingTarget => "awaiting_target",
            Self::NoChange { .. } => "no_change",
            Self::Holding { .. } => "holding",
            Self::Placed { .. } => "placed",
            Self::Replaced { .. } => "replaced",
        }
    }
}

/// Reconciliation errors. None of them escape the instance loop.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReconcileError {
    /// Actual position could not be read.
    #[error("position query failed: {0}")]
    PositionQuery(#[source] BrokerError),

    /// Working order status could not be read.
    #[error("status query for order {order_id} failed: {source}")]
    OrderStatus {
        /// Order queried.
        order_id: OrderId,
        /// Broker error.
        source: BrokerError,
    },

    /// Working order is already being cancelled by someone else.
    #[error("order {order_id} has a cancel pending")]
    CancelPending {
        /// Order with the pending cancel.
        order_id: OrderId,
    },

    /// Cancel was not acknowledged.
    #[error("cancel of order {order_id} failed: {source}")]
    Cancel {
        /// Order being cancelled.
        order_id: OrderId,
        /// Broker error.
        source: BrokerError,
    },

    /// Scaled target minus actual does not fit in a decimal.
    #[error("delta for target {target} x {multiplier} against {actual} is out of range")]
    Overflow {
        /// Target received.
        target: Decimal,
        /// Configured multiplier.
        multiplier: Decimal,
        /// Actual position.
        actual: Decimal,
    },

    /// New order was not acknowledged.
    #[error("order placement failed: {0}")]
    Placement(#[source] BrokerError),

    /// The single-working-order invariant does not hold.
    #[error("working order invariant violated: {0}")]
    Invariant(String),
}

impl ReconcileError {
    /// Whether the pass failed because the brokerage connection is unusable.
    /// The supervisor owns recovery for these.
    #[must_use]
    pub const fn is_connection_error(&self) -> bool {
        match self {
            Self::PositionQuery(source) | Self::Placement(source) => source.is_connection_error(),
            Self::OrderStatus { source, .. } | Self::Cancel { source, .. } => {
                source.is_connection_error()
            }
            Self::CancelPending { .. } | Self::Overflow { .. } | Self::Invariant(_) => false,
        }
    }
}

/// Reconciler for one instrument on one brokerage connection.
///
/// Owns its working order exclusively. Passes for the same instance never
/// overlap because they are driven sequentially by one source stream.
pub struct OrderReconciler {
    instrument: Instrument,
    broker: Arc<dyn BrokerPort>,
    config: ReconcilerConfig,
    target: Option<Decimal>,
    working: Option<WorkingOrder>,
    last_cancelled: Option<OrderId>,
}

impl OrderReconciler {
    /// Create a reconciler with no target and no working order.
    #[must_use]
    pub fn new(instrument: Instrument, broker: Arc<dyn BrokerPort>, config: ReconcilerConfig) -> Self {
        Self {
            instrument,
            broker,
            config,
            target: None,
            working: None,
            last_cancelled: None,
        }
    }

    /// Instrument being reconciled.
    #[must_use]
    pub const fn instrument(&self) -> &Instrument {
        &self.instrument
    }

    /// Last received target, in external units.
    #[must_use]
    pub const fn target(&self) -> Option<Decimal> {
        self.target
    }

    /// Currently tracked working order.
    #[must_use]
    pub const fn working_order(&self) -> Option<&WorkingOrder> {
        self.working.as_ref()
    }

    /// Record a new target. Returns `true` if it differs from the previous one.
    pub fn set_target(&mut self, target: Decimal) -> bool {
        let changed = self.target != Some(target);
        self.target = Some(target);
        changed
    }

    /// Run one pass, logging instead of returning errors.
    ///
    /// Returns `None` when the pass failed.
    pub async fn run_pass(&mut self) -> Option<ReconcileOutcome> {
        match self.reconcile().await {
            Ok(outcome) => {
                match &outcome {
                    ReconcileOutcome::AwaitingTarget => {
                        tracing::debug!("No target received yet, skipping reconciliation");
                    }
                    ReconcileOutcome::NoChange { actual } => {
                        tracing::debug!(actual = %actual, "Position at target");
                    }
                    ReconcileOutcome::Holding {
                        order_id,
                        remaining,
                    } => {
                        tracing::debug!(
                            order_id = %order_id,
                            remaining = %remaining,
                            "Working order already covers delta"
                        );
                    }
                    ReconcileOutcome::Placed {
                        order_id,
                        side,
                        quantity,
                    } => {
                        tracing::info!(
                            order_id = %order_id,
                            side = %side,
                            quantity = %quantity,
                            "Order placed"
                        );
                    }
                    ReconcileOutcome::Replaced {
                        cancelled,
                        order_id,
                        side,
                        quantity,
                    } => {
                        tracing::info!(
                            cancelled = %cancelled,
                            order_id = %order_id,
                            side = %side,
                            quantity = %quantity,
                            "Order replaced"
                        );
                    }
                }
                Some(outcome)
            }
            Err(ReconcileError::CancelPending { order_id }) => {
                tracing::info!(order_id = %order_id, "Waiting for pending cancel to complete");
                None
            }
            Err(e) if e.is_connection_error() => {
                tracing::warn!(error = %e, "Reconciliation pass skipped, broker unavailable");
                None
            }
            Err(e) => {
                tracing::error!(error = %e, "Reconciliation pass failed");
                None
            }
        }
    }

    /// Run one pass.
    ///
    /// # Errors
    ///
    /// Returns the first failing step. State is left consistent: the
    /// working order reference is only dropped once the broker reports the
    /// order dead or acknowledges its cancellation.
    pub async fn reconcile(&mut self) -> Result<ReconcileOutcome, ReconcileError> {
        let Some(target) = self.target else {
            return Ok(ReconcileOutcome::AwaitingTarget);
        };

        self.check_invariant()?;
        let outcome = self.reconcile_towards(target).await?;
        self.check_invariant()?;

        Ok(outcome)
    }

    async fn reconcile_towards(&mut self, target: Decimal) -> Result<ReconcileOutcome, ReconcileError> {
        let actual = query_position(
            self.broker.as_ref(),
            &self.instrument,
            self.config.request_timeout,
        )
        .await
        .map_err(ReconcileError::PositionQuery)?;

        let live = self.refresh_working_order().await?;

        let multiplier = self.config.multiplier;
        let delta = multiplier
            .checked_mul(target)
            .and_then(|scaled| scaled.checked_sub(actual))
            .ok_or(ReconcileError::Overflow {
                target,
                multiplier,
                actual,
            })?;
        tracing::debug!(
            target = %target,
            actual = %actual,
            delta = %delta,
            working = ?self.working.as_ref().map(|w| w.order_id),
            "Reconciling"
        );

        let Some(side) = OrderSide::for_delta(delta) else {
            return Ok(ReconcileOutcome::NoChange { actual });
        };
        let quantity = delta.abs();

        let mut cancelled = None;
        if let Some(snapshot) = live {
            let remaining = snapshot.remaining();
            if snapshot.side == side && remaining == quantity {
                return Ok(ReconcileOutcome::Holding {
                    order_id: snapshot.order_id,
                    remaining,
                });
            }
            self.cancel_working(&snapshot).await?;
            cancelled = Some(snapshot.order_id);
        }

        let order_id = self.place(side, quantity).await?;

        Ok(match cancelled {
            Some(cancelled) => ReconcileOutcome::Replaced {
                cancelled,
                order_id,
                side,
                quantity,
            },
            None => ReconcileOutcome::Placed {
                order_id,
                side,
                quantity,
            },
        })
    }

    /// Re-read the working order. Returns its snapshot while it is live and
    /// clears the reference once it is not.
    async fn refresh_working_order(&mut self) -> Result<Option<OrderSnapshot>, ReconcileError> {
        let Some(order_id) = self.working.as_ref().map(|w| w.order_id) else {
            return Ok(None);
        };

        let result = bounded(
            "order_status",
            self.config.request_timeout,
            self.broker.order_status(order_id),
        )
        .await;

        match result {
            Ok(snapshot) if snapshot.status == OrderStatus::PendingCancel => {
                Err(ReconcileError::CancelPending { order_id })
            }
            Ok(snapshot) if snapshot.status.is_live() => Ok(Some(snapshot)),
            Ok(snapshot) => {
                tracing::info!(
                    order_id = %order_id,
                    status = %snapshot.status,
                    filled = %snapshot.filled,
                    "Working order no longer live"
                );
                self.working = None;
                Ok(None)
            }
            Err(BrokerError::OrderNotFound { .. }) => {
                tracing::warn!(order_id = %order_id, "Working order unknown to broker, dropping it");
                self.working = None;
                Ok(None)
            }
            Err(source) => Err(ReconcileError::OrderStatus { order_id, source }),
        }
    }

    async fn cancel_working(&mut self, snapshot: &OrderSnapshot) -> Result<(), ReconcileError> {
        let order_id = snapshot.order_id;
        tracing::info!(
            order_id = %order_id,
            side = %snapshot.side,
            remaining = %snapshot.remaining(),
            "Cancelling order"
        );

        bounded(
            "cancel_order",
            self.config.request_timeout,
            self.broker.cancel_order(order_id),
        )
        .await
        .map_err(|source| ReconcileError::Cancel { order_id, source })?;

        self.working = None;
        self.last_cancelled = Some(order_id);
        Ok(())
    }

    async fn place(&mut self, side: OrderSide, quantity: Decimal) -> Result<OrderId, ReconcileError> {
        if let Some(existing) = &self.working {
            return Err(ReconcileError::Invariant(format!(
                "refusing to place {side} {quantity} while order {} is working",
                existing.order_id
            )));
        }

        let request = OrderRequest::market(side, quantity, self.config.routing);
        tracing::info!(order = %request, "Placing order");

        let ack = bounded(
            "place_order",
            self.config.request_timeout,
            self.broker.place_order(&self.instrument, &request),
        )
        .await
        .map_err(ReconcileError::Placement)?;

        self.working = Some(WorkingOrder {
            order_id: ack.order_id,
            side,
            quantity,
        });
        Ok(ack.order_id)
    }

    /// At most one order is tracked (by construction), it has a positive
    /// quantity, and it is never one this instance already cancelled.
    fn check_invariant(&self) -> Result<(), ReconcileError> {
        let Some(working) = &self.working else {
            return Ok(());
        };

        if working.quantity <= Decimal::ZERO {
            return Err(ReconcileError::Invariant(format!(
                "working order {} has non-positive quantity {}",
                working.order_id, working.quantity
            )));
        }
        if self.last_cancelled == Some(working.order_id) {
            return Err(ReconcileError::Invariant(format!(
                "order {} was cancelled but is still tracked",
                working.order_id
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use async_trait::async_trait;
    use mockall::Sequence;
    use parking_lot::Mutex;
    use proptest::prelude::*;
    use rust_decimal_macros::dec;
    use tokio::sync::broadcast;

    use super::*;
    use crate::application::ports::{
        Bar, BrokerEndpoint, BrokerEvent, BrokerPosition, MockBrokerPort, ProbeRequest,
    };
    use crate::domain::instrument::{ContractId, InstrumentSpec, SecurityType};
    use crate::domain::order::{AdaptivePriority, OrderAck};

    const CONTRACT: ContractId = ContractId::new(495_512_563);

    #[derive(Default)]
    struct FakeState {
        position: Decimal,
        orders: BTreeMap<u64, OrderSnapshot>,
        next_id: u64,
        calls: Vec<String>,
        max_live: usize,
        fail_positions: bool,
        fail_cancel: bool,
    }

    impl FakeState {
        fn live_count(&self) -> usize {
            self.orders.values().filter(|o| o.status.is_live()).count()
        }
    }

    /// In-memory broker recording every call.
    struct FakeBroker {
        state: Mutex<FakeState>,
        events: broadcast::Sender<BrokerEvent>,
    }

    impl FakeBroker {
        fn new() -> Arc<Self> {
            let (events, _) = broadcast::channel(16);
            Arc::new(Self {
                state: Mutex::new(FakeState::default()),
                events,
            })
        }

        fn set_position(&self, qty: Decimal) {
            self.state.lock().position = qty;
        }

        fn fill(&self, order_id: OrderId, qty: Decimal) {
            let mut state = self.state.lock();
            let order = state.orders.get_mut(&order_id.value()).unwrap();
            let qty = qty.min(order.remaining());
            order.filled += qty;
            if order.remaining().is_zero() {
                order.status = OrderStatus::Filled;
            }
            let signed = order.side.signed(qty);
            state.position += signed;
        }

        fn set_status(&self, order_id: OrderId, status: OrderStatus) {
            self.state.lock().orders.get_mut(&order_id.value()).unwrap().status = status;
        }

        fn calls(&self) -> Vec<String> {
            self.state.lock().calls.clone()
        }

        fn live_count(&self) -> usize {
            self.state.lock().live_count()
        }

        fn max_live(&self) -> usize {
            self.state.lock().max_live
        }
    }

    #[async_trait]
    impl BrokerPort for FakeBroker {
        async fn connect(&self, _endpoint: &BrokerEndpoint, _timeout: Duration) -> Result<(), BrokerError> {
            Ok(())
        }

        async fn disconnect(&self) {}

        fn is_connected(&self) -> bool {
            true
        }

        async fn positions(&self) -> Result<Vec<BrokerPosition>, BrokerError> {
            let mut state = self.state.lock();
            state.calls.push("positions".to_string());
            if state.fail_positions {
                return Err(BrokerError::NotConnected);
            }
            if state.position.is_zero() {
                return Ok(vec![]);
            }
            Ok(vec![BrokerPosition {
                contract_id: CONTRACT,
                quantity: state.position,
            }])
        }

        async fn qualify(&self, _spec: &InstrumentSpec) -> Result<Option<Instrument>, BrokerError> {
            Ok(Some(es()))
        }

        async fn place_order(
            &self,
            instrument: &Instrument,
            request: &OrderRequest,
        ) -> Result<OrderAck, BrokerError> {
            let mut state = self.state.lock();
            state.next_id += 1;
            let id = state.next_id;
            state.calls.push(format!("place {id} {request}"));
            state.orders.insert(
                id,
                OrderSnapshot {
                    order_id: OrderId::new(id),
                    contract_id: instrument.contract_id(),
                    status: OrderStatus::Submitted,
                    side: request.side,
                    quantity: request.quantity,
                    filled: Decimal::ZERO,
                },
            );
            let live = state.live_count();
            state.max_live = state.max_live.max(live);
            Ok(OrderAck {
                order_id: OrderId::new(id),
                status: OrderStatus::Submitted,
            })
        }

        async fn cancel_order(&self, order_id: OrderId) -> Result<(), BrokerError> {
            let mut state = self.state.lock();
            state.calls.push(format!("cancel {order_id}"));
            if state.fail_cancel {
                return Err(BrokerError::NotConnected);
            }
            let order = state
                .orders
                .get_mut(&order_id.value())
                .ok_or(BrokerError::OrderNotFound { order_id })?;
            if !order.status.is_live() {
                return Err(BrokerError::OrderRejected {
                    reason: "order not cancellable".to_string(),
                });
            }
            order.status = OrderStatus::Cancelled;
            Ok(())
        }

        async fn order_status(&self, order_id: OrderId) -> Result<OrderSnapshot, BrokerError> {
            let mut state = self.state.lock();
            state.calls.push(format!("status {order_id}"));
            state
                .orders
                .get(&order_id.value())
                .cloned()
                .ok_or(BrokerError::OrderNotFound { order_id })
        }

        fn subscribe(&self) -> broadcast::Receiver<BrokerEvent> {
            self.events.subscribe()
        }

        async fn historical_bars(&self, _request: &ProbeRequest) -> Result<Vec<Bar>, BrokerError> {
            Ok(vec![])
        }
    }

    fn es() -> Instrument {
        Instrument::new(
            CONTRACT,
            InstrumentSpec::new("ES", SecurityType::ContinuousFuture),
        )
    }

    fn adaptive() -> Routing {
        Routing::Adaptive {
            priority: AdaptivePriority::Urgent,
        }
    }

    fn reconciler(broker: &Arc<FakeBroker>, multiplier: Decimal) -> OrderReconciler {
        let broker: Arc<dyn BrokerPort> = broker.clone();
        OrderReconciler::new(es(), broker, ReconcilerConfig::new(multiplier, adaptive()))
    }

    fn is_order_call(call: &str) -> bool {
        call.starts_with("place") || call.starts_with("cancel")
    }

    #[tokio::test]
    async fn no_target_means_no_broker_calls() {
        // A mock with no expectations panics on any call.
        let broker: Arc<dyn BrokerPort> = Arc::new(MockBrokerPort::new());
        let mut rec = OrderReconciler::new(es(), broker, ReconcilerConfig::new(dec!(1), adaptive()));

        assert_eq!(rec.reconcile().await.unwrap(), ReconcileOutcome::AwaitingTarget);
    }

    #[tokio::test]
    async fn places_buy_for_full_delta_from_flat() {
        let broker = FakeBroker::new();
        let mut rec = reconciler(&broker, dec!(1));
        rec.set_target(dec!(10));

        let outcome = rec.reconcile().await.unwrap();

        assert_eq!(
            outcome,
            ReconcileOutcome::Placed {
                order_id: OrderId::new(1),
                side: OrderSide::Buy,
                quantity: dec!(10),
            }
        );
        assert_eq!(
            rec.working_order(),
            Some(&WorkingOrder {
                order_id: OrderId::new(1),
                side: OrderSide::Buy,
                quantity: dec!(10),
            })
        );
        assert_eq!(broker.live_count(), 1);
        assert_eq!(
            broker.calls(),
            vec!["positions", "place 1 BUY 10 MKT/Adaptive(Urgent)"]
        );
    }

    #[tokio::test]
    async fn at_target_is_idempotent() {
        let broker = FakeBroker::new();
        broker.set_position(dec!(10));
        let mut rec = reconciler(&broker, dec!(1));
        rec.set_target(dec!(10));

        let first = rec.reconcile().await.unwrap();
        let second = rec.reconcile().await.unwrap();

        assert_eq!(first, ReconcileOutcome::NoChange { actual: dec!(10) });
        assert_eq!(second, first);
        assert!(rec.working_order().is_none());
        assert!(!broker.calls().iter().any(|c| is_order_call(c)));
    }

    #[tokio::test]
    async fn repeated_target_keeps_unfilled_order() {
        let broker = FakeBroker::new();
        let mut rec = reconciler(&broker, dec!(1));
        rec.set_target(dec!(10));
        rec.reconcile().await.unwrap();

        assert!(!rec.set_target(dec!(10)));
        let outcome = rec.reconcile().await.unwrap();

        assert_eq!(
            outcome,
            ReconcileOutcome::Holding {
                order_id: OrderId::new(1),
                remaining: dec!(10),
            }
        );
        let order_calls: Vec<_> = broker.calls().into_iter().filter(|c| is_order_call(c)).collect();
        assert_eq!(order_calls, vec!["place 1 BUY 10 MKT/Adaptive(Urgent)"]);
    }

    #[tokio::test]
    async fn side_flip_cancels_before_placing() {
        let broker = FakeBroker::new();
        let mut rec = reconciler(&broker, dec!(1));
        rec.set_target(dec!(5));
        rec.reconcile().await.unwrap();

        rec.set_target(dec!(-3));
        let outcome = rec.reconcile().await.unwrap();

        assert_eq!(
            outcome,
            ReconcileOutcome::Replaced {
                cancelled: OrderId::new(1),
                order_id: OrderId::new(2),
                side: OrderSide::Sell,
                quantity: dec!(3),
            }
        );
        let order_calls: Vec<_> = broker.calls().into_iter().filter(|c| is_order_call(c)).collect();
        assert_eq!(
            order_calls,
            vec![
                "place 1 BUY 5 MKT/Adaptive(Urgent)",
                "cancel 1",
                "place 2 SELL 3 MKT/Adaptive(Urgent)",
            ]
        );
        assert_eq!(broker.max_live(), 1);
    }

    #[tokio::test]
    async fn side_flip_call_order_with_mock() {
        let mut broker = MockBrokerPort::new();
        let mut seq = Sequence::new();

        broker
            .expect_positions()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|| Ok(vec![]));
        broker
            .expect_order_status()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|id| {
                Ok(OrderSnapshot {
                    order_id: id,
                    contract_id: CONTRACT,
                    status: OrderStatus::Submitted,
                    side: OrderSide::Buy,
                    quantity: dec!(5),
                    filled: Decimal::ZERO,
                })
            });
        broker
            .expect_cancel_order()
            .withf(|id| *id == OrderId::new(41))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));
        broker
            .expect_place_order()
            .withf(|_, req| req.side == OrderSide::Sell && req.quantity == dec!(3))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| {
                Ok(OrderAck {
                    order_id: OrderId::new(42),
                    status: OrderStatus::Submitted,
                })
            });

        let broker: Arc<dyn BrokerPort> = Arc::new(broker);
        let mut rec = OrderReconciler::new(es(), broker, ReconcilerConfig::new(dec!(1), adaptive()));
        rec.working = Some(WorkingOrder {
            order_id: OrderId::new(41),
            side: OrderSide::Buy,
            quantity: dec!(5),
        });
        rec.set_target(dec!(-3));

        let outcome = rec.reconcile().await.unwrap();
        assert!(matches!(outcome, ReconcileOutcome::Replaced { .. }));
    }

    #[tokio::test]
    async fn filled_order_is_cleared_and_position_requeried() {
        let broker = FakeBroker::new();
        let mut rec = reconciler(&broker, dec!(1));
        rec.set_target(dec!(10));
        rec.reconcile().await.unwrap();

        broker.fill(OrderId::new(1), dec!(10));
        let outcome = rec.reconcile().await.unwrap();

        assert_eq!(outcome, ReconcileOutcome::NoChange { actual: dec!(10) });
        assert!(rec.working_order().is_none());
    }

    #[tokio::test]
    async fn externally_cancelled_order_is_replaced_from_fresh_position() {
        let broker = FakeBroker::new();
        let mut rec = reconciler(&broker, dec!(1));
        rec.set_target(dec!(10));
        rec.reconcile().await.unwrap();

        broker.fill(OrderId::new(1), dec!(4));
        broker.set_status(OrderId::new(1), OrderStatus::Cancelled);
        let outcome = rec.reconcile().await.unwrap();

        assert_eq!(
            outcome,
            ReconcileOutcome::Placed {
                order_id: OrderId::new(2),
                side: OrderSide::Buy,
                quantity: dec!(6),
            }
        );
    }

    #[tokio::test]
    async fn partial_fill_matching_remaining_is_held() {
        let broker = FakeBroker::new();
        let mut rec = reconciler(&broker, dec!(1));
        rec.set_target(dec!(10));
        rec.reconcile().await.unwrap();
        broker.fill(OrderId::new(1), dec!(4));

        let outcome = rec.reconcile().await.unwrap();
        assert_eq!(
            outcome,
            ReconcileOutcome::Holding {
                order_id: OrderId::new(1),
                remaining: dec!(6),
            }
        );

        rec.set_target(dec!(12));
        let outcome = rec.reconcile().await.unwrap();
        assert_eq!(
            outcome,
            ReconcileOutcome::Replaced {
                cancelled: OrderId::new(1),
                order_id: OrderId::new(2),
                side: OrderSide::Buy,
                quantity: dec!(8),
            }
        );
    }

    #[tokio::test]
    async fn zero_delta_leaves_live_order_untouched() {
        let broker = FakeBroker::new();
        let mut rec = reconciler(&broker, dec!(1));
        rec.set_target(dec!(10));
        rec.reconcile().await.unwrap();

        rec.set_target(Decimal::ZERO);
        let outcome = rec.reconcile().await.unwrap();

        assert_eq!(outcome, ReconcileOutcome::NoChange { actual: Decimal::ZERO });
        assert_eq!(rec.working_order().map(|w| w.order_id), Some(OrderId::new(1)));
        assert_eq!(broker.live_count(), 1);
        assert!(!broker.calls().iter().any(|c| c.starts_with("cancel")));
    }

    #[tokio::test]
    async fn out_of_range_delta_fails_the_pass_only() {
        let broker = FakeBroker::new();
        let mut rec = reconciler(&broker, dec!(2));
        let huge = Decimal::from_scientific("5e28").unwrap();
        rec.set_target(huge);

        let result = rec.reconcile().await;
        assert_eq!(
            result,
            Err(ReconcileError::Overflow {
                target: huge,
                multiplier: dec!(2),
                actual: Decimal::ZERO,
            })
        );
        assert!(!result.unwrap_err().is_connection_error());
        assert!(rec.run_pass().await.is_none());
        assert!(!broker.calls().iter().any(|c| is_order_call(c)));

        rec.set_target(dec!(3));
        let outcome = rec.run_pass().await;
        assert_eq!(
            outcome,
            Some(ReconcileOutcome::Placed {
                order_id: OrderId::new(1),
                side: OrderSide::Buy,
                quantity: dec!(6),
            })
        );
    }

    #[tokio::test]
    async fn multiplier_scales_target() {
        let broker = FakeBroker::new();
        broker.set_position(dec!(1));
        let mut rec = reconciler(&broker, dec!(2.5));
        rec.set_target(dec!(-2));

        let outcome = rec.reconcile().await.unwrap();

        assert_eq!(
            outcome,
            ReconcileOutcome::Placed {
                order_id: OrderId::new(1),
                side: OrderSide::Sell,
                quantity: dec!(6),
            }
        );
    }

    #[tokio::test]
    async fn position_query_failure_aborts_without_side_effects() {
        let broker = FakeBroker::new();
        let mut rec = reconciler(&broker, dec!(1));
        rec.set_target(dec!(10));
        rec.reconcile().await.unwrap();

        broker.state.lock().fail_positions = true;
        rec.set_target(dec!(-10));
        let result = rec.reconcile().await;

        assert_eq!(
            result,
            Err(ReconcileError::PositionQuery(BrokerError::NotConnected))
        );
        assert!(result.unwrap_err().is_connection_error());
        assert_eq!(rec.working_order().map(|w| w.order_id), Some(OrderId::new(1)));
        assert!(rec.run_pass().await.is_none());
    }

    #[tokio::test]
    async fn failed_cancel_keeps_reference_until_order_dies() {
        let broker = FakeBroker::new();
        let mut rec = reconciler(&broker, dec!(1));
        rec.set_target(dec!(10));
        rec.reconcile().await.unwrap();

        broker.state.lock().fail_cancel = true;
        rec.set_target(dec!(-5));
        let result = rec.reconcile().await;
        assert!(matches!(result, Err(ReconcileError::Cancel { .. })));
        assert_eq!(rec.working_order().map(|w| w.order_id), Some(OrderId::new(1)));
        assert_eq!(broker.live_count(), 1);

        broker.state.lock().fail_cancel = false;
        broker.set_status(OrderId::new(1), OrderStatus::Cancelled);
        let outcome = rec.reconcile().await.unwrap();
        assert_eq!(
            outcome,
            ReconcileOutcome::Placed {
                order_id: OrderId::new(2),
                side: OrderSide::Sell,
                quantity: dec!(5),
            }
        );
        assert_eq!(broker.max_live(), 1);
    }

    #[tokio::test]
    async fn pending_cancel_defers_pass() {
        let broker = FakeBroker::new();
        let mut rec = reconciler(&broker, dec!(1));
        rec.set_target(dec!(10));
        rec.reconcile().await.unwrap();
        broker.set_status(OrderId::new(1), OrderStatus::PendingCancel);

        rec.set_target(dec!(3));
        let result = rec.reconcile().await;

        assert_eq!(
            result,
            Err(ReconcileError::CancelPending {
                order_id: OrderId::new(1)
            })
        );
        assert_eq!(broker.live_count(), 1);
    }

    #[tokio::test]
    async fn unknown_order_is_dropped() {
        let broker = FakeBroker::new();
        let mut rec = reconciler(&broker, dec!(1));
        rec.working = Some(WorkingOrder {
            order_id: OrderId::new(99),
            side: OrderSide::Buy,
            quantity: dec!(1),
        });
        rec.set_target(Decimal::ZERO);

        let outcome = rec.reconcile().await.unwrap();

        assert_eq!(outcome, ReconcileOutcome::NoChange { actual: Decimal::ZERO });
        assert!(rec.working_order().is_none());
    }

    #[tokio::test]
    async fn cancelled_order_still_tracked_is_an_invariant_violation() {
        let broker = FakeBroker::new();
        let mut rec = reconciler(&broker, dec!(1));
        rec.working = Some(WorkingOrder {
            order_id: OrderId::new(7),
            side: OrderSide::Buy,
            quantity: dec!(1),
        });
        rec.last_cancelled = Some(OrderId::new(7));
        rec.set_target(dec!(1));

        let result = rec.reconcile().await;
        assert!(matches!(result, Err(ReconcileError::Invariant(_))));
        assert!(broker.calls().is_empty());
    }

    #[derive(Debug, Clone)]
    enum Step {
        Target(i64),
        Fill(u8),
        ExternalCancel,
    }

    fn step() -> impl Strategy<Value = Step> {
        prop_oneof![
            (-20i64..=20).prop_map(Step::Target),
            (1u8..=100).prop_map(Step::Fill),
            Just(Step::ExternalCancel),
        ]
    }

    proptest! {
        #[test]
        fn never_more_than_one_live_order(steps in prop::collection::vec(step(), 1..40)) {
            tokio_test::block_on(async {
                let broker = FakeBroker::new();
                let mut rec = reconciler(&broker, dec!(1));

                for step in steps {
                    match step {
                        Step::Target(t) => {
                            rec.set_target(Decimal::from(t));
                        }
                        Step::Fill(pct) => {
                            if let Some(w) = rec.working_order() {
                                let qty = (w.quantity * Decimal::from(pct) / dec!(100)).round();
                                broker.fill(w.order_id, qty);
                            }
                        }
                        Step::ExternalCancel => {
                            if let Some(w) = rec.working_order() {
                                let id = w.order_id;
                                let live = broker.state.lock().orders[&id.value()].status.is_live();
                                if live {
                                    broker.set_status(id, OrderStatus::Cancelled);
                                }
                            }
                        }
                    }
                    rec.reconcile().await.unwrap();
                    prop_assert!(broker.live_count() <= 1);
                }

                prop_assert!(broker.max_live() <= 1);

                // A non-zero gap is always covered exactly by the working order.
                if let Some(target) = rec.target() {
                    let position = broker.state.lock().position;
                    if position != target {
                        let Some(w) = rec.working_order() else {
                            return Err(TestCaseError::fail("gap left without a working order"));
                        };
                        let pending = broker.state.lock().orders[&w.order_id.value()].remaining();
                        prop_assert_eq!(position + w.side.signed(pending), target);
                    }
                }
                Ok(())
            })?;
        }
    }
}
