//! Instance Wiring
//!
//! Glue between one position source client and one order reconciler.

use async_trait::async_trait;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::application::ports::BrokerEvent;
use crate::application::services::OrderReconciler;
use crate::domain::instrument::ContractId;
use crate::infrastructure::metrics;
use crate::infrastructure::source::{SourceRecord, TargetPositionSink};

/// Feeds source records into a reconciler.
///
/// A record with a `position` updates the target; every record then runs a
/// pass, so heartbeats re-check the broker between target changes.
pub struct ReconcilerSink {
    reconciler: OrderReconciler,
    label: String,
}

impl ReconcilerSink {
    /// Wrap a reconciler.
    #[must_use]
    pub fn new(reconciler: OrderReconciler) -> Self {
        let label = reconciler.instrument().spec().label();
        Self { reconciler, label }
    }

    /// The wrapped reconciler.
    #[must_use]
    pub const fn reconciler(&self) -> &OrderReconciler {
        &self.reconciler
    }
}

#[async_trait]
impl TargetPositionSink for ReconcilerSink {
    async fn on_record(&mut self, record: SourceRecord) {
        if let Some(position) = record.position
            && self.reconciler.set_target(position)
        {
            tracing::info!(position = %position, "Target position changed");
        }

        match self.reconciler.run_pass().await {
            Some(outcome) => metrics::record_reconcile(&self.label, &outcome),
            None => metrics::record_reconcile_error(&self.label),
        }
    }
}

/// Log status updates for orders on `contract_id` until cancelled.
pub async fn log_order_updates(
    mut events: broadcast::Receiver<BrokerEvent>,
    contract_id: ContractId,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            () = cancel.cancelled() => break,
            event = events.recv() => event,
        };

        match event {
            Ok(BrokerEvent::OrderStatus(snapshot)) if snapshot.contract_id == contract_id => {
                tracing::info!(
                    order_id = %snapshot.order_id,
                    status = %snapshot.status,
                    side = %snapshot.side,
                    quantity = %snapshot.quantity,
                    filled = %snapshot.filled,
                    "Order status"
                );
            }
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::debug!(skipped, "Order status log lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
