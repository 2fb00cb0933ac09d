//! Application Services
//!
//! Services that orchestrate domain logic over the broker port.
//!
//! - `position_query`: live position lookup for one instrument
//! - `reconciler`: target-vs-actual order reconciliation

pub mod position_query;
pub mod reconciler;

pub use position_query::query_position;
pub use reconciler::{OrderReconciler, ReconcileError, ReconcileOutcome, ReconcilerConfig};
