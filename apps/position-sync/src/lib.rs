#![cfg_attr(
    test,
    allow(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::float_cmp,
        clippy::significant_drop_tightening,
        clippy::too_many_lines,
        clippy::match_same_arms,
        clippy::needless_pass_by_value,
        clippy::needless_collect,
        clippy::option_if_let_else,
        clippy::default_trait_access,
        clippy::items_after_statements,
        clippy::or_fun_call
    )
)]

//! Position Sync - Target Position Mirroring
//!
//! Keeps the brokerage position of each configured instrument equal to a
//! target position streamed over TCP by an external signal source, while a
//! health supervisor guards the shared brokerage connection against silent
//! hangs.
//!
//! # Layers (inside → outside)
//!
//! - **Domain**: Instruments, orders, connection states
//!   - `instrument`: Contract specifications and qualified contracts
//!   - `order`: Sides, statuses, routing, the working order
//!   - `connection`: Supervisor states
//!
//! - **Application**: Use cases and port definitions
//!   - `ports`: The brokerage connection interface
//!   - `services`: Position query, order reconciler
//!
//! - **Infrastructure**: Adapters and process wiring
//!   - `source`: Target position stream client
//!   - `supervisor`: Connection health supervisor
//!   - `paper`: In-process paper brokerage
//!   - `runtime`: Per-account orchestration
//!   - `config`, `telemetry`, `metrics`: Ambient concerns
//!
//! # Data Flow
//!
//! ```text
//! signal source ──TCP/NDJSON──► PositionSourceClient ──► OrderReconciler ──┐
//!                                                                           ├──► broker
//!                                        ConnectionSupervisor ──probe───────┘
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]

// =============================================================================
// Module Declarations
// =============================================================================

/// Domain layer - Core types with no I/O.
pub mod domain;

/// Application layer - Use cases and port definitions.
pub mod application;

/// Infrastructure layer - Adapters and external integrations.
pub mod infrastructure;

// =============================================================================
// Re-exports
// =============================================================================

// Domain types
pub use domain::connection::ConnectionState;
pub use domain::instrument::{ContractId, Instrument, InstrumentSpec, SecurityType};
pub use domain::order::{OrderId, OrderSide, OrderStatus, Routing};

// Ports and services
pub use application::ports::{BrokerEndpoint, BrokerError, BrokerEvent, BrokerPort};
pub use application::services::{
    OrderReconciler, ReconcileError, ReconcileOutcome, ReconcilerConfig, query_position,
};

// Infrastructure
pub use infrastructure::config::{ConfigError, Settings, load_settings, resolve_config_path};
pub use infrastructure::metrics::init_metrics;
pub use infrastructure::paper::{PaperBroker, PaperBrokerConfig};
pub use infrastructure::runtime::{AccountRuntime, AccountSummary, run_accounts};
pub use infrastructure::source::{PositionSourceClient, PositionSourceConfig};
pub use infrastructure::supervisor::{ConnectionSupervisor, SupervisorConfig};

// Telemetry
pub use infrastructure::telemetry::{TelemetryConfig, TelemetryGuard, init as init_telemetry};
