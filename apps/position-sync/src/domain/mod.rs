//! Domain Layer - Core position-sync types.
//!
//! Instruments, orders and connection states. Everything here is plain
//! data with no I/O; quantities are `rust_decimal::Decimal` in broker
//! units unless stated otherwise.

/// Brokerage connection supervisor states.
pub mod connection;

/// Contract specifications and qualified instruments.
pub mod instrument;

/// Order sides, statuses, routing and the working order.
pub mod order;
