//! Application Layer - Use cases and port definitions.
//!
//! This layer contains the application services and port interfaces
//! that define how the domain interacts with the brokerage.

/// Port interfaces for external systems (brokerage connection).
pub mod ports;

/// Application services: position query and order reconciliation.
pub mod services;
