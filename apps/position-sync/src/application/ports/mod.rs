//! Port Interfaces
//!
//! Defines the interfaces (ports) for external systems following
//! the Hexagonal Architecture pattern. These are the contracts that
//! infrastructure adapters must implement.
//!
//! ## Driven Ports (Outbound)
//!
//! - `BrokerPort`: the shared brokerage connection (positions, orders,
//!   qualification, notifications, liveness probe)

mod broker_port;

pub use broker_port::{
    Bar, BrokerEndpoint, BrokerError, BrokerEvent, BrokerPort, BrokerPosition, ProbeRequest,
    bounded,
};

#[cfg(test)]
pub use broker_port::MockBrokerPort;
