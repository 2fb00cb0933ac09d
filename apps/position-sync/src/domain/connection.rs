//! Brokerage Connection State
//!
//! States of the connection health supervisor, published so that other
//! components (metrics, tests) can observe transitions without reaching
//! into the supervisor.

use std::fmt;

/// Health supervisor state for one brokerage connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ConnectionState {
    /// Issuing a fresh connect.
    #[default]
    Connecting,
    /// Connected; waiting for the idle timer or a broker notification.
    ConnectedIdle,
    /// Idle timer fired; a liveness probe is in flight.
    Probing,
    /// Tearing the connection down before connecting again.
    Reconnecting,
}

impl ConnectionState {
    /// State name for logs and metric labels.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Connecting => "connecting",
            Self::ConnectedIdle => "connected_idle",
            Self::Probing => "probing",
            Self::Reconnecting => "reconnecting",
        }
    }

    /// Numeric encoding for the state gauge.
    #[must_use]
    pub const fn as_gauge(&self) -> f64 {
        match self {
            Self::Connecting => 0.0,
            Self::ConnectedIdle => 1.0,
            Self::Probing => 2.0,
            Self::Reconnecting => 3.0,
        }
    }

    /// Whether requests can currently be expected to succeed.
    #[must_use]
    pub const fn is_connected(&self) -> bool {
        matches!(self, Self::ConnectedIdle | Self::Probing)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
