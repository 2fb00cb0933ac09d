//! Configuration Settings
//!
//! Types deserialized from the YAML configuration file, plus conversions
//! into the runtime configuration of each component.

use std::collections::HashSet;
use std::time::Duration;

use rust_decimal::Decimal;
use serde::Deserialize;

use crate::application::ports::BrokerEndpoint;
use crate::application::services::ReconcilerConfig;
use crate::domain::instrument::InstrumentSpec;
use crate::domain::order::{AdaptivePriority, Routing};
use crate::infrastructure::paper::{PaperBrokerConfig, PaperContract};
use crate::infrastructure::reconnect::BackoffConfig;
use crate::infrastructure::source::{DEFAULT_MAX_LINE_LENGTH, PositionSourceConfig};
use crate::infrastructure::supervisor::{DEFAULT_DISCONNECT_ERROR_CODES, SupervisorConfig};

/// Root configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    /// Brokerage accounts, each with its own connection.
    pub accounts: Vec<AccountSettings>,
    /// Connection supervision.
    #[serde(default)]
    pub supervisor: SupervisorSettings,
    /// Position source clients.
    #[serde(default)]
    pub source: SourceSettings,
    /// Order reconcilers.
    #[serde(default)]
    pub reconciler: ReconcilerSettings,
    /// Paper brokerage.
    #[serde(default)]
    pub paper: PaperSettings,
    /// Prometheus listener port (0 disables).
    #[serde(default)]
    pub metrics_port: u16,
}

/// One brokerage account.
#[derive(Debug, Clone, Deserialize)]
pub struct AccountSettings {
    /// Name used in logs.
    pub name: String,
    /// Brokerage connection.
    pub broker: BrokerEndpoint,
    /// Host serving this account's position sources.
    #[serde(default = "default_source_host")]
    pub source_host: String,
    /// Mirrored instruments.
    pub instruments: Vec<InstrumentSettings>,
}

/// One mirrored instrument.
#[derive(Debug, Clone, Deserialize)]
pub struct InstrumentSettings {
    /// Contract specification to qualify.
    pub instrument: InstrumentSpec,
    /// External units → broker units.
    #[serde(default = "default_multiplier")]
    pub multiplier: Decimal,
    /// Position source port.
    pub port: u16,
    /// Order routing; defaults by security type.
    #[serde(default)]
    pub routing: Option<RoutingSetting>,
    /// Adaptive algo priority.
    #[serde(default)]
    pub priority: AdaptivePriority,
}

/// Routing choice in configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutingSetting {
    /// Plain market order.
    Market,
    /// Market order through the Adaptive algo.
    Adaptive,
}

impl InstrumentSettings {
    /// Effective routing.
    #[must_use]
    pub const fn routing(&self) -> Routing {
        match self.routing {
            Some(RoutingSetting::Market) => Routing::Market,
            Some(RoutingSetting::Adaptive) => Routing::Adaptive {
                priority: self.priority,
            },
            None => match Routing::default_for(self.instrument.security_type) {
                Routing::Adaptive { .. } => Routing::Adaptive {
                    priority: self.priority,
                },
                Routing::Market => Routing::Market,
            },
        }
    }
}

/// Connection supervision.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SupervisorSettings {
    /// Quiet period before a probe.
    pub idle_timeout_secs: u64,
    /// Probe limit.
    pub probe_timeout_secs: u64,
    /// Connect limit.
    pub connect_timeout_secs: u64,
    /// Pause after connecting.
    pub settle_delay_ms: u64,
    /// Codes that mean the session is gone.
    pub disconnect_error_codes: Vec<i32>,
    /// First reconnect delay.
    pub reconnect_initial_ms: u64,
    /// Reconnect delay cap.
    pub reconnect_max_secs: u64,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            idle_timeout_secs: 30,
            probe_timeout_secs: 4,
            connect_timeout_secs: 4,
            settle_delay_ms: 250,
            disconnect_error_codes: DEFAULT_DISCONNECT_ERROR_CODES.to_vec(),
            reconnect_initial_ms: 1000,
            reconnect_max_secs: 30,
        }
    }
}

impl SupervisorSettings {
    /// Supervisor configuration for `endpoint`.
    #[must_use]
    pub fn to_config(&self, endpoint: BrokerEndpoint) -> SupervisorConfig {
        SupervisorConfig {
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
            idle_timeout: Duration::from_secs(self.idle_timeout_secs),
            probe_timeout: Duration::from_secs(self.probe_timeout_secs),
            settle_delay: Duration::from_millis(self.settle_delay_ms),
            disconnect_error_codes: self.disconnect_error_codes.iter().copied().collect::<HashSet<_>>(),
            backoff: self.backoff(),
            ..SupervisorConfig::new(endpoint)
        }
    }

    /// Reconnect schedule.
    #[must_use]
    pub fn backoff(&self) -> BackoffConfig {
        BackoffConfig {
            initial_delay: Duration::from_millis(self.reconnect_initial_ms),
            max_delay: Duration::from_secs(self.reconnect_max_secs),
            ..BackoffConfig::default()
        }
    }
}

/// Position source clients.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SourceSettings {
    /// Longest silence tolerated.
    pub read_timeout_secs: u64,
    /// Pause before reconnecting.
    pub reconnect_delay_secs: u64,
    /// Connect limit.
    pub connect_timeout_secs: u64,
    /// Longest accepted line.
    pub max_line_length: usize,
}

impl Default for SourceSettings {
    fn default() -> Self {
        Self {
            read_timeout_secs: 5,
            reconnect_delay_secs: 5,
            connect_timeout_secs: 5,
            max_line_length: DEFAULT_MAX_LINE_LENGTH,
        }
    }
}

impl SourceSettings {
    /// Client configuration for `host:port`.
    #[must_use]
    pub fn to_config(&self, host: &str, port: u16) -> PositionSourceConfig {
        PositionSourceConfig {
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
            read_timeout: Duration::from_secs(self.read_timeout_secs),
            reconnect_delay: Duration::from_secs(self.reconnect_delay_secs),
            max_line_length: self.max_line_length,
            ..PositionSourceConfig::new(host, port)
        }
    }
}

/// Order reconcilers.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReconcilerSettings {
    /// Limit for each broker request.
    pub request_timeout_secs: u64,
}

impl Default for ReconcilerSettings {
    fn default() -> Self {
        Self {
            request_timeout_secs: 10,
        }
    }
}

impl ReconcilerSettings {
    /// Reconciler configuration for one instrument.
    #[must_use]
    pub fn to_config(&self, instrument: &InstrumentSettings) -> ReconcilerConfig {
        ReconcilerConfig::new(instrument.multiplier, instrument.routing())
            .with_request_timeout(Duration::from_secs(self.request_timeout_secs))
    }
}

/// Paper brokerage.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PaperSettings {
    /// Fill delay; `null` leaves orders working.
    pub fill_delay_ms: Option<u64>,
    /// Catalog; configured instruments missing from it are added.
    pub contracts: Vec<PaperContract>,
}

impl Default for PaperSettings {
    fn default() -> Self {
        Self {
            fill_delay_ms: Some(500),
            contracts: Vec::new(),
        }
    }
}

impl PaperSettings {
    /// Paper broker configuration.
    #[must_use]
    pub fn to_config(&self) -> PaperBrokerConfig {
        PaperBrokerConfig {
            fill_delay: self.fill_delay_ms.map(Duration::from_millis),
            contracts: self.contracts.clone(),
        }
    }
}

fn default_source_host() -> String {
    "127.0.0.1".to_string()
}

const fn default_multiplier() -> Decimal {
    Decimal::ONE
}
