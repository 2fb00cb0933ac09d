//! Configuration Module
//!
//! Loads the YAML configuration with `${VAR}` / `${VAR:-default}`
//! environment interpolation and validates it before anything connects.
//!
//! # Usage
//!
//! ```rust,ignore
//! use position_sync::infrastructure::config::{load_settings, resolve_config_path};
//!
//! let path = resolve_config_path(std::env::args().nth(1));
//! let settings = load_settings(&path)?;
//! ```

mod settings;

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use thiserror::Error;

pub use settings::{
    AccountSettings, InstrumentSettings, PaperSettings, ReconcilerSettings, RoutingSetting,
    Settings, SourceSettings, SupervisorSettings,
};

/// Config file used when neither an argument nor the environment names one.
pub const DEFAULT_CONFIG_PATH: &str = "position-sync.yaml";

/// Environment variable naming the config file.
pub const CONFIG_PATH_ENV: &str = "POSITION_SYNC_CONFIG";

/// Environment variable overriding `metrics_port`.
pub const METRICS_PORT_ENV: &str = "POSITION_SYNC_METRICS_PORT";

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read configuration file.
    #[error("Failed to read config file '{path}': {source}")]
    ReadError {
        /// Path to the config file.
        path: String,
        /// The underlying IO error.
        source: std::io::Error,
    },

    /// Failed to parse YAML configuration.
    #[error("Failed to parse config YAML: {0}")]
    ParseError(#[from] serde_yaml_bw::Error),

    /// Configuration validation failed.
    #[error("Config validation failed: {0}")]
    ValidationError(String),
}

// ============================================
// Configuration Loading
// ============================================

/// Pick the config file: explicit argument, then `POSITION_SYNC_CONFIG`,
/// then `position-sync.yaml`.
#[must_use]
pub fn resolve_config_path(arg: Option<String>) -> PathBuf {
    arg.or_else(|| std::env::var(CONFIG_PATH_ENV).ok().filter(|p| !p.is_empty()))
        .map_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH), PathBuf::from)
}

/// Load and validate settings from a YAML file.
///
/// # Errors
///
/// Returns a `ConfigError` if the file cannot be read, parsed, or validated.
pub fn load_settings(path: &Path) -> Result<Settings, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
        path: path.display().to_string(),
        source: e,
    })?;

    load_settings_from_str(&contents)
}

/// Load and validate settings from a YAML string.
///
/// # Errors
///
/// Returns a `ConfigError` if the YAML cannot be parsed or validated.
pub fn load_settings_from_str(yaml: &str) -> Result<Settings, ConfigError> {
    let interpolated = interpolate_env_vars(yaml);
    let mut settings: Settings = serde_yaml_bw::from_str(&interpolated)?;
    apply_env_overrides(&mut settings)?;
    validate(&settings)?;
    Ok(settings)
}

fn apply_env_overrides(settings: &mut Settings) -> Result<(), ConfigError> {
    if let Ok(port) = std::env::var(METRICS_PORT_ENV)
        && !port.is_empty()
    {
        settings.metrics_port = port.parse().map_err(|_| {
            ConfigError::ValidationError(format!("{METRICS_PORT_ENV} is not a port: {port}"))
        })?;
    }
    Ok(())
}

/// Interpolate environment variables in a string.
///
/// Supports both `${VAR}` and `${VAR:-default}` syntax. Unset or empty
/// variables without a default become empty.
#[allow(clippy::expect_used)] // Regex is compile-time constant
fn interpolate_env_vars(input: &str) -> String {
    use std::sync::OnceLock;

    static ENV_VAR_REGEX: OnceLock<regex::Regex> = OnceLock::new();

    let re = ENV_VAR_REGEX.get_or_init(|| {
        regex::Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)(?::-([^}]*))?\}")
            .expect("env var regex is valid")
    });

    re.replace_all(input, |caps: &regex::Captures<'_>| {
        let default = caps.get(2).map_or("", |m| m.as_str());
        match std::env::var(&caps[1]) {
            Ok(v) if !v.is_empty() => v,
            _ => default.to_string(),
        }
    })
    .into_owned()
}

// ============================================
// Validation
// ============================================

fn validate(settings: &Settings) -> Result<(), ConfigError> {
    if settings.accounts.is_empty() {
        return Err(invalid("at least one account is required"));
    }

    let mut names = HashSet::new();
    let mut sessions = HashSet::new();

    for account in &settings.accounts {
        if account.name.trim().is_empty() {
            return Err(invalid("account name must not be empty"));
        }
        if !names.insert(account.name.as_str()) {
            return Err(invalid(format!("duplicate account name '{}'", account.name)));
        }

        let broker = &account.broker;
        if !sessions.insert((broker.host.as_str(), broker.port, broker.client_id)) {
            return Err(invalid(format!(
                "account '{}': client_id {} already used for {}:{}",
                account.name, broker.client_id, broker.host, broker.port
            )));
        }

        if account.instruments.is_empty() {
            return Err(invalid(format!("account '{}' has no instruments", account.name)));
        }

        let mut ports = HashSet::new();
        for instrument in &account.instruments {
            let label = instrument.instrument.label();
            if instrument.port == 0 {
                return Err(invalid(format!(
                    "account '{}', {label}: port must be non-zero",
                    account.name
                )));
            }
            if !ports.insert(instrument.port) {
                return Err(invalid(format!(
                    "account '{}': port {} used twice",
                    account.name, instrument.port
                )));
            }
            if instrument.multiplier.is_zero() {
                return Err(invalid(format!(
                    "account '{}', {label}: multiplier must be non-zero",
                    account.name
                )));
            }
            if instrument.instrument.symbol.trim().is_empty() {
                return Err(invalid(format!(
                    "account '{}': instrument symbol must not be empty",
                    account.name
                )));
            }
        }
    }

    let timeouts = [
        ("supervisor.idle_timeout_secs", settings.supervisor.idle_timeout_secs),
        ("supervisor.probe_timeout_secs", settings.supervisor.probe_timeout_secs),
        ("supervisor.connect_timeout_secs", settings.supervisor.connect_timeout_secs),
        ("source.read_timeout_secs", settings.source.read_timeout_secs),
        ("source.connect_timeout_secs", settings.source.connect_timeout_secs),
        ("reconciler.request_timeout_secs", settings.reconciler.request_timeout_secs),
    ];
    if let Some((name, _)) = timeouts.iter().find(|(_, secs)| *secs == 0) {
        return Err(invalid(format!("{name} must be positive")));
    }

    Ok(())
}

fn invalid(message: impl Into<String>) -> ConfigError {
    ConfigError::ValidationError(message.into())
}
