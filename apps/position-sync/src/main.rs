//! Position Sync Binary
//!
//! Mirrors target positions into the paper brokerage for every configured
//! account.
//!
//! # Usage
//!
//! ```bash
//! cargo run -p position-sync -- position-sync.yaml
//! ```
//!
//! # Environment Variables
//!
//! - `POSITION_SYNC_CONFIG`: Config path when no argument is given
//!   (default: position-sync.yaml)
//! - `POSITION_SYNC_METRICS_PORT`: Prometheus port, 0 disables (default: 0)
//! - `OTEL_ENABLED`: Export spans over OTLP (default: false)
//! - `OTEL_EXPORTER_OTLP_ENDPOINT`: OTLP endpoint (default: <http://localhost:4317>)
//! - `OTEL_SERVICE_NAME`: Service name (default: position-sync)
//! - `RUST_LOG`: Log filter (default: position_sync=info)

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use position_sync::infrastructure::config::Settings;
use position_sync::infrastructure::telemetry;
use position_sync::{
    AccountRuntime, PaperBroker, init_metrics, load_settings, resolve_config_path, run_accounts,
};
use tokio::signal;
use tokio_util::sync::CancellationToken;

/// Time allowed for tasks to wind down after a shutdown signal.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    load_dotenv();

    let _telemetry_guard = telemetry::init();

    let path = resolve_config_path(std::env::args().nth(1));
    let settings = load_settings(&path)
        .with_context(|| format!("loading configuration from {}", path.display()))?;
    log_config(&path, &settings);

    if let Some(addr) = init_metrics(settings.metrics_port).context("starting metrics exporter")? {
        tracing::info!(addr = %addr, "Prometheus metrics listening");
    }

    let shutdown_token = CancellationToken::new();
    let accounts = build_accounts(&settings, &shutdown_token);

    tracing::info!(accounts = accounts.len(), "Position sync starting");
    let mut runtime = tokio::spawn(run_accounts(accounts));

    tokio::select! {
        () = await_shutdown(shutdown_token.clone()) => {
            match tokio::time::timeout(SHUTDOWN_TIMEOUT, &mut runtime).await {
                Ok(_) => tracing::info!("All accounts stopped"),
                Err(_) => {
                    tracing::warn!(timeout = ?SHUTDOWN_TIMEOUT, "Shutdown timed out, aborting tasks");
                    runtime.abort();
                }
            }
        }
        result = &mut runtime => {
            shutdown_token.cancel();
            let summaries = result.context("account runtime panicked")?;
            for (account, summary) in summaries {
                tracing::warn!(
                    account = %account,
                    started = summary.started.len(),
                    skipped = summary.skipped.len(),
                    "Account stopped"
                );
            }
        }
    }

    tracing::info!("Position sync stopped");
    Ok(())
}

/// One paper broker per account, with every configured instrument in its
/// catalog.
fn build_accounts(settings: &Settings, shutdown_token: &CancellationToken) -> Vec<AccountRuntime> {
    settings
        .accounts
        .iter()
        .map(|account| {
            let broker = PaperBroker::new(settings.paper.to_config());
            for instrument in &account.instruments {
                let contract_id = broker.register(&instrument.instrument);
                tracing::debug!(
                    account = %account.name,
                    instrument = %instrument.instrument.label(),
                    contract_id = %contract_id,
                    "Paper contract registered"
                );
            }
            AccountRuntime::new(
                account.clone(),
                settings,
                Arc::new(broker),
                shutdown_token.child_token(),
            )
        })
        .collect()
}

/// Log the parsed configuration.
fn log_config(path: &std::path::Path, settings: &Settings) {
    tracing::info!(
        path = %path.display(),
        accounts = settings.accounts.len(),
        metrics_port = settings.metrics_port,
        "Configuration loaded"
    );
    for account in &settings.accounts {
        tracing::info!(
            account = %account.name,
            broker = %account.broker,
            source_host = %account.source_host,
            instruments = account.instruments.len(),
            "Account configured"
        );
    }
}

/// Load .env file from current directory or any ancestor directory.
fn load_dotenv() {
    if dotenvy::dotenv().is_ok() {
        return;
    }

    if let Ok(cwd) = std::env::current_dir() {
        for dir in cwd.ancestors().skip(1) {
            let env_path = dir.join(".env");
            if env_path.exists() {
                let _ = dotenvy::from_path(&env_path);
                return;
            }
        }
    }
}

/// Wait for shutdown signal (SIGTERM or SIGINT), then cancel every task.
#[allow(clippy::expect_used)]
async fn await_shutdown(shutdown_token: CancellationToken) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("signal handler installation is critical for graceful shutdown");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("SIGTERM handler installation is critical for graceful shutdown")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, initiating shutdown");
        }
    }

    shutdown_token.cancel();
}
