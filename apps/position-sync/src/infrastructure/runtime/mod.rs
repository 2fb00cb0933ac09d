//! Account Runtime
//!
//! Starts everything for one brokerage account: the initial connection,
//! qualification of each configured instrument, one source client and
//! reconciler per instrument that qualified, and a single connection
//! supervisor once at least one instrument is running.
//!
//! ```text
//!              ┌───────────── AccountRuntime ─────────────┐
//! source :5001 ─► PositionSourceClient ─► OrderReconciler ─┐
//! source :5002 ─► PositionSourceClient ─► OrderReconciler ─┼─► Arc<dyn BrokerPort>
//!                                    ConnectionSupervisor ─┘
//! ```

mod instance;

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::Instrument as _;

use crate::application::ports::{BrokerPort, bounded};
use crate::application::services::OrderReconciler;
use crate::domain::instrument::Instrument;
use crate::infrastructure::config::{
    AccountSettings, InstrumentSettings, ReconcilerSettings, Settings, SourceSettings,
};
use crate::infrastructure::reconnect::Backoff;
use crate::infrastructure::source::{PositionSourceClient, PositionSourceConfig};
use crate::infrastructure::supervisor::{ConnectionSupervisor, SupervisorConfig};

pub use instance::{ReconcilerSink, log_order_updates};

/// Instruments started and skipped by one account.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AccountSummary {
    /// Labels of instruments whose loops ran.
    pub started: Vec<String>,
    /// Labels of instruments that failed qualification.
    pub skipped: Vec<String>,
}

/// Runtime for one brokerage account.
pub struct AccountRuntime {
    name: String,
    broker: Arc<dyn BrokerPort>,
    account: AccountSettings,
    supervisor: SupervisorConfig,
    source: SourceSettings,
    reconciler: ReconcilerSettings,
    qualify_timeout: Duration,
    cancel: CancellationToken,
}

impl AccountRuntime {
    /// Build the runtime for `account` on top of `broker`.
    #[must_use]
    pub fn new(
        account: AccountSettings,
        settings: &Settings,
        broker: Arc<dyn BrokerPort>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            name: account.name.clone(),
            supervisor: settings.supervisor.to_config(account.broker.clone()),
            source: settings.source.clone(),
            reconciler: settings.reconciler.clone(),
            qualify_timeout: Duration::from_secs(settings.reconciler.request_timeout_secs),
            broker,
            account,
            cancel,
        }
    }

    /// Account name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Run until cancelled.
    ///
    /// Returns once every task this account started has stopped.
    pub async fn run(self) -> AccountSummary {
        let mut summary = AccountSummary::default();

        if !self.connect_initial().await {
            return summary;
        }

        let mut tasks = JoinSet::new();
        for settings in &self.account.instruments {
            let label = settings.instrument.label();
            match self.qualify(settings).await {
                Some(instrument) => {
                    self.spawn_instance(&mut tasks, instrument, settings);
                    summary.started.push(label);
                }
                None => summary.skipped.push(label),
            }
        }

        if summary.started.is_empty() {
            tracing::error!(account = %self.name, "No instrument could be started");
        } else {
            let span = tracing::info_span!(
                "supervisor",
                account = %self.name,
                endpoint = %self.supervisor.endpoint
            );
            let supervisor = ConnectionSupervisor::new(
                Arc::clone(&self.broker),
                self.supervisor.clone(),
                self.cancel.child_token(),
            );
            tasks.spawn(supervisor.run().instrument(span));

            tracing::info!(
                account = %self.name,
                started = summary.started.len(),
                skipped = summary.skipped.len(),
                "Account running"
            );
        }

        while let Some(result) = tasks.join_next().await {
            if let Err(e) = result {
                tracing::error!(account = %self.name, error = %e, "Account task failed");
            }
        }

        summary
    }

    /// Connect before anything else, retrying until it works or shutdown.
    async fn connect_initial(&self) -> bool {
        let endpoint = &self.supervisor.endpoint;
        let limit = self.supervisor.connect_timeout;
        let mut backoff = Backoff::new(self.supervisor.backoff.clone());

        loop {
            let attempt = bounded("connect", limit, self.broker.connect(endpoint, limit));
            let result = tokio::select! {
                () = self.cancel.cancelled() => return false,
                result = attempt => result,
            };

            match result {
                Ok(()) => {
                    tracing::info!(account = %self.name, endpoint = %endpoint, "Broker connected");
                    return true;
                }
                Err(e) => {
                    self.broker.disconnect().await;
                    let delay = backoff.next_delay();
                    tracing::warn!(
                        account = %self.name,
                        endpoint = %endpoint,
                        error = %e,
                        retry_in = ?delay,
                        "Initial broker connection failed"
                    );
                    tokio::select! {
                        () = self.cancel.cancelled() => return false,
                        () = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    async fn qualify(&self, settings: &InstrumentSettings) -> Option<Instrument> {
        let spec = &settings.instrument;
        match bounded("qualify", self.qualify_timeout, self.broker.qualify(spec)).await {
            Ok(Some(instrument)) => {
                tracing::info!(
                    account = %self.name,
                    instrument = %instrument,
                    "Instrument qualified"
                );
                Some(instrument)
            }
            Ok(None) => {
                tracing::error!(
                    account = %self.name,
                    instrument = %spec.label(),
                    "Instrument not found, skipping"
                );
                None
            }
            Err(e) => {
                tracing::error!(
                    account = %self.name,
                    instrument = %spec.label(),
                    error = %e,
                    "Instrument qualification failed, skipping"
                );
                None
            }
        }
    }

    fn spawn_instance(
        &self,
        tasks: &mut JoinSet<()>,
        instrument: Instrument,
        settings: &InstrumentSettings,
    ) {
        let label = instrument.spec().label();
        let source: PositionSourceConfig =
            self.source.to_config(&self.account.source_host, settings.port);
        let span = tracing::info_span!(
            "instance",
            account = %self.name,
            instrument = %label,
            source = %source.address()
        );

        tasks.spawn(
            log_order_updates(
                self.broker.subscribe(),
                instrument.contract_id(),
                self.cancel.child_token(),
            )
            .instrument(span.clone()),
        );

        let reconciler = OrderReconciler::new(
            instrument,
            Arc::clone(&self.broker),
            self.reconciler.to_config(settings),
        );
        let client = PositionSourceClient::new(source, label, self.cancel.child_token());
        tasks.spawn(
            async move {
                let mut sink = ReconcilerSink::new(reconciler);
                client.run(&mut sink).await;
            }
            .instrument(span),
        );
    }
}

/// Run every account until `cancel` fires and all of them have stopped.
pub async fn run_accounts(accounts: Vec<AccountRuntime>) -> Vec<(String, AccountSummary)> {
    let mut set = JoinSet::new();
    for account in accounts {
        set.spawn(async move {
            let name = account.name().to_string();
            let summary = account.run().await;
            (name, summary)
        });
    }

    let mut summaries = Vec::new();
    while let Some(result) = set.join_next().await {
        match result {
            Ok(summary) => summaries.push(summary),
            Err(e) => tracing::error!(error = %e, "Account runtime failed"),
        }
    }
    summaries
}
