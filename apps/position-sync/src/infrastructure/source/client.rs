//! Position Source Client
//!
//! Reads newline-delimited target position records from a TCP source and
//! hands each valid record to a [`TargetPositionSink`]. Any connection
//! problem (refused, reset, EOF, framing error, read timeout) ends the
//! session; the client waits a fixed delay and connects again, forever,
//! until cancelled.

use std::convert::Infallible;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::net::TcpStream;
use tokio_util::codec::{FramedRead, LinesCodec, LinesCodecError};
use tokio_util::sync::CancellationToken;

use super::codec::{SourceRecord, decode_record, excerpt};
use crate::infrastructure::metrics::{self, RecordKind};
use crate::infrastructure::reconnect::{Backoff, BackoffConfig};

/// Default maximum line length.
pub const DEFAULT_MAX_LINE_LENGTH: usize = 64 * 1024;

// =============================================================================
// Configuration
// =============================================================================

/// Position source connection settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PositionSourceConfig {
    /// Source host.
    pub host: String,
    /// Source port.
    pub port: u16,
    /// Limit for establishing the TCP connection.
    pub connect_timeout: Duration,
    /// Longest silence tolerated between two lines.
    pub read_timeout: Duration,
    /// Pause before reconnecting.
    pub reconnect_delay: Duration,
    /// Longest accepted line.
    pub max_line_length: usize,
}

impl PositionSourceConfig {
    /// Defaults for `host:port`.
    #[must_use]
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            connect_timeout: Duration::from_secs(5),
            read_timeout: Duration::from_secs(5),
            reconnect_delay: Duration::from_secs(5),
            max_line_length: DEFAULT_MAX_LINE_LENGTH,
        }
    }

    /// `host:port`.
    #[must_use]
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Why a source session ended.
#[derive(Debug, thiserror::Error)]
pub enum PositionSourceError {
    /// TCP connect failed.
    #[error("connect to {address} failed: {source}")]
    Connect {
        /// Source address.
        address: String,
        /// IO error.
        source: std::io::Error,
    },

    /// TCP connect did not complete in time.
    #[error("connect to {address} timed out after {timeout:?}")]
    ConnectTimeout {
        /// Source address.
        address: String,
        /// Limit that elapsed.
        timeout: Duration,
    },

    /// No line arrived within the read timeout.
    #[error("no data for {0:?}")]
    ReadTimeout(Duration),

    /// The source closed the connection.
    #[error("connection closed by source")]
    Closed,

    /// Line framing failed (IO error or oversized line).
    #[error("framing error: {0}")]
    Framing(#[from] LinesCodecError),
}

impl PositionSourceError {
    /// Short reason for metric labels.
    #[must_use]
    pub const fn reason(&self) -> &'static str {
        match self {
            Self::Connect { .. } => "connect",
            Self::ConnectTimeout { .. } => "connect_timeout",
            Self::ReadTimeout(_) => "read_timeout",
            Self::Closed => "closed",
            Self::Framing(_) => "framing",
        }
    }
}

// =============================================================================
// Sink
// =============================================================================

/// Consumer of decoded records.
///
/// Records are delivered one at a time; the client does not read the next
/// line until `on_record` returns.
#[async_trait]
pub trait TargetPositionSink: Send {
    /// Handle one record.
    async fn on_record(&mut self, record: SourceRecord);
}

// =============================================================================
// Client
// =============================================================================

/// Reconnecting reader for one position source.
pub struct PositionSourceClient {
    config: PositionSourceConfig,
    label: String,
    cancel: CancellationToken,
}

impl PositionSourceClient {
    /// Create a client. `label` names the instrument in metrics.
    #[must_use]
    pub fn new(config: PositionSourceConfig, label: impl Into<String>, cancel: CancellationToken) -> Self {
        Self {
            config,
            label: label.into(),
            cancel,
        }
    }

    /// Read records into `sink` until cancelled.
    pub async fn run<S: TargetPositionSink>(&self, sink: &mut S) {
        let mut backoff = Backoff::new(BackoffConfig::fixed(self.config.reconnect_delay));

        loop {
            let result = tokio::select! {
                () = self.cancel.cancelled() => break,
                result = self.session(sink) => result,
            };

            let Err(e) = result;
            match &e {
                PositionSourceError::ReadTimeout(_) => {
                    tracing::info!(address = %self.config.address(), error = %e, "Position source idle, reconnecting");
                }
                _ => {
                    tracing::warn!(address = %self.config.address(), error = %e, "Position source connection lost");
                }
            }
            metrics::record_source_reconnect(&self.label, e.reason());

            tokio::select! {
                () = self.cancel.cancelled() => break,
                () = tokio::time::sleep(backoff.next_delay()) => {}
            }
        }

        tracing::debug!(address = %self.config.address(), "Position source client stopped");
    }

    async fn session<S: TargetPositionSink>(&self, sink: &mut S) -> Result<Infallible, PositionSourceError> {
        let address = self.config.address();
        let stream = tokio::time::timeout(self.config.connect_timeout, TcpStream::connect(&address))
            .await
            .map_err(|_| PositionSourceError::ConnectTimeout {
                address: address.clone(),
                timeout: self.config.connect_timeout,
            })?
            .map_err(|source| PositionSourceError::Connect {
                address: address.clone(),
                source,
            })?;
        tracing::info!(address = %address, "Position source connected");

        let mut lines = FramedRead::new(
            stream,
            LinesCodec::new_with_max_length(self.config.max_line_length),
        );

        loop {
            let line = tokio::time::timeout(self.config.read_timeout, lines.next())
                .await
                .map_err(|_| PositionSourceError::ReadTimeout(self.config.read_timeout))?
                .ok_or(PositionSourceError::Closed)??;

            if line.trim().is_empty() {
                continue;
            }

            match decode_record(&line) {
                Ok(record) => {
                    let kind = if record.position.is_some() {
                        RecordKind::Position
                    } else {
                        RecordKind::Heartbeat
                    };
                    metrics::record_source_record(&self.label, kind);
                    tracing::trace!(position = ?record.position, ping = ?record.ping, "Record received");
                    sink.on_record(record).await;
                }
                Err(e) => {
                    metrics::record_source_record(&self.label, RecordKind::Invalid);
                    tracing::warn!(error = %e, line = excerpt(&line), "Ignoring undecodable record");
                }
            }
        }
    }
}
