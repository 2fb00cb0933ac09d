//! Infrastructure Layer - Adapters and process wiring.
//!
//! Concrete implementations behind the application ports, the network
//! clients and supervisors, and the per-account runtime that ties them
//! together.

/// Configuration loading and validation.
pub mod config;

/// Prometheus metrics instrumentation.
pub mod metrics;

/// In-process paper brokerage.
pub mod paper;

/// Reconnect delay policy.
pub mod reconnect;

/// Per-account orchestration.
pub mod runtime;

/// Target position stream client.
pub mod source;

/// Brokerage connection health supervision.
pub mod supervisor;

/// Tracing subscriber and OpenTelemetry export.
pub mod telemetry;
