//! Infrastructure Layer - Adapters and external integrations.
//!
//! The WebSocket transport that feeds the application services, plus the
//! process-level concerns (configuration, metrics, logging).

/// Market data WebSocket transport (connection manager, codec, reconnect).
pub mod feed;

/// Configuration loading.
pub mod config;

/// Prometheus metrics instrumentation.
pub mod metrics;

/// Logging and OpenTelemetry tracing integration.
pub mod telemetry;
