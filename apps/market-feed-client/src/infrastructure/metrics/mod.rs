//! Prometheus Metrics Module
//!
//! Exposes client metrics via Prometheus format for monitoring.
//!
//! # Metrics Categories
//!
//! - **Frames**: Inbound WebSocket frames by kind, malformed frames
//! - **Dispatch**: Envelopes routed to handlers, handler panics
//! - **Connection**: Connection state and reconnection attempts
//! - **Registry**: Ticks processed, dropped payloads, cached symbols
//!
//! # Integration
//!
//! Metrics are served at `/metrics` on `MARKET_FEED_METRICS_PORT` when the
//! port is non-zero. Without an installed recorder every call here is a no-op.

use std::net::SocketAddr;
use std::sync::OnceLock;
use std::time::Duration;

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};

use crate::infrastructure::feed::connection::ConnectionState;

// =============================================================================
// Exporter
// =============================================================================

static INSTALLED: OnceLock<SocketAddr> = OnceLock::new();

/// Install the Prometheus recorder and its HTTP listener on `addr`.
///
/// Calling this again after a successful install is a no-op. Must be called
/// from within a Tokio runtime.
///
/// # Errors
///
/// Returns an error if the recorder cannot be installed or the listener
/// cannot bind.
pub fn init_metrics(addr: SocketAddr) -> Result<(), BuildError> {
    if INSTALLED.get().is_some() {
        return Ok(());
    }

    PrometheusBuilder::new().with_http_listener(addr).install()?;
    let _ = INSTALLED.set(addr);

    register_metrics();
    tracing::info!(%addr, "Prometheus metrics listener started");
    Ok(())
}

/// Address of the metrics listener, if one was installed.
#[must_use]
pub fn metrics_addr() -> Option<SocketAddr> {
    INSTALLED.get().copied()
}

// =============================================================================
// Metric Registration
// =============================================================================

fn register_metrics() {
    describe_counter!(
        "market_feed_frames_received_total",
        "Total WebSocket frames received by kind"
    );
    describe_counter!(
        "market_feed_malformed_frames_total",
        "Total inbound frames that failed to decode"
    );
    describe_counter!(
        "market_feed_envelopes_dispatched_total",
        "Total envelopes routed to handlers by type"
    );
    describe_counter!(
        "market_feed_handler_panics_total",
        "Total handler invocations that panicked"
    );

    describe_gauge!(
        "market_feed_connection_state",
        "Connection state (0 = disconnected, 1 = connecting, 2 = connected)"
    );
    describe_counter!(
        "market_feed_reconnects_total",
        "Total reconnection attempts scheduled"
    );

    describe_counter!(
        "market_feed_ticks_total",
        "Total market data ticks accepted into the cache"
    );
    describe_counter!(
        "market_feed_payloads_dropped_total",
        "Total envelope payloads dropped as malformed"
    );
    describe_gauge!(
        "market_feed_cached_symbols",
        "Number of symbols held in the last-value cache"
    );

    describe_histogram!(
        "market_feed_fan_out_seconds",
        "Time to deliver one update to every subscriber"
    );
}

// =============================================================================
// Metric Recording Functions
// =============================================================================

/// Metric labels for inbound frame kinds.
#[derive(Debug, Clone, Copy)]
pub enum FrameKind {
    /// Text frame.
    Text,
    /// Binary frame.
    Binary,
    /// Ping control frame.
    Ping,
    /// Pong control frame.
    Pong,
}

impl FrameKind {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Binary => "binary",
            Self::Ping => "ping",
            Self::Pong => "pong",
        }
    }
}

/// Record a frame received from the feed.
pub fn record_frame_received(kind: FrameKind) {
    counter!(
        "market_feed_frames_received_total",
        "frame" => kind.as_str()
    )
    .increment(1);
}

/// Record a frame that could not be decoded into an envelope.
pub fn record_malformed_frame() {
    counter!("market_feed_malformed_frames_total").increment(1);
}

/// Record an envelope dispatched to `handlers` handlers.
pub fn record_dispatch(envelope_type: &str, handlers: usize) {
    counter!(
        "market_feed_envelopes_dispatched_total",
        "type" => envelope_type.to_string(),
        "handled" => if handlers == 0 { "false" } else { "true" }
    )
    .increment(1);
}

/// Record a handler that panicked while processing an envelope.
pub fn record_handler_panic(envelope_type: &str) {
    counter!(
        "market_feed_handler_panics_total",
        "type" => envelope_type.to_string()
    )
    .increment(1);
}

/// Update the connection state gauge.
pub fn set_connection_state(state: ConnectionState) {
    let value = match state {
        ConnectionState::Disconnected => 0.0,
        ConnectionState::Connecting => 1.0,
        ConnectionState::Connected => 2.0,
    };
    gauge!("market_feed_connection_state").set(value);
}

/// Record a scheduled reconnection attempt.
pub fn record_reconnect() {
    counter!("market_feed_reconnects_total").increment(1);
}

/// Record a tick accepted into the cache.
pub fn record_tick() {
    counter!("market_feed_ticks_total").increment(1);
}

/// Record a payload dropped because it did not match its envelope type.
pub fn record_payload_dropped(envelope_type: &str) {
    counter!(
        "market_feed_payloads_dropped_total",
        "type" => envelope_type.to_string()
    )
    .increment(1);
}

/// Update the cached symbol count.
#[allow(clippy::cast_precision_loss)]
pub fn set_cached_symbols(count: usize) {
    gauge!("market_feed_cached_symbols").set(count as f64);
}

/// Record how long a fan-out took.
pub fn record_fan_out_duration(envelope_type: &str, duration: Duration) {
    histogram!(
        "market_feed_fan_out_seconds",
        "type" => envelope_type.to_string()
    )
    .record(duration.as_secs_f64());
}

// =============================================================================
// Tests
// =============================================================================
