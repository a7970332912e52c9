#![cfg_attr(
    test,
    allow(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::float_cmp,
        clippy::significant_drop_tightening,
        clippy::too_many_lines,
        clippy::needless_pass_by_value,
        clippy::items_after_statements,
        clippy::redundant_clone
    )
)]

//! Market Feed Client - Market Data Distribution
//!
//! Holds one WebSocket connection to a market data feed, demultiplexes
//! `{type, data}` envelopes, fans ticks and trading status out to
//! per-symbol subscribers with a last-value cache, and gives each consumer
//! a derived ticker view with price change and optional polling.
//!
//! # Layers (inside → outside)
//!
//! - **Domain**: Core data types with no I/O
//!   - `market_data`: Ticks, trading status, derived priced ticks
//!   - `subscription`: Callback sets keyed by symbol
//!
//! - **Application**: Services consumed by presentation code
//!   - `MarketDataService`: Per-symbol fan-out and last-value cache
//!   - `TickerFeed`: Per-consumer change computation and polling
//!
//! - **Infrastructure**: Adapters and process concerns
//!   - `feed`: WebSocket connection manager, codec, reconnect, heartbeat
//!   - `config`: Environment configuration
//!   - `metrics`: Prometheus instrumentation
//!   - `telemetry`: Logging and OpenTelemetry
//!
//! # Data Flow
//!
//! ```text
//!                ┌───────────────────┐  marketData   ┌───────────────────┐     ┌────────────┐
//! Feed WS ──────►│ ConnectionManager │──────────────►│ MarketDataService │────►│ TickerFeed │──► on_update
//!                │  (type dispatch)  │ tradingStatus │  (symbol fan-out, │     └────────────┘
//!                └───────────────────┘──────────────►│   last-value      │────► Subscription
//!                                                    │   cache)          │      callbacks
//!                                                    └───────────────────┘
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]

// =============================================================================
// Module Declarations
// =============================================================================

/// Domain layer - Core market data types with no I/O.
pub mod domain;

/// Application layer - Fan-out and ticker services.
pub mod application;

/// Infrastructure layer - Adapters and external integrations.
pub mod infrastructure;

// =============================================================================
// Re-exports
// =============================================================================

// Domain types
pub use domain::market_data::{
    PriceDirection, PricedTick, Symbol, Tick, TimestampSource, TradingStatus,
};
pub use domain::subscription::{Callback, SubscriptionStats};

// Application services
pub use application::services::{
    Channel, MarketDataService, RegistryConfig, RegistryStats, Subscription, TickerError,
    TickerFeed, TickerOptions, TickerPhase,
};

// Feed transport
pub use infrastructure::feed::{
    ConnectionConfig, ConnectionError, ConnectionManager, ConnectionState, Envelope, HandlerId,
};

// Infrastructure config
pub use infrastructure::config::{
    ClientConfig, ConfigError, FeedSettings, ServerSettings, TickerSettings,
};

// Metrics
pub use infrastructure::metrics::init_metrics;

// Telemetry
pub use infrastructure::telemetry::{TelemetryConfig, TelemetryGuard, init as init_telemetry};
