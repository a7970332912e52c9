//! Market Feed Client Binary
//!
//! Connects to the configured market data feed and logs a derived ticker
//! view for every configured symbol until SIGINT/SIGTERM.
//!
//! # Usage
//!
//! ```bash
//! MARKET_FEED_URL=ws://localhost:8080 cargo run --bin market-feed-client
//! ```
//!
//! # Environment Variables
//!
//! ## Required
//! - `MARKET_FEED_URL`: WebSocket endpoint (`ws://` or `wss://`)
//!
//! ## Optional
//! - `MARKET_FEED_MAX_RECONNECT_ATTEMPTS`: Consecutive reconnect attempts (default: 5)
//! - `MARKET_FEED_RECONNECT_BASE_DELAY_MS`: Linear backoff unit (default: 1000)
//! - `MARKET_FEED_RECONNECT_JITTER`: Backoff jitter fraction (default: 0.0)
//! - `MARKET_FEED_HEARTBEAT_INTERVAL_SECS`: Ping interval, 0 disables (default: 30)
//! - `MARKET_FEED_HEARTBEAT_TIMEOUT_SECS`: Silence before reconnecting (default: 60)
//! - `MARKET_FEED_TIMESTAMP_SOURCE`: local | wire (default: local)
//! - `MARKET_FEED_SYMBOLS`: Comma-separated symbols (default: EUR/USD)
//! - `MARKET_FEED_UPDATE_INTERVAL_MS`: Ticker polling interval, 0 disables (default: 0)
//! - `MARKET_FEED_INCLUDE_STATUS`: Follow trading status (default: false)
//! - `MARKET_FEED_METRICS_PORT`: Prometheus metrics port, 0 disables (default: 0)
//! - `OTEL_ENABLED`: Enable OpenTelemetry export (default: false)
//! - `OTEL_EXPORTER_OTLP_ENDPOINT`: OTLP endpoint (default: <http://localhost:4317>)
//! - `OTEL_SERVICE_NAME`: Service name (default: market-feed-client)
//! - `RUST_LOG`: Log level (default: info)

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use market_feed_client::infrastructure::feed::{ConnectionConfig, ConnectionManager};
use market_feed_client::infrastructure::telemetry;
use market_feed_client::{
    ClientConfig, MarketDataService, PricedTick, RegistryConfig, TickerError, TickerFeed,
    TickerOptions, init_metrics,
};
use tokio::signal;
use tokio_util::sync::CancellationToken;

/// Interval between connection status log lines.
const STATUS_LOG_INTERVAL: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Err means a provider is already installed
    let _ = rustls::crypto::ring::default_provider().install_default();

    load_dotenv();

    let _telemetry_guard = telemetry::init();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "Starting market feed client");

    let config = ClientConfig::from_env().context("failed to load configuration")?;
    log_config(&config);

    if config.server.metrics_port != 0 {
        let addr = SocketAddr::from(([0, 0, 0, 0], config.server.metrics_port));
        init_metrics(addr).context("failed to start metrics exporter")?;
    }

    let connection = ConnectionManager::new(ConnectionConfig::from_feed_settings(&config.feed));
    let service = MarketDataService::new(
        Arc::clone(&connection),
        RegistryConfig::default().with_timestamp_source(config.timestamp_source),
    );

    let tickers: Vec<TickerFeed> = config
        .ticker
        .symbols
        .iter()
        .map(|symbol| {
            let options = TickerOptions::new()
                .include_trading_status(config.ticker.include_trading_status)
                .update_interval(config.ticker.update_interval)
                .on_update(log_update)
                .on_error(log_ticker_error);
            TickerFeed::new(Arc::clone(&service), symbol.clone(), options)
        })
        .collect();

    connection.connect().context("failed to start feed connection")?;

    let shutdown_token = CancellationToken::new();
    let status_token = shutdown_token.clone();
    let status_connection = Arc::clone(&connection);
    let status_service = Arc::clone(&service);
    let status_task = tokio::spawn(async move {
        let mut interval = tokio::time::interval(STATUS_LOG_INTERVAL);
        interval.tick().await;
        loop {
            tokio::select! {
                () = status_token.cancelled() => break,
                _ = interval.tick() => {
                    let stats = status_service.stats();
                    tracing::info!(
                        state = %status_connection.state(),
                        reconnect_attempts = status_connection.reconnect_attempts(),
                        cached_symbols = stats.cached_symbols,
                        tick_subscribers = stats.ticks.callback_count,
                        "Feed status"
                    );
                }
            }
        }
    });

    tracing::info!(tickers = tickers.len(), "Market feed client ready");

    await_shutdown(shutdown_token).await;

    drop(tickers);
    service.disconnect();
    let _ = status_task.await;

    tracing::info!("Market feed client stopped");
    Ok(())
}

fn log_update(tick: &PricedTick) {
    tracing::info!(
        symbol = tick.symbol(),
        price = %tick.price(),
        bid = %tick.tick.bid,
        ask = %tick.tick.ask,
        change = ?tick.change,
        change_percent = ?tick.change_percent,
        direction = ?tick.direction(),
        "Tick"
    );
}

fn log_ticker_error(error: &TickerError) {
    tracing::warn!(error = %error, "Ticker error");
}

/// Log the parsed configuration.
fn log_config(config: &ClientConfig) {
    tracing::info!(
        url = %config.feed.url,
        symbols = ?config.ticker.symbols,
        max_reconnect_attempts = config.feed.max_reconnect_attempts,
        reconnect_base_delay_ms = config.feed.reconnect_base_delay.as_millis(),
        timestamp_source = config.timestamp_source.as_str(),
        metrics_port = config.server.metrics_port,
        "Configuration loaded"
    );
    tracing::debug!(
        heartbeat_interval_secs = config.feed.heartbeat_interval.as_secs(),
        heartbeat_timeout_secs = config.feed.heartbeat_timeout.as_secs(),
        update_interval_ms = config.ticker.update_interval.as_millis(),
        include_trading_status = config.ticker.include_trading_status,
        "Feed tuning"
    );
}

/// Load .env file from current directory or any ancestor directory.
fn load_dotenv() {
    if dotenvy::dotenv().is_ok() {
        return;
    }

    if let Ok(cwd) = std::env::current_dir() {
        let mut dir = cwd.as_path();
        while let Some(parent) = dir.parent() {
            let env_path = parent.join(".env");
            if env_path.exists() {
                let _ = dotenvy::from_path(&env_path);
                return;
            }
            dir = parent;
        }
    }
}

/// Wait for shutdown signal (SIGTERM or SIGINT).
async fn await_shutdown(shutdown_token: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
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
