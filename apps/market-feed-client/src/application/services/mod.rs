//! Application Services
//!
//! Services that sit between the feed transport and consumers.
//!
//! - `MarketDataService`: per-symbol fan-out with a last-value cache
//! - `TickerFeed`: per-consumer derived view with optional polling

mod market_data_service;
mod ticker;

pub use market_data_service::{
    Channel, MarketDataService, RegistryConfig, RegistryStats, Subscription,
};
pub use ticker::{
    ErrorCallback, TickerError, TickerFeed, TickerOptions, TickerPhase, UNKNOWN_STATUS,
    UpdateCallback,
};
