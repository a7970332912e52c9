//! Market Data Types
//!
//! Core domain types for the feed: ticks, trading status updates and the
//! derived per-consumer view of a tick. These types are codec-agnostic and
//! represent the canonical internal representation of market data.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// A symbol string (e.g. `EUR/USD`).
pub type Symbol = String;

// =============================================================================
// Tick
// =============================================================================

/// One point-in-time market data update for one symbol.
///
/// A newer tick for the same symbol supersedes the older one in the
/// last-value cache; ticks themselves are never mutated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tick {
    /// Instrument symbol.
    pub symbol: Symbol,
    /// Last traded price.
    pub price: Decimal,
    /// Best bid.
    pub bid: Decimal,
    /// Best ask.
    pub ask: Decimal,
    /// Traded volume.
    pub volume: Decimal,
    /// Receipt (or wire) time in epoch milliseconds.
    pub timestamp: i64,
}

impl Tick {
    /// Bid/ask spread.
    #[must_use]
    pub fn spread(&self) -> Decimal {
        self.ask - self.bid
    }
}

// =============================================================================
// Trading Status
// =============================================================================

/// Trading status update for a symbol (e.g. `open`, `halted`).
///
/// Status is transient: it is pushed to subscribers and never cached.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TradingStatus {
    /// Instrument symbol.
    pub symbol: Symbol,
    /// Status string as sent by the feed.
    pub status: String,
}

// =============================================================================
// Timestamp Source
// =============================================================================

/// Where a tick's timestamp comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TimestampSource {
    /// Stamp the local receipt time.
    #[default]
    Local,
    /// Trust the payload's `timestamp`, falling back to receipt time when absent.
    Wire,
}

impl TimestampSource {
    /// Parse a timestamp source, defaulting to `Local` for unknown values.
    #[must_use]
    pub fn from_str_case_insensitive(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "wire" | "server" => Self::Wire,
            _ => Self::Local,
        }
    }

    /// Name as used in configuration.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Wire => "wire",
        }
    }

    /// Pick the timestamp for a tick received at `received_at`.
    #[must_use]
    pub fn resolve(self, wire: Option<i64>, received_at: i64) -> i64 {
        match self {
            Self::Local => received_at,
            Self::Wire => wire.unwrap_or(received_at),
        }
    }
}

// =============================================================================
// Priced Tick
// =============================================================================

/// Direction of the last price move.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PriceDirection {
    /// Price went up.
    Up,
    /// Price went down.
    Down,
    /// Price unchanged, or no previous price to compare with.
    Flat,
}

/// A tick as seen by one consumer, with change fields derived from the
/// previous tick that same consumer received.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PricedTick {
    /// The underlying tick.
    #[serde(flatten)]
    pub tick: Tick,
    /// Absolute change against the previous price.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub change: Option<Decimal>,
    /// Percentage change against the previous price.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub change_percent: Option<Decimal>,
}

impl PricedTick {
    /// Wrap the first tick a consumer sees. Carries no change fields.
    #[must_use]
    pub const fn first(tick: Tick) -> Self {
        Self {
            tick,
            change: None,
            change_percent: None,
        }
    }

    /// Derive change fields for `tick` relative to `previous_price`.
    ///
    /// `change_percent` is `None` when the previous price is zero.
    #[must_use]
    pub fn against(tick: Tick, previous_price: Decimal) -> Self {
        let change = tick.price.checked_sub(previous_price);
        let change_percent = change
            .and_then(|c| c.checked_div(previous_price))
            .and_then(|r| r.checked_mul(Decimal::ONE_HUNDRED));

        Self {
            tick,
            change,
            change_percent,
        }
    }

    /// Symbol of the underlying tick.
    #[must_use]
    pub fn symbol(&self) -> &str {
        &self.tick.symbol
    }

    /// Price of the underlying tick.
    #[must_use]
    pub const fn price(&self) -> Decimal {
        self.tick.price
    }

    /// Direction of the move, `Flat` when there is nothing to compare with.
    #[must_use]
    pub fn direction(&self) -> PriceDirection {
        match self.change {
            Some(c) if c.is_sign_positive() && !c.is_zero() => PriceDirection::Up,
            Some(c) if c.is_sign_negative() && !c.is_zero() => PriceDirection::Down,
            _ => PriceDirection::Flat,
        }
    }
}
