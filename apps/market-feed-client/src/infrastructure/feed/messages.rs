//! Feed Wire Message Types
//!
//! Wire format types for messages on the market data WebSocket.
//!
//! # Envelope
//!
//! Every frame is a JSON object wrapping a typed payload:
//!
//! ```json
//! {"type": "marketData", "data": {"symbol": "EUR/USD", "price": 1.1, ...}}
//! {"type": "tradingStatus", "data": {"symbol": "EUR/USD", "status": "open"}}
//! ```
//!
//! Some producers name the payload field `payload` instead of `data`; both
//! are accepted, and `data` wins when a frame carries both. Unknown `type` values are valid envelopes that simply have
//! no handlers.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::domain::market_data::{Tick, TradingStatus};

// =============================================================================
// Envelope
// =============================================================================

/// Envelope type carrying market data ticks.
pub const MARKET_DATA: &str = "marketData";

/// Envelope type carrying trading status updates.
pub const TRADING_STATUS: &str = "tradingStatus";

/// Wire-level unit: a type tag selecting the dispatch table and an opaque payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "WireEnvelope")]
pub struct Envelope {
    /// Message type used for dispatch.
    #[serde(rename = "type")]
    pub kind: String,

    /// Payload, passed through undecoded beyond JSON parsing.
    pub data: serde_json::Value,
}

/// Inbound shape: either payload key, or neither.
#[derive(Deserialize)]
struct WireEnvelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: Option<serde_json::Value>,
    #[serde(default)]
    payload: Option<serde_json::Value>,
}

impl From<WireEnvelope> for Envelope {
    fn from(wire: WireEnvelope) -> Self {
        Self {
            kind: wire.kind,
            data: wire.data.or(wire.payload).unwrap_or_default(),
        }
    }
}

impl Envelope {
    /// Create an envelope.
    #[must_use]
    pub fn new(kind: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            kind: kind.into(),
            data,
        }
    }

    /// Create a `marketData` envelope.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload cannot be serialized.
    pub fn market_data(payload: &MarketDataPayload) -> Result<Self, serde_json::Error> {
        Ok(Self::new(MARKET_DATA, serde_json::to_value(payload)?))
    }

    /// Create a `tradingStatus` envelope.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload cannot be serialized.
    pub fn trading_status(status: &TradingStatus) -> Result<Self, serde_json::Error> {
        Ok(Self::new(TRADING_STATUS, serde_json::to_value(status)?))
    }
}

// =============================================================================
// Payloads
// =============================================================================

/// `marketData` payload.
///
/// # Wire Format (JSON)
/// ```json
/// {"symbol": "EUR/USD", "price": 1.1, "bid": 1.0999, "ask": 1.1001, "volume": 1000000}
/// ```
///
/// `timestamp` is optional on the wire and only honoured when the service
/// is configured to trust wire timestamps.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarketDataPayload {
    /// Instrument symbol.
    pub symbol: String,
    /// Last traded price.
    pub price: Decimal,
    /// Best bid.
    pub bid: Decimal,
    /// Best ask.
    pub ask: Decimal,
    /// Traded volume.
    pub volume: Decimal,
    /// Producer timestamp in epoch milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
}

impl MarketDataPayload {
    /// Build a tick stamped with `timestamp`.
    #[must_use]
    pub fn into_tick(self, timestamp: i64) -> Tick {
        Tick {
            symbol: self.symbol,
            price: self.price,
            bid: self.bid,
            ask: self.ask,
            volume: self.volume,
            timestamp,
        }
    }
}
