//! Market Data Feed Adapter
//!
//! WebSocket transport for the market data endpoint:
//!
//! - **connection**: single-session manager with per-type envelope dispatch
//! - **codec**: JSON envelope decoding (text and UTF-8 binary frames)
//! - **messages**: wire envelope and payload types
//! - **reconnect**: bounded linear backoff
//! - **heartbeat**: ping/pong liveness tracking

pub mod codec;
pub mod connection;
pub mod heartbeat;
pub mod messages;
pub mod reconnect;

pub use codec::{CodecError, EnvelopeCodec};
pub use connection::{
    ConnectionConfig, ConnectionError, ConnectionManager, ConnectionState, EnvelopeHandler,
    HandlerId,
};
pub use heartbeat::{HeartbeatAction, HeartbeatConfig, HeartbeatMonitor};
pub use messages::{Envelope, MARKET_DATA, MarketDataPayload, TRADING_STATUS};
pub use reconnect::{ReconnectConfig, ReconnectError, ReconnectPolicy};
