//! Application Layer - Use cases.
//!
//! Symbol fan-out and per-consumer ticker views built on the feed
//! connection manager.

/// Market data and ticker services.
pub mod services;
