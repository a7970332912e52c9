//! Domain Layer - Core market data types.
//!
//! This layer contains the core domain types for market data distribution
//! with no I/O. All types here are pure Rust with serialization support.

/// Market data types (ticks, trading status, derived change).
pub mod market_data;

/// Subscriber set tracking.
pub mod subscription;
