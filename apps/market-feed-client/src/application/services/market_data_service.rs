//! Market Data Service
//!
//! Per-symbol fan-out on top of the [`ConnectionManager`]. The service
//! registers one handler for `marketData` and one for `tradingStatus` at
//! construction, then routes every tick and status update to the callbacks
//! registered for its symbol.
//!
//! Every tick updates the last-value cache before fan-out, whether or not
//! anyone is subscribed. A new tick subscriber is immediately called with
//! the cached tick for its symbol, if there is one. Trading status is never
//! cached.
//!
//! Each cached tick carries a sequence number. Replays and live pushes are
//! both delivered through the subscription's watermark, so a subscriber
//! never sees an older tick after a newer one, even when it subscribes while
//! another thread is dispatching.
//!
//! Callbacks are invoked with no registry lock held, so they may subscribe or
//! unsubscribe from inside the callback.

use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Weak};
use std::time::Instant;

use parking_lot::{Mutex, RwLock};

use crate::domain::market_data::{Symbol, Tick, TimestampSource, TradingStatus};
use crate::domain::subscription::{
    Callback, Subscriber, SubscriptionRegistry, SubscriptionStats,
};
use crate::infrastructure::feed::{
    ConnectionManager, EnvelopeCodec, HandlerId, MARKET_DATA, MarketDataPayload, TRADING_STATUS,
};
use crate::infrastructure::metrics;

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for the market data service.
#[derive(Debug, Clone, Copy, Default)]
pub struct RegistryConfig {
    /// Where tick timestamps come from.
    pub timestamp_source: TimestampSource,
}

impl RegistryConfig {
    /// Use `source` for tick timestamps.
    #[must_use]
    pub const fn with_timestamp_source(mut self, source: TimestampSource) -> Self {
        self.timestamp_source = source;
        self
    }
}

// =============================================================================
// Subscription Handle
// =============================================================================

/// Which channel a [`Subscription`] belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    /// Market data ticks.
    Tick,
    /// Trading status updates.
    TradingStatus,
}

type Unsubscribe = Box<dyn FnOnce() -> bool + Send + Sync>;

/// Handle returned by the subscribe calls.
///
/// Dropping the handle leaves the callback registered; call
/// [`unsubscribe`](Self::unsubscribe) to remove it.
#[must_use = "dropping a Subscription leaves the callback registered"]
pub struct Subscription {
    symbol: Symbol,
    channel: Channel,
    remove: Option<Unsubscribe>,
}

impl Subscription {
    fn new(symbol: Symbol, channel: Channel, remove: Unsubscribe) -> Self {
        Self {
            symbol,
            channel,
            remove: Some(remove),
        }
    }

    /// Symbol this subscription is keyed on.
    #[must_use]
    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    /// Channel this subscription is on.
    #[must_use]
    pub const fn channel(&self) -> Channel {
        self.channel
    }

    /// Whether [`unsubscribe`](Self::unsubscribe) has not been called yet.
    #[must_use]
    pub const fn is_active(&self) -> bool {
        self.remove.is_some()
    }

    /// Remove exactly the callback this handle was created for.
    ///
    /// Returns `true` if the callback was still registered. Calling it again
    /// is a no-op.
    pub fn unsubscribe(&mut self) -> bool {
        self.remove.take().is_some_and(|remove| remove())
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("symbol", &self.symbol)
            .field("channel", &self.channel)
            .field("active", &self.is_active())
            .finish()
    }
}

// =============================================================================
// Statistics
// =============================================================================

/// Snapshot of the service's bookkeeping.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegistryStats {
    /// Tick channel subscriptions.
    pub ticks: SubscriptionStats,
    /// Trading status subscriptions.
    pub statuses: SubscriptionStats,
    /// Symbols in the last-value cache.
    pub cached_symbols: usize,
}

// =============================================================================
// Last-Value Cache
// =============================================================================

/// Latest tick per symbol, each stamped with the sequence it was cached at.
#[derive(Debug, Default)]
struct TickCache {
    ticks: HashMap<Symbol, (u64, Tick)>,
    sequence: u64,
}

impl TickCache {
    /// Store `tick` as its symbol's latest and return its sequence.
    fn insert(&mut self, tick: Tick) -> u64 {
        self.sequence += 1;
        self.ticks.insert(tick.symbol.clone(), (self.sequence, tick));
        self.sequence
    }

    fn get(&self, symbol: &str) -> Option<&(u64, Tick)> {
        self.ticks.get(symbol)
    }

    fn len(&self) -> usize {
        self.ticks.len()
    }

    /// Drop every tick. Sequences keep counting up.
    fn clear(&mut self) {
        self.ticks.clear();
    }
}

// =============================================================================
// Market Data Service
// =============================================================================

/// Symbol-keyed subscription registry with a last-value tick cache.
pub struct MarketDataService {
    connection: Arc<ConnectionManager>,
    config: RegistryConfig,
    codec: EnvelopeCodec,
    ticks: RwLock<SubscriptionRegistry<Symbol, Tick>>,
    statuses: RwLock<SubscriptionRegistry<Symbol, TradingStatus>>,
    cache: RwLock<TickCache>,
    handlers: Mutex<Vec<(&'static str, HandlerId)>>,
}

impl std::fmt::Debug for MarketDataService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MarketDataService")
            .field("config", &self.config)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

impl MarketDataService {
    /// Create the service and register its envelope handlers on `connection`.
    #[must_use]
    pub fn new(connection: Arc<ConnectionManager>, config: RegistryConfig) -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<Self>| {
            let on_market_data = weak.clone();
            let market_data_id = connection.subscribe(MARKET_DATA, move |data| {
                if let Some(service) = on_market_data.upgrade() {
                    service.handle_market_data(data);
                }
            });

            let on_status = weak.clone();
            let status_id = connection.subscribe(TRADING_STATUS, move |data| {
                if let Some(service) = on_status.upgrade() {
                    service.handle_trading_status(data);
                }
            });

            Self {
                connection,
                config,
                codec: EnvelopeCodec::new(),
                ticks: RwLock::new(SubscriptionRegistry::new()),
                statuses: RwLock::new(SubscriptionRegistry::new()),
                cache: RwLock::new(TickCache::default()),
                handlers: Mutex::new(vec![
                    (MARKET_DATA, market_data_id),
                    (TRADING_STATUS, status_id),
                ]),
            }
        })
    }

    /// The underlying connection manager.
    #[must_use]
    pub const fn connection(&self) -> &Arc<ConnectionManager> {
        &self.connection
    }

    // -------------------------------------------------------------------------
    // Tick channel
    // -------------------------------------------------------------------------

    /// Register `callback` for ticks on `symbol`.
    ///
    /// If a tick for `symbol` is cached, `callback` is called with it before
    /// this returns, unless a newer tick already reached it from a
    /// concurrent dispatch.
    pub fn subscribe_to_symbol(
        self: &Arc<Self>,
        symbol: &str,
        callback: Callback<Tick>,
    ) -> Subscription {
        let key = symbol.to_string();
        let subscriber = {
            let mut ticks = self.ticks.write();
            let registration = ticks.add(&key, Arc::clone(&callback));
            tracing::debug!(symbol, ?registration, "Tick subscriber registered");
            ticks.subscriber(&key, &callback)
        };

        let cached = self.cache.read().get(symbol).cloned();
        if let (Some(subscriber), Some((sequence, tick))) = (subscriber, cached)
            && subscriber.deliver(sequence, &tick)
        {
            tracing::trace!(symbol, sequence, "Replayed cached tick");
        }

        let service = Arc::downgrade(self);
        Subscription::new(
            symbol.to_string(),
            Channel::Tick,
            Box::new(move || {
                service
                    .upgrade()
                    .is_some_and(|s| s.unsubscribe_from_symbol(&key, &callback))
            }),
        )
    }

    /// Remove `callback` from `symbol`'s tick subscribers.
    ///
    /// The cached tick for `symbol` is kept.
    pub fn unsubscribe_from_symbol(&self, symbol: &str, callback: &Callback<Tick>) -> bool {
        let removed = self.ticks.write().remove(&symbol.to_string(), callback);
        if removed {
            tracing::debug!(symbol, "Tick subscriber removed");
        }
        removed
    }

    /// Most recent tick received for `symbol`.
    #[must_use]
    pub fn get_last_price(&self, symbol: &str) -> Option<Tick> {
        self.cache.read().get(symbol).map(|(_, tick)| tick.clone())
    }

    // -------------------------------------------------------------------------
    // Trading status channel
    // -------------------------------------------------------------------------

    /// Register `callback` for trading status updates on `symbol`.
    pub fn subscribe_to_trading_status(
        self: &Arc<Self>,
        symbol: &str,
        callback: Callback<TradingStatus>,
    ) -> Subscription {
        let registration = self
            .statuses
            .write()
            .add(&symbol.to_string(), Arc::clone(&callback));
        tracing::debug!(symbol, ?registration, "Status subscriber registered");

        let service = Arc::downgrade(self);
        let key = symbol.to_string();
        Subscription::new(
            symbol.to_string(),
            Channel::TradingStatus,
            Box::new(move || {
                service
                    .upgrade()
                    .is_some_and(|s| s.unsubscribe_from_trading_status(&key, &callback))
            }),
        )
    }

    /// Remove `callback` from `symbol`'s status subscribers.
    pub fn unsubscribe_from_trading_status(
        &self,
        symbol: &str,
        callback: &Callback<TradingStatus>,
    ) -> bool {
        self.statuses.write().remove(&symbol.to_string(), callback)
    }

    // -------------------------------------------------------------------------
    // Lifecycle and introspection
    // -------------------------------------------------------------------------

    /// Disconnect the transport and drop every subscriber and cached tick.
    pub fn disconnect(&self) {
        self.connection.disconnect();
        self.handlers.lock().clear();
        self.ticks.write().clear();
        self.statuses.write().clear();
        self.cache.write().clear();
        metrics::set_cached_symbols(0);
        tracing::info!("Market data service disconnected");
    }

    /// Number of tick callbacks registered for `symbol`.
    #[must_use]
    pub fn subscriber_count(&self, symbol: &str) -> usize {
        self.ticks.read().count(&symbol.to_string())
    }

    /// Number of status callbacks registered for `symbol`.
    #[must_use]
    pub fn status_subscriber_count(&self, symbol: &str) -> usize {
        self.statuses.read().count(&symbol.to_string())
    }

    /// Symbols present in the last-value cache, sorted.
    #[must_use]
    pub fn cached_symbols(&self) -> Vec<Symbol> {
        let mut symbols: Vec<Symbol> = self.cache.read().ticks.keys().cloned().collect();
        symbols.sort_unstable();
        symbols
    }

    /// Current bookkeeping totals.
    #[must_use]
    pub fn stats(&self) -> RegistryStats {
        RegistryStats {
            ticks: self.ticks.read().stats(),
            statuses: self.statuses.read().stats(),
            cached_symbols: self.cache.read().len(),
        }
    }

    // -------------------------------------------------------------------------
    // Envelope handlers
    // -------------------------------------------------------------------------

    fn handle_market_data(&self, data: &serde_json::Value) {
        let payload: MarketDataPayload = match self.codec.decode_payload(data) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::warn!(error = %e, "Dropping malformed marketData payload");
                metrics::record_payload_dropped(MARKET_DATA);
                return;
            }
        };

        let received_at = chrono::Utc::now().timestamp_millis();
        let timestamp = self
            .config
            .timestamp_source
            .resolve(payload.timestamp, received_at);
        let tick = payload.into_tick(timestamp);

        let (sequence, cached) = {
            let mut cache = self.cache.write();
            let sequence = cache.insert(tick.clone());
            (sequence, cache.len())
        };
        metrics::record_tick();
        metrics::set_cached_symbols(cached);

        let subscribers = self.ticks.read().subscribers(&tick.symbol);
        fan_out(MARKET_DATA, &tick.symbol, &subscribers, |subscriber| {
            subscriber.deliver(sequence, &tick);
        });
    }

    fn handle_trading_status(&self, data: &serde_json::Value) {
        let status: TradingStatus = match self.codec.decode_payload(data) {
            Ok(status) => status,
            Err(e) => {
                tracing::warn!(error = %e, "Dropping malformed tradingStatus payload");
                metrics::record_payload_dropped(TRADING_STATUS);
                return;
            }
        };

        let subscribers = self.statuses.read().subscribers(&status.symbol);
        fan_out(TRADING_STATUS, &status.symbol, &subscribers, |subscriber| {
            subscriber.call(&status);
        });
    }
}

impl Drop for MarketDataService {
    fn drop(&mut self) {
        for (kind, id) in self.handlers.get_mut().drain(..) {
            self.connection.unsubscribe(kind, id);
        }
    }
}

/// Run `deliver` for every subscriber; a panicking callback does not stop the rest.
fn fan_out<T, F>(kind: &'static str, symbol: &str, subscribers: &[Subscriber<T>], deliver: F)
where
    F: Fn(&Subscriber<T>),
{
    if subscribers.is_empty() {
        return;
    }

    let started = Instant::now();
    for subscriber in subscribers {
        if catch_unwind(AssertUnwindSafe(|| deliver(subscriber))).is_err() {
            tracing::error!(kind, symbol, "Subscriber callback panicked");
            metrics::record_handler_panic(kind);
        }
    }
    metrics::record_fan_out_duration(kind, started.elapsed());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::feed::ConnectionConfig;
    use proptest::prelude::*;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    fn service() -> Arc<MarketDataService> {
        let connection = ConnectionManager::new(ConnectionConfig::new("ws://127.0.0.1:9"));
        MarketDataService::new(connection, RegistryConfig::default())
    }

    fn tick_frame(symbol: &str, price: &str) -> String {
        format!(
            r#"{{"type":"marketData","data":{{"symbol":"{symbol}","price":{price},"bid":{price},"ask":{price},"volume":100}}}}"#
        )
    }

    fn status_frame(symbol: &str, status: &str) -> String {
        format!(r#"{{"type":"tradingStatus","data":{{"symbol":"{symbol}","status":"{status}"}}}}"#)
    }

    fn recorder() -> (Arc<Mutex<Vec<Tick>>>, Callback<Tick>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        (seen, Arc::new(move |tick: &Tick| sink.lock().push(tick.clone())))
    }

    #[test]
    fn registers_both_envelope_handlers() {
        let service = service();
        assert_eq!(service.connection().handler_count(MARKET_DATA), 1);
        assert_eq!(service.connection().handler_count(TRADING_STATUS), 1);
    }

    #[test]
    fn tick_reaches_symbol_subscribers_only() {
        let service = service();
        let (eur, on_eur) = recorder();
        let (gbp, on_gbp) = recorder();
        let _eur_sub = service.subscribe_to_symbol("EUR/USD", on_eur);
        let _gbp_sub = service.subscribe_to_symbol("GBP/USD", on_gbp);

        service.connection().dispatch_frame(&tick_frame("EUR/USD", "1.1000"));

        assert_eq!(eur.lock().len(), 1);
        assert_eq!(eur.lock()[0].price, dec!(1.1));
        assert!(gbp.lock().is_empty());
    }

    #[test]
    fn fan_out_reaches_every_distinct_callback_once() {
        let service = service();
        let count = Arc::new(AtomicUsize::new(0));
        let mut subs = Vec::new();
        for _ in 0..5 {
            let count = Arc::clone(&count);
            let callback: Callback<Tick> = Arc::new(move |_: &Tick| {
                count.fetch_add(1, Ordering::SeqCst);
            });
            subs.push(service.subscribe_to_symbol("EUR/USD", callback));
        }

        service.connection().dispatch_frame(&tick_frame("EUR/USD", "1.1"));

        assert_eq!(count.load(Ordering::SeqCst), 5);
        assert_eq!(service.subscriber_count("EUR/USD"), 5);
    }

    #[test]
    fn duplicate_callback_is_registered_once() {
        let service = service();
        let (seen, callback) = recorder();
        let _a = service.subscribe_to_symbol("EUR/USD", Arc::clone(&callback));
        let _b = service.subscribe_to_symbol("EUR/USD", callback);

        service.connection().dispatch_frame(&tick_frame("EUR/USD", "1.1"));

        assert_eq!(service.subscriber_count("EUR/USD"), 1);
        assert_eq!(seen.lock().len(), 1);
    }

    #[test]
    fn late_subscriber_gets_cached_tick_immediately() {
        let service = service();
        service.connection().dispatch_frame(&tick_frame("EUR/USD", "1.2345"));

        let (seen, callback) = recorder();
        let _sub = service.subscribe_to_symbol("EUR/USD", callback);

        let seen = seen.lock();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].price, dec!(1.2345));
    }

    #[test]
    fn no_replay_without_cached_tick() {
        let service = service();
        let (seen, callback) = recorder();
        let _sub = service.subscribe_to_symbol("EUR/USD", callback);
        assert!(seen.lock().is_empty());
    }

    #[test]
    fn unsubscribe_handle_stops_delivery() {
        let service = service();
        let (seen, callback) = recorder();
        let (other, other_cb) = recorder();
        let mut sub = service.subscribe_to_symbol("EUR/USD", callback);
        let _other = service.subscribe_to_symbol("EUR/USD", other_cb);

        assert!(sub.unsubscribe());
        assert!(!sub.unsubscribe());
        assert!(!sub.is_active());

        service.connection().dispatch_frame(&tick_frame("EUR/USD", "1.1"));

        assert!(seen.lock().is_empty());
        assert_eq!(other.lock().len(), 1);
    }

    #[test]
    fn last_unsubscribe_drops_key_but_keeps_cache() {
        let service = service();
        let (_seen, callback) = recorder();
        let _sub = service.subscribe_to_symbol("EUR/USD", Arc::clone(&callback));
        service.connection().dispatch_frame(&tick_frame("EUR/USD", "1.1"));

        assert!(service.unsubscribe_from_symbol("EUR/USD", &callback));

        assert_eq!(service.subscriber_count("EUR/USD"), 0);
        assert_eq!(service.stats().ticks.key_count, 0);
        assert_eq!(service.get_last_price("EUR/USD").unwrap().price, dec!(1.1));
    }

    #[test]
    fn cache_populated_without_subscribers() {
        let service = service();
        service.connection().dispatch_frame(&tick_frame("GBP/USD", "1.2500"));

        let tick = service.get_last_price("GBP/USD").unwrap();
        assert_eq!(tick.symbol, "GBP/USD");
        assert_eq!(tick.price, dec!(1.25));
        assert_eq!(service.cached_symbols(), vec!["GBP/USD".to_string()]);
        assert!(service.get_last_price("USD/JPY").is_none());
    }

    #[test]
    fn local_timestamp_ignores_wire_value() {
        let service = service();
        let before = chrono::Utc::now().timestamp_millis();
        service.connection().dispatch_frame(
            r#"{"type":"marketData","data":{"symbol":"X","price":1,"bid":1,"ask":1,"volume":1,"timestamp":5}}"#,
        );

        let tick = service.get_last_price("X").unwrap();
        assert!(tick.timestamp >= before);
    }

    #[test]
    fn wire_timestamp_when_configured() {
        let connection = ConnectionManager::new(ConnectionConfig::new("ws://127.0.0.1:9"));
        let service = MarketDataService::new(
            connection,
            RegistryConfig::default().with_timestamp_source(TimestampSource::Wire),
        );

        service.connection().dispatch_frame(
            r#"{"type":"marketData","data":{"symbol":"X","price":1,"bid":1,"ask":1,"volume":1,"timestamp":5}}"#,
        );

        assert_eq!(service.get_last_price("X").unwrap().timestamp, 5);
    }

    #[test]
    fn malformed_payload_is_dropped() {
        let service = service();
        let (seen, callback) = recorder();
        let _sub = service.subscribe_to_symbol("EUR/USD", callback);

        service
            .connection()
            .dispatch_frame(r#"{"type":"marketData","data":{"symbol":"EUR/USD"}}"#);
        service.connection().dispatch_frame(&tick_frame("EUR/USD", "1.1"));

        assert_eq!(seen.lock().len(), 1);
    }

    #[test]
    fn status_is_fanned_out_and_not_cached() {
        let service = service();
        let statuses = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&statuses);
        let callback: Callback<TradingStatus> =
            Arc::new(move |s: &TradingStatus| sink.lock().push(s.status.clone()));

        service.connection().dispatch_frame(&status_frame("EUR/USD", "open"));
        let mut sub = service.subscribe_to_trading_status("EUR/USD", callback);
        assert!(statuses.lock().is_empty(), "status must not replay");

        service.connection().dispatch_frame(&status_frame("EUR/USD", "halted"));
        assert_eq!(*statuses.lock(), vec!["halted".to_string()]);
        assert_eq!(service.status_subscriber_count("EUR/USD"), 1);

        assert!(sub.unsubscribe());
        service.connection().dispatch_frame(&status_frame("EUR/USD", "open"));
        assert_eq!(statuses.lock().len(), 1);
        assert_eq!(service.status_subscriber_count("EUR/USD"), 0);
    }

    #[test]
    fn status_and_tick_channels_are_independent() {
        let service = service();
        let (seen, callback) = recorder();
        let _sub = service.subscribe_to_symbol("EUR/USD", callback);

        service.connection().dispatch_frame(&status_frame("EUR/USD", "open"));

        assert!(seen.lock().is_empty());
        assert!(service.get_last_price("EUR/USD").is_none());
    }

    #[test]
    fn callback_may_unsubscribe_itself() {
        let service = service();
        let slot: Arc<Mutex<Option<Subscription>>> = Arc::new(Mutex::new(None));
        let count = Arc::new(AtomicUsize::new(0));

        let inner_slot = Arc::clone(&slot);
        let inner_count = Arc::clone(&count);
        let callback: Callback<Tick> = Arc::new(move |_: &Tick| {
            inner_count.fetch_add(1, Ordering::SeqCst);
            if let Some(mut sub) = inner_slot.lock().take() {
                sub.unsubscribe();
            }
        });
        *slot.lock() = Some(service.subscribe_to_symbol("EUR/USD", callback));

        service.connection().dispatch_frame(&tick_frame("EUR/USD", "1.1"));
        service.connection().dispatch_frame(&tick_frame("EUR/USD", "1.2"));

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn panicking_subscriber_does_not_block_others() {
        let service = service();
        let _bad = service.subscribe_to_symbol("EUR/USD", Arc::new(|_: &Tick| panic!("boom")));
        let (seen, callback) = recorder();
        let _good = service.subscribe_to_symbol("EUR/USD", callback);

        service.connection().dispatch_frame(&tick_frame("EUR/USD", "1.1"));

        assert_eq!(seen.lock().len(), 1);
    }

    #[test]
    fn replay_never_overtakes_concurrent_push() {
        let service = service();
        let connection = Arc::clone(service.connection());
        connection.dispatch_frame(&tick_frame("EUR/USD", "1"));

        let stop = Arc::new(AtomicBool::new(false));
        let pusher = {
            let stop = Arc::clone(&stop);
            std::thread::spawn(move || {
                let mut price = 1u64;
                while !stop.load(Ordering::Relaxed) {
                    price += 1;
                    connection.dispatch_frame(&tick_frame("EUR/USD", &price.to_string()));
                }
            })
        };

        for _ in 0..20_000 {
            let (seen, callback) = recorder();
            let mut sub = service.subscribe_to_symbol("EUR/USD", callback);
            sub.unsubscribe();

            let prices: Vec<Decimal> = seen.lock().iter().map(|t| t.price).collect();
            assert!(
                prices.windows(2).all(|w| w[0] < w[1]),
                "ticks delivered out of order: {prices:?}"
            );
        }

        stop.store(true, Ordering::Relaxed);
        pusher.join().unwrap();
    }

    #[test]
    fn dropped_handle_keeps_callback_registered() {
        let service = service();
        let (seen, callback) = recorder();

        drop(service.subscribe_to_symbol("EUR/USD", Arc::clone(&callback)));
        service.connection().dispatch_frame(&tick_frame("EUR/USD", "1.1"));

        assert_eq!(seen.lock().len(), 1);
        assert!(service.unsubscribe_from_symbol("EUR/USD", &callback));
    }

    #[test]
    fn resubscribing_same_callback_replays_again() {
        let service = service();
        service.connection().dispatch_frame(&tick_frame("EUR/USD", "1.1"));
        let (seen, callback) = recorder();

        let mut first = service.subscribe_to_symbol("EUR/USD", Arc::clone(&callback));
        assert!(first.unsubscribe());
        let _second = service.subscribe_to_symbol("EUR/USD", callback);

        assert_eq!(seen.lock().len(), 2);
    }

    #[test]
    fn duplicate_subscribe_does_not_replay_twice() {
        let service = service();
        service.connection().dispatch_frame(&tick_frame("EUR/USD", "1.1"));
        let (seen, callback) = recorder();

        let _a = service.subscribe_to_symbol("EUR/USD", Arc::clone(&callback));
        let _b = service.subscribe_to_symbol("EUR/USD", callback);

        assert_eq!(seen.lock().len(), 1);
    }

    #[test]
    fn disconnect_clears_subscribers_and_cache() {
        let service = service();
        let (seen, callback) = recorder();
        let _sub = service.subscribe_to_symbol("EUR/USD", callback);
        service.connection().dispatch_frame(&tick_frame("EUR/USD", "1.1"));

        service.disconnect();
        service.disconnect();

        assert_eq!(service.stats(), RegistryStats::default());
        assert!(service.get_last_price("EUR/USD").is_none());
        assert_eq!(service.connection().handler_count(MARKET_DATA), 0);

        service.connection().dispatch_frame(&tick_frame("EUR/USD", "1.2"));
        assert_eq!(seen.lock().len(), 1);
    }

    #[test]
    fn dropping_service_releases_connection_handlers() {
        let connection = ConnectionManager::new(ConnectionConfig::new("ws://127.0.0.1:9"));
        let service = MarketDataService::new(Arc::clone(&connection), RegistryConfig::default());
        assert_eq!(connection.handler_count(MARKET_DATA), 1);

        drop(service);

        assert_eq!(connection.handler_count(MARKET_DATA), 0);
        assert_eq!(connection.handler_count(TRADING_STATUS), 0);
    }

    proptest! {
        #[test]
        fn cache_holds_most_recent_tick_per_symbol(
            ticks in prop::collection::vec((0usize..4, 1i64..1_000_000), 1..50),
            subscribe_to in prop::option::of(0usize..4),
        ) {
            const SYMBOLS: [&str; 4] = ["EUR/USD", "GBP/USD", "USD/JPY", "AUD/USD"];
            let service = service();
            let (_seen, callback) = recorder();
            let _sub = subscribe_to.map(|i| service.subscribe_to_symbol(SYMBOLS[i], callback));

            let mut expected: HashMap<&str, Decimal> = HashMap::new();
            for (idx, raw) in &ticks {
                let price = Decimal::new(*raw, 4);
                service
                    .connection()
                    .dispatch_frame(&tick_frame(SYMBOLS[*idx], &price.to_string()));
                expected.insert(SYMBOLS[*idx], price);
            }

            for symbol in SYMBOLS {
                let cached = service.get_last_price(symbol).map(|t| t.price);
                prop_assert_eq!(cached, expected.get(symbol).copied());
            }
        }
    }
}
