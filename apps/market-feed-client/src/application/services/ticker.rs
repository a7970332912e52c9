//! Ticker Feed
//!
//! Per-consumer view of one symbol. A `TickerFeed` subscribes to the
//! [`MarketDataService`], derives `change`/`change_percent` from the previous
//! tick *this instance* saw, optionally re-emits the cached tick on a fixed
//! interval, and exposes its latest data, status and error.
//!
//! # State machine
//!
//! ```text
//! Inactive ──subscribe()──► Subscribing ──► Active ──unsubscribe()/drop──► Inactive
//!                                            │  ▲
//!                                            └──┘ every tick
//! ```
//!
//! Errors never tear the subscription down; they are reported through
//! `on_error` and [`TickerFeed::error`], and the next tick clears them.

use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use rust_decimal::Decimal;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use super::market_data_service::{MarketDataService, Subscription};
use crate::domain::market_data::{PricedTick, Symbol, Tick, TradingStatus};
use crate::domain::subscription::Callback;

/// Status reported before any trading status update has arrived.
pub const UNKNOWN_STATUS: &str = "unknown";

// =============================================================================
// Errors
// =============================================================================

/// Consumer-level ticker errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TickerError {
    /// Polling was requested outside a Tokio runtime.
    #[error("polling requires a Tokio runtime")]
    NoRuntime,

    /// Subscribe was attempted with an empty symbol.
    #[error("cannot subscribe to an empty symbol")]
    EmptySymbol,
}

// =============================================================================
// Options
// =============================================================================

/// Callback for derived ticks.
pub type UpdateCallback = Arc<dyn Fn(&PricedTick) + Send + Sync>;

/// Callback for consumer-level errors.
pub type ErrorCallback = Arc<dyn Fn(&TickerError) + Send + Sync>;

/// Options for a [`TickerFeed`].
#[derive(Clone)]
pub struct TickerOptions {
    auto_subscribe: bool,
    include_trading_status: bool,
    update_interval: Duration,
    on_update: Option<UpdateCallback>,
    on_error: Option<ErrorCallback>,
}

impl Default for TickerOptions {
    fn default() -> Self {
        Self {
            auto_subscribe: true,
            include_trading_status: false,
            update_interval: Duration::ZERO,
            on_update: None,
            on_error: None,
        }
    }
}

impl std::fmt::Debug for TickerOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TickerOptions")
            .field("auto_subscribe", &self.auto_subscribe)
            .field("include_trading_status", &self.include_trading_status)
            .field("update_interval", &self.update_interval)
            .field("on_update", &self.on_update.is_some())
            .field("on_error", &self.on_error.is_some())
            .finish()
    }
}

impl TickerOptions {
    /// Default options: auto-subscribe, push only, no status.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe on construction and after symbol/option changes.
    #[must_use]
    pub const fn auto_subscribe(mut self, enabled: bool) -> Self {
        self.auto_subscribe = enabled;
        self
    }

    /// Also follow the symbol's trading status.
    #[must_use]
    pub const fn include_trading_status(mut self, enabled: bool) -> Self {
        self.include_trading_status = enabled;
        self
    }

    /// Re-emit the cached tick every `interval` (`Duration::ZERO` disables).
    #[must_use]
    pub const fn update_interval(mut self, interval: Duration) -> Self {
        self.update_interval = interval;
        self
    }

    /// Called with every derived tick.
    #[must_use]
    pub fn on_update<F>(mut self, callback: F) -> Self
    where
        F: Fn(&PricedTick) + Send + Sync + 'static,
    {
        self.on_update = Some(Arc::new(callback));
        self
    }

    /// Called with every consumer-level error.
    #[must_use]
    pub fn on_error<F>(mut self, callback: F) -> Self
    where
        F: Fn(&TickerError) + Send + Sync + 'static,
    {
        self.on_error = Some(Arc::new(callback));
        self
    }
}

// =============================================================================
// State
// =============================================================================

/// Activation phase of a ticker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickerPhase {
    /// Not subscribed.
    Inactive,
    /// Registering with the service.
    Subscribing,
    /// Subscribed and receiving ticks.
    Active,
}

struct TickerState {
    symbol: Symbol,
    options: TickerOptions,
    phase: TickerPhase,
    generation: u64,
    data: Option<PricedTick>,
    previous_price: Option<Decimal>,
    status: String,
    error: Option<TickerError>,
    tick_subscription: Option<Subscription>,
    status_subscription: Option<Subscription>,
    poll: Option<CancellationToken>,
}

impl TickerState {
    /// Tear down everything tied to the current activation.
    ///
    /// Returns the handles so they can be released after the lock is dropped.
    fn deactivate(&mut self) -> Option<Teardown> {
        if self.phase == TickerPhase::Inactive {
            return None;
        }

        self.phase = TickerPhase::Inactive;
        self.generation += 1;

        Some(Teardown {
            tick: self.tick_subscription.take(),
            status: self.status_subscription.take(),
            poll: self.poll.take(),
        })
    }
}

struct Teardown {
    tick: Option<Subscription>,
    status: Option<Subscription>,
    poll: Option<CancellationToken>,
}

impl Teardown {
    fn release(self) {
        if let Some(mut sub) = self.tick {
            sub.unsubscribe();
        }
        if let Some(mut sub) = self.status {
            sub.unsubscribe();
        }
        if let Some(poll) = self.poll {
            poll.cancel();
        }
    }
}

// =============================================================================
// Ticker Feed
// =============================================================================

/// Per-consumer derived view of one symbol.
pub struct TickerFeed {
    service: Arc<MarketDataService>,
    state: Arc<Mutex<TickerState>>,
}

impl std::fmt::Debug for TickerFeed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("TickerFeed")
            .field("symbol", &state.symbol)
            .field("phase", &state.phase)
            .field("status", &state.status)
            .field("options", &state.options)
            .finish_non_exhaustive()
    }
}

impl TickerFeed {
    /// Create a ticker for `symbol`, subscribing right away if
    /// `auto_subscribe` is set.
    #[must_use]
    pub fn new(
        service: Arc<MarketDataService>,
        symbol: impl Into<Symbol>,
        options: TickerOptions,
    ) -> Self {
        let auto_subscribe = options.auto_subscribe;
        let feed = Self {
            service,
            state: Arc::new(Mutex::new(TickerState {
                symbol: symbol.into(),
                options,
                phase: TickerPhase::Inactive,
                generation: 0,
                data: None,
                previous_price: None,
                status: UNKNOWN_STATUS.to_string(),
                error: None,
                tick_subscription: None,
                status_subscription: None,
                poll: None,
            })),
        };

        if auto_subscribe {
            feed.subscribe();
        }
        feed
    }

    // -------------------------------------------------------------------------
    // Accessors
    // -------------------------------------------------------------------------

    /// Symbol this ticker follows.
    #[must_use]
    pub fn symbol(&self) -> Symbol {
        self.state.lock().symbol.clone()
    }

    /// Latest derived tick.
    #[must_use]
    pub fn data(&self) -> Option<PricedTick> {
        self.state.lock().data.clone()
    }

    /// Latest trading status, `"unknown"` until one arrives.
    #[must_use]
    pub fn status(&self) -> String {
        self.state.lock().status.clone()
    }

    /// Whether the ticker is subscribed.
    #[must_use]
    pub fn is_subscribed(&self) -> bool {
        self.state.lock().phase != TickerPhase::Inactive
    }

    /// Current activation phase.
    #[must_use]
    pub fn phase(&self) -> TickerPhase {
        self.state.lock().phase
    }

    /// Last consumer-level error, cleared by the next tick.
    #[must_use]
    pub fn error(&self) -> Option<TickerError> {
        self.state.lock().error.clone()
    }

    /// Cached tick for this ticker's symbol; no network activity.
    #[must_use]
    pub fn last_price(&self) -> Option<Tick> {
        let symbol = self.symbol();
        self.service.get_last_price(&symbol)
    }

    // -------------------------------------------------------------------------
    // Activation
    // -------------------------------------------------------------------------

    /// Subscribe to ticks, status (if enabled) and start polling (if enabled).
    ///
    /// No-op while already subscribed.
    pub fn subscribe(&self) {
        let (symbol, options, generation) = {
            let mut state = self.state.lock();
            if state.phase != TickerPhase::Inactive {
                return;
            }
            if state.symbol.is_empty() {
                drop(state);
                self.report_error(TickerError::EmptySymbol);
                return;
            }

            state.phase = TickerPhase::Subscribing;
            state.generation += 1;
            (state.symbol.clone(), state.options.clone(), state.generation)
        };

        tracing::debug!(symbol = %symbol, generation, "Ticker subscribing");

        // The service may replay the cached tick synchronously, so no state
        // lock is held across these calls.
        let weak = Arc::downgrade(&self.state);
        let on_tick: Callback<Tick> = Arc::new(move |tick: &Tick| {
            handle_tick(&weak, generation, tick);
        });
        let tick_subscription = self.service.subscribe_to_symbol(&symbol, on_tick);

        let status_subscription = options.include_trading_status.then(|| {
            let weak = Arc::downgrade(&self.state);
            let on_status: Callback<TradingStatus> =
                Arc::new(move |status: &TradingStatus| {
                    handle_status(&weak, generation, status);
                });
            self.service.subscribe_to_trading_status(&symbol, on_status)
        });

        let (poll, poll_error) = if options.update_interval.is_zero() {
            (None, None)
        } else {
            match self.spawn_poll(&symbol, generation, options.update_interval) {
                Ok(token) => (Some(token), None),
                Err(e) => (None, Some(e)),
            }
        };

        let stale = {
            let mut state = self.state.lock();
            if state.generation == generation {
                state.tick_subscription = Some(tick_subscription);
                state.status_subscription = status_subscription;
                state.poll = poll;
                state.phase = TickerPhase::Active;
                None
            } else {
                Some(Teardown {
                    tick: Some(tick_subscription),
                    status: status_subscription,
                    poll,
                })
            }
        };

        if let Some(teardown) = stale {
            teardown.release();
            return;
        }

        if let Some(e) = poll_error {
            self.report_error(e);
        }
    }

    /// Release the tick subscription, the status subscription and the poll
    /// timer together. No-op while inactive.
    pub fn unsubscribe(&self) {
        let teardown = self.state.lock().deactivate();
        if let Some(teardown) = teardown {
            tracing::debug!(symbol = %self.symbol(), "Ticker unsubscribed");
            teardown.release();
        }
    }

    /// Follow a different symbol.
    ///
    /// Deactivates, forgets the previous price, data and status, then
    /// resubscribes if `auto_subscribe` is set.
    pub fn set_symbol(&self, symbol: impl Into<Symbol>) {
        let symbol = symbol.into();
        if self.state.lock().symbol == symbol {
            return;
        }

        self.unsubscribe();

        let auto_subscribe = {
            let mut state = self.state.lock();
            state.symbol = symbol;
            state.previous_price = None;
            state.data = None;
            state.status = UNKNOWN_STATUS.to_string();
            state.error = None;
            state.options.auto_subscribe
        };

        if auto_subscribe {
            self.subscribe();
        }
    }

    /// Replace the options.
    ///
    /// Deactivates, then resubscribes if the new options enable
    /// `auto_subscribe`. The previous price is kept.
    pub fn set_options(&self, options: TickerOptions) {
        self.unsubscribe();

        let auto_subscribe = options.auto_subscribe;
        self.state.lock().options = options;

        if auto_subscribe {
            self.subscribe();
        }
    }

    fn spawn_poll(
        &self,
        symbol: &str,
        generation: u64,
        interval: Duration,
    ) -> Result<CancellationToken, TickerError> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| TickerError::NoRuntime)?;

        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let service = Arc::clone(&self.service);
        let state = Arc::downgrade(&self.state);
        let symbol = symbol.to_string();

        runtime.spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    () = token.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Some(tick) = service.get_last_price(&symbol) {
                            handle_tick(&state, generation, &tick);
                        }
                    }
                }
            }
        });

        Ok(cancel)
    }

    fn report_error(&self, error: TickerError) {
        let on_error = {
            let mut state = self.state.lock();
            tracing::warn!(symbol = %state.symbol, error = %error, "Ticker error");
            state.error = Some(error.clone());
            state.options.on_error.clone()
        };

        if let Some(on_error) = on_error {
            on_error(&error);
        }
    }
}

impl Drop for TickerFeed {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

fn handle_tick(state: &Weak<Mutex<TickerState>>, generation: u64, tick: &Tick) {
    let Some(state) = state.upgrade() else {
        return;
    };

    let (priced, on_update) = {
        let mut state = state.lock();
        if state.generation != generation || state.phase == TickerPhase::Inactive {
            return;
        }

        let priced = match state.previous_price {
            Some(previous) => PricedTick::against(tick.clone(), previous),
            None => PricedTick::first(tick.clone()),
        };
        state.previous_price = Some(tick.price);
        state.data = Some(priced.clone());
        state.error = None;
        (priced, state.options.on_update.clone())
    };

    if let Some(on_update) = on_update {
        on_update(&priced);
    }
}

fn handle_status(state: &Weak<Mutex<TickerState>>, generation: u64, status: &TradingStatus) {
    let Some(state) = state.upgrade() else {
        return;
    };

    let mut state = state.lock();
    if state.generation == generation && state.phase != TickerPhase::Inactive {
        state.status.clone_from(&status.status);
    }
}
