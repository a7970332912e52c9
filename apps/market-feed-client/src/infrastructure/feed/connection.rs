//! Feed Connection Manager
//!
//! Owns the single WebSocket session to the market data endpoint and
//! demultiplexes inbound `{type, data}` envelopes to handlers registered per
//! envelope type.
//!
//! # Lifecycle
//!
//! ```text
//!  connect()          open             close / heartbeat timeout
//! ───────────► Connecting ──────► Connected ──────────────────────► Disconnected
//!                  ▲                                                     │
//!                  └──────────── n × base_delay (n ≤ max_attempts) ──────┘
//! ```
//!
//! Once the reconnect policy is exhausted the session task exits and the
//! manager stays `Disconnected` until `connect()` is called again.
//! `disconnect()` tears the session down, clears every handler and resets
//! the attempt counter.

use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use futures_util::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_util::sync::CancellationToken;

use super::codec::{CodecError, EnvelopeCodec};
use super::heartbeat::{HeartbeatAction, HeartbeatConfig, HeartbeatMonitor};
use super::messages::Envelope;
use super::reconnect::{ReconnectConfig, ReconnectError, ReconnectPolicy};
use crate::infrastructure::metrics::{self, FrameKind};

// =============================================================================
// Error Type
// =============================================================================

/// Errors that can occur in the connection manager.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    /// `connect()` was called outside a Tokio runtime.
    #[error("no Tokio runtime available to drive the connection")]
    NoRuntime,

    /// WebSocket error.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),

    /// No frame arrived within the heartbeat timeout.
    #[error("heartbeat timeout")]
    HeartbeatTimeout,

    /// Connection closed.
    #[error("connection closed")]
    Closed,
}

// =============================================================================
// Connection State
// =============================================================================

/// Transport connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// No live session.
    #[default]
    Disconnected,
    /// Opening the WebSocket.
    Connecting,
    /// Session open and reading frames.
    Connected,
}

impl ConnectionState {
    /// Lowercase name, as used in logs.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for the connection manager.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// WebSocket URL.
    pub url: String,
    /// Reconnection configuration.
    pub reconnect: ReconnectConfig,
    /// Heartbeat configuration.
    pub heartbeat: HeartbeatConfig,
}

impl ConnectionConfig {
    /// Create a configuration with default reconnect and heartbeat settings.
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            reconnect: ReconnectConfig::default(),
            heartbeat: HeartbeatConfig::default(),
        }
    }

    /// Create configuration from `FeedSettings`.
    #[must_use]
    pub fn from_feed_settings(settings: &crate::FeedSettings) -> Self {
        Self {
            url: settings.url.clone(),
            reconnect: ReconnectConfig::from_feed_settings(settings),
            heartbeat: HeartbeatConfig::from_feed_settings(settings),
        }
    }

    /// Override the reconnection configuration.
    #[must_use]
    pub const fn with_reconnect(mut self, reconnect: ReconnectConfig) -> Self {
        self.reconnect = reconnect;
        self
    }

    /// Override the heartbeat configuration.
    #[must_use]
    pub const fn with_heartbeat(mut self, heartbeat: HeartbeatConfig) -> Self {
        self.heartbeat = heartbeat;
        self
    }
}

// =============================================================================
// Handlers
// =============================================================================

/// Callback invoked with the `data` field of a matching envelope.
pub type EnvelopeHandler = Arc<dyn Fn(&serde_json::Value) + Send + Sync>;

/// Opaque token identifying one handler registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

type DispatchTable = HashMap<String, Vec<(HandlerId, EnvelopeHandler)>>;

struct Session {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

// =============================================================================
// Connection Manager
// =============================================================================

/// Single-connection WebSocket client with per-type envelope dispatch.
pub struct ConnectionManager {
    config: ConnectionConfig,
    codec: EnvelopeCodec,
    handlers: RwLock<DispatchTable>,
    next_handler_id: AtomicU64,
    state: RwLock<ConnectionState>,
    session: Mutex<Option<Session>>,
    reconnect: Mutex<ReconnectPolicy>,
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("url", &self.config.url)
            .field("state", &self.state())
            .field("reconnect_attempts", &self.reconnect_attempts())
            .finish_non_exhaustive()
    }
}

impl ConnectionManager {
    /// Create a manager. No connection is opened until [`connect`](Self::connect).
    #[must_use]
    pub fn new(config: ConnectionConfig) -> Arc<Self> {
        let reconnect = ReconnectPolicy::new(config.reconnect.clone());
        Arc::new(Self {
            config,
            codec: EnvelopeCodec::new(),
            handlers: RwLock::new(HashMap::new()),
            next_handler_id: AtomicU64::new(1),
            state: RwLock::new(ConnectionState::Disconnected),
            session: Mutex::new(None),
            reconnect: Mutex::new(reconnect),
        })
    }

    /// Endpoint this manager connects to.
    #[must_use]
    pub fn url(&self) -> &str {
        &self.config.url
    }

    /// Current connection state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.state.read()
    }

    /// Consecutive reconnection attempts since the last successful open.
    #[must_use]
    pub fn reconnect_attempts(&self) -> u32 {
        self.reconnect.lock().attempt_count()
    }

    /// Open the session if none is running.
    ///
    /// Returns immediately; the connection is driven by a spawned task. While
    /// a session task is alive (connected or between reconnect attempts) this
    /// is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectionError::NoRuntime`] when called outside a Tokio runtime.
    pub fn connect(self: &Arc<Self>) -> Result<(), ConnectionError> {
        let mut session = self.session.lock();

        if session.as_ref().is_some_and(|s| !s.handle.is_finished()) {
            tracing::debug!(url = %self.config.url, "Session already running");
            return Ok(());
        }

        let runtime =
            tokio::runtime::Handle::try_current().map_err(|_| ConnectionError::NoRuntime)?;

        let cancel = CancellationToken::new();
        let handle = runtime.spawn(Arc::clone(self).run(cancel.clone()));
        *session = Some(Session { cancel, handle });
        drop(session);

        Ok(())
    }

    /// Tear down the session, clear every handler and reset the reconnect counter.
    ///
    /// Idempotent.
    pub fn disconnect(&self) {
        if let Some(session) = self.session.lock().take() {
            session.cancel.cancel();
            tracing::info!(url = %self.config.url, "Disconnecting from feed");
        }

        self.handlers.write().clear();
        self.reconnect.lock().reset();
        self.set_state(ConnectionState::Disconnected);
    }

    // -------------------------------------------------------------------------
    // Dispatch table
    // -------------------------------------------------------------------------

    /// Register `handler` for every future envelope of type `kind`.
    pub fn subscribe<F>(&self, kind: impl Into<String>, handler: F) -> HandlerId
    where
        F: Fn(&serde_json::Value) + Send + Sync + 'static,
    {
        let id = HandlerId(self.next_handler_id.fetch_add(1, Ordering::Relaxed));
        let kind = kind.into();
        tracing::debug!(kind = %kind, handler = id.0, "Registering envelope handler");

        self.handlers
            .write()
            .entry(kind)
            .or_default()
            .push((id, Arc::new(handler)));
        id
    }

    /// Remove a handler. Returns `false` if it was not registered for `kind`.
    pub fn unsubscribe(&self, kind: &str, id: HandlerId) -> bool {
        let mut handlers = self.handlers.write();
        let Some(list) = handlers.get_mut(kind) else {
            return false;
        };

        let before = list.len();
        list.retain(|(existing, _)| *existing != id);
        let removed = list.len() != before;

        if list.is_empty() {
            handlers.remove(kind);
        }
        removed
    }

    /// Number of handlers registered for `kind`.
    #[must_use]
    pub fn handler_count(&self, kind: &str) -> usize {
        self.handlers.read().get(kind).map_or(0, Vec::len)
    }

    /// Decode one text frame and dispatch it.
    ///
    /// Returns the number of handlers invoked; malformed frames and unknown
    /// types dispatch to nobody.
    pub fn dispatch_frame(&self, text: &str) -> usize {
        self.dispatch_decoded(self.codec.decode(text))
    }

    /// Decode one binary frame holding UTF-8 JSON and dispatch it.
    pub fn dispatch_binary(&self, data: &[u8]) -> usize {
        self.dispatch_decoded(self.codec.decode_binary(data))
    }

    /// Dispatch an already decoded envelope.
    pub fn dispatch(&self, envelope: &Envelope) -> usize {
        let handlers: Vec<EnvelopeHandler> = self
            .handlers
            .read()
            .get(&envelope.kind)
            .map(|list| list.iter().map(|(_, h)| Arc::clone(h)).collect())
            .unwrap_or_default();

        tracing::trace!(kind = %envelope.kind, handlers = handlers.len(), "Dispatching envelope");

        for handler in &handlers {
            if catch_unwind(AssertUnwindSafe(|| handler(&envelope.data))).is_err() {
                tracing::error!(kind = %envelope.kind, "Envelope handler panicked");
                metrics::record_handler_panic(&envelope.kind);
            }
        }

        metrics::record_dispatch(&envelope.kind, handlers.len());
        handlers.len()
    }

    fn dispatch_decoded(&self, decoded: Result<Envelope, CodecError>) -> usize {
        match decoded {
            Ok(envelope) => self.dispatch(&envelope),
            Err(e) => {
                tracing::warn!(error = %e, "Dropping malformed frame");
                metrics::record_malformed_frame();
                0
            }
        }
    }

    fn set_state(&self, state: ConnectionState) {
        let previous = std::mem::replace(&mut *self.state.write(), state);
        if previous != state {
            tracing::debug!(from = %previous, to = %state, "Connection state changed");
            metrics::set_connection_state(state);
        }
    }

    // -------------------------------------------------------------------------
    // Session task
    // -------------------------------------------------------------------------

    /// Connection loop: one session at a time, bounded linear backoff between them.
    async fn run(self: Arc<Self>, cancel: CancellationToken) {
        loop {
            if cancel.is_cancelled() {
                return;
            }

            self.set_state(ConnectionState::Connecting);

            match self.connect_and_run(&cancel).await {
                Ok(()) => {
                    tracing::info!(url = %self.config.url, "Feed session cancelled");
                    return;
                }
                Err(e) => {
                    if cancel.is_cancelled() {
                        return;
                    }
                    tracing::warn!(url = %self.config.url, error = %e, "Feed connection closed");
                    self.set_state(ConnectionState::Disconnected);

                    let next = {
                        let mut policy = self.reconnect.lock();
                        policy
                            .next_delay()
                            .map(|delay| (delay, policy.attempt_count()))
                    };

                    let Some((delay, attempt)) = next else {
                        let err = ReconnectError::MaxAttemptsExceeded(
                            self.config.reconnect.max_attempts,
                        );
                        tracing::error!(url = %self.config.url, error = %err, "Max reconnect attempts reached");
                        return;
                    };

                    tracing::info!(
                        attempt,
                        delay_ms = delay.as_millis(),
                        "Reconnecting to feed"
                    );
                    metrics::record_reconnect();

                    tokio::select! {
                        () = cancel.cancelled() => return,
                        () = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    /// Open one WebSocket session and read until close, timeout or cancellation.
    ///
    /// `Ok(())` means the session was cancelled; every other exit is an error
    /// that drives reconnection.
    async fn connect_and_run(&self, cancel: &CancellationToken) -> Result<(), ConnectionError> {
        tracing::info!(url = %self.config.url, "Connecting to feed");

        let connected = tokio::select! {
            () = cancel.cancelled() => return Ok(()),
            result = tokio_tungstenite::connect_async(self.config.url.as_str()) => result,
        };
        let (ws_stream, _response) = connected?;
        let (mut write, mut read) = ws_stream.split();

        if cancel.is_cancelled() {
            let _ = write.send(Message::Close(None)).await;
            return Ok(());
        }

        self.reconnect.lock().reset();
        self.set_state(ConnectionState::Connected);
        tracing::info!(url = %self.config.url, "Feed connected");

        let mut monitor = HeartbeatMonitor::new(self.config.heartbeat.clone());
        let mut ticker = heartbeat_ticker(&self.config.heartbeat);

        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    let _ = write.send(Message::Close(None)).await;
                    return Ok(());
                }
                () = next_tick(ticker.as_mut()) => {
                    match monitor.on_tick() {
                        HeartbeatAction::SendPing => {
                            write.send(Message::Ping(tungstenite::Bytes::new())).await?;
                        }
                        HeartbeatAction::Timeout => {
                            tracing::warn!(
                                silent_ms = monitor.time_since_activity().as_millis(),
                                "Heartbeat timeout"
                            );
                            return Err(ConnectionError::HeartbeatTimeout);
                        }
                    }
                }
                msg = read.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            monitor.record_activity();
                            metrics::record_frame_received(FrameKind::Text);
                            self.dispatch_frame(&text);
                        }
                        Some(Ok(Message::Binary(data))) => {
                            monitor.record_activity();
                            metrics::record_frame_received(FrameKind::Binary);
                            self.dispatch_binary(&data);
                        }
                        Some(Ok(Message::Ping(data))) => {
                            monitor.record_activity();
                            metrics::record_frame_received(FrameKind::Ping);
                            write.send(Message::Pong(data)).await?;
                        }
                        Some(Ok(Message::Pong(_))) => {
                            monitor.record_activity();
                            metrics::record_frame_received(FrameKind::Pong);
                        }
                        Some(Ok(Message::Close(frame))) => {
                            tracing::info!(?frame, "Server sent close frame");
                            return Err(ConnectionError::Closed);
                        }
                        Some(Ok(Message::Frame(_))) => {}
                        Some(Err(e)) if is_terminal(&e) => {
                            return Err(e.into());
                        }
                        Some(Err(e)) => {
                            tracing::warn!(error = %e, "WebSocket error");
                        }
                        None => {
                            tracing::info!("WebSocket stream ended");
                            return Err(ConnectionError::Closed);
                        }
                    }
                }
            }
        }
    }
}

/// Whether tungstenite can keep reading after `error`.
const fn is_terminal(error: &tungstenite::Error) -> bool {
    !matches!(
        error,
        tungstenite::Error::Utf8 { .. } | tungstenite::Error::Capacity { .. }
    )
}

fn heartbeat_ticker(config: &HeartbeatConfig) -> Option<Interval> {
    if !config.is_enabled() {
        return None;
    }

    let mut interval = tokio::time::interval_at(
        Instant::now() + config.ping_interval,
        config.ping_interval,
    );
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    Some(interval)
}

async fn next_tick(ticker: Option<&mut Interval>) {
    match ticker {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn manager() -> Arc<ConnectionManager> {
        ConnectionManager::new(ConnectionConfig::new("ws://127.0.0.1:9"))
    }

    fn counter() -> (Arc<AtomicUsize>, impl Fn(&serde_json::Value) + Send + Sync + 'static) {
        let count = Arc::new(AtomicUsize::new(0));
        let inner = Arc::clone(&count);
        (count, move |_: &serde_json::Value| {
            inner.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn new_manager_is_disconnected() {
        let manager = manager();
        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert_eq!(manager.reconnect_attempts(), 0);
        assert_eq!(manager.url(), "ws://127.0.0.1:9");
    }

    #[test]
    fn dispatch_routes_by_type() {
        let manager = manager();
        let (market, on_market) = counter();
        let (status, on_status) = counter();
        manager.subscribe("marketData", on_market);
        manager.subscribe("tradingStatus", on_status);

        let invoked =
            manager.dispatch_frame(r#"{"type":"marketData","data":{"symbol":"EUR/USD"}}"#);

        assert_eq!(invoked, 1);
        assert_eq!(market.load(Ordering::SeqCst), 1);
        assert_eq!(status.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn handler_receives_data_field() {
        let manager = manager();
        let seen = Arc::new(Mutex::new(None));
        let sink = Arc::clone(&seen);
        manager.subscribe("tradingStatus", move |data| {
            *sink.lock() = Some(data.clone());
        });

        manager.dispatch_frame(r#"{"type":"tradingStatus","payload":{"symbol":"X","status":"halted"}}"#);

        let data = seen.lock().clone().unwrap();
        assert_eq!(data["status"], "halted");
    }

    #[test]
    fn malformed_frame_dispatches_nothing_and_stream_continues() {
        let manager = manager();
        let (count, handler) = counter();
        manager.subscribe("marketData", handler);

        assert_eq!(manager.dispatch_frame("not-json"), 0);
        assert_eq!(manager.dispatch_frame(r#"{"type":"marketData","data":{}}"#), 1);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unknown_type_dispatches_to_nobody() {
        let manager = manager();
        let (count, handler) = counter();
        manager.subscribe("marketData", handler);

        assert_eq!(manager.dispatch_frame(r#"{"type":"news","data":{}}"#), 0);
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn binary_frames_dispatch_when_utf8() {
        let manager = manager();
        let (count, handler) = counter();
        manager.subscribe("marketData", handler);

        assert_eq!(manager.dispatch_binary(br#"{"type":"marketData","data":{}}"#), 1);
        assert_eq!(manager.dispatch_binary(&[0xff, 0x00]), 0);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unsubscribe_removes_only_that_handler() {
        let manager = manager();
        let (first, on_first) = counter();
        let (second, on_second) = counter();
        let id = manager.subscribe("marketData", on_first);
        manager.subscribe("marketData", on_second);

        assert!(manager.unsubscribe("marketData", id));
        assert!(!manager.unsubscribe("marketData", id));
        assert!(!manager.unsubscribe("tradingStatus", id));

        manager.dispatch_frame(r#"{"type":"marketData","data":{}}"#);
        assert_eq!(first.load(Ordering::SeqCst), 0);
        assert_eq!(second.load(Ordering::SeqCst), 1);
        assert_eq!(manager.handler_count("marketData"), 1);
    }

    #[test]
    fn panicking_handler_does_not_starve_others() {
        let manager = manager();
        manager.subscribe("marketData", |_| panic!("boom"));
        let (count, handler) = counter();
        manager.subscribe("marketData", handler);

        assert_eq!(manager.dispatch_frame(r#"{"type":"marketData","data":{}}"#), 2);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn handler_may_subscribe_reentrantly() {
        let manager = manager();
        let inner = Arc::clone(&manager);
        manager.subscribe("marketData", move |_| {
            inner.subscribe("tradingStatus", |_| {});
        });

        manager.dispatch_frame(r#"{"type":"marketData","data":{}}"#);
        assert_eq!(manager.handler_count("tradingStatus"), 1);
    }

    #[test]
    fn disconnect_clears_handlers_and_is_idempotent() {
        let manager = manager();
        manager.subscribe("marketData", |_| {});

        manager.disconnect();
        manager.disconnect();

        assert_eq!(manager.handler_count("marketData"), 0);
        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert_eq!(manager.dispatch_frame(r#"{"type":"marketData","data":{}}"#), 0);
    }

    #[test]
    fn connect_outside_runtime_fails() {
        let manager = manager();
        assert!(matches!(manager.connect(), Err(ConnectionError::NoRuntime)));
    }

    #[test]
    fn terminal_error_classification() {
        assert!(is_terminal(&tungstenite::Error::ConnectionClosed));
        assert!(is_terminal(&tungstenite::Error::AlreadyClosed));
        assert!(!is_terminal(&tungstenite::Error::Capacity(
            tungstenite::error::CapacityError::MessageTooLong {
                size: 2,
                max_size: 1,
            }
        )));
    }

    #[tokio::test]
    async fn heartbeat_disabled_never_ticks() {
        assert!(heartbeat_ticker(&HeartbeatConfig::disabled()).is_none());

        let fired = tokio::time::timeout(
            std::time::Duration::from_millis(20),
            next_tick(None),
        )
        .await;
        assert!(fired.is_err());
    }
}
