//! Heartbeat Monitor
//!
//! Tracks connection liveness through periodic ping/pong. The session loop
//! owns the timer and asks the monitor what to do on every tick; a timeout
//! is treated exactly like a close event.

use std::time::{Duration, Instant};

/// Configuration for heartbeat behavior.
#[derive(Debug, Clone)]
pub struct HeartbeatConfig {
    /// Interval between ping messages (`Duration::ZERO` disables the heartbeat).
    pub ping_interval: Duration,
    /// Silence after a ping before the connection is considered dead.
    pub pong_timeout: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_secs(30),
            pong_timeout: Duration::from_secs(60),
        }
    }
}

impl HeartbeatConfig {
    /// Create a new configuration with custom values.
    #[must_use]
    pub const fn new(ping_interval: Duration, pong_timeout: Duration) -> Self {
        Self {
            ping_interval,
            pong_timeout,
        }
    }

    /// Configuration with the heartbeat switched off.
    #[must_use]
    pub const fn disabled() -> Self {
        Self {
            ping_interval: Duration::ZERO,
            pong_timeout: Duration::ZERO,
        }
    }

    /// Create configuration from `FeedSettings`.
    #[must_use]
    pub const fn from_feed_settings(settings: &crate::FeedSettings) -> Self {
        Self {
            ping_interval: settings.heartbeat_interval,
            pong_timeout: settings.heartbeat_timeout,
        }
    }

    /// Whether pings should be sent at all.
    #[must_use]
    pub const fn is_enabled(&self) -> bool {
        !self.ping_interval.is_zero()
    }
}

/// What the session should do on a heartbeat tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatAction {
    /// Send a ping frame.
    SendPing,
    /// Nothing heard back in time; treat the connection as closed.
    Timeout,
}

/// Per-session liveness state.
#[derive(Debug)]
pub struct HeartbeatMonitor {
    config: HeartbeatConfig,
    last_activity: Instant,
    waiting_for_pong: bool,
}

impl HeartbeatMonitor {
    /// Create a monitor for a freshly opened session.
    #[must_use]
    pub fn new(config: HeartbeatConfig) -> Self {
        Self {
            config,
            last_activity: Instant::now(),
            waiting_for_pong: false,
        }
    }

    /// Record inbound traffic (any frame counts as proof of life).
    pub fn record_activity(&mut self) {
        self.last_activity = Instant::now();
        self.waiting_for_pong = false;
    }

    /// Decide what to do on a timer tick.
    pub fn on_tick(&mut self) -> HeartbeatAction {
        self.on_tick_at(Instant::now())
    }

    fn on_tick_at(&mut self, now: Instant) -> HeartbeatAction {
        if self.waiting_for_pong
            && now.saturating_duration_since(self.last_activity) > self.config.pong_timeout
        {
            return HeartbeatAction::Timeout;
        }

        self.waiting_for_pong = true;
        HeartbeatAction::SendPing
    }

    /// Whether a ping is outstanding.
    #[must_use]
    pub const fn is_waiting_for_pong(&self) -> bool {
        self.waiting_for_pong
    }

    /// Time since the last inbound frame.
    #[must_use]
    pub fn time_since_activity(&self) -> Duration {
        self.last_activity.elapsed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_values() {
        let config = HeartbeatConfig::default();
        assert_eq!(config.ping_interval, Duration::from_secs(30));
        assert_eq!(config.pong_timeout, Duration::from_secs(60));
        assert!(config.is_enabled());
        assert!(!HeartbeatConfig::disabled().is_enabled());
    }

    #[test]
    fn first_tick_sends_ping() {
        let mut monitor = HeartbeatMonitor::new(HeartbeatConfig::default());
        assert_eq!(monitor.on_tick(), HeartbeatAction::SendPing);
        assert!(monitor.is_waiting_for_pong());
    }

    #[test]
    fn activity_clears_outstanding_ping() {
        let mut monitor = HeartbeatMonitor::new(HeartbeatConfig::default());
        monitor.on_tick();

        monitor.record_activity();

        assert!(!monitor.is_waiting_for_pong());
        assert!(monitor.time_since_activity() < Duration::from_secs(1));
    }

    #[test]
    fn silence_past_timeout_times_out() {
        let config = HeartbeatConfig::new(Duration::from_millis(10), Duration::from_millis(50));
        let mut monitor = HeartbeatMonitor::new(config);
        let start = monitor.last_activity;

        assert_eq!(monitor.on_tick_at(start), HeartbeatAction::SendPing);
        assert_eq!(
            monitor.on_tick_at(start + Duration::from_millis(20)),
            HeartbeatAction::SendPing
        );
        assert_eq!(
            monitor.on_tick_at(start + Duration::from_millis(100)),
            HeartbeatAction::Timeout
        );
    }

    #[test]
    fn no_timeout_without_outstanding_ping() {
        let config = HeartbeatConfig::new(Duration::from_millis(10), Duration::from_millis(50));
        let mut monitor = HeartbeatMonitor::new(config);
        let start = monitor.last_activity;

        // Long gap, but no ping was outstanding yet
        assert_eq!(
            monitor.on_tick_at(start + Duration::from_secs(5)),
            HeartbeatAction::SendPing
        );
    }
}
