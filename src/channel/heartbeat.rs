//! Application-level liveness checks.
//!
//! The monitor does not own a timer. It exposes its next deadline and the
//! channel driver calls [`HeartbeatMonitor::tick`] when that deadline passes.
//!
//! # Staleness
//!
//! A tick that finds the previous probe still unanswered (no inbound frame of
//! any kind since it was sent) reports [`HeartbeatAction::Stale`]. Otherwise it
//! reports [`HeartbeatAction::Probe`] and the caller sends a heartbeat frame.

// ============================================================================
// Imports
// ============================================================================

use std::time::Duration;

use tokio::time::Instant;

// ============================================================================
// HeartbeatAction
// ============================================================================

/// What the caller must do after a tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatAction {
    /// Not running or not due yet.
    Idle,
    /// Send a heartbeat frame.
    Probe,
    /// Connection is silent; force it closed.
    Stale,
}

// ============================================================================
// HeartbeatMonitor
// ============================================================================

/// Heartbeat schedule for one connection at a time.
#[derive(Debug, Clone)]
pub struct HeartbeatMonitor {
    /// Tick period.
    interval: Duration,
    /// Next tick, `None` while stopped.
    next_tick: Option<Instant>,
    /// Inbound frames seen since `start`.
    inbound: u64,
    /// Value of `inbound` when the outstanding probe was sent.
    probe_mark: Option<u64>,
}

impl HeartbeatMonitor {
    /// Creates a stopped monitor.
    #[inline]
    #[must_use]
    pub const fn new(interval: Duration) -> Self {
        Self {
            interval,
            next_tick: None,
            inbound: 0,
            probe_mark: None,
        }
    }

    /// Returns the tick period.
    #[inline]
    #[must_use]
    pub const fn interval(&self) -> Duration {
        self.interval
    }

    /// Returns `true` while running.
    #[inline]
    #[must_use]
    pub const fn is_running(&self) -> bool {
        self.next_tick.is_some()
    }

    /// Returns the next tick, if running.
    #[inline]
    #[must_use]
    pub const fn deadline(&self) -> Option<Instant> {
        self.next_tick
    }

    /// Starts ticking one interval from `now`, forgetting earlier state.
    pub fn start(&mut self, now: Instant) {
        self.next_tick = Some(now + self.interval);
        self.inbound = 0;
        self.probe_mark = None;
    }

    /// Stops ticking and clears the outstanding probe.
    pub fn stop(&mut self) {
        self.next_tick = None;
        self.probe_mark = None;
    }

    /// Records an inbound frame.
    #[inline]
    pub fn record_inbound(&mut self) {
        self.inbound = self.inbound.wrapping_add(1);
    }

    /// Advances the schedule.
    ///
    /// Stops the monitor when reporting [`HeartbeatAction::Stale`].
    pub fn tick(&mut self, now: Instant) -> HeartbeatAction {
        let Some(due) = self.next_tick else {
            return HeartbeatAction::Idle;
        };
        if now < due {
            return HeartbeatAction::Idle;
        }

        if self.probe_mark == Some(self.inbound) {
            self.stop();
            return HeartbeatAction::Stale;
        }

        self.probe_mark = Some(self.inbound);
        self.next_tick = Some(now + self.interval);
        HeartbeatAction::Probe
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    const INTERVAL: Duration = Duration::from_secs(30);

    #[test]
    fn test_stopped_monitor_is_idle() {
        let mut monitor = HeartbeatMonitor::new(INTERVAL);
        assert!(!monitor.is_running());
        assert_eq!(monitor.deadline(), None);
        assert_eq!(monitor.tick(Instant::now()), HeartbeatAction::Idle);
    }

    #[test]
    fn test_probe_then_stale_without_traffic() {
        let start = Instant::now();
        let mut monitor = HeartbeatMonitor::new(INTERVAL);
        monitor.start(start);

        assert_eq!(monitor.tick(start + Duration::from_secs(1)), HeartbeatAction::Idle);
        assert_eq!(monitor.tick(start + INTERVAL), HeartbeatAction::Probe);
        assert_eq!(monitor.deadline(), Some(start + INTERVAL * 2));
        assert_eq!(monitor.tick(start + INTERVAL * 2), HeartbeatAction::Stale);
        assert!(!monitor.is_running());
    }

    #[test]
    fn test_inbound_frame_answers_probe() {
        let start = Instant::now();
        let mut monitor = HeartbeatMonitor::new(INTERVAL);
        monitor.start(start);

        assert_eq!(monitor.tick(start + INTERVAL), HeartbeatAction::Probe);
        monitor.record_inbound();
        assert_eq!(monitor.tick(start + INTERVAL * 2), HeartbeatAction::Probe);
        monitor.record_inbound();
        assert_eq!(monitor.tick(start + INTERVAL * 3), HeartbeatAction::Probe);
        assert_eq!(monitor.tick(start + INTERVAL * 4), HeartbeatAction::Stale);
    }

    #[test]
    fn test_traffic_before_first_probe_is_irrelevant() {
        let start = Instant::now();
        let mut monitor = HeartbeatMonitor::new(INTERVAL);
        monitor.start(start);
        monitor.record_inbound();

        assert_eq!(monitor.tick(start + INTERVAL), HeartbeatAction::Probe);
        assert_eq!(monitor.tick(start + INTERVAL * 2), HeartbeatAction::Stale);
    }

    #[test]
    fn test_restart_clears_outstanding_probe() {
        let start = Instant::now();
        let mut monitor = HeartbeatMonitor::new(INTERVAL);
        monitor.start(start);
        assert_eq!(monitor.tick(start + INTERVAL), HeartbeatAction::Probe);

        monitor.stop();
        assert_eq!(monitor.tick(start + INTERVAL * 2), HeartbeatAction::Idle);

        let again = start + INTERVAL * 3;
        monitor.start(again);
        assert_eq!(monitor.tick(again + INTERVAL), HeartbeatAction::Probe);
    }
}
