//! Connection state owner.
//!
//! [`TransportAdapter`] wraps whichever physical connection is current and is
//! the only place [`ConnectionState`] changes. Each open attempt gets a new
//! epoch; events carrying an older epoch belong to a detached connection and
//! are ignored.
//!
//! # State Machine
//!
//! ```text
//!            begin_open                on_opened
//!   Idle ─────────────────► Connecting ─────────► Connected
//!   Closed ───────┘            │    ▲                  │
//!   Failed ───────┘            │    │ begin_open       │ on_closed (abnormal)
//!                              ▼    │                  ▼   / force_stale
//!                          Reconnecting ◄──────────────┘
//!                              │
//!                              └── mark_failed ──► Failed
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::fmt;

use serde::Serialize;
use tracing::{debug, trace};

use super::{Link, close_code};

// ============================================================================
// ConnectionState
// ============================================================================

/// Lifecycle state of the physical connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionState {
    /// Never connected.
    #[default]
    Idle,
    /// Open attempt in flight.
    Connecting,
    /// Connection open.
    Connected,
    /// Waiting for the next retry.
    Reconnecting,
    /// Closed on purpose (client disconnect or normal server close).
    Closed,
    /// Reconnect attempts exhausted.
    Failed,
}

impl ConnectionState {
    /// Returns `true` while an open attempt is in flight or pending.
    #[inline]
    #[must_use]
    pub const fn is_connecting(self) -> bool {
        matches!(self, Self::Connecting | Self::Reconnecting)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "IDLE",
            Self::Connecting => "CONNECTING",
            Self::Connected => "CONNECTED",
            Self::Reconnecting => "RECONNECTING",
            Self::Closed => "CLOSED",
            Self::Failed => "FAILED",
        };
        f.write_str(name)
    }
}

// ============================================================================
// CloseOutcome
// ============================================================================

/// How a connection ended, as seen by the adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseOutcome {
    /// Normal closure; no retry.
    Normal,
    /// Abnormal closure or failed open; the reconnect controller decides.
    Unexpected,
}

// ============================================================================
// TransportAdapter
// ============================================================================

/// Owner of the connection state and the current physical link.
#[derive(Default)]
pub struct TransportAdapter {
    /// Current lifecycle state.
    state: ConnectionState,
    /// Epoch of the most recent open attempt.
    epoch: u64,
    /// Write side of the open connection.
    link: Option<Box<dyn Link>>,
}

impl fmt::Debug for TransportAdapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportAdapter")
            .field("state", &self.state)
            .field("epoch", &self.epoch)
            .field("has_link", &self.link.is_some())
            .finish()
    }
}

impl TransportAdapter {
    /// Creates an idle adapter.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the current state.
    #[inline]
    #[must_use]
    pub const fn state(&self) -> ConnectionState {
        self.state
    }

    /// Returns the epoch of the most recent open attempt.
    #[inline]
    #[must_use]
    pub const fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Returns `true` if `epoch` belongs to the current connection.
    #[inline]
    #[must_use]
    pub const fn is_current(&self, epoch: u64) -> bool {
        epoch == self.epoch
    }

    /// Starts an open attempt.
    ///
    /// Returns the epoch to tag the attempt's events with, or `None` when an
    /// attempt is already in flight or the connection is open.
    pub fn begin_open(&mut self) -> Option<u64> {
        match self.state {
            ConnectionState::Connecting | ConnectionState::Connected => {
                trace!(state = %self.state, "open ignored");
                None
            }
            _ => {
                self.epoch += 1;
                self.state = ConnectionState::Connecting;
                debug!(epoch = self.epoch, "open attempt started");
                Some(self.epoch)
            }
        }
    }

    /// Installs the link of a successful open.
    ///
    /// # Errors
    ///
    /// Returns the link back when `epoch` is stale or no attempt is in
    /// flight; the caller must close it.
    pub fn on_opened(&mut self, epoch: u64, link: Box<dyn Link>) -> Result<(), Box<dyn Link>> {
        if !self.is_current(epoch) || self.state != ConnectionState::Connecting {
            debug!(epoch, current = self.epoch, "stale open discarded");
            return Err(link);
        }

        self.link = Some(link);
        self.state = ConnectionState::Connected;
        debug!(epoch, "connection open");
        Ok(())
    }

    /// Records the end of the current connection.
    ///
    /// Returns `None` for stale epochs or when no connection is live.
    pub fn on_closed(&mut self, epoch: u64, code: u16) -> Option<CloseOutcome> {
        if !self.is_current(epoch) || !matches!(
            self.state,
            ConnectionState::Connecting | ConnectionState::Connected
        ) {
            return None;
        }

        self.link = None;

        if close_code::is_normal(code) {
            self.state = ConnectionState::Closed;
            Some(CloseOutcome::Normal)
        } else {
            self.state = ConnectionState::Reconnecting;
            Some(CloseOutcome::Unexpected)
        }
    }

    /// Sends a frame on the open connection.
    ///
    /// Returns `false` without queuing when not [`ConnectionState::Connected`].
    pub fn send(&self, frame: String) -> bool {
        if self.state != ConnectionState::Connected {
            return false;
        }
        self.link.as_ref().is_some_and(|link| link.send(frame))
    }

    /// Closes the connection on purpose and detaches it.
    ///
    /// Returns `false` when already idle or closed.
    pub fn close(&mut self, code: u16, reason: &str) -> bool {
        if matches!(self.state, ConnectionState::Idle | ConnectionState::Closed) {
            return false;
        }

        if let Some(link) = self.link.take() {
            link.close(code, reason);
        }
        self.epoch += 1;
        self.state = ConnectionState::Closed;
        debug!(epoch = self.epoch, reason, "connection closed by client");
        true
    }

    /// Tears down a connection judged dead by the heartbeat.
    ///
    /// Returns `false` unless currently connected.
    pub fn force_stale(&mut self) -> bool {
        if self.state != ConnectionState::Connected {
            return false;
        }

        if let Some(link) = self.link.take() {
            link.close(close_code::STALE, "heartbeat timeout");
        }
        self.epoch += 1;
        self.state = ConnectionState::Reconnecting;
        true
    }

    /// Marks reconnection as exhausted.
    pub fn mark_failed(&mut self) {
        self.link = None;
        self.state = ConnectionState::Failed;
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Arc;

    use parking_lot::Mutex;

    #[derive(Default)]
    struct Recorder {
        sent: Mutex<Vec<String>>,
        closes: Mutex<Vec<u16>>,
    }

    struct RecordingLink(Arc<Recorder>);

    impl Link for RecordingLink {
        fn send(&self, frame: String) -> bool {
            self.0.sent.lock().push(frame);
            true
        }

        fn close(&self, code: u16, _reason: &str) {
            self.0.closes.lock().push(code);
        }
    }

    fn link(rec: &Arc<Recorder>) -> Box<dyn Link> {
        Box::new(RecordingLink(Arc::clone(rec)))
    }

    fn connected(rec: &Arc<Recorder>) -> TransportAdapter {
        let mut adapter = TransportAdapter::new();
        let epoch = adapter.begin_open().expect("epoch");
        assert!(adapter.on_opened(epoch, link(rec)).is_ok());
        adapter
    }

    #[test]
    fn test_open_is_idempotent() {
        let mut adapter = TransportAdapter::new();
        assert_eq!(adapter.begin_open(), Some(1));
        assert_eq!(adapter.begin_open(), None);
        assert_eq!(adapter.state(), ConnectionState::Connecting);
    }

    #[test]
    fn test_open_ignored_while_connected() {
        let rec = Arc::new(Recorder::default());
        let mut adapter = connected(&rec);
        assert_eq!(adapter.begin_open(), None);
        assert_eq!(adapter.state(), ConnectionState::Connected);
    }

    #[test]
    fn test_send_requires_connected() {
        let rec = Arc::new(Recorder::default());
        let mut adapter = TransportAdapter::new();
        assert!(!adapter.send("early".into()));

        let epoch = adapter.begin_open().expect("epoch");
        assert!(!adapter.send("connecting".into()));

        assert!(adapter.on_opened(epoch, link(&rec)).is_ok());
        assert!(adapter.send("live".into()));
        assert_eq!(*rec.sent.lock(), vec!["live".to_string()]);
    }

    #[test]
    fn test_stale_open_returns_link() {
        let rec = Arc::new(Recorder::default());
        let mut adapter = TransportAdapter::new();
        let first = adapter.begin_open().expect("epoch");
        assert!(adapter.close(close_code::NORMAL, "user"));
        assert!(adapter.on_opened(first, link(&rec)).is_err());
        assert_eq!(adapter.state(), ConnectionState::Closed);
    }

    #[test]
    fn test_abnormal_close_moves_to_reconnecting() {
        let rec = Arc::new(Recorder::default());
        let mut adapter = connected(&rec);
        let epoch = adapter.epoch();
        assert_eq!(
            adapter.on_closed(epoch, close_code::ABNORMAL),
            Some(CloseOutcome::Unexpected)
        );
        assert_eq!(adapter.state(), ConnectionState::Reconnecting);
        assert!(!adapter.send("x".into()));
    }

    #[test]
    fn test_normal_close_moves_to_closed() {
        let rec = Arc::new(Recorder::default());
        let mut adapter = connected(&rec);
        let epoch = adapter.epoch();
        assert_eq!(
            adapter.on_closed(epoch, close_code::NORMAL),
            Some(CloseOutcome::Normal)
        );
        assert_eq!(adapter.state(), ConnectionState::Closed);
    }

    #[test]
    fn test_stale_close_is_ignored() {
        let rec = Arc::new(Recorder::default());
        let mut adapter = connected(&rec);
        assert_eq!(adapter.on_closed(adapter.epoch() - 1, close_code::ABNORMAL), None);
        assert_eq!(adapter.state(), ConnectionState::Connected);
    }

    #[test]
    fn test_close_twice_is_noop() {
        let rec = Arc::new(Recorder::default());
        let mut adapter = connected(&rec);
        assert!(adapter.close(close_code::NORMAL, "bye"));
        assert!(!adapter.close(close_code::NORMAL, "bye"));
        assert_eq!(*rec.closes.lock(), vec![close_code::NORMAL]);
    }

    #[test]
    fn test_force_stale_detaches_link() {
        let rec = Arc::new(Recorder::default());
        let mut adapter = connected(&rec);
        let old = adapter.epoch();
        assert!(adapter.force_stale());
        assert_eq!(adapter.state(), ConnectionState::Reconnecting);
        assert_eq!(adapter.on_closed(old, close_code::STALE), None);
        assert_eq!(*rec.closes.lock(), vec![close_code::STALE]);
        assert!(!adapter.force_stale());
    }

    #[test]
    fn test_reopen_from_closed_passes_through_connecting() {
        let rec = Arc::new(Recorder::default());
        let mut adapter = connected(&rec);
        adapter.close(close_code::NORMAL, "bye");
        let epoch = adapter.begin_open().expect("epoch");
        assert_eq!(adapter.state(), ConnectionState::Connecting);
        assert!(adapter.on_opened(epoch, link(&rec)).is_ok());
    }

    #[test]
    fn test_display() {
        assert_eq!(ConnectionState::Reconnecting.to_string(), "RECONNECTING");
        assert!(ConnectionState::Reconnecting.is_connecting());
        assert!(!ConnectionState::Failed.is_connecting());
    }
}
