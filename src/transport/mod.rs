//! Push-connection transport layer.
//!
//! A [`Transport`] knows how to open one physical connection for a wire
//! protocol. Everything above it (heartbeat, backoff, subscription replay,
//! dispatch, caches) is written once against this capability.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────┐   connect(address, sink)   ┌──────────────────┐
//! │ TransportAdapter │ ─────────────────────────► │ Transport impl   │
//! │ (state + epoch)  │                            │ ws / sse / sio   │
//! │                  │ ◄── EventSink(epoch) ───── │ reader task      │
//! │                  │ ──── Link::send ─────────► │ writer task      │
//! └──────────────────┘                            └──────────────────┘
//! ```
//!
//! # Event Ordering
//!
//! A transport must emit [`TransportEvent::Opened`] through the sink before
//! any [`TransportEvent::Message`] of the same connection. Events are tagged
//! with the epoch of the open attempt that produced them; the adapter drops
//! events from superseded epochs.
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `adapter` | Connection state owner |
//! | `websocket` | Raw WebSocket transport |
//! | `sse` | Server-Sent Events transport |
//! | `socketio` | Socket.IO (Engine.IO v4) transport |
//! | `memory` | In-process transport for tests |

// ============================================================================
// Submodules
// ============================================================================

/// Connection state owner.
pub mod adapter;

/// In-process transport.
pub mod memory;

/// Server-Sent Events transport.
pub mod sse;

/// Socket.IO transport.
pub mod socketio;

/// Raw WebSocket transport.
pub mod websocket;

// ============================================================================
// Imports
// ============================================================================

use std::fmt;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::Result;

// ============================================================================
// Re-exports
// ============================================================================

pub use adapter::{ConnectionState, TransportAdapter};
pub use memory::{MemoryRemote, MemoryTransport};
pub use socketio::SocketIoTransport;
pub use sse::SseTransport;
pub use websocket::WebSocketTransport;

// ============================================================================
// Close Codes
// ============================================================================

/// Close codes used by the channel.
pub mod close_code {
    /// Normal closure.
    pub const NORMAL: u16 = 1000;
    /// Endpoint going away.
    pub const GOING_AWAY: u16 = 1001;
    /// Abnormal closure (no close frame).
    pub const ABNORMAL: u16 = 1006;
    /// Heartbeat detected a silent connection.
    pub const STALE: u16 = 4000;
    /// Server-side namespace disconnect.
    pub const SERVER_DISCONNECT: u16 = 4001;

    /// Returns `true` when the code does not warrant a reconnect.
    #[inline]
    #[must_use]
    pub const fn is_normal(code: u16) -> bool {
        code == NORMAL
    }
}

// ============================================================================
// Link
// ============================================================================

/// Write side of one open physical connection.
///
/// Both methods are non-blocking; implementations hand frames to a writer
/// task.
pub trait Link: Send + Sync + 'static {
    /// Queues a text frame. Returns `false` if the connection is gone.
    fn send(&self, frame: String) -> bool;

    /// Starts closing the connection. Repeated calls are no-ops.
    fn close(&self, code: u16, reason: &str);
}

// ============================================================================
// TransportEvent
// ============================================================================

/// Event emitted by a physical connection.
pub enum TransportEvent {
    /// Connection established; carries its write side.
    Opened(Box<dyn Link>),
    /// Inbound text frame.
    Message(String),
    /// Connection closed.
    Closed {
        /// Close code.
        code: u16,
        /// Close reason.
        reason: String,
    },
    /// Transport error (followed by `Closed`).
    Error(String),
}

impl fmt::Debug for TransportEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Opened(_) => f.write_str("Opened"),
            Self::Message(frame) => f.debug_tuple("Message").field(frame).finish(),
            Self::Closed { code, reason } => f
                .debug_struct("Closed")
                .field("code", code)
                .field("reason", reason)
                .finish(),
            Self::Error(message) => f.debug_tuple("Error").field(message).finish(),
        }
    }
}

// ============================================================================
// EventSink
// ============================================================================

/// Epoch-tagged event with its payload.
pub type TaggedEvent = (u64, TransportEvent);

/// Delivers transport events for one open attempt.
#[derive(Debug, Clone)]
pub struct EventSink {
    /// Epoch of the open attempt.
    epoch: u64,
    /// Shared event queue.
    tx: mpsc::UnboundedSender<TaggedEvent>,
}

impl EventSink {
    /// Creates a sink for the given epoch.
    #[inline]
    #[must_use]
    pub fn new(epoch: u64, tx: mpsc::UnboundedSender<TaggedEvent>) -> Self {
        Self { epoch, tx }
    }

    /// Returns the epoch this sink is bound to.
    #[inline]
    #[must_use]
    pub const fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Emits an event. Returns `false` if the channel is gone.
    #[inline]
    pub fn emit(&self, event: TransportEvent) -> bool {
        self.tx.send((self.epoch, event)).is_ok()
    }

    /// Emits [`TransportEvent::Opened`].
    #[inline]
    pub fn opened(&self, link: Box<dyn Link>) -> bool {
        self.emit(TransportEvent::Opened(link))
    }

    /// Emits [`TransportEvent::Message`].
    #[inline]
    pub fn message(&self, frame: impl Into<String>) -> bool {
        self.emit(TransportEvent::Message(frame.into()))
    }

    /// Emits [`TransportEvent::Closed`].
    #[inline]
    pub fn closed(&self, code: u16, reason: impl Into<String>) -> bool {
        self.emit(TransportEvent::Closed {
            code,
            reason: reason.into(),
        })
    }

    /// Emits [`TransportEvent::Error`].
    #[inline]
    pub fn error(&self, message: impl Into<String>) -> bool {
        self.emit(TransportEvent::Error(message.into()))
    }

    /// Returns `true` if the receiving side has been dropped.
    #[inline]
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

// ============================================================================
// Transport
// ============================================================================

/// Wire protocol capable of opening push connections.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Short protocol name for logs.
    fn name(&self) -> &'static str;

    /// Opens a connection to `address`.
    ///
    /// On success the implementation emits [`TransportEvent::Opened`] before
    /// any inbound frame and keeps pumping events into `sink` until the
    /// connection ends with [`TransportEvent::Closed`].
    ///
    /// # Errors
    ///
    /// Returns an error if the connection could not be established. No
    /// `Opened` event is emitted in that case.
    async fn connect(&self, address: &str, sink: EventSink) -> Result<()>;
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_close_code_normal() {
        assert!(close_code::is_normal(close_code::NORMAL));
        assert!(!close_code::is_normal(close_code::ABNORMAL));
        assert!(!close_code::is_normal(close_code::STALE));
    }

    #[tokio::test]
    async fn test_sink_tags_epoch() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sink = EventSink::new(7, tx);
        assert!(sink.message("hello"));
        assert!(sink.closed(close_code::ABNORMAL, "gone"));

        let (epoch, event) = rx.recv().await.expect("message");
        assert_eq!(epoch, 7);
        assert!(matches!(event, TransportEvent::Message(ref f) if f == "hello"));

        let (_, event) = rx.recv().await.expect("closed");
        assert!(matches!(event, TransportEvent::Closed { code: 1006, .. }));
    }

    #[test]
    fn test_sink_reports_dropped_receiver() {
        let (tx, rx) = mpsc::unbounded_channel();
        let sink = EventSink::new(1, tx);
        drop(rx);
        assert!(sink.is_closed());
        assert!(!sink.error("late"));
    }
}
