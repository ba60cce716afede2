//! In-process transport.
//!
//! [`MemoryTransport`] implements [`Transport`] without any I/O. The paired
//! [`MemoryRemote`] plays the server: it decides whether the next open
//! succeeds, pushes frames to the client, drops the connection and records
//! every frame the client sent.
//!
//! # Example
//!
//! ```ignore
//! let (transport, remote) = MemoryTransport::pair();
//! let channel = Channel::builder().address("mem://metrics").transport(transport).build()?;
//!
//! remote.refuse_next(2, "server restarting");
//! channel.connect().await?;
//! remote.push(r#"{"type":"server_metrics","data":{}}"#);
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tracing::trace;

use crate::error::{Error, Result};

use super::{EventSink, Link, Transport};

// ============================================================================
// Types
// ============================================================================

/// Scripted result of the next open.
#[derive(Debug, Clone)]
enum Outcome {
    /// Open succeeds.
    Accept,
    /// Open fails with this message.
    Refuse(String),
}

/// State shared between transport, links and remote.
#[derive(Debug, Default)]
struct MemoryState {
    /// Scripted outcomes, consumed front-first. Empty means accept.
    outcomes: VecDeque<Outcome>,
    /// Number of open attempts.
    opens: usize,
    /// Addresses passed to each open.
    addresses: Vec<String>,
    /// Frames sent by the client, in order.
    sent: Vec<String>,
    /// Close codes the client sent.
    client_closes: Vec<(u16, String)>,
    /// Live connection: sink and link id.
    current: Option<(EventSink, u64)>,
    /// Link id counter.
    next_link: u64,
}

// ============================================================================
// MemoryTransport
// ============================================================================

/// Transport backed by process memory.
#[derive(Debug, Clone)]
pub struct MemoryTransport {
    shared: Arc<Mutex<MemoryState>>,
}

impl MemoryTransport {
    /// Creates a transport and the remote that controls it.
    #[must_use]
    pub fn pair() -> (Self, MemoryRemote) {
        let shared = Arc::new(Mutex::new(MemoryState::default()));
        (
            Self {
                shared: Arc::clone(&shared),
            },
            MemoryRemote { shared },
        )
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn connect(&self, address: &str, sink: EventSink) -> Result<()> {
        let mut state = self.shared.lock();
        state.opens += 1;
        state.addresses.push(address.to_string());

        match state.outcomes.pop_front().unwrap_or(Outcome::Accept) {
            Outcome::Refuse(message) => {
                trace!(address, %message, "memory open refused");
                Err(Error::connection(message))
            }
            Outcome::Accept => {
                state.next_link += 1;
                let id = state.next_link;
                let link = MemoryLink {
                    shared: Arc::clone(&self.shared),
                    id,
                };
                sink.opened(Box::new(link));
                state.current = Some((sink, id));
                trace!(address, id, "memory open accepted");
                Ok(())
            }
        }
    }
}

// ============================================================================
// MemoryLink
// ============================================================================

/// Write side of one memory connection.
struct MemoryLink {
    shared: Arc<Mutex<MemoryState>>,
    id: u64,
}

impl Link for MemoryLink {
    fn send(&self, frame: String) -> bool {
        let mut state = self.shared.lock();
        if state.current.as_ref().is_some_and(|(_, id)| *id == self.id) {
            state.sent.push(frame);
            true
        } else {
            false
        }
    }

    fn close(&self, code: u16, reason: &str) {
        let mut state = self.shared.lock();
        if state.current.as_ref().is_some_and(|(_, id)| *id == self.id) {
            state.current = None;
            state.client_closes.push((code, reason.to_string()));
        }
    }
}

// ============================================================================
// MemoryRemote
// ============================================================================

/// Server side of a [`MemoryTransport`].
#[derive(Debug, Clone)]
pub struct MemoryRemote {
    shared: Arc<Mutex<MemoryState>>,
}

impl MemoryRemote {
    /// Makes the next `count` opens fail.
    pub fn refuse_next(&self, count: usize, reason: &str) {
        let mut state = self.shared.lock();
        for _ in 0..count {
            state.outcomes.push_back(Outcome::Refuse(reason.to_string()));
        }
    }

    /// Makes the next open succeed even if refusals are queued after it.
    pub fn accept_next(&self) {
        self.shared.lock().outcomes.push_back(Outcome::Accept);
    }

    /// Pushes a frame to the client. Returns `false` when not connected.
    pub fn push(&self, frame: impl Into<String>) -> bool {
        let state = self.shared.lock();
        state
            .current
            .as_ref()
            .is_some_and(|(sink, _)| sink.message(frame))
    }

    /// Pushes a JSON value as a frame.
    pub fn push_json(&self, value: &Value) -> bool {
        self.push(value.to_string())
    }

    /// Drops the live connection with the given close code.
    pub fn drop_connection(&self, code: u16, reason: &str) -> bool {
        let current = self.shared.lock().current.take();
        current.is_some_and(|(sink, _)| sink.closed(code, reason))
    }

    /// Reports a transport error on the live connection, then drops it.
    pub fn fail_connection(&self, message: &str) -> bool {
        let current = self.shared.lock().current.take();
        current.is_some_and(|(sink, _)| {
            sink.error(message);
            sink.closed(super::close_code::ABNORMAL, message)
        })
    }

    /// Returns `true` while a connection is live.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.shared.lock().current.is_some()
    }

    /// Number of open attempts so far.
    #[must_use]
    pub fn open_count(&self) -> usize {
        self.shared.lock().opens
    }

    /// Addresses passed to each open.
    #[must_use]
    pub fn addresses(&self) -> Vec<String> {
        self.shared.lock().addresses.clone()
    }

    /// Frames sent by the client.
    #[must_use]
    pub fn sent(&self) -> Vec<String> {
        self.shared.lock().sent.clone()
    }

    /// Frames sent by the client, parsed as JSON (unparsable frames skipped).
    #[must_use]
    pub fn sent_json(&self) -> Vec<Value> {
        self.shared
            .lock()
            .sent
            .iter()
            .filter_map(|frame| serde_json::from_str(frame).ok())
            .collect()
    }

    /// Drains the recorded client frames.
    pub fn take_sent(&self) -> Vec<String> {
        std::mem::take(&mut self.shared.lock().sent)
    }

    /// Close codes sent by the client.
    #[must_use]
    pub fn client_closes(&self) -> Vec<(u16, String)> {
        self.shared.lock().client_closes.clone()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use tokio::sync::mpsc;

    use crate::transport::{TransportEvent, close_code};

    #[tokio::test]
    async fn test_accept_emits_opened_and_records_sends() {
        let (transport, remote) = MemoryTransport::pair();
        let (tx, mut rx) = mpsc::unbounded_channel();

        transport
            .connect("mem://a", EventSink::new(1, tx))
            .await
            .expect("open");

        let (epoch, event) = rx.recv().await.expect("event");
        assert_eq!(epoch, 1);
        let TransportEvent::Opened(link) = event else {
            panic!("expected Opened");
        };

        assert!(link.send("hello".into()));
        assert_eq!(remote.sent(), vec!["hello".to_string()]);
        assert_eq!(remote.open_count(), 1);
        assert_eq!(remote.addresses(), vec!["mem://a".to_string()]);
    }

    #[tokio::test]
    async fn test_refuse_next() {
        let (transport, remote) = MemoryTransport::pair();
        let (tx, _rx) = mpsc::unbounded_channel();
        remote.refuse_next(1, "down");

        let err = transport
            .connect("mem://a", EventSink::new(1, tx.clone()))
            .await
            .expect_err("refused");
        assert!(err.is_connection_error());

        transport
            .connect("mem://a", EventSink::new(2, tx))
            .await
            .expect("second open accepted");
        assert_eq!(remote.open_count(), 2);
    }

    #[tokio::test]
    async fn test_push_and_drop() {
        let (transport, remote) = MemoryTransport::pair();
        let (tx, mut rx) = mpsc::unbounded_channel();
        assert!(!remote.push("nobody"));

        transport
            .connect("mem://a", EventSink::new(3, tx))
            .await
            .expect("open");
        let _opened = rx.recv().await;

        assert!(remote.push("frame"));
        assert!(remote.drop_connection(close_code::ABNORMAL, "cut"));
        assert!(!remote.is_open());

        let (_, event) = rx.recv().await.expect("message");
        assert!(matches!(event, TransportEvent::Message(ref f) if f == "frame"));
        let (_, event) = rx.recv().await.expect("closed");
        assert!(matches!(event, TransportEvent::Closed { code: 1006, .. }));
    }

    #[tokio::test]
    async fn test_old_link_cannot_send_after_reopen() {
        let (transport, remote) = MemoryTransport::pair();
        let (tx, mut rx) = mpsc::unbounded_channel();

        transport
            .connect("mem://a", EventSink::new(1, tx.clone()))
            .await
            .expect("open");
        let Some((_, TransportEvent::Opened(old))) = rx.recv().await else {
            panic!("expected Opened");
        };

        remote.drop_connection(close_code::ABNORMAL, "cut");
        transport
            .connect("mem://a", EventSink::new(2, tx))
            .await
            .expect("reopen");

        assert!(!old.send("late".into()));
        assert!(remote.sent().is_empty());
    }
}
