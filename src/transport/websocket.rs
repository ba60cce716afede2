//! Raw WebSocket transport.
//!
//! Opens a `ws://` / `wss://` connection with `tokio-tungstenite` and runs one
//! pump task per connection.
//!
//! # Pump
//!
//! The pump task owns both halves of the socket and handles:
//!
//! - Inbound text (and UTF-8 binary) frames, passed through a [`FrameCodec`]
//! - Outbound frames queued by [`Link::send`]
//! - Close requests from [`Link::close`]
//! - Stream errors and remote close frames, reported as `Closed`

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, trace, warn};
use url::Url;

use crate::error::{Error, Result};

use super::{EventSink, Link, Transport, close_code};

// ============================================================================
// Constants
// ============================================================================

/// Default timeout for the WebSocket handshake.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Close code reported when the server closes without a status.
const NO_STATUS: u16 = 1005;

// ============================================================================
// Types
// ============================================================================

/// Client WebSocket stream.
pub(crate) type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Work item for the pump task.
#[derive(Debug)]
enum Outbound {
    /// Text frame to write.
    Frame(String),
    /// Close handshake to start.
    Close(u16, String),
}

// ============================================================================
// FrameCodec
// ============================================================================

/// Result of decoding one inbound text frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Decoded {
    /// Hand the frame to the channel.
    Deliver(String),
    /// Answer on the wire without involving the channel.
    Reply(String),
    /// Nothing to do.
    Ignore,
    /// The server ended the session inside the protocol.
    Close(u16, String),
}

/// Protocol framing on top of WebSocket text frames.
pub(crate) trait FrameCodec: Send + 'static {
    /// Decodes an inbound text frame.
    fn decode(&mut self, text: &str) -> Decoded;

    /// Encodes an outbound channel frame. `None` drops it.
    fn encode(&self, frame: String) -> Option<String>;
}

/// Frames pass through unchanged.
#[derive(Debug, Default)]
pub(crate) struct PlainCodec;

impl FrameCodec for PlainCodec {
    fn decode(&mut self, text: &str) -> Decoded {
        Decoded::Deliver(text.to_string())
    }

    fn encode(&self, frame: String) -> Option<String> {
        Some(frame)
    }
}

// ============================================================================
// WebSocketTransport
// ============================================================================

/// Transport for plain JSON-over-WebSocket endpoints.
#[derive(Debug, Clone)]
pub struct WebSocketTransport {
    /// Maximum time for the opening handshake.
    connect_timeout: Duration,
}

impl Default for WebSocketTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl WebSocketTransport {
    /// Creates a transport with the default handshake timeout.
    #[inline]
    #[must_use]
    pub const fn new() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    /// Sets the handshake timeout.
    #[inline]
    #[must_use]
    pub const fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    fn name(&self) -> &'static str {
        "websocket"
    }

    async fn connect(&self, address: &str, sink: EventSink) -> Result<()> {
        let url = parse_ws_url(address)?;
        let stream = open_stream(&url, self.connect_timeout).await?;

        start_pump(stream, sink.clone(), PlainCodec);

        debug!(%url, epoch = sink.epoch(), "WebSocket connected");
        Ok(())
    }
}

// ============================================================================
// Helpers
// ============================================================================

/// Validates a WebSocket address.
pub(crate) fn parse_ws_url(address: &str) -> Result<Url> {
    let url = Url::parse(address)?;
    match url.scheme() {
        "ws" | "wss" => Ok(url),
        other => Err(Error::config(format!(
            "WebSocket address must use ws:// or wss://, got {other}://"
        ))),
    }
}

/// Performs the WebSocket handshake with a timeout.
pub(crate) async fn open_stream(url: &Url, connect_timeout: Duration) -> Result<WsStream> {
    let (stream, _response) = timeout(connect_timeout, connect_async(url.as_str()))
        .await
        .map_err(|_| Error::connection_timeout(connect_timeout.as_millis() as u64))??;
    Ok(stream)
}

/// Emits `Opened` with the link of an open stream, then spawns its pump.
///
/// `Opened` is queued before the pump can read, so the first server frame
/// always follows it.
pub(crate) fn start_pump<C: FrameCodec>(stream: WsStream, sink: EventSink, codec: C) {
    let (tx, rx) = mpsc::unbounded_channel();
    let closed = Arc::new(AtomicBool::new(false));

    sink.opened(Box::new(WsLink {
        tx,
        closed: Arc::clone(&closed),
    }));
    tokio::spawn(run_pump(stream, rx, sink, codec, closed));
}

/// Pump loop for one connection.
async fn run_pump<C: FrameCodec>(
    stream: WsStream,
    mut outbound_rx: mpsc::UnboundedReceiver<Outbound>,
    sink: EventSink,
    mut codec: C,
    closed: Arc<AtomicBool>,
) {
    let (mut ws_write, mut ws_read) = stream.split();

    loop {
        tokio::select! {
            message = ws_read.next() => {
                let text = match message {
                    Some(Ok(Message::Text(text))) => text.to_string(),

                    Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes.to_vec()) {
                        Ok(text) => text,
                        Err(_) => {
                            warn!(epoch = sink.epoch(), "Dropped non UTF-8 binary frame");
                            continue;
                        }
                    },

                    Some(Ok(Message::Close(frame))) => {
                        let (code, reason) = frame
                            .map(|f| (u16::from(f.code), f.reason.to_string()))
                            .unwrap_or((NO_STATUS, String::new()));
                        debug!(code, %reason, "WebSocket closed by remote");
                        sink.closed(code, reason);
                        break;
                    }

                    Some(Err(e)) => {
                        warn!(error = %e, "WebSocket error");
                        sink.error(e.to_string());
                        sink.closed(close_code::ABNORMAL, e.to_string());
                        break;
                    }

                    None => {
                        debug!("WebSocket stream ended");
                        sink.closed(close_code::ABNORMAL, "stream ended");
                        break;
                    }

                    // Ping/Pong are answered by tungstenite
                    Some(Ok(_)) => continue,
                };

                match codec.decode(&text) {
                    Decoded::Deliver(frame) => {
                        sink.message(frame);
                    }
                    Decoded::Reply(frame) => {
                        if let Err(e) = ws_write.send(Message::Text(frame.into())).await {
                            warn!(error = %e, "Failed to send protocol reply");
                        }
                    }
                    Decoded::Ignore => {}
                    Decoded::Close(code, reason) => {
                        debug!(code, %reason, "Session ended by protocol");
                        let _ = ws_write.close().await;
                        sink.closed(code, reason);
                        break;
                    }
                }
            }

            outbound = outbound_rx.recv() => {
                match outbound {
                    Some(Outbound::Frame(frame)) => {
                        let Some(encoded) = codec.encode(frame) else {
                            continue;
                        };
                        if let Err(e) = ws_write.send(Message::Text(encoded.into())).await {
                            warn!(error = %e, "Failed to write frame");
                            sink.error(e.to_string());
                            sink.closed(close_code::ABNORMAL, e.to_string());
                            break;
                        }
                        trace!(epoch = sink.epoch(), "Frame written");
                    }

                    Some(Outbound::Close(code, reason)) => {
                        let frame = CloseFrame {
                            code: CloseCode::from(code),
                            reason: reason.clone().into(),
                        };
                        let _ = ws_write.send(Message::Close(Some(frame))).await;
                        sink.closed(code, reason);
                        break;
                    }

                    None => {
                        let _ = ws_write.close().await;
                        break;
                    }
                }
            }
        }
    }

    closed.store(true, Ordering::Release);
    debug!(epoch = sink.epoch(), "WebSocket pump terminated");
}

// ============================================================================
// WsLink
// ============================================================================

/// Write side of a WebSocket connection.
#[derive(Debug)]
pub(crate) struct WsLink {
    /// Queue to the pump task.
    tx: mpsc::UnboundedSender<Outbound>,
    /// Set once the pump has stopped or a close was requested.
    closed: Arc<AtomicBool>,
}

impl Link for WsLink {
    fn send(&self, frame: String) -> bool {
        if self.closed.load(Ordering::Acquire) {
            return false;
        }
        self.tx.send(Outbound::Frame(frame)).is_ok()
    }

    fn close(&self, code: u16, reason: &str) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.tx.send(Outbound::Close(code, reason.to_string()));
    }
}

// ============================================================================
// Tests
// ============================================================================
