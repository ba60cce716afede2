//! Server-Sent Events transport.
//!
//! Opens a streaming `GET` with `Accept: text/event-stream` and turns each SSE
//! event into one envelope frame. SSE is one-way; outbound frames are `POST`ed
//! to an optional control URL.
//!
//! # Event Mapping
//!
//! | SSE event | Frame |
//! |-----------|-------|
//! | `data` is an object with `type` / `messageType` | Passed through |
//! | Any other `data` | `{ "type": <event or "message">, "data": <data>, "timestamp": now }` |
//! | Empty `data` or `undefined` | Dropped |

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use parking_lot::Mutex;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use serde_json::Value;
use tokio::runtime::Handle;
use tokio::sync::Notify;
use tokio::time::timeout;
use tracing::{debug, trace, warn};
use url::Url;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::protocol::MessageEnvelope;

use super::websocket::DEFAULT_CONNECT_TIMEOUT;
use super::{EventSink, Link, Transport, close_code};

// ============================================================================
// Constants
// ============================================================================

/// Media type of an event stream.
const EVENT_STREAM: &str = "text/event-stream";

/// Query parameter carrying the client id.
const CLIENT_ID_PARAM: &str = "clientId";

// ============================================================================
// SseTransport
// ============================================================================

/// Transport for Server-Sent Events endpoints.
#[derive(Debug, Clone)]
pub struct SseTransport {
    /// HTTP client shared by the stream and control requests.
    client: reqwest::Client,
    /// Endpoint accepting outbound frames.
    control_url: Option<Url>,
    /// Maximum time until response headers arrive.
    connect_timeout: Duration,
}

impl Default for SseTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl SseTransport {
    /// Creates a receive-only transport.
    #[must_use]
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
            control_url: None,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    /// Uses a preconfigured HTTP client.
    #[inline]
    #[must_use]
    pub fn with_client(mut self, client: reqwest::Client) -> Self {
        self.client = client;
        self
    }

    /// Sets the URL that receives outbound frames.
    #[inline]
    #[must_use]
    pub fn with_control_url(mut self, control_url: Url) -> Self {
        self.control_url = Some(control_url);
        self
    }

    /// Sets the timeout for the response headers.
    #[inline]
    #[must_use]
    pub fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }
}

#[async_trait]
impl Transport for SseTransport {
    fn name(&self) -> &'static str {
        "sse"
    }

    async fn connect(&self, address: &str, sink: EventSink) -> Result<()> {
        let (url, client_id) = stream_url(address)?;

        let request = self.client.get(url.clone()).header(ACCEPT, EVENT_STREAM).send();
        let response = timeout(self.connect_timeout, request)
            .await
            .map_err(|_| Error::connection_timeout(self.connect_timeout.as_millis() as u64))??
            .error_for_status()?;

        let is_event_stream = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.contains(EVENT_STREAM));
        if !is_event_stream {
            return Err(Error::protocol(format!("{url} did not return an event stream")));
        }

        let control = Arc::new(StreamControl::default());
        let link = SseLink {
            control: Arc::clone(&control),
            client: self.client.clone(),
            control_url: self.control_url.clone().map(|mut control_url| {
                control_url
                    .query_pairs_mut()
                    .append_pair(CLIENT_ID_PARAM, &client_id);
                control_url
            }),
        };

        sink.opened(Box::new(link));
        tokio::spawn(run_reader(response, sink.clone(), control));

        debug!(%url, %client_id, epoch = sink.epoch(), "SSE stream opened");
        Ok(())
    }
}

/// Validates the address and appends a client id unless one is present.
fn stream_url(address: &str) -> Result<(Url, String)> {
    let mut url = Url::parse(address)?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(Error::config(format!(
            "SSE address must use http:// or https://, got {}://",
            url.scheme()
        )));
    }

    let existing = url
        .query_pairs()
        .find(|(key, _)| key == CLIENT_ID_PARAM)
        .map(|(_, value)| value.into_owned());

    let client_id = match existing {
        Some(id) => id,
        None => {
            let id = format!("telemetry_{}", Uuid::new_v4().simple());
            url.query_pairs_mut().append_pair(CLIENT_ID_PARAM, &id);
            id
        }
    };

    Ok((url, client_id))
}

// ============================================================================
// Reader
// ============================================================================

/// Close signal shared by the link and the reader task.
#[derive(Debug, Default)]
struct StreamControl {
    closed: AtomicBool,
    request: Mutex<Option<(u16, String)>>,
    notify: Notify,
}

/// Reads the event stream until it ends or the link closes it.
async fn run_reader(response: reqwest::Response, sink: EventSink, control: Arc<StreamControl>) {
    let mut stream = response.bytes_stream();
    let mut decoder = SseDecoder::default();

    loop {
        tokio::select! {
            chunk = stream.next() => match chunk {
                Some(Ok(bytes)) => {
                    for event in decoder.feed(&bytes) {
                        if let Some(frame) = event_to_frame(&event) {
                            sink.message(frame);
                        }
                    }
                }
                Some(Err(e)) => {
                    warn!(error = %e, "SSE stream error");
                    sink.error(e.to_string());
                    sink.closed(close_code::ABNORMAL, e.to_string());
                    break;
                }
                None => {
                    debug!("SSE stream ended");
                    sink.closed(close_code::ABNORMAL, "event stream ended");
                    break;
                }
            },

            () = control.notify.notified() => {
                let (code, reason) = control
                    .request
                    .lock()
                    .take()
                    .unwrap_or((close_code::NORMAL, String::new()));
                sink.closed(code, reason);
                break;
            }
        }
    }

    control.closed.store(true, Ordering::Release);
    debug!(epoch = sink.epoch(), "SSE reader terminated");
}

// ============================================================================
// SseLink
// ============================================================================

/// Write side of an SSE connection.
struct SseLink {
    control: Arc<StreamControl>,
    client: reqwest::Client,
    control_url: Option<Url>,
}

impl Link for SseLink {
    fn send(&self, frame: String) -> bool {
        if self.control.closed.load(Ordering::Acquire) {
            return false;
        }
        let Some(url) = self.control_url.clone() else {
            trace!("SSE transport has no control URL; frame not sent");
            return false;
        };
        let Ok(handle) = Handle::try_current() else {
            return false;
        };

        let request = self
            .client
            .post(url)
            .header(CONTENT_TYPE, "application/json")
            .body(frame);
        handle.spawn(async move {
            match request.send().await.and_then(reqwest::Response::error_for_status) {
                Ok(_) => trace!("Control frame posted"),
                Err(e) => warn!(error = %e, "Control frame rejected"),
            }
        });
        true
    }

    fn close(&self, code: u16, reason: &str) {
        if self.control.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        *self.control.request.lock() = Some((code, reason.to_string()));
        self.control.notify.notify_one();
    }
}

// ============================================================================
// SseDecoder
// ============================================================================

/// One decoded SSE event.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct SseEvent {
    /// `event:` field.
    pub event: Option<String>,
    /// Joined `data:` lines.
    pub data: String,
    /// `id:` field.
    pub id: Option<String>,
}

/// Incremental `text/event-stream` parser.
#[derive(Debug, Default)]
pub(crate) struct SseDecoder {
    /// Bytes after the last complete line.
    buffer: Vec<u8>,
    /// Event being assembled.
    event: Option<String>,
    data: Vec<String>,
    id: Option<String>,
}

impl SseDecoder {
    /// Feeds a chunk and returns the events it completes.
    pub(crate) fn feed(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.buffer.extend_from_slice(chunk);

        let mut events = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.buffer.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&raw);
            let line = line.trim_end_matches(['\n', '\r']);

            if line.is_empty() {
                if let Some(event) = self.take_event() {
                    events.push(event);
                }
                continue;
            }
            self.field(line);
        }
        events
    }

    fn field(&mut self, line: &str) {
        if line.starts_with(':') {
            return;
        }
        let (name, value) = match line.split_once(':') {
            Some((name, value)) => (name, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match name {
            "event" => self.event = Some(value.to_string()),
            "data" => self.data.push(value.to_string()),
            "id" => self.id = Some(value.to_string()),
            _ => {}
        }
    }

    fn take_event(&mut self) -> Option<SseEvent> {
        let event = self.event.take();
        if self.data.is_empty() {
            return None;
        }
        Some(SseEvent {
            event,
            data: std::mem::take(&mut self.data).join("\n"),
            id: self.id.clone(),
        })
    }
}

/// Maps an SSE event to an envelope frame.
pub(crate) fn event_to_frame(event: &SseEvent) -> Option<String> {
    let data = event.data.trim();
    if data.is_empty() || data == "undefined" {
        return None;
    }

    let parsed: Option<Value> = serde_json::from_str(data).ok();
    if let Some(Value::Object(object)) = &parsed {
        if object.contains_key("type") || object.contains_key("messageType") {
            return Some(data.to_string());
        }
    }

    let name = event.event.as_deref().unwrap_or("message");
    let payload = parsed.unwrap_or_else(|| Value::String(data.to_string()));
    match MessageEnvelope::new(name, payload).to_frame() {
        Ok(frame) => Some(frame),
        Err(e) => {
            warn!(error = %e, "Failed to wrap SSE event");
            None
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
