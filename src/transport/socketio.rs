//! Socket.IO transport (Engine.IO v4 over WebSocket).
//!
//! Speaks just enough of the Socket.IO v5 protocol to carry the channel's JSON
//! envelopes on the default namespace.
//!
//! # Packets
//!
//! | Packet | Meaning | Handling |
//! |--------|---------|----------|
//! | `0{...}` | Engine.IO open | Handshake |
//! | `40` | Namespace connect | Handshake |
//! | `44{...}` | Namespace connect error | Open fails |
//! | `2` / `3` | Ping / pong | `3` answered in the pump |
//! | `42["event", payload]` | Event | Delivered as an envelope |
//! | `41` / `1` | Disconnect / close | `Closed { code: 4001 }` |

// ============================================================================
// Imports
// ============================================================================

use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde_json::{Map, Value};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, trace, warn};
use url::Url;

use crate::error::{Error, Result};
use crate::protocol::now_millis;

use super::websocket::{
    DEFAULT_CONNECT_TIMEOUT, Decoded, FrameCodec, WsStream, open_stream, start_pump,
};
use super::{EventSink, Transport, close_code};

// ============================================================================
// Constants
// ============================================================================

/// Engine.IO endpoint path.
const ENGINE_PATH: &str = "/socket.io/";

// ============================================================================
// SocketIoTransport
// ============================================================================

/// Transport for Socket.IO servers.
#[derive(Debug, Clone)]
pub struct SocketIoTransport {
    /// Maximum time for the WebSocket and namespace handshakes together.
    connect_timeout: Duration,
}

impl Default for SocketIoTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl SocketIoTransport {
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
impl Transport for SocketIoTransport {
    fn name(&self) -> &'static str {
        "socketio"
    }

    async fn connect(&self, address: &str, sink: EventSink) -> Result<()> {
        let url = engine_url(address)?;
        let mut stream = open_stream(&url, self.connect_timeout).await?;

        timeout(self.connect_timeout, handshake(&mut stream))
            .await
            .map_err(|_| Error::connection_timeout(self.connect_timeout.as_millis() as u64))??;

        start_pump(stream, sink.clone(), SocketIoCodec);

        debug!(%url, epoch = sink.epoch(), "Socket.IO namespace connected");
        Ok(())
    }
}

// ============================================================================
// Handshake
// ============================================================================

/// Builds the Engine.IO WebSocket URL from an http(s) or ws(s) address.
fn engine_url(address: &str) -> Result<Url> {
    let mut url = Url::parse(address)?;

    let scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => {
            return Err(Error::config(format!(
                "Socket.IO address must use http(s):// or ws(s)://, got {other}://"
            )));
        }
    };
    url.set_scheme(scheme)
        .map_err(|()| Error::config("cannot rewrite Socket.IO scheme"))?;

    if url.path().is_empty() || url.path() == "/" {
        url.set_path(ENGINE_PATH);
    }
    url.query_pairs_mut()
        .append_pair("EIO", "4")
        .append_pair("transport", "websocket");

    Ok(url)
}

/// Waits for the Engine.IO open, joins the default namespace and waits for
/// the acknowledgement.
async fn handshake(stream: &mut WsStream) -> Result<()> {
    let open = next_text(stream).await?;
    if !open.starts_with('0') {
        return Err(Error::protocol(format!(
            "expected Engine.IO open packet, got {open:?}"
        )));
    }
    trace!(packet = %open, "Engine.IO open");

    stream.send(Message::Text("40".into())).await?;

    loop {
        let packet = next_text(stream).await?;
        if packet.starts_with("40") {
            return Ok(());
        }
        if let Some(body) = packet.strip_prefix("44") {
            return Err(Error::connection(format!("namespace connect refused: {body}")));
        }
        if packet == "2" {
            stream.send(Message::Text("3".into())).await?;
            continue;
        }
        warn!(%packet, "Unexpected packet during Socket.IO handshake");
    }
}

/// Reads the next text packet, skipping control frames.
async fn next_text(stream: &mut WsStream) -> Result<String> {
    loop {
        match stream.next().await {
            Some(Ok(Message::Text(text))) => return Ok(text.to_string()),
            Some(Ok(Message::Close(_))) | None => {
                return Err(Error::connection("closed during Socket.IO handshake"));
            }
            Some(Ok(_)) => continue,
            Some(Err(e)) => return Err(e.into()),
        }
    }
}

// ============================================================================
// SocketIoCodec
// ============================================================================

/// Maps Socket.IO packets to channel frames.
#[derive(Debug, Default)]
pub(crate) struct SocketIoCodec;

impl FrameCodec for SocketIoCodec {
    fn decode(&mut self, text: &str) -> Decoded {
        if text == "2" {
            return Decoded::Reply("3".to_string());
        }
        if text == "1" || text.starts_with("41") {
            return Decoded::Close(close_code::SERVER_DISCONNECT, "server disconnect".into());
        }
        let Some(body) = text.strip_prefix("42") else {
            return Decoded::Ignore;
        };

        match decode_event(body) {
            Some(envelope) => Decoded::Deliver(envelope.to_string()),
            None => {
                warn!(packet = %text, "Malformed Socket.IO event");
                Decoded::Ignore
            }
        }
    }

    fn encode(&self, frame: String) -> Option<String> {
        let value: Value = match serde_json::from_str(&frame) {
            Ok(value) => value,
            Err(e) => {
                warn!(error = %e, "Dropping non-JSON outbound frame");
                return None;
            }
        };
        let event = value
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or("message")
            .to_string();
        Some(format!("42{}", Value::Array(vec![Value::String(event), value])))
    }
}

/// Turns `["event", payload]` into an envelope value.
fn decode_event(body: &str) -> Option<Value> {
    let Value::Array(mut items) = serde_json::from_str(body).ok()? else {
        return None;
    };
    if items.is_empty() {
        return None;
    }
    let event = items.remove(0).as_str()?.to_string();
    let payload = if items.is_empty() {
        Value::Null
    } else {
        items.remove(0)
    };

    Some(normalize_payload(&event, payload))
}

/// Builds an envelope from an event name and its payload.
///
/// A payload that already names its type is passed through, with a
/// JSON-string `data` field unwrapped. Anything else is wrapped under the
/// event name.
fn normalize_payload(event: &str, payload: Value) -> Value {
    match payload {
        Value::Object(mut object)
            if object.contains_key("type") || object.contains_key("messageType") =>
        {
            if let Some(Value::String(raw)) = object.get("data") {
                if let Ok(inner) = serde_json::from_str::<Value>(raw) {
                    object.insert("data".to_string(), inner);
                }
            }
            Value::Object(object)
        }
        Value::String(raw) => match serde_json::from_str::<Value>(&raw) {
            Ok(inner @ Value::Object(_)) => normalize_payload(event, inner),
            _ => wrap(event, Value::String(raw)),
        },
        other => wrap(event, other),
    }
}

fn wrap(event: &str, data: Value) -> Value {
    let mut object = Map::new();
    object.insert("type".to_string(), Value::String(event.to_string()));
    object.insert("data".to_string(), data);
    object.insert("timestamp".to_string(), Value::from(now_millis()));
    Value::Object(object)
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use serde_json::json;

    fn delivered(decoded: Decoded) -> Value {
        match decoded {
            Decoded::Deliver(frame) => serde_json::from_str(&frame).expect("json"),
            other => panic!("expected Deliver, got {other:?}"),
        }
    }

    #[test]
    fn test_engine_url_from_http() {
        let url = engine_url("http://127.0.0.1:9090").expect("url");
        assert_eq!(url.scheme(), "ws");
        assert_eq!(url.path(), "/socket.io/");
        assert_eq!(url.query(), Some("EIO=4&transport=websocket"));

        let url = engine_url("https://monitor.example.com/custom/").expect("url");
        assert_eq!(url.scheme(), "wss");
        assert_eq!(url.path(), "/custom/");
    }

    #[test]
    fn test_engine_url_rejects_other_schemes() {
        assert!(matches!(
            engine_url("ftp://example.com"),
            Err(Error::Config { .. })
        ));
    }

    #[test]
    fn test_ping_is_answered() {
        assert_eq!(SocketIoCodec.decode("2"), Decoded::Reply("3".into()));
    }

    #[test]
    fn test_disconnect_packets_close() {
        assert!(matches!(
            SocketIoCodec.decode("41"),
            Decoded::Close(close_code::SERVER_DISCONNECT, _)
        ));
        assert!(matches!(SocketIoCodec.decode("1"), Decoded::Close(4001, _)));
        assert_eq!(SocketIoCodec.decode("3"), Decoded::Ignore);
    }

    #[test]
    fn test_event_with_envelope_payload() {
        let packet = r#"42["server_metrics",{"type":"server_metrics","serverId":3,"data":"{\"cpu\":12}"}]"#;
        let value = delivered(SocketIoCodec.decode(packet));
        assert_eq!(value["type"], json!("server_metrics"));
        assert_eq!(value["data"], json!({"cpu": 12}));
        assert_eq!(value["serverId"], json!(3));
    }

    #[test]
    fn test_event_with_bare_payload_is_wrapped() {
        let value = delivered(SocketIoCodec.decode(r#"42["queue_status",{"pending":4}]"#));
        assert_eq!(value["type"], json!("queue_status"));
        assert_eq!(value["data"], json!({"pending": 4}));
        assert!(value["timestamp"].is_i64());
    }

    #[test]
    fn test_event_with_string_payload() {
        let value = delivered(
            SocketIoCodec.decode(r#"42["server_alerts","{\"type\":\"server_alerts\",\"data\":[]}"]"#),
        );
        assert_eq!(value["type"], json!("server_alerts"));
        assert_eq!(value["data"], json!([]));
    }

    #[test]
    fn test_malformed_event_is_ignored() {
        assert_eq!(SocketIoCodec.decode("42not json"), Decoded::Ignore);
        assert_eq!(SocketIoCodec.decode("42[]"), Decoded::Ignore);
    }

    #[test]
    fn test_encode_uses_type_as_event() {
        let encoded = SocketIoCodec
            .encode(r#"{"type":"subscribe","topicId":"gen/server"}"#.into())
            .expect("encoded");
        let body: Value = serde_json::from_str(encoded.strip_prefix("42").expect("prefix"))
            .expect("json");
        assert_eq!(body[0], json!("subscribe"));
        assert_eq!(body[1]["topicId"], json!("gen/server"));

        assert_eq!(SocketIoCodec.encode("plain text".into()), None);
    }
}
