//! Inbound message envelope.
//!
//! Every text frame received from the server is parsed into a
//! [`MessageEnvelope`] before dispatch.
//!
//! # Format
//!
//! ```json
//! {
//!   "type": "server_metrics",
//!   "topicId": "gen/server",
//!   "data": { ... },
//!   "timestamp": 1718000000000
//! }
//! ```
//!
//! `messageType` is accepted in place of `type`, a missing `data` becomes
//! `null`, a missing `timestamp` is replaced by the receive time and any other
//! top-level fields are kept in [`MessageEnvelope::extra`].

// ============================================================================
// Imports
// ============================================================================

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Error, Result};
use crate::identifiers::TopicId;

use super::now_millis;

// ============================================================================
// WireEnvelope
// ============================================================================

/// Lenient wire representation, normalised into [`MessageEnvelope`].
#[derive(Deserialize)]
struct WireEnvelope {
    #[serde(rename = "type", alias = "messageType")]
    message_type: String,

    #[serde(rename = "topicId", default)]
    topic_id: Option<TopicId>,

    #[serde(default)]
    data: Value,

    #[serde(default)]
    timestamp: Option<Value>,

    #[serde(flatten)]
    extra: Map<String, Value>,
}

// ============================================================================
// MessageEnvelope
// ============================================================================

/// Parsed representation of one inbound frame.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MessageEnvelope {
    /// Message type used for handler fan-out.
    #[serde(rename = "type")]
    pub message_type: String,

    /// Topic the message belongs to, if the server tagged it.
    #[serde(rename = "topicId", skip_serializing_if = "Option::is_none")]
    pub topic_id: Option<TopicId>,

    /// Untyped payload.
    pub data: Value,

    /// Server timestamp in milliseconds (receive time when absent).
    pub timestamp: i64,

    /// Remaining top-level fields (e.g. `serverId`, `serverName`).
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl MessageEnvelope {
    /// Creates an envelope stamped with the current time.
    #[must_use]
    pub fn new(message_type: impl Into<String>, data: Value) -> Self {
        Self {
            message_type: message_type.into(),
            topic_id: None,
            data,
            timestamp: now_millis(),
            extra: Map::new(),
        }
    }

    /// Sets the topic id.
    #[inline]
    #[must_use]
    pub fn with_topic(mut self, topic: impl Into<TopicId>) -> Self {
        self.topic_id = Some(topic.into());
        self
    }

    /// Adds a top-level field.
    #[inline]
    #[must_use]
    pub fn with_extra(mut self, key: impl Into<String>, value: Value) -> Self {
        self.extra.insert(key.into(), value);
        self
    }

    /// Parses a raw text frame.
    ///
    /// # Errors
    ///
    /// - [`Error::Json`] if the frame is not a JSON object with a `type`
    /// - [`Error::Protocol`] if `type` is empty
    pub fn parse(raw: &str) -> Result<Self> {
        let wire: WireEnvelope = serde_json::from_str(raw)?;

        if wire.message_type.is_empty() {
            return Err(Error::protocol("envelope type is empty"));
        }

        let timestamp = wire
            .timestamp
            .as_ref()
            .and_then(|v| v.as_i64().or_else(|| v.as_f64().map(|f| f as i64)))
            .unwrap_or_else(now_millis);

        Ok(Self {
            message_type: wire.message_type,
            topic_id: wire.topic_id,
            data: wire.data,
            timestamp,
            extra: wire.extra,
        })
    }

    /// Serializes the envelope back to a text frame.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Json`] if serialization fails.
    pub fn to_frame(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Deserializes `data` into the shape a handler expects.
    ///
    /// # Errors
    ///
    /// Returns the serde error when `data` does not match `T`.
    pub fn data_as<T: DeserializeOwned>(&self) -> serde_json::Result<T> {
        T::deserialize(&self.data)
    }

    /// Looks up a field in `data` first, then among the top-level extras.
    #[must_use]
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.data
            .get(name)
            .filter(|v| !v.is_null())
            .or_else(|| self.extra.get(name))
    }
}

// ============================================================================
// Tests
// ============================================================================
