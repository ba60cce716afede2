//! Control frames sent by the client.
//!
//! # Format
//!
//! Subscribe / unsubscribe:
//! ```json
//! { "type": "subscribe", "topicId": "gen/server", "params": { ... }, "timestamp": 0 }
//! ```
//!
//! Heartbeat:
//! ```json
//! { "type": "heartbeat", "timestamp": 0 }
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::identifiers::TopicId;

use super::now_millis;

// ============================================================================
// ControlKind
// ============================================================================

/// Kind of topic control message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ControlKind {
    /// Start receiving a topic.
    Subscribe,
    /// Stop receiving a topic.
    Unsubscribe,
}

// ============================================================================
// ControlMessage
// ============================================================================

/// Topic control message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlMessage {
    /// Subscribe or unsubscribe.
    #[serde(rename = "type")]
    pub kind: ControlKind,

    /// Target topic.
    #[serde(rename = "topicId")]
    pub topic_id: TopicId,

    /// Topic parameters (omitted when empty).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<BTreeMap<String, String>>,

    /// Client timestamp in milliseconds.
    pub timestamp: i64,
}

impl ControlMessage {
    /// Creates a subscribe message.
    #[must_use]
    pub fn subscribe(topic_id: TopicId, params: &BTreeMap<String, String>) -> Self {
        Self {
            kind: ControlKind::Subscribe,
            topic_id,
            params: (!params.is_empty()).then(|| params.clone()),
            timestamp: now_millis(),
        }
    }

    /// Creates an unsubscribe message.
    #[must_use]
    pub fn unsubscribe(topic_id: TopicId) -> Self {
        Self {
            kind: ControlKind::Unsubscribe,
            topic_id,
            params: None,
            timestamp: now_millis(),
        }
    }

    /// Serializes to a text frame.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Json`](crate::Error::Json) if serialization fails.
    pub fn to_frame(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

// ============================================================================
// HeartbeatFrame
// ============================================================================

/// Application-level liveness probe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HeartbeatFrame {
    /// Always `"heartbeat"`.
    #[serde(rename = "type")]
    pub frame_type: &'static str,

    /// Client timestamp in milliseconds.
    pub timestamp: i64,
}

impl HeartbeatFrame {
    /// Creates a heartbeat stamped now.
    #[inline]
    #[must_use]
    pub fn now() -> Self {
        Self {
            frame_type: "heartbeat",
            timestamp: now_millis(),
        }
    }

    /// Serializes to a text frame.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Json`](crate::Error::Json) if serialization fails.
    pub fn to_frame(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Returns `true` for server acknowledgements of a heartbeat or handshake.
#[inline]
#[must_use]
pub fn is_ack_type(message_type: &str) -> bool {
    matches!(message_type, "pong" | "ping" | "heartbeat" | "connected")
}

// ============================================================================
// Tests
// ============================================================================
