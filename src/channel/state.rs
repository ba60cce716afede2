//! Observable channel state.
//!
//! [`ChannelStatus`] is a snapshot published on a `watch` channel after every
//! change. [`ChannelNotice`] is a one-shot event for user-facing
//! notifications, published on a `broadcast` channel.

// ============================================================================
// Imports
// ============================================================================

use std::time::Duration;

use serde::Serialize;

use crate::transport::ConnectionState;

// ============================================================================
// ChannelStatus
// ============================================================================

/// Snapshot of the channel for UI bindings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelStatus {
    /// Connection state.
    pub state: ConnectionState,
    /// `true` while connected.
    pub connected: bool,
    /// `true` while an open is in flight or a retry is pending.
    pub connecting: bool,
    /// Retries since the last successful connect.
    pub reconnect_attempts: u32,
    /// Most recent transport error, or the give-up message.
    pub last_error: Option<String>,
    /// Id assigned by the server in its `connected` frame.
    pub client_id: Option<String>,
}

impl ChannelStatus {
    /// Returns `true` once retries are exhausted.
    #[inline]
    #[must_use]
    pub fn is_failed(&self) -> bool {
        self.state == ConnectionState::Failed
    }
}

// ============================================================================
// ChannelNotice
// ============================================================================

/// User-facing connection event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelNotice {
    /// Connection established.
    Connected,
    /// Connection lost or closed.
    Disconnected {
        /// Close code.
        code: u16,
        /// Close reason.
        reason: String,
    },
    /// Retry scheduled.
    Reconnecting {
        /// One-based retry number.
        attempt: u32,
        /// Wait before the retry.
        delay: Duration,
    },
    /// Retries exhausted.
    GivenUp {
        /// Retries performed.
        attempts: u32,
    },
}

// ============================================================================
// Tests
// ============================================================================
