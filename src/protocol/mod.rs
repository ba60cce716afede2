//! Wire message types.
//!
//! This module defines the frames exchanged over a physical connection.
//!
//! # Protocol Overview
//!
//! | Message Type | Direction | Purpose |
//! |--------------|-----------|---------|
//! | [`MessageEnvelope`] | Server → Client | Telemetry update for one message type |
//! | [`ControlMessage`] | Client → Server | Topic subscribe / unsubscribe |
//! | [`HeartbeatFrame`] | Client → Server | Liveness probe |
//!
//! Envelope `data` is kept as untyped JSON at this boundary; handlers narrow
//! it to the shape they expect.

// ============================================================================
// Submodules
// ============================================================================

/// Subscribe, unsubscribe and heartbeat frames.
pub mod control;

/// Inbound message envelope.
pub mod envelope;

// ============================================================================
// Re-exports
// ============================================================================

pub use control::{ControlKind, ControlMessage, HeartbeatFrame, is_ack_type};
pub use envelope::MessageEnvelope;

// ============================================================================
// Clock
// ============================================================================

/// Current wall-clock time in milliseconds since the Unix epoch.
#[inline]
#[must_use]
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
