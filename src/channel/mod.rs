//! Connection lifecycle.
//!
//! A [`Channel`] keeps one push connection alive: it sends heartbeats,
//! reconnects with bounded backoff, replays topic subscriptions on every
//! connect and routes inbound frames to handlers and caches.
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `builder` | Fluent construction of a [`Channel`] |
//! | `core` | Driver task and public channel handle |
//! | `heartbeat` | Liveness probe schedule |
//! | `options` | Tunables and environment loading |
//! | `reconnect` | Exponential backoff state machine |
//! | `registry` | Topic holders and replay |
//! | `state` | Status snapshots and notices |

// ============================================================================
// Submodules
// ============================================================================

/// Builder pattern for channel configuration.
pub mod builder;

/// Channel runtime.
pub mod core;

/// Heartbeat monitor.
pub mod heartbeat;

/// Channel options.
pub mod options;

/// Reconnect controller.
pub mod reconnect;

/// Subscription registry.
pub mod registry;

/// Observable channel state.
pub mod state;

// ============================================================================
// Re-exports
// ============================================================================

pub use builder::ChannelBuilder;
pub use core::{Channel, Subscription};
pub use heartbeat::{HeartbeatAction, HeartbeatMonitor};
pub use options::{ChannelOptions, TransportKind};
pub use reconnect::{ReconnectController, ReconnectPhase, ReconnectPolicy, ScheduleOutcome};
pub use registry::{AddOutcome, Params, SubscriptionRegistry};
pub use state::{ChannelNotice, ChannelStatus};
