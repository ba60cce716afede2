//! Telemetry Channel - Reconnecting real-time push client.
//!
//! This library keeps one long-lived push connection to a monitoring server,
//! multiplexes many topic subscriptions over it and feeds bounded in-memory
//! caches that back UI state.
//!
//! # Architecture
//!
//! The channel is written once against a transport capability:
//!
//! - **Transport (wire)**: WebSocket, Server-Sent Events or Socket.IO
//! - **Channel (lifecycle)**: heartbeat, bounded backoff, subscription replay
//! - **Dispatch (fan-out)**: per-type handlers with failure isolation
//! - **Caches (state)**: bounded maps evicting the least recently updated entry
//!
//! Key design principles:
//!
//! - Each [`Channel`] owns one driver task; no global singletons
//! - Connection state changes in exactly one place, tagged by epoch
//! - Envelope `data` stays untyped JSON until a handler narrows it
//! - Only an exhausted retry budget surfaces as an error
//!
//! # Quick Start
//!
//! ```no_run
//! use telemetry_channel::{Channel, Params, Result};
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let channel = Channel::builder()
//!         .address("ws://127.0.0.1:9000/ws")
//!         .build()?;
//!
//!     let _metrics = channel.on("server_metrics", |envelope| {
//!         println!("metrics: {}", envelope.data);
//!         Ok(())
//!     });
//!     let _topic = channel.subscribe("gen/server", Params::new());
//!
//!     channel.connect().await?;
//!     Ok(())
//! }
//! ```
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`cache`] | Bounded caches and read handles |
//! | [`channel`] | [`Channel`], builder, options, lifecycle state machines |
//! | [`dispatch`] | Message handlers and guards |
//! | [`error`] | Error types and [`Result`] alias |
//! | [`feeds`] | Server metrics and file transfer consumers |
//! | [`identifiers`] | Topic, handler and cache key types |
//! | [`protocol`] | Envelope and control frames |
//! | [`transport`] | Wire protocols and the connection state owner |

// ============================================================================
// Modules
// ============================================================================

/// Bounded caches.
///
/// - [`BoundedCache`] - Fixed-capacity map
/// - [`CacheReader`] - Shared read handle
pub mod cache;

/// Connection lifecycle.
///
/// Use [`Channel::builder()`] to create a configured channel.
pub mod channel;

/// Message dispatch.
pub mod dispatch;

/// Error types and result aliases.
///
/// All fallible operations return [`Result<T>`] which uses [`Error`].
pub mod error;

/// Ready-made telemetry consumers.
pub mod feeds;

/// Type-safe identifiers.
pub mod identifiers;

/// Wire message types.
pub mod protocol;

/// Transport layer.
///
/// Wire protocol implementations and the connection state owner.
pub mod transport;

// ============================================================================
// Re-exports
// ============================================================================

// Cache types
pub use cache::{BoundedCache, CacheEntry, CacheReader};

// Channel types
pub use channel::{
    Channel, ChannelBuilder, ChannelNotice, ChannelOptions, ChannelStatus, Params, Subscription,
    TransportKind,
};

// Dispatch types
pub use dispatch::{Dispatcher, HandlerError, HandlerGuard, HandlerResult};

// Error types
pub use error::{Error, Result};

// Feed types
pub use feeds::{FileTransferFeed, ServerMetricsFeed};

// Identifier types
pub use identifiers::{CacheKey, HandlerId, TopicId};

// Protocol types
pub use protocol::{ControlMessage, MessageEnvelope};

// Transport types
pub use transport::{
    ConnectionState, MemoryRemote, MemoryTransport, SocketIoTransport, SseTransport, Transport,
    WebSocketTransport,
};
