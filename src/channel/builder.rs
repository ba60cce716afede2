//! Builder pattern for channel configuration.
//!
//! Provides a fluent API for configuring and creating [`Channel`] instances.
//!
//! # Example
//!
//! ```ignore
//! use std::time::Duration;
//! use telemetry_channel::{Channel, TransportKind};
//!
//! let channel = Channel::builder()
//!     .address("https://monitor.example.com")
//!     .transport_kind(TransportKind::SocketIo)
//!     .heartbeat_interval(Duration::from_secs(15))
//!     .build()?;
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;
use std::time::Duration;

use tokio::runtime::Handle;
use url::Url;

use crate::error::{Error, Result};
use crate::transport::{SocketIoTransport, SseTransport, Transport, WebSocketTransport};

use super::core::Channel;
use super::options::{ChannelOptions, TransportKind};

// ============================================================================
// ChannelBuilder
// ============================================================================

/// Builder for configuring a [`Channel`] instance.
///
/// Use [`Channel::builder()`] to create a new builder.
#[derive(Default, Clone)]
pub struct ChannelBuilder {
    /// Channel tunables.
    options: ChannelOptions,
    /// Explicit transport, overriding `options.transport`.
    transport: Option<Arc<dyn Transport>>,
}

impl std::fmt::Debug for ChannelBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelBuilder")
            .field("options", &self.options)
            .field("transport", &self.transport.as_ref().map(|t| t.name()))
            .finish()
    }
}

// ============================================================================
// ChannelBuilder Implementation
// ============================================================================

impl ChannelBuilder {
    /// Creates a builder with default options.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces all options at once.
    ///
    /// An address already set on the builder is kept when `options` has none.
    #[must_use]
    pub fn options(mut self, options: ChannelOptions) -> Self {
        let address = options.address.clone().or(self.options.address.take());
        self.options = options;
        self.options.address = address;
        self
    }

    /// Sets the server address.
    ///
    /// # Arguments
    ///
    /// * `address` - `ws://`/`wss://` for WebSocket, `http(s)://` for SSE and Socket.IO
    #[inline]
    #[must_use]
    pub fn address(mut self, address: impl Into<String>) -> Self {
        self.options.address = Some(address.into());
        self
    }

    /// Uses a custom transport instead of one selected by kind.
    #[inline]
    #[must_use]
    pub fn transport(mut self, transport: impl Transport) -> Self {
        self.transport = Some(Arc::new(transport));
        self
    }

    /// Selects a built-in transport.
    #[inline]
    #[must_use]
    pub fn transport_kind(mut self, kind: TransportKind) -> Self {
        self.options.transport = kind;
        self
    }

    /// Sets the heartbeat interval.
    #[inline]
    #[must_use]
    pub fn heartbeat_interval(mut self, interval: Duration) -> Self {
        self.options.heartbeat_interval = interval;
        self
    }

    /// Sets the retry delay base and ceiling.
    #[inline]
    #[must_use]
    pub fn reconnect_backoff(mut self, base: Duration, cap: Duration) -> Self {
        self.options.reconnect_base = base;
        self.options.reconnect_cap = cap;
        self
    }

    /// Sets how many failed retries are tolerated.
    #[inline]
    #[must_use]
    pub fn max_reconnect_attempts(mut self, attempts: u32) -> Self {
        self.options.max_reconnect_attempts = attempts;
        self
    }

    /// Sets the physical open timeout.
    #[inline]
    #[must_use]
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.options.connect_timeout = timeout;
        self
    }

    /// Builds the channel and spawns its driver on the current runtime.
    ///
    /// # Errors
    ///
    /// - [`Error::Config`] if no address is set or an option is invalid
    /// - [`Error::Config`] if called outside a Tokio runtime
    /// - [`Error::Url`] if the SSE control URL does not parse
    pub fn build(self) -> Result<Channel> {
        let address = self.validate_address()?;
        self.options.validate()?;

        let runtime = Handle::try_current().map_err(|_| {
            Error::config(
                "Channel must be built inside a Tokio runtime.\n\
                 Call Channel::builder().build() from an async context.",
            )
        })?;

        let transport = match self.transport {
            Some(transport) => transport,
            None => default_transport(&self.options)?,
        };

        Ok(Channel::start(address, transport, &self.options, runtime))
    }
}

// ============================================================================
// Validation
// ============================================================================

impl ChannelBuilder {
    /// Validates the address configuration.
    fn validate_address(&self) -> Result<String> {
        let address = self
            .options
            .address
            .as_deref()
            .map(str::trim)
            .filter(|a| !a.is_empty())
            .ok_or_else(|| {
                Error::config(
                    "Server address is required. Use .address() to set it.\n\
                     Example: Channel::builder().address(\"ws://127.0.0.1:9000/ws\")",
                )
            })?;
        Ok(address.to_string())
    }
}

/// Creates the transport named by `options.transport`.
fn default_transport(options: &ChannelOptions) -> Result<Arc<dyn Transport>> {
    let transport: Arc<dyn Transport> = match options.transport {
        TransportKind::WebSocket => {
            Arc::new(WebSocketTransport::new().with_connect_timeout(options.connect_timeout))
        }
        TransportKind::SocketIo => {
            Arc::new(SocketIoTransport::new().with_connect_timeout(options.connect_timeout))
        }
        TransportKind::Sse => {
            let mut sse = SseTransport::new().with_connect_timeout(options.connect_timeout);
            if let Some(control) = &options.sse_control_url {
                sse = sse.with_control_url(Url::parse(control)?);
            }
            Arc::new(sse)
        }
    };
    Ok(transport)
}

// ============================================================================
// Tests
// ============================================================================
