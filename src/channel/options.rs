//! Channel configuration.
//!
//! [`ChannelOptions`] carries every tunable of a channel. Defaults match the
//! behaviour the admin console shipped with: 30 s heartbeat, 1 s base backoff
//! capped at 30 s, five retries, 10 s open timeout.
//!
//! # Environment
//!
//! [`ChannelOptions::from_env`] loads a `.env` file if present, then reads:
//!
//! | Variable | Field | Default |
//! |----------|-------|---------|
//! | `TELEMETRY_ADDRESS` | `address` | unset |
//! | `TELEMETRY_TRANSPORT` | `transport` | `websocket` |
//! | `TELEMETRY_HEARTBEAT_SECS` | `heartbeat_interval` | `30` |
//! | `TELEMETRY_RECONNECT_BASE_MS` | `reconnect_base` | `1000` |
//! | `TELEMETRY_RECONNECT_CAP_MS` | `reconnect_cap` | `30000` |
//! | `TELEMETRY_RECONNECT_MAX_ATTEMPTS` | `max_reconnect_attempts` | `5` |
//! | `TELEMETRY_CONNECT_TIMEOUT_SECS` | `connect_timeout` | `10` |
//! | `TELEMETRY_SSE_CONTROL_URL` | `sse_control_url` | unset |
//!
//! Missing or unparsable values fall back to the default.
//!
//! # Example
//!
//! ```ignore
//! use std::time::Duration;
//! use telemetry_channel::{ChannelOptions, TransportKind};
//!
//! let options = ChannelOptions::new()
//!     .with_address("https://monitor.example.com")
//!     .with_transport(TransportKind::SocketIo)
//!     .with_heartbeat_interval(Duration::from_secs(15));
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{Error, Result};

// ============================================================================
// Constants
// ============================================================================

/// Default heartbeat interval.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Default first retry delay.
pub const DEFAULT_RECONNECT_BASE: Duration = Duration::from_secs(1);

/// Default retry delay ceiling.
pub const DEFAULT_RECONNECT_CAP: Duration = Duration::from_secs(30);

/// Default number of retries before giving up.
pub const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 5;

/// Default physical open timeout.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default capacity of the notice broadcast.
pub const DEFAULT_NOTICE_CAPACITY: usize = 64;

// ============================================================================
// TransportKind
// ============================================================================

/// Wire protocol selected by configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum TransportKind {
    /// Plain JSON over WebSocket.
    #[default]
    WebSocket,
    /// Server-Sent Events.
    Sse,
    /// Socket.IO over WebSocket.
    SocketIo,
}

impl TransportKind {
    /// Returns the configuration name.
    #[inline]
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::WebSocket => "websocket",
            Self::Sse => "sse",
            Self::SocketIo => "socketio",
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransportKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "websocket" | "ws" => Ok(Self::WebSocket),
            "sse" | "eventsource" => Ok(Self::Sse),
            "socketio" | "socket.io" | "sio" => Ok(Self::SocketIo),
            other => Err(Error::config(format!("unknown transport: {other}"))),
        }
    }
}

// ============================================================================
// ChannelOptions
// ============================================================================

/// Tunables of a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelOptions {
    /// Server address (`ws://`, `http://`, ...).
    pub address: Option<String>,

    /// Wire protocol used when no transport is supplied explicitly.
    pub transport: TransportKind,

    /// Heartbeat period while connected.
    pub heartbeat_interval: Duration,

    /// Delay before the first retry.
    pub reconnect_base: Duration,

    /// Upper bound of the retry delay.
    pub reconnect_cap: Duration,

    /// Consecutive failed retries before giving up.
    pub max_reconnect_attempts: u32,

    /// Bound on a single physical open.
    pub connect_timeout: Duration,

    /// URL receiving outbound frames for the SSE transport.
    pub sse_control_url: Option<String>,

    /// Buffered notices per subscriber before lagging.
    pub notice_capacity: usize,
}

impl Default for ChannelOptions {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Constructors
// ============================================================================

impl ChannelOptions {
    /// Creates options with default values and no address.
    #[inline]
    #[must_use]
    pub const fn new() -> Self {
        Self {
            address: None,
            transport: TransportKind::WebSocket,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            reconnect_base: DEFAULT_RECONNECT_BASE,
            reconnect_cap: DEFAULT_RECONNECT_CAP,
            max_reconnect_attempts: DEFAULT_MAX_RECONNECT_ATTEMPTS,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            sse_control_url: None,
            notice_capacity: DEFAULT_NOTICE_CAPACITY,
        }
    }

    /// Loads options from `TELEMETRY_*` environment variables.
    ///
    /// Reads a `.env` file first when one exists.
    #[must_use]
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();

        let defaults = Self::new();

        Self {
            address: non_empty_env("TELEMETRY_ADDRESS"),
            transport: parse_env("TELEMETRY_TRANSPORT", defaults.transport),
            heartbeat_interval: Duration::from_secs(parse_env(
                "TELEMETRY_HEARTBEAT_SECS",
                defaults.heartbeat_interval.as_secs(),
            )),
            reconnect_base: Duration::from_millis(parse_env(
                "TELEMETRY_RECONNECT_BASE_MS",
                defaults.reconnect_base.as_millis() as u64,
            )),
            reconnect_cap: Duration::from_millis(parse_env(
                "TELEMETRY_RECONNECT_CAP_MS",
                defaults.reconnect_cap.as_millis() as u64,
            )),
            max_reconnect_attempts: parse_env(
                "TELEMETRY_RECONNECT_MAX_ATTEMPTS",
                defaults.max_reconnect_attempts,
            ),
            connect_timeout: Duration::from_secs(parse_env(
                "TELEMETRY_CONNECT_TIMEOUT_SECS",
                defaults.connect_timeout.as_secs(),
            )),
            sse_control_url: non_empty_env("TELEMETRY_SSE_CONTROL_URL"),
            notice_capacity: defaults.notice_capacity,
        }
    }
}

// ============================================================================
// Builder Methods
// ============================================================================

impl ChannelOptions {
    /// Sets the server address.
    #[inline]
    #[must_use]
    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.address = Some(address.into());
        self
    }

    /// Selects the wire protocol.
    #[inline]
    #[must_use]
    pub fn with_transport(mut self, transport: TransportKind) -> Self {
        self.transport = transport;
        self
    }

    /// Sets the heartbeat interval.
    #[inline]
    #[must_use]
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// Sets the retry delay base and ceiling.
    #[inline]
    #[must_use]
    pub fn with_reconnect_backoff(mut self, base: Duration, cap: Duration) -> Self {
        self.reconnect_base = base;
        self.reconnect_cap = cap;
        self
    }

    /// Sets how many failed retries are tolerated.
    #[inline]
    #[must_use]
    pub fn with_max_reconnect_attempts(mut self, attempts: u32) -> Self {
        self.max_reconnect_attempts = attempts;
        self
    }

    /// Sets the physical open timeout.
    #[inline]
    #[must_use]
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Sets the SSE control URL.
    #[inline]
    #[must_use]
    pub fn with_sse_control_url(mut self, url: impl Into<String>) -> Self {
        self.sse_control_url = Some(url.into());
        self
    }

    /// Sets the notice buffer per subscriber.
    #[inline]
    #[must_use]
    pub fn with_notice_capacity(mut self, capacity: usize) -> Self {
        self.notice_capacity = capacity;
        self
    }
}

// ============================================================================
// Validation
// ============================================================================

impl ChannelOptions {
    /// Checks the options for values the channel cannot run with.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] when a duration is zero, the backoff ceiling
    /// is below its base or the notice capacity is zero.
    pub fn validate(&self) -> Result<()> {
        if self.heartbeat_interval.is_zero() {
            return Err(Error::config("heartbeat interval must be greater than zero"));
        }
        if self.reconnect_base.is_zero() {
            return Err(Error::config("reconnect base delay must be greater than zero"));
        }
        if self.reconnect_cap < self.reconnect_base {
            return Err(Error::config(format!(
                "reconnect cap ({}ms) is below the base delay ({}ms)",
                self.reconnect_cap.as_millis(),
                self.reconnect_base.as_millis()
            )));
        }
        if self.connect_timeout.is_zero() {
            return Err(Error::config("connect timeout must be greater than zero"));
        }
        if self.notice_capacity == 0 {
            return Err(Error::config("notice capacity must be greater than zero"));
        }
        Ok(())
    }
}

// ============================================================================
// Helpers
// ============================================================================

/// Parses an environment variable as `T`, returning `default` on missing
/// or invalid values.
fn parse_env<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Reads an environment variable, treating blank values as unset.
fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

// ============================================================================
// Tests
// ============================================================================
