//! Channel runtime.
//!
//! A [`Channel`] owns one transport adapter, heartbeat monitor, reconnect
//! controller and subscription registry, all behind a single lock. A driver
//! task per channel processes transport events and timer deadlines in order.
//!
//! # Driver Loop
//!
//! ```text
//! loop {
//!     deadline = min(heartbeat tick, retry timer)
//!     select {
//!         transport event  => handle (epoch-checked)
//!         wake-up          => recompute deadline
//!         deadline         => heartbeat tick / retry fire
//!     }
//! }
//! ```
//!
//! Handlers run on the driver task without the lock held, so they may call
//! back into the channel.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::future::pending;
use std::sync::{Arc, Weak};
use std::time::Duration;

use serde::de::DeserializeOwned;
use tokio::runtime::Handle;
use tokio::sync::{Notify, broadcast, mpsc, watch};
use tokio::time::{Instant, sleep_until, timeout};
use tracing::{debug, error, info, trace, warn};

use crate::cache::{CacheReader, CacheRegistry, CacheStore};
use crate::dispatch::{Dispatcher, HandlerError, HandlerGuard, HandlerResult};
use crate::error::{Error, Result};
use crate::identifiers::{CacheKey, HolderId, TopicId};
use crate::protocol::{ControlMessage, HeartbeatFrame, MessageEnvelope, is_ack_type};
use crate::transport::adapter::CloseOutcome;
use crate::transport::{
    ConnectionState, EventSink, Link, TaggedEvent, Transport, TransportAdapter, TransportEvent,
    close_code,
};

use super::builder::ChannelBuilder;
use super::heartbeat::{HeartbeatAction, HeartbeatMonitor};
use super::options::ChannelOptions;
use super::reconnect::{ReconnectController, ReconnectPolicy, ScheduleOutcome};
use super::registry::{Params, SubscriptionRegistry};
use super::state::{ChannelNotice, ChannelStatus};

// ============================================================================
// Core
// ============================================================================

/// Lifecycle state guarded by the channel lock.
#[derive(Debug)]
struct Core {
    adapter: TransportAdapter,
    heartbeat: HeartbeatMonitor,
    reconnect: ReconnectController,
    registry: SubscriptionRegistry,
    last_error: Option<String>,
    client_id: Option<String>,
    disposed: bool,
}

impl Core {
    fn status(&self) -> ChannelStatus {
        let state = self.adapter.state();
        ChannelStatus {
            state,
            connected: state == ConnectionState::Connected,
            connecting: state.is_connecting(),
            reconnect_attempts: self.reconnect.attempts(),
            last_error: self.last_error.clone(),
            client_id: self.client_id.clone(),
        }
    }

    fn is_connected(&self) -> bool {
        self.adapter.state() == ConnectionState::Connected
    }

    fn next_deadline(&self) -> Option<Instant> {
        match (self.heartbeat.deadline(), self.reconnect.deadline()) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Sends a control message if connected.
    fn send_control(&self, message: &ControlMessage) -> bool {
        if !self.is_connected() {
            return false;
        }
        match message.to_frame() {
            Ok(frame) => self.adapter.send(frame),
            Err(e) => {
                warn!(error = %e, topic = %message.topic_id, "Failed to encode control message");
                false
            }
        }
    }
}

// ============================================================================
// Inner
// ============================================================================

/// Shared channel state.
pub(crate) struct Inner {
    address: String,
    transport: Arc<dyn Transport>,
    connect_timeout: Duration,
    runtime: Handle,
    core: parking_lot::Mutex<Core>,
    dispatcher: Dispatcher,
    caches: CacheRegistry,
    events_tx: mpsc::UnboundedSender<TaggedEvent>,
    wake: Arc<Notify>,
    status_tx: watch::Sender<ChannelStatus>,
    notices_tx: broadcast::Sender<ChannelNotice>,
}

impl Inner {
    // ------------------------------------------------------------------------
    // Publishing
    // ------------------------------------------------------------------------

    fn publish(&self, core: &Core) {
        let status = core.status();
        self.status_tx.send_if_modified(|current| {
            if *current == status {
                return false;
            }
            *current = status;
            true
        });
    }

    fn notify(&self, notice: ChannelNotice) {
        // No subscribers is fine
        let _ = self.notices_tx.send(notice);
    }

    fn is_disposed(&self) -> bool {
        self.core.lock().disposed
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.core.lock().next_deadline()
    }

    // ------------------------------------------------------------------------
    // Opening
    // ------------------------------------------------------------------------

    /// Runs one physical open on the runtime.
    fn spawn_open(&self, epoch: u64) {
        let transport = Arc::clone(&self.transport);
        let address = self.address.clone();
        let sink = EventSink::new(epoch, self.events_tx.clone());
        let connect_timeout = self.connect_timeout;

        debug!(epoch, transport = transport.name(), %address, "Opening connection");

        self.runtime.spawn(async move {
            let result = match timeout(connect_timeout, transport.connect(&address, sink.clone()))
                .await
            {
                Ok(result) => result,
                Err(_) => Err(Error::connection_timeout(connect_timeout.as_millis() as u64)),
            };

            if let Err(e) = result {
                warn!(epoch, error = %e, "Open failed");
                sink.error(e.to_string());
                sink.closed(close_code::ABNORMAL, e.to_string());
            }
        });
    }

    /// Arms a retry after an unexpected closure, or gives up.
    fn schedule_retry(&self, core: &mut Core) {
        match core.reconnect.schedule(Instant::now()) {
            ScheduleOutcome::Scheduled { attempt, delay } => {
                info!(
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "Reconnect scheduled"
                );
                self.notify(ChannelNotice::Reconnecting { attempt, delay });
            }
            ScheduleOutcome::AlreadyWaiting => {}
            ScheduleOutcome::GivenUp { attempts } => {
                core.adapter.mark_failed();
                let err = Error::given_up(attempts);
                error!(attempts, address = %self.address, "Reconnect attempts exhausted");
                core.last_error = Some(err.to_string());
                self.notify(ChannelNotice::GivenUp { attempts });
            }
        }
    }

    // ------------------------------------------------------------------------
    // Transport Events
    // ------------------------------------------------------------------------

    fn handle_event(&self, epoch: u64, event: TransportEvent) {
        match event {
            TransportEvent::Opened(link) => self.on_opened(epoch, link),
            TransportEvent::Message(frame) => self.on_message(epoch, &frame),
            TransportEvent::Error(message) => self.on_error(epoch, message),
            TransportEvent::Closed { code, reason } => self.on_closed(epoch, code, reason),
        }
    }

    fn on_opened(&self, epoch: u64, link: Box<dyn Link>) {
        let rejected = {
            let mut core = self.core.lock();
            match core.adapter.on_opened(epoch, link) {
                Err(link) => Some(link),
                Ok(()) => {
                    core.reconnect.on_connected();
                    core.heartbeat.start(Instant::now());
                    core.last_error = None;

                    // Replay before any frame of this connection is dispatched
                    let replay = core.registry.replay_all();
                    for message in &replay {
                        core.send_control(message);
                    }

                    info!(
                        epoch,
                        transport = self.transport.name(),
                        topics = replay.len(),
                        "Channel connected"
                    );
                    self.publish(&core);
                    self.notify(ChannelNotice::Connected);
                    None
                }
            }
        };

        if let Some(link) = rejected {
            link.close(close_code::NORMAL, "superseded");
        }
    }

    fn on_message(&self, epoch: u64, frame: &str) {
        {
            let mut core = self.core.lock();
            if !core.adapter.is_current(epoch) || !core.is_connected() {
                trace!(epoch, "Frame from detached connection dropped");
                return;
            }
            core.heartbeat.record_inbound();
        }

        let envelope = match MessageEnvelope::parse(frame) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(error = %e, frame_len = frame.len(), "Dropped unparsable frame");
                return;
            }
        };

        if is_ack_type(&envelope.message_type) {
            trace!(message_type = %envelope.message_type, "Server acknowledgement");
        }

        if envelope.message_type == "connected"
            && let Some(client_id) = envelope.field("clientId").and_then(|v| v.as_str())
        {
            let mut core = self.core.lock();
            core.client_id = Some(client_id.to_string());
            debug!(client_id, "Client id assigned");
            self.publish(&core);
        }

        self.dispatcher.deliver(&envelope);
    }

    fn on_error(&self, epoch: u64, message: String) {
        let mut core = self.core.lock();
        if !core.adapter.is_current(epoch) {
            return;
        }
        warn!(epoch, error = %message, "Transport error");
        core.last_error = Some(message);
        self.publish(&core);
    }

    fn on_closed(&self, epoch: u64, code: u16, reason: String) {
        let mut core = self.core.lock();
        let was_connected = core.is_connected();
        let Some(outcome) = core.adapter.on_closed(epoch, code) else {
            trace!(epoch, code, "Close from detached connection ignored");
            return;
        };

        core.heartbeat.stop();

        if was_connected {
            self.notify(ChannelNotice::Disconnected {
                code,
                reason: reason.clone(),
            });
        }

        match outcome {
            CloseOutcome::Normal => {
                info!(code, %reason, "Connection closed by server");
                core.reconnect.reset();
            }
            CloseOutcome::Unexpected => {
                if was_connected {
                    warn!(code, %reason, "Connection lost");
                } else {
                    debug!(code, %reason, "Open attempt failed");
                }
                if core.last_error.is_none() {
                    core.last_error = Some(if reason.is_empty() {
                        format!("connection closed with code {code}")
                    } else {
                        reason
                    });
                }
                self.schedule_retry(&mut core);
            }
        }

        self.publish(&core);
    }

    // ------------------------------------------------------------------------
    // Timers
    // ------------------------------------------------------------------------

    fn on_deadline(&self, now: Instant) {
        let open_epoch = {
            let mut core = self.core.lock();

            match core.heartbeat.tick(now) {
                HeartbeatAction::Idle => {}
                HeartbeatAction::Probe => match HeartbeatFrame::now().to_frame() {
                    Ok(frame) => {
                        if core.adapter.send(frame) {
                            trace!("Heartbeat sent");
                        } else {
                            debug!("Heartbeat not sent");
                        }
                    }
                    Err(e) => warn!(error = %e, "Failed to encode heartbeat"),
                },
                HeartbeatAction::Stale => {
                    let interval_ms = core.heartbeat.interval().as_millis() as u64;
                    if core.adapter.force_stale() {
                        warn!(interval_ms, "Heartbeat unanswered, forcing reconnect");
                        core.last_error = Some("heartbeat timeout".to_string());
                        self.notify(ChannelNotice::Disconnected {
                            code: close_code::STALE,
                            reason: "heartbeat timeout".to_string(),
                        });
                        self.schedule_retry(&mut core);
                    }
                }
            }

            let epoch = if core.reconnect.fire(now) {
                debug!(attempt = core.reconnect.attempts(), "Reconnect attempt");
                core.adapter.begin_open()
            } else {
                None
            };

            self.publish(&core);
            epoch
        };

        if let Some(epoch) = open_epoch {
            self.spawn_open(epoch);
        }
    }

    // ------------------------------------------------------------------------
    // Topics
    // ------------------------------------------------------------------------

    fn add_holder(&self, topic: &TopicId, params: Params, holder: HolderId) {
        let mut core = self.core.lock();
        let outcome = core.registry.add(topic.clone(), params, holder);
        debug!(%topic, ?outcome, "Topic registered");

        if outcome.needs_subscribe() {
            let params = core.registry.params(topic.as_str()).cloned().unwrap_or_default();
            core.send_control(&ControlMessage::subscribe(topic.clone(), &params));
        }
    }

    fn release_holder(&self, topic: &TopicId, holder: HolderId) {
        let mut core = self.core.lock();
        if core.registry.release(topic.as_str(), holder) {
            debug!(%topic, "Topic released");
            core.send_control(&ControlMessage::unsubscribe(topic.clone()));
        }
    }

    fn remove_topic(&self, topic: &str) -> bool {
        let mut core = self.core.lock();
        if !core.registry.remove(topic) {
            return false;
        }
        debug!(topic, "Topic unsubscribed");
        core.send_control(&ControlMessage::unsubscribe(TopicId::from(topic)));
        true
    }

    // ------------------------------------------------------------------------
    // Shutdown
    // ------------------------------------------------------------------------

    /// Closes the connection on purpose and cancels all timers.
    ///
    /// A given-up channel keeps its state and error until `reconnect()`;
    /// only disposal clears it.
    fn shut_connection(&self, code: u16, reason: &str, dispose: bool) {
        {
            let mut core = self.core.lock();
            if !dispose && core.adapter.state() == ConnectionState::Failed {
                debug!("Disconnect on a given-up channel keeps it failed");
                return;
            }
            let was_active = core.adapter.close(code, reason);
            core.heartbeat.stop();
            core.reconnect.reset();
            core.client_id = None;
            core.last_error = None;
            if dispose {
                core.disposed = true;
            }

            if was_active {
                info!(code, reason, "Channel disconnected");
                self.notify(ChannelNotice::Disconnected {
                    code,
                    reason: reason.to_string(),
                });
            }
            self.publish(&core);
        }
        self.wake.notify_one();
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.core
            .get_mut()
            .adapter
            .close(close_code::GOING_AWAY, "channel dropped");
        self.wake.notify_one();
    }
}

// ============================================================================
// Driver
// ============================================================================

/// Serially processes events and deadlines until the channel goes away.
async fn drive(
    weak: Weak<Inner>,
    mut events: mpsc::UnboundedReceiver<TaggedEvent>,
    wake: Arc<Notify>,
) {
    debug!("Channel driver started");

    loop {
        let deadline = match weak.upgrade() {
            Some(inner) if !inner.is_disposed() => inner.next_deadline(),
            _ => break,
        };

        tokio::select! {
            event = events.recv() => {
                let Some((epoch, event)) = event else {
                    break;
                };
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                inner.handle_event(epoch, event);
            }

            () = wake.notified() => {}

            () = sleep_until_deadline(deadline) => {
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                inner.on_deadline(Instant::now());
            }
        }
    }

    debug!("Channel driver terminated");
}

async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => pending::<()>().await,
    }
}

// ============================================================================
// Channel
// ============================================================================

/// Long-lived push connection with subscriptions, dispatch and caches.
///
/// Cloning is cheap and yields a handle to the same channel.
///
/// # Example
///
/// ```ignore
/// let channel = Channel::builder()
///     .address("ws://127.0.0.1:9000/ws")
///     .build()?;
///
/// let _metrics = channel.on("server_metrics", |envelope| {
///     println!("{}", envelope.data);
///     Ok(())
/// });
/// let _topic = channel.subscribe("gen/server", Params::new());
///
/// channel.connect().await?;
/// ```
#[derive(Clone)]
pub struct Channel {
    inner: Arc<Inner>,
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("address", &self.inner.address)
            .field("transport", &self.inner.transport.name())
            .field("state", &self.state())
            .finish()
    }
}

// ============================================================================
// Channel - Construction
// ============================================================================

impl Channel {
    /// Creates a builder.
    #[inline]
    #[must_use]
    pub fn builder() -> ChannelBuilder {
        ChannelBuilder::new()
    }

    /// Creates the channel and spawns its driver on `runtime`.
    pub(crate) fn start(
        address: String,
        transport: Arc<dyn Transport>,
        options: &ChannelOptions,
        runtime: Handle,
    ) -> Self {
        let policy = ReconnectPolicy::new(
            options.reconnect_base,
            options.reconnect_cap,
            options.max_reconnect_attempts,
        );
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (status_tx, _) = watch::channel(ChannelStatus::default());
        let (notices_tx, _) = broadcast::channel(options.notice_capacity);
        let wake = Arc::new(Notify::new());

        let inner = Arc::new(Inner {
            address,
            transport,
            connect_timeout: options.connect_timeout,
            runtime: runtime.clone(),
            core: parking_lot::Mutex::new(Core {
                adapter: TransportAdapter::new(),
                heartbeat: HeartbeatMonitor::new(options.heartbeat_interval),
                reconnect: ReconnectController::new(policy),
                registry: SubscriptionRegistry::new(),
                last_error: None,
                client_id: None,
                disposed: false,
            }),
            dispatcher: Dispatcher::new(),
            caches: CacheRegistry::default(),
            events_tx,
            wake: Arc::clone(&wake),
            status_tx,
            notices_tx,
        });

        runtime.spawn(drive(Arc::downgrade(&inner), events_rx, wake));

        debug!(
            address = %inner.address,
            transport = inner.transport.name(),
            "Channel created"
        );
        Self { inner }
    }
}

// ============================================================================
// Channel - Connection
// ============================================================================

impl Channel {
    /// Opens the connection and waits until it is established.
    ///
    /// Calling while an open is in flight or a retry is pending waits for
    /// that attempt instead of opening a second connection.
    ///
    /// # Errors
    ///
    /// - [`Error::GivenUp`] once retries are exhausted (until [`Self::reconnect`])
    /// - [`Error::ConnectionClosed`] if the channel is disconnected meanwhile
    /// - [`Error::Disposed`] after [`Self::dispose`]
    pub async fn connect(&self) -> Result<()> {
        self.open(false).await
    }

    /// Resets the retry counter and connects.
    ///
    /// Cancels a pending retry and opens immediately.
    ///
    /// # Errors
    ///
    /// Same as [`Self::connect`].
    pub async fn reconnect(&self) -> Result<()> {
        self.open(true).await
    }

    async fn open(&self, manual: bool) -> Result<()> {
        let status_rx = self.inner.status_tx.subscribe();

        let epoch = {
            let mut core = self.inner.core.lock();
            if core.disposed {
                return Err(Error::Disposed);
            }
            if manual {
                core.reconnect.reset();
                core.last_error = None;
            }

            let epoch = match core.adapter.state() {
                ConnectionState::Connected => None,
                ConnectionState::Failed if !manual => {
                    return Err(Error::given_up(core.reconnect.attempts()));
                }
                ConnectionState::Reconnecting if core.reconnect.is_waiting() => None,
                _ => core.adapter.begin_open(),
            };
            self.inner.publish(&core);
            epoch
        };

        if let Some(epoch) = epoch {
            self.inner.spawn_open(epoch);
            self.inner.wake.notify_one();
        }

        wait_connected(status_rx).await
    }

    /// Closes the connection and cancels heartbeat and pending retries.
    ///
    /// Synchronous: events of the old connection are ignored once this
    /// returns. The retry counter is reset. A channel that gave up stays
    /// failed, keeping its error until [`Channel::reconnect`].
    pub fn disconnect(&self) {
        self.inner
            .shut_connection(close_code::NORMAL, "client disconnect", false);
    }

    /// Shuts the channel down for good.
    ///
    /// Closes the connection, drops every handler and stops the driver.
    pub fn dispose(&self) {
        if self.inner.is_disposed() {
            return;
        }
        self.inner
            .shut_connection(close_code::GOING_AWAY, "channel disposed", true);
        self.inner.dispatcher.clear();
        info!(address = %self.inner.address, "Channel disposed");
    }

    /// Returns `true` after [`Self::dispose`].
    #[must_use]
    pub fn is_disposed(&self) -> bool {
        self.inner.is_disposed()
    }

    /// Sends a raw text frame.
    ///
    /// Returns `false` without queuing when not connected.
    pub fn send(&self, frame: impl Into<String>) -> bool {
        self.inner.core.lock().adapter.send(frame.into())
    }

    /// Serializes and sends a JSON value.
    pub fn send_json(&self, value: &serde_json::Value) -> bool {
        self.send(value.to_string())
    }
}

/// Waits on status updates until connected or definitely not connecting.
async fn wait_connected(mut status_rx: watch::Receiver<ChannelStatus>) -> Result<()> {
    loop {
        {
            let status = status_rx.borrow_and_update();
            match status.state {
                ConnectionState::Connected => return Ok(()),
                ConnectionState::Failed => {
                    return Err(Error::given_up(status.reconnect_attempts));
                }
                ConnectionState::Idle | ConnectionState::Closed => {
                    return Err(Error::ConnectionClosed);
                }
                ConnectionState::Connecting | ConnectionState::Reconnecting => {}
            }
        }

        if status_rx.changed().await.is_err() {
            return Err(Error::Disposed);
        }
    }
}

// ============================================================================
// Channel - Subscriptions
// ============================================================================

impl Channel {
    /// Registers interest in a topic.
    ///
    /// Sends a subscribe frame right away when connected; otherwise the topic
    /// is sent on the next connect. Subscribing to a known topic with new
    /// parameters re-sends the subscribe.
    pub fn subscribe(&self, topic: impl Into<TopicId>, params: Params) -> Subscription {
        let topic = topic.into();
        let holder = HolderId::next();
        self.inner.add_holder(&topic, params, holder);

        Subscription {
            inner: Arc::downgrade(&self.inner),
            topic,
            holder,
            active: true,
        }
    }

    /// Drops a topic regardless of how many holders it has.
    ///
    /// Returns `true` if the topic was registered.
    pub fn unsubscribe(&self, topic: &str) -> bool {
        self.inner.remove_topic(topic)
    }

    /// Registered topics in subscription order.
    #[must_use]
    pub fn topics(&self) -> Vec<TopicId> {
        self.inner.core.lock().registry.topics()
    }
}

// ============================================================================
// Channel - Handlers
// ============================================================================

impl Channel {
    /// Registers a handler for a message type.
    pub fn on<F>(&self, message_type: impl Into<String>, handler: F) -> HandlerGuard
    where
        F: Fn(&MessageEnvelope) -> HandlerResult + Send + Sync + 'static,
    {
        self.inner.dispatcher.register(message_type, handler)
    }

    /// Registers a handler for message types nobody else handles.
    pub fn on_any<F>(&self, handler: F) -> HandlerGuard
    where
        F: Fn(&MessageEnvelope) -> HandlerResult + Send + Sync + 'static,
    {
        self.inner.dispatcher.register_any(handler)
    }

    /// Registers a handler receiving `data` deserialized as `T`.
    pub fn on_typed<T, F>(&self, message_type: impl Into<String>, handler: F) -> HandlerGuard
    where
        T: DeserializeOwned + 'static,
        F: Fn(T, &MessageEnvelope) -> HandlerResult + Send + Sync + 'static,
    {
        self.inner.dispatcher.register_typed(message_type, handler)
    }

    /// Registers a handler bound to a topic.
    ///
    /// The topic stays subscribed while the guard lives. Envelopes tagged
    /// with another topic are skipped.
    pub fn on_topic<F>(
        &self,
        message_type: impl Into<String>,
        topic: impl Into<TopicId>,
        params: Params,
        handler: F,
    ) -> HandlerGuard
    where
        F: Fn(&MessageEnvelope) -> HandlerResult + Send + Sync + 'static,
    {
        let topic = topic.into();
        let holder = HolderId::next();
        self.inner.add_holder(&topic, params, holder);

        let filter = topic.clone();
        let guard = self
            .inner
            .dispatcher
            .register(message_type, move |envelope| match &envelope.topic_id {
                Some(tagged) if *tagged != filter => Ok(()),
                _ => handler(envelope),
            });

        let weak = Arc::downgrade(&self.inner);
        guard.and_then(move || {
            if let Some(inner) = weak.upgrade() {
                inner.release_holder(&topic, holder);
            }
        })
    }

    /// Feeds a message type into a bounded cache.
    ///
    /// `projector` maps an envelope to the key and value to upsert, or `None`
    /// to skip it. Caches are shared per `domain`; an existing domain keeps
    /// its capacity.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if `domain` already caches another value type.
    pub fn on_cached<V, F>(
        &self,
        message_type: impl Into<String>,
        domain: &str,
        capacity: usize,
        projector: F,
    ) -> Result<(CacheReader<V>, HandlerGuard)>
    where
        V: Clone + Send + Sync + 'static,
        F: Fn(&MessageEnvelope) -> std::result::Result<Option<(CacheKey, V)>, HandlerError>
            + Send
            + Sync
            + 'static,
    {
        let store = self.inner.caches.get_or_create::<V>(domain, capacity)?;
        let reader = store.reader();

        let guard = self.inner.dispatcher.register(message_type, move |envelope| {
            if let Some((key, value)) = projector(envelope)? {
                if let Some(evicted) = store.upsert(key, value) {
                    trace!(%evicted, "Cache entry evicted");
                }
            }
            Ok(())
        });

        Ok((reader, guard))
    }

    /// Returns the writable store of a cache domain, creating it if absent.
    pub(crate) fn cache_store<V>(&self, domain: &str, capacity: usize) -> Result<CacheStore<V>>
    where
        V: Send + Sync + 'static,
    {
        self.inner.caches.get_or_create::<V>(domain, capacity)
    }

    /// Returns a reader for a cache domain.
    #[must_use]
    pub fn cache<V>(&self, domain: &str) -> Option<CacheReader<V>>
    where
        V: Clone + Send + Sync + 'static,
    {
        self.inner.caches.reader::<V>(domain)
    }

    /// Names of the cache domains created so far.
    #[must_use]
    pub fn cache_domains(&self) -> Vec<String> {
        self.inner.caches.domains()
    }
}

// ============================================================================
// Channel - Observation
// ============================================================================

impl Channel {
    /// Server address.
    #[inline]
    #[must_use]
    pub fn address(&self) -> &str {
        &self.inner.address
    }

    /// Name of the wire protocol.
    #[inline]
    #[must_use]
    pub fn transport_name(&self) -> &'static str {
        self.inner.transport.name()
    }

    /// Current connection state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.inner.core.lock().adapter.state()
    }

    /// Current status snapshot.
    #[must_use]
    pub fn status(&self) -> ChannelStatus {
        self.inner.status_tx.borrow().clone()
    }

    /// Subscribes to status snapshots.
    #[must_use]
    pub fn watch_status(&self) -> watch::Receiver<ChannelStatus> {
        self.inner.status_tx.subscribe()
    }

    /// Subscribes to user-facing notices.
    #[must_use]
    pub fn notices(&self) -> broadcast::Receiver<ChannelNotice> {
        self.inner.notices_tx.subscribe()
    }
}

// ============================================================================
// Subscription
// ============================================================================

/// Keeps a topic subscribed.
///
/// Dropping the guard (or calling [`Subscription::unsubscribe`]) releases the
/// topic; an unsubscribe frame goes out once the last holder is gone.
#[derive(Debug)]
#[must_use = "dropping the subscription releases the topic"]
pub struct Subscription {
    inner: Weak<Inner>,
    topic: TopicId,
    holder: HolderId,
    active: bool,
}

impl Subscription {
    /// Subscribed topic.
    #[inline]
    #[must_use]
    pub fn topic(&self) -> &TopicId {
        &self.topic
    }

    /// Releases the topic now.
    pub fn unsubscribe(mut self) {
        self.release();
    }

    /// Keeps the topic subscribed until the channel is disposed or the topic
    /// is unsubscribed explicitly.
    pub fn detach(mut self) {
        self.active = false;
    }

    fn release(&mut self) {
        if !std::mem::take(&mut self.active) {
            return;
        }
        if let Some(inner) = self.inner.upgrade() {
            inner.release_holder(&self.topic, self.holder);
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.release();
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicUsize, Ordering};

    use serde::Deserialize;
    use serde_json::{Value, json};
    use tokio::time::sleep;
    use tokio_test::{assert_pending, assert_ready_ok, task};

    use crate::transport::{MemoryRemote, MemoryTransport};

    fn channel_with(options: ChannelOptions) -> (Channel, MemoryRemote) {
        let (transport, remote) = MemoryTransport::pair();
        let channel = Channel::builder()
            .options(options)
            .address("mem://telemetry")
            .transport(transport)
            .build()
            .expect("build");
        (channel, remote)
    }

    fn channel() -> (Channel, MemoryRemote) {
        channel_with(ChannelOptions::new())
    }

    /// Lets the driver drain pending events.
    async fn settle() {
        sleep(Duration::from_millis(1)).await;
    }

    fn control_frames(remote: &MemoryRemote, kind: &str) -> Vec<String> {
        remote
            .sent_json()
            .into_iter()
            .filter(|v| v["type"] == json!(kind))
            .filter_map(|v| v["topicId"].as_str().map(str::to_string))
            .collect()
    }

    fn params(pairs: &[(&str, &str)]) -> Params {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    // ------------------------------------------------------------------------
    // Connect
    // ------------------------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn test_connect_is_idempotent() {
        let (channel, remote) = channel();

        let (a, b) = tokio::join!(channel.connect(), channel.connect());
        assert!(a.is_ok());
        assert!(b.is_ok());
        channel.connect().await.expect("already connected");

        assert_eq!(remote.open_count(), 1);
        assert_eq!(remote.addresses(), vec!["mem://telemetry".to_string()]);

        let status = channel.status();
        assert!(status.connected);
        assert!(!status.connecting);
        assert_eq!(status.reconnect_attempts, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_initial_failure_retries_until_open() {
        let (channel, remote) = channel();
        remote.refuse_next(2, "server starting");

        let started = Instant::now();
        channel.connect().await.expect("connect after retries");

        assert_eq!(remote.open_count(), 3);
        // 1 s then 2 s of backoff
        assert!(started.elapsed() >= Duration::from_secs(3));
        assert_eq!(channel.status().reconnect_attempts, 0);
        assert_eq!(channel.status().last_error, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_fails_when_retries_exhausted() {
        let (channel, remote) =
            channel_with(ChannelOptions::new().with_max_reconnect_attempts(1));
        remote.refuse_next(2, "down");

        let err = channel.connect().await.expect_err("given up");
        assert!(matches!(err, Error::GivenUp { attempts: 1 }));
        assert!(err.is_terminal());
        assert_eq!(remote.open_count(), 2);
    }

    // ------------------------------------------------------------------------
    // Reconnect
    // ------------------------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn test_first_retry_waits_base_delay() {
        let (channel, remote) = channel();
        let mut notices = channel.notices();
        channel.connect().await.expect("connect");
        assert_eq!(notices.recv().await.ok(), Some(ChannelNotice::Connected));

        remote.drop_connection(close_code::ABNORMAL, "cut");
        settle().await;

        let status = channel.status();
        assert_eq!(status.state, ConnectionState::Reconnecting);
        assert!(status.connecting);
        assert_eq!(status.reconnect_attempts, 1);
        assert_eq!(remote.open_count(), 1);
        assert!(matches!(
            notices.recv().await,
            Ok(ChannelNotice::Disconnected { code: 1006, .. })
        ));
        assert_eq!(
            notices.recv().await.ok(),
            Some(ChannelNotice::Reconnecting {
                attempt: 1,
                delay: Duration::from_secs(1)
            })
        );

        sleep(Duration::from_millis(990)).await;
        assert_eq!(remote.open_count(), 1);

        sleep(Duration::from_millis(20)).await;
        assert_eq!(remote.open_count(), 2);
        assert!(channel.status().connected);
        assert_eq!(channel.status().reconnect_attempts, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_manual_reconnect_cancels_pending_retry() {
        let (channel, remote) = channel();
        channel.connect().await.expect("connect");
        remote.drop_connection(close_code::ABNORMAL, "cut");
        settle().await;
        assert_eq!(channel.state(), ConnectionState::Reconnecting);

        channel.reconnect().await.expect("manual reconnect");
        assert_eq!(remote.open_count(), 2);

        sleep(Duration::from_secs(5)).await;
        assert_eq!(remote.open_count(), 2);
        assert!(channel.status().connected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_while_reconnecting_waits_for_retry() {
        let (channel, remote) = channel();
        channel.connect().await.expect("connect");
        remote.drop_connection(close_code::ABNORMAL, "cut");
        settle().await;

        let started = Instant::now();
        channel.connect().await.expect("reconnected");
        assert!(started.elapsed() >= Duration::from_millis(900));
        assert_eq!(remote.open_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_stays_pending_until_retry_succeeds() {
        let (channel, remote) = channel();
        remote.refuse_next(1, "down");

        let mut connect = task::spawn(channel.connect());
        assert_pending!(connect.poll());

        settle().await;
        assert_pending!(connect.poll());
        assert_eq!(channel.state(), ConnectionState::Reconnecting);

        sleep(Duration::from_millis(1100)).await;
        assert_ready_ok!(connect.poll());
        assert_eq!(remote.open_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_max_retries() {
        let (channel, remote) = channel();
        let mut notices = channel.notices();
        channel.connect().await.expect("connect");

        remote.refuse_next(5, "down");
        remote.drop_connection(close_code::ABNORMAL, "cut");

        // 1 + 2 + 4 + 8 + 16 seconds of backoff
        sleep(Duration::from_secs(40)).await;

        let status = channel.status();
        assert!(status.is_failed());
        assert_eq!(status.reconnect_attempts, 5);
        assert!(status.last_error.is_some());
        assert_eq!(remote.open_count(), 6);

        sleep(Duration::from_secs(120)).await;
        assert_eq!(remote.open_count(), 6);

        let mut gave_up = 0;
        while let Ok(notice) = notices.try_recv() {
            if notice == (ChannelNotice::GivenUp { attempts: 5 }) {
                gave_up += 1;
            }
        }
        assert_eq!(gave_up, 1);

        let err = channel.connect().await.expect_err("still failed");
        assert!(matches!(err, Error::GivenUp { attempts: 5 }));
        assert_eq!(remote.open_count(), 6);

        channel.reconnect().await.expect("manual reconnect");
        assert_eq!(remote.open_count(), 7);
        assert_eq!(channel.status().last_error, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_normal_server_close_does_not_retry() {
        let (channel, remote) = channel();
        channel.connect().await.expect("connect");

        remote.drop_connection(close_code::NORMAL, "bye");
        settle().await;
        assert_eq!(channel.state(), ConnectionState::Closed);

        sleep(Duration::from_secs(60)).await;
        assert_eq!(remote.open_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transport_error_sets_last_error() {
        let (channel, remote) = channel();
        channel.connect().await.expect("connect");

        remote.fail_connection("connection reset by peer");
        settle().await;

        let status = channel.status();
        assert_eq!(status.state, ConnectionState::Reconnecting);
        assert_eq!(status.last_error.as_deref(), Some("connection reset by peer"));
    }

    // ------------------------------------------------------------------------
    // Disconnect
    // ------------------------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_cancels_pending_retry() {
        let (channel, remote) = channel();
        channel.connect().await.expect("connect");
        remote.drop_connection(close_code::ABNORMAL, "cut");
        settle().await;
        assert_eq!(channel.status().reconnect_attempts, 1);

        channel.disconnect();
        let status = channel.status();
        assert_eq!(status.state, ConnectionState::Closed);
        assert_eq!(status.reconnect_attempts, 0);
        assert!(!status.connecting);

        sleep(Duration::from_secs(60)).await;
        assert_eq!(remote.open_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_keeps_given_up_state() {
        let (channel, remote) =
            channel_with(ChannelOptions::new().with_max_reconnect_attempts(1));
        remote.refuse_next(2, "down");
        channel.connect().await.expect_err("given up");

        channel.disconnect();
        let status = channel.status();
        assert!(status.is_failed());
        assert!(status.last_error.is_some());

        let err = channel.connect().await.expect_err("still failed");
        assert!(matches!(err, Error::GivenUp { attempts: 1 }));
        assert_eq!(remote.open_count(), 2);

        channel.reconnect().await.expect("manual reconnect");
        assert_eq!(remote.open_count(), 3);
        assert!(channel.status().last_error.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_closes_link_and_is_repeatable() {
        let (channel, remote) = channel();
        channel.connect().await.expect("connect");

        channel.disconnect();
        channel.disconnect();
        assert!(!remote.is_open());
        assert_eq!(
            remote.client_closes(),
            vec![(close_code::NORMAL, "client disconnect".to_string())]
        );
        assert!(!channel.send("{}"));

        channel.connect().await.expect("connect again");
        assert_eq!(remote.open_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_during_connect_fails_waiter() {
        let (channel, remote) = channel();
        remote.refuse_next(1, "down");

        let waiter = {
            let channel = channel.clone();
            tokio::spawn(async move { channel.connect().await })
        };
        settle().await;
        channel.disconnect();

        let result = waiter.await.expect("join");
        assert!(matches!(result, Err(Error::ConnectionClosed)));
        sleep(Duration::from_secs(10)).await;
        assert_eq!(remote.open_count(), 1);
    }

    // ------------------------------------------------------------------------
    // Heartbeat
    // ------------------------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_probes_then_forces_stale_close() {
        let (channel, remote) = channel();
        channel.connect().await.expect("connect");

        sleep(Duration::from_secs(31)).await;
        let heartbeats = remote
            .sent_json()
            .into_iter()
            .filter(|v| v["type"] == json!("heartbeat"))
            .count();
        assert_eq!(heartbeats, 1);
        assert!(channel.status().connected);

        sleep(Duration::from_secs(30)).await;
        assert_eq!(
            remote.client_closes().first().map(|(code, _)| *code),
            Some(close_code::STALE)
        );

        sleep(Duration::from_secs(2)).await;
        assert_eq!(remote.open_count(), 2);
        assert!(channel.status().connected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_inbound_frames_keep_connection_alive() {
        let (channel, remote) = channel();
        channel.connect().await.expect("connect");

        for _ in 0..4 {
            sleep(Duration::from_secs(31)).await;
            assert!(remote.push(r#"{"type":"pong"}"#));
        }

        assert!(remote.client_closes().is_empty());
        assert_eq!(remote.open_count(), 1);
        assert!(channel.status().connected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_stops_after_disconnect() {
        let (channel, remote) = channel();
        channel.connect().await.expect("connect");
        channel.disconnect();
        remote.take_sent();

        sleep(Duration::from_secs(120)).await;
        assert!(remote.sent().is_empty());
    }

    // ------------------------------------------------------------------------
    // Subscriptions
    // ------------------------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn test_subscriptions_replayed_once_per_connect() {
        let (channel, remote) = channel();
        let _a = channel.subscribe("A", Params::new());
        let _b = channel.subscribe("B", Params::new());
        let _a_again = channel.subscribe("A", Params::new());
        assert!(remote.sent().is_empty());

        channel.connect().await.expect("connect");
        assert_eq!(control_frames(&remote, "subscribe"), vec!["A", "B"]);

        remote.take_sent();
        remote.drop_connection(close_code::ABNORMAL, "cut");
        sleep(Duration::from_millis(1100)).await;

        assert!(channel.status().connected);
        assert_eq!(control_frames(&remote, "subscribe"), vec!["A", "B"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_subscribe_while_connected_sends_immediately() {
        let (channel, remote) = channel();
        channel.connect().await.expect("connect");

        let sub = channel.subscribe("gen/server", params(&[("serverId", "1")]));
        assert_eq!(control_frames(&remote, "subscribe"), vec!["gen/server"]);

        let _same = channel.subscribe("gen/server", params(&[("serverId", "1")]));
        assert_eq!(control_frames(&remote, "subscribe").len(), 1);

        let _changed = channel.subscribe("gen/server", params(&[("serverId", "2")]));
        let subscribes: Vec<Value> = remote
            .sent_json()
            .into_iter()
            .filter(|v| v["type"] == json!("subscribe"))
            .collect();
        assert_eq!(subscribes.len(), 2);
        assert_eq!(subscribes[1]["params"], json!({"serverId": "2"}));

        drop(sub);
        assert!(control_frames(&remote, "unsubscribe").is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_last_holder_release_sends_unsubscribe() {
        let (channel, remote) = channel();
        channel.connect().await.expect("connect");

        let first = channel.subscribe("A", Params::new());
        let second = channel.subscribe("A", Params::new());
        assert_eq!(first.topic().as_str(), "A");

        first.unsubscribe();
        assert!(control_frames(&remote, "unsubscribe").is_empty());
        drop(second);
        assert_eq!(control_frames(&remote, "unsubscribe"), vec!["A"]);
        assert!(channel.topics().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unsubscribe_only_sent_while_connected() {
        let (channel, remote) = channel();
        let _a = channel.subscribe("A", Params::new());

        assert!(channel.unsubscribe("A"));
        assert!(!channel.unsubscribe("A"));
        assert!(remote.sent().is_empty());

        channel.connect().await.expect("connect");
        assert!(control_frames(&remote, "subscribe").is_empty());

        let _b = channel.subscribe("B", Params::new());
        assert!(channel.unsubscribe("B"));
        assert_eq!(control_frames(&remote, "unsubscribe"), vec!["B"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_detached_subscription_survives_drop() {
        let (channel, _remote) = channel();
        channel.subscribe("A", Params::new()).detach();
        assert_eq!(channel.topics(), vec![TopicId::from("A")]);
    }

    // ------------------------------------------------------------------------
    // Dispatch
    // ------------------------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn test_failing_handler_does_not_block_others() {
        let (channel, remote) = channel();
        let seen = Arc::new(AtomicUsize::new(0));

        let _failing = channel.on("server_metrics", |_| Err(HandlerError::failed("boom")));
        let counter = Arc::clone(&seen);
        let _counting = channel.on("server_metrics", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        channel.connect().await.expect("connect");
        for cpu in 0..5 {
            remote.push_json(&json!({"type": "server_metrics", "data": {"cpu": cpu}}));
        }
        remote.push("garbage");
        settle().await;

        assert_eq!(seen.load(Ordering::SeqCst), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_typed_and_catch_all_handlers() {
        #[derive(Deserialize)]
        struct Summary {
            online: u32,
        }

        let (channel, remote) = channel();
        let online = Arc::new(AtomicUsize::new(0));
        let unknown = Arc::new(AtomicUsize::new(0));

        let online_sink = Arc::clone(&online);
        let _typed = channel.on_typed("server_status_summary", move |s: Summary, _| {
            online_sink.store(s.online as usize, Ordering::SeqCst);
            Ok(())
        });
        let unknown_sink = Arc::clone(&unknown);
        let _any = channel.on_any(move |_| {
            unknown_sink.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        channel.connect().await.expect("connect");
        remote.push(r#"{"type":"server_status_summary","data":{"online":7}}"#);
        remote.push(r#"{"messageType":"mystery","data":null}"#);
        settle().await;

        assert_eq!(online.load(Ordering::SeqCst), 7);
        assert_eq!(unknown.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connected_frame_sets_client_id() {
        let (channel, remote) = channel();
        let acks = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&acks);
        let _ack = channel.on("connected", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        channel.connect().await.expect("connect");
        remote.push(r#"{"type":"connected","data":{"clientId":"client-42"}}"#);
        settle().await;

        assert_eq!(channel.status().client_id.as_deref(), Some("client-42"));
        assert_eq!(acks.load(Ordering::SeqCst), 1);

        channel.disconnect();
        assert_eq!(channel.status().client_id, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_frames_after_disconnect_are_ignored() {
        let (channel, remote) = channel();
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        let _h = channel.on("tick", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        channel.connect().await.expect("connect");
        // Queued before the disconnect, processed after it
        remote.push(r#"{"type":"tick"}"#);
        channel.disconnect();
        settle().await;

        assert_eq!(seen.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_on_topic_holds_topic_and_filters() {
        let (channel, remote) = channel();
        channel.connect().await.expect("connect");

        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        let guard = channel.on_topic("server_metrics", "gen/server", Params::new(), move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        assert_eq!(control_frames(&remote, "subscribe"), vec!["gen/server"]);

        remote.push(r#"{"type":"server_metrics","topicId":"gen/server"}"#);
        remote.push(r#"{"type":"server_metrics","topicId":"other"}"#);
        remote.push(r#"{"type":"server_metrics"}"#);
        settle().await;
        assert_eq!(seen.load(Ordering::SeqCst), 2);

        drop(guard);
        assert_eq!(control_frames(&remote, "unsubscribe"), vec!["gen/server"]);
    }

    // ------------------------------------------------------------------------
    // Caches
    // ------------------------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn test_on_cached_keeps_latest_entries() {
        let (channel, remote) = channel();
        let (reader, _guard) = channel
            .on_cached("server_metrics", "metrics", 2, |envelope| {
                let Some(key) = envelope.field("serverId").and_then(CacheKey::from_json) else {
                    return Ok(None);
                };
                Ok(Some((key, envelope.data.clone())))
            })
            .expect("cache");

        channel.connect().await.expect("connect");
        for id in 1..=3 {
            remote.push_json(&json!({"type": "server_metrics", "serverId": id, "data": {"cpu": id}}));
        }
        settle().await;

        assert_eq!(reader.len(), 2);
        assert_eq!(reader.values(), vec![json!({"cpu": 2}), json!({"cpu": 3})]);
        assert!(reader.get(&CacheKey::from(1)).is_none());

        let shared = channel.cache::<Value>("metrics").expect("reader");
        assert_eq!(shared.len(), 2);
        assert!(channel.cache::<String>("metrics").is_none());
        assert_eq!(channel.cache_domains(), vec!["metrics".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_on_cached_rejects_type_mismatch() {
        let (channel, _remote) = channel();
        let _first = channel
            .on_cached("a", "domain", 10, |_| Ok(None::<(CacheKey, u32)>))
            .expect("first");
        let second = channel.on_cached("b", "domain", 10, |_| Ok(None::<(CacheKey, String)>));
        assert!(matches!(second, Err(Error::Config { .. })));
    }

    // ------------------------------------------------------------------------
    // Dispose
    // ------------------------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn test_dispose_is_terminal() {
        let (channel, remote) = channel();
        let _h = channel.on("x", |_| Ok(()));
        channel.connect().await.expect("connect");

        channel.dispose();
        channel.dispose();
        assert!(channel.is_disposed());
        assert_eq!(
            remote.client_closes().first().map(|(code, _)| *code),
            Some(close_code::GOING_AWAY)
        );
        assert!(matches!(channel.connect().await, Err(Error::Disposed)));
        assert!(!channel.send("{}"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropping_channel_closes_connection() {
        let (channel, remote) = channel();
        channel.connect().await.expect("connect");

        drop(channel);
        settle().await;
        assert!(!remote.is_open());
    }
}
