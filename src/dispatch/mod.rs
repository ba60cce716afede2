//! Message fan-out.
//!
//! The [`Dispatcher`] parses inbound frames into [`MessageEnvelope`]s and runs
//! every handler registered for the envelope's type, in registration order.
//!
//! # Failure Isolation
//!
//! - A frame that does not parse is logged and dropped.
//! - A handler that returns an error or panics is logged; the remaining
//!   handlers still run and later frames are unaffected.
//! - A type with no handler goes to the catch-all handlers, if any.
//!
//! Handlers run outside the dispatcher lock, so a handler may register or
//! unregister handlers without deadlocking.

// ============================================================================
// Submodules
// ============================================================================

/// Handler types and registration guards.
pub mod handler;

// ============================================================================
// Imports
// ============================================================================

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde::de::DeserializeOwned;
use tracing::{trace, warn};

use crate::identifiers::HandlerId;
use crate::protocol::MessageEnvelope;

use handler::HandlerFn;

// ============================================================================
// Re-exports
// ============================================================================

pub use handler::{HandlerError, HandlerGuard, HandlerResult};

// ============================================================================
// Types
// ============================================================================

/// Registered handlers.
#[derive(Default)]
struct DispatchTable {
    by_type: FxHashMap<String, Vec<(HandlerId, HandlerFn)>>,
    catch_all: Vec<(HandlerId, HandlerFn)>,
}

impl DispatchTable {
    fn remove(&mut self, id: HandlerId) -> bool {
        let before = self.catch_all.len();
        self.catch_all.retain(|(hid, _)| *hid != id);
        if self.catch_all.len() != before {
            return true;
        }

        let mut removed = false;
        self.by_type.retain(|_, handlers| {
            let len = handlers.len();
            handlers.retain(|(hid, _)| *hid != id);
            removed |= handlers.len() != len;
            !handlers.is_empty()
        });
        removed
    }
}

// ============================================================================
// Dispatcher
// ============================================================================

/// Routes envelopes to handlers by message type.
#[derive(Clone, Default)]
pub struct Dispatcher {
    table: Arc<Mutex<DispatchTable>>,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let table = self.table.lock();
        f.debug_struct("Dispatcher")
            .field("types", &table.by_type.len())
            .field("catch_all", &table.catch_all.len())
            .finish()
    }
}

impl Dispatcher {
    /// Creates an empty dispatcher.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a handler for `message_type`.
    pub fn register<F>(&self, message_type: impl Into<String>, handler: F) -> HandlerGuard
    where
        F: Fn(&MessageEnvelope) -> HandlerResult + Send + Sync + 'static,
    {
        self.insert(Some(message_type.into()), Arc::new(handler))
    }

    /// Registers a handler that receives `data` deserialized as `T`.
    ///
    /// A shape mismatch is reported as [`HandlerError::Shape`] for this
    /// handler only.
    pub fn register_typed<T, F>(&self, message_type: impl Into<String>, handler: F) -> HandlerGuard
    where
        T: DeserializeOwned + 'static,
        F: Fn(T, &MessageEnvelope) -> HandlerResult + Send + Sync + 'static,
    {
        self.insert(Some(message_type.into()), handler::typed(handler))
    }

    /// Registers a handler for types that have no dedicated handler.
    pub fn register_any<F>(&self, handler: F) -> HandlerGuard
    where
        F: Fn(&MessageEnvelope) -> HandlerResult + Send + Sync + 'static,
    {
        self.insert(None, Arc::new(handler))
    }

    pub(crate) fn insert(&self, message_type: Option<String>, handler: HandlerFn) -> HandlerGuard {
        let id = HandlerId::next();
        {
            let mut table = self.table.lock();
            match message_type {
                Some(message_type) => {
                    trace!(%message_type, handler = %id, "handler registered");
                    table.by_type.entry(message_type).or_default().push((id, handler));
                }
                None => {
                    trace!(handler = %id, "catch-all handler registered");
                    table.catch_all.push((id, handler));
                }
            }
        }

        let table: Weak<Mutex<DispatchTable>> = Arc::downgrade(&self.table);
        HandlerGuard::new(id, move || {
            if let Some(table) = table.upgrade() {
                table.lock().remove(id);
            }
        })
    }

    /// Removes a handler. Returns `true` if it was registered.
    pub fn unregister(&self, id: HandlerId) -> bool {
        self.table.lock().remove(id)
    }

    /// Removes every handler.
    pub fn clear(&self) {
        let mut table = self.table.lock();
        table.by_type.clear();
        table.catch_all.clear();
    }

    /// Number of handlers for `message_type`.
    #[must_use]
    pub fn handler_count(&self, message_type: &str) -> usize {
        self.table.lock().by_type.get(message_type).map_or(0, Vec::len)
    }

    /// Parses and dispatches a raw frame.
    ///
    /// Returns the parsed envelope, or `None` if the frame was dropped.
    pub fn dispatch(&self, raw: &str) -> Option<MessageEnvelope> {
        match MessageEnvelope::parse(raw) {
            Ok(envelope) => {
                self.deliver(&envelope);
                Some(envelope)
            }
            Err(e) => {
                warn!(error = %e, frame_len = raw.len(), "Dropped unparsable frame");
                None
            }
        }
    }

    /// Runs the handlers for an envelope.
    ///
    /// Returns the number of handlers that completed without error.
    pub fn deliver(&self, envelope: &MessageEnvelope) -> usize {
        let handlers: Vec<(HandlerId, HandlerFn)> = {
            let table = self.table.lock();
            match table.by_type.get(&envelope.message_type) {
                Some(handlers) => handlers.clone(),
                None => table.catch_all.clone(),
            }
        };

        if handlers.is_empty() {
            trace!(message_type = %envelope.message_type, "No handler for message type");
            return 0;
        }

        let mut succeeded = 0;
        for (id, handler) in handlers {
            match catch_unwind(AssertUnwindSafe(|| handler(envelope))) {
                Ok(Ok(())) => succeeded += 1,
                Ok(Err(e)) => {
                    warn!(
                        handler = %id,
                        message_type = %envelope.message_type,
                        error = %e,
                        "Handler failed"
                    );
                }
                Err(_) => {
                    warn!(
                        handler = %id,
                        message_type = %envelope.message_type,
                        "Handler panicked"
                    );
                }
            }
        }
        succeeded
    }
}

// ============================================================================
// Tests
// ============================================================================
