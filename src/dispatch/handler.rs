//! Handler types and registration guards.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use thiserror::Error;

use crate::identifiers::HandlerId;
use crate::protocol::MessageEnvelope;

// ============================================================================
// HandlerError
// ============================================================================

/// Failure reported by a message handler.
///
/// Handler errors are logged by the dispatcher and never stop the remaining
/// handlers.
#[derive(Error, Debug)]
pub enum HandlerError {
    /// `data` does not have the shape the handler expects.
    #[error("Payload shape mismatch: {0}")]
    Shape(#[from] serde_json::Error),

    /// A required field is absent.
    #[error("Missing field: {0}")]
    MissingField(&'static str),

    /// Any other failure.
    #[error("{0}")]
    Failed(String),
}

impl HandlerError {
    /// Creates a [`HandlerError::Failed`].
    #[inline]
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }
}

/// Result returned by handlers.
pub type HandlerResult = std::result::Result<(), HandlerError>;

/// Stored handler callback.
pub(crate) type HandlerFn = Arc<dyn Fn(&MessageEnvelope) -> HandlerResult + Send + Sync>;

/// Wraps a typed callback into an envelope handler.
pub(crate) fn typed<T, F>(handler: F) -> HandlerFn
where
    T: DeserializeOwned,
    F: Fn(T, &MessageEnvelope) -> HandlerResult + Send + Sync + 'static,
{
    Arc::new(move |envelope: &MessageEnvelope| {
        let data = envelope.data_as::<T>()?;
        handler(data, envelope)
    })
}

// ============================================================================
// HandlerGuard
// ============================================================================

/// Keeps a handler registered.
///
/// Dropping the guard unregisters the handler (and releases any topic it
/// holds). Call [`HandlerGuard::detach`] to keep it for the channel's lifetime.
#[must_use = "dropping the guard unregisters the handler"]
pub struct HandlerGuard {
    id: HandlerId,
    release: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl HandlerGuard {
    /// Creates a guard running `release` on drop.
    pub(crate) fn new(id: HandlerId, release: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            id,
            release: Some(Box::new(release)),
        }
    }

    /// Extends the release action of this guard.
    pub(crate) fn and_then(mut self, extra: impl FnOnce() + Send + Sync + 'static) -> Self {
        let first = self.release.take();
        self.release = Some(Box::new(move || {
            if let Some(first) = first {
                first();
            }
            extra();
        }));
        self
    }

    /// Returns the handler id.
    #[inline]
    #[must_use]
    pub fn id(&self) -> HandlerId {
        self.id
    }

    /// Unregisters now.
    pub fn unregister(mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }

    /// Keeps the handler registered until the channel is disposed.
    pub fn detach(mut self) {
        self.release = None;
    }
}

impl fmt::Debug for HandlerGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerGuard")
            .field("id", &self.id)
            .field("active", &self.release.is_some())
            .finish()
    }
}

impl Drop for HandlerGuard {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
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
    use serde_json::json;

    #[derive(Deserialize)]
    struct Progress {
        percent: u8,
    }

    #[test]
    fn test_typed_handler_narrows_data() {
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        let handler = typed(move |progress: Progress, _| {
            counter.store(progress.percent as usize, Ordering::SeqCst);
            Ok(())
        });

        let envelope = MessageEnvelope::new("upload_progress", json!({"percent": 42}));
        assert!(handler(&envelope).is_ok());
        assert_eq!(seen.load(Ordering::SeqCst), 42);
    }

    #[test]
    fn test_typed_handler_reports_shape_mismatch() {
        let handler = typed(|_: Progress, _| Ok(()));
        let envelope = MessageEnvelope::new("upload_progress", json!("not an object"));
        assert!(matches!(handler(&envelope), Err(HandlerError::Shape(_))));
    }

    #[test]
    fn test_guard_releases_once() {
        let released = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&released);
        let guard = HandlerGuard::new(HandlerId::next(), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        guard.unregister();
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_detached_guard_never_releases() {
        let released = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&released);
        let guard = HandlerGuard::new(HandlerId::next(), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        guard.detach();
        assert_eq!(released.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_and_then_runs_both_in_order() {
        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let first = Arc::clone(&order);
        let second = Arc::clone(&order);

        let guard = HandlerGuard::new(HandlerId::next(), move || first.lock().push(1))
            .and_then(move || second.lock().push(2));
        drop(guard);

        assert_eq!(*order.lock(), vec![1, 2]);
    }
}
