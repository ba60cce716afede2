//! File transfer feed.
//!
//! Tracks chunked uploads and the server-side merge that follows, one
//! [`TransferStatus`] per file id, in a bounded queue cache.
//!
//! # Transitions
//!
//! ```text
//! upload_progress ──► Uploading ──► merge_progress ──► Merging
//!        │                │                               │
//!        ▼                ▼                               ▼
//! upload_failed ──► Failed      upload_completed / merge_completed ──► Completed
//! ```
//!
//! Only `upload_progress` creates an entry; the other events update a known
//! file and are ignored otherwise. `queue_status` upserts the listed items and
//! leaves other entries untouched.
//!
//! Failures record the payload's `error`; its `message` is display text and
//! is only logged.

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, trace, warn};

use crate::cache::{CacheReader, CacheStore, QUEUE_STATUS_CAPACITY};
use crate::channel::Channel;
use crate::dispatch::{HandlerGuard, HandlerResult};
use crate::error::Result;
use crate::identifiers::CacheKey;

// ============================================================================
// Constants
// ============================================================================

/// Cache domain of transfer statuses.
pub const QUEUE_DOMAIN: &str = "queue_status";

/// Error recorded when a failed upload carries no `error`.
const UPLOAD_FAILED: &str = "upload failed";

/// Error recorded when a failed merge carries no `error`.
const MERGE_FAILED: &str = "merge failed";

// ============================================================================
// Types
// ============================================================================

/// Stage of one file transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferPhase {
    /// Chunks are being received.
    #[default]
    Uploading,
    /// Chunks are being merged.
    Merging,
    /// Transfer finished.
    Completed,
    /// Upload or merge failed.
    Failed,
}

/// Progress of one file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferStatus {
    /// File id.
    pub file_id: CacheKey,
    /// File name, empty when unknown.
    #[serde(default)]
    pub file_name: String,
    /// Percentage in `0..=100`.
    #[serde(default)]
    pub progress: f64,
    /// Current stage.
    #[serde(default, rename = "status")]
    pub phase: TransferPhase,
    /// Bytes per second.
    #[serde(default)]
    pub speed: f64,
    /// Estimated seconds left.
    #[serde(default)]
    pub remaining_time: f64,
    /// Failure message.
    #[serde(default)]
    pub error: Option<String>,
}

impl TransferStatus {
    /// Creates an uploading entry at zero progress.
    #[must_use]
    pub fn new(file_id: CacheKey, file_name: impl Into<String>) -> Self {
        Self {
            file_id,
            file_name: file_name.into(),
            progress: 0.0,
            phase: TransferPhase::Uploading,
            speed: 0.0,
            remaining_time: 0.0,
            error: None,
        }
    }

    /// Returns `true` once completed or failed.
    #[inline]
    #[must_use]
    pub fn is_finished(&self) -> bool {
        matches!(self.phase, TransferPhase::Completed | TransferPhase::Failed)
    }
}

/// Payload of the progress, completion and failure events.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TransferEvent {
    #[serde(default)]
    file_id: Option<CacheKey>,
    #[serde(default)]
    file_name: Option<String>,
    #[serde(default)]
    progress: Option<f64>,
    #[serde(default)]
    speed: Option<f64>,
    #[serde(default)]
    remaining_time: Option<f64>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

// ============================================================================
// FileTransferFeed
// ============================================================================

/// Upload and merge progress fed by a [`Channel`].
///
/// Dropping the feed unregisters its handlers; the queue cache stays
/// readable through [`Channel::cache`]. Entries leave the cache only by
/// eviction.
#[derive(Debug)]
pub struct FileTransferFeed {
    reader: CacheReader<TransferStatus>,
    system: Arc<Mutex<Option<Value>>>,
    _handlers: Vec<HandlerGuard>,
}

impl FileTransferFeed {
    /// Installs the feed handlers.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`](crate::Error::Config) if [`QUEUE_DOMAIN`] is
    /// already used with another value type.
    pub fn attach(channel: &Channel) -> Result<Self> {
        let queue = channel.cache_store::<TransferStatus>(QUEUE_DOMAIN, QUEUE_STATUS_CAPACITY)?;
        let reader = queue.reader();
        let system = Arc::new(Mutex::new(None));

        let mut handlers = Vec::with_capacity(8);

        let store = queue.clone();
        handlers.push(channel.on_typed("upload_progress", move |event: TransferEvent, _| {
            on_upload_progress(&store, event)
        }));

        let store = queue.clone();
        handlers.push(channel.on_typed("merge_progress", move |event: TransferEvent, _| {
            update_known(&store, event, |status, event| {
                let progress = event.progress?;
                status.phase = TransferPhase::Merging;
                status.progress = progress;
                Some(())
            })
        }));

        for message_type in ["upload_completed", "merge_completed"] {
            let store = queue.clone();
            handlers.push(channel.on_typed(message_type, move |event: TransferEvent, _| {
                update_known(&store, event, |status, _| {
                    status.phase = TransferPhase::Completed;
                    status.progress = 100.0;
                    Some(())
                })
            }));
        }

        for (message_type, fallback) in [
            ("upload_failed", UPLOAD_FAILED),
            ("merge_failed", MERGE_FAILED),
        ] {
            let store = queue.clone();
            handlers.push(channel.on_typed(message_type, move |event: TransferEvent, _| {
                if let Some(message) = event.message.as_deref() {
                    warn!(message_type, file_id = ?event.file_id, detail = message, "Transfer failed");
                }
                update_known(&store, event, |status, event| {
                    status.phase = TransferPhase::Failed;
                    status.error = Some(event.error.clone().unwrap_or_else(|| fallback.to_string()));
                    Some(())
                })
            }));
        }

        let store = queue;
        handlers.push(channel.on("queue_status", move |envelope| {
            let Some(items) = envelope.data.as_array() else {
                return Ok(());
            };
            for item in items {
                match TransferStatus::deserialize(item) {
                    Ok(status) => {
                        store.upsert(status.file_id.clone(), status);
                    }
                    Err(e) => trace!(error = %e, "Skipped queue item"),
                }
            }
            Ok(())
        }));

        let latest = Arc::clone(&system);
        handlers.push(channel.on("system_status", move |envelope| {
            let mut latest = latest.lock();
            merge_object(latest.get_or_insert_with(|| Value::Object(Default::default())), &envelope.data);
            Ok(())
        }));

        debug!(handlers = handlers.len(), "File transfer feed attached");

        Ok(Self {
            reader,
            system,
            _handlers: handlers,
        })
    }

    /// Status of a file.
    #[must_use]
    pub fn status(&self, file_id: &CacheKey) -> Option<TransferStatus> {
        self.reader.get(file_id)
    }

    /// Every tracked transfer, oldest update first.
    #[must_use]
    pub fn transfers(&self) -> Vec<TransferStatus> {
        self.reader.values()
    }

    /// Transfers still uploading or merging.
    #[must_use]
    pub fn active(&self) -> Vec<TransferStatus> {
        self.reader
            .values()
            .into_iter()
            .filter(|status| !status.is_finished())
            .collect()
    }

    /// Latest system status, merged across updates.
    #[must_use]
    pub fn system_status(&self) -> Option<Value> {
        self.system.lock().clone()
    }
}

// ============================================================================
// Handlers
// ============================================================================

fn on_upload_progress(store: &CacheStore<TransferStatus>, event: TransferEvent) -> HandlerResult {
    let (Some(file_id), Some(progress)) = (event.file_id.clone(), event.progress) else {
        return Ok(());
    };

    store.update(file_id.clone(), |current| {
        let mut status = current
            .cloned()
            .unwrap_or_else(|| TransferStatus::new(file_id, event.file_name.clone().unwrap_or_default()));
        status.progress = progress;
        status.speed = event.speed.unwrap_or(0.0);
        status.remaining_time = event.remaining_time.unwrap_or(0.0);
        Some(status)
    });
    Ok(())
}

/// Applies `apply` to an already tracked file.
fn update_known<F>(store: &CacheStore<TransferStatus>, event: TransferEvent, apply: F) -> HandlerResult
where
    F: FnOnce(&mut TransferStatus, &TransferEvent) -> Option<()>,
{
    let Some(file_id) = event.file_id.clone() else {
        return Ok(());
    };

    let updated = store.update(file_id.clone(), |current| {
        let mut status = current?.clone();
        apply(&mut status, &event)?;
        Some(status)
    });
    if !updated {
        trace!(%file_id, "Event for unknown transfer ignored");
    }
    Ok(())
}

/// Shallow-merges the keys of `update` into `target`.
fn merge_object(target: &mut Value, update: &Value) {
    match (target.as_object_mut(), update.as_object()) {
        (Some(target), Some(update)) => {
            for (key, value) in update {
                target.insert(key.clone(), value.clone());
            }
        }
        _ => *target = update.clone(),
    }
}

// ============================================================================
// Tests
// ============================================================================
