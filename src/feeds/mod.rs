//! Ready-made consumers of common telemetry streams.
//!
//! A feed installs its handlers and caches on a [`Channel`](crate::Channel)
//! and exposes typed read accessors. Handlers are released when the feed is
//! dropped.
//!
//! | Feed | Message types |
//! |------|---------------|
//! | [`ServerMetricsFeed`] | `server_metrics`, `performance_trends`, `server_alerts`, `server_status_summary` |
//! | [`FileTransferFeed`] | `upload_*`, `merge_*`, `queue_status`, `system_status` |

// ============================================================================
// Submodules
// ============================================================================

/// Upload and merge progress.
pub mod file_transfer;

/// Server monitoring.
pub mod server_metrics;

// ============================================================================
// Re-exports
// ============================================================================

pub use file_transfer::{FileTransferFeed, TransferPhase, TransferStatus};
pub use server_metrics::{PerformanceTrend, ServerAlerts, ServerMetricsFeed};
