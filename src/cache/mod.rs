//! Bounded caches backing UI state.
//!
//! Each cache belongs to a named *domain* (`"server_metrics"`,
//! `"queue_status"`, ...). The [`CacheRegistry`] owns one store per domain;
//! writes happen only in dispatcher handlers, reads go through
//! [`CacheReader`] handles that can be shared freely.
//!
//! # Default Capacities
//!
//! | Domain | Capacity |
//! |--------|----------|
//! | Server metrics | [`METRICS_CAPACITY`] |
//! | Performance trends | [`TRENDS_CAPACITY`] |
//! | Server alerts | [`ALERTS_CAPACITY`] |
//! | Transfer queue status | [`QUEUE_STATUS_CAPACITY`] |

// ============================================================================
// Submodules
// ============================================================================

/// Bounded store and its handles.
pub mod store;

// ============================================================================
// Imports
// ============================================================================

use std::any::{Any, type_name};
use std::sync::Arc;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tracing::debug;

use crate::error::{Error, Result};

// ============================================================================
// Re-exports
// ============================================================================

pub use store::{BoundedCache, CacheEntry, CacheReader};

pub(crate) use store::CacheStore;

// ============================================================================
// Constants
// ============================================================================

/// Capacity of the server metrics cache.
pub const METRICS_CAPACITY: usize = 100;

/// Capacity of the performance trends cache.
pub const TRENDS_CAPACITY: usize = 50;

/// Capacity of the server alerts cache.
pub const ALERTS_CAPACITY: usize = 50;

/// Capacity of the transfer queue status cache.
pub const QUEUE_STATUS_CAPACITY: usize = 200;

// ============================================================================
// CacheRegistry
// ============================================================================

/// Named caches of one channel.
#[derive(Default)]
pub(crate) struct CacheRegistry {
    stores: Mutex<FxHashMap<String, Arc<dyn Any + Send + Sync>>>,
}

impl std::fmt::Debug for CacheRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let stores = self.stores.lock();
        let mut domains: Vec<&String> = stores.keys().collect();
        domains.sort();
        f.debug_struct("CacheRegistry").field("domains", &domains).finish()
    }
}

impl CacheRegistry {
    /// Returns the store for `domain`, creating it with `capacity` if absent.
    ///
    /// An existing store keeps its original capacity.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if `domain` already holds another value type.
    pub(crate) fn get_or_create<V>(&self, domain: &str, capacity: usize) -> Result<CacheStore<V>>
    where
        V: Send + Sync + 'static,
    {
        let mut stores = self.stores.lock();
        if let Some(existing) = stores.get(domain) {
            return Arc::clone(existing)
                .downcast::<CacheStore<V>>()
                .map(|store| (*store).clone())
                .map_err(|_| type_mismatch::<V>(domain));
        }

        let store = CacheStore::<V>::new(capacity);
        stores.insert(domain.to_string(), Arc::new(store.clone()));
        debug!(domain, capacity, value_type = type_name::<V>(), "cache created");
        Ok(store)
    }

    /// Returns a reader for `domain` if it exists with value type `V`.
    pub(crate) fn reader<V>(&self, domain: &str) -> Option<CacheReader<V>>
    where
        V: Send + Sync + 'static,
    {
        let stores = self.stores.lock();
        let store = stores.get(domain)?;
        store
            .downcast_ref::<CacheStore<V>>()
            .map(CacheStore::reader)
    }

    /// Domain names, sorted.
    pub(crate) fn domains(&self) -> Vec<String> {
        let mut domains: Vec<String> = self.stores.lock().keys().cloned().collect();
        domains.sort();
        domains
    }
}

fn type_mismatch<V>(domain: &str) -> Error {
    Error::config(format!(
        "cache domain '{domain}' already holds a different value type than {}",
        type_name::<V>()
    ))
}

// ============================================================================
// Tests
// ============================================================================
