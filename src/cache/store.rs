//! Bounded key/value store with update-order eviction.
//!
//! # Eviction
//!
//! Every upsert stamps the entry with a fresh sequence number. When a new key
//! arrives at capacity, the entry with the lowest sequence number (the least
//! recently *updated*) is evicted. Reads never change the order.

// ============================================================================
// Imports
// ============================================================================

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::RwLock;
use rustc_hash::FxHashMap;

use crate::identifiers::CacheKey;
use crate::protocol::now_millis;

// ============================================================================
// CacheEntry
// ============================================================================

/// Snapshot of one cached value.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry<V> {
    /// Entry key.
    pub key: CacheKey,
    /// Cached value.
    pub value: V,
    /// Wall-clock time of the last upsert, in milliseconds.
    pub updated_at: i64,
}

#[derive(Debug, Clone)]
struct Slot<V> {
    value: V,
    updated_at: i64,
    seq: u64,
}

// ============================================================================
// BoundedCache
// ============================================================================

/// Fixed-capacity map evicting the least recently updated entry.
#[derive(Debug, Clone)]
pub struct BoundedCache<V> {
    capacity: usize,
    slots: FxHashMap<CacheKey, Slot<V>>,
    /// Sequence number to key, oldest first.
    order: BTreeMap<u64, CacheKey>,
    next_seq: u64,
}

impl<V> BoundedCache<V> {
    /// Creates an empty cache. A capacity of zero is treated as one.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            slots: FxHashMap::default(),
            order: BTreeMap::new(),
            next_seq: 0,
        }
    }

    /// Maximum number of entries.
    #[inline]
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of entries.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Returns `true` if empty.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Returns `true` if `key` is present.
    #[inline]
    #[must_use]
    pub fn contains_key(&self, key: &CacheKey) -> bool {
        self.slots.contains_key(key)
    }

    /// Inserts or replaces a value and marks it most recently updated.
    ///
    /// Returns the evicted key, if the insert pushed one out.
    pub fn upsert(&mut self, key: CacheKey, value: V) -> Option<CacheKey> {
        self.next_seq += 1;
        let seq = self.next_seq;
        let updated_at = now_millis();

        if let Some(slot) = self.slots.get_mut(&key) {
            self.order.remove(&slot.seq);
            slot.value = value;
            slot.updated_at = updated_at;
            slot.seq = seq;
            self.order.insert(seq, key);
            return None;
        }

        let evicted = if self.slots.len() >= self.capacity {
            self.evict_oldest()
        } else {
            None
        };

        self.order.insert(seq, key.clone());
        self.slots.insert(
            key,
            Slot {
                value,
                updated_at,
                seq,
            },
        );
        evicted
    }

    /// Returns a reference to a value.
    #[inline]
    #[must_use]
    pub fn get(&self, key: &CacheKey) -> Option<&V> {
        self.slots.get(key).map(|slot| &slot.value)
    }

    /// Last update time of an entry, in milliseconds.
    #[must_use]
    pub fn updated_at(&self, key: &CacheKey) -> Option<i64> {
        self.slots.get(key).map(|slot| slot.updated_at)
    }

    /// Removes an entry.
    pub fn remove(&mut self, key: &CacheKey) -> Option<V> {
        let slot = self.slots.remove(key)?;
        self.order.remove(&slot.seq);
        Some(slot.value)
    }

    /// Removes every entry.
    pub fn clear(&mut self) {
        self.slots.clear();
        self.order.clear();
    }

    /// Keys ordered from least to most recently updated.
    #[must_use]
    pub fn keys(&self) -> Vec<CacheKey> {
        self.order.values().cloned().collect()
    }

    fn evict_oldest(&mut self) -> Option<CacheKey> {
        let (_, key) = self.order.pop_first()?;
        self.slots.remove(&key);
        Some(key)
    }
}

impl<V: Clone> BoundedCache<V> {
    /// Values ordered from least to most recently updated.
    #[must_use]
    pub fn values(&self) -> Vec<V> {
        self.order
            .values()
            .filter_map(|key| self.slots.get(key))
            .map(|slot| slot.value.clone())
            .collect()
    }

    /// Entries ordered from least to most recently updated.
    #[must_use]
    pub fn entries(&self) -> Vec<CacheEntry<V>> {
        self.order
            .values()
            .filter_map(|key| {
                self.slots.get(key).map(|slot| CacheEntry {
                    key: key.clone(),
                    value: slot.value.clone(),
                    updated_at: slot.updated_at,
                })
            })
            .collect()
    }
}

// ============================================================================
// CacheStore / CacheReader
// ============================================================================

/// Writable handle to a shared cache.
#[derive(Debug)]
pub(crate) struct CacheStore<V> {
    inner: Arc<RwLock<BoundedCache<V>>>,
}

impl<V> Clone for CacheStore<V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<V> CacheStore<V> {
    /// Creates a store with the given capacity.
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(RwLock::new(BoundedCache::new(capacity))),
        }
    }

    /// Inserts or replaces a value.
    pub(crate) fn upsert(&self, key: CacheKey, value: V) -> Option<CacheKey> {
        self.inner.write().upsert(key, value)
    }

    /// Upserts `f(current)` under `key` in one write; `None` leaves the cache
    /// unchanged.
    ///
    /// Returns `true` if a value was written.
    pub(crate) fn update<F>(&self, key: CacheKey, f: F) -> bool
    where
        F: FnOnce(Option<&V>) -> Option<V>,
    {
        let mut cache = self.inner.write();
        match f(cache.get(&key)) {
            Some(value) => {
                cache.upsert(key, value);
                true
            }
            None => false,
        }
    }

    /// Returns a read-only handle.
    pub(crate) fn reader(&self) -> CacheReader<V> {
        CacheReader {
            inner: Arc::clone(&self.inner),
        }
    }
}

/// Read-only handle to a shared cache.
///
/// Every read returns owned snapshots; later writes are never observed
/// through a value already returned.
#[derive(Debug)]
pub struct CacheReader<V> {
    inner: Arc<RwLock<BoundedCache<V>>>,
}

impl<V> Clone for CacheReader<V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<V: Clone> CacheReader<V> {
    /// Returns a copy of a value.
    #[must_use]
    pub fn get(&self, key: &CacheKey) -> Option<V> {
        self.inner.read().get(key).cloned()
    }

    /// Values ordered from least to most recently updated.
    #[must_use]
    pub fn values(&self) -> Vec<V> {
        self.inner.read().values()
    }

    /// Entries ordered from least to most recently updated.
    #[must_use]
    pub fn entries(&self) -> Vec<CacheEntry<V>> {
        self.inner.read().entries()
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    /// Returns `true` if empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }

    /// Maximum number of entries.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.inner.read().capacity()
    }
}

// ============================================================================
// Tests
// ============================================================================
