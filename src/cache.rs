//! In-memory key-value cache shared by every connection.
//!
//! Provides a thread-safe string map with:
//! - Atomic `set`/`get` under a single reader-writer lock
//! - Empty-string sentinel for absent keys
//! - Operation counters for diagnostics

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{info, trace};

/// Snapshot of cache counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Number of keys currently stored
    pub items: usize,
    /// Total `set` calls
    pub sets: u64,
    /// Total `get` calls
    pub gets: u64,
    /// `get` calls that found the key
    pub hits: u64,
    /// `get` calls that did not find the key
    pub misses: u64,
}

/// Thread-safe in-memory cache
#[derive(Debug, Default)]
pub struct Cache {
    data: RwLock<HashMap<String, String>>,
    sets: AtomicU64,
    gets: AtomicU64,
    hits: AtomicU64,
}

impl Cache {
    /// Create a new, empty cache
    pub fn new() -> Arc<Self> {
        info!("Initializing cache");
        Arc::new(Self::default())
    }

    // A writer can only panic inside `HashMap::insert`, which leaves the map
    // consistent, so a poisoned lock is safe to keep using.
    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, String>> {
        self.data.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, String>> {
        self.data.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Insert or overwrite a value
    pub fn set(&self, key: &str, value: impl Into<String>) {
        let value = value.into();
        trace!(key, len = value.len(), "Storing value");
        self.write().insert(key.to_string(), value);
        self.sets.fetch_add(1, Ordering::Relaxed);
    }

    /// Get a value, or the empty string if the key is absent.
    ///
    /// A missing key and a key stored with an empty value look the same.
    pub fn get(&self, key: &str) -> String {
        self.gets.fetch_add(1, Ordering::Relaxed);
        match self.read().get(key) {
            Some(value) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                value.clone()
            }
            None => {
                trace!(key, "Key not found");
                String::new()
            }
        }
    }

    /// Whether the key is present
    pub fn contains(&self, key: &str) -> bool {
        self.read().contains_key(key)
    }

    /// Number of stored keys
    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Get cache statistics
    pub fn stats(&self) -> CacheStats {
        let gets = self.gets.load(Ordering::Relaxed);
        let hits = self.hits.load(Ordering::Relaxed);
        CacheStats {
            items: self.len(),
            sets: self.sets.load(Ordering::Relaxed),
            gets,
            hits,
            misses: gets.saturating_sub(hits),
        }
    }
}
