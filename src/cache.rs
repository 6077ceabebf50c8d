//! Cache-aside reads over a [`CacheStore`].
//!
//! The cache is advisory. Read failures other than a miss are treated as a
//! miss, write failures are logged and dropped, and only a cached value that
//! cannot be decoded is reported to the caller.

use std::{sync::Arc, time::Duration};

use ledgerview_core::cache::{CacheError, CacheStore};
use serde::{de::DeserializeOwned, Serialize};

use crate::error::PipelineError;

pub const CACHE_HITS: &str = "ledgerview_cache_hits_total";
pub const CACHE_MISSES: &str = "ledgerview_cache_misses_total";
pub const CACHE_FAILURES: &str = "ledgerview_cache_failures_total";

pub struct CacheAside {
    store: Arc<dyn CacheStore>,
}

impl CacheAside {
    pub fn new(store: Arc<dyn CacheStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn CacheStore> {
        &self.store
    }

    /// Returns the cached value for `key`, or computes, stores and returns it.
    ///
    /// Concurrent callers may each compute on a miss; the last write wins.
    pub fn get_or_set<T, F>(&self, key: &str, ttl: Duration, compute: F) -> Result<T, PipelineError>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Result<T, PipelineError>,
    {
        match self.store.get(key) {
            Ok(text) => {
                metrics::increment_counter!(CACHE_HITS);
                tracing::debug!(key, "Cache hit");
                return serde_json::from_str(&text).map_err(|e| PipelineError::PoisonedCache {
                    key: key.to_string(),
                    reason: e.to_string(),
                });
            }
            Err(CacheError::Miss) => {
                metrics::increment_counter!(CACHE_MISSES);
                tracing::debug!(key, "Cache miss");
            }
            Err(e) => {
                metrics::increment_counter!(CACHE_FAILURES);
                tracing::warn!(key, error = %e, "Cache read failed, reading from source");
            }
        }

        let value = compute()?;

        match serde_json::to_string(&value) {
            Ok(text) => {
                if let Err(e) = self.store.set(key, &text, ttl) {
                    metrics::increment_counter!(CACHE_FAILURES);
                    tracing::warn!(key, error = %e, "Cache write failed");
                }
            }
            Err(e) => tracing::warn!(key, error = %e, "Value could not be serialized for the cache"),
        }
        Ok(value)
    }

    pub fn invalidate(&self, key: &str) {
        if let Err(e) = self.store.delete(key) {
            metrics::increment_counter!(CACHE_FAILURES);
            tracing::warn!(key, error = %e, "Cache invalidation failed");
        }
    }

    /// Deletes every key starting with `prefix`. Returns how many were removed.
    pub fn invalidate_prefix(&self, prefix: &str) -> usize {
        match self.store.delete_by_prefix(prefix) {
            Ok(removed) => {
                tracing::debug!(prefix, removed, "Cache entries invalidated");
                removed
            }
            Err(e) => {
                metrics::increment_counter!(CACHE_FAILURES);
                tracing::warn!(prefix, error = %e, "Cache prefix invalidation failed");
                0
            }
        }
    }
}
