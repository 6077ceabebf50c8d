use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CacheError {
    /// The key is not cached. Distinct from every failure below.
    #[error("cache miss")]
    Miss,
    #[error("cache connection error: {0}")]
    Connection(String),
    #[error("cache protocol error: {0}")]
    Protocol(String),
}

impl CacheError {
    pub fn is_miss(&self) -> bool {
        matches!(self, CacheError::Miss)
    }
}

/// A key/value cache server holding string-serialized values with a TTL.
///
/// The cache is advisory: entries may vanish at any time and callers must
/// always be able to recompute from the source of truth.
pub trait CacheStore: Send + Sync {
    fn get(&self, key: &str) -> Result<String, CacheError>;
    fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CacheError>;
    /// Returns `true` when the value was stored, `false` when the key already existed.
    fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, CacheError>;
    fn delete(&self, key: &str) -> Result<(), CacheError>;
    /// Deletes the key only while it still holds `expected`. Returns whether it was deleted.
    fn delete_if_eq(&self, key: &str, expected: &str) -> Result<bool, CacheError>;
    /// Fails with [`CacheError::Protocol`] when the value is not an integer or the sum overflows.
    fn increment(&self, key: &str, by: i64) -> Result<i64, CacheError>;
    /// Keys matching a glob pattern where `*` matches any run of characters.
    fn scan(&self, pattern: &str) -> Result<Vec<String>, CacheError>;

    fn delete_by_prefix(&self, prefix: &str) -> Result<usize, CacheError> {
        let keys = self.scan(&format!("{}*", prefix.replace('*', "")))?;
        for key in &keys {
            self.delete(key)?;
        }
        Ok(keys.len())
    }
}

/// Glob match supporting `*` only, as used by `CacheStore::scan`.
pub fn glob_match(pattern: &str, text: &str) -> bool {
    let parts: Vec<&str> = pattern.split('*').collect();
    if parts.len() == 1 {
        return pattern == text;
    }

    let mut rest = text;
    for (i, part) in parts.iter().enumerate() {
        if i == 0 {
            match rest.strip_prefix(part) {
                Some(r) => rest = r,
                None => return false,
            }
        } else if i == parts.len() - 1 {
            return rest.ends_with(part);
        } else if let Some(pos) = rest.find(part) {
            rest = &rest[pos + part.len()..];
        } else {
            return false;
        }
    }
    true
}
