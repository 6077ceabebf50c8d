use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        RwLock,
    },
    time::{Duration, Instant},
};

use ledgerview_core::cache::{glob_match, CacheError, CacheStore};

struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn new(value: &str, ttl: Duration) -> Self {
        Self {
            value: value.to_string(),
            expires_at: (!ttl.is_zero()).then(|| Instant::now() + ttl),
        }
    }

    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| at > now)
    }
}

/// Process-local cache with TTL expiry. A zero TTL means no expiry.
///
/// `set_offline(true)` makes every operation fail with a connection error,
/// which is how an unreachable cache server looks to callers.
#[derive(Default)]
pub struct InMemoryCache {
    entries: RwLock<HashMap<String, Entry>>,
    offline: AtomicBool,
}

impl InMemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.entries.read().unwrap().values().filter(|e| e.is_live(now)).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops every expired entry. Runs on each write.
    fn evict_expired(entries: &mut HashMap<String, Entry>, now: Instant) {
        entries.retain(|_, e| e.is_live(now));
    }

    fn check_online(&self) -> Result<(), CacheError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(CacheError::Connection("cache server unreachable".to_string()));
        }
        Ok(())
    }
}

impl CacheStore for InMemoryCache {
    fn get(&self, key: &str) -> Result<String, CacheError> {
        self.check_online()?;
        let entries = self.entries.read().unwrap();
        match entries.get(key) {
            Some(entry) if entry.is_live(Instant::now()) => Ok(entry.value.clone()),
            _ => Err(CacheError::Miss),
        }
    }

    fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CacheError> {
        self.check_online()?;
        let mut entries = self.entries.write().unwrap();
        Self::evict_expired(&mut entries, Instant::now());
        entries.insert(key.to_string(), Entry::new(value, ttl));
        Ok(())
    }

    fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, CacheError> {
        self.check_online()?;
        let mut entries = self.entries.write().unwrap();
        Self::evict_expired(&mut entries, Instant::now());
        if entries.contains_key(key) {
            return Ok(false);
        }
        entries.insert(key.to_string(), Entry::new(value, ttl));
        Ok(true)
    }

    fn delete(&self, key: &str) -> Result<(), CacheError> {
        self.check_online()?;
        self.entries.write().unwrap().remove(key);
        Ok(())
    }

    fn delete_if_eq(&self, key: &str, expected: &str) -> Result<bool, CacheError> {
        self.check_online()?;
        let mut entries = self.entries.write().unwrap();
        let held = entries
            .get(key)
            .map_or(false, |e| e.is_live(Instant::now()) && e.value == expected);
        if held {
            entries.remove(key);
        }
        Ok(held)
    }

    fn increment(&self, key: &str, by: i64) -> Result<i64, CacheError> {
        self.check_online()?;
        let mut entries = self.entries.write().unwrap();
        Self::evict_expired(&mut entries, Instant::now());
        let entry = entries
            .entry(key.to_string())
            .or_insert_with(|| Entry::new("0", Duration::ZERO));
        let current: i64 = entry
            .value
            .parse()
            .map_err(|_| CacheError::Protocol(format!("value at {} is not an integer", key)))?;
        let next = current
            .checked_add(by)
            .ok_or_else(|| CacheError::Protocol(format!("increment of {} by {} overflows", key, by)))?;
        entry.value = next.to_string();
        Ok(next)
    }

    fn scan(&self, pattern: &str) -> Result<Vec<String>, CacheError> {
        self.check_online()?;
        let now = Instant::now();
        let mut keys: Vec<String> = self
            .entries
            .read()
            .unwrap()
            .iter()
            .filter(|(k, e)| e.is_live(now) && glob_match(pattern, k))
            .map(|(k, _)| k.clone())
            .collect();
        keys.sort();
        Ok(keys)
    }
}
