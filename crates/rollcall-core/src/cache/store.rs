use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tracing::{debug, warn};

use crate::clock::{to_delta, to_std, Clock, SystemClock};
use crate::error::{ConfigError, StorageError};
use crate::storage::SessionStorage;

/// Prefix for every key this store writes into the shared storage.
pub const DEFAULT_KEY_PREFIX: &str = "rollcall_cache_";

/// Persisted form of a cached value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry<T> {
    pub value: T,
    pub written_at: DateTime<Utc>,
    /// Validity window in milliseconds.
    pub ttl_ms: u64,
}

impl<T> CacheEntry<T> {
    pub fn new(value: T, written_at: DateTime<Utc>, ttl: Duration) -> Self {
        Self {
            value,
            written_at,
            ttl_ms: u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX),
        }
    }

    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms)
    }

    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        to_std(now - self.written_at)
    }

    /// Expired strictly after the window: an entry exactly `ttl` old is
    /// still served.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now - self.written_at > to_delta(self.ttl())
    }

    pub fn remaining(&self, now: DateTime<Utc>) -> Duration {
        self.ttl().saturating_sub(self.age(now))
    }
}

/// Diagnostic view of one entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryInfo {
    pub written_at: DateTime<Utc>,
    pub age: Duration,
    pub remaining: Duration,
    pub expired: bool,
}

impl EntryInfo {
    pub fn age_minutes(&self) -> u64 {
        self.age.as_secs() / 60
    }

    pub fn age_display(&self) -> String {
        let minutes = self.age_minutes();
        if minutes < 1 {
            "just now".to_string()
        } else if minutes < 60 {
            format!("{}m ago", minutes)
        } else if minutes < 1440 {
            let hours = minutes / 60;
            if minutes % 60 >= 30 {
                // Round up: 1h 30m+ becomes 2h
                format!("{}h ago", hours + 1)
            } else {
                format!("{}h ago", hours)
            }
        } else {
            let days = minutes / 1440;
            if (minutes % 1440) / 60 >= 12 {
                format!("{}d ago", days + 1)
            } else {
                format!("{}d ago", days)
            }
        }
    }
}

/// A wildcard key pattern: `*` matches any substring, the rest of the
/// pattern is handed to the regex engine as written and must match the
/// whole key.
#[derive(Debug, Clone)]
pub struct KeyPattern {
    source: String,
    regex: Regex,
}

impl KeyPattern {
    pub fn new(pattern: &str) -> Result<Self, ConfigError> {
        if pattern.is_empty() {
            return Err(ConfigError::EmptyPattern);
        }
        let regex = Regex::new(&format!("^{}$", pattern.replace('*', ".*"))).map_err(|e| {
            ConfigError::InvalidPattern {
                pattern: pattern.to_string(),
                reason: e.to_string(),
            }
        })?;
        Ok(Self {
            source: pattern.to_string(),
            regex,
        })
    }

    /// Whether a string uses the wildcard marker.
    pub fn is_wildcard(pattern: &str) -> bool {
        pattern.contains('*')
    }

    pub fn matches(&self, key: &str) -> bool {
        self.regex.is_match(key)
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }
}

/// Key/value cache with per-entry TTL over a [`SessionStorage`].
///
/// Storage failures are logged and absorbed: a failed write behaves as if
/// nothing was cached, a failed or undecodable read is a miss. Cloning is
/// cheap and clones share the same storage.
#[derive(Clone)]
pub struct TtlStore {
    storage: Arc<dyn SessionStorage>,
    clock: Arc<dyn Clock>,
    prefix: String,
}

impl TtlStore {
    pub fn new(storage: Arc<dyn SessionStorage>) -> Self {
        Self::with_clock(storage, Arc::new(SystemClock))
    }

    pub fn with_clock(storage: Arc<dyn SessionStorage>, clock: Arc<dyn Clock>) -> Self {
        Self {
            storage,
            clock,
            prefix: DEFAULT_KEY_PREFIX.to_string(),
        }
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    fn storage_key(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }

    /// Store `value` under `key` for `ttl`, replacing any previous entry.
    pub fn set<T: Serialize>(&self, key: &str, value: &T, ttl: Duration) {
        let entry = CacheEntry::new(value, self.clock.now(), ttl);
        let result = serde_json::to_string(&entry)
            .map_err(|e| StorageError::Encode(e.to_string()))
            .and_then(|encoded| self.storage.set_item(&self.storage_key(key), &encoded));

        if let Err(e) = result {
            warn!(key = %key, error = %e, "Failed to write cache entry");
            // Never serve the value this write was meant to replace
            self.remove(key);
        }
    }

    /// Read `key`, deleting it if it has expired.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let entry = self.load(key)?;

        if entry.is_expired(self.clock.now()) {
            debug!(key = %key, "Cache entry expired");
            self.remove(key);
            return None;
        }

        match serde_json::from_value(entry.value) {
            Ok(value) => Some(value),
            Err(e) => {
                debug!(key = %key, error = %e, "Cached value does not match requested type");
                None
            }
        }
    }

    fn load(&self, key: &str) -> Option<CacheEntry<serde_json::Value>> {
        let raw = match self.storage.get_item(&self.storage_key(key)) {
            Ok(Some(raw)) => raw,
            Ok(None) => return None,
            Err(e) => {
                warn!(key = %key, error = %e, "Failed to read cache entry");
                return None;
            }
        };

        match serde_json::from_str(&raw) {
            Ok(entry) => Some(entry),
            Err(e) => {
                warn!(key = %key, error = %e, "Failed to decode cache entry");
                None
            }
        }
    }

    pub fn remove(&self, key: &str) {
        if let Err(e) = self.storage.remove_item(&self.storage_key(key)) {
            warn!(key = %key, error = %e, "Failed to remove cache entry");
        }
    }

    /// Remove every entry whose key matches `pattern`. Returns how many were
    /// removed. An invalid pattern removes nothing.
    pub fn remove_by_pattern(&self, pattern: &str) -> usize {
        match KeyPattern::new(pattern) {
            Ok(pattern) => self.remove_matching(&pattern),
            Err(e) => {
                warn!(pattern = %pattern, error = %e, "Ignoring invalid cache pattern");
                0
            }
        }
    }

    pub fn remove_matching(&self, pattern: &KeyPattern) -> usize {
        let matched: Vec<String> = self
            .keys()
            .into_iter()
            .filter(|key| pattern.matches(key))
            .collect();

        for key in &matched {
            self.remove(key);
        }
        debug!(pattern = %pattern.as_str(), removed = matched.len(), "Invalidated cache pattern");
        matched.len()
    }

    /// Remove every entry under this store's prefix. Other keys in the
    /// shared storage are left alone.
    pub fn clear(&self) -> usize {
        let keys = self.keys();
        for key in &keys {
            self.remove(key);
        }
        keys.len()
    }

    /// Unprefixed keys of every stored entry, expired or not.
    pub fn keys(&self) -> Vec<String> {
        match self.storage.keys() {
            Ok(keys) => keys
                .into_iter()
                .filter_map(|k| k.strip_prefix(&self.prefix).map(str::to_string))
                .collect(),
            Err(e) => {
                warn!(error = %e, "Failed to list cache keys");
                Vec::new()
            }
        }
    }

    pub fn has(&self, key: &str) -> bool {
        self.get::<serde_json::Value>(key).is_some()
    }

    /// Age and remaining lifetime of an entry, without deleting it.
    pub fn info(&self, key: &str) -> Option<EntryInfo> {
        let entry = self.load(key)?;
        let now = self.clock.now();
        Some(EntryInfo {
            written_at: entry.written_at,
            age: entry.age(now),
            remaining: entry.remaining(now),
            expired: entry.is_expired(now),
        })
    }

    /// Delete every expired entry now rather than on next read.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        let expired: Vec<String> = self
            .keys()
            .into_iter()
            .filter(|key| self.load(key).map(|e| e.is_expired(now)).unwrap_or(false))
            .collect();
        for key in &expired {
            self.remove(key);
        }
        expired.len()
    }
}

// ============================================================================
// Tests
// ============================================================================
