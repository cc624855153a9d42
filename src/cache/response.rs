//! Response cache for successful reads
//!
//! Provides a `ResponseCache` that stores decoded JSON bodies with their
//! storage time and TTL, and the `cache_key` function that derives a
//! deterministic signature from a request.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use reqwest::Method;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use url::{form_urlencoded, Url};

use crate::clock::{Clock, SystemClock};

/// A cached response body
#[derive(Debug, Clone)]
pub struct CacheEntry {
    /// The cached data
    pub data: Value,
    /// When the data was cached
    pub stored_at: DateTime<Utc>,
    /// How long the entry stays servable
    pub ttl: Duration,
}

impl CacheEntry {
    /// Whether the entry may still be served at `now`
    ///
    /// An entry is servable only while `now - stored_at < ttl`.
    pub fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        let age = now.signed_duration_since(self.stored_at);
        match chrono::Duration::from_std(self.ttl) {
            Ok(ttl) => age < ttl,
            // A TTL too large for chrono never expires in practice
            Err(_) => true,
        }
    }
}

/// Builds the cache signature for a request
///
/// The key is the method, the URL without fragment, and the query parameters
/// sorted by name then value, so `?b=2&a=1` and `?a=1&b=2` map to the same entry.
pub fn cache_key(method: &Method, url: &Url) -> String {
    let mut pairs: Vec<(String, String)> = url
        .query_pairs()
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    pairs.sort();

    let mut base = url.clone();
    base.set_query(None);
    base.set_fragment(None);

    if pairs.is_empty() {
        return format!("{} {}", method, base);
    }

    let query = form_urlencoded::Serializer::new(String::new())
        .extend_pairs(pairs)
        .finish();
    format!("{} {}?{}", method, base, query)
}

/// In-memory cache of successful read results
///
/// Cloning is cheap and every clone shares the same entries, which lets the
/// credential store wipe the cache the dispatcher fills.
#[derive(Clone)]
pub struct ResponseCache {
    entries: Arc<Mutex<HashMap<String, CacheEntry>>>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for ResponseCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponseCache")
            .field("entries", &self.entries.lock().len())
            .finish()
    }
}

impl Default for ResponseCache {
    fn default() -> Self {
        Self::new(Arc::new(SystemClock))
    }
}

impl ResponseCache {
    /// Creates an empty cache measuring entry age against `clock`
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: Arc::new(Mutex::new(HashMap::new())),
            clock,
        }
    }

    /// Reads a servable entry
    ///
    /// # Returns
    /// * `Some(data)` if the entry exists and its age is below its TTL
    /// * `None` if the entry is missing or stale; a stale entry is removed
    pub fn get(&self, key: &str) -> Option<Value> {
        let now = self.clock.now();
        let mut entries = self.entries.lock();

        match entries.get(key) {
            Some(entry) if entry.is_fresh(now) => Some(entry.data.clone()),
            Some(_) => {
                entries.remove(key);
                tracing::debug!(key, "Evicted stale cache entry");
                None
            }
            None => None,
        }
    }

    /// Stores `data` under `key` for `ttl`
    ///
    /// A zero TTL stores nothing, since such an entry could never be served.
    pub fn set(&self, key: impl Into<String>, data: Value, ttl: Duration) {
        if ttl.is_zero() {
            return;
        }
        let entry = CacheEntry {
            data,
            stored_at: self.clock.now(),
            ttl,
        };
        self.entries.lock().insert(key.into(), entry);
    }

    /// Drops every entry whose key contains `pattern`
    ///
    /// An exact key is matched by itself, so this covers both single-entry and
    /// resource-wide invalidation (e.g. `/orders` drops every order page).
    ///
    /// # Returns
    /// The number of entries removed
    pub fn invalidate(&self, pattern: &str) -> usize {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|key, _| !key.contains(pattern));
        let removed = before - entries.len();
        if removed > 0 {
            tracing::debug!(pattern, removed, "Invalidated cache entries");
        }
        removed
    }

    /// Removes all entries
    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    /// Number of stored entries, including stale ones not yet evicted
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
