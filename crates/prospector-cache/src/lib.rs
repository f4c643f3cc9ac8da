//! # Prospector Cache
//!
//! TTL'd key/value store for memoizing expensive lookups (sub-region
//! resolution, ~24h) and step outputs, so a partially failed execution can
//! resume without repeating completed cacheable work.
//!
//! Expiry is lazy (checked on read) plus a periodic sweep. The sweep only
//! deletes entries that are already logically expired, so it cannot race a
//! legitimate read.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

/// One cached value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub value: Value,
    pub created_at: DateTime<Utc>,
    /// None = never expires.
    pub expires_at: Option<DateTime<Utc>>,
}

impl CacheEntry {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        matches!(self.expires_at, Some(at) if now >= at)
    }
}

/// In-memory TTL cache shared across the pipeline.
pub struct ResultCache {
    entries: Mutex<HashMap<String, CacheEntry>>,
}

impl ResultCache {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Store a value, optionally with a TTL.
    pub async fn save(&self, key: &str, value: Value, ttl: Option<Duration>) {
        let now = Utc::now();
        let entry = CacheEntry {
            value,
            created_at: now,
            expires_at: ttl.map(|d| now + d),
        };
        let mut entries = self.entries.lock().await;
        entries.insert(key.to_string(), entry);
        tracing::debug!("💾 Cache save: {}", key);
    }

    /// Read a value. Expired entries are removed on read and yield `None`.
    pub async fn get(&self, key: &str) -> Option<Value> {
        let mut entries = self.entries.lock().await;
        match entries.get(key) {
            Some(entry) if entry.is_expired(Utc::now()) => {
                entries.remove(key);
                None
            }
            Some(entry) => Some(entry.value.clone()),
            None => None,
        }
    }

    /// Whether a live entry exists for the key.
    pub async fn has(&self, key: &str) -> bool {
        self.get(key).await.is_some()
    }

    /// Remove an entry. Returns true if one was present.
    pub async fn delete(&self, key: &str) -> bool {
        self.entries.lock().await.remove(key).is_some()
    }

    /// Drop everything.
    pub async fn clear(&self) {
        self.entries.lock().await.clear();
    }

    /// Number of stored entries (including not-yet-swept expired ones).
    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Remove expired entries. Returns how many were purged.
    pub async fn sweep(&self) -> usize {
        let now = Utc::now();
        let mut entries = self.entries.lock().await;
        let before = entries.len();
        entries.retain(|_, e| !e.is_expired(now));
        let purged = before - entries.len();
        if purged > 0 {
            tracing::debug!("🧹 Cache sweep purged {} entries", purged);
        }
        purged
    }

    /// Run the sweep on a fixed interval as a background tokio task.
    pub fn spawn_sweeper(cache: Arc<Self>, interval_secs: u64) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(std::time::Duration::from_secs(interval_secs.max(1)));
            loop {
                interval.tick().await;
                cache.sweep().await;
            }
        })
    }
}

impl Default for ResultCache {
    fn default() -> Self {
        Self::new()
    }
}
