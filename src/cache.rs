//! In-process TTL + LRU cache for control-plane reads.
//!
//! Keys are strings (`jobs:<filter>` for list pages, `job:<id>` for detail
//! documents), values are cached JSON documents. Entries expire per-TTL; on
//! overflow the least-recently-accessed tenth of the table is evicted.

use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;

pub const DEFAULT_CAPACITY: usize = 1000;

/// TTL for `jobs:*` list documents.
pub const LIST_TTL: Duration = Duration::from_secs(2 * 60);

/// TTL for `job:<id>` detail documents.
pub const DETAIL_TTL: Duration = Duration::from_secs(10 * 60);

struct Entry {
    value: Value,
    expires_at: Instant,
    last_access: Instant,
    weight: usize,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub sets: u64,
    pub deletes: u64,
    /// Percentage of reads served from cache, two-decimal precision.
    pub hit_rate: f64,
    pub size: usize,
    /// Rough estimate of resident key + value bytes.
    pub memory_bytes: usize,
}

pub struct ResponseCache {
    entries: RwLock<HashMap<String, Entry>>,
    capacity: usize,
    default_ttl: Duration,
    hits: AtomicU64,
    misses: AtomicU64,
    sets: AtomicU64,
    deletes: AtomicU64,
}

impl Default for ResponseCache {
    fn default() -> Self {
        Self::new()
    }
}

impl ResponseCache {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            capacity: capacity.max(1),
            default_ttl: LIST_TTL,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            sets: AtomicU64::new(0),
            deletes: AtomicU64::new(0),
        }
    }

    pub async fn get(&self, key: &str) -> Option<Value> {
        let now = Instant::now();
        let mut entries = self.entries.write().await;
        match entries.get_mut(key) {
            Some(entry) if entry.expires_at > now => {
                entry.last_access = now;
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(entry.value.clone())
            }
            Some(_) => {
                entries.remove(key);
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    pub async fn set(&self, key: &str, value: Value, ttl: Option<Duration>) {
        let now = Instant::now();
        let ttl = ttl.unwrap_or(self.default_ttl);
        let weight = key.len() + estimate_size(&value);
        let mut entries = self.entries.write().await;
        entries.insert(
            key.to_string(),
            Entry {
                value,
                expires_at: now + ttl,
                last_access: now,
                weight,
            },
        );
        self.sets.fetch_add(1, Ordering::Relaxed);

        if entries.len() > self.capacity {
            Self::evict(&mut entries, self.capacity, now);
        }
    }

    pub async fn delete(&self, key: &str) -> bool {
        let removed = self.entries.write().await.remove(key).is_some();
        if removed {
            self.deletes.fetch_add(1, Ordering::Relaxed);
        }
        removed
    }

    /// Remove every entry whose key starts with `prefix`. Returns the count.
    pub async fn delete_prefix(&self, prefix: &str) -> usize {
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|key, _| !key.starts_with(prefix));
        let removed = before - entries.len();
        self.deletes.fetch_add(removed as u64, Ordering::Relaxed);
        removed
    }

    pub async fn has(&self, key: &str) -> bool {
        let now = Instant::now();
        self.entries
            .read()
            .await
            .get(key)
            .is_some_and(|entry| entry.expires_at > now)
    }

    pub async fn keys(&self) -> Vec<String> {
        self.entries.read().await.keys().cloned().collect()
    }

    pub async fn clear(&self) {
        self.entries.write().await.clear();
    }

    pub async fn stats(&self) -> CacheStats {
        let entries = self.entries.read().await;
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let reads = hits + misses;
        let hit_rate = if reads == 0 {
            0.0
        } else {
            (hits as f64 * 100.0 / reads as f64 * 100.0).round() / 100.0
        };
        CacheStats {
            hits,
            misses,
            sets: self.sets.load(Ordering::Relaxed),
            deletes: self.deletes.load(Ordering::Relaxed),
            hit_rate,
            size: entries.len(),
            memory_bytes: entries.values().map(|e| e.weight).sum(),
        }
    }

    /// Drop expired entries, then the least-recently-accessed tenth.
    fn evict(entries: &mut HashMap<String, Entry>, capacity: usize, now: Instant) {
        entries.retain(|_, entry| entry.expires_at > now);
        if entries.len() <= capacity {
            return;
        }

        let batch = (capacity / 10).max(1);
        let mut by_access: Vec<(String, Instant)> = entries
            .iter()
            .map(|(key, entry)| (key.clone(), entry.last_access))
            .collect();
        by_access.sort_by_key(|(_, last_access)| *last_access);
        for (key, _) in by_access.into_iter().take(batch) {
            entries.remove(&key);
        }
    }
}

/// Rough resident-size estimate; intentionally cheap, not exact.
fn estimate_size(value: &Value) -> usize {
    match value {
        Value::Null => 4,
        Value::Bool(_) => 4,
        Value::Number(_) => 8,
        Value::String(s) => s.len() + 16,
        Value::Array(items) => items.iter().map(estimate_size).sum::<usize>() + 16,
        Value::Object(map) => {
            map.iter()
                .map(|(k, v)| k.len() + estimate_size(v))
                .sum::<usize>()
                + 16
        }
    }
}
