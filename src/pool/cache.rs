//! Shared embedding cache.
//!
//! Keyed by SHA-256 of trimmed chunk content. One reader-writer lock
//! guards the map, so a read returns either nothing or a fully
//! validated entry — never a torn value. Eviction is single-flight:
//! whichever thread trips the threshold runs it, others skip.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::RwLock;

use sha2::{Digest, Sha256};

use crate::chunk::validate_embedding;
use crate::config::CacheSettings;

/// Cache key: SHA-256 hex of trimmed content.
pub fn content_key(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.trim().as_bytes());
    format!("{:x}", hasher.finalize())
}

struct CacheEntry {
    embedding: Vec<f32>,
    hit_count: AtomicU64,
    /// Unix ms
    last_accessed: AtomicU64,
}

#[derive(Debug, Clone, Default)]
pub struct CacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

/// Process-wide embedding cache owned by the pool.
pub struct EmbeddingCache {
    settings: CacheSettings,
    map: RwLock<HashMap<String, CacheEntry>>,
    evicting: AtomicBool,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl EmbeddingCache {
    pub fn new(settings: CacheSettings) -> Self {
        EmbeddingCache {
            settings,
            map: RwLock::new(HashMap::new()),
            evicting: AtomicBool::new(false),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    /// Look up a validated embedding by content key.
    pub fn get(&self, key: &str) -> Option<Vec<f32>> {
        let map = self.map.read().unwrap_or_else(|p| p.into_inner());
        match map.get(key) {
            Some(entry) => {
                entry.hit_count.fetch_add(1, Ordering::Relaxed);
                entry.last_accessed.store(now_ms(), Ordering::Relaxed);
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(entry.embedding.clone())
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Insert a freshly computed embedding. Vectors that fail the
    /// finite/dimension check are rejected — the cache never stores one.
    pub fn insert(&self, key: String, embedding: Vec<f32>) {
        if let Err(e) = validate_embedding(&embedding) {
            tracing::warn!(error = %e, "Rejecting invalid embedding from cache insert");
            return;
        }
        {
            let mut map = self.map.write().unwrap_or_else(|p| p.into_inner());
            map.insert(
                key,
                CacheEntry {
                    embedding,
                    hit_count: AtomicU64::new(0),
                    last_accessed: AtomicU64::new(now_ms()),
                },
            );
        }
        self.maybe_evict();
    }

    pub fn len(&self) -> usize {
        self.map.read().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.map.write().unwrap_or_else(|p| p.into_inner()).clear();
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.len(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }

    /// Evict the least-valuable ~20% when fill passes the threshold.
    /// Value score: `(now − last_accessed) / (hit_count + 1)` — higher
    /// means staler and less hit, so higher scores go first.
    fn maybe_evict(&self) {
        let threshold =
            (self.settings.max_entries as f64 * self.settings.evict_threshold) as usize;
        if self.len() <= threshold.max(1) {
            return;
        }
        if self
            .evicting
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return; // another eviction in flight
        }

        let now = now_ms();
        let mut map = self.map.write().unwrap_or_else(|p| p.into_inner());
        let target = ((map.len() as f64) * self.settings.evict_percent).ceil() as usize;
        if target > 0 {
            let mut scored: Vec<(String, f64, u64)> = map
                .iter()
                .map(|(key, entry)| {
                    let age = now.saturating_sub(entry.last_accessed.load(Ordering::Relaxed));
                    let hits = entry.hit_count.load(Ordering::Relaxed);
                    (key.clone(), age as f64 / (hits + 1) as f64, hits)
                })
                .collect();
            // Highest score first; equal scores (fresh same-ms inserts)
            // fall back to fewest hits
            scored.sort_by(|a, b| {
                b.1.partial_cmp(&a.1)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then_with(|| a.2.cmp(&b.2))
            });
            for (key, _, _) in scored.into_iter().take(target) {
                map.remove(&key);
            }
            self.evictions.fetch_add(target as u64, Ordering::Relaxed);
            tracing::debug!(evicted = target, remaining = map.len(), "Cache eviction pass");
        }
        drop(map);
        self.evicting.store(false, Ordering::Release);
    }
}

fn now_ms() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}
