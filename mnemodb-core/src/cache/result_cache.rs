/// ResultCache: byte-budgeted LRU cache with TTL expiry
///
/// Entry size is the length of the value's JSON encoding. The running
/// total never exceeds the budget: an insert first drops expired entries,
/// then least-recently-used ones, and an entry larger than the whole
/// budget is rejected without touching the cache.
///
/// Every time-dependent method has an `_at` variant taking the clock
/// value explicitly.

use std::hash::Hash;
use lru::LruCache;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::debug;
use crate::core::errors::{MnemoError, Result};
use crate::core::utils::current_timestamp_ms;

/// Usage ratio above which `optimize` starts evicting
const OPTIMIZE_HIGH_WATER: f64 = 0.8;
/// Usage ratio `optimize` evicts down to
const OPTIMIZE_LOW_WATER: f64 = 0.6;

#[derive(Debug, Clone)]
pub struct CacheEntry<V> {
    pub value: V,
    pub size: usize,
    /// Insertion time (ms)
    pub timestamp: u64,
    pub last_accessed: u64,
    pub access_count: u64,
}

impl<V> CacheEntry<V> {
    fn is_expired(&self, now: u64, ttl_ms: u64) -> bool {
        now.saturating_sub(self.timestamp) > ttl_ms
    }

    /// Retention score; lower scores are evicted first by `optimize`.
    fn retention_score(&self, now: u64) -> f64 {
        let recency = now.saturating_sub(self.last_accessed) as f64;
        let age = now.saturating_sub(self.timestamp) as f64;
        0.4 * self.access_count as f64
            + 0.3 * inverse_log(recency)
            + 0.2 * inverse_log(age)
            + 0.1 * inverse_log(self.size as f64)
    }
}

/// 1 / ln(x + 1), with x floored at 1 so the term stays finite.
fn inverse_log(x: f64) -> f64 {
    1.0 / (x.max(1.0) + 1.0).ln()
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub used_bytes: usize,
    pub budget_bytes: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub expirations: u64,
    pub rejections: u64,
}

struct CacheState<K: Hash + Eq, V> {
    entries: LruCache<K, CacheEntry<V>>,
    used_bytes: usize,
    hits: u64,
    misses: u64,
    evictions: u64,
    expirations: u64,
    rejections: u64,
}

impl<K: Hash + Eq + Clone, V> CacheState<K, V> {
    fn drop_entry(&mut self, key: &K) -> Option<CacheEntry<V>> {
        let entry = self.entries.pop(key)?;
        self.used_bytes -= entry.size;
        Some(entry)
    }

    fn purge_expired(&mut self, now: u64, ttl_ms: u64) -> usize {
        let expired: Vec<K> = self
            .entries
            .iter()
            .filter(|(_, e)| e.is_expired(now, ttl_ms))
            .map(|(k, _)| k.clone())
            .collect();
        for key in &expired {
            self.drop_entry(key);
        }
        self.expirations += expired.len() as u64;
        expired.len()
    }
}

pub struct ResultCache<K: Hash + Eq, V> {
    budget_bytes: usize,
    ttl_ms: u64,
    state: Mutex<CacheState<K, V>>,
}

impl<K, V> ResultCache<K, V>
where
    K: Hash + Eq + Clone,
    V: Clone + Serialize,
{
    pub fn new(budget_bytes: usize, ttl_ms: u64) -> Self {
        ResultCache {
            budget_bytes,
            ttl_ms,
            state: Mutex::new(CacheState {
                entries: LruCache::unbounded(),
                used_bytes: 0,
                hits: 0,
                misses: 0,
                evictions: 0,
                expirations: 0,
                rejections: 0,
            }),
        }
    }

    /// Approximate footprint of a value: its JSON encoding length.
    pub fn approximate_size(value: &V) -> usize {
        serde_json::to_vec(value)
            .map(|bytes| bytes.len())
            .unwrap_or_else(|_| std::mem::size_of::<V>())
    }

    /// Store a value. Returns false if it can never fit the budget.
    pub fn set(&self, key: K, value: V) -> bool {
        self.try_insert(key, value).is_ok()
    }

    pub fn try_insert(&self, key: K, value: V) -> Result<()> {
        self.insert_at(key, value, current_timestamp_ms())
    }

    pub fn insert_at(&self, key: K, value: V, now: u64) -> Result<()> {
        let size = Self::approximate_size(&value);
        let mut state = self.state.lock();

        if size > self.budget_bytes {
            state.rejections += 1;
            return Err(MnemoError::CapacityExceeded {
                required: size,
                budget: self.budget_bytes,
            });
        }

        state.drop_entry(&key);
        if state.used_bytes + size > self.budget_bytes {
            state.purge_expired(now, self.ttl_ms);
        }
        while state.used_bytes + size > self.budget_bytes {
            let Some((_, evicted)) = state.entries.pop_lru() else { break };
            state.used_bytes -= evicted.size;
            state.evictions += 1;
        }

        state.used_bytes += size;
        state.entries.put(key, CacheEntry {
            value,
            size,
            timestamp: now,
            last_accessed: now,
            access_count: 0,
        });
        Ok(())
    }

    pub fn get(&self, key: &K) -> Option<V> {
        self.get_at(key, current_timestamp_ms())
    }

    /// Look up a live entry, counting the access. Expired entries are
    /// evicted on the way.
    pub fn get_at(&self, key: &K, now: u64) -> Option<V> {
        let mut guard = self.state.lock();
        let state = &mut *guard;

        let expired = match state.entries.peek(key) {
            None => {
                state.misses += 1;
                return None;
            }
            Some(entry) => entry.is_expired(now, self.ttl_ms),
        };
        if expired {
            state.drop_entry(key);
            state.expirations += 1;
            state.misses += 1;
            return None;
        }

        let entry = state.entries.get_mut(key)?;
        entry.last_accessed = now;
        entry.access_count += 1;
        let value = entry.value.clone();
        state.hits += 1;
        Some(value)
    }

    pub fn remove(&self, key: &K) -> Option<V> {
        self.state.lock().drop_entry(key).map(|e| e.value)
    }

    /// Keep only entries whose key satisfies `keep`. Returns the number
    /// removed.
    pub fn retain<F: Fn(&K) -> bool>(&self, keep: F) -> usize {
        let mut state = self.state.lock();
        let doomed: Vec<K> = state
            .entries
            .iter()
            .filter(|(k, _)| !keep(k))
            .map(|(k, _)| k.clone())
            .collect();
        for key in &doomed {
            state.drop_entry(key);
        }
        doomed.len()
    }

    pub fn sweep_expired(&self) -> usize {
        self.sweep_expired_at(current_timestamp_ms())
    }

    pub fn sweep_expired_at(&self, now: u64) -> usize {
        self.state.lock().purge_expired(now, self.ttl_ms)
    }

    pub fn optimize(&self) -> usize {
        self.optimize_at(current_timestamp_ms())
    }

    /// Above 80% usage, evict the lowest-scoring entries until usage is
    /// at or below 60%. Returns the number evicted.
    pub fn optimize_at(&self, now: u64) -> usize {
        let mut state = self.state.lock();
        let high_water = (self.budget_bytes as f64 * OPTIMIZE_HIGH_WATER) as usize;
        if state.used_bytes <= high_water {
            return 0;
        }
        let low_water = (self.budget_bytes as f64 * OPTIMIZE_LOW_WATER) as usize;

        let mut scored: Vec<(K, f64)> = state
            .entries
            .iter()
            .map(|(k, e)| (k.clone(), e.retention_score(now)))
            .collect();
        scored.sort_by(|a, b| a.1.total_cmp(&b.1));

        let mut evicted = 0;
        for (key, _) in scored {
            if state.used_bytes <= low_water {
                break;
            }
            if state.drop_entry(&key).is_some() {
                evicted += 1;
            }
        }
        state.evictions += evicted as u64;
        debug!(evicted, used_bytes = state.used_bytes, budget = self.budget_bytes, "Cache optimized");
        evicted
    }

    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.entries.clear();
        state.used_bytes = 0;
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn used_bytes(&self) -> usize {
        self.state.lock().used_bytes
    }

    pub fn budget_bytes(&self) -> usize {
        self.budget_bytes
    }

    pub fn stats(&self) -> CacheStats {
        let state = self.state.lock();
        CacheStats {
            entries: state.entries.len(),
            used_bytes: state.used_bytes,
            budget_bytes: self.budget_bytes,
            hits: state.hits,
            misses: state.misses,
            evictions: state.evictions,
            expirations: state.expirations,
            rejections: state.rejections,
        }
    }
}
