//! In-memory analysis cache keyed by (context, fingerprint).
//!
//! Entries expire `ttl` after creation regardless of how often they are read,
//! and the least recently used entry is evicted when a `put` would exceed
//! `max_entries`. All state sits behind one mutex; no method suspends.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use lru::LruCache;
use serde::Serialize;

use crate::clock::Clock;
use crate::publish::ResultSource;
use crate::sensing::Fingerprint;
use crate::utils::lock_or_recover;

// Set to true to enable verbose logging in this module
const ENABLE_LOGS: bool = false;

use crate::log_debug;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub context: String,
    pub fingerprint: Fingerprint,
}

impl CacheKey {
    pub fn new(context: impl Into<String>, fingerprint: Fingerprint) -> Self {
        Self {
            context: context.into(),
            fingerprint,
        }
    }
}

/// Payload stored for a key.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedResult {
    pub text: String,
    pub source: ResultSource,
}

impl CachedResult {
    pub fn primary(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            source: ResultSource::Primary,
        }
    }

    pub fn fallback(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            source: ResultSource::Fallback,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub key: CacheKey,
    pub result: CachedResult,
    pub confidence: f64,
    pub created_at: Instant,
    pub last_access: Instant,
    pub access_count: u64,
    pub ttl: Duration,
}

impl CacheEntry {
    fn is_expired(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.created_at) > self.ttl
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub expirations: u64,
    pub size: usize,
    pub capacity: usize,
    pub hit_rate: f64,
}

#[derive(Debug, Default)]
struct Counters {
    hits: u64,
    misses: u64,
    evictions: u64,
    expirations: u64,
}

struct Inner {
    entries: LruCache<CacheKey, CacheEntry>,
    counters: Counters,
}

impl Inner {
    fn sweep(&mut self, now: Instant) -> usize {
        let expired: Vec<CacheKey> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.is_expired(now))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            self.entries.pop(key);
        }
        self.counters.expirations += expired.len() as u64;
        expired.len()
    }
}

pub struct AnalysisCache {
    clock: Arc<dyn Clock>,
    ttl: Duration,
    capacity: usize,
    inner: Mutex<Inner>,
}

impl AnalysisCache {
    pub fn new(capacity: usize, ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            ttl,
            capacity,
            inner: Mutex::new(Inner {
                // Capacity is enforced by `put` so that eviction happens before
                // insertion and is counted.
                entries: LruCache::unbounded(),
                counters: Counters::default(),
            }),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Counted lookup. A hit refreshes recency and bumps the access count; an
    /// expired entry is removed and reported as a miss.
    pub fn get(&self, key: &CacheKey) -> Option<CacheEntry> {
        let now = self.clock.now();
        let mut inner = lock_or_recover(&self.inner);

        let expired = match inner.entries.peek(key) {
            None => {
                inner.counters.misses += 1;
                return None;
            }
            Some(entry) => entry.is_expired(now),
        };

        if expired {
            inner.entries.pop(key);
            inner.counters.expirations += 1;
            inner.counters.misses += 1;
            log_debug!("cache entry for {} expired", key.fingerprint);
            return None;
        }

        let entry = inner.entries.get_mut(key)?;
        entry.access_count += 1;
        entry.last_access = now;
        let entry = entry.clone();
        inner.counters.hits += 1;
        Some(entry)
    }

    /// Uncounted lookup that neither refreshes recency nor removes expired
    /// entries.
    pub fn peek(&self, key: &CacheKey) -> Option<CacheEntry> {
        let now = self.clock.now();
        let inner = lock_or_recover(&self.inner);
        inner
            .entries
            .peek(key)
            .filter(|entry| !entry.is_expired(now))
            .cloned()
    }

    pub fn contains(&self, key: &CacheKey) -> bool {
        self.peek(key).is_some()
    }

    pub fn put(&self, key: CacheKey, result: CachedResult, confidence: f64) {
        self.put_with_ttl(key, result, confidence, self.ttl);
    }

    /// Insert with a per-entry lifetime, capped at the cache TTL.
    pub fn put_with_ttl(&self, key: CacheKey, result: CachedResult, confidence: f64, ttl: Duration) {
        if self.capacity == 0 {
            return;
        }

        let now = self.clock.now();
        let mut inner = lock_or_recover(&self.inner);

        inner.sweep(now);
        inner.entries.pop(&key);

        while inner.entries.len() >= self.capacity {
            match inner.entries.pop_lru() {
                Some((evicted, _)) => {
                    inner.counters.evictions += 1;
                    log_debug!(
                        "evicted {}:{} to make room",
                        evicted.context,
                        evicted.fingerprint
                    );
                }
                None => break,
            }
        }

        let entry = CacheEntry {
            key: key.clone(),
            result,
            confidence,
            created_at: now,
            last_access: now,
            access_count: 0,
            ttl: ttl.min(self.ttl),
        };
        inner.entries.push(key, entry);
    }

    /// Drop every expired entry. Returns how many were removed.
    pub fn sweep_expired(&self) -> usize {
        let now = self.clock.now();
        lock_or_recover(&self.inner).sweep(now)
    }

    pub fn len(&self) -> usize {
        lock_or_recover(&self.inner).entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        lock_or_recover(&self.inner).entries.clear();
    }

    pub fn stats(&self) -> CacheStats {
        let inner = lock_or_recover(&self.inner);
        let c = &inner.counters;
        let lookups = c.hits + c.misses;
        CacheStats {
            hits: c.hits,
            misses: c.misses,
            evictions: c.evictions,
            expirations: c.expirations,
            size: inner.entries.len(),
            capacity: self.capacity,
            hit_rate: if lookups == 0 {
                0.0
            } else {
                c.hits as f64 / lookups as f64
            },
        }
    }
}
