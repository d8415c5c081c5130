//! Time-Bounded Cache
//!
//! Generic keyed store with per-entry expiry and an optional size bound.
//! Expiry is enforced on access only; there is no background sweep. When the
//! bound is exceeded the oldest inserted entry is evicted, regardless of how
//! recently it was read.

use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::hash::Hash;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Time source for expiry checks
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

/// Wall clock backed by `Instant::now`
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Manually advanced clock for deterministic tests
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<Mutex<Instant>>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            now: Arc::new(Mutex::new(Instant::now())),
        }
    }

    pub fn advance(&self, by: Duration) {
        *self.now.lock() += by;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        *self.now.lock()
    }
}

#[derive(Debug)]
struct Entry<V> {
    value: V,
    stored_at: Instant,
    seq: u64,
}

/// Keyed store with TTL expiry and insertion-order eviction
pub struct TtlCache<K, V> {
    entries: HashMap<K, Entry<V>>,
    /// Insertion order; stale `(key, seq)` pairs are skipped lazily
    order: VecDeque<(K, u64)>,
    ttl: Option<Duration>,
    max_size: Option<usize>,
    next_seq: u64,
    clock: Arc<dyn Clock>,
}

impl<K, V> TtlCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    /// Create a cache. A `ttl_ms` of zero or less disables expiry.
    pub fn new(ttl_ms: i64, max_size: Option<usize>) -> Self {
        Self::with_clock(ttl_ms, max_size, Arc::new(SystemClock))
    }

    pub fn with_clock(ttl_ms: i64, max_size: Option<usize>, clock: Arc<dyn Clock>) -> Self {
        let ttl = if ttl_ms > 0 {
            Some(Duration::from_millis(ttl_ms as u64))
        } else {
            None
        };
        Self {
            entries: HashMap::new(),
            order: VecDeque::new(),
            ttl,
            max_size,
            next_seq: 0,
            clock,
        }
    }

    pub fn ttl(&self) -> Option<Duration> {
        self.ttl
    }

    pub fn max_size(&self) -> Option<usize> {
        self.max_size
    }

    fn is_expired(&self, stored_at: Instant, now: Instant) -> bool {
        match self.ttl {
            Some(ttl) => now.saturating_duration_since(stored_at) > ttl,
            None => false,
        }
    }

    /// Look up a live entry, purging it if it has expired
    pub fn get(&mut self, key: &K) -> Option<V> {
        let now = self.clock.now();
        let stored_at = self.entries.get(key)?.stored_at;
        if self.is_expired(stored_at, now) {
            self.entries.remove(key);
            return None;
        }
        self.entries.get(key).map(|entry| entry.value.clone())
    }

    /// Insert or overwrite; an overwrite becomes the newest entry
    pub fn set(&mut self, key: K, value: V) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.entries.insert(
            key.clone(),
            Entry {
                value,
                stored_at: self.clock.now(),
                seq,
            },
        );
        self.order.push_back((key, seq));

        if let Some(max) = self.max_size {
            while self.entries.len() > max {
                if !self.evict_oldest() {
                    break;
                }
            }
        }
        self.compact_order();
    }

    pub fn delete(&mut self, key: &K) -> bool {
        self.entries.remove(key).is_some()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.order.clear();
    }

    /// Number of stored entries, including expired ones not yet scanned
    pub fn size(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Lazy scan over live `(key, value)` pairs in insertion order
    pub fn entries(&mut self) -> Entries<'_, K, V> {
        let now = self.clock.now();
        Entries {
            cache: self,
            cursor: 0,
            now,
            stale: 0,
        }
    }

    /// Lazy scan over live values in insertion order
    pub fn values(&mut self) -> impl Iterator<Item = V> + '_ {
        self.entries().map(|(_, value)| value)
    }

    fn evict_oldest(&mut self) -> bool {
        while let Some((key, seq)) = self.order.pop_front() {
            let live = matches!(self.entries.get(&key), Some(entry) if entry.seq == seq);
            if live {
                self.entries.remove(&key);
                return true;
            }
        }
        false
    }

    fn compact_order(&mut self) {
        // Overwrites and deletes leave dead markers behind
        if self.order.len() > self.entries.len().saturating_mul(2).max(16) {
            self.drop_dead_markers();
        }
    }

    fn drop_dead_markers(&mut self) {
        let entries = &self.entries;
        self.order
            .retain(|(key, seq)| matches!(entries.get(key), Some(entry) if entry.seq == *seq));
    }
}

/// Iterator returned by [`TtlCache::entries`]
///
/// Purges expired entries it passes over as a side effect. Their order
/// markers are compacted in a single pass when the iterator is dropped.
pub struct Entries<'a, K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    cache: &'a mut TtlCache<K, V>,
    cursor: usize,
    now: Instant,
    /// Dead or expired markers passed so far
    stale: usize,
}

impl<'a, K, V> Iterator for Entries<'a, K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    type Item = (K, V);

    fn next(&mut self) -> Option<Self::Item> {
        while let Some((key, seq)) = self.cache.order.get(self.cursor).cloned() {
            self.cursor += 1;
            let stored_at = match self.cache.entries.get(&key) {
                Some(entry) if entry.seq == seq => entry.stored_at,
                _ => {
                    self.stale += 1;
                    continue;
                }
            };
            if self.cache.is_expired(stored_at, self.now) {
                self.cache.entries.remove(&key);
                self.stale += 1;
                continue;
            }
            let value = self.cache.entries.get(&key)?.value.clone();
            return Some((key, value));
        }
        None
    }
}

impl<'a, K, V> Drop for Entries<'a, K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    fn drop(&mut self) {
        if self.stale > 0 {
            self.cache.drop_dead_markers();
        }
    }
}
