//! In-memory key/value cache with per-entry TTL and LRU eviction.
//!
//! Two independent ways an entry disappears:
//! - **TTL expiry**: an entry older than its TTL is treated as absent. `get`
//!   removes it lazily; `cleanup` and the background sweeper remove it eagerly.
//! - **LRU pressure**: inserting past `max_size` evicts exactly one entry, the
//!   least recently touched, regardless of how fresh it is.
//!
//! All state (entries, recency order, counters) sits behind one `RwLock`.
//! `get` promotes the entry it hits, so it takes the write side as well.

use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use crossbeam_channel::Sender;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

// ---------------------------------------------------------------------------
// Cache trait
// ---------------------------------------------------------------------------

/// Operations every cache engine exposes. Layers such as
/// [`ConflictCache`](crate::conflict::ConflictCache) depend on this rather
/// than on a concrete engine.
pub trait Cache<V>: Send + Sync {
    /// Look up `key`, promoting it to most-recently-used on a hit.
    fn get(&self, key: &str) -> Option<V>;

    /// Insert with the engine's default TTL.
    fn set(&self, key: &str, value: V);

    /// Insert with an explicit TTL. `Duration::ZERO` never expires by time.
    fn set_with_ttl(&self, key: &str, value: V, ttl: Duration);

    fn delete(&self, key: &str);

    /// Remove every key starting with `prefix`. An empty prefix clears all.
    fn clear_prefix(&self, prefix: &str);

    /// Remove entries past their own TTL, or older than `max_age` when it is
    /// non-zero.
    fn cleanup(&self, max_age: Duration);

    fn size(&self) -> usize;

    fn stats(&self) -> CacheStats;

    /// Stop background work and drop all entries. Idempotent.
    fn close(&self);
}

// ---------------------------------------------------------------------------
// Config & stats
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheConfig {
    pub max_size: usize,
    pub default_ttl: Duration,
    /// Sweeper period; `Duration::ZERO` disables the sweeper.
    pub cleanup_period: Duration,
    pub enable_stats: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_size: 100,
            default_ttl: Duration::from_secs(5 * 60),
            cleanup_period: Duration::from_secs(5 * 60),
            enable_stats: true,
        }
    }
}

/// Snapshot of cache counters, serialised as the status-surface payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub size: usize,
    pub max_size: usize,
    pub hit_rate: f64,
    pub last_cleanup: DateTime<Utc>,
}

impl CacheStats {
    fn compute_hit_rate(hits: u64, misses: u64) -> f64 {
        let total = hits + misses;
        if total == 0 {
            return 0.0;
        }
        hits as f64 / total as f64
    }
}

// ---------------------------------------------------------------------------
// Entry
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct CacheEntry<V> {
    value: V,
    created_at: Instant,
    ttl: Duration,
}

impl<V> CacheEntry<V> {
    fn is_expired(&self, now: Instant) -> bool {
        !self.ttl.is_zero() && now.saturating_duration_since(self.created_at) > self.ttl
    }

    fn older_than(&self, now: Instant, max_age: Duration) -> bool {
        !max_age.is_zero() && now.saturating_duration_since(self.created_at) > max_age
    }
}

// ---------------------------------------------------------------------------
// Shared state
// ---------------------------------------------------------------------------

struct State<V> {
    entries: lru::LruCache<String, CacheEntry<V>>,
    hits: u64,
    misses: u64,
    evictions: u64,
    last_cleanup: DateTime<Utc>,
}

struct Shared<V> {
    config: CacheConfig,
    state: RwLock<State<V>>,
}

impl<V> Shared<V> {
    fn write(&self) -> RwLockWriteGuard<'_, State<V>> {
        self.state.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn read(&self) -> RwLockReadGuard<'_, State<V>> {
        self.state.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn record_hit(&self, state: &mut State<V>) {
        if self.config.enable_stats {
            state.hits += 1;
        }
    }

    fn record_miss(&self, state: &mut State<V>) {
        if self.config.enable_stats {
            state.misses += 1;
        }
    }

    fn cleanup(&self, max_age: Duration) -> usize {
        let mut state = self.write();
        let now = Instant::now();
        let doomed: Vec<String> = state
            .entries
            .iter()
            .filter(|(_, entry)| entry.is_expired(now) || entry.older_than(now, max_age))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &doomed {
            state.entries.pop(key);
        }
        state.last_cleanup = Utc::now();
        doomed.len()
    }
}

// ---------------------------------------------------------------------------
// Sweeper
// ---------------------------------------------------------------------------

/// Background thread that periodically runs `cleanup`. Dropping `stop`
/// wakes it; `handle` is joined so nothing outlives the cache.
struct Sweeper {
    stop: Sender<()>,
    handle: JoinHandle<()>,
}

impl Sweeper {
    fn spawn<V: Send + Sync + 'static>(shared: Arc<Shared<V>>) -> Option<Self> {
        let period = shared.config.cleanup_period;
        let (stop, stopped) = crossbeam_channel::bounded::<()>(0);
        let spawned = std::thread::Builder::new()
            .name("berth-cache-sweeper".into())
            .spawn(move || {
                let ticker = crossbeam_channel::tick(period);
                loop {
                    crossbeam_channel::select! {
                        recv(ticker) -> _ => {
                            let removed = shared.cleanup(Duration::ZERO);
                            if removed > 0 {
                                debug!(removed, "cache sweep removed expired entries");
                            }
                        }
                        recv(stopped) -> _ => break,
                    }
                }
            });

        match spawned {
            Ok(handle) => Some(Self { stop, handle }),
            Err(e) => {
                warn!(error = %e, "failed to start cache sweeper; expired entries will be removed lazily");
                None
            }
        }
    }

    fn shutdown(self) {
        drop(self.stop);
        if self.handle.join().is_err() {
            warn!("cache sweeper thread panicked");
        }
    }
}

// ---------------------------------------------------------------------------
// LruCache
// ---------------------------------------------------------------------------

/// Thread-safe TTL + LRU cache. Cheap to share behind an `Arc`.
pub struct LruCache<V> {
    shared: Arc<Shared<V>>,
    sweeper: Mutex<Option<Sweeper>>,
}

impl<V: Clone + Send + Sync + 'static> LruCache<V> {
    /// Create a cache, starting the sweeper thread when
    /// `config.cleanup_period` is non-zero.
    pub fn new(config: CacheConfig) -> Self {
        let run_sweeper = !config.cleanup_period.is_zero();
        let shared = Arc::new(Shared {
            state: RwLock::new(State {
                entries: lru::LruCache::unbounded(),
                hits: 0,
                misses: 0,
                evictions: 0,
                last_cleanup: Utc::now(),
            }),
            config,
        });
        let sweeper = if run_sweeper {
            Sweeper::spawn(shared.clone())
        } else {
            None
        };
        Self {
            shared,
            sweeper: Mutex::new(sweeper),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(CacheConfig::default())
    }

    pub fn config(&self) -> &CacheConfig {
        &self.shared.config
    }

    /// Whether the background sweeper is currently running.
    pub fn sweeper_running(&self) -> bool {
        self.sweeper
            .lock()
            .map(|guard| guard.is_some())
            .unwrap_or(false)
    }

    fn stop_sweeper(&self) {
        let sweeper = match self.sweeper.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(sweeper) = sweeper {
            sweeper.shutdown();
        }
    }
}

impl<V: Clone + Send + Sync + 'static> Cache<V> for LruCache<V> {
    fn get(&self, key: &str) -> Option<V> {
        let shared = &self.shared;
        let mut state = shared.write();

        let now = Instant::now();
        match state.entries.peek(key).map(|entry| entry.is_expired(now)) {
            None => {
                shared.record_miss(&mut state);
                None
            }
            Some(true) => {
                state.entries.pop(key);
                shared.record_miss(&mut state);
                None
            }
            Some(false) => {
                let value = state.entries.get(key).map(|entry| entry.value.clone());
                shared.record_hit(&mut state);
                value
            }
        }
    }

    fn set(&self, key: &str, value: V) {
        self.set_with_ttl(key, value, self.shared.config.default_ttl);
    }

    fn set_with_ttl(&self, key: &str, value: V, ttl: Duration) {
        let shared = &self.shared;
        let mut state = shared.write();
        let entry = CacheEntry {
            value,
            created_at: Instant::now(),
            ttl,
        };

        // `put` on an existing key replaces and promotes without growing.
        let replaced = state.entries.put(key.to_string(), entry).is_some();
        if replaced {
            return;
        }

        if state.entries.len() > shared.config.max_size {
            if let Some((evicted, _)) = state.entries.pop_lru() {
                debug!(key = %evicted, "cache evicted least recently used entry");
                if shared.config.enable_stats {
                    state.evictions += 1;
                }
            }
        }
    }

    fn delete(&self, key: &str) {
        self.shared.write().entries.pop(key);
    }

    fn clear_prefix(&self, prefix: &str) {
        let mut state = self.shared.write();
        if prefix.is_empty() {
            state.entries.clear();
            return;
        }
        let doomed: Vec<String> = state
            .entries
            .iter()
            .filter(|(key, _)| key.starts_with(prefix))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &doomed {
            state.entries.pop(key);
        }
    }

    fn cleanup(&self, max_age: Duration) {
        self.shared.cleanup(max_age);
    }

    fn size(&self) -> usize {
        self.shared.read().entries.len()
    }

    fn stats(&self) -> CacheStats {
        let state = self.shared.read();
        CacheStats {
            hits: state.hits,
            misses: state.misses,
            evictions: state.evictions,
            size: state.entries.len(),
            max_size: self.shared.config.max_size,
            hit_rate: CacheStats::compute_hit_rate(state.hits, state.misses),
            last_cleanup: state.last_cleanup,
        }
    }

    fn close(&self) {
        self.stop_sweeper();
        self.shared.write().entries.clear();
    }
}

impl<V> Drop for LruCache<V> {
    fn drop(&mut self) {
        let sweeper = match self.sweeper.get_mut() {
            Ok(slot) => slot.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(sweeper) = sweeper {
            sweeper.shutdown();
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn no_sweeper(max_size: usize) -> LruCache<i32> {
        LruCache::new(CacheConfig {
            max_size,
            default_ttl: Duration::ZERO,
            cleanup_period: Duration::ZERO,
            enable_stats: true,
        })
    }

    #[test]
    fn entry_with_zero_ttl_never_expires() {
        let entry = CacheEntry {
            value: 1,
            created_at: Instant::now(),
            ttl: Duration::ZERO,
        };
        assert!(!entry.is_expired(Instant::now() + Duration::from_secs(3600)));
    }

    #[test]
    fn entry_past_ttl_is_expired() {
        let entry = CacheEntry {
            value: 1,
            created_at: Instant::now(),
            ttl: Duration::from_millis(10),
        };
        assert!(entry.is_expired(Instant::now() + Duration::from_millis(50)));
    }

    #[test]
    fn replacing_a_key_does_not_evict() {
        let cache = no_sweeper(2);
        cache.set("a", 1);
        cache.set("b", 2);
        cache.set("a", 10);
        assert_eq!(cache.size(), 2);
        assert_eq!(cache.stats().evictions, 0);
        assert_eq!(cache.get("a"), Some(10));
    }

    #[test]
    fn disabled_stats_stay_zero() {
        let cache = LruCache::new(CacheConfig {
            max_size: 1,
            cleanup_period: Duration::ZERO,
            enable_stats: false,
            ..CacheConfig::default()
        });
        cache.set("a", 1);
        cache.set("b", 2);
        cache.get("a");
        cache.get("b");
        let stats = cache.stats();
        assert_eq!(stats.hits, 0);
        assert_eq!(stats.misses, 0);
        assert_eq!(stats.evictions, 0);
        assert_eq!(stats.size, 1);
    }

    #[test]
    fn hit_rate_with_no_accesses_is_zero() {
        assert_eq!(CacheStats::compute_hit_rate(0, 0), 0.0);
        assert!((CacheStats::compute_hit_rate(3, 1) - 0.75).abs() < f64::EPSILON);
    }

    #[test]
    fn sweeper_stops_on_close() {
        let cache: LruCache<i32> = LruCache::new(CacheConfig {
            cleanup_period: Duration::from_millis(5),
            ..CacheConfig::default()
        });
        assert!(cache.sweeper_running());
        cache.close();
        assert!(!cache.sweeper_running());
        // second close is a no-op
        cache.close();
    }
}
