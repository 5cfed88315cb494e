//! Memoized merge/sync conflict checks.
//!
//! Entries are keyed `"<worktree>:<operation>"` or `"<worktree>:combined"` and
//! carry the two commit hashes the verdict was computed against. A verdict is
//! trustworthy only while both hashes still match, so freshness is structural:
//! entries are stored without a TTL and only LRU pressure or an explicit
//! `cleanup(max_age)` removes an entry whose commits are unchanged.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::cache::{Cache, CacheConfig, CacheStats, LruCache};
use crate::types::{CombinedConflictResult, ConflictResult};

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

/// The two result shapes that share one underlying cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "result", rename_all = "snake_case")]
pub enum ConflictPayload {
    Single(ConflictResult),
    Combined(CombinedConflictResult),
}

impl ConflictPayload {
    fn kind(&self) -> &'static str {
        match self {
            ConflictPayload::Single(_) => "single",
            ConflictPayload::Combined(_) => "combined",
        }
    }
}

/// What actually sits in the cache for a conflict key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictEntry {
    pub worktree_commit: String,
    pub source_commit: String,
    pub payload: ConflictPayload,
    pub checked_at: DateTime<Utc>,
}

impl ConflictEntry {
    fn matches(&self, worktree_commit: &str, source_commit: &str) -> bool {
        self.worktree_commit == worktree_commit && self.source_commit == source_commit
    }
}

// ---------------------------------------------------------------------------
// Key derivation
// ---------------------------------------------------------------------------

pub fn format_key(worktree_id: &str, operation: &str) -> String {
    format!("{worktree_id}:{operation}")
}

pub fn format_combined_key(worktree_id: &str) -> String {
    format!("{worktree_id}:combined")
}

// ---------------------------------------------------------------------------
// ConflictCache
// ---------------------------------------------------------------------------

/// Typed conflict-check cache over any [`Cache`] engine.
#[derive(Clone)]
pub struct ConflictCache {
    cache: Arc<dyn Cache<ConflictEntry>>,
}

impl ConflictCache {
    pub fn new(cache: Arc<dyn Cache<ConflictEntry>>) -> Self {
        Self { cache }
    }

    pub fn with_config(config: CacheConfig) -> Self {
        Self::new(Arc::new(LruCache::new(config)))
    }

    pub fn with_defaults() -> Self {
        Self::with_config(CacheConfig::default())
    }

    pub fn get_result(&self, key: &str) -> Option<ConflictResult> {
        match self.get_entry(key)?.payload {
            ConflictPayload::Single(result) => Some(result),
            other => {
                self.discard_corrupt(key, "single", other.kind());
                None
            }
        }
    }

    pub fn get_combined_result(&self, key: &str) -> Option<CombinedConflictResult> {
        match self.get_entry(key)?.payload {
            ConflictPayload::Combined(result) => Some(result),
            other => {
                self.discard_corrupt(key, "combined", other.kind());
                None
            }
        }
    }

    pub fn set_result(
        &self,
        key: &str,
        worktree_commit: &str,
        source_commit: &str,
        result: ConflictResult,
    ) {
        self.put(key, worktree_commit, source_commit, ConflictPayload::Single(result));
    }

    pub fn set_combined_result(
        &self,
        key: &str,
        worktree_commit: &str,
        source_commit: &str,
        result: CombinedConflictResult,
    ) {
        self.put(
            key,
            worktree_commit,
            source_commit,
            ConflictPayload::Combined(result),
        );
    }

    /// True when an entry exists for `key` and was computed against exactly
    /// these two commits.
    pub fn is_valid(&self, key: &str, worktree_commit: &str, source_commit: &str) -> bool {
        self.get_entry(key)
            .map(|entry| entry.matches(worktree_commit, source_commit))
            .unwrap_or(false)
    }

    /// Drop every cached verdict for one worktree.
    pub fn invalidate_worktree(&self, worktree_id: &str) {
        self.cache.clear_prefix(&format!("{worktree_id}:"));
    }

    pub fn format_key(&self, worktree_id: &str, operation: &str) -> String {
        format_key(worktree_id, operation)
    }

    pub fn format_combined_key(&self, worktree_id: &str) -> String {
        format_combined_key(worktree_id)
    }

    pub fn clear(&self, prefix: &str) {
        self.cache.clear_prefix(prefix);
    }

    pub fn delete(&self, key: &str) {
        self.cache.delete(key);
    }

    pub fn cleanup(&self, max_age: Duration) {
        self.cache.cleanup(max_age);
    }

    pub fn size(&self) -> usize {
        self.cache.size()
    }

    pub fn stats(&self) -> CacheStats {
        self.cache.stats()
    }

    pub fn close(&self) {
        self.cache.close();
    }

    /// Store a raw JSON entry, e.g. one restored from a snapshot. Anything that
    /// does not decode as a [`ConflictEntry`] is rejected and any existing
    /// entry at `key` is removed.
    pub fn import_json(&self, key: &str, raw: &serde_json::Value) -> bool {
        match serde_json::from_value::<ConflictEntry>(raw.clone()) {
            Ok(entry) => {
                self.cache.set_with_ttl(key, entry, Duration::ZERO);
                true
            }
            Err(e) => {
                warn!(key, error = %e, "rejecting undecodable conflict cache entry");
                self.cache.delete(key);
                false
            }
        }
    }

    fn put(&self, key: &str, worktree_commit: &str, source_commit: &str, payload: ConflictPayload) {
        let entry = ConflictEntry {
            worktree_commit: worktree_commit.to_string(),
            source_commit: source_commit.to_string(),
            payload,
            checked_at: Utc::now(),
        };
        self.cache.set_with_ttl(key, entry, Duration::ZERO);
    }

    fn get_entry(&self, key: &str) -> Option<ConflictEntry> {
        self.cache.get(key)
    }

    fn discard_corrupt(&self, key: &str, expected: &str, found: &str) {
        warn!(
            key,
            expected, found, "conflict cache entry has the wrong shape; removing it"
        );
        self.cache.delete(key);
    }
}

impl std::fmt::Debug for ConflictCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConflictCache")
            .field("size", &self.size())
            .finish()
    }
}
