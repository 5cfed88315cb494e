use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

// ---------------------------------------------------------------------------
// MergeConflict
// ---------------------------------------------------------------------------

/// A conflict detected while syncing or merging a worktree against its source
/// branch. Produced by the git layer; berth only caches it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeConflict {
    /// `"sync"` or `"merge"`.
    pub operation: String,
    pub worktree_name: String,
    pub worktree_path: String,
    #[serde(default)]
    pub conflict_files: Vec<String>,
    /// Human-readable summary.
    pub message: String,
}

impl MergeConflict {
    pub fn new(
        operation: impl Into<String>,
        worktree_name: impl Into<String>,
        conflict_files: Vec<String>,
    ) -> Self {
        let operation = operation.into();
        let worktree_name = worktree_name.into();
        let message = format!(
            "{operation} of {worktree_name} conflicts in {} file(s)",
            conflict_files.len()
        );
        Self {
            operation,
            worktree_name,
            worktree_path: String::new(),
            conflict_files,
            message,
        }
    }
}

impl fmt::Display for MergeConflict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for MergeConflict {}

/// Verdict of a single-operation conflict check. `None` means the operation
/// would apply cleanly, which is still a cacheable answer.
pub type ConflictResult = Option<MergeConflict>;

// ---------------------------------------------------------------------------
// CombinedConflictResult
// ---------------------------------------------------------------------------

/// Sync and merge verdicts for one worktree, checked together.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CombinedConflictResult {
    pub worktree_id: String,
    pub worktree_name: String,
    pub sync_conflict: Option<MergeConflict>,
    pub merge_conflict: Option<MergeConflict>,
    pub checked_at: DateTime<Utc>,
}

impl CombinedConflictResult {
    pub fn has_conflicts(&self) -> bool {
        self.sync_conflict.is_some() || self.merge_conflict.is_some()
    }
}
