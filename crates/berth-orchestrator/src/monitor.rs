//! Steady-state monitoring once the container is ready.
//!
//! Every tick publishes `container:status` when the running state changes and
//! checks whether the watched repository's HEAD moved. A moved HEAD makes
//! every cached conflict verdict for that worktree suspect, so they are
//! dropped and subscribers are told.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use berth_bridge::event_bus::EventBus;
use berth_bridge::protocol::AppEvent;
use berth_core::conflict::ConflictCache;
use berth_core::runtime::{RuntimeConfig, LOGICAL_LIVE};
use berth_harness::ShutdownSignal;
use git2::{ErrorCode, Repository};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::container::ContainerRuntime;

pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoWatch {
    pub worktree_id: String,
    pub repo_root: PathBuf,
}

/// What a single tick did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    pub running: bool,
    pub status_published: bool,
    pub head_changed: bool,
}

pub struct Monitor {
    runtime: Arc<dyn ContainerRuntime>,
    container: String,
    bus: EventBus,
    conflicts: ConflictCache,
    repo: Option<RepoWatch>,
    interval: Duration,
    last_running: Option<bool>,
    last_head: Option<String>,
}

impl Monitor {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        container: impl Into<String>,
        bus: EventBus,
        conflicts: ConflictCache,
    ) -> Self {
        Self {
            runtime,
            container: container.into(),
            bus,
            conflicts,
            repo: None,
            interval: DEFAULT_INTERVAL,
            last_running: None,
            last_head: None,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Watch `repo_root` for HEAD moves, attributing them to `worktree_id`.
    pub fn with_repo(mut self, worktree_id: impl Into<String>, repo_root: impl Into<PathBuf>) -> Self {
        let repo = RepoWatch {
            worktree_id: worktree_id.into(),
            repo_root: repo_root.into(),
        };
        self.last_head = read_head(&repo.repo_root);
        self.repo = Some(repo);
        self
    }

    /// Watch the repository the process was started from, if any.
    pub fn watch_current_repo(self, runtime: &RuntimeConfig) -> Self {
        let Some(repo) = runtime.current_repo.clone() else {
            return self;
        };
        match runtime.resolve_path(&format!("{LOGICAL_LIVE}/{repo}")) {
            Some(root) => self.with_repo(repo, root),
            None => {
                debug!(repo = %repo, "live root unavailable; not watching repository");
                self
            }
        }
    }

    pub fn repo(&self) -> Option<&RepoWatch> {
        self.repo.as_ref()
    }

    pub async fn tick(&mut self) -> TickReport {
        let running = self.runtime.is_running(&self.container).await;
        let mut report = TickReport {
            running,
            ..TickReport::default()
        };

        if self.last_running != Some(running) {
            let (status, message) = if running {
                ("running", None)
            } else {
                warn!(container = %self.container, "container is not running");
                (
                    "stopped",
                    Some(format!("Container {} is not running", self.container)),
                )
            };
            self.bus.publish(AppEvent::container_status(status, message));
            self.last_running = Some(running);
            report.status_published = true;
        }

        if let Some(repo) = &self.repo {
            if let Some(head) = read_head(&repo.repo_root) {
                match self.last_head.replace(head.clone()) {
                    Some(previous) if previous != head => {
                        info!(
                            worktree = %repo.worktree_id,
                            from = short(&previous),
                            to = short(&head),
                            "repository HEAD moved; invalidating conflict cache"
                        );
                        self.conflicts.invalidate_worktree(&repo.worktree_id);
                        self.bus.publish(AppEvent::cache_invalidated(
                            repo.worktree_id.clone(),
                            format!("HEAD moved from {} to {}", short(&previous), short(&head)),
                        ));
                        self.bus
                            .publish(AppEvent::git_dirty(repo.worktree_id.clone(), Vec::new()));
                        report.head_changed = true;
                    }
                    _ => {}
                }
            }
        }

        report
    }

    pub async fn run(mut self, shutdown: ShutdownSignal) {
        info!(
            container = %self.container,
            interval_ms = self.interval.as_millis() as u64,
            repo = self.repo.as_ref().map(|r| r.worktree_id.as_str()).unwrap_or("-"),
            "monitor started"
        );
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    self.tick().await;
                }
            }
        }
        info!(container = %self.container, "monitor stopped");
    }
}

fn short(hash: &str) -> &str {
    hash.get(..12).unwrap_or(hash)
}

// ---------------------------------------------------------------------------
// HEAD resolution
// ---------------------------------------------------------------------------

/// Commit that `repo_root` has checked out, or `ref: <branch>` while the
/// branch is still unborn. Linked worktrees resolve through their own HEAD.
pub fn read_head(repo_root: &Path) -> Option<String> {
    let repo = match Repository::discover(repo_root) {
        Ok(repo) => repo,
        Err(e) => {
            debug!(path = %repo_root.display(), error = %e, "not a git repository");
            return None;
        }
    };
    let head = match repo.head() {
        Ok(head) => head,
        Err(e) if e.code() == ErrorCode::UnbornBranch => {
            let reference = repo.find_reference("HEAD").ok()?;
            return reference.symbolic_target().map(|name| format!("ref: {name}"));
        }
        Err(e) => {
            warn!(path = %repo_root.display(), error = %e, "failed to read HEAD");
            return None;
        }
    };
    head.target().map(|oid| oid.to_string())
}
