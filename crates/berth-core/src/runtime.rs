//! Execution-environment detection and logical path resolution.
//!
//! The same orchestration code runs inside a Docker container, inside an
//! Apple `container` VM, or directly on a developer machine. Callers address
//! resources through fixed logical prefixes (`/workspace`, `/volume`, `/live`,
//! `/home/berth`) and [`RuntimeConfig::resolve_path`] maps them onto the real
//! roots for the detected mode.
//!
//! A [`RuntimeConfig`] is built once at startup and passed to whoever needs
//! it; it is never mutated afterwards.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Explicit mode override, checked before any filesystem probing.
pub const CONTAINER_OVERRIDE_VAR: &str = "BERTH_CONTAINER";

pub const LOGICAL_WORKSPACE: &str = "/workspace";
pub const LOGICAL_VOLUME: &str = "/volume";
pub const LOGICAL_LIVE: &str = "/live";
pub const LOGICAL_HOME: &str = "/home/berth";

const DOCKERENV_MARKER: &str = "/.dockerenv";
const INIT_CGROUP: &str = "/proc/1/cgroup";
const NATIVE_STATE_DIR: &str = ".berth";

// ---------------------------------------------------------------------------
// RuntimeMode
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuntimeMode {
    Docker,
    Container,
    Native,
}

impl fmt::Display for RuntimeMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            RuntimeMode::Docker => "docker",
            RuntimeMode::Container => "container",
            RuntimeMode::Native => "native",
        };
        f.write_str(label)
    }
}

// ---------------------------------------------------------------------------
// EnvProbe
// ---------------------------------------------------------------------------

/// Everything detection reads from the outside world.
pub trait EnvProbe {
    fn var(&self, name: &str) -> Option<String>;
    fn exists(&self, path: &Path) -> bool;
    fn read_to_string(&self, path: &Path) -> Option<String>;
    fn current_dir(&self) -> Option<PathBuf>;
    fn home_dir(&self) -> Option<PathBuf>;
    fn temp_dir(&self) -> PathBuf;
    fn is_linux(&self) -> bool;
}

/// Probe backed by the real process environment.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemProbe;

impl EnvProbe for SystemProbe {
    fn var(&self, name: &str) -> Option<String> {
        std::env::var(name).ok()
    }

    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn read_to_string(&self, path: &Path) -> Option<String> {
        std::fs::read_to_string(path).ok()
    }

    fn current_dir(&self) -> Option<PathBuf> {
        std::env::current_dir().ok()
    }

    fn home_dir(&self) -> Option<PathBuf> {
        dirs::home_dir().or_else(|| std::env::var_os("HOME").map(PathBuf::from))
    }

    fn temp_dir(&self) -> PathBuf {
        std::env::temp_dir()
    }

    fn is_linux(&self) -> bool {
        cfg!(target_os = "linux")
    }
}

// ---------------------------------------------------------------------------
// RuntimeConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    pub mode: RuntimeMode,
    pub workspace_dir: PathBuf,
    pub volume_dir: PathBuf,
    /// Root holding live repositories. Natively this is the current checkout
    /// itself, reachable only as `/live/<current_repo>`, and `None` when the
    /// process was not started inside one.
    pub live_dir: Option<PathBuf>,
    pub home_dir: PathBuf,
    pub temp_dir: PathBuf,
    /// Name of the repository the process was started from (native only).
    pub current_repo: Option<String>,
    pub sync_enabled: bool,
    pub port_monitor_enabled: bool,
}

impl RuntimeConfig {
    /// Detect the runtime from the real process environment.
    pub fn detect() -> Self {
        Self::detect_with(&SystemProbe)
    }

    pub fn detect_with(probe: &dyn EnvProbe) -> Self {
        let mode = detect_mode(probe);
        let config = match mode {
            RuntimeMode::Docker | RuntimeMode::Container => Self::containerized(mode),
            RuntimeMode::Native => Self::native(probe),
        };
        info!(
            mode = %config.mode,
            workspace = %config.workspace_dir.display(),
            volume = %config.volume_dir.display(),
            repo = config.current_repo.as_deref().unwrap_or("-"),
            "runtime detected"
        );
        config
    }

    /// Fixed roots used inside any container image.
    pub fn containerized(mode: RuntimeMode) -> Self {
        Self {
            mode,
            workspace_dir: PathBuf::from(LOGICAL_WORKSPACE),
            volume_dir: PathBuf::from(LOGICAL_VOLUME),
            live_dir: Some(PathBuf::from(LOGICAL_LIVE)),
            home_dir: PathBuf::from(LOGICAL_HOME),
            temp_dir: PathBuf::from("/tmp"),
            current_repo: None,
            sync_enabled: true,
            port_monitor_enabled: true,
        }
    }

    fn native(probe: &dyn EnvProbe) -> Self {
        let home_dir = probe.home_dir().unwrap_or_else(|| PathBuf::from("."));
        let state_dir = home_dir.join(NATIVE_STATE_DIR);

        let live_dir = probe.current_dir().and_then(|cwd| find_git_root(&cwd));
        let current_repo = live_dir
            .as_ref()
            .and_then(|root| root.file_name())
            .map(|name| name.to_string_lossy().into_owned());

        let config = Self {
            mode: RuntimeMode::Native,
            workspace_dir: state_dir.join("workspace"),
            volume_dir: state_dir,
            live_dir,
            home_dir,
            temp_dir: probe.temp_dir(),
            current_repo,
            sync_enabled: false,
            port_monitor_enabled: probe.is_linux(),
        };

        ensure_dir(&config.workspace_dir, "workspace");
        ensure_dir(&config.volume_dir, "volume");
        config
    }

    /// Translate a logical path into a real one for this runtime.
    ///
    /// Unrecognised paths come back unchanged. `None` means the logical path
    /// has no real counterpart here (e.g. `/live/...` natively outside a git
    /// checkout, or naming any repository but the current one) and must not
    /// be used.
    pub fn resolve_path(&self, logical: &str) -> Option<PathBuf> {
        if let Some(rel) = strip_root(logical, LOGICAL_WORKSPACE) {
            return Some(join_rel(&self.workspace_dir, rel));
        }
        if let Some(rel) = strip_root(logical, LOGICAL_VOLUME) {
            return Some(join_rel(&self.volume_dir, rel));
        }
        if let Some(rel) = strip_root(logical, LOGICAL_LIVE) {
            return self.resolve_live(rel);
        }
        if let Some(rel) = strip_root(logical, LOGICAL_HOME) {
            return Some(join_rel(&self.home_dir, rel));
        }
        Some(PathBuf::from(logical))
    }

    fn resolve_live(&self, rel: &str) -> Option<PathBuf> {
        let live = self.live_dir.as_ref()?;
        if !self.is_native() {
            return Some(join_rel(live, rel));
        }
        let (repo, rest) = rel.split_once('/').unwrap_or((rel, ""));
        if repo.is_empty() || self.current_repo.as_deref() != Some(repo) {
            debug!(path = rel, "only the current repository is live natively");
            return None;
        }
        Some(join_rel(live, rest))
    }

    /// Candidate locations of the coding-agent binary.
    pub fn agent_binary_paths(&self) -> Vec<String> {
        if self.is_containerized() {
            vec![
                "/opt/berth/nvm/versions/node/*/bin/claude".to_string(),
                "/usr/local/bin/claude".to_string(),
            ]
        } else {
            vec!["claude".to_string()]
        }
    }

    /// `/proc/<pid>/<sub>` when port monitoring is available.
    pub fn proc_path(&self, pid: u32, sub: &str) -> Option<PathBuf> {
        if !self.port_monitor_enabled {
            return None;
        }
        Some(PathBuf::from(format!("/proc/{pid}/{sub}")))
    }

    pub fn is_docker(&self) -> bool {
        self.mode == RuntimeMode::Docker
    }

    pub fn is_container(&self) -> bool {
        self.mode == RuntimeMode::Container
    }

    pub fn is_native(&self) -> bool {
        self.mode == RuntimeMode::Native
    }

    pub fn is_containerized(&self) -> bool {
        matches!(self.mode, RuntimeMode::Docker | RuntimeMode::Container)
    }
}

// ---------------------------------------------------------------------------
// Detection helpers
// ---------------------------------------------------------------------------

/// Override variable > `/.dockerenv` > init cgroup > `container=apple` > native.
pub fn detect_mode(probe: &dyn EnvProbe) -> RuntimeMode {
    if let Some(value) = probe.var(CONTAINER_OVERRIDE_VAR) {
        match value.as_str() {
            "docker" | "true" => return RuntimeMode::Docker,
            "container" | "apple" => return RuntimeMode::Container,
            "" => {}
            other => debug!(value = other, "ignoring unrecognised runtime override"),
        }
    }

    if probe.exists(Path::new(DOCKERENV_MARKER)) {
        return RuntimeMode::Docker;
    }

    if let Some(cgroup) = probe.read_to_string(Path::new(INIT_CGROUP)) {
        if cgroup.contains("docker") || cgroup.contains("containerd") {
            return RuntimeMode::Docker;
        }
    }

    if probe.var("container").as_deref() == Some("apple") {
        return RuntimeMode::Container;
    }

    RuntimeMode::Native
}

/// Working tree of the repository containing `start`, linked worktrees
/// included. `None` outside a checkout or for a bare repository.
pub fn find_git_root(start: &Path) -> Option<PathBuf> {
    match git2::Repository::discover(start) {
        // libgit2 reports the workdir with a trailing separator
        Ok(repo) => repo.workdir().map(|dir| dir.components().collect()),
        Err(e) => {
            debug!(start = %start.display(), error = %e, "no git repository");
            None
        }
    }
}

fn strip_root<'a>(path: &'a str, root: &str) -> Option<&'a str> {
    let rest = path.strip_prefix(root)?;
    if rest.is_empty() {
        return Some("");
    }
    rest.strip_prefix('/')
}

fn join_rel(base: &Path, rel: &str) -> PathBuf {
    if rel.is_empty() {
        base.to_path_buf()
    } else {
        base.join(rel)
    }
}

fn ensure_dir(path: &Path, label: &str) {
    if let Err(e) = std::fs::create_dir_all(path) {
        warn!(
            dir = %path.display(),
            kind = label,
            error = %e,
            "failed to create directory; continuing without it"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strip_root_requires_segment_boundary() {
        assert_eq!(strip_root("/workspace/a", "/workspace"), Some("a"));
        assert_eq!(strip_root("/workspace", "/workspace"), Some(""));
        assert_eq!(strip_root("/workspaces/a", "/workspace"), None);
    }

    #[test]
    fn mode_display() {
        assert_eq!(RuntimeMode::Docker.to_string(), "docker");
        assert_eq!(RuntimeMode::Native.to_string(), "native");
    }

    #[test]
    fn proc_path_disabled_without_port_monitor() {
        let mut config = RuntimeConfig::containerized(RuntimeMode::Docker);
        assert_eq!(
            config.proc_path(42, "net/tcp"),
            Some(PathBuf::from("/proc/42/net/tcp"))
        );
        config.port_monitor_enabled = false;
        assert_eq!(config.proc_path(42, "net/tcp"), None);
    }
}
