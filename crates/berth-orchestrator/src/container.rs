//! Container runtime adapter.
//!
//! [`ContainerRuntime`] is the seam between the bootstrap logic and the
//! outside world. [`CliContainerRuntime`] drives either the `docker` CLI or
//! Apple's `container` CLI; tests substitute a scripted implementation.

use std::ffi::OsStr;
use std::fmt;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use berth_core::runtime::{CONTAINER_OVERRIDE_VAR, LOGICAL_LIVE, LOGICAL_VOLUME};
use serde::Serialize;
use tracing::{debug, info};

/// Vite dev server, forwarded in dev mode.
pub const DEV_SERVER_PORT: &str = "5173:5173";

/// Repository name used for the live mount in dev mode.
const DEV_LIVE_NAME: &str = "berth";

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ContainerError {
    #[error("no container runtime found on PATH (looked for {0})")]
    NotFound(String),

    #[error("unsupported container runtime: {0}")]
    Unsupported(String),

    #[error("failed to execute {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{message}\nCommand: {command}\nOutput: {output}")]
    Command {
        message: String,
        command: String,
        output: String,
    },
}

impl ContainerError {
    /// Captured CLI output, if the command ran at all.
    pub fn output(&self) -> &str {
        match self {
            ContainerError::Command { output, .. } => output,
            _ => "",
        }
    }

    pub fn command(&self) -> Option<&str> {
        match self {
            ContainerError::Command { command, .. } | ContainerError::Spawn { command, .. } => {
                Some(command)
            }
            _ => None,
        }
    }

    /// The runtime refused because a container with this name exists.
    pub fn is_name_conflict(&self) -> bool {
        let output = self.output().to_lowercase();
        output.contains("already exists") || output.contains("is already in use")
    }
}

pub type Result<T> = std::result::Result<T, ContainerError>;

// ---------------------------------------------------------------------------
// RuntimeKind
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RuntimeKind {
    Docker,
    Apple,
}

impl RuntimeKind {
    pub fn binary(&self) -> &'static str {
        match self {
            RuntimeKind::Docker => "docker",
            RuntimeKind::Apple => "container",
        }
    }

    /// Value of the runtime override variable passed into the container.
    pub fn mode_label(&self) -> &'static str {
        match self {
            RuntimeKind::Docker => "docker",
            RuntimeKind::Apple => "container",
        }
    }
}

impl fmt::Display for RuntimeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.binary())
    }
}

/// Resolve a configured runtime preference against the real `PATH`.
pub fn select_runtime(preference: &str) -> Result<RuntimeKind> {
    let path = std::env::var_os("PATH").unwrap_or_default();
    select_runtime_in(preference, &path)
}

/// `auto` prefers Apple's `container` CLI, then `docker`. Explicit choices
/// must still be installed.
pub fn select_runtime_in(preference: &str, path: &OsStr) -> Result<RuntimeKind> {
    let candidates: &[RuntimeKind] = match preference {
        "" | "auto" => &[RuntimeKind::Apple, RuntimeKind::Docker],
        "docker" => &[RuntimeKind::Docker],
        "container" | "apple" => &[RuntimeKind::Apple],
        other => return Err(ContainerError::Unsupported(other.to_string())),
    };

    candidates
        .iter()
        .copied()
        .find(|kind| find_in_path(kind.binary(), path).is_some())
        .inspect(|kind| info!(runtime = %kind, preference, "container runtime selected"))
        .ok_or_else(|| {
            let names: Vec<&str> = candidates.iter().map(RuntimeKind::binary).collect();
            ContainerError::NotFound(names.join(", "))
        })
}

pub fn find_in_path(binary: &str, path: &OsStr) -> Option<PathBuf> {
    std::env::split_paths(path)
        .map(|dir| dir.join(binary))
        .find(|candidate| is_executable(candidate))
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

// ---------------------------------------------------------------------------
// CommandSpec / RunSpec
// ---------------------------------------------------------------------------

/// A subprocess description, spawned either to completion or as a stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: Vec<(String, String)>,
}

impl CommandSpec {
    pub fn new<I, S>(program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
            cwd: None,
            env: Vec::new(),
        }
    }

    pub fn with_cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn to_command(&self) -> tokio::process::Command {
        let mut cmd = tokio::process::Command::new(&self.program);
        cmd.args(&self.args);
        if let Some(cwd) = &self.cwd {
            cmd.current_dir(cwd);
        }
        for (k, v) in &self.env {
            cmd.env(k, v);
        }
        cmd
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.program)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

/// Everything needed to create the workspace container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSpec {
    pub image: String,
    pub name: String,
    pub ports: Vec<String>,
    pub dev_mode: bool,
    /// Pass `--rm` so the runtime deletes the container when it stops.
    pub rm: bool,
    pub env: Vec<(String, String)>,
    /// Host directory mounted at `/volume`.
    pub volume_dir: PathBuf,
    /// Host checkout mounted under `/live`.
    pub repo_root: Option<PathBuf>,
}

/// Arguments for `<runtime> run ...`, excluding the binary.
pub fn run_args(kind: RuntimeKind, spec: &RunSpec) -> Vec<String> {
    let mut args: Vec<String> = vec!["run".into(), "--name".into(), spec.name.clone(), "-d".into()];
    if spec.rm {
        args.push("--rm".into());
    }

    args.push("-v".into());
    args.push(format!("{}:{LOGICAL_VOLUME}", spec.volume_dir.display()));

    args.push("-e".into());
    args.push(format!("{CONTAINER_OVERRIDE_VAR}={}", kind.mode_label()));
    for (k, v) in &spec.env {
        args.push("-e".into());
        args.push(format!("{k}={v}"));
    }

    if let Some(root) = &spec.repo_root {
        let repo_name = if spec.dev_mode {
            DEV_LIVE_NAME.to_string()
        } else {
            root.file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| DEV_LIVE_NAME.to_string())
        };
        args.push("-v".into());
        args.push(format!("{}:{LOGICAL_LIVE}/{repo_name}", root.display()));
    }

    for port in &spec.ports {
        args.push("-p".into());
        args.push(port.clone());
    }
    if spec.dev_mode && !spec.ports.iter().any(|p| p == DEV_SERVER_PORT) {
        args.push("-p".into());
        args.push(DEV_SERVER_PORT.into());
    }

    args.push(spec.image.clone());
    args
}

// ---------------------------------------------------------------------------
// ContainerRuntime
// ---------------------------------------------------------------------------

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    fn kind(&self) -> RuntimeKind;

    async fn is_running(&self, name: &str) -> bool;

    /// True for running and stopped containers alike.
    async fn exists(&self, name: &str) -> bool;

    async fn image_exists(&self, image: &str) -> bool;

    /// Image reference a (possibly stopped) container was created from.
    async fn container_image(&self, name: &str) -> Option<String>;

    fn pull_command(&self, image: &str) -> CommandSpec;

    fn build_command(&self, repo_root: &Path) -> CommandSpec;

    fn logs_command(&self, name: &str) -> CommandSpec;

    /// Create and start a new container, returning the command used.
    async fn run(&self, spec: &RunSpec) -> Result<CommandSpec>;

    async fn start(&self, name: &str) -> Result<()>;

    async fn stop(&self, name: &str) -> Result<()>;

    async fn remove(&self, name: &str) -> Result<()>;
}

/// [`ContainerRuntime`] backed by the `docker` or `container` CLI.
#[derive(Debug, Clone, Copy)]
pub struct CliContainerRuntime {
    kind: RuntimeKind,
}

impl CliContainerRuntime {
    pub fn new(kind: RuntimeKind) -> Self {
        Self { kind }
    }

    fn command(&self, args: &[&str]) -> CommandSpec {
        CommandSpec::new(self.kind.binary(), args.iter().copied())
    }

    /// Run to completion and return combined stdout + stderr.
    async fn exec(&self, spec: &CommandSpec, message: &str) -> Result<String> {
        debug!(command = %spec, "exec");
        let output = spec
            .to_command()
            .stdin(std::process::Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|source| ContainerError::Spawn {
                command: spec.to_string(),
                source,
            })?;

        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));

        if output.status.success() {
            Ok(combined)
        } else {
            Err(ContainerError::Command {
                message: format!("{message}: {}", output.status),
                command: spec.to_string(),
                output: combined.trim().to_string(),
            })
        }
    }

    async fn listed(&self, name: &str, all: bool) -> bool {
        let spec = match (self.kind, all) {
            (RuntimeKind::Docker, false) => {
                self.command(&["ps", "--filter", &format!("name={name}"), "--format", "{{.Names}}"])
            }
            (RuntimeKind::Docker, true) => self.command(&[
                "ps",
                "-a",
                "--filter",
                &format!("name={name}"),
                "--format",
                "{{.Names}}",
            ]),
            (RuntimeKind::Apple, false) => self.command(&["list"]),
            (RuntimeKind::Apple, true) => self.command(&["list", "--all"]),
        };
        let Ok(out) = self.exec(&spec, "list failed").await else {
            return false;
        };
        match self.kind {
            RuntimeKind::Docker => out.lines().any(|line| line.trim() == name),
            RuntimeKind::Apple => apple_table_has(&out, name, !all),
        }
    }
}

#[async_trait]
impl ContainerRuntime for CliContainerRuntime {
    fn kind(&self) -> RuntimeKind {
        self.kind
    }

    async fn is_running(&self, name: &str) -> bool {
        self.listed(name, false).await
    }

    async fn exists(&self, name: &str) -> bool {
        self.listed(name, true).await
    }

    async fn image_exists(&self, image: &str) -> bool {
        let spec = self.command(&["image", "inspect", image]);
        self.exec(&spec, "image inspect failed").await.is_ok()
    }

    async fn container_image(&self, name: &str) -> Option<String> {
        match self.kind {
            RuntimeKind::Docker => {
                let spec = self.command(&["inspect", "--format", "{{.Config.Image}}", name]);
                let out = self.exec(&spec, "inspect failed").await.ok()?;
                let image = out.trim();
                (!image.is_empty()).then(|| image.to_string())
            }
            RuntimeKind::Apple => {
                let spec = self.command(&["inspect", name]);
                let out = self.exec(&spec, "inspect failed").await.ok()?;
                let value: serde_json::Value = serde_json::from_str(&out).ok()?;
                apple_image_reference(&value)
            }
        }
    }

    fn pull_command(&self, image: &str) -> CommandSpec {
        match self.kind {
            RuntimeKind::Docker => self.command(&["pull", image]),
            RuntimeKind::Apple => self.command(&["image", "pull", image]),
        }
    }

    fn build_command(&self, repo_root: &Path) -> CommandSpec {
        CommandSpec::new("just", ["build-dev"])
            .with_cwd(repo_root)
            .with_env("TERM", "xterm-256color")
            .with_env("DOCKER_BUILDKIT", "1")
    }

    fn logs_command(&self, name: &str) -> CommandSpec {
        self.command(&["logs", "-f", name])
    }

    async fn run(&self, spec: &RunSpec) -> Result<CommandSpec> {
        let cmd = CommandSpec::new(self.kind.binary(), run_args(self.kind, spec));
        self.exec(&cmd, "failed to run container").await?;
        info!(name = %spec.name, image = %spec.image, "container created");
        Ok(cmd)
    }

    async fn start(&self, name: &str) -> Result<()> {
        let spec = self.command(&["start", name]);
        self.exec(&spec, "failed to start container").await.map(drop)
    }

    async fn stop(&self, name: &str) -> Result<()> {
        let spec = self.command(&["stop", name]);
        self.exec(&spec, "failed to stop container").await.map(drop)
    }

    async fn remove(&self, name: &str) -> Result<()> {
        let spec = self.command(&["rm", name]);
        self.exec(&spec, "failed to remove container").await.map(drop)
    }
}

/// Parse `container list` output:
/// `ID  IMAGE  OS  ARCH  STATE  ADDR`.
pub fn apple_table_has(table: &str, name: &str, require_running: bool) -> bool {
    table
        .lines()
        .filter(|line| !line.trim().is_empty() && !line.starts_with("ID"))
        .map(|line| line.split_whitespace().collect::<Vec<_>>())
        .any(|fields| {
            fields.first() == Some(&name)
                && (!require_running || fields.get(4) == Some(&"running"))
        })
}

fn apple_image_reference(value: &serde_json::Value) -> Option<String> {
    let entry = value.as_array().and_then(|a| a.first()).unwrap_or(value);
    entry
        .pointer("/configuration/image/reference")
        .or_else(|| entry.pointer("/image/reference"))
        .or_else(|| entry.get("image"))
        .and_then(|v| v.as_str())
        .map(str::to_string)
}

// ---------------------------------------------------------------------------
// Failure diagnosis
// ---------------------------------------------------------------------------

/// Turn well-known runtime failures into specific guidance. `None` means the
/// error is not recognised and should be shown as-is.
pub fn diagnose_start_error(err: &ContainerError, kind: RuntimeKind, image: &str) -> Option<String> {
    let text = err.to_string();
    let lower = text.to_lowercase();
    let command = err.command().unwrap_or("");
    let output = if err.output().is_empty() {
        text.as_str()
    } else {
        err.output()
    };

    let headline = if lower.contains("cannot connect to the docker daemon")
        || lower.contains("docker daemon is not running")
        || lower.contains("connection refused")
        || (kind == RuntimeKind::Docker
            && (lower.contains("no such file or directory") || lower.contains("command not found")))
    {
        "Docker is not running or not accessible.\n\n\
         To fix this:\n\
         - Start Docker Desktop (macOS/Windows)\n\
         - Or start the Docker daemon (Linux): sudo systemctl start docker\n\
         - Make sure your user is in the docker group (Linux): sudo usermod -aG docker $USER"
            .to_string()
    } else if lower.contains("unable to find image")
        || lower.contains("pull access denied")
        || lower.contains("repository does not exist")
        || lower.contains("no such image")
        || lower.contains("manifest unknown")
        || lower.contains("401 unauthorized")
    {
        format!(
            "Container image '{image}' is not available locally and could not be pulled.\n\n\
             To fix this:\n\
             - Try manually pulling the image: {} pull {image}\n\
             - Check if the image name and tag are correct\n\
             - If it's a private image, make sure you're authenticated",
            kind.binary()
        )
    } else if lower.contains("port is already allocated")
        || lower.contains("bind: address already in use")
    {
        "Port conflict: another service is using the required ports.\n\n\
         To fix this:\n\
         - Stop other containers using the same ports\n\
         - Use different ports with the --port flag\n\
         - Check what's using the ports: lsof -i :6369"
            .to_string()
    } else if lower.contains("insufficient memory")
        || lower.contains("not enough memory")
        || lower.contains("no space left on device")
    {
        "Insufficient system resources to start the container.\n\n\
         To fix this:\n\
         - Free up disk space or memory\n\
         - Clean up unused images: docker system prune"
            .to_string()
    } else {
        return None;
    };

    Some(format!("{headline}\n\nCommand: {command}\nOutput: {output}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn spec() -> RunSpec {
        RunSpec {
            image: "ghcr.io/berth-dev/berth:latest".into(),
            name: "berth".into(),
            ports: vec!["6369:6369".into()],
            dev_mode: false,
            rm: false,
            env: vec![("FOO".into(), "bar".into())],
            volume_dir: PathBuf::from("/home/u/.berth"),
            repo_root: Some(PathBuf::from("/src/myrepo")),
        }
    }

    #[test]
    fn run_args_layout() {
        let args = run_args(RuntimeKind::Docker, &spec());
        assert_eq!(&args[..4], &["run", "--name", "berth", "-d"]);
        assert!(!args.contains(&"--rm".to_string()));
        assert!(args.contains(&"/home/u/.berth:/volume".to_string()));
        assert!(args.contains(&"BERTH_CONTAINER=docker".to_string()));
        assert!(args.contains(&"FOO=bar".to_string()));
        assert!(args.contains(&"/src/myrepo:/live/myrepo".to_string()));
        assert!(args.contains(&"6369:6369".to_string()));
        assert!(!args.contains(&DEV_SERVER_PORT.to_string()));
        assert_eq!(args.last().map(String::as_str), Some("ghcr.io/berth-dev/berth:latest"));
    }

    #[test]
    fn dev_mode_adds_dev_port_once_and_fixed_mount() {
        let mut s = spec();
        s.dev_mode = true;
        s.rm = true;
        let args = run_args(RuntimeKind::Apple, &s);
        assert!(args.contains(&"--rm".to_string()));
        assert!(args.contains(&"/src/myrepo:/live/berth".to_string()));
        assert!(args.contains(&"BERTH_CONTAINER=container".to_string()));
        assert_eq!(args.iter().filter(|a| *a == DEV_SERVER_PORT).count(), 1);

        s.ports.push(DEV_SERVER_PORT.into());
        let args = run_args(RuntimeKind::Apple, &s);
        assert_eq!(args.iter().filter(|a| *a == DEV_SERVER_PORT).count(), 1);
    }

    #[test]
    fn apple_table_parsing() {
        let table = "ID      IMAGE                 OS     ARCH   STATE    ADDR\n\
                     berth   berth:latest          linux  arm64  running  192.168.64.2\n\
                     other   other:1               linux  arm64  stopped\n";
        assert!(apple_table_has(table, "berth", true));
        assert!(!apple_table_has(table, "other", true));
        assert!(apple_table_has(table, "other", false));
        assert!(!apple_table_has(table, "ID", false));
    }

    #[test]
    fn apple_inspect_image() {
        let v = serde_json::json!([{ "configuration": { "image": { "reference": "berth:1.0" } } }]);
        assert_eq!(apple_image_reference(&v), Some("berth:1.0".to_string()));
        assert_eq!(apple_image_reference(&serde_json::json!({})), None);
    }

    #[test]
    fn command_error_format() {
        let err = ContainerError::Command {
            message: "failed to run container".into(),
            command: "docker run x".into(),
            output: "boom".into(),
        };
        assert_eq!(
            err.to_string(),
            "failed to run container\nCommand: docker run x\nOutput: boom"
        );
    }

    #[test]
    fn name_conflict_detection() {
        let err = ContainerError::Command {
            message: "failed".into(),
            command: "docker run".into(),
            output: "Conflict. The container name \"/berth\" is already in use".into(),
        };
        assert!(err.is_name_conflict());
        assert!(!ContainerError::NotFound("docker".into()).is_name_conflict());
    }

    #[test]
    fn diagnosis_categories() {
        let err = |output: &str| ContainerError::Command {
            message: "failed to run container".into(),
            command: "docker run berth".into(),
            output: output.into(),
        };

        let port = diagnose_start_error(
            &err("Bind for 0.0.0.0:6369 failed: port is already allocated"),
            RuntimeKind::Docker,
            "berth",
        )
        .unwrap();
        assert!(port.starts_with("Port conflict"));
        assert!(port.contains("Command: docker run berth"));
        assert!(port.ends_with("Output: Bind for 0.0.0.0:6369 failed: port is already allocated"));

        let image = diagnose_start_error(&err("manifest unknown"), RuntimeKind::Apple, "x:1").unwrap();
        assert!(image.contains("container pull x:1"));

        let daemon = diagnose_start_error(
            &err("Cannot connect to the Docker daemon at unix:///var/run/docker.sock"),
            RuntimeKind::Docker,
            "berth",
        )
        .unwrap();
        assert!(daemon.starts_with("Docker is not running"));

        assert!(diagnose_start_error(&err("something odd"), RuntimeKind::Docker, "b").is_none());
    }

    #[test]
    fn runtime_selection_from_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().as_os_str();
        assert!(matches!(
            select_runtime_in("auto", path),
            Err(ContainerError::NotFound(_))
        ));
        assert!(matches!(
            select_runtime_in("native", path),
            Err(ContainerError::Unsupported(_))
        ));

        make_executable(&dir.path().join("docker"));
        assert_eq!(select_runtime_in("auto", path).unwrap(), RuntimeKind::Docker);
        assert!(select_runtime_in("apple", path).is_err());

        make_executable(&dir.path().join("container"));
        assert_eq!(select_runtime_in("auto", path).unwrap(), RuntimeKind::Apple);
        assert_eq!(select_runtime_in("docker", path).unwrap(), RuntimeKind::Docker);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn dropped_exec_kills_its_child() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("finished");
        let script = format!("sleep 0.3; touch {}", marker.display());
        let runtime = CliContainerRuntime::new(RuntimeKind::Docker);
        let spec = CommandSpec::new("sh", ["-c", script.as_str()]);

        let result =
            tokio::time::timeout(Duration::from_millis(50), runtime.exec(&spec, "slow")).await;
        assert!(result.is_err());

        tokio::time::sleep(Duration::from_millis(600)).await;
        assert!(!marker.exists());
    }

    #[cfg(unix)]
    fn make_executable(path: &Path) {
        use std::os::unix::fs::PermissionsExt;
        std::fs::write(path, "#!/bin/sh\n").unwrap();
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).unwrap();
    }

    #[cfg(not(unix))]
    fn make_executable(path: &Path) {
        std::fs::write(path, "").unwrap();
    }
}
