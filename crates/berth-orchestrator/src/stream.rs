//! Streaming subprocess readers.
//!
//! A reader owns its child process and its read loop. Each stdout/stderr line
//! and the final exit status are pushed into the owner's inbox as messages;
//! the reader never touches orchestrator state.

use std::process::Stdio;
use std::time::Duration;

use berth_harness::{spawn_guarded, ShutdownSignal};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Child;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::container::{CommandSpec, ContainerError};

/// How long a child gets between SIGTERM and SIGKILL.
pub const DEFAULT_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    Line(String),
    /// The process finished. `Err` carries a human-readable reason.
    Exited(Result<(), String>),
}

/// Handle to a running reader. Dropping it does not stop the child; call
/// [`StreamHandle::stop`].
#[derive(Debug)]
pub struct StreamHandle {
    stop: ShutdownSignal,
    task: JoinHandle<Option<()>>,
}

impl StreamHandle {
    /// Ask the reader to terminate its child. No further events are emitted.
    pub fn stop(&self) {
        self.stop.trigger();
    }

    /// Wait for the reader task to exit.
    pub async fn join(self) {
        let _ = self.task.await;
    }
}

/// Spawn `spec` and forward its output into `outbox` through `wrap`.
///
/// Lines from stdout and stderr are interleaved in arrival order; each stream
/// keeps its own order. Once either `shutdown` or the handle's own stop
/// fires, the child is terminated and nothing more is sent.
pub fn spawn_stream<M, F>(
    spec: &CommandSpec,
    outbox: flume::Sender<M>,
    wrap: F,
    shutdown: ShutdownSignal,
    grace: Duration,
) -> Result<StreamHandle, ContainerError>
where
    M: Send + 'static,
    F: Fn(StreamEvent) -> M + Send + 'static,
{
    let command = spec.to_string();
    let mut child = spec
        .to_command()
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|source| ContainerError::Spawn {
            command: command.clone(),
            source,
        })?;
    debug!(command = %command, pid = ?child.id(), "stream started");

    let stop = ShutdownSignal::new();
    let local_stop = stop.clone();
    let task_command = command.clone();

    let task = spawn_guarded(format!("stream: {command}"), async move {
        let mut stdout = child.stdout.take().map(|s| BufReader::new(s).lines());
        let mut stderr = child.stderr.take().map(|s| BufReader::new(s).lines());

        loop {
            if stdout.is_none() && stderr.is_none() {
                break;
            }
            let line = tokio::select! {
                _ = shutdown.cancelled() => {
                    terminate(&mut child, grace).await;
                    return;
                }
                _ = local_stop.cancelled() => {
                    terminate(&mut child, grace).await;
                    return;
                }
                line = next_line(&mut stdout) => line,
                line = next_line(&mut stderr) => line,
            };
            if let Some(line) = line {
                let line = line.trim_end_matches('\r');
                if line.is_empty() {
                    continue;
                }
                if outbox.send(wrap(StreamEvent::Line(line.to_string()))).is_err() {
                    // owner is gone
                    terminate(&mut child, grace).await;
                    return;
                }
            }
        }

        let status = tokio::select! {
            _ = shutdown.cancelled() => {
                terminate(&mut child, grace).await;
                return;
            }
            _ = local_stop.cancelled() => {
                terminate(&mut child, grace).await;
                return;
            }
            status = child.wait() => status,
        };

        let result = match status {
            Ok(status) if status.success() => Ok(()),
            Ok(status) => Err(format!("{task_command} exited with {status}")),
            Err(e) => Err(format!("failed waiting for {task_command}: {e}")),
        };
        debug!(command = %task_command, ok = result.is_ok(), "stream finished");
        let _ = outbox.send(wrap(StreamEvent::Exited(result)));
    });

    Ok(StreamHandle { stop, task })
}

/// Next line from an optional reader. A closed or failed reader is cleared
/// and yields `None`; a cleared reader never resolves.
async fn next_line<R>(reader: &mut Option<tokio::io::Lines<R>>) -> Option<String>
where
    R: tokio::io::AsyncBufRead + Unpin,
{
    let Some(lines) = reader.as_mut() else {
        return std::future::pending().await;
    };
    match lines.next_line().await {
        Ok(Some(line)) => Some(line),
        Ok(None) => {
            *reader = None;
            None
        }
        Err(e) => {
            warn!(error = %e, "stream read failed");
            *reader = None;
            None
        }
    }
}

/// SIGTERM, then SIGKILL once `grace` has elapsed.
pub async fn terminate(child: &mut Child, grace: Duration) {
    if let Some(pid) = child.id() {
        send_sigterm(pid);
        if tokio::time::timeout(grace, child.wait()).await.is_ok() {
            debug!(pid, "child exited after SIGTERM");
            return;
        }
        warn!(pid, grace_ms = grace.as_millis() as u64, "child ignored SIGTERM; killing");
    }
    let _ = child.kill().await;
}

#[cfg(unix)]
fn send_sigterm(pid: u32) {
    // SAFETY: kill(2) with a pid we spawned and still own.
    unsafe {
        libc::kill(pid as libc::pid_t, libc::SIGTERM);
    }
}

#[cfg(not(unix))]
fn send_sigterm(_pid: u32) {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn sh(script: &str) -> CommandSpec {
        CommandSpec::new("sh", ["-c", script])
    }

    async fn collect(rx: flume::Receiver<StreamEvent>) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.recv_async().await {
            let done = matches!(event, StreamEvent::Exited(_));
            events.push(event);
            if done {
                break;
            }
        }
        events
    }

    #[tokio::test]
    async fn lines_then_success() {
        let (tx, rx) = flume::unbounded();
        let handle = spawn_stream(
            &sh("echo one; echo two; echo three"),
            tx,
            |e| e,
            ShutdownSignal::new(),
            DEFAULT_GRACE,
        )
        .unwrap();

        let events = collect(rx).await;
        assert_eq!(
            events,
            vec![
                StreamEvent::Line("one".into()),
                StreamEvent::Line("two".into()),
                StreamEvent::Line("three".into()),
                StreamEvent::Exited(Ok(())),
            ]
        );
        handle.join().await;
    }

    #[tokio::test]
    async fn stderr_is_forwarded_and_failure_reported() {
        let (tx, rx) = flume::unbounded();
        let _handle = spawn_stream(
            &sh("echo oops >&2; exit 3"),
            tx,
            |e| e,
            ShutdownSignal::new(),
            DEFAULT_GRACE,
        )
        .unwrap();

        let events = collect(rx).await;
        assert_eq!(events[0], StreamEvent::Line("oops".into()));
        match &events[1] {
            StreamEvent::Exited(Err(reason)) => assert!(reason.contains("exit")),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn spawn_failure_is_an_error() {
        let (tx, _rx) = flume::unbounded::<StreamEvent>();
        let err = spawn_stream(
            &CommandSpec::new("/nonexistent/berth-binary", Vec::<String>::new()),
            tx,
            |e| e,
            ShutdownSignal::new(),
            DEFAULT_GRACE,
        )
        .unwrap_err();
        assert!(matches!(err, ContainerError::Spawn { .. }));
    }

    #[tokio::test]
    async fn stop_terminates_without_exit_event() {
        let (tx, rx) = flume::unbounded();
        let handle = spawn_stream(
            &sh("echo started; sleep 30"),
            tx,
            |e| e,
            ShutdownSignal::new(),
            Duration::from_millis(200),
        )
        .unwrap();

        assert_eq!(rx.recv_async().await.unwrap(), StreamEvent::Line("started".into()));
        let began = Instant::now();
        handle.stop();
        handle.join().await;
        assert!(began.elapsed() < Duration::from_secs(5));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn shutdown_escalates_to_kill() {
        let (tx, rx) = flume::unbounded();
        let shutdown = ShutdownSignal::new();
        let handle = spawn_stream(
            &sh("trap '' TERM; echo ready; sleep 30"),
            tx,
            |e| e,
            shutdown.clone(),
            Duration::from_millis(200),
        )
        .unwrap();

        assert_eq!(rx.recv_async().await.unwrap(), StreamEvent::Line("ready".into()));
        let began = Instant::now();
        shutdown.trigger();
        handle.join().await;
        assert!(began.elapsed() < Duration::from_secs(5));
    }
}
