pub mod runtime;
pub mod serve;
pub mod up;
pub mod watch;

use std::future::Future;
use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use berth_bridge::event_bus::EventBus;
use berth_bridge::protocol::{
    CacheInvalidatedPayload, ContainerStatusPayload, EventType, NotificationPayload,
    OutputPayload, PhasePayload, PortPayload, ProcessPayload, ProcessStoppedPayload, SseMessage,
};
use berth_bridge::server;
use berth_core::config::{Config, EventsConfig};
use berth_harness::{DrainResult, ShutdownSignal};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// How long background components get to wind down once shutdown fires.
pub const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Load and validate `path`, or `~/.berth/config.toml` when none is given.
pub fn load_config(path: Option<&Path>) -> anyhow::Result<Config> {
    let config = match path {
        Some(path) => Config::load_from(path)
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        None => Config::load().with_context(|| {
            format!("failed to load config from {}", Config::default_path().display())
        })?,
    };
    config.validate().context("invalid configuration")?;
    Ok(config)
}

/// A shutdown signal that fires on ctrl-c.
pub fn shutdown_on_ctrl_c() -> ShutdownSignal {
    let shutdown = ShutdownSignal::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for ctrl-c");
            return;
        }
        info!("ctrl-c received, shutting down");
        signal.trigger();
    });
    shutdown
}

/// Background tasks of one command, each holding a drain guard on the
/// command's shutdown signal.
pub struct Components {
    shutdown: ShutdownSignal,
    tasks: Vec<JoinHandle<()>>,
}

impl Components {
    pub fn new(shutdown: ShutdownSignal) -> Self {
        Self {
            shutdown,
            tasks: Vec::new(),
        }
    }

    pub fn shutdown(&self) -> &ShutdownSignal {
        &self.shutdown
    }

    /// Spawn `fut`; it counts as drained once it returns or is aborted.
    pub fn spawn<F>(&mut self, name: &'static str, fut: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let guard = self.shutdown.guard();
        self.tasks.push(tokio::spawn(async move {
            let _guard = guard;
            fut.await;
            debug!(component = name, "component stopped");
        }));
    }

    /// Fire shutdown and wait up to `timeout` for every component to drain.
    /// Components still running after that are aborted.
    pub async fn drain(self, timeout: Duration) -> DrainResult {
        if !self.shutdown.is_shutting_down() {
            self.shutdown.trigger();
        }
        let result = self.shutdown.wait_for_drain(self.tasks.len(), timeout).await;
        if !result.is_complete() {
            for task in &self.tasks {
                task.abort();
            }
        }
        result
    }
}

/// Bind the events endpoint and start serving it, plus the bus heartbeat.
pub async fn start_events(
    config: &EventsConfig,
    bus: &EventBus,
    components: &mut Components,
) -> anyhow::Result<()> {
    let addr = config.bind_addr();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind events server on {addr}"))?;

    let server_bus = bus.clone();
    let shutdown = components.shutdown().clone();
    components.spawn("events server", async move {
        if let Err(e) = server::serve(listener, server_bus, shutdown).await {
            error!(error = %e, "events server failed");
        }
    });

    let heartbeat = bus.spawn_heartbeat(
        Duration::from_secs(config.heartbeat_secs),
        components.shutdown().clone(),
    );
    components.spawn("heartbeat", async move {
        if let Err(e) = heartbeat.await {
            warn!(error = %e, "heartbeat task ended abnormally");
        }
    });

    println!("Events: {}", config.url());
    Ok(())
}

/// One human-readable line for `msg`, or `None` for events not worth showing.
pub fn render(msg: &SseMessage) -> Option<String> {
    let event = &msg.event;
    match event.event_type {
        EventType::Heartbeat => None,
        EventType::OrchestrationOutput => event
            .payload_as::<OutputPayload>()
            .ok()
            .map(|p| p.line),
        EventType::OrchestrationPhase => event
            .payload_as::<PhasePayload>()
            .ok()
            .map(|p| format!("==> {}", p.status_text)),
        EventType::ContainerStatus => event
            .payload_as::<ContainerStatusPayload>()
            .ok()
            .map(|p| match p.message {
                Some(message) => format!("[container] {}: {message}", p.status),
                None => format!("[container] {}", p.status),
            }),
        EventType::CacheInvalidated => event
            .payload_as::<CacheInvalidatedPayload>()
            .ok()
            .map(|p| format!("[cache] {} invalidated: {}", p.worktree_id, p.reason)),
        EventType::PortOpened | EventType::PortClosed | EventType::PortMapped => event
            .payload_as::<PortPayload>()
            .ok()
            .map(|p| {
                let label = p.title.or(p.service);
                match label {
                    Some(label) => format!("[{}] {} ({label})", event.event_type.as_str(), p.port),
                    None => format!("[{}] {}", event.event_type.as_str(), p.port),
                }
            }),
        EventType::ProcessStarted => event
            .payload_as::<ProcessPayload>()
            .ok()
            .map(|p| format!("[process] {} started: {}", p.pid, p.command)),
        EventType::ProcessStopped => event
            .payload_as::<ProcessStoppedPayload>()
            .ok()
            .map(|p| format!("[process] {} exited with {}", p.pid, p.exit_code)),
        EventType::NotificationShow => event
            .payload_as::<NotificationPayload>()
            .ok()
            .map(|p| format!("[notification] {}: {}", p.title, p.body)),
        other => Some(format!("[{}] {}", other.as_str(), event.payload)),
    }
}
