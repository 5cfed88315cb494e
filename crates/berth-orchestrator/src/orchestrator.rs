//! The bootstrap actor.
//!
//! One [`Orchestrator`] owns one session: its [`PhaseMachine`], its
//! [`Session`] and every task it spawns. All work (runtime queries,
//! pull/build streams, container logs, health probes) runs in spawned tasks
//! that report back through the inbox; the actor handles one message at a
//! time and is the only thing that mutates session state.

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use berth_bridge::event_bus::EventBus;
use berth_bridge::protocol::AppEvent;
use berth_core::config::ContainerConfig;
use berth_core::runtime::RuntimeConfig;
use berth_harness::{spawn_guarded, ShutdownSignal};
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, error, info, warn};

use crate::container::{
    diagnose_start_error, CommandSpec, ContainerError, ContainerRuntime, RunSpec,
};
use crate::health::{wait_until_healthy, HealthOutcome, HealthPolicy, PortProbe, TcpProbe};
use crate::image::{is_custom_image, should_replace};
use crate::phase::{Phase, PhaseEvent, PhaseMachine, StateMachineError};
use crate::session::{Failure, Session};
use crate::stream::{spawn_stream, StreamEvent, StreamHandle, DEFAULT_GRACE};

/// Pause between removing a conflicting container and recreating it.
const RECREATE_DELAY: Duration = Duration::from_millis(500);

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Transition(#[from] StateMachineError),
    #[error("orchestrator inbox closed")]
    InboxClosed,
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;

// ---------------------------------------------------------------------------
// Options
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrchestratorOptions {
    pub image: String,
    /// The stock image; anything else counts as custom.
    pub stock_image: String,
    pub dev_image: String,
    pub name: String,
    pub dev_mode: bool,
    pub refresh: bool,
    pub rm: bool,
    pub ports: Vec<String>,
    pub env: Vec<(String, String)>,
    pub volume_dir: PathBuf,
    pub repo_root: Option<PathBuf>,
}

impl OrchestratorOptions {
    pub fn from_config(
        container: &ContainerConfig,
        runtime: &RuntimeConfig,
        repo_root: Option<PathBuf>,
    ) -> Self {
        Self {
            image: container.image.clone(),
            stock_image: ContainerConfig::default().image,
            dev_image: container.dev_image.clone(),
            name: container.name.clone(),
            dev_mode: container.dev_mode,
            refresh: container.refresh,
            rm: container.rm,
            ports: container.ports.clone(),
            env: container
                .env
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            volume_dir: runtime.volume_dir.clone(),
            repo_root,
        }
    }

    pub fn effective_image(&self) -> &str {
        if self.dev_mode {
            &self.dev_image
        } else {
            &self.image
        }
    }

    pub fn run_spec(&self) -> RunSpec {
        RunSpec {
            image: self.effective_image().to_string(),
            name: self.name.clone(),
            ports: self.ports.clone(),
            dev_mode: self.dev_mode,
            rm: self.rm,
            env: self.env.clone(),
            volume_dir: self.volume_dir.clone(),
            repo_root: self.repo_root.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bootstrap {
    AlreadyRunning,
    Pull,
    Build,
    Start,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamSource {
    Pull,
    Build,
    Logs,
}

#[derive(Debug)]
pub enum Message {
    Begin,
    Checked(Bootstrap),
    Output(String),
    StreamExited {
        source: StreamSource,
        result: std::result::Result<(), String>,
    },
    Started(std::result::Result<String, Failure>),
    Health(HealthOutcome),
    /// A one-shot step died without reporting.
    StepLost(String),
    Quit,
    /// The only message still handled after `Quit`.
    Finalize,
}

fn stream_message(source: StreamSource, event: StreamEvent) -> Message {
    match event {
        StreamEvent::Line(line) => Message::Output(line),
        StreamEvent::Exited(result) => Message::StreamExited { source, result },
    }
}

/// Cloneable way to talk to a running orchestrator.
#[derive(Debug, Clone)]
pub struct OrchestratorHandle {
    tx: flume::Sender<Message>,
}

impl OrchestratorHandle {
    pub fn quit(&self) {
        let _ = self.tx.send(Message::Quit);
    }
}

// ---------------------------------------------------------------------------
// Outcome
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Ready { container: String, already_running: bool },
    Failed(Failure),
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct Report {
    pub outcome: Outcome,
    pub session: Session,
    pub history: Vec<(Phase, PhaseEvent, Phase)>,
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

pub struct Orchestrator {
    runtime: Arc<dyn ContainerRuntime>,
    probe: Arc<dyn PortProbe>,
    options: OrchestratorOptions,
    policy: HealthPolicy,
    grace: Duration,
    bus: EventBus,
    shutdown: ShutdownSignal,
    /// Cancels this session's own tasks.
    work: ShutdownSignal,
    machine: PhaseMachine,
    session: Session,
    tx: flume::Sender<Message>,
    rx: flume::Receiver<Message>,
    quitting: bool,
    streams: Vec<StreamHandle>,
    /// Inner step futures, aborted with the session's work.
    steps: Vec<AbortHandle>,
    tasks: Vec<JoinHandle<()>>,
    outcome: Option<Outcome>,
}

impl Orchestrator {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        options: OrchestratorOptions,
        bus: EventBus,
        shutdown: ShutdownSignal,
    ) -> Self {
        let (tx, rx) = flume::unbounded();
        Self {
            runtime,
            probe: Arc::new(TcpProbe::default()),
            options,
            policy: HealthPolicy::default(),
            grace: DEFAULT_GRACE,
            bus,
            shutdown,
            work: ShutdownSignal::new(),
            machine: PhaseMachine::new(),
            session: Session::new(),
            tx,
            rx,
            quitting: false,
            streams: Vec::new(),
            steps: Vec::new(),
            tasks: Vec::new(),
            outcome: None,
        }
    }

    pub fn with_probe(mut self, probe: Arc<dyn PortProbe>) -> Self {
        self.probe = probe;
        self
    }

    pub fn with_health_policy(mut self, policy: HealthPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Time a subprocess gets between SIGTERM and SIGKILL.
    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    pub fn handle(&self) -> OrchestratorHandle {
        OrchestratorHandle {
            tx: self.tx.clone(),
        }
    }

    /// Drive the session to `Ready`, `Failed` or cancellation.
    pub async fn run(mut self) -> Result<Report> {
        info!(
            name = %self.options.name,
            image = %self.options.effective_image(),
            runtime = %self.runtime.kind(),
            dev = self.options.dev_mode,
            "bootstrap starting"
        );
        self.post(Message::Begin);

        let shutdown = self.shutdown.clone();
        let mut shutdown_seen = false;

        let outcome = loop {
            let msg = if shutdown_seen {
                self.rx.recv_async().await
            } else {
                tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => {
                        shutdown_seen = true;
                        Ok(Message::Quit)
                    }
                    msg = self.rx.recv_async() => msg,
                }
            };
            let msg = msg.map_err(|_| OrchestratorError::InboxClosed)?;

            if self.quitting && !matches!(msg, Message::Finalize) {
                debug!(?msg, "ignoring message after quit");
                continue;
            }
            if let Err(e) = self.handle_message(msg) {
                error!(phase = %self.machine.phase(), error = %e, "bootstrap aborted");
                self.teardown().await;
                return Err(e);
            }

            if let Some(outcome) = self.outcome.take() {
                break outcome;
            }
        };

        self.teardown().await;
        info!(phase = %self.machine.phase(), outcome = ?outcome, "bootstrap finished");
        Ok(Report {
            outcome,
            session: self.session,
            history: self.machine.history().to_vec(),
        })
    }

    fn handle_message(&mut self, msg: Message) -> Result<()> {
        match msg {
            Message::Begin => {
                self.advance(PhaseEvent::Begin, "Checking for existing container...")?;
                let runtime = Arc::clone(&self.runtime);
                let options = self.options.clone();
                self.spawn_step("bootstrap check", async move {
                    Message::Checked(decide_bootstrap(runtime.as_ref(), &options).await)
                });
            }
            Message::Checked(decision) => self.on_checked(decision)?,
            Message::Output(line) => self.emit_output(line),
            Message::StreamExited { source, result } => self.on_stream_exited(source, result)?,
            Message::Started(Ok(container)) => {
                self.advance(
                    PhaseEvent::ContainerStarted,
                    "Waiting for container to become healthy...",
                )?;
                self.follow_logs(&container);
                self.spawn_health(container);
            }
            Message::Started(Err(failure)) => self.fail(failure)?,
            Message::Health(HealthOutcome::Healthy) => {
                self.advance(PhaseEvent::Healthy, "Container is ready")?;
                self.ready(false);
            }
            Message::Health(HealthOutcome::Failed(reason)) => {
                self.fail(Failure::container(reason))?;
            }
            Message::Health(HealthOutcome::Cancelled) => {}
            Message::StepLost(step) => {
                self.fail(Failure::command(format!("{step} stopped unexpectedly")))?;
            }
            Message::Quit => {
                info!(phase = %self.machine.phase(), "bootstrap cancelled");
                self.quitting = true;
                self.stop_work();
                self.post(Message::Finalize);
            }
            Message::Finalize => {
                self.outcome = Some(Outcome::Cancelled);
            }
        }
        Ok(())
    }

    fn on_checked(&mut self, decision: Bootstrap) -> Result<()> {
        match decision {
            Bootstrap::AlreadyRunning => {
                self.advance(PhaseEvent::FoundRunning, "Container already running")?;
                self.ready(true);
            }
            Bootstrap::Pull => {
                let image = self.options.effective_image().to_string();
                self.advance(PhaseEvent::NeedPull, format!("Pulling image {image}..."))?;
                let spec = self.runtime.pull_command(&image);
                self.start_stream(StreamSource::Pull, spec)?;
            }
            Bootstrap::Build => match self.options.repo_root.clone() {
                Some(root) => {
                    self.advance(
                        PhaseEvent::NeedBuild,
                        "Building dev image with just build-dev...",
                    )?;
                    let spec = self.runtime.build_command(&root);
                    self.start_stream(StreamSource::Build, spec)?;
                }
                None => {
                    self.fail(Failure::command(
                        "Dev mode needs a git checkout to build the dev image",
                    ))?;
                }
            },
            Bootstrap::Start => {
                self.advance(PhaseEvent::ImageReady, "Starting container...")?;
                self.spawn_start();
            }
        }
        Ok(())
    }

    fn on_stream_exited(
        &mut self,
        source: StreamSource,
        result: std::result::Result<(), String>,
    ) -> Result<()> {
        match (source, result) {
            (StreamSource::Logs, result) => {
                debug!(ok = result.is_ok(), "container log follower ended");
            }
            (_, Ok(())) => {
                self.emit_output("Command completed successfully!".to_string());
                self.advance(PhaseEvent::StreamSucceeded, "Starting container...")?;
                self.spawn_start();
            }
            (_, Err(reason)) => {
                self.fail(Failure::command(format!("Command failed with error: {reason}")))?;
            }
        }
        Ok(())
    }

    // -- transitions -------------------------------------------------------

    fn advance(&mut self, event: PhaseEvent, status_text: impl Into<String>) -> Result<Phase> {
        let phase = self.machine.transition(event)?;
        let status_text = status_text.into();
        info!(phase = %phase, status = %status_text, "bootstrap phase");
        self.bus.publish(AppEvent::phase(phase.as_str(), status_text.clone()));
        self.session.set_phase(phase, status_text);
        Ok(phase)
    }

    fn emit_output(&mut self, line: String) {
        self.session.push_output(line.clone());
        self.bus.publish(AppEvent::output(line));
    }

    fn ready(&mut self, already_running: bool) {
        self.session.complete();
        self.bus.publish(AppEvent::container_status("running", None));
        self.outcome = Some(Outcome::Ready {
            container: self.options.name.clone(),
            already_running,
        });
    }

    fn fail(&mut self, failure: Failure) -> Result<()> {
        let text = failure.display_text();
        error!(kind = ?failure.kind, error = %failure.message, "bootstrap failed");
        self.advance(PhaseEvent::Fail, text.clone())?;
        self.bus.publish(AppEvent::container_status("error", Some(text)));
        self.session.fail(failure.clone());
        self.stop_work();
        self.outcome = Some(Outcome::Failed(failure));
        Ok(())
    }

    // -- spawned work ------------------------------------------------------

    fn post(&self, msg: Message) {
        // the actor holds a receiver, so this cannot fail
        let _ = self.tx.send(msg);
    }

    /// Run a one-shot step whose result comes back as a message. A panicking
    /// step still reports, as `StepLost`. Once the session's work is stopped
    /// the step future is dropped where it stands and reports nothing.
    fn spawn_step<F>(&mut self, name: &'static str, fut: F)
    where
        F: Future<Output = Message> + Send + 'static,
    {
        let tx = self.tx.clone();
        let work = self.work.clone();
        let guarded = spawn_guarded(name, async move {
            tokio::select! {
                biased;
                _ = work.cancelled() => None,
                msg = fut => Some(msg),
            }
        });
        self.steps.push(guarded.abort_handle());
        self.tasks.push(tokio::spawn(async move {
            let msg = match guarded.await {
                Ok(Some(Some(msg))) => msg,
                Ok(Some(None)) => {
                    debug!(step = name, "step cancelled");
                    return;
                }
                Ok(None) => Message::StepLost(name.to_string()),
                // aborted during teardown
                Err(_) => return,
            };
            let _ = tx.send(msg);
        }));
    }

    fn start_stream(&mut self, source: StreamSource, spec: CommandSpec) -> Result<()> {
        self.emit_output(format!("$ {spec}"));
        match spawn_stream(
            &spec,
            self.tx.clone(),
            move |event| stream_message(source, event),
            self.work.clone(),
            self.grace,
        ) {
            Ok(handle) => {
                self.streams.push(handle);
                Ok(())
            }
            Err(e) => self.fail(Failure::command(format!("Command failed with error: {e}"))),
        }
    }

    fn spawn_start(&mut self) {
        let runtime = Arc::clone(&self.runtime);
        let options = self.options.clone();
        self.spawn_step("container start", async move {
            Message::Started(start_container(runtime.as_ref(), &options).await)
        });
    }

    fn follow_logs(&mut self, container: &str) {
        let spec = self.runtime.logs_command(container);
        match spawn_stream(
            &spec,
            self.tx.clone(),
            |event| stream_message(StreamSource::Logs, event),
            self.work.clone(),
            self.grace,
        ) {
            Ok(handle) => self.streams.push(handle),
            Err(e) => warn!(error = %e, "could not follow container logs"),
        }
    }

    fn spawn_health(&mut self, container: String) {
        let runtime = Arc::clone(&self.runtime);
        let probe = Arc::clone(&self.probe);
        let policy = self.policy.clone();
        let work = self.work.clone();
        let out = self.tx.clone();
        self.spawn_step("health check", async move {
            let outcome = wait_until_healthy(
                runtime.as_ref(),
                probe.as_ref(),
                &container,
                &policy,
                &work,
                move |line| {
                    let _ = out.send(Message::Output(line));
                },
            )
            .await;
            Message::Health(outcome)
        });
    }

    fn stop_work(&mut self) {
        if !self.work.is_shutting_down() {
            self.work.trigger();
        }
        for step in &self.steps {
            step.abort();
        }
        for stream in &self.streams {
            stream.stop();
        }
    }

    async fn teardown(&mut self) {
        self.stop_work();
        self.steps.clear();
        for task in self.tasks.drain(..) {
            task.abort();
        }
        for stream in self.streams.drain(..) {
            stream.join().await;
        }
    }
}

// ---------------------------------------------------------------------------
// Steps
// ---------------------------------------------------------------------------

/// What the session has to do before the container can start.
pub async fn decide_bootstrap(
    runtime: &dyn ContainerRuntime,
    options: &OrchestratorOptions,
) -> Bootstrap {
    if runtime.is_running(&options.name).await {
        return Bootstrap::AlreadyRunning;
    }
    if options.dev_mode {
        if options.refresh || !runtime.image_exists(&options.dev_image).await {
            return Bootstrap::Build;
        }
    } else if options.refresh || !runtime.image_exists(&options.image).await {
        return Bootstrap::Pull;
    }
    Bootstrap::Start
}

/// Reuse or recreate the container, then run it. Returns the container name.
pub async fn start_container(
    runtime: &dyn ContainerRuntime,
    options: &OrchestratorOptions,
) -> std::result::Result<String, Failure> {
    let name = options.name.as_str();
    let image = options.effective_image();

    if runtime.is_running(name).await {
        return Ok(name.to_string());
    }

    if runtime.exists(name).await {
        let replace = options.rm
            || is_custom_image(image, &options.stock_image, options.dev_mode)
            || match runtime.container_image(name).await {
                Some(existing) => should_replace(image, &existing, options.dev_mode),
                None => false,
            };

        if replace {
            info!(container = name, "removing stopped container before recreating it");
            if let Err(e) = runtime.remove(name).await {
                warn!(container = name, error = %e, "failed to remove stopped container");
            }
        } else {
            match runtime.start(name).await {
                Ok(()) => {
                    info!(container = name, "restarted existing container");
                    return Ok(name.to_string());
                }
                Err(e) => {
                    warn!(container = name, error = %e, "restart failed; recreating");
                    clear_container(runtime, name).await;
                }
            }
        }
    }

    let spec = options.run_spec();
    match runtime.run(&spec).await {
        Ok(_) => Ok(name.to_string()),
        Err(e) if e.is_name_conflict() => recover_name_conflict(runtime, &spec, e).await,
        Err(e) => Err(start_failure(runtime, image, &e)),
    }
}

async fn recover_name_conflict(
    runtime: &dyn ContainerRuntime,
    spec: &RunSpec,
    first: ContainerError,
) -> std::result::Result<String, Failure> {
    let name = spec.name.as_str();
    warn!(container = name, error = %first, "container name in use; trying to reuse it");
    if runtime.is_running(name).await || runtime.start(name).await.is_ok() {
        return Ok(name.to_string());
    }

    clear_container(runtime, name).await;
    tokio::time::sleep(RECREATE_DELAY).await;

    match runtime.run(spec).await {
        Ok(_) => Ok(name.to_string()),
        Err(e) => Err(start_failure(runtime, &spec.image, &e)),
    }
}

/// Stop and remove `name`, logging anything the runtime refuses.
async fn clear_container(runtime: &dyn ContainerRuntime, name: &str) {
    if let Err(e) = runtime.stop(name).await {
        warn!(container = name, error = %e, "failed to stop container");
    }
    if let Err(e) = runtime.remove(name).await {
        warn!(container = name, error = %e, "failed to remove container");
    }
}

fn start_failure(runtime: &dyn ContainerRuntime, image: &str, err: &ContainerError) -> Failure {
    let message =
        diagnose_start_error(err, runtime.kind(), image).unwrap_or_else(|| err.to_string());
    Failure::container(message)
}
