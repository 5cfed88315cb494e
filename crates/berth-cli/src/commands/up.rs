use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use berth_bridge::event_bus::EventBus;
use berth_bridge::protocol::SseMessage;
use berth_core::config::{Config, ContainerConfig};
use berth_core::conflict::ConflictCache;
use berth_core::runtime::{find_git_root, RuntimeConfig};
use berth_orchestrator::container::{select_runtime, CliContainerRuntime, ContainerRuntime};
use berth_orchestrator::health::HealthPolicy;
use berth_orchestrator::monitor::Monitor;
use berth_orchestrator::orchestrator::{Orchestrator, OrchestratorOptions, Outcome};
use tracing::info;

use super::{render, shutdown_on_ctrl_c, start_events, Components, DRAIN_TIMEOUT};

/// Command-line values layered over the `[container]` config section.
#[derive(Debug, Clone, Default)]
pub struct UpOverrides {
    pub image: Option<String>,
    pub name: Option<String>,
    pub dev: bool,
    pub refresh: bool,
    pub rm: bool,
    pub ports: Vec<String>,
}

impl UpOverrides {
    pub fn apply(&self, container: &mut ContainerConfig) {
        if let Some(image) = &self.image {
            container.image = image.clone();
        }
        if let Some(name) = &self.name {
            container.name = name.clone();
        }
        container.dev_mode |= self.dev;
        container.refresh |= self.refresh;
        container.rm |= self.rm;
        if !self.ports.is_empty() {
            container.ports = self.ports.clone();
        }
    }
}

/// Run the `up` subcommand: bootstrap to a terminal phase, then monitor the
/// container until ctrl-c. Fails when the bootstrap fails.
pub async fn run(mut config: Config, overrides: UpOverrides) -> anyhow::Result<()> {
    overrides.apply(&mut config.container);
    config.validate().context("invalid configuration")?;

    let runtime_config = RuntimeConfig::detect();
    let kind = select_runtime(&config.container.runtime)
        .context("no usable container runtime found")?;
    let runtime: Arc<dyn ContainerRuntime> = Arc::new(CliContainerRuntime::new(kind));
    let cwd = std::env::current_dir().context("failed to read the working directory")?;
    let options = OrchestratorOptions::from_config(
        &config.container,
        &runtime_config,
        find_git_root(&cwd),
    );

    let shutdown = shutdown_on_ctrl_c();
    let bus = EventBus::with_client_buffer(config.events.client_buffer);
    let mut components = Components::new(shutdown.clone());
    start_events(&config.events, &bus, &mut components).await?;

    let subscription = bus.subscribe();
    let printer_id = subscription.id;
    let printer = tokio::spawn(print_events(subscription.rx));

    let report = match Orchestrator::new(runtime.clone(), options, bus.clone(), shutdown.clone())
        .with_health_policy(HealthPolicy::from_config(&config.health))
        .run()
        .await
    {
        Ok(report) => report,
        Err(e) => {
            components.drain(DRAIN_TIMEOUT).await;
            return Err(e).context("bootstrap aborted");
        }
    };

    let result = match report.outcome {
        Outcome::Ready {
            container,
            already_running,
        } => {
            if already_running {
                println!("Container {container} is already running");
            } else {
                println!("Container {container} is ready");
            }
            let conflicts = ConflictCache::with_config(config.cache.to_cache_config());
            let monitor = Monitor::new(runtime, container, bus.clone(), conflicts.clone())
                .with_interval(Duration::from_secs(config.monitor.interval_secs))
                .watch_current_repo(&runtime_config);
            components.spawn("monitor", monitor.run(shutdown.clone()));
            shutdown.cancelled().await;
            Ok(Some(conflicts))
        }
        Outcome::Failed(failure) => Err(anyhow::anyhow!(failure.display_text())),
        Outcome::Cancelled => {
            info!("bootstrap cancelled");
            Ok(None)
        }
    };

    components.drain(DRAIN_TIMEOUT).await;
    bus.unsubscribe(printer_id);
    let _ = printer.await;
    if let Ok(Some(conflicts)) = &result {
        conflicts.close();
    }
    result.map(|_| ())
}

async fn print_events(rx: flume::Receiver<Arc<SseMessage>>) {
    while let Ok(msg) = rx.recv_async().await {
        if let Some(line) = render(&msg) {
            println!("{line}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_overrides_keep_config() {
        let mut container = ContainerConfig::default();
        UpOverrides::default().apply(&mut container);
        assert_eq!(container.image, ContainerConfig::default().image);
        assert_eq!(container.ports, vec!["6369:6369".to_string()]);
        assert!(!container.dev_mode);
    }

    #[test]
    fn overrides_replace_and_enable() {
        let mut container = ContainerConfig {
            refresh: true,
            ..ContainerConfig::default()
        };
        UpOverrides {
            image: Some("ghcr.io/acme/agent:v2.0.0".into()),
            name: Some("agent".into()),
            dev: true,
            ports: vec!["8080:8080".into(), "9000:9000".into()],
            ..UpOverrides::default()
        }
        .apply(&mut container);

        assert_eq!(container.image, "ghcr.io/acme/agent:v2.0.0");
        assert_eq!(container.name, "agent");
        assert!(container.dev_mode);
        // flags only switch things on
        assert!(container.refresh);
        assert!(!container.rm);
        assert_eq!(container.ports, vec!["8080:8080", "9000:9000"]);
    }
}
