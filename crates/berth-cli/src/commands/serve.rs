use berth_bridge::event_bus::EventBus;
use berth_core::config::Config;
use tracing::info;

use super::{shutdown_on_ctrl_c, start_events, Components, DRAIN_TIMEOUT};

/// Run the `serve` subcommand: serve the event stream until ctrl-c.
pub async fn run(config: Config) -> anyhow::Result<()> {
    let shutdown = shutdown_on_ctrl_c();
    let bus = EventBus::with_client_buffer(config.events.client_buffer);
    let mut components = Components::new(shutdown.clone());
    start_events(&config.events, &bus, &mut components).await?;

    shutdown.cancelled().await;
    let drained = components.drain(DRAIN_TIMEOUT).await;
    info!(
        clients = bus.subscriber_count(),
        clean = drained.is_complete(),
        "events server stopped"
    );
    Ok(())
}
