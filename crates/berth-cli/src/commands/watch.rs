use std::time::Duration;

use berth_bridge::subscriber::{ReconnectPolicy, Subscriber, SubscriberConfig};
use berth_core::config::Config;

use super::{render, shutdown_on_ctrl_c};

/// Run the `watch` subcommand: follow an events endpoint, reconnecting as
/// needed, until ctrl-c.
pub async fn run(config: Config, url: Option<String>, json: bool) -> anyhow::Result<()> {
    let url = url.unwrap_or_else(|| config.events.url());
    let subscriber = Subscriber::new(SubscriberConfig {
        url: url.clone(),
        reconnect: ReconnectPolicy::Fixed(Duration::from_secs(config.events.reconnect_secs)),
        liveness_timeout: Duration::from_secs(config.events.liveness_timeout_secs),
    });

    let shutdown = shutdown_on_ctrl_c();
    let (tx, rx) = flume::unbounded();
    let task = tokio::spawn(subscriber.run(tx, shutdown.clone()));
    eprintln!("Watching {url}");

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            msg = rx.recv_async() => {
                let Ok(msg) = msg else { break };
                if json {
                    println!("{}", msg.to_json());
                } else if let Some(line) = render(&msg) {
                    println!("{line}");
                }
            }
        }
    }

    drop(rx);
    let _ = task.await;
    Ok(())
}
