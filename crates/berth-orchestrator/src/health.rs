//! Startup health checking.
//!
//! The container must stay running, and once the warm-up has passed its
//! service port must accept TCP connections. A stopped container only fails
//! the check after `failure_threshold` consecutive observations, so a single
//! flaky `ps` does not abort a bootstrap. A port that never opens is bounded
//! by `max_wait`.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use berth_core::config::HealthConfig;
use berth_harness::ShutdownSignal;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::container::ContainerRuntime;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthPolicy {
    pub interval: Duration,
    pub warmup: Duration,
    pub max_wait: Duration,
    pub failure_threshold: u32,
    pub confirm_delay: Duration,
    pub host: String,
    pub port: u16,
    /// Hard ceiling for the whole check, including hung runtime calls.
    pub overall_timeout: Duration,
}

impl HealthPolicy {
    pub fn from_config(config: &HealthConfig) -> Self {
        let max_wait = Duration::from_secs(config.max_wait_secs);
        Self {
            interval: Duration::from_millis(config.interval_ms),
            warmup: Duration::from_millis(config.warmup_ms),
            max_wait,
            failure_threshold: config.failure_threshold,
            confirm_delay: Duration::from_millis(config.confirm_delay_ms),
            host: "127.0.0.1".to_string(),
            port: config.port,
            overall_timeout: (max_wait * 2).max(Duration::from_secs(60)),
        }
    }
}

impl Default for HealthPolicy {
    fn default() -> Self {
        Self::from_config(&HealthConfig::default())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthOutcome {
    Healthy,
    Failed(String),
    Cancelled,
}

// ---------------------------------------------------------------------------
// PortProbe
// ---------------------------------------------------------------------------

#[async_trait]
pub trait PortProbe: Send + Sync {
    async fn is_open(&self, host: &str, port: u16) -> bool;
}

/// Plain TCP connect.
#[derive(Debug, Clone, Copy)]
pub struct TcpProbe {
    pub connect_timeout: Duration,
}

impl Default for TcpProbe {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(1),
        }
    }
}

#[async_trait]
impl PortProbe for TcpProbe {
    async fn is_open(&self, host: &str, port: u16) -> bool {
        matches!(
            tokio::time::timeout(
                self.connect_timeout,
                tokio::net::TcpStream::connect((host, port))
            )
            .await,
            Ok(Ok(_))
        )
    }
}

// ---------------------------------------------------------------------------
// Check loop
// ---------------------------------------------------------------------------

/// Poll until the container is healthy, has failed, or `shutdown` fires.
/// User-facing progress lines go to `progress`.
pub async fn wait_until_healthy<P>(
    runtime: &dyn ContainerRuntime,
    probe: &dyn PortProbe,
    name: &str,
    policy: &HealthPolicy,
    shutdown: &ShutdownSignal,
    mut progress: P,
) -> HealthOutcome
where
    P: FnMut(String) + Send,
{
    let checks = poll(runtime, probe, name, policy, shutdown, &mut progress);
    let result = tokio::time::timeout(policy.overall_timeout, checks).await;
    match result {
        Ok(outcome) => outcome,
        Err(_) => {
            let reason = format!(
                "Health check did not finish within {}s",
                policy.overall_timeout.as_secs()
            );
            warn!(container = name, "health check exceeded its overall timeout");
            progress(reason.clone());
            HealthOutcome::Failed(startup_failure(&reason))
        }
    }
}

async fn poll<P>(
    runtime: &dyn ContainerRuntime,
    probe: &dyn PortProbe,
    name: &str,
    policy: &HealthPolicy,
    shutdown: &ShutdownSignal,
    progress: &mut P,
) -> HealthOutcome
where
    P: FnMut(String) + Send,
{
    let started = Instant::now();
    let mut ticker = tokio::time::interval(policy.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut misses = 0u32;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return HealthOutcome::Cancelled,
            _ = ticker.tick() => {}
        }
        let elapsed = started.elapsed();

        if runtime.is_running(name).await {
            misses = 0;
            if elapsed >= policy.warmup && probe.is_open(&policy.host, policy.port).await {
                info!(container = name, port = policy.port, "container healthy");
                progress(format!(
                    "Container is healthy and port {} is accessible",
                    policy.port
                ));
                tokio::select! {
                    _ = shutdown.cancelled() => return HealthOutcome::Cancelled,
                    _ = tokio::time::sleep(policy.confirm_delay) => {}
                }
                return HealthOutcome::Healthy;
            }
        } else {
            misses += 1;
            debug!(container = name, misses, "container not running");
            if misses >= policy.failure_threshold {
                let reason = format!("Container {name} stopped unexpectedly");
                progress(reason.clone());
                return HealthOutcome::Failed(startup_failure(&reason));
            }
        }

        if elapsed >= policy.max_wait {
            let reason = format!(
                "Container health check timed out after {}s",
                policy.max_wait.as_secs()
            );
            progress(reason.clone());
            return HealthOutcome::Failed(startup_failure(&reason));
        }
    }
}

fn startup_failure(reason: &str) -> String {
    format!("Container failed during startup: {reason}. Check the logs above for details.")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn policy_from_defaults() {
        let policy = HealthPolicy::default();
        assert_eq!(policy.interval, Duration::from_millis(500));
        assert_eq!(policy.warmup, Duration::from_secs(2));
        assert_eq!(policy.max_wait, Duration::from_secs(30));
        assert_eq!(policy.confirm_delay, Duration::from_millis(500));
        assert_eq!(policy.port, 6369);
        assert_eq!(policy.overall_timeout, Duration::from_secs(60));
    }

    #[tokio::test]
    async fn tcp_probe_sees_listener() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let probe = TcpProbe::default();
        assert!(probe.is_open("127.0.0.1", port).await);
        drop(listener);
        assert!(!probe.is_open("127.0.0.1", port).await);
    }
}
