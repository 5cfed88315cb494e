use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{info, warn};

// ---------------------------------------------------------------------------
// ShutdownSignal
// ---------------------------------------------------------------------------

/// Latching shutdown flag shared by every long-running task.
///
/// Once [`trigger`](Self::trigger) has fired it stays set, so a task that
/// starts waiting late still observes it. Suspension points race their work
/// against [`cancelled`](Self::cancelled):
///
/// ```ignore
/// tokio::select! {
///     _ = shutdown.cancelled() => return,
///     line = reader.next_line() => { /* ... */ }
/// }
/// ```
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    flag: Arc<watch::Sender<bool>>,
    drained: Arc<watch::Sender<usize>>,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        let (flag, _) = watch::channel(false);
        let (drained, _) = watch::channel(0);
        Self {
            flag: Arc::new(flag),
            drained: Arc::new(drained),
        }
    }

    /// Cheap non-blocking check.
    pub fn is_shutting_down(&self) -> bool {
        *self.flag.borrow()
    }

    /// Set the flag. Returns `true` only for the call that actually flipped it.
    pub fn trigger(&self) -> bool {
        let flipped = self.flag.send_if_modified(|set| {
            if *set {
                false
            } else {
                *set = true;
                true
            }
        });
        if flipped {
            info!("shutdown signal triggered");
        } else {
            warn!("shutdown already triggered");
        }
        flipped
    }

    /// Resolves once shutdown has been triggered (immediately if it already was).
    pub async fn cancelled(&self) {
        let mut rx = self.flag.subscribe();
        // sender is owned by self; Err is unreachable
        let _ = rx.wait_for(|set| *set).await;
    }

    /// Hand out a guard that counts as drained when dropped.
    pub fn guard(&self) -> ShutdownGuard {
        ShutdownGuard {
            signal: self.clone(),
        }
    }

    pub fn confirm_drained(&self) {
        self.drained.send_modify(|count| *count += 1);
    }

    /// Wait for `expected` drain confirmations or `timeout`, whichever first.
    pub async fn wait_for_drain(&self, expected: usize, timeout: Duration) -> DrainResult {
        let mut rx = self.drained.subscribe();
        let reached = matches!(
            tokio::time::timeout(timeout, rx.wait_for(|count| *count >= expected)).await,
            Ok(Ok(_))
        );
        let confirmed = *self.drained.borrow();
        if reached {
            info!(count = confirmed, "all components drained");
            DrainResult::Complete(confirmed)
        } else {
            warn!(
                confirmed,
                expected, "drain timeout; some components did not confirm"
            );
            DrainResult::Timeout {
                confirmed,
                expected,
            }
        }
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// DrainResult
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DrainResult {
    Complete(usize),
    Timeout { confirmed: usize, expected: usize },
}

impl DrainResult {
    pub fn is_complete(&self) -> bool {
        matches!(self, DrainResult::Complete(_))
    }
}

// ---------------------------------------------------------------------------
// ShutdownGuard
// ---------------------------------------------------------------------------

/// Confirms drain for one component when dropped.
pub struct ShutdownGuard {
    signal: ShutdownSignal,
}

impl ShutdownGuard {
    pub fn signal(&self) -> &ShutdownSignal {
        &self.signal
    }
}

impl Drop for ShutdownGuard {
    fn drop(&mut self) {
        self.signal.confirm_drained();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trigger_latches_once() {
        let signal = ShutdownSignal::new();
        assert!(!signal.is_shutting_down());
        assert!(signal.trigger());
        assert!(!signal.trigger());
        assert!(signal.clone().is_shutting_down());
    }

    #[tokio::test]
    async fn late_waiter_sees_earlier_trigger() {
        let signal = ShutdownSignal::new();
        signal.trigger();
        tokio::time::timeout(Duration::from_millis(100), signal.cancelled())
            .await
            .expect("already-triggered signal resolves immediately");
    }

    #[tokio::test]
    async fn waiter_wakes_on_trigger() {
        let signal = ShutdownSignal::new();
        let waiter = {
            let signal = signal.clone();
            tokio::spawn(async move { signal.cancelled().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        signal.trigger();
        tokio::time::timeout(Duration::from_millis(200), waiter)
            .await
            .expect("waiter woke")
            .unwrap();
    }

    #[tokio::test]
    async fn drain_completes_when_all_guards_drop() {
        let signal = ShutdownSignal::new();
        let first = signal.guard();
        let second = signal.guard();
        signal.trigger();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            drop(first);
        });
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            drop(second);
        });

        let result = signal.wait_for_drain(2, Duration::from_secs(1)).await;
        assert_eq!(result, DrainResult::Complete(2));
    }

    #[tokio::test]
    async fn drain_times_out_with_held_guard() {
        let signal = ShutdownSignal::new();
        let _held = signal.guard();
        let result = signal.wait_for_drain(1, Duration::from_millis(30)).await;
        assert_eq!(
            result,
            DrainResult::Timeout {
                confirmed: 0,
                expected: 1
            }
        );
        assert!(!result.is_complete());
    }
}
