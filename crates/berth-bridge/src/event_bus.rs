use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use berth_harness::{spawn_guarded, ShutdownSignal};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::protocol::{AppEvent, EventType, SseMessage};

pub const DEFAULT_CLIENT_BUFFER: usize = 100;

struct Client {
    id: Uuid,
    tx: flume::Sender<Arc<SseMessage>>,
}

struct Inner {
    clients: Mutex<Vec<Client>>,
    last_status: Mutex<Option<AppEvent>>,
    started: Instant,
    client_buffer: usize,
}

/// A broadcast-style event bus built on flume channels.
///
/// Every subscriber gets its own bounded queue. A subscriber that falls behind
/// loses messages (with a warning) instead of stalling the publisher or the
/// other subscribers; a subscriber whose receiver is gone is pruned on the
/// next publish. Cloning is cheap.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<Inner>,
}

/// Receiving side handed to each subscriber.
pub struct Subscription {
    pub id: Uuid,
    pub rx: flume::Receiver<Arc<SseMessage>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_client_buffer(DEFAULT_CLIENT_BUFFER)
    }

    pub fn with_client_buffer(client_buffer: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                clients: Mutex::new(Vec::new()),
                last_status: Mutex::new(None),
                started: Instant::now(),
                client_buffer: client_buffer.max(1),
            }),
        }
    }

    fn clients(&self) -> MutexGuard<'_, Vec<Client>> {
        self.inner
            .clients
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register a subscriber; it sees every message published from now on.
    pub fn subscribe(&self) -> Subscription {
        let (tx, rx) = flume::bounded(self.inner.client_buffer);
        let id = Uuid::new_v4();
        self.clients().push(Client { id, tx });
        debug!(client = %id, "event bus subscriber added");
        Subscription { id, rx }
    }

    pub fn unsubscribe(&self, id: Uuid) {
        self.clients().retain(|client| client.id != id);
    }

    /// Stamp `event` with an id and timestamp and fan it out. Returns the
    /// number of subscribers that accepted it.
    pub fn publish(&self, event: AppEvent) -> usize {
        self.publish_message(SseMessage::new(event))
    }

    pub fn publish_message(&self, msg: SseMessage) -> usize {
        if msg.event.event_type == EventType::ContainerStatus {
            *self
                .inner
                .last_status
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(msg.event.clone());
        }
        let msg = Arc::new(msg);
        let mut delivered = 0;
        self.clients().retain(|client| match client.tx.try_send(msg.clone()) {
            Ok(()) => {
                delivered += 1;
                true
            }
            Err(flume::TrySendError::Full(_)) => {
                warn!(
                    client = %client.id,
                    event = %msg.event.event_type,
                    "subscriber buffer full; dropping message"
                );
                true
            }
            Err(flume::TrySendError::Disconnected(_)) => {
                debug!(client = %client.id, "pruning disconnected subscriber");
                false
            }
        });
        delivered
    }

    /// Latest `container:status` published, or `running` when none was.
    pub fn current_status(&self) -> AppEvent {
        self.inner
            .last_status
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
            .unwrap_or_else(|| AppEvent::container_status("running", None))
    }

    pub fn subscriber_count(&self) -> usize {
        self.clients().len()
    }

    pub fn uptime(&self) -> Duration {
        self.inner.started.elapsed()
    }

    /// Publish a heartbeat `{timestamp, uptime}` now.
    pub fn heartbeat(&self) -> usize {
        let now = chrono::Utc::now().timestamp_millis();
        let uptime = i64::try_from(self.uptime().as_millis()).unwrap_or(i64::MAX);
        self.publish(AppEvent::heartbeat(now, uptime))
    }

    /// Publish heartbeats every `interval` until shutdown.
    pub fn spawn_heartbeat(
        &self,
        interval: Duration,
        shutdown: ShutdownSignal,
    ) -> JoinHandle<Option<()>> {
        let bus = self.clone();
        spawn_guarded("event-bus-heartbeat", async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // the first tick completes immediately
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        bus.heartbeat();
                    }
                }
            }
            debug!("heartbeat task stopped");
        })
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
