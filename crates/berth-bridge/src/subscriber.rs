//! Reconnecting events client.
//!
//! [`SubscriberCore`] owns the connection state machine and is driven with
//! explicit timestamps, so every transition is testable without a socket.
//! [`Subscriber`] wraps it around a reqwest byte stream.

use std::time::{Duration, Instant};

use ahash::AHashMap;
use berth_harness::ShutdownSignal;
use futures_util::StreamExt;
use reqwest::header::{ACCEPT, CACHE_CONTROL};
use tracing::{debug, info, warn};

use crate::protocol::{AppEvent, EventType, NotificationPayload, SseMessage, CONNECTION_FRAME_TYPE};
use crate::sse::SseDecoder;

pub const DEFAULT_RECONNECT: Duration = Duration::from_secs(3);
pub const DEFAULT_LIVENESS_TIMEOUT: Duration = Duration::from_secs(15);
pub const NOTIFICATION_DEDUP_WINDOW: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum SubscriberError {
    #[error("http: {0}")]
    Http(#[from] reqwest::Error),
    #[error("unexpected status {0}")]
    Status(u16),
    #[error("no message within {0:?}")]
    LivenessTimeout(Duration),
    #[error("stream ended")]
    StreamEnded,
}

// ---------------------------------------------------------------------------
// Policy / state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Open,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectPolicy {
    Fixed(Duration),
    /// `step * attempt`, capped at `max`.
    Linear { step: Duration, max: Duration },
}

impl ReconnectPolicy {
    /// The interactive client's schedule: 2s, 4s, ... up to 30s.
    pub fn linear_default() -> Self {
        ReconnectPolicy::Linear {
            step: Duration::from_secs(2),
            max: Duration::from_secs(30),
        }
    }

    /// Delay before reconnect attempt number `attempt` (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        match *self {
            ReconnectPolicy::Fixed(delay) => delay,
            ReconnectPolicy::Linear { step, max } => step.saturating_mul(attempt.max(1)).min(max),
        }
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        ReconnectPolicy::Fixed(DEFAULT_RECONNECT)
    }
}

/// Ticket for one scheduled reconnect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectTicket {
    pub generation: u64,
    pub delay: Duration,
}

// ---------------------------------------------------------------------------
// SubscriberCore
// ---------------------------------------------------------------------------

/// Per-client connection state.
///
/// Each `connect` opens a new generation. Callbacks carrying an older
/// generation belong to a stream that has already been replaced and are
/// ignored, which is what keeps a late error from scheduling a second
/// reconnect after one already succeeded.
#[derive(Debug)]
pub struct SubscriberCore {
    state: ConnectionState,
    generation: u64,
    attempt: u32,
    pending: Option<u64>,
    stopped: bool,
    last_event_id: Option<String>,
    last_seen: Option<Instant>,
    policy: ReconnectPolicy,
    liveness_timeout: Duration,
    dedup_window: Duration,
    recent_notifications: AHashMap<String, Instant>,
}

impl SubscriberCore {
    pub fn new(policy: ReconnectPolicy, liveness_timeout: Duration) -> Self {
        Self {
            state: ConnectionState::Closed,
            generation: 0,
            attempt: 0,
            pending: None,
            stopped: false,
            last_event_id: None,
            last_seen: None,
            policy,
            liveness_timeout,
            dedup_window: NOTIFICATION_DEDUP_WINDOW,
            recent_notifications: AHashMap::new(),
        }
    }

    pub fn with_dedup_window(mut self, window: Duration) -> Self {
        self.dedup_window = window;
        self
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn last_event_id(&self) -> Option<&str> {
        self.last_event_id.as_deref()
    }

    pub fn reconnect_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// Start a connection attempt. `None` while one is already connecting or
    /// open: at most one live stream per subscriber.
    pub fn connect(&mut self) -> Option<u64> {
        if matches!(self.state, ConnectionState::Connecting | ConnectionState::Open) {
            debug!(state = ?self.state, "connect ignored; stream already active");
            return None;
        }
        self.stopped = false;
        self.pending = None;
        self.generation += 1;
        self.state = ConnectionState::Connecting;
        Some(self.generation)
    }

    pub fn on_open(&mut self, generation: u64, now: Instant) {
        if generation != self.generation || self.state != ConnectionState::Connecting {
            return;
        }
        info!(generation, "event stream open");
        self.state = ConnectionState::Open;
        self.attempt = 0;
        self.last_seen = Some(now);
    }

    /// Handle one frame payload. Returns the domain message to dispatch, if
    /// any: connection frames, heartbeats, duplicate notifications and
    /// malformed frames are consumed here.
    pub fn on_message(&mut self, generation: u64, data: &str, now: Instant) -> Option<SseMessage> {
        if generation != self.generation || self.state != ConnectionState::Open {
            return None;
        }
        self.last_seen = Some(now);

        let value: serde_json::Value = match serde_json::from_str(data) {
            Ok(value) => value,
            Err(e) => {
                warn!(error = %e, "dropping malformed event frame");
                return None;
            }
        };
        if value.get("type").and_then(|t| t.as_str()) == Some(CONNECTION_FRAME_TYPE) {
            debug!("connection acknowledged");
            return None;
        }
        let msg: SseMessage = match serde_json::from_value(value) {
            Ok(msg) => msg,
            Err(e) => {
                warn!(error = %e, "dropping event with invalid envelope");
                return None;
            }
        };
        self.last_event_id = Some(msg.id.clone());

        match msg.event.event_type {
            EventType::Heartbeat => None,
            EventType::NotificationShow if self.is_duplicate_notification(&msg.event, now) => {
                debug!("suppressing duplicate notification");
                None
            }
            _ => Some(msg),
        }
    }

    /// Transport failure on stream `generation`. Returns a ticket when this
    /// call scheduled the (single) reconnect.
    pub fn on_error(&mut self, generation: u64, reason: &str) -> Option<ReconnectTicket> {
        if generation != self.generation || self.stopped {
            return None;
        }
        if self.state != ConnectionState::Closed {
            warn!(generation, reason, "event stream lost");
        }
        self.state = ConnectionState::Closed;
        if self.pending.is_some() {
            return None;
        }
        self.attempt = self.attempt.saturating_add(1);
        self.pending = Some(self.generation);
        Some(ReconnectTicket {
            generation: self.generation,
            delay: self.policy.delay(self.attempt),
        })
    }

    /// The backoff for `ticket` elapsed. `true` means the caller should
    /// `connect` now; `false` means the ticket went stale (explicit
    /// disconnect, or a connection already came up in the meantime).
    pub fn reconnect_due(&mut self, ticket: ReconnectTicket) -> bool {
        if self.stopped
            || self.pending != Some(ticket.generation)
            || self.state != ConnectionState::Closed
        {
            return false;
        }
        self.pending = None;
        true
    }

    /// Explicit unsubscribe: closes and cancels any pending reconnect.
    pub fn disconnect(&mut self) {
        self.stopped = true;
        self.pending = None;
        self.state = ConnectionState::Closed;
        self.generation += 1;
    }

    /// `true` when an open stream has been silent past the liveness timeout.
    pub fn is_stale(&self, now: Instant) -> bool {
        self.state == ConnectionState::Open
            && self
                .last_seen
                .is_some_and(|seen| now.saturating_duration_since(seen) > self.liveness_timeout)
    }

    fn is_duplicate_notification(&mut self, event: &AppEvent, now: Instant) -> bool {
        let Ok(payload) = event.payload_as::<NotificationPayload>() else {
            return false;
        };
        let window = self.dedup_window;
        self.recent_notifications
            .retain(|_, seen| now.saturating_duration_since(*seen) < window);
        if self.recent_notifications.contains_key(&payload.title) {
            return true;
        }
        self.recent_notifications.insert(payload.title, now);
        false
    }
}

// ---------------------------------------------------------------------------
// Subscriber (HTTP driver)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct SubscriberConfig {
    pub url: String,
    pub reconnect: ReconnectPolicy,
    pub liveness_timeout: Duration,
}

impl SubscriberConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            reconnect: ReconnectPolicy::default(),
            liveness_timeout: DEFAULT_LIVENESS_TIMEOUT,
        }
    }
}

enum StreamEnd {
    Shutdown,
    Failed(SubscriberError),
}

pub struct Subscriber {
    config: SubscriberConfig,
    client: reqwest::Client,
}

impl Subscriber {
    pub fn new(config: SubscriberConfig) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
        }
    }

    /// Stream domain messages into `sink` until shutdown fires or `sink` is
    /// dropped, reconnecting after every failure.
    pub async fn run(self, sink: flume::Sender<SseMessage>, shutdown: ShutdownSignal) {
        let mut core = SubscriberCore::new(self.config.reconnect, self.config.liveness_timeout);

        while !shutdown.is_shutting_down() {
            let Some(generation) = core.connect() else {
                break;
            };
            let failure = match self.stream_once(&mut core, generation, &sink, &shutdown).await {
                StreamEnd::Shutdown => break,
                StreamEnd::Failed(err) => err,
            };
            let Some(ticket) = core.on_error(generation, &failure.to_string()) else {
                break;
            };
            debug!(delay = ?ticket.delay, "reconnect scheduled");
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(ticket.delay) => {}
            }
            if !core.reconnect_due(ticket) {
                break;
            }
        }

        core.disconnect();
        info!(url = %self.config.url, "event subscriber stopped");
    }

    async fn stream_once(
        &self,
        core: &mut SubscriberCore,
        generation: u64,
        sink: &flume::Sender<SseMessage>,
        shutdown: &ShutdownSignal,
    ) -> StreamEnd {
        let mut request = self
            .client
            .get(&self.config.url)
            .header(ACCEPT, "text/event-stream")
            .header(CACHE_CONTROL, "no-cache");
        if let Some(id) = core.last_event_id() {
            request = request.header("Last-Event-ID", id);
        }

        let response = tokio::select! {
            _ = shutdown.cancelled() => return StreamEnd::Shutdown,
            response = request.send() => match response {
                Ok(response) => response,
                Err(e) => return StreamEnd::Failed(e.into()),
            },
        };
        if !response.status().is_success() {
            return StreamEnd::Failed(SubscriberError::Status(response.status().as_u16()));
        }
        core.on_open(generation, Instant::now());

        let mut bytes = response.bytes_stream();
        let mut decoder = SseDecoder::new();
        let check_every = (self.config.liveness_timeout / 2).max(Duration::from_millis(10));
        let mut liveness = tokio::time::interval(check_every);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return StreamEnd::Shutdown,
                _ = liveness.tick() => {
                    if core.is_stale(Instant::now()) {
                        return StreamEnd::Failed(SubscriberError::LivenessTimeout(
                            self.config.liveness_timeout,
                        ));
                    }
                }
                chunk = bytes.next() => match chunk {
                    Some(Ok(chunk)) => {
                        for frame in decoder.push(&chunk) {
                            let Some(msg) = core.on_message(generation, &frame.data, Instant::now()) else {
                                continue;
                            };
                            if sink.send_async(msg).await.is_err() {
                                return StreamEnd::Shutdown;
                            }
                        }
                    }
                    Some(Err(e)) => return StreamEnd::Failed(e.into()),
                    None => return StreamEnd::Failed(SubscriberError::StreamEnded),
                },
            }
        }
    }
}
