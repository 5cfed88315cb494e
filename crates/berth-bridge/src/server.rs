use std::convert::Infallible;
use std::time::Duration;

use axum::extract::State;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::routing::get;
use axum::Router;
use berth_harness::ShutdownSignal;
use futures_util::stream::{self, Stream, StreamExt};
use tokio::net::TcpListener;
use tracing::info;

use crate::event_bus::EventBus;
use crate::protocol::{ConnectionFrame, SseMessage};

pub const EVENTS_PATH: &str = "/v1/events";

const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Clone)]
pub struct EventsState {
    pub bus: EventBus,
    pub shutdown: ShutdownSignal,
}

pub fn router(bus: EventBus, shutdown: ShutdownSignal) -> Router {
    Router::new()
        .route(EVENTS_PATH, get(events_handler))
        .with_state(EventsState { bus, shutdown })
}

/// GET /v1/events: connection frame, current container status, then every
/// bus event until the client leaves or the server shuts down.
async fn events_handler(
    State(state): State<EventsState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let subscription = state.bus.subscribe();
    let client_id = subscription.id;
    info!(client = %client_id, "SSE client connected");

    let head = stream::iter([
        ConnectionFrame::new(client_id).to_json(),
        SseMessage::new(state.bus.current_status()).to_json(),
    ]);
    let shutdown = state.shutdown.clone();
    let live = subscription
        .rx
        .into_stream()
        .map(|msg| msg.to_json())
        .take_until(async move { shutdown.cancelled().await });

    let frames = head
        .chain(live)
        .map(|json| Ok::<_, Infallible>(Event::default().data(json)));

    Sse::new(frames).keep_alive(
        KeepAlive::new()
            .interval(KEEPALIVE_INTERVAL)
            .text("keepalive"),
    )
}

/// Serve the events route on `listener` until `shutdown` fires.
pub async fn serve(
    listener: TcpListener,
    bus: EventBus,
    shutdown: ShutdownSignal,
) -> std::io::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, path = EVENTS_PATH, "events server listening");
    }
    let app = router(bus, shutdown.clone());
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
}
