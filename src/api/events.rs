//! Event streaming: SSE for dashboards, WebSocket with replay-or-snapshot.

use crate::api::AppState;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    response::sse::{Event, KeepAlive, Sse},
    response::IntoResponse,
    routing::get,
    Router,
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast::error::RecvError;
use tracing::debug;

/// `state.updated` events are clamped at the subscriber boundary.
const STATE_UPDATE_MIN_INTERVAL: Duration = Duration::from_millis(500);
const SSE_HEARTBEAT: Duration = Duration::from_secs(15);

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/dashboard/events", get(events_sse))
        .route("/ws", get(events_ws))
}

async fn events_sse(
    State(state): State<Arc<AppState>>,
) -> Sse<impl futures::Stream<Item = std::result::Result<Event, Infallible>>> {
    let runtime = state.engine.runtime().clone();
    let mut rx = runtime.subscribe();
    let snapshot = runtime.snapshot();
    let revision = runtime.revision();

    let stream = async_stream::stream! {
        // Full snapshot up front so a fresh dashboard needs no second fetch.
        let first = json!({ "type": "snapshot", "revision": revision, "snapshot": snapshot });
        yield Ok(Event::default().event("snapshot").data(first.to_string()));

        let mut last_state_update = Instant::now() - STATE_UPDATE_MIN_INTERVAL;
        loop {
            match rx.recv().await {
                Ok(ev) => {
                    if ev.event == "state.updated" {
                        if last_state_update.elapsed() < STATE_UPDATE_MIN_INTERVAL {
                            continue;
                        }
                        last_state_update = Instant::now();
                    }
                    let name = ev.event.clone();
                    let data = serde_json::to_string(&ev).unwrap_or_else(|_| "{}".to_string());
                    yield Ok(Event::default().event(name).data(data));
                }
                Err(RecvError::Lagged(skipped)) => {
                    debug!("SSE subscriber lagged, skipped {} events", skipped);
                    continue;
                }
                Err(RecvError::Closed) => break,
            }
        }
    };

    Sse::new(stream).keep_alive(KeepAlive::new().interval(SSE_HEARTBEAT))
}

#[derive(Debug, Deserialize)]
struct WsQuery {
    #[serde(rename = "lastRevision")]
    last_revision: Option<u64>,
}

async fn events_ws(
    ws: WebSocketUpgrade,
    Query(query): Query<WsQuery>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_ws(socket, state, query.last_revision))
}

async fn handle_ws(socket: WebSocket, state: Arc<AppState>, last_revision: Option<u64>) {
    let runtime = state.engine.runtime().clone();
    let mut rx = runtime.subscribe();
    let (mut sender, mut receiver) = socket.split();

    // Missed events if the ring still has them; a fresh snapshot otherwise.
    let replay = last_revision.and_then(|rev| runtime.events_since(rev));
    let catch_up: Vec<String> = match replay {
        Some(events) => events
            .iter()
            .map(|ev| {
                json!({
                    "type": "event",
                    "revision": ev.revision,
                    "ts": ev.ts,
                    "event": ev.event,
                    "payload": ev.payload,
                })
                .to_string()
            })
            .collect(),
        None => {
            let snapshot = runtime.snapshot();
            let revision = runtime.revision();
            vec![json!({
                "type": "snapshot",
                "revision": revision,
                "snapshot": snapshot,
            })
            .to_string()]
        }
    };
    for text in catch_up {
        if sender.send(Message::Text(text)).await.is_err() {
            return;
        }
    }

    let mut send_task = tokio::spawn(async move {
        let mut last_state_update = Instant::now() - STATE_UPDATE_MIN_INTERVAL;
        loop {
            match rx.recv().await {
                Ok(ev) => {
                    if ev.event == "state.updated" {
                        if last_state_update.elapsed() < STATE_UPDATE_MIN_INTERVAL {
                            continue;
                        }
                        last_state_update = Instant::now();
                    }
                    let text = json!({
                        "type": "event",
                        "revision": ev.revision,
                        "ts": ev.ts,
                        "event": ev.event,
                        "payload": ev.payload,
                    })
                    .to_string();
                    if sender.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => break,
            }
        }
    });

    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(message)) = receiver.next().await {
            if matches!(message, Message::Close(_)) {
                break;
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }
    debug!("WebSocket subscriber disconnected");
}
