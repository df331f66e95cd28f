//! WebSocket endpoint for live event/trace subscriptions.
//!
//! Flow:
//! 1. Client connects to `/v1/stream/ws`
//! 2. Client sends `{type: "subscribe", id, stream, filters}` (any number)
//! 3. Server forwards matching envelopes; `{type: "unsubscribe", id}` stops
//!    one subscription; closing the socket drops them all

use std::collections::HashMap;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use uuid::Uuid;

use weft_engine::SubscriberFilter;

use crate::state::AppState;

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClientMsg {
    Subscribe {
        id: String,
        /// `events` (default) or `trace`.
        #[serde(default)]
        stream: Option<String>,
        #[serde(default)]
        filters: SubscriberFilter,
        /// Request the recent-events history payload on attach.
        #[serde(default)]
        history: bool,
    },
    Unsubscribe {
        id: String,
    },
}

pub async fn stream_ws(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut ws_sink, mut ws_stream) = socket.split();

    // One delivery channel per connection; the writer task forwards
    // envelopes to the socket.
    let (tx, mut rx) = mpsc::channel::<weft_engine::WirePayload>(256);
    let writer = tokio::spawn(async move {
        while let Some(payload) = rx.recv().await {
            let Ok(json) = serde_json::to_string(&payload) else {
                continue;
            };
            if ws_sink.send(Message::Text(json)).await.is_err() {
                break;
            }
        }
    });

    // Client subscription id → (stream id, server subscription id).
    let mut subscriptions: HashMap<String, (String, Uuid)> = HashMap::new();

    while let Some(Ok(msg)) = ws_stream.next().await {
        let text = match msg {
            Message::Text(text) => text,
            Message::Close(_) => break,
            _ => continue,
        };
        match serde_json::from_str::<ClientMsg>(&text) {
            Ok(ClientMsg::Subscribe {
                id,
                stream,
                filters,
                history,
            }) => {
                let want_trace = stream.as_deref() == Some("trace");
                let stream_id = filters.stream_id.clone().unwrap_or_default();
                match state
                    .runtime
                    .subscribe(filters, !want_trace, want_trace, history, tx.clone())
                    .await
                {
                    Ok(sub_id) => {
                        subscriptions.insert(id, (stream_id, sub_id));
                    }
                    Err(e) => {
                        send_error(&tx, &e.to_string()).await;
                    }
                }
            }
            Ok(ClientMsg::Unsubscribe { id }) => {
                if let Some((stream_id, sub_id)) = subscriptions.remove(&id) {
                    state.runtime.unsubscribe(&stream_id, sub_id);
                } else {
                    send_error(&tx, &format!("unknown subscription '{id}'")).await;
                }
            }
            Err(e) => {
                send_error(&tx, &format!("unparseable message: {e}")).await;
            }
        }
    }

    // Cleanup: drop server-side subscriptions, stop the writer.
    for (_, (stream_id, sub_id)) in subscriptions {
        state.runtime.unsubscribe(&stream_id, sub_id);
    }
    writer.abort();
    tracing::debug!("stream websocket closed");
}

async fn send_error(tx: &mpsc::Sender<weft_engine::WirePayload>, message: &str) {
    // Reuse the payload channel so error frames stay ordered with events.
    let _ = tx
        .send(weft_engine::WirePayload {
            kind: "error".into(),
            stream: String::new(),
            subscription_id: Uuid::nil(),
            event: serde_json::json!({ "message": message }),
        })
        .await;
}
