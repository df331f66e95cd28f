//! SSE endpoint for live event/trace subscriptions.
//!
//! `GET /sse?streamId=…&streams=events,trace&eventType=…` emits
//! `data: {stream, event}` lines after a leading `: connected` comment.

use axum::extract::{Query, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::IntoResponse;
use futures_util::stream::Stream;
use serde::Deserialize;
use uuid::Uuid;

use weft_domain::event::ExecutionType;
use weft_domain::trace::TraceCategory;
use weft_engine::SubscriberFilter;

use crate::state::AppState;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SseQuery {
    pub stream_id: Option<String>,
    /// Comma-separated: `events`, `trace`, or both. Defaults to `events`.
    pub streams: Option<String>,
    pub execution_id: Option<String>,
    pub execution_type: Option<ExecutionType>,
    pub project_id: Option<String>,
    pub event_type: Option<String>,
    /// Comma-separated any-of match.
    pub event_types: Option<String>,
    pub node_id: Option<String>,
    pub token_id: Option<Uuid>,
    pub category: Option<TraceCategory>,
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub min_duration_ms: Option<u64>,
    #[serde(default)]
    pub history: bool,
}

impl SseQuery {
    fn filter(&self) -> SubscriberFilter {
        SubscriberFilter {
            stream_id: self.stream_id.clone(),
            execution_id: self.execution_id.clone(),
            execution_type: self.execution_type,
            project_id: self.project_id.clone(),
            event_type: self.event_type.clone(),
            event_types: self
                .event_types
                .as_ref()
                .map(|s| s.split(',').map(|t| t.trim().to_string()).collect()),
            node_id: self.node_id.clone(),
            token_id: self.token_id,
            category: self.category,
            kind: self.kind.clone(),
            min_duration_ms: self.min_duration_ms,
        }
    }
}

pub async fn stream_sse(
    State(state): State<AppState>,
    Query(q): Query<SseQuery>,
) -> impl IntoResponse {
    let streams = q.streams.as_deref().unwrap_or("events");
    let events = streams.split(',').any(|s| s.trim() == "events");
    let trace = streams.split(',').any(|s| s.trim() == "trace");

    let (tx, rx) = tokio::sync::mpsc::channel(256);
    let subscribed = state
        .runtime
        .subscribe(q.filter(), events, trace, q.history, tx)
        .await;

    if let Err(e) = subscribed {
        let message = e.to_string();
        let stream = futures_util::stream::once(async move {
            Ok::<_, std::convert::Infallible>(
                Event::default()
                    .event("error")
                    .data(serde_json::json!({ "error": message }).to_string()),
            )
        });
        return Sse::new(futures_util::stream::StreamExt::boxed(stream))
            .keep_alive(KeepAlive::default())
            .into_response();
    }

    let stream = make_sse_stream(rx);
    Sse::new(futures_util::stream::StreamExt::boxed(stream))
        .keep_alive(KeepAlive::default())
        .into_response()
}

fn make_sse_stream(
    mut rx: tokio::sync::mpsc::Receiver<weft_engine::WirePayload>,
) -> impl Stream<Item = Result<Event, std::convert::Infallible>> {
    async_stream::stream! {
        // Establishes the stream before any event arrives.
        yield Ok(Event::default().comment("connected"));

        while let Some(payload) = rx.recv().await {
            let data = serde_json::json!({
                "stream": payload.stream,
                "event": payload.event,
            });
            yield Ok(Event::default().data(data.to_string()));
        }
    }
}
