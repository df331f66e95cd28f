//! Context-bound emitter facade handed to coordinators and runners.
//!
//! Forwards to the owning stream's streamer actor, which assigns sequence
//! numbers. Trace emissions are suppressed wholesale when the streamer is
//! configured with `trace_enabled = false`.

use serde_json::Value;
use uuid::Uuid;

use weft_domain::event::{EventInput, EventKind};
use weft_domain::trace::TraceInput;

use crate::streamer::StreamerHandle;

#[derive(Clone)]
pub struct Emitter {
    handle: StreamerHandle,
    trace_enabled: bool,
}

impl Emitter {
    pub fn new(handle: StreamerHandle, trace_enabled: bool) -> Self {
        Self {
            handle,
            trace_enabled,
        }
    }

    pub fn stream_id(&self) -> &str {
        &self.handle.stream_id
    }

    pub fn emit(&self, input: EventInput) {
        self.handle.emit(input);
    }

    /// Shorthand for a bare event with metadata.
    pub fn event(&self, kind: EventKind, metadata: Value) {
        self.handle.emit(EventInput::new(kind).with_metadata(metadata));
    }

    /// Shorthand for a token-scoped event.
    pub fn token_event(
        &self,
        kind: EventKind,
        token_id: Uuid,
        node_id: impl Into<String>,
        metadata: Value,
    ) {
        self.handle.emit(
            EventInput::new(kind)
                .with_token(token_id)
                .with_node(node_id)
                .with_metadata(metadata),
        );
    }

    pub fn trace(&self, input: TraceInput) {
        if self.trace_enabled {
            self.handle.emit_trace(input);
        }
    }

    pub fn decision(&self, kind: impl Into<String>, payload: Value) {
        self.trace(TraceInput::Decision {
            kind: kind.into(),
            payload,
        });
    }

    pub fn dispatch(&self, kind: impl Into<String>, payload: Value) {
        self.trace(TraceInput::Dispatch {
            kind: kind.into(),
            payload,
        });
    }

    pub async fn flush(&self) {
        self.handle.flush().await;
    }
}
