//! Per-stream-key event/trace streamer actor.
//!
//! One instance per workflow-run-id or conversation-id. Owns the monotonic
//! sequence counters (persisted write-through so restarts never repeat a
//! sequence), the write-ahead buffers, the flush timer, and the live
//! subscriber set.
//!
//! Flush discipline: a batch goes out when the combined buffers reach
//! `batch_size`, or when the flush timer fires. Inserts run in chunks of
//! `rows_per_insert`. A failed flush prepends the batch back into the
//! buffers and re-arms the timer; after `max_retry_attempts` consecutive
//! failures the batch is dropped and logged, the single lossy path.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use weft_domain::config::StreamerConfig;
use weft_domain::event::{EventInput, ExecutionType, WorkflowEvent};
use weft_domain::trace::{TraceEvent, TraceInput};
use weft_store::{PendingBuffer, Store, StreamCursor};

use crate::filter::SubscriberFilter;
use crate::mailbox::{mailbox, Addr};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Wire payload
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// The envelope delivered to WebSocket and SSE subscribers.
#[derive(Debug, Clone, Serialize)]
pub struct WirePayload {
    /// `event` for live deliveries, `history` for the replay payload.
    #[serde(rename = "type")]
    pub kind: String,
    /// `events` or `trace`.
    pub stream: String,
    #[serde(rename = "subscriptionId")]
    pub subscription_id: Uuid,
    pub event: Value,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Messages & handle
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub enum StreamerMsg {
    Emit(EventInput),
    EmitTrace(TraceInput),
    Subscribe {
        filter: SubscriberFilter,
        events: bool,
        trace: bool,
        /// Replay the recent-events window as a `history` payload first.
        history: bool,
        sink: mpsc::Sender<WirePayload>,
        reply: oneshot::Sender<Uuid>,
    },
    Unsubscribe {
        id: Uuid,
    },
    FlushTimer,
    /// Flush immediately and acknowledge (shutdown, tests).
    FlushNow {
        reply: oneshot::Sender<()>,
    },
}

#[derive(Clone)]
pub struct StreamerHandle {
    pub stream_id: String,
    addr: Addr<StreamerMsg>,
}

impl StreamerHandle {
    pub fn emit(&self, input: EventInput) {
        self.addr.send(StreamerMsg::Emit(input));
    }

    pub fn emit_trace(&self, input: TraceInput) {
        self.addr.send(StreamerMsg::EmitTrace(input));
    }

    pub async fn subscribe(
        &self,
        filter: SubscriberFilter,
        events: bool,
        trace: bool,
        history: bool,
        sink: mpsc::Sender<WirePayload>,
    ) -> Option<Uuid> {
        let (reply, rx) = oneshot::channel();
        self.addr.send(StreamerMsg::Subscribe {
            filter,
            events,
            trace,
            history,
            sink,
            reply,
        });
        rx.await.ok()
    }

    pub fn unsubscribe(&self, id: Uuid) {
        self.addr.send(StreamerMsg::Unsubscribe { id });
    }

    /// Drain the buffers to storage and wait for the insert to finish.
    pub async fn flush(&self) {
        let (reply, rx) = oneshot::channel();
        self.addr.send(StreamerMsg::FlushNow { reply });
        let _ = rx.await;
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Actor
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct Subscriber {
    filter: SubscriberFilter,
    events: bool,
    trace: bool,
    sink: mpsc::Sender<WirePayload>,
}

pub struct Streamer {
    stream_id: String,
    execution_type: ExecutionType,
    project_id: Option<String>,
    store: Arc<dyn Store>,
    cfg: StreamerConfig,
    addr: Addr<StreamerMsg>,

    event_seq: u64,
    trace_seq: u64,
    event_buf: Vec<WorkflowEvent>,
    trace_buf: Vec<TraceEvent>,
    retry_count: u32,
    timer_armed: bool,
    subscribers: HashMap<Uuid, Subscriber>,
}

impl Streamer {
    /// Spawn the streamer actor for a stream key. Recovers the persisted
    /// sequence cursor and any unflushed buffers before accepting
    /// emissions, so sequences stay strictly monotonic across restarts.
    pub async fn spawn(
        stream_id: String,
        execution_type: ExecutionType,
        project_id: Option<String>,
        store: Arc<dyn Store>,
        cfg: StreamerConfig,
    ) -> StreamerHandle {
        let (addr, mut rx) = mailbox::<StreamerMsg>();

        let cursor = store
            .load_stream_cursor(&stream_id)
            .await
            .ok()
            .flatten()
            .unwrap_or(StreamCursor {
                stream_id: stream_id.clone(),
                event_seq: 0,
                trace_seq: 0,
            });
        let recovered = store
            .load_pending_buffer(&stream_id)
            .await
            .unwrap_or_default();

        let mut actor = Streamer {
            stream_id: stream_id.clone(),
            execution_type,
            project_id,
            store,
            cfg,
            addr: addr.clone(),
            event_seq: cursor.event_seq,
            trace_seq: cursor.trace_seq,
            event_buf: recovered.events,
            trace_buf: recovered.traces,
            retry_count: 0,
            timer_armed: false,
            subscribers: HashMap::new(),
        };

        let handle = StreamerHandle {
            stream_id,
            addr: addr.clone(),
        };

        tokio::spawn(async move {
            // Recovered buffers flush before any new emission is handled.
            if !(actor.event_buf.is_empty() && actor.trace_buf.is_empty()) {
                tracing::info!(
                    stream_id = %actor.stream_id,
                    events = actor.event_buf.len(),
                    traces = actor.trace_buf.len(),
                    "flushing recovered stream buffers"
                );
                actor.flush().await;
            }
            while let Some(msg) = rx.recv().await {
                actor.handle(msg).await;
            }
        });

        handle
    }

    async fn handle(&mut self, msg: StreamerMsg) {
        match msg {
            StreamerMsg::Emit(input) => self.on_emit(input).await,
            StreamerMsg::EmitTrace(input) => self.on_emit_trace(input).await,
            StreamerMsg::Subscribe {
                filter,
                events,
                trace,
                history,
                sink,
                reply,
            } => {
                let id = self.on_subscribe(filter, events, trace, history, sink).await;
                let _ = reply.send(id);
            }
            StreamerMsg::Unsubscribe { id } => {
                self.subscribers.remove(&id);
            }
            StreamerMsg::FlushTimer => {
                self.timer_armed = false;
                self.flush().await;
            }
            StreamerMsg::FlushNow { reply } => {
                self.flush().await;
                let _ = reply.send(());
            }
        }
    }

    // ── Emission ─────────────────────────────────────────────────────

    async fn on_emit(&mut self, input: EventInput) {
        self.event_seq += 1;
        let row = WorkflowEvent {
            id: Uuid::new_v4(),
            stream_id: self.stream_id.clone(),
            execution_id: self.stream_id.clone(),
            execution_type: self.execution_type,
            project_id: self.project_id.clone(),
            sequence: self.event_seq,
            event_type: input.event_type,
            timestamp: Utc::now(),
            node_id: input.node_id,
            token_id: input.token_id,
            metadata: input.metadata,
        };

        self.persist_cursor().await;
        self.event_buf.push(row.clone());
        self.persist_pending().await;
        self.broadcast_event(&row);
        self.after_append().await;
    }

    async fn on_emit_trace(&mut self, input: TraceInput) {
        self.trace_seq += 1;
        let row = TraceEvent {
            id: Uuid::new_v4(),
            stream_id: self.stream_id.clone(),
            execution_id: self.stream_id.clone(),
            execution_type: self.execution_type,
            sequence: self.trace_seq,
            category: input.category(),
            kind: input.kind().to_string(),
            duration_ms: input.duration_ms(),
            payload: input.payload(),
            timestamp: Utc::now(),
        };

        self.persist_cursor().await;
        self.trace_buf.push(row.clone());
        self.persist_pending().await;
        self.broadcast_trace(&row);
        self.after_append().await;
    }

    async fn after_append(&mut self) {
        if self.event_buf.len() + self.trace_buf.len() >= self.cfg.batch_size {
            self.flush().await;
        } else {
            self.arm_timer();
        }
    }

    async fn persist_cursor(&self) {
        let cursor = StreamCursor {
            stream_id: self.stream_id.clone(),
            event_seq: self.event_seq,
            trace_seq: self.trace_seq,
        };
        if let Err(e) = self.store.save_stream_cursor(&cursor).await {
            tracing::warn!(stream_id = %self.stream_id, error = %e, "cursor write failed");
        }
    }

    async fn persist_pending(&self) {
        let buffer = PendingBuffer {
            events: self.event_buf.clone(),
            traces: self.trace_buf.clone(),
        };
        if let Err(e) = self.store.save_pending_buffer(&self.stream_id, &buffer).await {
            tracing::warn!(stream_id = %self.stream_id, error = %e, "pending buffer write failed");
        }
    }

    fn arm_timer(&mut self) {
        if self.timer_armed {
            return;
        }
        self.timer_armed = true;
        let addr = self.addr.clone();
        let interval = Duration::from_millis(self.cfg.flush_interval_ms);
        tokio::spawn(async move {
            tokio::time::sleep(interval).await;
            addr.send(StreamerMsg::FlushTimer);
        });
    }

    // ── Flush ────────────────────────────────────────────────────────

    async fn flush(&mut self) {
        if self.event_buf.is_empty() && self.trace_buf.is_empty() {
            return;
        }
        let events = std::mem::take(&mut self.event_buf);
        let traces = std::mem::take(&mut self.trace_buf);

        let mut result = Ok(());
        for chunk in events.chunks(self.cfg.rows_per_insert.max(1)) {
            if let Err(e) = self.store.insert_events(chunk).await {
                result = Err(e);
                break;
            }
        }
        if result.is_ok() {
            for chunk in traces.chunks(self.cfg.rows_per_insert.max(1)) {
                if let Err(e) = self.store.insert_trace_events(chunk).await {
                    result = Err(e);
                    break;
                }
            }
        }

        match result {
            Ok(()) => {
                self.retry_count = 0;
                self.store_pending_cleared().await;
            }
            Err(e) => {
                self.retry_count += 1;
                if self.retry_count >= self.cfg.max_retry_attempts {
                    tracing::error!(
                        stream_id = %self.stream_id,
                        dropped_events = events.len(),
                        dropped_traces = traces.len(),
                        error = %e,
                        "dropping stream batch after max retries"
                    );
                    self.retry_count = 0;
                    self.store_pending_cleared().await;
                } else {
                    tracing::warn!(
                        stream_id = %self.stream_id,
                        attempt = self.retry_count,
                        error = %e,
                        "flush failed, requeueing batch"
                    );
                    // Prepend the failed batch so ordering is preserved
                    // ahead of anything emitted meanwhile.
                    let mut requeued = events;
                    requeued.append(&mut self.event_buf);
                    self.event_buf = requeued;
                    let mut requeued = traces;
                    requeued.append(&mut self.trace_buf);
                    self.trace_buf = requeued;
                    self.arm_timer();
                }
            }
        }
    }

    async fn store_pending_cleared(&self) {
        let buffer = PendingBuffer {
            events: self.event_buf.clone(),
            traces: self.trace_buf.clone(),
        };
        if let Err(e) = self.store.save_pending_buffer(&self.stream_id, &buffer).await {
            tracing::warn!(stream_id = %self.stream_id, error = %e, "pending buffer clear failed");
        }
    }

    // ── Broadcast ────────────────────────────────────────────────────

    async fn on_subscribe(
        &mut self,
        filter: SubscriberFilter,
        events: bool,
        trace: bool,
        history: bool,
        sink: mpsc::Sender<WirePayload>,
    ) -> Uuid {
        let id = Uuid::new_v4();

        if history && events {
            let since = Utc::now()
                - chrono::Duration::seconds(self.cfg.history_window_secs as i64);
            if let Ok(rows) = self.store.recent_events(&self.stream_id, since).await {
                let matching: Vec<Value> = rows
                    .iter()
                    .filter(|e| filter.matches_event(e))
                    .filter_map(|e| serde_json::to_value(e).ok())
                    .collect();
                if !matching.is_empty() {
                    let _ = sink
                        .try_send(WirePayload {
                            kind: "history".into(),
                            stream: "events".into(),
                            subscription_id: id,
                            event: Value::Array(matching),
                        });
                }
            }
        }

        self.subscribers.insert(
            id,
            Subscriber {
                filter,
                events,
                trace,
                sink,
            },
        );
        id
    }

    fn broadcast_event(&mut self, row: &WorkflowEvent) {
        let mut dead = Vec::new();
        for (id, sub) in &self.subscribers {
            if !sub.events || !sub.filter.matches_event(row) {
                continue;
            }
            let payload = WirePayload {
                kind: "event".into(),
                stream: "events".into(),
                subscription_id: *id,
                event: serde_json::to_value(row).unwrap_or(Value::Null),
            };
            if sub.sink.try_send(payload).is_err() {
                dead.push(*id);
            }
        }
        for id in dead {
            tracing::debug!(stream_id = %self.stream_id, subscription = %id, "removing dead subscriber");
            self.subscribers.remove(&id);
        }
    }

    fn broadcast_trace(&mut self, row: &TraceEvent) {
        let mut dead = Vec::new();
        for (id, sub) in &self.subscribers {
            if !sub.trace || !sub.filter.matches_trace(row) {
                continue;
            }
            let payload = WirePayload {
                kind: "event".into(),
                stream: "trace".into(),
                subscription_id: *id,
                event: serde_json::to_value(row).unwrap_or(Value::Null),
            };
            if sub.sink.try_send(payload).is_err() {
                dead.push(*id);
            }
        }
        for id in dead {
            self.subscribers.remove(&id);
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Registry
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Lazily-spawned streamers keyed by stream id.
pub struct StreamerRegistry {
    store: Arc<dyn Store>,
    cfg: StreamerConfig,
    streamers: parking_lot::Mutex<HashMap<String, StreamerHandle>>,
}

impl StreamerRegistry {
    pub fn new(store: Arc<dyn Store>, cfg: StreamerConfig) -> Self {
        Self {
            store,
            cfg,
            streamers: parking_lot::Mutex::new(HashMap::new()),
        }
    }

    pub async fn get_or_spawn(
        &self,
        stream_id: &str,
        execution_type: ExecutionType,
        project_id: Option<String>,
    ) -> StreamerHandle {
        if let Some(handle) = self.streamers.lock().get(stream_id) {
            return handle.clone();
        }
        let handle = Streamer::spawn(
            stream_id.to_string(),
            execution_type,
            project_id,
            self.store.clone(),
            self.cfg.clone(),
        )
        .await;
        self.streamers
            .lock()
            .entry(stream_id.to_string())
            .or_insert_with(|| handle.clone());
        handle
    }

    pub fn get(&self, stream_id: &str) -> Option<StreamerHandle> {
        self.streamers.lock().get(stream_id).cloned()
    }

    /// Flush every live streamer (graceful shutdown).
    pub async fn flush_all(&self) {
        let handles: Vec<StreamerHandle> = self.streamers.lock().values().cloned().collect();
        for handle in handles {
            handle.flush().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use weft_domain::event::EventKind;
    use weft_store::MemoryStore;

    fn input(kind: EventKind) -> EventInput {
        EventInput::new(kind)
    }

    async fn spawn_streamer(store: Arc<dyn Store>, cfg: StreamerConfig) -> StreamerHandle {
        Streamer::spawn(
            "s1".into(),
            ExecutionType::Workflow,
            Some("p1".into()),
            store,
            cfg,
        )
        .await
    }

    #[tokio::test]
    async fn sequences_are_monotonic_and_gap_free() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let handle = spawn_streamer(store.clone(), StreamerConfig::default()).await;

        for _ in 0..10 {
            handle.emit(input(EventKind::ContextUpdated));
        }
        handle.flush().await;

        let events = store.list_events("s1").await.unwrap();
        assert_eq!(events.len(), 10);
        for (i, e) in events.iter().enumerate() {
            assert_eq!(e.sequence, i as u64 + 1);
        }
    }

    #[tokio::test]
    async fn batch_size_triggers_immediate_flush() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let cfg = StreamerConfig {
            batch_size: 3,
            flush_interval_ms: 60_000,
            ..Default::default()
        };
        let handle = spawn_streamer(store.clone(), cfg).await;

        for _ in 0..3 {
            handle.emit(input(EventKind::ContextUpdated));
        }
        // No explicit flush: size threshold should have fired. Give the
        // actor a moment to process its mailbox.
        tokio::time::sleep(Duration::from_millis(50)).await;
        let events = store.list_events("s1").await.unwrap();
        assert_eq!(events.len(), 3);
    }

    #[tokio::test]
    async fn timer_flushes_partial_batches() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let cfg = StreamerConfig {
            batch_size: 100,
            flush_interval_ms: 20,
            ..Default::default()
        };
        let handle = spawn_streamer(store.clone(), cfg).await;

        handle.emit(input(EventKind::WorkflowStarted));
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(store.list_events("s1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn separate_counters_for_events_and_traces() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let handle = spawn_streamer(store.clone(), StreamerConfig::default()).await;

        handle.emit(input(EventKind::WorkflowStarted));
        handle.emit_trace(TraceInput::Debug {
            message: "first".into(),
            payload: Value::Null,
        });
        handle.emit(input(EventKind::WorkflowCompleted));
        handle.flush().await;

        let events = store.list_events("s1").await.unwrap();
        let traces = store.list_trace_events("s1").await.unwrap();
        assert_eq!(events.iter().map(|e| e.sequence).collect::<Vec<_>>(), vec![1, 2]);
        assert_eq!(traces.len(), 1);
        assert_eq!(traces[0].sequence, 1);
    }

    #[tokio::test]
    async fn counters_survive_restart() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        {
            let handle = spawn_streamer(store.clone(), StreamerConfig::default()).await;
            handle.emit(input(EventKind::WorkflowStarted));
            handle.emit(input(EventKind::TokenCreated));
            handle.flush().await;
        }

        // A new streamer over the same store continues the sequence.
        let handle = spawn_streamer(store.clone(), StreamerConfig::default()).await;
        handle.emit(input(EventKind::WorkflowCompleted));
        handle.flush().await;

        let events = store.list_events("s1").await.unwrap();
        assert_eq!(
            events.iter().map(|e| e.sequence).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
    }

    #[tokio::test]
    async fn recovered_pending_buffer_flushes_first() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        // Simulate a crash: cursor advanced, rows still pending.
        let pending_row = WorkflowEvent {
            id: Uuid::new_v4(),
            stream_id: "s1".into(),
            execution_id: "s1".into(),
            execution_type: ExecutionType::Workflow,
            project_id: None,
            sequence: 1,
            event_type: EventKind::WorkflowStarted,
            timestamp: Utc::now(),
            node_id: None,
            token_id: None,
            metadata: Value::Null,
        };
        store
            .save_stream_cursor(&StreamCursor {
                stream_id: "s1".into(),
                event_seq: 1,
                trace_seq: 0,
            })
            .await
            .unwrap();
        store
            .save_pending_buffer(
                "s1",
                &PendingBuffer {
                    events: vec![pending_row],
                    traces: vec![],
                },
            )
            .await
            .unwrap();

        let handle = spawn_streamer(store.clone(), StreamerConfig::default()).await;
        handle.emit(input(EventKind::WorkflowCompleted));
        handle.flush().await;

        let events = store.list_events("s1").await.unwrap();
        assert_eq!(
            events.iter().map(|e| e.sequence).collect::<Vec<_>>(),
            vec![1, 2]
        );
    }

    #[tokio::test]
    async fn subscribers_receive_filtered_events() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let handle = spawn_streamer(store.clone(), StreamerConfig::default()).await;

        let (tx, mut rx) = mpsc::channel(16);
        let mut filter = SubscriberFilter::default();
        filter.event_type = Some("workflow.completed".into());
        handle
            .subscribe(filter, true, false, false, tx)
            .await
            .unwrap();

        handle.emit(input(EventKind::WorkflowStarted));
        handle.emit(input(EventKind::WorkflowCompleted));
        handle.flush().await;

        let payload = rx.recv().await.unwrap();
        assert_eq!(payload.kind, "event");
        assert_eq!(payload.stream, "events");
        assert_eq!(payload.event["event_type"], "workflow.completed");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn dead_subscriber_is_removed() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let handle = spawn_streamer(store.clone(), StreamerConfig::default()).await;

        let (tx, rx) = mpsc::channel(1);
        handle
            .subscribe(SubscriberFilter::default(), true, false, false, tx)
            .await
            .unwrap();
        drop(rx);

        // Both emits go through; the second must not panic or wedge after
        // the subscriber is dropped on the first failed delivery.
        handle.emit(input(EventKind::WorkflowStarted));
        handle.emit(input(EventKind::WorkflowCompleted));
        handle.flush().await;
        assert_eq!(store.list_events("s1").await.unwrap().len(), 2);
    }
}
