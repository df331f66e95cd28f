//! Streamer durability under storage failure: retry, requeue, and the
//! single documented lossy path (drop after max retries).

mod common;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use uuid::Uuid;

use weft_domain::config::StreamerConfig;
use weft_domain::conversation::{Conversation, Message, Move, Turn};
use weft_domain::definition::{Definition, DefinitionKind, Node, Owner, Transition};
use weft_domain::event::{EventInput, EventKind, ExecutionType, WorkflowEvent};
use weft_domain::run::WorkflowRun;
use weft_domain::trace::TraceEvent;
use weft_domain::{Error, Result};
use weft_engine::streamer::Streamer;
use weft_store::{
    MemoryStore, PendingBuffer, RunFilter, Store, StreamCursor, WriteBatch,
};

/// Delegating store whose event inserts fail a configured number of times.
struct FlakyStore {
    inner: MemoryStore,
    failures_left: Mutex<u32>,
}

impl FlakyStore {
    fn new(failures: u32) -> Self {
        Self {
            inner: MemoryStore::new(),
            failures_left: Mutex::new(failures),
        }
    }
}

#[async_trait::async_trait]
impl Store for FlakyStore {
    async fn put_definition(
        &self,
        def: &Definition,
        nodes: &[Node],
        transitions: &[Transition],
    ) -> Result<()> {
        self.inner.put_definition(def, nodes, transitions).await
    }

    async fn get_definition(&self, id: &str, version: Option<u32>) -> Result<Option<Definition>> {
        self.inner.get_definition(id, version).await
    }

    async fn get_definition_by_reference(
        &self,
        kind: DefinitionKind,
        reference: &str,
        owner: &Owner,
    ) -> Result<Option<Definition>> {
        self.inner
            .get_definition_by_reference(kind, reference, owner)
            .await
    }

    async fn find_definition_by_hash(
        &self,
        kind: DefinitionKind,
        reference: &str,
        owner: &Owner,
        content_hash: &str,
    ) -> Result<Option<Definition>> {
        self.inner
            .find_definition_by_hash(kind, reference, owner, content_hash)
            .await
    }

    async fn max_definition_version(
        &self,
        kind: DefinitionKind,
        reference: &str,
        owner: &Owner,
    ) -> Result<Option<u32>> {
        self.inner
            .max_definition_version(kind, reference, owner)
            .await
    }

    async fn list_definitions(
        &self,
        kind: DefinitionKind,
        project_id: Option<&str>,
        library_id: Option<&str>,
    ) -> Result<Vec<Definition>> {
        self.inner.list_definitions(kind, project_id, library_id).await
    }

    async fn list_nodes(&self, def_id: &str, version: u32) -> Result<Vec<Node>> {
        self.inner.list_nodes(def_id, version).await
    }

    async fn list_transitions(&self, def_id: &str, version: u32) -> Result<Vec<Transition>> {
        self.inner.list_transitions(def_id, version).await
    }

    async fn put_run(&self, run: &WorkflowRun) -> Result<()> {
        self.inner.put_run(run).await
    }

    async fn get_run(&self, id: Uuid) -> Result<Option<WorkflowRun>> {
        self.inner.get_run(id).await
    }

    async fn list_runs(&self, filter: &RunFilter) -> Result<(Vec<WorkflowRun>, usize)> {
        self.inner.list_runs(filter).await
    }

    async fn put_conversation(&self, conversation: &Conversation) -> Result<()> {
        self.inner.put_conversation(conversation).await
    }

    async fn get_conversation(&self, id: Uuid) -> Result<Option<Conversation>> {
        self.inner.get_conversation(id).await
    }

    async fn list_conversations(&self) -> Result<Vec<Conversation>> {
        self.inner.list_conversations().await
    }

    async fn put_turn(&self, turn: &Turn) -> Result<()> {
        self.inner.put_turn(turn).await
    }

    async fn get_turn(&self, id: Uuid) -> Result<Option<Turn>> {
        self.inner.get_turn(id).await
    }

    async fn list_turns(&self, conversation_id: Uuid) -> Result<Vec<Turn>> {
        self.inner.list_turns(conversation_id).await
    }

    async fn put_message(&self, message: &Message) -> Result<()> {
        self.inner.put_message(message).await
    }

    async fn list_messages(&self, conversation_id: Uuid) -> Result<Vec<Message>> {
        self.inner.list_messages(conversation_id).await
    }

    async fn append_move(&self, mv: &Move) -> Result<()> {
        self.inner.append_move(mv).await
    }

    async fn list_moves(&self, turn_id: Uuid) -> Result<Vec<Move>> {
        self.inner.list_moves(turn_id).await
    }

    async fn apply(&self, batch: WriteBatch) -> Result<()> {
        self.inner.apply(batch).await
    }

    async fn insert_events(&self, rows: &[WorkflowEvent]) -> Result<()> {
        {
            let mut left = self.failures_left.lock();
            if *left > 0 {
                *left -= 1;
                return Err(Error::StorageUnavailable("injected failure".into()));
            }
        }
        self.inner.insert_events(rows).await
    }

    async fn insert_trace_events(&self, rows: &[TraceEvent]) -> Result<()> {
        self.inner.insert_trace_events(rows).await
    }

    async fn list_events(&self, stream_id: &str) -> Result<Vec<WorkflowEvent>> {
        self.inner.list_events(stream_id).await
    }

    async fn list_trace_events(&self, stream_id: &str) -> Result<Vec<TraceEvent>> {
        self.inner.list_trace_events(stream_id).await
    }

    async fn recent_events(
        &self,
        stream_id: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<WorkflowEvent>> {
        self.inner.recent_events(stream_id, since).await
    }

    async fn load_stream_cursor(&self, stream_id: &str) -> Result<Option<StreamCursor>> {
        self.inner.load_stream_cursor(stream_id).await
    }

    async fn save_stream_cursor(&self, cursor: &StreamCursor) -> Result<()> {
        self.inner.save_stream_cursor(cursor).await
    }

    async fn load_pending_buffer(&self, stream_id: &str) -> Result<PendingBuffer> {
        self.inner.load_pending_buffer(stream_id).await
    }

    async fn save_pending_buffer(&self, stream_id: &str, buffer: &PendingBuffer) -> Result<()> {
        self.inner.save_pending_buffer(stream_id, buffer).await
    }
}

async fn spawn(store: Arc<dyn Store>, cfg: StreamerConfig) -> weft_engine::StreamerHandle {
    Streamer::spawn("s1".into(), ExecutionType::Workflow, None, store, cfg).await
}

#[tokio::test]
async fn transient_failure_retries_and_preserves_order() {
    // One injected failure, two retries allowed: nothing is lost.
    let store: Arc<dyn Store> = Arc::new(FlakyStore::new(1));
    let cfg = StreamerConfig {
        batch_size: 2,
        flush_interval_ms: 20,
        max_retry_attempts: 3,
        ..Default::default()
    };
    let handle = spawn(store.clone(), cfg).await;

    handle.emit(EventInput::new(EventKind::WorkflowStarted));
    handle.emit(EventInput::new(EventKind::TokenCreated));
    // First flush fails, the batch requeues, the timer retries.
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;

    let events = store.list_events("s1").await.unwrap();
    assert_eq!(
        events.iter().map(|e| e.sequence).collect::<Vec<_>>(),
        vec![1, 2]
    );
}

#[tokio::test]
async fn batch_drops_after_max_retries_then_recovers() {
    // Enough injected failures to exhaust every retry of the first batch.
    let store: Arc<dyn Store> = Arc::new(FlakyStore::new(2));
    let cfg = StreamerConfig {
        batch_size: 1,
        flush_interval_ms: 10,
        max_retry_attempts: 2,
        ..Default::default()
    };
    let handle = spawn(store.clone(), cfg).await;

    handle.emit(EventInput::new(EventKind::WorkflowStarted));
    tokio::time::sleep(std::time::Duration::from_millis(150)).await;

    // The first batch was dropped; a later emission persists and the gap
    // documents the drop.
    handle.emit(EventInput::new(EventKind::WorkflowCompleted));
    handle.flush().await;

    let events = store.list_events("s1").await.unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].sequence, 2);
    assert_eq!(events[0].event_type, EventKind::WorkflowCompleted);
}
