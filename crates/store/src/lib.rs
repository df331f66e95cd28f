//! The persistence contract all higher components write through.
//!
//! Implementations may be SQL, KV, or a mix; the trait preserves the table
//! semantics the engine relies on: `(id, version)` uniqueness for
//! definitions, per-stream sequence uniqueness for events, and batched
//! application of one tick's writes.

pub mod memory;

pub use memory::MemoryStore;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use weft_domain::conversation::{Conversation, Message, Move, Turn};
use weft_domain::definition::{Definition, DefinitionKind, Node, Owner, Transition};
use weft_domain::event::WorkflowEvent;
use weft_domain::run::{RunStatus, WorkflowRun};
use weft_domain::trace::TraceEvent;
use weft_domain::Result;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Write batch
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// One row upsert. Every write is an idempotent full-row put.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "table", rename_all = "snake_case")]
pub enum WriteOp {
    Run(WorkflowRun),
    Conversation(Conversation),
    Turn(Turn),
    Message(Message),
    Move(Move),
}

/// All writes of one actor tick, applied together.
#[derive(Debug, Clone, Default)]
pub struct WriteBatch {
    pub ops: Vec<WriteOp>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, op: WriteOp) {
        self.ops.push(op);
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Streamer durability
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Persisted sequence counters for one stream key. Written through on every
/// emission so restarts stay strictly monotonic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamCursor {
    pub stream_id: String,
    pub event_seq: u64,
    pub trace_seq: u64,
}

/// A stream's unflushed write-ahead buffers.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PendingBuffer {
    pub events: Vec<WorkflowEvent>,
    pub traces: Vec<TraceEvent>,
}

impl PendingBuffer {
    pub fn is_empty(&self) -> bool {
        self.events.is_empty() && self.traces.is_empty()
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Run listing
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Default)]
pub struct RunFilter {
    pub status: Option<RunStatus>,
    pub workflow_def_id: Option<String>,
    pub limit: usize,
    pub offset: usize,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Store trait
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[async_trait::async_trait]
pub trait Store: Send + Sync {
    // ── Definitions ──────────────────────────────────────────────────
    /// Persist a definition plus its node/transition rows in one batch.
    async fn put_definition(
        &self,
        def: &Definition,
        nodes: &[Node],
        transitions: &[Transition],
    ) -> Result<()>;

    /// `version = None` returns the latest.
    async fn get_definition(&self, id: &str, version: Option<u32>) -> Result<Option<Definition>>;

    async fn get_definition_by_reference(
        &self,
        kind: DefinitionKind,
        reference: &str,
        owner: &Owner,
    ) -> Result<Option<Definition>>;

    async fn find_definition_by_hash(
        &self,
        kind: DefinitionKind,
        reference: &str,
        owner: &Owner,
        content_hash: &str,
    ) -> Result<Option<Definition>>;

    async fn max_definition_version(
        &self,
        kind: DefinitionKind,
        reference: &str,
        owner: &Owner,
    ) -> Result<Option<u32>>;

    /// Latest version per reference, filtered by owner when given.
    async fn list_definitions(
        &self,
        kind: DefinitionKind,
        project_id: Option<&str>,
        library_id: Option<&str>,
    ) -> Result<Vec<Definition>>;

    async fn list_nodes(&self, def_id: &str, version: u32) -> Result<Vec<Node>>;
    async fn list_transitions(&self, def_id: &str, version: u32) -> Result<Vec<Transition>>;

    // ── Runs ─────────────────────────────────────────────────────────
    async fn put_run(&self, run: &WorkflowRun) -> Result<()>;
    async fn get_run(&self, id: Uuid) -> Result<Option<WorkflowRun>>;
    /// Newest-first page plus total match count.
    async fn list_runs(&self, filter: &RunFilter) -> Result<(Vec<WorkflowRun>, usize)>;

    // ── Conversations ────────────────────────────────────────────────
    async fn put_conversation(&self, conversation: &Conversation) -> Result<()>;
    async fn get_conversation(&self, id: Uuid) -> Result<Option<Conversation>>;
    async fn list_conversations(&self) -> Result<Vec<Conversation>>;
    async fn put_turn(&self, turn: &Turn) -> Result<()>;
    async fn get_turn(&self, id: Uuid) -> Result<Option<Turn>>;
    /// Turns in creation order.
    async fn list_turns(&self, conversation_id: Uuid) -> Result<Vec<Turn>>;
    async fn put_message(&self, message: &Message) -> Result<()>;
    /// Messages in insertion order.
    async fn list_messages(&self, conversation_id: Uuid) -> Result<Vec<Message>>;
    async fn append_move(&self, mv: &Move) -> Result<()>;
    async fn list_moves(&self, turn_id: Uuid) -> Result<Vec<Move>>;

    // ── Batched tick writes ──────────────────────────────────────────
    async fn apply(&self, batch: WriteBatch) -> Result<()>;

    // ── Events & traces ──────────────────────────────────────────────
    async fn insert_events(&self, rows: &[WorkflowEvent]) -> Result<()>;
    async fn insert_trace_events(&self, rows: &[TraceEvent]) -> Result<()>;
    /// Events of a stream in sequence order.
    async fn list_events(&self, stream_id: &str) -> Result<Vec<WorkflowEvent>>;
    async fn list_trace_events(&self, stream_id: &str) -> Result<Vec<TraceEvent>>;
    /// Events of a stream at or after `since`, in sequence order.
    async fn recent_events(
        &self,
        stream_id: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<WorkflowEvent>>;

    // ── Streamer durability ──────────────────────────────────────────
    async fn load_stream_cursor(&self, stream_id: &str) -> Result<Option<StreamCursor>>;
    async fn save_stream_cursor(&self, cursor: &StreamCursor) -> Result<()>;
    async fn load_pending_buffer(&self, stream_id: &str) -> Result<PendingBuffer>;
    async fn save_pending_buffer(&self, stream_id: &str, buffer: &PendingBuffer) -> Result<()>;
}
