//! In-memory store with optional JSONL journaling.
//!
//! Every table lives behind one `RwLock` so a `WriteBatch` applies
//! atomically with respect to readers. When a state path is configured,
//! each write appends a row to `<state>/<table>.jsonl`; on startup the
//! journals replay in order (last write wins for keyed tables), which is
//! what makes streamer sequence counters and unflushed buffers survive a
//! restart.

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;
use uuid::Uuid;

use weft_domain::conversation::{Conversation, Message, Move, Turn};
use weft_domain::definition::{Definition, DefinitionKind, Node, Owner, Transition};
use weft_domain::event::WorkflowEvent;
use weft_domain::run::{RunStatus, WorkflowRun};
use weft_domain::trace::TraceEvent;
use weft_domain::{Error, Result};

use crate::{PendingBuffer, RunFilter, Store, StreamCursor, WriteBatch, WriteOp};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Journal
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Append-only JSONL files per table under the state path.
struct Journal {
    dir: PathBuf,
}

impl Journal {
    fn open(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        Ok(Self {
            dir: dir.to_path_buf(),
        })
    }

    fn append<T: Serialize>(&self, table: &str, row: &T) -> Result<()> {
        let path = self.dir.join(format!("{table}.jsonl"));
        let json = serde_json::to_string(row)?;
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| Error::StorageUnavailable(format!("{}: {e}", path.display())))?;
        writeln!(file, "{json}")
            .map_err(|e| Error::StorageUnavailable(format!("{}: {e}", path.display())))?;
        Ok(())
    }

    fn load<T: DeserializeOwned>(&self, table: &str) -> Vec<T> {
        let path = self.dir.join(format!("{table}.jsonl"));
        let Ok(content) = std::fs::read_to_string(&path) else {
            return Vec::new();
        };
        content
            .lines()
            .filter_map(|line| match serde_json::from_str(line) {
                Ok(row) => Some(row),
                Err(e) => {
                    tracing::warn!(table, error = %e, "skipping corrupt journal line");
                    None
                }
            })
            .collect()
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tables
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
struct DefinitionRow {
    definition: Definition,
    nodes: Vec<Node>,
    transitions: Vec<Transition>,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
struct PendingRow {
    stream_id: String,
    buffer: PendingBuffer,
}

#[derive(Default)]
struct Inner {
    /// (id, version) → row.
    definitions: HashMap<(String, u32), DefinitionRow>,
    runs: HashMap<Uuid, WorkflowRun>,
    /// Insertion order of run ids, oldest first.
    run_order: Vec<Uuid>,
    conversations: HashMap<Uuid, Conversation>,
    turns: HashMap<Uuid, Turn>,
    /// Conversation id → turn ids in creation order.
    turn_order: HashMap<Uuid, Vec<Uuid>>,
    messages: HashMap<Uuid, Vec<Message>>,
    moves: HashMap<Uuid, Vec<Move>>,
    events: HashMap<String, Vec<WorkflowEvent>>,
    traces: HashMap<String, Vec<TraceEvent>>,
    cursors: HashMap<String, StreamCursor>,
    pending: HashMap<String, PendingBuffer>,
}

impl Inner {
    fn put_turn(&mut self, turn: Turn) {
        let order = self.turn_order.entry(turn.conversation_id).or_default();
        if !order.contains(&turn.id) {
            order.push(turn.id);
        }
        self.turns.insert(turn.id, turn);
    }

    fn put_run(&mut self, run: WorkflowRun) {
        if !self.runs.contains_key(&run.id) {
            self.run_order.push(run.id);
        }
        self.runs.insert(run.id, run);
    }
}

/// In-memory implementation of [`Store`], optionally journaled to JSONL.
pub struct MemoryStore {
    inner: RwLock<Inner>,
    journal: Option<Journal>,
}

impl MemoryStore {
    /// Pure in-memory store (tests, ephemeral runs).
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            journal: None,
        }
    }

    /// Journaled store; replays existing journals from `state_path`.
    pub fn open(state_path: &Path) -> Result<Self> {
        let journal = Journal::open(state_path)?;
        let mut inner = Inner::default();

        for row in journal.load::<DefinitionRow>("definitions") {
            inner.definitions.insert(
                (row.definition.id.clone(), row.definition.version),
                row,
            );
        }
        for run in journal.load::<WorkflowRun>("runs") {
            inner.put_run(run);
        }
        for conv in journal.load::<Conversation>("conversations") {
            inner.conversations.insert(conv.id, conv);
        }
        for turn in journal.load::<Turn>("turns") {
            inner.put_turn(turn);
        }
        for msg in journal.load::<Message>("messages") {
            inner.messages.entry(msg.conversation_id).or_default().push(msg);
        }
        for mv in journal.load::<Move>("moves") {
            inner.moves.entry(mv.turn_id).or_default().push(mv);
        }
        for ev in journal.load::<WorkflowEvent>("events") {
            inner.events.entry(ev.stream_id.clone()).or_default().push(ev);
        }
        for tr in journal.load::<TraceEvent>("traces") {
            inner.traces.entry(tr.stream_id.clone()).or_default().push(tr);
        }
        for cursor in journal.load::<StreamCursor>("cursors") {
            inner.cursors.insert(cursor.stream_id.clone(), cursor);
        }
        for row in journal.load::<PendingRow>("pending") {
            inner.pending.insert(row.stream_id, row.buffer);
        }

        let loaded = inner.definitions.len() + inner.runs.len() + inner.conversations.len();
        tracing::info!(
            path = %state_path.display(),
            rows = loaded,
            "store journals replayed"
        );

        Ok(Self {
            inner: RwLock::new(inner),
            journal: Some(journal),
        })
    }

    fn journal_append<T: Serialize>(&self, table: &str, row: &T) -> Result<()> {
        match &self.journal {
            Some(j) => j.append(table, row),
            None => Ok(()),
        }
    }

    fn journal_op(&self, op: &WriteOp) -> Result<()> {
        match op {
            WriteOp::Run(run) => self.journal_append("runs", run),
            WriteOp::Conversation(c) => self.journal_append("conversations", c),
            WriteOp::Turn(t) => self.journal_append("turns", t),
            WriteOp::Message(m) => self.journal_append("messages", m),
            WriteOp::Move(m) => self.journal_append("moves", m),
        }
    }

    fn apply_op(inner: &mut Inner, op: WriteOp) {
        match op {
            WriteOp::Run(run) => inner.put_run(run),
            WriteOp::Conversation(c) => {
                inner.conversations.insert(c.id, c);
            }
            WriteOp::Turn(t) => inner.put_turn(t),
            WriteOp::Message(m) => {
                inner.messages.entry(m.conversation_id).or_default().push(m);
            }
            WriteOp::Move(m) => {
                inner.moves.entry(m.turn_id).or_default().push(m);
            }
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn owner_matches(def: &Definition, owner: &Owner) -> bool {
    match owner {
        Owner::Project(p) => def.project_id.as_deref() == Some(p),
        Owner::Library(l) => def.library_id.as_deref() == Some(l),
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Store impl
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[async_trait::async_trait]
impl Store for MemoryStore {
    async fn put_definition(
        &self,
        def: &Definition,
        nodes: &[Node],
        transitions: &[Transition],
    ) -> Result<()> {
        let row = DefinitionRow {
            definition: def.clone(),
            nodes: nodes.to_vec(),
            transitions: transitions.to_vec(),
        };
        self.journal_append("definitions", &row)?;
        let mut inner = self.inner.write();
        inner
            .definitions
            .insert((def.id.clone(), def.version), row);
        Ok(())
    }

    async fn get_definition(&self, id: &str, version: Option<u32>) -> Result<Option<Definition>> {
        let inner = self.inner.read();
        match version {
            Some(v) => Ok(inner
                .definitions
                .get(&(id.to_string(), v))
                .map(|r| r.definition.clone())),
            None => Ok(inner
                .definitions
                .values()
                .filter(|r| r.definition.id == id)
                .max_by_key(|r| r.definition.version)
                .map(|r| r.definition.clone())),
        }
    }

    async fn get_definition_by_reference(
        &self,
        kind: DefinitionKind,
        reference: &str,
        owner: &Owner,
    ) -> Result<Option<Definition>> {
        let inner = self.inner.read();
        Ok(inner
            .definitions
            .values()
            .map(|r| &r.definition)
            .filter(|d| d.kind == kind && d.reference == reference && owner_matches(d, owner))
            .max_by_key(|d| d.version)
            .cloned())
    }

    async fn find_definition_by_hash(
        &self,
        kind: DefinitionKind,
        reference: &str,
        owner: &Owner,
        content_hash: &str,
    ) -> Result<Option<Definition>> {
        let inner = self.inner.read();
        Ok(inner
            .definitions
            .values()
            .map(|r| &r.definition)
            .filter(|d| {
                d.kind == kind
                    && d.reference == reference
                    && owner_matches(d, owner)
                    && d.content_hash == content_hash
            })
            .max_by_key(|d| d.version)
            .cloned())
    }

    async fn max_definition_version(
        &self,
        kind: DefinitionKind,
        reference: &str,
        owner: &Owner,
    ) -> Result<Option<u32>> {
        let inner = self.inner.read();
        Ok(inner
            .definitions
            .values()
            .map(|r| &r.definition)
            .filter(|d| d.kind == kind && d.reference == reference && owner_matches(d, owner))
            .map(|d| d.version)
            .max())
    }

    async fn list_definitions(
        &self,
        kind: DefinitionKind,
        project_id: Option<&str>,
        library_id: Option<&str>,
    ) -> Result<Vec<Definition>> {
        let inner = self.inner.read();
        let mut latest: HashMap<(String, Option<String>, Option<String>), Definition> =
            HashMap::new();
        for row in inner.definitions.values() {
            let d = &row.definition;
            if d.kind != kind {
                continue;
            }
            if let Some(p) = project_id {
                if d.project_id.as_deref() != Some(p) {
                    continue;
                }
            }
            if let Some(l) = library_id {
                if d.library_id.as_deref() != Some(l) {
                    continue;
                }
            }
            let key = (d.reference.clone(), d.project_id.clone(), d.library_id.clone());
            match latest.get(&key) {
                Some(existing) if existing.version >= d.version => {}
                _ => {
                    latest.insert(key, d.clone());
                }
            }
        }
        let mut out: Vec<Definition> = latest.into_values().collect();
        out.sort_by(|a, b| a.reference.cmp(&b.reference));
        Ok(out)
    }

    async fn list_nodes(&self, def_id: &str, version: u32) -> Result<Vec<Node>> {
        let inner = self.inner.read();
        Ok(inner
            .definitions
            .get(&(def_id.to_string(), version))
            .map(|r| r.nodes.clone())
            .unwrap_or_default())
    }

    async fn list_transitions(&self, def_id: &str, version: u32) -> Result<Vec<Transition>> {
        let inner = self.inner.read();
        Ok(inner
            .definitions
            .get(&(def_id.to_string(), version))
            .map(|r| r.transitions.clone())
            .unwrap_or_default())
    }

    async fn put_run(&self, run: &WorkflowRun) -> Result<()> {
        self.journal_append("runs", run)?;
        self.inner.write().put_run(run.clone());
        Ok(())
    }

    async fn get_run(&self, id: Uuid) -> Result<Option<WorkflowRun>> {
        Ok(self.inner.read().runs.get(&id).cloned())
    }

    async fn list_runs(&self, filter: &RunFilter) -> Result<(Vec<WorkflowRun>, usize)> {
        let inner = self.inner.read();
        let matches = |run: &WorkflowRun| -> bool {
            if let Some(s) = filter.status {
                if run.status != s {
                    return false;
                }
            }
            if let Some(def) = &filter.workflow_def_id {
                if &run.workflow_def_id != def {
                    return false;
                }
            }
            true
        };

        let iter = || {
            inner
                .run_order
                .iter()
                .rev()
                .filter_map(|id| inner.runs.get(id))
                .filter(|r| matches(r))
        };
        let total = iter().count();
        let limit = if filter.limit == 0 { 50 } else { filter.limit };
        let page = iter().skip(filter.offset).take(limit).cloned().collect();
        Ok((page, total))
    }

    async fn put_conversation(&self, conversation: &Conversation) -> Result<()> {
        self.journal_append("conversations", conversation)?;
        self.inner
            .write()
            .conversations
            .insert(conversation.id, conversation.clone());
        Ok(())
    }

    async fn get_conversation(&self, id: Uuid) -> Result<Option<Conversation>> {
        Ok(self.inner.read().conversations.get(&id).cloned())
    }

    async fn list_conversations(&self) -> Result<Vec<Conversation>> {
        let mut all: Vec<Conversation> = self.inner.read().conversations.values().cloned().collect();
        all.sort_by_key(|c| c.created_at);
        Ok(all)
    }

    async fn put_turn(&self, turn: &Turn) -> Result<()> {
        self.journal_append("turns", turn)?;
        self.inner.write().put_turn(turn.clone());
        Ok(())
    }

    async fn get_turn(&self, id: Uuid) -> Result<Option<Turn>> {
        Ok(self.inner.read().turns.get(&id).cloned())
    }

    async fn list_turns(&self, conversation_id: Uuid) -> Result<Vec<Turn>> {
        let inner = self.inner.read();
        Ok(inner
            .turn_order
            .get(&conversation_id)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| inner.turns.get(id))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn put_message(&self, message: &Message) -> Result<()> {
        self.journal_append("messages", message)?;
        self.inner
            .write()
            .messages
            .entry(message.conversation_id)
            .or_default()
            .push(message.clone());
        Ok(())
    }

    async fn list_messages(&self, conversation_id: Uuid) -> Result<Vec<Message>> {
        Ok(self
            .inner
            .read()
            .messages
            .get(&conversation_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn append_move(&self, mv: &Move) -> Result<()> {
        self.journal_append("moves", mv)?;
        self.inner
            .write()
            .moves
            .entry(mv.turn_id)
            .or_default()
            .push(mv.clone());
        Ok(())
    }

    async fn list_moves(&self, turn_id: Uuid) -> Result<Vec<Move>> {
        Ok(self
            .inner
            .read()
            .moves
            .get(&turn_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn apply(&self, batch: WriteBatch) -> Result<()> {
        for op in &batch.ops {
            self.journal_op(op)?;
        }
        let mut inner = self.inner.write();
        for op in batch.ops {
            Self::apply_op(&mut inner, op);
        }
        Ok(())
    }

    async fn insert_events(&self, rows: &[WorkflowEvent]) -> Result<()> {
        let mut inner = self.inner.write();
        for row in rows {
            let stream = inner.events.entry(row.stream_id.clone()).or_default();
            // Idempotent re-insert after a partially-failed flush; a
            // different event at the same sequence is a conflict.
            if let Some(existing) = stream.iter().find(|e| e.sequence == row.sequence) {
                if existing.id == row.id {
                    continue;
                }
                return Err(Error::Conflict(format!(
                    "event sequence {} already exists in stream {}",
                    row.sequence, row.stream_id
                )));
            }
            stream.push(row.clone());
        }
        drop(inner);
        for row in rows {
            self.journal_append("events", row)?;
        }
        Ok(())
    }

    async fn insert_trace_events(&self, rows: &[TraceEvent]) -> Result<()> {
        let mut inner = self.inner.write();
        for row in rows {
            let stream = inner.traces.entry(row.stream_id.clone()).or_default();
            if let Some(existing) = stream.iter().find(|e| e.sequence == row.sequence) {
                if existing.id == row.id {
                    continue;
                }
                return Err(Error::Conflict(format!(
                    "trace sequence {} already exists in stream {}",
                    row.sequence, row.stream_id
                )));
            }
            stream.push(row.clone());
        }
        drop(inner);
        for row in rows {
            self.journal_append("traces", row)?;
        }
        Ok(())
    }

    async fn list_events(&self, stream_id: &str) -> Result<Vec<WorkflowEvent>> {
        let mut events = self
            .inner
            .read()
            .events
            .get(stream_id)
            .cloned()
            .unwrap_or_default();
        events.sort_by_key(|e| e.sequence);
        Ok(events)
    }

    async fn list_trace_events(&self, stream_id: &str) -> Result<Vec<TraceEvent>> {
        let mut traces = self
            .inner
            .read()
            .traces
            .get(stream_id)
            .cloned()
            .unwrap_or_default();
        traces.sort_by_key(|e| e.sequence);
        Ok(traces)
    }

    async fn recent_events(
        &self,
        stream_id: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<WorkflowEvent>> {
        let mut events: Vec<WorkflowEvent> = self
            .inner
            .read()
            .events
            .get(stream_id)
            .map(|rows| rows.iter().filter(|e| e.timestamp >= since).cloned().collect())
            .unwrap_or_default();
        events.sort_by_key(|e| e.sequence);
        Ok(events)
    }

    async fn load_stream_cursor(&self, stream_id: &str) -> Result<Option<StreamCursor>> {
        Ok(self.inner.read().cursors.get(stream_id).cloned())
    }

    async fn save_stream_cursor(&self, cursor: &StreamCursor) -> Result<()> {
        self.journal_append("cursors", cursor)?;
        self.inner
            .write()
            .cursors
            .insert(cursor.stream_id.clone(), cursor.clone());
        Ok(())
    }

    async fn load_pending_buffer(&self, stream_id: &str) -> Result<PendingBuffer> {
        Ok(self
            .inner
            .read()
            .pending
            .get(stream_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn save_pending_buffer(&self, stream_id: &str, buffer: &PendingBuffer) -> Result<()> {
        self.journal_append(
            "pending",
            &PendingRow {
                stream_id: stream_id.to_string(),
                buffer: buffer.clone(),
            },
        )?;
        self.inner
            .write()
            .pending
            .insert(stream_id.to_string(), buffer.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;
    use weft_domain::event::{EventKind, ExecutionType};

    fn definition(id: &str, version: u32, reference: &str, hash: &str) -> Definition {
        Definition {
            id: id.into(),
            version,
            kind: DefinitionKind::Workflow,
            name: reference.into(),
            reference: reference.into(),
            description: None,
            project_id: Some("p1".into()),
            library_id: None,
            content: json!({}),
            content_hash: hash.into(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn event(stream: &str, seq: u64) -> WorkflowEvent {
        WorkflowEvent {
            id: Uuid::new_v4(),
            stream_id: stream.into(),
            execution_id: stream.into(),
            execution_type: ExecutionType::Workflow,
            project_id: None,
            sequence: seq,
            event_type: EventKind::WorkflowStarted,
            timestamp: Utc::now(),
            node_id: None,
            token_id: None,
            metadata: serde_json::Value::Null,
        }
    }

    #[tokio::test]
    async fn definition_versioning() {
        let store = MemoryStore::new();
        let owner = Owner::Project("p1".into());
        store
            .put_definition(&definition("d1", 1, "wf", "h1"), &[], &[])
            .await
            .unwrap();
        store
            .put_definition(&definition("d1", 2, "wf", "h2"), &[], &[])
            .await
            .unwrap();

        let latest = store.get_definition("d1", None).await.unwrap().unwrap();
        assert_eq!(latest.version, 2);
        let v1 = store.get_definition("d1", Some(1)).await.unwrap().unwrap();
        assert_eq!(v1.content_hash, "h1");

        assert_eq!(
            store
                .max_definition_version(DefinitionKind::Workflow, "wf", &owner)
                .await
                .unwrap(),
            Some(2)
        );
        let by_hash = store
            .find_definition_by_hash(DefinitionKind::Workflow, "wf", &owner, "h1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(by_hash.version, 1);
    }

    #[tokio::test]
    async fn list_definitions_latest_per_reference() {
        let store = MemoryStore::new();
        store
            .put_definition(&definition("d1", 1, "a", "h1"), &[], &[])
            .await
            .unwrap();
        store
            .put_definition(&definition("d1", 2, "a", "h2"), &[], &[])
            .await
            .unwrap();
        store
            .put_definition(&definition("d2", 1, "b", "h3"), &[], &[])
            .await
            .unwrap();

        let listed = store
            .list_definitions(DefinitionKind::Workflow, Some("p1"), None)
            .await
            .unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].reference, "a");
        assert_eq!(listed[0].version, 2);
    }

    #[tokio::test]
    async fn event_sequence_uniqueness() {
        let store = MemoryStore::new();
        let e1 = event("s1", 1);
        store.insert_events(&[e1.clone()]).await.unwrap();

        // Same row again: idempotent.
        store.insert_events(&[e1.clone()]).await.unwrap();
        assert_eq!(store.list_events("s1").await.unwrap().len(), 1);

        // Different row at the same sequence: conflict.
        let clash = event("s1", 1);
        assert!(matches!(
            store.insert_events(&[clash]).await,
            Err(Error::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn journal_reload_round_trip() {
        let dir = tempfile::tempdir().unwrap();

        {
            let store = MemoryStore::open(dir.path()).unwrap();
            store
                .put_definition(&definition("d1", 1, "wf", "h1"), &[], &[])
                .await
                .unwrap();
            let run = WorkflowRun::new("d1", 1, json!({}));
            store.put_run(&run).await.unwrap();
            store
                .save_stream_cursor(&StreamCursor {
                    stream_id: run.id.to_string(),
                    event_seq: 9,
                    trace_seq: 4,
                })
                .await
                .unwrap();
            store.insert_events(&[event(&run.id.to_string(), 9)]).await.unwrap();
        }

        let store = MemoryStore::open(dir.path()).unwrap();
        let defs = store
            .list_definitions(DefinitionKind::Workflow, Some("p1"), None)
            .await
            .unwrap();
        assert_eq!(defs.len(), 1);
        let (runs, total) = store.list_runs(&RunFilter::default()).await.unwrap();
        assert_eq!(total, 1);
        let cursor = store
            .load_stream_cursor(&runs[0].id.to_string())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(cursor.event_seq, 9);
        assert_eq!(cursor.trace_seq, 4);
    }

    #[tokio::test]
    async fn cursor_last_write_wins_on_reload() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = MemoryStore::open(dir.path()).unwrap();
            for seq in 1..=3u64 {
                store
                    .save_stream_cursor(&StreamCursor {
                        stream_id: "s1".into(),
                        event_seq: seq,
                        trace_seq: 0,
                    })
                    .await
                    .unwrap();
            }
        }
        let store = MemoryStore::open(dir.path()).unwrap();
        let cursor = store.load_stream_cursor("s1").await.unwrap().unwrap();
        assert_eq!(cursor.event_seq, 3);
    }

    #[tokio::test]
    async fn batch_applies_all_ops() {
        let store = MemoryStore::new();
        let conv = Conversation::new(vec![]);
        let turn = Turn::new(
            conv.id,
            weft_domain::conversation::Caller::User {
                user_id: "u1".into(),
            },
            None,
        );
        let msg = Message::new(
            conv.id,
            turn.id,
            weft_domain::conversation::Role::User,
            "hello",
        );

        let mut batch = WriteBatch::new();
        batch.push(WriteOp::Conversation(conv.clone()));
        batch.push(WriteOp::Turn(turn.clone()));
        batch.push(WriteOp::Message(msg));
        store.apply(batch).await.unwrap();

        assert!(store.get_conversation(conv.id).await.unwrap().is_some());
        assert_eq!(store.list_turns(conv.id).await.unwrap().len(), 1);
        assert_eq!(store.list_messages(conv.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn run_listing_filters_and_pages() {
        let store = MemoryStore::new();
        for i in 0..5 {
            let mut run = WorkflowRun::new(if i % 2 == 0 { "a" } else { "b" }, 1, json!({}));
            if i == 4 {
                run.finish(RunStatus::Completed);
            }
            store.put_run(&run).await.unwrap();
        }

        let (all, total) = store.list_runs(&RunFilter::default()).await.unwrap();
        assert_eq!(total, 5);
        assert_eq!(all.len(), 5);

        let (completed, total) = store
            .list_runs(&RunFilter {
                status: Some(RunStatus::Completed),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(total, 1);
        assert_eq!(completed.len(), 1);

        let (page, total) = store
            .list_runs(&RunFilter {
                workflow_def_id: Some("a".into()),
                limit: 2,
                offset: 2,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(total, 3);
        assert_eq!(page.len(), 1);
    }
}
