//! The engine runtime: service hub wiring the store, definition store, LLM
//! client, executor, streamer registry, and the per-execution actor
//! registries behind the public operations.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use weft_definitions::DefinitionStore;
use weft_domain::config::Config;
use weft_domain::conversation::{Caller, Conversation, Participant};
use weft_domain::definition::{Definition, DefinitionKind, Owner, ToolSpec};
use weft_domain::event::ExecutionType;
use weft_domain::run::WorkflowRun;
use weft_domain::{Error, Result};
use weft_llm::LlmClient;
use weft_store::Store;

use crate::conversation::{self, ConvMsg};
use crate::coordinator::{self, RunMsg};
use crate::dispatch::{OutstandingOps, ReplyTo};
use crate::emitter::Emitter;
use crate::executor::TaskExecutor;
use crate::filter::SubscriberFilter;
use crate::mailbox::Addr;
use crate::streamer::{StreamerRegistry, WirePayload};

/// Parent linkage for a sub-workflow run.
#[derive(Debug, Clone)]
pub struct ParentLink {
    pub parent_run_id: Uuid,
    pub parent_node_id: String,
    pub parent_token_id: Uuid,
}

pub struct Runtime {
    pub store: Arc<dyn Store>,
    pub definitions: DefinitionStore,
    pub llm: Arc<dyn LlmClient>,
    pub executor: Arc<dyn TaskExecutor>,
    pub config: Config,
    pub ops: OutstandingOps,
    streamers: StreamerRegistry,
    runs: Mutex<HashMap<Uuid, Addr<RunMsg>>>,
    conversations: Mutex<HashMap<Uuid, Addr<ConvMsg>>>,
    tools: RwLock<HashMap<String, ToolSpec>>,
}

impl Runtime {
    pub fn new(
        store: Arc<dyn Store>,
        llm: Arc<dyn LlmClient>,
        executor: Arc<dyn TaskExecutor>,
        config: Config,
    ) -> Arc<Self> {
        let mut tools = HashMap::new();
        for spec in &config.tools {
            tools.insert(spec.id.clone(), spec.clone());
        }
        Arc::new(Self {
            definitions: DefinitionStore::new(store.clone()),
            streamers: StreamerRegistry::new(store.clone(), config.streamer.clone()),
            store,
            llm,
            executor,
            config,
            ops: OutstandingOps::default(),
            runs: Mutex::new(HashMap::new()),
            conversations: Mutex::new(HashMap::new()),
            tools: RwLock::new(tools),
        })
    }

    // ── Tools ────────────────────────────────────────────────────────

    pub fn register_tool(&self, spec: ToolSpec) {
        self.tools.write().insert(spec.id.clone(), spec);
    }

    pub fn tool(&self, id: &str) -> Option<ToolSpec> {
        self.tools.read().get(id).cloned()
    }

    pub fn tool_by_name(&self, name: &str) -> Option<ToolSpec> {
        self.tools
            .read()
            .values()
            .find(|t| t.name == name)
            .cloned()
    }

    // ── Streams ──────────────────────────────────────────────────────

    pub async fn emitter_for(
        &self,
        stream_id: &str,
        execution_type: ExecutionType,
        project_id: Option<String>,
    ) -> Emitter {
        let handle = self
            .streamers
            .get_or_spawn(stream_id, execution_type, project_id)
            .await;
        Emitter::new(handle, self.config.streamer.trace_enabled)
    }

    /// Subscribe a transport sink to a stream. The filter's `stream_id`
    /// selects the streamer.
    pub async fn subscribe(
        &self,
        filter: SubscriberFilter,
        events: bool,
        trace: bool,
        history: bool,
        sink: mpsc::Sender<WirePayload>,
    ) -> Result<Uuid> {
        let stream_id = filter
            .stream_id
            .clone()
            .ok_or_else(|| Error::validation("streamId", "subscription requires a stream id"))?;
        let execution_type = self.execution_type_of(&stream_id).await;
        let handle = self
            .streamers
            .get_or_spawn(&stream_id, execution_type, filter.project_id.clone())
            .await;
        handle
            .subscribe(filter, events, trace, history, sink)
            .await
            .ok_or_else(|| Error::Other("streamer unavailable".into()))
    }

    async fn execution_type_of(&self, stream_id: &str) -> ExecutionType {
        if let Ok(id) = stream_id.parse::<Uuid>() {
            if let Ok(Some(_)) = self.store.get_conversation(id).await {
                return ExecutionType::Conversation;
            }
        }
        ExecutionType::Workflow
    }

    /// Drop a live subscription.
    pub fn unsubscribe(&self, stream_id: &str, subscription_id: Uuid) {
        if let Some(handle) = self.streamers.get(stream_id) {
            handle.unsubscribe(subscription_id);
        }
    }

    /// Flush every live streamer (shutdown, tests).
    pub async fn flush_streams(&self) {
        self.streamers.flush_all().await;
    }

    // ── Workflow runs ────────────────────────────────────────────────

    /// Start a top-level workflow run.
    pub async fn start_run(
        self: &Arc<Self>,
        def_id: &str,
        version: Option<u32>,
        input: Value,
    ) -> Result<Uuid> {
        self.start_run_with(def_id, version, input, None, ReplyTo::None)
            .await
    }

    /// Start a run with parent linkage and a completion reply route.
    pub(crate) async fn start_run_with(
        self: &Arc<Self>,
        def_id: &str,
        version: Option<u32>,
        input: Value,
        parent: Option<ParentLink>,
        reply: ReplyTo,
    ) -> Result<Uuid> {
        let definition = self
            .store
            .get_definition(def_id, version)
            .await?
            .ok_or_else(|| Error::NotFound(format!("workflow definition {def_id}")))?;
        if definition.kind != DefinitionKind::Workflow {
            return Err(Error::validation(
                "definition",
                format!("{def_id} is not a workflow"),
            ));
        }
        let content = definition.workflow_content()?;

        if let Some(schema) = &content.input_schema {
            crate::schema::validate(schema, &input, "input")?;
        }

        let mut run = WorkflowRun::new(&definition.id, definition.version, input);
        run.project_id = definition.project_id.clone();
        if let Some(link) = &parent {
            run.parent_run_id = Some(link.parent_run_id);
            run.parent_node_id = Some(link.parent_node_id.clone());
            run.parent_token_id = Some(link.parent_token_id);
        }
        let run_id = run.id;

        let emitter = self
            .emitter_for(&run_id.to_string(), ExecutionType::Workflow, run.project_id.clone())
            .await;

        let addr = coordinator::spawn(self.clone(), content, run, emitter, reply).await?;
        self.runs.lock().insert(run_id, addr);
        Ok(run_id)
    }

    pub async fn get_run(&self, run_id: Uuid) -> Result<WorkflowRun> {
        self.store
            .get_run(run_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("run {run_id}")))
    }

    pub async fn cancel_run(&self, run_id: Uuid) -> Result<()> {
        let addr = self
            .run_addr(run_id)
            .ok_or_else(|| Error::NotFound(format!("run {run_id}")))?;
        let (tx, rx) = oneshot::channel();
        addr.send(RunMsg::Cancel { reply: Some(tx) });
        let _ = rx.await;
        Ok(())
    }

    /// Deliver a completed external task operation (used by out-of-process
    /// executors; the built-in dispatch path routes results directly).
    pub async fn deliver_task_result(
        &self,
        run_id: Uuid,
        token_id: Uuid,
        result: crate::DispatchResult,
    ) -> Result<()> {
        let addr = self
            .run_addr(run_id)
            .ok_or_else(|| Error::NotFound(format!("run {run_id}")))?;
        addr.send(RunMsg::TaskResult { token_id, result });
        Ok(())
    }

    /// Deliver a completed sub-workflow against the parent node's token.
    pub async fn deliver_subworkflow_result(
        &self,
        run_id: Uuid,
        token_id: Uuid,
        result: crate::DispatchResult,
    ) -> Result<()> {
        let addr = self
            .run_addr(run_id)
            .ok_or_else(|| Error::NotFound(format!("run {run_id}")))?;
        addr.send(RunMsg::SubworkflowResult { token_id, result });
        Ok(())
    }

    pub(crate) fn run_addr(&self, run_id: Uuid) -> Option<Addr<RunMsg>> {
        let mut runs = self.runs.lock();
        match runs.get(&run_id) {
            // A terminal actor has dropped its mailbox; prune on access.
            Some(addr) if addr.is_closed() => {
                runs.remove(&run_id);
                None
            }
            Some(addr) => Some(addr.clone()),
            None => None,
        }
    }

    pub(crate) fn remove_run(&self, run_id: Uuid) {
        self.runs.lock().remove(&run_id);
    }

    // ── Conversations ────────────────────────────────────────────────

    /// Create a conversation and spawn its runner actor. The agent
    /// participant's persona is resolved within `owner`.
    pub async fn create_conversation(
        self: &Arc<Self>,
        participants: Vec<Participant>,
        owner: Owner,
    ) -> Result<Uuid> {
        let conversation = Conversation::new(participants);
        let conversation_id = conversation.id;
        let emitter = self
            .emitter_for(
                &conversation_id.to_string(),
                ExecutionType::Conversation,
                owner.project_id().map(str::to_owned),
            )
            .await;

        let addr = conversation::spawn(self.clone(), conversation, owner, emitter).await?;
        self.conversations.lock().insert(conversation_id, addr);
        Ok(conversation_id)
    }

    /// Post a user message; returns the new turn id.
    pub async fn post_user_message(
        &self,
        conversation_id: Uuid,
        content: impl Into<String>,
        delay_ms: Option<u64>,
    ) -> Result<Uuid> {
        let user_id = self
            .store
            .get_conversation(conversation_id)
            .await?
            .and_then(|c| {
                c.participants.iter().find_map(|p| match p {
                    Participant::User { user_id } => Some(user_id.clone()),
                    Participant::Agent { .. } => None,
                })
            })
            .unwrap_or_else(|| "user".into());
        self.post_turn(
            conversation_id,
            Caller::User { user_id },
            content.into(),
            delay_ms,
            None,
        )
        .await
    }

    pub(crate) async fn post_turn(
        &self,
        conversation_id: Uuid,
        caller: Caller,
        content: String,
        delay_ms: Option<u64>,
        on_complete: Option<ReplyTo>,
    ) -> Result<Uuid> {
        let addr = self
            .conv_addr(conversation_id)
            .ok_or_else(|| Error::NotFound(format!("conversation {conversation_id}")))?;
        let (tx, rx) = oneshot::channel();
        addr.send(ConvMsg::PostTurn {
            caller,
            content,
            delay_ms,
            on_complete,
            reply: Some(tx),
        });
        rx.await
            .map_err(|_| Error::Other("conversation actor gone".into()))?
    }

    /// Deliver a tool result to the turn's pending call.
    pub async fn deliver_tool_result(
        &self,
        turn_id: Uuid,
        call_id: &str,
        result: crate::DispatchResult,
    ) -> Result<()> {
        let turn = self
            .store
            .get_turn(turn_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("turn {turn_id}")))?;
        let addr = self
            .conv_addr(turn.conversation_id)
            .ok_or_else(|| Error::NotFound(format!("conversation {}", turn.conversation_id)))?;
        addr.send(ConvMsg::ToolResult {
            turn_id,
            call_id: call_id.to_string(),
            result,
        });
        Ok(())
    }

    /// Deliver an agent-targeted tool's response text to the waiting call.
    pub async fn deliver_agent_response(
        &self,
        turn_id: Uuid,
        call_id: &str,
        content: impl Into<String>,
    ) -> Result<()> {
        self.deliver_tool_result(turn_id, call_id, Ok(Value::String(content.into())))
            .await
    }

    pub async fn cancel_turn(&self, turn_id: Uuid) -> Result<()> {
        let turn = self
            .store
            .get_turn(turn_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("turn {turn_id}")))?;
        let addr = self
            .conv_addr(turn.conversation_id)
            .ok_or_else(|| Error::NotFound(format!("conversation {}", turn.conversation_id)))?;
        let (tx, rx) = oneshot::channel();
        addr.send(ConvMsg::CancelTurn {
            turn_id,
            reply: Some(tx),
        });
        let _ = rx.await;
        Ok(())
    }

    pub async fn cancel_conversation(&self, conversation_id: Uuid) -> Result<()> {
        let addr = self
            .conv_addr(conversation_id)
            .ok_or_else(|| Error::NotFound(format!("conversation {conversation_id}")))?;
        let (tx, rx) = oneshot::channel();
        addr.send(ConvMsg::CancelConversation { reply: Some(tx) });
        let _ = rx.await;
        Ok(())
    }

    pub(crate) fn conv_addr(&self, conversation_id: Uuid) -> Option<Addr<ConvMsg>> {
        let mut conversations = self.conversations.lock();
        match conversations.get(&conversation_id) {
            Some(addr) if addr.is_closed() => {
                conversations.remove(&conversation_id);
                None
            }
            Some(addr) => Some(addr.clone()),
            None => None,
        }
    }

    pub(crate) fn remove_conversation(&self, conversation_id: Uuid) {
        self.conversations.lock().remove(&conversation_id);
    }

    // ── Definition resolution ────────────────────────────────────────

    /// Resolve a definition by id, falling back to reference lookup within
    /// `owner`.
    pub async fn resolve_definition(
        &self,
        kind: DefinitionKind,
        key: &str,
        owner: &Owner,
    ) -> Result<Definition> {
        if let Some(def) = self.store.get_definition(key, None).await? {
            if def.kind == kind {
                return Ok(def);
            }
        }
        self.store
            .get_definition_by_reference(kind, key, owner)
            .await?
            .ok_or_else(|| Error::NotFound(format!("{kind:?} '{key}'")))
    }
}
