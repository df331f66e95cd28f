//! The Conversation Runner — a per-conversation actor executing agent
//! turns concurrently.
//!
//! Each turn loops over context assembly, an LLM call, and tool dispatch.
//! LLM calls and sub-dispatches are spawned; their results re-enter the
//! mailbox, so a slow tool on one turn never blocks another turn of the
//! same conversation, message order stays a total order under the actor,
//! and turns complete in finish order, not start order.

pub mod turn;

pub use turn::{CancelRoute, PendingCall, Phase, TurnState};

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::{json, Value};
use tokio::sync::oneshot;
use uuid::Uuid;

use weft_domain::conversation::{Caller, Conversation, ConversationStatus, Message, Move, Role, Turn, TurnStatus};
use weft_domain::definition::{DefinitionKind, InvocationMode, Owner, PersonaContent, ToolSpec, ToolTargetType};
use weft_domain::event::EventKind;
use weft_domain::{Error, Result};
use weft_llm::{ChatMessage, ChatRequest, ChatResponse, LlmClient, ToolCall, ToolDefinition};
use weft_store::{Store, WriteBatch, WriteOp};

use crate::dispatch::{self, ReplyTo};
use crate::emitter::Emitter;
use crate::executor::{TaskExecutor, TaskInvocation};
use crate::mailbox::{mailbox, Addr};
use crate::runtime::Runtime;
use crate::DispatchResult;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Messages
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub enum ConvMsg {
    PostTurn {
        caller: Caller,
        content: String,
        delay_ms: Option<u64>,
        on_complete: Option<ReplyTo>,
        reply: Option<oneshot::Sender<Result<Uuid>>>,
    },
    BeginTurn {
        turn_id: Uuid,
    },
    ContextAssemblyDone {
        turn_id: Uuid,
        result: DispatchResult,
    },
    LlmDone {
        turn_id: Uuid,
        result: std::result::Result<ChatResponse, String>,
    },
    ToolResult {
        turn_id: Uuid,
        call_id: String,
        result: DispatchResult,
    },
    MemoryExtractionDone {
        turn_id: Uuid,
        result: DispatchResult,
    },
    CancelTurn {
        turn_id: Uuid,
        reply: Option<oneshot::Sender<()>>,
    },
    CancelConversation {
        reply: Option<oneshot::Sender<()>>,
    },
}

/// Spawn the runner actor for a conversation. Resolves the agent
/// participant's persona within `owner` and persists the conversation row.
///
/// Returns a manually boxed future rather than using `async fn`: a turn can
/// dispatch back into this function (delegate-mode agent calls), and an
/// opaque `impl Future` return type here would make that recursion
/// self-referential, which the compiler cannot resolve when checking the
/// inner `tokio::spawn` task for `Send`.
pub fn spawn(
    rt: Arc<Runtime>,
    conversation: Conversation,
    owner: Owner,
    emitter: Emitter,
) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<Addr<ConvMsg>>> + Send>> {
    Box::pin(async move {
        let agent_id = conversation
            .agent_id()
            .ok_or_else(|| Error::validation("participants", "conversation needs an agent"))?
            .to_string();

        let persona_def = rt
            .resolve_definition(DefinitionKind::Persona, &agent_id, &owner)
            .await?;
        let persona = persona_def.persona_content()?;

        let mut tools: HashMap<String, ToolSpec> = HashMap::new();
        for tool_id in &persona.tool_ids {
            match rt.tool(tool_id) {
                Some(spec) => {
                    tools.insert(spec.name.clone(), spec);
                }
                None => tracing::warn!(tool_id, agent_id, "persona references unknown tool"),
            }
        }

        rt.store.put_conversation(&conversation).await?;

        let (addr, mut rx) = mailbox::<ConvMsg>();
        let mut actor = ConversationRunner {
            rt,
            conversation,
            owner,
            emitter,
            addr: addr.clone(),
            agent_id,
            persona,
            tools,
            turns: HashMap::new(),
        };

        tokio::spawn(async move {
            tracing::debug!(
                conversation_id = %actor.conversation.id,
                agent_id = %actor.agent_id,
                tools = actor.tools.len(),
                "conversation runner ready"
            );
            while let Some(msg) = rx.recv().await {
                actor.handle(msg).await;
            }
        });

        Ok(addr)
    })
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Actor
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct ConversationRunner {
    rt: Arc<Runtime>,
    conversation: Conversation,
    owner: Owner,
    emitter: Emitter,
    addr: Addr<ConvMsg>,
    agent_id: String,
    persona: PersonaContent,
    /// Tool name → spec, restricted to the persona's tool ids.
    tools: HashMap<String, ToolSpec>,
    turns: HashMap<Uuid, TurnState>,
}

impl ConversationRunner {
    async fn handle(&mut self, msg: ConvMsg) {
        match msg {
            ConvMsg::PostTurn {
                caller,
                content,
                delay_ms,
                on_complete,
                reply,
            } => {
                let result = self
                    .create_turn(caller, content, delay_ms, on_complete)
                    .await;
                if let Some(reply) = reply {
                    let _ = reply.send(result);
                }
            }
            ConvMsg::BeginTurn { turn_id } => self.begin_turn(turn_id).await,
            ConvMsg::ContextAssemblyDone { turn_id, result } => {
                self.on_assembly_done(turn_id, result).await;
            }
            ConvMsg::LlmDone { turn_id, result } => self.on_llm_done(turn_id, result).await,
            ConvMsg::ToolResult {
                turn_id,
                call_id,
                result,
            } => self.on_tool_result(turn_id, &call_id, result).await,
            ConvMsg::MemoryExtractionDone { turn_id, result } => {
                self.on_memory_done(turn_id, result).await;
            }
            ConvMsg::CancelTurn { turn_id, reply } => {
                self.fail_turn(turn_id, "cancelled".into(), "cancelled").await;
                if let Some(reply) = reply {
                    let _ = reply.send(());
                }
            }
            ConvMsg::CancelConversation { reply } => {
                self.on_cancel_conversation().await;
                if let Some(reply) = reply {
                    let _ = reply.send(());
                }
            }
        }
    }

    // ── Turn creation ────────────────────────────────────────────────

    async fn create_turn(
        &mut self,
        caller: Caller,
        content: String,
        delay_ms: Option<u64>,
        on_complete: Option<ReplyTo>,
    ) -> Result<Uuid> {
        let mut turn = Turn::new(
            self.conversation.id,
            caller.clone(),
            Some(Value::String(content.clone())),
        );
        turn.created_at = Utc::now();
        let turn_id = turn.id;

        let message = Message::new(self.conversation.id, turn_id, Role::User, &content);
        let message_id = message.id;

        let mut batch = WriteBatch::new();
        batch.push(WriteOp::Turn(turn.clone()));
        batch.push(WriteOp::Message(message));
        self.rt.store.apply(batch).await?;

        self.emitter.event(
            EventKind::TurnCreated,
            json!({ "turn_id": turn_id, "caller": caller }),
        );
        self.emitter.event(
            EventKind::MessageCreated,
            json!({ "turn_id": turn_id, "message_id": message_id, "role": "user" }),
        );

        self.turns
            .insert(turn_id, TurnState::new(turn, content, on_complete));

        match delay_ms {
            Some(ms) if ms > 0 => {
                let addr = self.addr.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_millis(ms)).await;
                    addr.send(ConvMsg::BeginTurn { turn_id });
                });
            }
            _ => self.begin_turn(turn_id).await,
        }

        Ok(turn_id)
    }

    // ── Context assembly ─────────────────────────────────────────────

    async fn begin_turn(&mut self, turn_id: Uuid) {
        let Some(state) = self.turns.get_mut(&turn_id) else {
            return;
        };
        if state.phase == Phase::Done {
            return;
        }
        state.phase = Phase::Assembling;
        state.loop_exited = false;

        let assembly_ref = self.persona.context_assembly_workflow_ref.clone();
        if let Some(wf_ref) = assembly_ref {
            match self.dispatch_assembly(turn_id, &wf_ref).await {
                Ok(run_id) => {
                    if let Some(state) = self.turns.get_mut(&turn_id) {
                        state.turn.context_assembly_run_id = Some(run_id);
                    }
                    self.persist_turn(turn_id).await;
                    return;
                }
                Err(e) => {
                    tracing::warn!(
                        %turn_id,
                        error = %e,
                        "context assembly dispatch failed, assembling inline"
                    );
                }
            }
        }

        // Inline assembly: recent completed turns form the base context.
        self.emitter.event(
            EventKind::ContextAssemblyDispatched,
            json!({ "turn_id": turn_id, "inline": true }),
        );
        let base = self.recent_turn_messages(turn_id).await;
        self.emitter.event(
            EventKind::ContextAssemblyCompleted,
            json!({ "turn_id": turn_id, "inline": true }),
        );
        if let Some(state) = self.turns.get_mut(&turn_id) {
            state.assembled_base = base;
        }
        self.call_llm(turn_id);
    }

    async fn dispatch_assembly(&mut self, turn_id: Uuid, wf_ref: &str) -> Result<Uuid> {
        let def = self
            .rt
            .resolve_definition(DefinitionKind::Workflow, wf_ref, &self.owner)
            .await?;
        let input = self.assembly_input(turn_id).await;

        self.emitter.event(
            EventKind::ContextAssemblyDispatched,
            json!({ "turn_id": turn_id, "workflow_id": &def.id }),
        );
        dispatch::dispatch_workflow(
            &self.rt,
            &self.emitter,
            format!("assembly:{turn_id}"),
            &def.id,
            Some(def.version),
            input,
            false,
            None,
            ReplyTo::TurnAssembly {
                addr: self.addr.clone(),
                turn_id,
            },
        )
        .await
    }

    async fn assembly_input(&self, turn_id: Uuid) -> Value {
        let recent = self.recent_turn_messages(turn_id).await;
        let recent_json: Vec<Value> = recent
            .iter()
            .map(|m| json!({ "role": m.role, "content": &m.content }))
            .collect();
        let state = self.turns.get(&turn_id);
        json!({
            "conversation_id": self.conversation.id,
            "user_message": state.map(|s| s.user_content.clone()),
            "recent_turns": recent_json,
            "model_profile_id": &self.persona.model_profile_ref,
            "tool_ids": &self.persona.tool_ids,
            "tool_definitions": self.tool_definitions(),
        })
    }

    /// Messages of the last N completed turns, oldest first.
    async fn recent_turn_messages(&self, exclude_turn: Uuid) -> Vec<ChatMessage> {
        let limit = self.persona.recent_turns_limit;
        let turns = self
            .rt
            .store
            .list_turns(self.conversation.id)
            .await
            .unwrap_or_default();
        let recent: Vec<Uuid> = turns
            .iter()
            .filter(|t| t.status == TurnStatus::Completed && t.id != exclude_turn)
            .rev()
            .take(limit)
            .map(|t| t.id)
            .collect();
        let messages = self
            .rt
            .store
            .list_messages(self.conversation.id)
            .await
            .unwrap_or_default();
        messages
            .iter()
            .filter(|m| recent.contains(&m.turn_id))
            .map(|m| match m.role {
                Role::User => ChatMessage::user(&m.content),
                Role::Agent => ChatMessage::assistant(&m.content),
            })
            .collect()
    }

    async fn on_assembly_done(&mut self, turn_id: Uuid, result: DispatchResult) {
        let Some(state) = self.turns.get_mut(&turn_id) else {
            return;
        };
        if state.phase == Phase::Done {
            return;
        }

        match result {
            Ok(output) => {
                self.emitter.event(
                    EventKind::ContextAssemblyCompleted,
                    json!({ "turn_id": turn_id }),
                );
                let llm_request = output.get("llm_request").cloned().unwrap_or(Value::Null);
                if let Some(system) = llm_request.get("system_prompt").and_then(Value::as_str) {
                    state.assembled_system = Some(system.to_string());
                }
                if let Some(messages) = llm_request.get("messages").and_then(Value::as_array) {
                    state.assembled_base = messages
                        .iter()
                        .filter_map(|m| {
                            let content = m.get("content")?.as_str()?.to_string();
                            match m.get("role").and_then(Value::as_str) {
                                Some("assistant" | "agent") => {
                                    Some(ChatMessage::assistant(content))
                                }
                                Some("system") => Some(ChatMessage::system(content)),
                                _ => Some(ChatMessage::user(content)),
                            }
                        })
                        .collect();
                }
            }
            Err(e) => {
                // Assembly failure degrades to inline context.
                tracing::warn!(%turn_id, error = %e, "context assembly workflow failed");
                self.emitter.event(
                    EventKind::ContextAssemblyCompleted,
                    json!({ "turn_id": turn_id, "error": e }),
                );
                let base = self.recent_turn_messages(turn_id).await;
                if let Some(state) = self.turns.get_mut(&turn_id) {
                    state.assembled_base = base;
                }
            }
        }
        self.call_llm(turn_id);
    }

    // ── LLM loop ─────────────────────────────────────────────────────

    fn build_request(&self, state: &TurnState) -> ChatRequest {
        let system = state
            .assembled_system
            .clone()
            .unwrap_or_else(|| self.persona.system_prompt.clone());
        let mut messages = vec![ChatMessage::system(system)];
        messages.extend(state.assembled_base.iter().cloned());
        messages.extend(state.history.iter().cloned());
        ChatRequest {
            messages,
            tools: self.tool_definitions(),
            model: self.persona.model_profile_ref.clone(),
            temperature: None,
            max_tokens: None,
        }
    }

    fn tool_definitions(&self) -> Vec<ToolDefinition> {
        let mut defs: Vec<ToolDefinition> = self
            .tools
            .values()
            .map(|t| ToolDefinition {
                name: t.name.clone(),
                description: t.description.clone(),
                input_schema: t.input_schema.clone(),
            })
            .collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }

    fn call_llm(&mut self, turn_id: Uuid) {
        let Some(state) = self.turns.get_mut(&turn_id) else {
            return;
        };
        state.phase = Phase::Calling;
        let Some(state) = self.turns.get(&turn_id) else {
            return;
        };
        let req = self.build_request(state);

        self.emitter.event(
            EventKind::LlmCalling,
            json!({
                "turn_id": turn_id,
                "move": self.turns.get(&turn_id).map(|s| s.move_count + 1),
            }),
        );

        let llm = self.rt.llm.clone();
        let timeout = Duration::from_millis(self.rt.config.conversation.llm_timeout_ms);
        let addr = self.addr.clone();
        tokio::spawn(async move {
            let result = match tokio::time::timeout(timeout, llm.chat(&req)).await {
                Ok(Ok(resp)) => Ok(resp),
                Ok(Err(e)) => Err(e.to_string()),
                Err(_) => Err("llm call timed out".into()),
            };
            addr.send(ConvMsg::LlmDone { turn_id, result });
        });
    }

    async fn on_llm_done(
        &mut self,
        turn_id: Uuid,
        result: std::result::Result<ChatResponse, String>,
    ) {
        let Some(state) = self.turns.get(&turn_id) else {
            return;
        };
        if state.phase == Phase::Done {
            return;
        }

        let resp = match result {
            Ok(resp) => resp,
            Err(e) => {
                self.fail_turn(turn_id, e, "llm_failure").await;
                return;
            }
        };

        let move_count = match self.turns.get_mut(&turn_id) {
            Some(state) => {
                state.move_count += 1;
                state.move_count
            }
            None => return,
        };

        let mv = Move {
            turn_id,
            has_reasoning: resp.has_reasoning,
            has_tool_call: !resp.tool_calls.is_empty(),
            tool_call_id: None,
            tool_result: None,
            recorded_at: Utc::now(),
        };
        if let Err(e) = self.rt.store.append_move(&mv).await {
            tracing::warn!(%turn_id, error = %e, "move append failed");
        }
        self.emitter.event(
            EventKind::MoveRecorded,
            json!({ "turn_id": turn_id, "move": move_count, "has_tool_call": !resp.tool_calls.is_empty() }),
        );
        self.emitter.event(
            EventKind::LlmResponse,
            json!({
                "turn_id": turn_id,
                "tool_call_count": resp.tool_calls.len(),
                "has_text": resp.has_text(),
            }),
        );

        // Record the assistant message in history (with any tool calls)
        // and append agent text to the conversation log.
        if let Some(state) = self.turns.get_mut(&turn_id) {
            state.history.push(ChatMessage::assistant_tool_calls(
                resp.content.clone(),
                resp.tool_calls.clone(),
            ));
            if resp.has_text() {
                state.final_text = Some(resp.content.clone());
            }
        }
        if resp.has_text() {
            let message = Message::new(
                self.conversation.id,
                turn_id,
                Role::Agent,
                resp.content.clone(),
            );
            let message_id = message.id;
            if let Err(e) = self.rt.store.put_message(&message).await {
                tracing::warn!(%turn_id, error = %e, "agent message write failed");
            }
            self.emitter.event(
                EventKind::MessageCreated,
                json!({ "turn_id": turn_id, "message_id": message_id, "role": "agent" }),
            );
        }

        if resp.tool_calls.is_empty() {
            // Terminal: the loop exits; completion still gates on
            // pending-async reaching zero.
            if let Some(state) = self.turns.get_mut(&turn_id) {
                state.loop_exited = true;
                state.phase = Phase::Exited;
            }
            self.maybe_complete(turn_id).await;
            return;
        }

        if move_count >= self.rt.config.conversation.max_moves {
            self.fail_turn(
                turn_id,
                format!(
                    "move limit reached ({} iterations)",
                    self.rt.config.conversation.max_moves
                ),
                "move_limit",
            )
            .await;
            return;
        }

        let mut any_sync = false;
        for call in resp.tool_calls {
            if self.handle_tool_call(turn_id, call).await {
                any_sync = true;
            }
        }

        if any_sync {
            if let Some(state) = self.turns.get_mut(&turn_id) {
                state.phase = Phase::Parked;
            }
        } else {
            // Only async dispatches: the loop continues immediately; the
            // model is expected to acknowledge now and follow up later.
            self.call_llm(turn_id);
        }
    }

    // ── Tool dispatch ────────────────────────────────────────────────

    /// Dispatch one tool call. Returns true when the call is sync (the
    /// loop must park on its result).
    async fn handle_tool_call(&mut self, turn_id: Uuid, call: ToolCall) -> bool {
        let Some(tool) = self.tools.get(&call.tool_name).cloned() else {
            self.tool_error(
                turn_id,
                &call.call_id,
                format!("unknown tool '{}'", call.tool_name),
            )
            .await;
            return false;
        };

        self.emitter.event(
            EventKind::ToolDispatched,
            json!({
                "turn_id": turn_id,
                "tool_call_id": &call.call_id,
                "tool": &tool.name,
                "target_type": tool.target_type,
                "async": tool.is_async,
            }),
        );

        let pending_now = {
            let Some(state) = self.turns.get_mut(&turn_id) else {
                return false;
            };
            state.turn.pending_async += 1;
            state.turn.pending_async
        };
        self.emitter.event(
            EventKind::OperationAsyncTracked,
            json!({ "turn_id": turn_id, "tool_call_id": &call.call_id, "pending": pending_now }),
        );
        self.persist_turn(turn_id).await;

        let reply = ReplyTo::TurnTool {
            addr: self.addr.clone(),
            turn_id,
            call_id: call.call_id.clone(),
        };

        let cancel = match tool.target_type {
            ToolTargetType::Task => {
                match self
                    .rt
                    .resolve_definition(DefinitionKind::Task, &tool.target_id, &self.owner)
                    .await
                {
                    Ok(task_def) => {
                        let invocation = TaskInvocation {
                            invocation_id: Uuid::new_v4(),
                            task_id: task_def.id.clone(),
                            task_version: Some(task_def.version),
                            input: call.arguments.clone(),
                            resource_bindings: Default::default(),
                        };
                        let invocation_id = invocation.invocation_id;
                        dispatch::dispatch_task(
                            &self.rt,
                            &self.emitter,
                            dispatch::tool_correlator(turn_id, &call.call_id),
                            invocation,
                            reply,
                        );
                        CancelRoute::Invocation(invocation_id)
                    }
                    Err(e) => {
                        self.deliver_local_tool_failure(turn_id, &call.call_id, e.to_string())
                            .await;
                        return false;
                    }
                }
            }
            ToolTargetType::Workflow => {
                let target = self
                    .rt
                    .resolve_definition(DefinitionKind::Workflow, &tool.target_id, &self.owner)
                    .await;
                match target {
                    Ok(def) => {
                        match dispatch::dispatch_workflow(
                            &self.rt,
                            &self.emitter,
                            dispatch::tool_correlator(turn_id, &call.call_id),
                            &def.id,
                            Some(def.version),
                            call.arguments.clone(),
                            tool.is_async,
                            None,
                            reply,
                        )
                        .await
                        {
                            Ok(run_id) => CancelRoute::Run(run_id),
                            Err(e) => {
                                self.deliver_local_tool_failure(
                                    turn_id,
                                    &call.call_id,
                                    e.to_string(),
                                )
                                .await;
                                return false;
                            }
                        }
                    }
                    Err(e) => {
                        self.deliver_local_tool_failure(turn_id, &call.call_id, e.to_string())
                            .await;
                        return false;
                    }
                }
            }
            ToolTargetType::Agent => {
                let mode = tool.invocation_mode.unwrap_or(InvocationMode::Delegate);
                match mode {
                    InvocationMode::Delegate => {
                        match dispatch::dispatch_agent_delegate(
                            &self.rt,
                            &self.emitter,
                            dispatch::tool_correlator(turn_id, &call.call_id),
                            &tool.target_id,
                            self.owner.clone(),
                            &call.arguments,
                            tool.is_async,
                            reply,
                        )
                        .await
                        {
                            Ok((conversation_id, _child_turn)) => {
                                CancelRoute::DelegateConversation { conversation_id }
                            }
                            Err(e) => {
                                self.deliver_local_tool_failure(
                                    turn_id,
                                    &call.call_id,
                                    e.to_string(),
                                )
                                .await;
                                return false;
                            }
                        }
                    }
                    InvocationMode::LoopIn => {
                        self.emitter.event(
                            EventKind::DispatchAgentQueued,
                            json!({
                                "agent_id": &tool.target_id,
                                "mode": "loop_in",
                                "async": tool.is_async,
                                "tool_call_id": &call.call_id,
                            }),
                        );
                        let content = match &call.arguments {
                            Value::String(s) => s.clone(),
                            other => other.to_string(),
                        };
                        match self
                            .create_turn(
                                Caller::AgentTurn {
                                    parent_turn_id: turn_id,
                                },
                                content,
                                None,
                                Some(reply),
                            )
                            .await
                        {
                            Ok(child_turn) => CancelRoute::LoopInTurn(child_turn),
                            Err(e) => {
                                self.deliver_local_tool_failure(
                                    turn_id,
                                    &call.call_id,
                                    e.to_string(),
                                )
                                .await;
                                return false;
                            }
                        }
                    }
                }
            }
        };

        if let Some(state) = self.turns.get_mut(&turn_id) {
            state.pending.insert(
                call.call_id.clone(),
                PendingCall {
                    tool_name: tool.name.clone(),
                    cancel,
                },
            );
            if !tool.is_async {
                state.sync_waiting.insert(call.call_id.clone());
            }
        }
        if !tool.is_async {
            self.emitter.event(
                EventKind::OperationAsyncMarkedWaiting,
                json!({ "turn_id": turn_id, "tool_call_id": call.call_id }),
            );
            return true;
        }
        false
    }

    /// A tool that never dispatched: undo the tracking and record the
    /// failure as this call's result.
    async fn deliver_local_tool_failure(&mut self, turn_id: Uuid, call_id: &str, error: String) {
        if let Some(state) = self.turns.get_mut(&turn_id) {
            state.turn.pending_async = state.turn.pending_async.saturating_sub(1);
        }
        self.tool_error(turn_id, call_id, error).await;
    }

    async fn tool_error(&mut self, turn_id: Uuid, call_id: &str, error: String) {
        if let Some(state) = self.turns.get_mut(&turn_id) {
            state.turn.tool_failure_count += 1;
            state
                .history
                .push(ChatMessage::tool_result(call_id, format!("error: {error}")));
        }
        self.emitter.trace(weft_domain::trace::TraceInput::Debug {
            message: "tool call failed before dispatch".into(),
            payload: json!({ "turn_id": turn_id, "tool_call_id": call_id, "error": error }),
        });
        self.persist_turn(turn_id).await;
    }

    // ── Tool results ─────────────────────────────────────────────────

    async fn on_tool_result(&mut self, turn_id: Uuid, call_id: &str, result: DispatchResult) {
        let Some(state) = self.turns.get_mut(&turn_id) else {
            return;
        };
        if state.phase == Phase::Done {
            tracing::debug!(%turn_id, call_id, "tool result for settled turn");
            return;
        }
        if state.pending.remove(call_id).is_none() {
            tracing::debug!(%turn_id, call_id, "tool result for unknown call");
            return;
        }
        state.turn.pending_async = state.turn.pending_async.saturating_sub(1);
        let pending_now = state.turn.pending_async;

        let (content, result_value, failed) = match result {
            Ok(value) => (
                match &value {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                },
                value,
                false,
            ),
            Err(e) => {
                state.turn.tool_failure_count += 1;
                (format!("error: {e}"), json!({ "error": e }), true)
            }
        };

        let mv = Move {
            turn_id,
            has_reasoning: false,
            has_tool_call: false,
            tool_call_id: Some(call_id.to_string()),
            tool_result: Some(result_value),
            recorded_at: Utc::now(),
        };
        if let Err(e) = self.rt.store.append_move(&mv).await {
            tracing::warn!(%turn_id, error = %e, "move append failed");
        }
        self.emitter.event(
            EventKind::MoveResultRecorded,
            json!({ "turn_id": turn_id, "tool_call_id": call_id, "is_error": failed }),
        );
        self.emitter.event(
            EventKind::OperationAsyncResumed,
            json!({ "turn_id": turn_id, "tool_call_id": call_id, "pending": pending_now }),
        );

        let Some(state) = self.turns.get_mut(&turn_id) else {
            return;
        };
        state
            .history
            .push(ChatMessage::tool_result(call_id, content));
        let was_sync = state.sync_waiting.remove(call_id);
        let resume_parked = was_sync && state.sync_waiting.is_empty() && state.phase == Phase::Parked;
        let reenter_exited = !was_sync && state.loop_exited;
        self.persist_turn(turn_id).await;

        if resume_parked {
            // Within-loop continuation: straight to the next LLM call.
            self.call_llm(turn_id);
        } else if reenter_exited {
            // An async result after the loop exited re-enters the loop
            // from context assembly with the accumulated history.
            self.begin_turn(turn_id).await;
        } else {
            self.maybe_complete(turn_id).await;
        }
    }

    // ── Completion ───────────────────────────────────────────────────

    async fn maybe_complete(&mut self, turn_id: Uuid) {
        let ready = self
            .turns
            .get(&turn_id)
            .map(|s| {
                s.loop_exited
                    && s.turn.pending_async == 0
                    && s.turn.status == TurnStatus::Active
            })
            .unwrap_or(false);
        if !ready {
            return;
        }

        // Memory extraction is fire-and-forget: dispatched before the turn
        // completes, but its outcome never gates or fails the turn.
        let memory_ref = self.persona.memory_extraction_workflow_ref.clone();
        if let Some(wf_ref) = memory_ref {
            match self.dispatch_memory_extraction(turn_id, &wf_ref).await {
                Ok(run_id) => {
                    if let Some(state) = self.turns.get_mut(&turn_id) {
                        state.turn.memory_extraction_run_id = Some(run_id);
                    }
                }
                Err(e) => {
                    tracing::warn!(%turn_id, error = %e, "memory extraction dispatch failed");
                    if let Some(state) = self.turns.get_mut(&turn_id) {
                        state.turn.memory_extraction_failed = true;
                    }
                    self.emitter.event(
                        EventKind::MemoryExtractionCompleted,
                        json!({ "turn_id": turn_id, "error": e.to_string() }),
                    );
                }
            }
        }

        let final_text = match self.turns.get_mut(&turn_id) {
            Some(state) => {
                state.turn.status = TurnStatus::Completed;
                state.turn.completed_at = Some(Utc::now());
                state.phase = Phase::Done;
                state.final_text.clone().unwrap_or_default()
            }
            None => return,
        };
        self.persist_turn(turn_id).await;
        self.emitter
            .event(EventKind::TurnCompleted, json!({ "turn_id": turn_id }));
        tracing::info!(
            conversation_id = %self.conversation.id,
            %turn_id,
            "turn completed"
        );

        if let Some(reply) = self
            .turns
            .get_mut(&turn_id)
            .and_then(|s| s.on_complete.take())
        {
            reply.deliver(Ok(Value::String(final_text)));
        }
    }

    async fn dispatch_memory_extraction(&mut self, turn_id: Uuid, wf_ref: &str) -> Result<Uuid> {
        let def = self
            .rt
            .resolve_definition(DefinitionKind::Workflow, wf_ref, &self.owner)
            .await?;
        let transcript: Vec<Value> = self
            .turns
            .get(&turn_id)
            .map(|s| {
                s.history
                    .iter()
                    .map(|m| json!({ "role": m.role, "content": &m.content }))
                    .collect()
            })
            .unwrap_or_default();

        self.emitter.event(
            EventKind::MemoryExtractionDispatched,
            json!({ "turn_id": turn_id, "workflow_id": &def.id }),
        );
        dispatch::dispatch_workflow(
            &self.rt,
            &self.emitter,
            format!("memory:{turn_id}"),
            &def.id,
            Some(def.version),
            json!({
                "conversation_id": self.conversation.id,
                "turn_id": turn_id,
                "transcript": transcript,
            }),
            true,
            None,
            ReplyTo::TurnMemory {
                addr: self.addr.clone(),
                turn_id,
            },
        )
        .await
    }

    async fn on_memory_done(&mut self, turn_id: Uuid, result: DispatchResult) {
        match result {
            Ok(_) => {
                self.emitter.event(
                    EventKind::MemoryExtractionCompleted,
                    json!({ "turn_id": turn_id }),
                );
            }
            Err(e) => {
                // Non-fatal by contract: flag the turn, nothing else.
                if let Some(state) = self.turns.get_mut(&turn_id) {
                    state.turn.memory_extraction_failed = true;
                }
                self.persist_turn(turn_id).await;
                self.emitter.event(
                    EventKind::MemoryExtractionCompleted,
                    json!({ "turn_id": turn_id, "error": e }),
                );
            }
        }
    }

    // ── Failure & cancellation ───────────────────────────────────────

    async fn fail_turn(&mut self, turn_id: Uuid, error: String, reason: &str) {
        let Some(state) = self.turns.get_mut(&turn_id) else {
            return;
        };
        if state.turn.status.is_terminal() {
            return;
        }
        state.turn.status = TurnStatus::Failed;
        state.turn.error = Some(error.clone());
        state.phase = Phase::Done;
        let pending: Vec<PendingCall> = state.pending.drain().map(|(_, c)| c).collect();
        state.sync_waiting.clear();
        let reply = state.on_complete.take();

        for call in pending {
            self.cancel_route(call.cancel).await;
        }
        self.persist_turn(turn_id).await;
        self.emitter.event(
            EventKind::TurnFailed,
            json!({ "turn_id": turn_id, "reason": reason, "error": &error }),
        );
        tracing::warn!(
            conversation_id = %self.conversation.id,
            %turn_id,
            reason,
            error = %error,
            "turn failed"
        );

        if let Some(reply) = reply {
            reply.deliver(Err(error));
        }
    }

    async fn cancel_route(&mut self, route: CancelRoute) {
        match route {
            CancelRoute::Invocation(id) => self.rt.executor.cancel(id).await,
            CancelRoute::Run(id) => {
                let _ = self.rt.cancel_run(id).await;
            }
            CancelRoute::DelegateConversation { conversation_id } => {
                let _ = self.rt.cancel_conversation(conversation_id).await;
            }
            CancelRoute::LoopInTurn(child_turn) => {
                // Same actor: cancel in a later tick to avoid re-entrancy.
                self.addr.send(ConvMsg::CancelTurn {
                    turn_id: child_turn,
                    reply: None,
                });
            }
            CancelRoute::None => {}
        }
    }

    async fn on_cancel_conversation(&mut self) {
        let active: Vec<Uuid> = self
            .turns
            .iter()
            .filter(|(_, s)| !s.turn.status.is_terminal())
            .map(|(id, _)| *id)
            .collect();
        for turn_id in active {
            self.fail_turn(turn_id, "cancelled".into(), "cancelled").await;
        }
        self.conversation.status = ConversationStatus::Failed;
        if let Err(e) = self.rt.store.put_conversation(&self.conversation).await {
            tracing::warn!(conversation_id = %self.conversation.id, error = %e, "conversation write failed");
        }
        self.rt.remove_conversation(self.conversation.id);
    }

    // ── Persistence ──────────────────────────────────────────────────

    async fn persist_turn(&self, turn_id: Uuid) {
        if let Some(state) = self.turns.get(&turn_id) {
            if let Err(e) = self.rt.store.put_turn(&state.turn).await {
                tracing::warn!(%turn_id, error = %e, "turn write failed");
            }
        }
    }
}
