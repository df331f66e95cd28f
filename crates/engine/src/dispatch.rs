//! The dispatch layer: translates a planned decision into a call on the
//! executor, a sub-workflow run, or another conversation, records the
//! outstanding operation, and routes the reply back into the owning
//! actor's mailbox.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::{json, Value};
use uuid::Uuid;

use weft_domain::conversation::{Caller, Participant};
use weft_domain::definition::Owner;
use weft_domain::event::{EventInput, EventKind};

use crate::conversation::ConvMsg;
use crate::coordinator::RunMsg;
use crate::emitter::Emitter;
use crate::executor::{TaskExecutor, TaskInvocation};
use crate::mailbox::Addr;
use crate::runtime::{ParentLink, Runtime};
use crate::DispatchResult;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Reply routes
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Where a dispatched operation's result goes. Carried by the spawned task
/// or the child actor; delivery is one mailbox send.
#[derive(Clone)]
pub enum ReplyTo {
    None,
    /// A task result for a workflow token.
    RunTaskToken { addr: Addr<RunMsg>, token_id: Uuid },
    /// A sub-workflow result for the parent node's token.
    RunSubworkflowToken { addr: Addr<RunMsg>, token_id: Uuid },
    /// A tool result for a turn's pending call.
    TurnTool {
        addr: Addr<ConvMsg>,
        turn_id: Uuid,
        call_id: String,
    },
    /// A context-assembly workflow result.
    TurnAssembly { addr: Addr<ConvMsg>, turn_id: Uuid },
    /// A memory-extraction workflow result.
    TurnMemory { addr: Addr<ConvMsg>, turn_id: Uuid },
}

impl ReplyTo {
    pub fn deliver(self, result: DispatchResult) {
        match self {
            Self::None => {}
            Self::RunTaskToken { addr, token_id } => {
                addr.send(RunMsg::TaskResult { token_id, result });
            }
            Self::RunSubworkflowToken { addr, token_id } => {
                addr.send(RunMsg::SubworkflowResult { token_id, result });
            }
            Self::TurnTool {
                addr,
                turn_id,
                call_id,
            } => {
                addr.send(ConvMsg::ToolResult {
                    turn_id,
                    call_id,
                    result,
                });
            }
            Self::TurnAssembly { addr, turn_id } => {
                addr.send(ConvMsg::ContextAssemblyDone { turn_id, result });
            }
            Self::TurnMemory { addr, turn_id } => {
                addr.send(ConvMsg::MemoryExtractionDone { turn_id, result });
            }
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Outstanding operations
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone)]
pub struct OpRecord {
    pub kind: &'static str,
    pub target_id: String,
    pub registered_at: DateTime<Utc>,
}

/// Registry of in-flight dispatches keyed by correlator.
#[derive(Default)]
pub struct OutstandingOps {
    inner: Mutex<HashMap<String, OpRecord>>,
}

impl OutstandingOps {
    pub fn register(&self, correlator: &str, kind: &'static str, target_id: &str) {
        self.inner.lock().insert(
            correlator.to_string(),
            OpRecord {
                kind,
                target_id: target_id.to_string(),
                registered_at: Utc::now(),
            },
        );
    }

    pub fn resolve(&self, correlator: &str) -> Option<OpRecord> {
        self.inner.lock().remove(correlator)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}

/// Correlator for a token-keyed operation.
pub fn token_correlator(run_id: Uuid, token_id: Uuid) -> String {
    format!("token:{run_id}:{token_id}")
}

/// Correlator for a tool-call-keyed operation.
pub fn tool_correlator(turn_id: Uuid, call_id: &str) -> String {
    format!("tool:{turn_id}:{call_id}")
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Dispatchers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Send a task to the executor. The reply lands in the owner's mailbox.
pub fn dispatch_task(
    rt: &Arc<Runtime>,
    emitter: &Emitter,
    correlator: String,
    invocation: TaskInvocation,
    reply: ReplyTo,
) {
    emitter.emit(
        EventInput::new(EventKind::DispatchTaskQueued).with_metadata(json!({
            "task_id": &invocation.task_id,
            "invocation_id": invocation.invocation_id,
            "correlator": &correlator,
        })),
    );
    emitter.dispatch(
        "task",
        json!({ "task_id": &invocation.task_id, "correlator": &correlator }),
    );
    rt.ops.register(&correlator, "task", &invocation.task_id);

    let rt = rt.clone();
    tokio::spawn(async move {
        let result = rt
            .executor
            .execute(invocation)
            .await
            .map_err(|e| e.message);
        rt.ops.resolve(&correlator);
        reply.deliver(result);
    });
}

/// Start a sub-workflow run whose completion is routed to `reply`.
pub async fn dispatch_workflow(
    rt: &Arc<Runtime>,
    emitter: &Emitter,
    correlator: String,
    workflow_id: &str,
    workflow_version: Option<u32>,
    input: Value,
    is_async: bool,
    parent: Option<ParentLink>,
    reply: ReplyTo,
) -> weft_domain::Result<Uuid> {
    emitter.emit(
        EventInput::new(EventKind::DispatchWorkflowQueued).with_metadata(json!({
            "workflow_id": workflow_id,
            "async": is_async,
            "correlator": &correlator,
        })),
    );
    emitter.dispatch(
        "workflow",
        json!({ "workflow_id": workflow_id, "correlator": &correlator }),
    );
    rt.ops.register(&correlator, "workflow", workflow_id);

    match rt
        .start_run_with(workflow_id, workflow_version, input, parent, reply)
        .await
    {
        Ok(run_id) => Ok(run_id),
        Err(e) => {
            rt.ops.resolve(&correlator);
            Err(e)
        }
    }
}

/// Delegate-mode agent dispatch: a fresh, isolated conversation with the
/// target agent; its first agent message resolves the tool call. No history
/// from the calling conversation crosses over.
pub async fn dispatch_agent_delegate(
    rt: &Arc<Runtime>,
    emitter: &Emitter,
    correlator: String,
    target_agent: &str,
    owner: Owner,
    arguments: &Value,
    is_async: bool,
    reply: ReplyTo,
) -> weft_domain::Result<(Uuid, Uuid)> {
    emitter.emit(
        EventInput::new(EventKind::DispatchAgentQueued).with_metadata(json!({
            "agent_id": target_agent,
            "mode": "delegate",
            "async": is_async,
            "correlator": &correlator,
        })),
    );
    emitter.dispatch(
        "agent",
        json!({ "agent_id": target_agent, "mode": "delegate", "correlator": &correlator }),
    );
    rt.ops.register(&correlator, "agent", target_agent);

    let content = match arguments {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };

    let conversation_id = rt
        .create_conversation(
            vec![
                Participant::User {
                    user_id: "delegate".into(),
                },
                Participant::Agent {
                    agent_id: target_agent.to_string(),
                },
            ],
            owner,
        )
        .await?;

    let turn_id = rt
        .post_turn(
            conversation_id,
            Caller::User {
                user_id: "delegate".into(),
            },
            content,
            None,
            Some(reply),
        )
        .await?;

    Ok((conversation_id, turn_id))
}
