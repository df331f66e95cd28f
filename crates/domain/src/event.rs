//! The append-only event log: stable event kinds, stored rows, and emit
//! inputs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Execution type
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionType {
    Workflow,
    Conversation,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Event kinds (stable dotted names)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    // ── Workflow ─────────────────────────────────────────────────────
    #[serde(rename = "workflow.started")]
    WorkflowStarted,
    #[serde(rename = "workflow.completed")]
    WorkflowCompleted,
    #[serde(rename = "workflow.failed")]
    WorkflowFailed,
    #[serde(rename = "token.created")]
    TokenCreated,
    #[serde(rename = "token.completed")]
    TokenCompleted,
    #[serde(rename = "token.failed")]
    TokenFailed,
    #[serde(rename = "token.waiting")]
    TokenWaiting,
    #[serde(rename = "task.dispatched")]
    TaskDispatched,
    #[serde(rename = "task.completed")]
    TaskCompleted,
    #[serde(rename = "task.failed")]
    TaskFailed,
    #[serde(rename = "fan_out.started")]
    FanOutStarted,
    #[serde(rename = "fan_in.completed")]
    FanInCompleted,
    #[serde(rename = "branches.merged")]
    BranchesMerged,
    #[serde(rename = "subworkflow.started")]
    SubworkflowStarted,
    #[serde(rename = "subworkflow.completed")]
    SubworkflowCompleted,
    #[serde(rename = "subworkflow.failed")]
    SubworkflowFailed,
    #[serde(rename = "context.updated")]
    ContextUpdated,
    #[serde(rename = "context.output_applied")]
    ContextOutputApplied,

    // ── Conversation ─────────────────────────────────────────────────
    #[serde(rename = "turn.created")]
    TurnCreated,
    #[serde(rename = "turn.completed")]
    TurnCompleted,
    #[serde(rename = "turn.failed")]
    TurnFailed,
    #[serde(rename = "message.created")]
    MessageCreated,
    #[serde(rename = "tool.dispatched")]
    ToolDispatched,
    #[serde(rename = "dispatch.task.queued")]
    DispatchTaskQueued,
    #[serde(rename = "dispatch.workflow.queued")]
    DispatchWorkflowQueued,
    #[serde(rename = "dispatch.agent.queued")]
    DispatchAgentQueued,
    #[serde(rename = "operation.async.tracked")]
    OperationAsyncTracked,
    #[serde(rename = "operation.async.marked_waiting")]
    OperationAsyncMarkedWaiting,
    #[serde(rename = "operation.async.resumed")]
    OperationAsyncResumed,
    #[serde(rename = "llm.calling")]
    LlmCalling,
    #[serde(rename = "llm.response")]
    LlmResponse,
    #[serde(rename = "context_assembly.dispatched")]
    ContextAssemblyDispatched,
    #[serde(rename = "context_assembly.completed")]
    ContextAssemblyCompleted,
    #[serde(rename = "memory_extraction.dispatched")]
    MemoryExtractionDispatched,
    #[serde(rename = "memory_extraction.completed")]
    MemoryExtractionCompleted,
    #[serde(rename = "move.recorded")]
    MoveRecorded,
    #[serde(rename = "move.result_recorded")]
    MoveResultRecorded,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::WorkflowStarted => "workflow.started",
            Self::WorkflowCompleted => "workflow.completed",
            Self::WorkflowFailed => "workflow.failed",
            Self::TokenCreated => "token.created",
            Self::TokenCompleted => "token.completed",
            Self::TokenFailed => "token.failed",
            Self::TokenWaiting => "token.waiting",
            Self::TaskDispatched => "task.dispatched",
            Self::TaskCompleted => "task.completed",
            Self::TaskFailed => "task.failed",
            Self::FanOutStarted => "fan_out.started",
            Self::FanInCompleted => "fan_in.completed",
            Self::BranchesMerged => "branches.merged",
            Self::SubworkflowStarted => "subworkflow.started",
            Self::SubworkflowCompleted => "subworkflow.completed",
            Self::SubworkflowFailed => "subworkflow.failed",
            Self::ContextUpdated => "context.updated",
            Self::ContextOutputApplied => "context.output_applied",
            Self::TurnCreated => "turn.created",
            Self::TurnCompleted => "turn.completed",
            Self::TurnFailed => "turn.failed",
            Self::MessageCreated => "message.created",
            Self::ToolDispatched => "tool.dispatched",
            Self::DispatchTaskQueued => "dispatch.task.queued",
            Self::DispatchWorkflowQueued => "dispatch.workflow.queued",
            Self::DispatchAgentQueued => "dispatch.agent.queued",
            Self::OperationAsyncTracked => "operation.async.tracked",
            Self::OperationAsyncMarkedWaiting => "operation.async.marked_waiting",
            Self::OperationAsyncResumed => "operation.async.resumed",
            Self::LlmCalling => "llm.calling",
            Self::LlmResponse => "llm.response",
            Self::ContextAssemblyDispatched => "context_assembly.dispatched",
            Self::ContextAssemblyCompleted => "context_assembly.completed",
            Self::MemoryExtractionDispatched => "memory_extraction.dispatched",
            Self::MemoryExtractionCompleted => "memory_extraction.completed",
            Self::MoveRecorded => "move.recorded",
            Self::MoveResultRecorded => "move.result_recorded",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Rows and inputs
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A stored event row. `sequence` is strictly increasing per stream key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowEvent {
    pub id: Uuid,
    pub stream_id: String,
    pub execution_id: String,
    pub execution_type: ExecutionType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    pub sequence: u64,
    pub event_type: EventKind,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_id: Option<Uuid>,
    #[serde(default)]
    pub metadata: Value,
}

/// What a coordinator/runner hands to the emitter; the streamer assigns id,
/// sequence, and timestamp.
#[derive(Debug, Clone)]
pub struct EventInput {
    pub event_type: EventKind,
    pub node_id: Option<String>,
    pub token_id: Option<Uuid>,
    pub metadata: Value,
}

impl EventInput {
    pub fn new(event_type: EventKind) -> Self {
        Self {
            event_type,
            node_id: None,
            token_id: None,
            metadata: Value::Null,
        }
    }

    pub fn with_node(mut self, node_id: impl Into<String>) -> Self {
        self.node_id = Some(node_id.into());
        self
    }

    pub fn with_token(mut self, token_id: Uuid) -> Self {
        self.token_id = Some(token_id);
        self
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = metadata;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_serde_matches_as_str() {
        for kind in [
            EventKind::WorkflowStarted,
            EventKind::FanOutStarted,
            EventKind::OperationAsyncMarkedWaiting,
            EventKind::ContextOutputApplied,
            EventKind::MoveResultRecorded,
            EventKind::DispatchAgentQueued,
        ] {
            let v = serde_json::to_value(kind).unwrap();
            assert_eq!(v, serde_json::json!(kind.as_str()));
            let back: EventKind = serde_json::from_value(v).unwrap();
            assert_eq!(back, kind);
        }
    }

    #[test]
    fn event_input_builder() {
        let token = Uuid::new_v4();
        let input = EventInput::new(EventKind::TokenCreated)
            .with_node("n1")
            .with_token(token)
            .with_metadata(serde_json::json!({ "branch_index": 2 }));
        assert_eq!(input.node_id.as_deref(), Some("n1"));
        assert_eq!(input.token_id, Some(token));
        assert_eq!(input.metadata["branch_index"], 2);
    }
}
