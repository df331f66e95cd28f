//! Conversations, turns, messages, and moves.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Conversation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Participant {
    User { user_id: String },
    Agent { agent_id: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationStatus {
    Active,
    Waiting,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: Uuid,
    pub participants: Vec<Participant>,
    pub status: ConversationStatus,
    pub created_at: DateTime<Utc>,
}

impl Conversation {
    pub fn new(participants: Vec<Participant>) -> Self {
        Self {
            id: Uuid::new_v4(),
            participants,
            status: ConversationStatus::Active,
            created_at: Utc::now(),
        }
    }

    /// The first agent participant, if any.
    pub fn agent_id(&self) -> Option<&str> {
        self.participants.iter().find_map(|p| match p {
            Participant::Agent { agent_id } => Some(agent_id.as_str()),
            Participant::User { .. } => None,
        })
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Turn
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Who started a turn.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Caller {
    User { user_id: String },
    WorkflowRun { run_id: Uuid },
    AgentTurn { parent_turn_id: Uuid },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnStatus {
    Active,
    Completed,
    Failed,
}

impl TurnStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// One user↔agent interaction. A turn completes only when its LLM loop has
/// produced terminal text AND its pending-async counter is back to zero.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Turn {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub caller: Caller,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply_to_message_id: Option<Uuid>,
    pub status: TurnStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context_assembly_run_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_extraction_run_id: Option<Uuid>,
    #[serde(default)]
    pub memory_extraction_failed: bool,
    #[serde(default)]
    pub tool_failure_count: u32,
    /// Dispatched tool operations that have not yet delivered a result.
    #[serde(default)]
    pub pending_async: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl Turn {
    pub fn new(conversation_id: Uuid, caller: Caller, input: Option<Value>) -> Self {
        Self {
            id: Uuid::new_v4(),
            conversation_id,
            caller,
            input,
            reply_to_message_id: None,
            status: TurnStatus::Active,
            context_assembly_run_id: None,
            memory_extraction_run_id: None,
            memory_extraction_failed: false,
            tool_failure_count: 0,
            pending_async: 0,
            error: None,
            created_at: Utc::now(),
            completed_at: None,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Message & move
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Agent,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub turn_id: Uuid,
    pub role: Role,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

impl Message {
    pub fn new(conversation_id: Uuid, turn_id: Uuid, role: Role, content: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            conversation_id,
            turn_id,
            role,
            content: content.into(),
            created_at: Utc::now(),
        }
    }
}

/// One iteration of a turn's LLM-tool loop, recorded in occurrence order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Move {
    pub turn_id: Uuid,
    #[serde(default)]
    pub has_reasoning: bool,
    #[serde(default)]
    pub has_tool_call: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_result: Option<Value>,
    pub recorded_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn participant_tagged_serde() {
        let p = Participant::Agent {
            agent_id: "reviewer".into(),
        };
        assert_eq!(
            serde_json::to_value(&p).unwrap(),
            json!({ "kind": "agent", "agent_id": "reviewer" })
        );
    }

    #[test]
    fn conversation_agent_lookup() {
        let conv = Conversation::new(vec![
            Participant::User {
                user_id: "u1".into(),
            },
            Participant::Agent {
                agent_id: "manager".into(),
            },
        ]);
        assert_eq!(conv.agent_id(), Some("manager"));
    }

    #[test]
    fn turn_defaults() {
        let conv_id = Uuid::new_v4();
        let turn = Turn::new(
            conv_id,
            Caller::User {
                user_id: "u1".into(),
            },
            None,
        );
        assert_eq!(turn.status, TurnStatus::Active);
        assert_eq!(turn.pending_async, 0);
        assert!(!turn.memory_extraction_failed);
    }

    #[test]
    fn caller_variants_round_trip() {
        let callers = vec![
            Caller::User {
                user_id: "u".into(),
            },
            Caller::WorkflowRun {
                run_id: Uuid::new_v4(),
            },
            Caller::AgentTurn {
                parent_turn_id: Uuid::new_v4(),
            },
        ];
        for c in callers {
            let v = serde_json::to_value(&c).unwrap();
            let back: Caller = serde_json::from_value(v).unwrap();
            assert_eq!(back, c);
        }
    }
}
