//! Per-turn state carried by the conversation runner.

use std::collections::{HashMap, HashSet};

use uuid::Uuid;

use weft_domain::conversation::Turn;
use weft_llm::ChatMessage;

use crate::dispatch::ReplyTo;

/// Where a turn's loop currently is. Advanced only by mailbox messages, so
/// several turns interleave freely while each tick stays atomic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Created; waiting on a post delay.
    Delayed,
    /// Context-assembly workflow in flight.
    Assembling,
    /// LLM call in flight.
    Calling,
    /// Parked on one or more sync tool results.
    Parked,
    /// Loop produced terminal text; async operations may still be pending.
    Exited,
    /// Completed or failed.
    Done,
}

/// How to abort one dispatched tool call.
#[derive(Debug, Clone)]
pub enum CancelRoute {
    Invocation(Uuid),
    Run(Uuid),
    DelegateConversation { conversation_id: Uuid },
    LoopInTurn(Uuid),
    None,
}

#[derive(Debug, Clone)]
pub struct PendingCall {
    pub tool_name: String,
    pub cancel: CancelRoute,
}

pub struct TurnState {
    pub turn: Turn,
    /// The triggering content (user message or tool arguments).
    pub user_content: String,
    /// This turn's accumulated LLM history: user message, assistant
    /// messages with tool calls, tool results.
    pub history: Vec<ChatMessage>,
    /// System prompt chosen by context assembly (persona default if none).
    pub assembled_system: Option<String>,
    /// Prior-context messages from assembly (recent turns).
    pub assembled_base: Vec<ChatMessage>,
    pub phase: Phase,
    pub pending: HashMap<String, PendingCall>,
    /// Sync tool calls the loop is parked on.
    pub sync_waiting: HashSet<String>,
    pub move_count: u32,
    pub loop_exited: bool,
    pub final_text: Option<String>,
    /// Resolves the dispatching tool call when this turn is itself a
    /// delegate or loop-in target.
    pub on_complete: Option<ReplyTo>,
}

impl TurnState {
    pub fn new(turn: Turn, user_content: String, on_complete: Option<ReplyTo>) -> Self {
        let history = vec![ChatMessage::user(&user_content)];
        Self {
            turn,
            user_content,
            history,
            assembled_system: None,
            assembled_base: Vec::new(),
            phase: Phase::Delayed,
            pending: HashMap::new(),
            sync_waiting: HashSet::new(),
            move_count: 0,
            loop_exited: false,
            final_text: None,
            on_complete,
        }
    }
}
