//! Mock LLM client for tests and local development.
//!
//! Two modes, combinable:
//!
//! - **Scripted**: a queue of canned responses consumed in order.
//! - **Rule-based**: trigger substrings matched against the latest user
//!   message drive a realistic tool-call conversation: first call emits
//!   the tool call, a follow-up call before the result arrives produces an
//!   acknowledgement, and once the tool result is in the history the rule's
//!   reply closes the loop.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;
use serde_json::Value;

use weft_domain::Result;

use crate::{ChatMessage, ChatRequest, ChatResponse, ChatRole, LlmClient, ToolCall};

/// A tool-call behavior keyed on a user-message substring.
#[derive(Debug, Clone)]
pub struct ToolRule {
    pub trigger: String,
    pub tool_name: String,
    pub arguments: Value,
    /// Final text once the tool result is present in the history.
    pub reply: String,
    /// Text produced while an async dispatch is still outstanding.
    pub ack: String,
}

impl ToolRule {
    pub fn new(
        trigger: impl Into<String>,
        tool_name: impl Into<String>,
        arguments: Value,
        reply: impl Into<String>,
    ) -> Self {
        let tool_name = tool_name.into();
        Self {
            trigger: trigger.into(),
            ack: format!("Working on it via {tool_name}."),
            tool_name,
            arguments,
            reply: reply.into(),
        }
    }

    pub fn with_ack(mut self, ack: impl Into<String>) -> Self {
        self.ack = ack.into();
        self
    }
}

pub struct MockLlm {
    model_id: String,
    rules: Vec<ToolRule>,
    scripted: Mutex<VecDeque<ChatResponse>>,
    default_reply: String,
    call_seq: AtomicUsize,
}

impl MockLlm {
    pub fn new() -> Self {
        Self {
            model_id: "mock-llm".into(),
            rules: Vec::new(),
            scripted: Mutex::new(VecDeque::new()),
            default_reply: "Understood.".into(),
            call_seq: AtomicUsize::new(0),
        }
    }

    pub fn with_rule(mut self, rule: ToolRule) -> Self {
        self.rules.push(rule);
        self
    }

    pub fn with_default_reply(mut self, reply: impl Into<String>) -> Self {
        self.default_reply = reply.into();
        self
    }

    /// Queue canned responses consumed before any rule applies.
    pub fn push_scripted(&self, response: ChatResponse) {
        self.scripted.lock().push_back(response);
    }

    fn text(&self, content: &str) -> ChatResponse {
        ChatResponse {
            content: content.to_string(),
            tool_calls: Vec::new(),
            has_reasoning: false,
            model: self.model_id.clone(),
        }
    }

    fn next_call_id(&self) -> String {
        let n = self.call_seq.fetch_add(1, Ordering::SeqCst);
        format!("call_{n}")
    }
}

impl Default for MockLlm {
    fn default() -> Self {
        Self::new()
    }
}

/// What the history says about one rule's tool.
enum RuleState {
    NotDispatched,
    AwaitingResult,
    Resolved { result: String },
}

fn rule_state(rule: &ToolRule, messages: &[ChatMessage]) -> RuleState {
    // call_id → tool name, from assistant tool-call messages.
    let mut calls: HashMap<&str, &str> = HashMap::new();
    for msg in messages {
        for tc in &msg.tool_calls {
            calls.insert(tc.call_id.as_str(), tc.tool_name.as_str());
        }
    }
    if !calls.values().any(|name| *name == rule.tool_name) {
        return RuleState::NotDispatched;
    }
    for msg in messages {
        if msg.role == ChatRole::Tool {
            if let Some(call_id) = msg.tool_call_id.as_deref() {
                if calls.get(call_id) == Some(&rule.tool_name.as_str()) {
                    return RuleState::Resolved {
                        result: msg.content.clone(),
                    };
                }
            }
        }
    }
    RuleState::AwaitingResult
}

#[async_trait::async_trait]
impl LlmClient for MockLlm {
    async fn chat(&self, req: &ChatRequest) -> Result<ChatResponse> {
        if let Some(scripted) = self.scripted.lock().pop_front() {
            return Ok(scripted);
        }

        let last_user = req
            .messages
            .iter()
            .rev()
            .find(|m| m.role == ChatRole::User)
            .map(|m| m.content.as_str())
            .unwrap_or("");

        for rule in &self.rules {
            if !last_user.contains(&rule.trigger) {
                continue;
            }
            return Ok(match rule_state(rule, &req.messages) {
                RuleState::NotDispatched => ChatResponse {
                    content: String::new(),
                    tool_calls: vec![ToolCall {
                        call_id: self.next_call_id(),
                        tool_name: rule.tool_name.clone(),
                        arguments: rule.arguments.clone(),
                    }],
                    has_reasoning: false,
                    model: self.model_id.clone(),
                },
                RuleState::AwaitingResult => self.text(&rule.ack),
                RuleState::Resolved { result } => {
                    self.text(&format!("{} ({result})", rule.reply))
                }
            });
        }

        Ok(self.text(&self.default_reply))
    }

    fn client_id(&self) -> &str {
        &self.model_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn request(messages: Vec<ChatMessage>) -> ChatRequest {
        ChatRequest {
            messages,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn plain_message_gets_default_reply() {
        let llm = MockLlm::new().with_default_reply("Hi there.");
        let resp = llm.chat(&request(vec![ChatMessage::user("Hello")])).await.unwrap();
        assert_eq!(resp.content, "Hi there.");
        assert!(resp.tool_calls.is_empty());
    }

    #[tokio::test]
    async fn rule_drives_call_then_reply() {
        let llm = MockLlm::new().with_rule(ToolRule::new(
            "look up",
            "lookup",
            json!({ "q": "capital of France" }),
            "The answer is Paris.",
        ));

        // First call: tool call, no text.
        let first = llm
            .chat(&request(vec![ChatMessage::user("Please look up: capital?")]))
            .await
            .unwrap();
        assert_eq!(first.tool_calls.len(), 1);
        assert!(!first.has_text());
        let call = first.tool_calls[0].clone();

        // With the result in history: final text.
        let second = llm
            .chat(&request(vec![
                ChatMessage::user("Please look up: capital?"),
                ChatMessage::assistant_tool_calls("", vec![call.clone()]),
                ChatMessage::tool_result(&call.call_id, "Paris"),
            ]))
            .await
            .unwrap();
        assert!(second.has_text());
        assert!(second.content.contains("Paris"));
        assert!(second.tool_calls.is_empty());
    }

    #[tokio::test]
    async fn outstanding_call_produces_ack() {
        let llm = MockLlm::new().with_rule(
            ToolRule::new("research", "research", json!({}), "Done.")
                .with_ack("I've started the research."),
        );

        let first = llm
            .chat(&request(vec![ChatMessage::user("Please research quantum")]))
            .await
            .unwrap();
        let call = first.tool_calls[0].clone();

        // No tool result yet: acknowledgement text, loop can exit.
        let ack = llm
            .chat(&request(vec![
                ChatMessage::user("Please research quantum"),
                ChatMessage::assistant_tool_calls("", vec![call]),
            ]))
            .await
            .unwrap();
        assert_eq!(ack.content, "I've started the research.");
        assert!(ack.tool_calls.is_empty());
    }

    #[tokio::test]
    async fn scripted_responses_take_priority() {
        let llm = MockLlm::new();
        llm.push_scripted(ChatResponse {
            content: "scripted".into(),
            tool_calls: vec![],
            has_reasoning: true,
            model: "mock-llm".into(),
        });
        let resp = llm.chat(&request(vec![ChatMessage::user("x")])).await.unwrap();
        assert_eq!(resp.content, "scripted");
        let resp = llm.chat(&request(vec![ChatMessage::user("x")])).await.unwrap();
        assert_eq!(resp.content, "Understood.");
    }

    #[tokio::test]
    async fn call_ids_are_unique() {
        let llm = MockLlm::new().with_rule(ToolRule::new("go", "t", json!({}), "ok"));
        let a = llm.chat(&request(vec![ChatMessage::user("go 1")])).await.unwrap();
        let b = llm.chat(&request(vec![ChatMessage::user("go 2")])).await.unwrap();
        assert_ne!(a.tool_calls[0].call_id, b.tool_calls[0].call_id);
    }
}
