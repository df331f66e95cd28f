//! Task execution: the external-executor contract plus the built-in
//! implementation that resolves tasks to action definitions.
//!
//! The coordinator decides *where* a task goes (action → executor,
//! workflow → sub-run); the executor only ever sees action-backed tasks.

use std::collections::BTreeMap;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use uuid::Uuid;

use weft_domain::definition::{ActionContent, DefinitionKind, TaskContent};
use weft_llm::{ChatMessage, ChatRequest, LlmClient};
use weft_store::Store;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Contract
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone)]
pub struct TaskInvocation {
    pub invocation_id: Uuid,
    pub task_id: String,
    pub task_version: Option<u32>,
    pub input: Value,
    pub resource_bindings: BTreeMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct TaskFailure {
    pub message: String,
}

impl TaskFailure {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl std::fmt::Display for TaskFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

/// The Executor RPC surface the coordinator dispatches action tasks to.
#[async_trait::async_trait]
pub trait TaskExecutor: Send + Sync {
    async fn execute(&self, invocation: TaskInvocation) -> Result<Value, TaskFailure>;

    /// Best-effort cancellation of an in-flight invocation.
    async fn cancel(&self, _invocation_id: Uuid) {}
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Default executor
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Resolves a task definition to its action and runs the action behavior:
/// `mock` (canned result after an optional delay), `llm` (one completion),
/// `transform` (pure expression over the input).
pub struct DefaultExecutor {
    store: Arc<dyn Store>,
    llm: Arc<dyn LlmClient>,
    cancelled: Mutex<HashSet<Uuid>>,
}

impl DefaultExecutor {
    pub fn new(store: Arc<dyn Store>, llm: Arc<dyn LlmClient>) -> Self {
        Self {
            store,
            llm,
            cancelled: Mutex::new(HashSet::new()),
        }
    }

    async fn resolve_action(
        &self,
        invocation: &TaskInvocation,
    ) -> Result<ActionContent, TaskFailure> {
        let task = self
            .store
            .get_definition(&invocation.task_id, invocation.task_version)
            .await
            .map_err(|e| TaskFailure::new(format!("loading task: {e}")))?
            .ok_or_else(|| TaskFailure::new(format!("task {} not found", invocation.task_id)))?;

        if task.kind != DefinitionKind::Task {
            return Err(TaskFailure::new(format!(
                "definition {} is not a task",
                invocation.task_id
            )));
        }

        let content = task
            .task_content()
            .map_err(|e| TaskFailure::new(format!("task content: {e}")))?;
        let (action_id, action_version) = match content {
            TaskContent::Action {
                action_id,
                action_version,
                ..
            } => (action_id, action_version),
            TaskContent::Workflow { .. } => {
                return Err(TaskFailure::new(
                    "workflow-targeted task routed to the executor",
                ));
            }
        };

        let action = self
            .store
            .get_definition(&action_id, action_version)
            .await
            .map_err(|e| TaskFailure::new(format!("loading action: {e}")))?
            .ok_or_else(|| TaskFailure::new(format!("action {action_id} not found")))?;
        action
            .action_content()
            .map_err(|e| TaskFailure::new(format!("action content: {e}")))
    }
}

#[async_trait::async_trait]
impl TaskExecutor for DefaultExecutor {
    async fn execute(&self, invocation: TaskInvocation) -> Result<Value, TaskFailure> {
        let action = self.resolve_action(&invocation).await?;
        tracing::debug!(
            invocation_id = %invocation.invocation_id,
            task_id = %invocation.task_id,
            "executing action task"
        );

        match action {
            ActionContent::Mock {
                result,
                delay_ms,
                fail,
            } => {
                if let Some(ms) = delay_ms {
                    tokio::time::sleep(Duration::from_millis(ms)).await;
                }
                if self.cancelled.lock().remove(&invocation.invocation_id) {
                    return Err(TaskFailure::new("cancelled"));
                }
                match fail {
                    Some(message) => Err(TaskFailure::new(message)),
                    None => Ok(result),
                }
            }
            ActionContent::Llm {
                prompt,
                model_profile_ref: _,
            } => {
                let rendered = format!(
                    "{prompt}\n\nInput:\n{}",
                    serde_json::to_string_pretty(&invocation.input).unwrap_or_default()
                );
                let req = ChatRequest {
                    messages: vec![ChatMessage::user(rendered)],
                    ..Default::default()
                };
                let resp = self
                    .llm
                    .chat(&req)
                    .await
                    .map_err(|e| TaskFailure::new(format!("llm action: {e}")))?;
                Ok(serde_json::json!({ "text": resp.content }))
            }
            ActionContent::Transform { expression } => {
                let expr = weft_expr::parse(&expression)
                    .map_err(|e| TaskFailure::new(format!("transform parse: {e}")))?;
                let env = serde_json::json!({ "input": invocation.input });
                expr.evaluate(&env)
                    .map_err(|e| TaskFailure::new(format!("transform eval: {e}")))
            }
        }
    }

    async fn cancel(&self, invocation_id: Uuid) {
        self.cancelled.lock().insert(invocation_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;
    use weft_domain::definition::Definition;
    use weft_llm::MockLlm;
    use weft_store::MemoryStore;

    async fn seed(store: &MemoryStore, id: &str, kind: DefinitionKind, content: Value) {
        let def = Definition {
            id: id.into(),
            version: 1,
            kind,
            name: id.into(),
            reference: id.into(),
            description: None,
            project_id: Some("p1".into()),
            library_id: None,
            content,
            content_hash: format!("hash-{id}"),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        store.put_definition(&def, &[], &[]).await.unwrap();
    }

    fn invocation(task_id: &str, input: Value) -> TaskInvocation {
        TaskInvocation {
            invocation_id: Uuid::new_v4(),
            task_id: task_id.into(),
            task_version: None,
            input,
            resource_bindings: BTreeMap::new(),
        }
    }

    async fn executor_with_mock_action(result: Value) -> DefaultExecutor {
        let store = MemoryStore::new();
        seed(
            &store,
            "act",
            DefinitionKind::Action,
            json!({ "type": "mock", "result": result }),
        )
        .await;
        seed(
            &store,
            "task",
            DefinitionKind::Task,
            json!({ "target": "action", "action_id": "act" }),
        )
        .await;
        DefaultExecutor::new(Arc::new(store), Arc::new(MockLlm::new()))
    }

    #[tokio::test]
    async fn mock_action_returns_result() {
        let exec = executor_with_mock_action(json!({ "answer": 42 })).await;
        let out = exec.execute(invocation("task", json!({}))).await.unwrap();
        assert_eq!(out, json!({ "answer": 42 }));
    }

    #[tokio::test]
    async fn mock_action_can_fail() {
        let store = MemoryStore::new();
        seed(
            &store,
            "act",
            DefinitionKind::Action,
            json!({ "type": "mock", "fail": "boom" }),
        )
        .await;
        seed(
            &store,
            "task",
            DefinitionKind::Task,
            json!({ "target": "action", "action_id": "act" }),
        )
        .await;
        let exec = DefaultExecutor::new(Arc::new(store), Arc::new(MockLlm::new()));
        let err = exec.execute(invocation("task", json!({}))).await.unwrap_err();
        assert_eq!(err.message, "boom");
    }

    #[tokio::test]
    async fn transform_action_evaluates_expression() {
        let store = MemoryStore::new();
        seed(
            &store,
            "act",
            DefinitionKind::Action,
            json!({ "type": "transform", "expression": "input.a + input.b" }),
        )
        .await;
        seed(
            &store,
            "task",
            DefinitionKind::Task,
            json!({ "target": "action", "action_id": "act" }),
        )
        .await;
        let exec = DefaultExecutor::new(Arc::new(store), Arc::new(MockLlm::new()));
        let out = exec
            .execute(invocation("task", json!({ "a": 2, "b": 3 })))
            .await
            .unwrap();
        assert_eq!(out, json!(5.0));
    }

    #[tokio::test]
    async fn llm_action_calls_client() {
        let store = MemoryStore::new();
        seed(
            &store,
            "act",
            DefinitionKind::Action,
            json!({ "type": "llm", "prompt": "Summarize" }),
        )
        .await;
        seed(
            &store,
            "task",
            DefinitionKind::Task,
            json!({ "target": "action", "action_id": "act" }),
        )
        .await;
        let llm = MockLlm::new().with_default_reply("a summary");
        let exec = DefaultExecutor::new(Arc::new(store), Arc::new(llm));
        let out = exec.execute(invocation("task", json!({}))).await.unwrap();
        assert_eq!(out, json!({ "text": "a summary" }));
    }

    #[tokio::test]
    async fn workflow_task_is_rejected() {
        let store = MemoryStore::new();
        seed(
            &store,
            "task",
            DefinitionKind::Task,
            json!({ "target": "workflow", "workflow_id": "wf" }),
        )
        .await;
        let exec = DefaultExecutor::new(Arc::new(store), Arc::new(MockLlm::new()));
        assert!(exec.execute(invocation("task", json!({}))).await.is_err());
    }

    #[tokio::test]
    async fn missing_task_is_a_failure() {
        let exec = executor_with_mock_action(json!(null)).await;
        let err = exec.execute(invocation("ghost", json!({}))).await.unwrap_err();
        assert!(err.message.contains("not found"));
    }

    #[tokio::test]
    async fn cancel_aborts_delayed_mock() {
        let store = MemoryStore::new();
        seed(
            &store,
            "act",
            DefinitionKind::Action,
            json!({ "type": "mock", "result": 1, "delay_ms": 100 }),
        )
        .await;
        seed(
            &store,
            "task",
            DefinitionKind::Task,
            json!({ "target": "action", "action_id": "act" }),
        )
        .await;
        let exec = Arc::new(DefaultExecutor::new(
            Arc::new(store),
            Arc::new(MockLlm::new()),
        ));

        let inv = invocation("task", json!({}));
        let id = inv.invocation_id;
        let exec2 = exec.clone();
        let running = tokio::spawn(async move { exec2.execute(inv).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        exec.cancel(id).await;
        let result = running.await.unwrap();
        assert!(result.is_err());
    }
}
