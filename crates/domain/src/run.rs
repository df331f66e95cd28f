//! Workflow runs and the three-section context model.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::token::{Token, TokenStatus};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Run context
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// The evaluation environment of a run: `input` (immutable after init),
/// `state` (mutable), `output` (merged at completion), plus per-token
/// `_branch` sub-stores private to one branch.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunContext {
    #[serde(default)]
    pub input: Value,
    #[serde(default)]
    pub state: Value,
    #[serde(default)]
    pub output: Value,
    /// Token id → private branch store.
    #[serde(default, rename = "_branch", skip_serializing_if = "HashMap::is_empty")]
    pub branch: HashMap<Uuid, Value>,
}

impl RunContext {
    pub fn new(input: Value) -> Self {
        Self {
            input,
            state: Value::Object(Map::new()),
            output: Value::Object(Map::new()),
            branch: HashMap::new(),
        }
    }

    /// Build the expression env seen by a token: `{input, state, output,
    /// _branch}` where `_branch` is the token's own sub-store.
    pub fn env_for(&self, token_id: Option<Uuid>) -> Value {
        let branch = token_id
            .and_then(|id| self.branch.get(&id).cloned())
            .unwrap_or_else(|| Value::Object(Map::new()));
        serde_json::json!({
            "input": &self.input,
            "state": &self.state,
            "output": &self.output,
            "_branch": branch,
        })
    }

    /// Read a dotted path rooted at a context section.
    pub fn get_path(&self, path: &str, token_id: Option<Uuid>) -> Value {
        let env = self.env_for(token_id);
        let segs: Vec<String> = path.split('.').map(str::to_owned).collect();
        weft_expr::eval::resolve_path(&env, &segs).clone()
    }

    /// Write a dotted path. The first segment selects the section; `input`
    /// is immutable and rejects writes.
    pub fn set_path(&mut self, path: &str, value: Value, token_id: Option<Uuid>) -> Result<()> {
        let mut segs = path.split('.');
        let section = segs
            .next()
            .ok_or_else(|| Error::validation("path", "empty context path"))?;
        let rest: Vec<&str> = segs.collect();

        let root = match section {
            "state" => &mut self.state,
            "output" => &mut self.output,
            "_branch" => {
                let id = token_id.ok_or_else(|| {
                    Error::validation("path", "_branch write without an owning token")
                })?;
                self.branch
                    .entry(id)
                    .or_insert_with(|| Value::Object(Map::new()))
            }
            "input" => {
                return Err(Error::validation("path", "input section is immutable"));
            }
            other => {
                return Err(Error::validation(
                    "path",
                    format!("unknown context section '{other}'"),
                ));
            }
        };

        if rest.is_empty() {
            *root = value;
            return Ok(());
        }
        set_in(root, &rest, value);
        Ok(())
    }

    /// Drop a token's private branch store (branch closed or merged away).
    pub fn drop_branch(&mut self, token_id: Uuid) {
        self.branch.remove(&token_id);
    }
}

/// Create intermediate objects along the path and set the leaf.
fn set_in(root: &mut Value, segs: &[&str], value: Value) {
    let Some((leaf, parents)) = segs.split_last() else {
        return;
    };
    let mut cur = root;
    for seg in parents {
        if !cur.is_object() {
            *cur = Value::Object(Map::new());
        }
        let Value::Object(map) = cur else {
            return;
        };
        cur = map
            .entry(seg.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
    }
    if !cur.is_object() {
        *cur = Value::Object(Map::new());
    }
    if let Value::Object(map) = cur {
        map.insert(leaf.to_string(), value);
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Workflow run
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Waiting,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowRun {
    pub id: Uuid,
    pub workflow_def_id: String,
    pub workflow_def_version: u32,
    pub status: RunStatus,
    pub context: RunContext,
    /// All tokens of the run, active and settled-but-unmerged.
    #[serde(default)]
    pub tokens: HashMap<Uuid, Token>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_run_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_node_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_token_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
}

impl WorkflowRun {
    pub fn new(
        workflow_def_id: impl Into<String>,
        workflow_def_version: u32,
        input: Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            workflow_def_id: workflow_def_id.into(),
            workflow_def_version,
            status: RunStatus::Running,
            context: RunContext::new(input),
            tokens: HashMap::new(),
            project_id: None,
            parent_run_id: None,
            parent_node_id: None,
            parent_token_id: None,
            error: None,
            created_at: Utc::now(),
            ended_at: None,
        }
    }

    pub fn active_tokens(&self) -> impl Iterator<Item = &Token> {
        self.tokens.values().filter(|t| t.status.is_active())
    }

    pub fn active_token_count(&self) -> usize {
        self.active_tokens().count()
    }

    pub fn token(&self, id: Uuid) -> Option<&Token> {
        self.tokens.get(&id)
    }

    pub fn token_mut(&mut self, id: Uuid) -> Option<&mut Token> {
        self.tokens.get_mut(&id)
    }

    pub fn finish(&mut self, status: RunStatus) {
        self.status = status;
        self.ended_at = Some(Utc::now());
    }

    /// Mark every active token cancelled (run cancellation).
    pub fn cancel_active_tokens(&mut self) -> Vec<Uuid> {
        let mut cancelled = Vec::new();
        for token in self.tokens.values_mut() {
            if token.status.is_active() {
                token.status = TokenStatus::Cancelled;
                token.waiting_on = None;
                cancelled.push(token.id);
            }
        }
        cancelled
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn set_and_get_dotted_paths() {
        let mut ctx = RunContext::new(json!({ "q": 1 }));
        ctx.set_path("state.a.b", json!(5), None).unwrap();
        assert_eq!(ctx.get_path("state.a.b", None), json!(5));
        assert_eq!(ctx.get_path("input.q", None), json!(1));
        assert_eq!(ctx.get_path("state.missing", None), Value::Null);
    }

    #[test]
    fn input_is_immutable() {
        let mut ctx = RunContext::new(json!({}));
        assert!(ctx.set_path("input.x", json!(1), None).is_err());
    }

    #[test]
    fn branch_store_is_private_per_token() {
        let mut ctx = RunContext::new(json!({}));
        let t1 = Uuid::new_v4();
        let t2 = Uuid::new_v4();
        ctx.set_path("_branch.item", json!("a"), Some(t1)).unwrap();
        ctx.set_path("_branch.item", json!("b"), Some(t2)).unwrap();

        assert_eq!(ctx.get_path("_branch.item", Some(t1)), json!("a"));
        assert_eq!(ctx.get_path("_branch.item", Some(t2)), json!("b"));

        ctx.drop_branch(t1);
        assert_eq!(ctx.get_path("_branch.item", Some(t1)), Value::Null);
        assert_eq!(ctx.get_path("_branch.item", Some(t2)), json!("b"));
    }

    #[test]
    fn branch_write_requires_token() {
        let mut ctx = RunContext::new(json!({}));
        assert!(ctx.set_path("_branch.x", json!(1), None).is_err());
    }

    #[test]
    fn env_includes_all_sections() {
        let mut ctx = RunContext::new(json!({ "a": 1 }));
        ctx.set_path("state.b", json!(2), None).unwrap();
        let t = Uuid::new_v4();
        ctx.set_path("_branch.c", json!(3), Some(t)).unwrap();

        let env = ctx.env_for(Some(t));
        assert_eq!(env["input"]["a"], json!(1));
        assert_eq!(env["state"]["b"], json!(2));
        assert_eq!(env["_branch"]["c"], json!(3));
    }

    #[test]
    fn cancel_active_tokens_spares_settled() {
        let mut run = WorkflowRun::new("wf", 1, json!({}));
        let mut t1 = Token::initial(run.id, "n1");
        let mut t2 = Token::initial(run.id, "n1");
        t2.status = TokenStatus::Completed;
        let (id1, id2) = (t1.id, t2.id);
        t1.status = TokenStatus::Dispatched;
        run.tokens.insert(id1, t1);
        run.tokens.insert(id2, t2);

        let cancelled = run.cancel_active_tokens();
        assert_eq!(cancelled, vec![id1]);
        assert_eq!(run.tokens[&id1].status, TokenStatus::Cancelled);
        assert_eq!(run.tokens[&id2].status, TokenStatus::Completed);
    }

    #[test]
    fn run_serde_round_trip() {
        let mut run = WorkflowRun::new("wf", 1, json!({ "x": true }));
        let t = Token::initial(run.id, "n1");
        run.tokens.insert(t.id, t);
        let json = serde_json::to_string(&run).unwrap();
        let back: WorkflowRun = serde_json::from_str(&json).unwrap();
        assert_eq!(back.tokens.len(), 1);
        assert_eq!(back.workflow_def_id, "wf");
    }
}
