//! Versioned, content-addressed definitions and the workflow-graph content
//! model.
//!
//! A [`Definition`] row stores opaque kind-specific `content`; the typed
//! views ([`WorkflowContent`], [`TaskContent`], [`ActionContent`],
//! [`PersonaContent`], [`ModelProfileContent`]) parse out of it. Workflow
//! content is stored post-transform: author-facing refs are gone, every node
//! and transition carries a stable id, conditions are parsed ASTs.

use std::collections::BTreeMap;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use weft_expr::Expr;

use crate::error::{Error, Result};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Definition row
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DefinitionKind {
    Workflow,
    Task,
    Persona,
    Action,
    ModelProfile,
    ArtifactType,
    PromptSpec,
}

impl DefinitionKind {
    /// Kinds for which `project_id` XOR `library_id` is mandatory.
    pub fn requires_exclusive_owner(self) -> bool {
        matches!(self, Self::Workflow | Self::Task | Self::Action)
    }
}

/// Who owns a definition: exactly one of project or library.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Owner {
    Project(String),
    Library(String),
}

impl Owner {
    pub fn project_id(&self) -> Option<&str> {
        match self {
            Self::Project(id) => Some(id),
            Self::Library(_) => None,
        }
    }

    pub fn library_id(&self) -> Option<&str> {
        match self {
            Self::Library(id) => Some(id),
            Self::Project(_) => None,
        }
    }
}

/// A stored, versioned definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Definition {
    pub id: String,
    pub version: u32,
    pub kind: DefinitionKind,
    pub name: String,
    /// Machine reference; defaults to `name` at creation.
    pub reference: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub library_id: Option<String>,
    /// Kind-specific content (parse with the typed views below).
    pub content: Value,
    /// Hex SHA-256 over normalized structural content.
    pub content_hash: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Definition {
    pub fn owner(&self) -> Option<Owner> {
        match (&self.project_id, &self.library_id) {
            (Some(p), _) => Some(Owner::Project(p.clone())),
            (None, Some(l)) => Some(Owner::Library(l.clone())),
            (None, None) => None,
        }
    }

    pub fn workflow_content(&self) -> Result<WorkflowContent> {
        serde_json::from_value(self.content.clone()).map_err(Error::Json)
    }

    pub fn task_content(&self) -> Result<TaskContent> {
        serde_json::from_value(self.content.clone()).map_err(Error::Json)
    }

    pub fn action_content(&self) -> Result<ActionContent> {
        serde_json::from_value(self.content.clone()).map_err(Error::Json)
    }

    pub fn persona_content(&self) -> Result<PersonaContent> {
        serde_json::from_value(self.content.clone()).map_err(Error::Json)
    }

    pub fn model_profile_content(&self) -> Result<ModelProfileContent> {
        serde_json::from_value(self.content.clone()).map_err(Error::Json)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Workflow graph content
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A dotted-source → dotted-target copy applied against a context env.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MappingRule {
    pub source: String,
    pub target: String,
}

/// What a node does when its task fails terminally.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnFailure {
    #[default]
    Abort,
    Retry,
    Continue,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
}

/// A graph node. Nodes do no branching; they only execute a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub id: String,
    /// Author-facing ref, unique within the definition. Retained for
    /// diagnostics; all runtime lookups use `id`.
    pub r#ref: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_version: Option<u32>,
    /// Parameter name → expression evaluated against the context env.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub input_mapping: BTreeMap<String, Expr>,
    /// Applied when the task completes, against `{result, input, state,
    /// output, _branch}`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub output_mapping: Vec<MappingRule>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub resource_bindings: BTreeMap<String, String>,
    #[serde(default)]
    pub on_failure: OnFailure,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryPolicy>,
}

/// Fan-in strategy, stored in tagged form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SyncStrategy {
    Any,
    All,
    MOfN { n: u32 },
}

impl FromStr for SyncStrategy {
    type Err = Error;

    /// Parses the authoring grammar: `any`, `all`, `m_of_n:N` with N ≥ 1.
    fn from_str(s: &str) -> Result<Self> {
        match s {
            "any" => Ok(Self::Any),
            "all" => Ok(Self::All),
            other => {
                let n = other
                    .strip_prefix("m_of_n:")
                    .and_then(|n| n.parse::<u32>().ok())
                    .filter(|n| *n >= 1)
                    .ok_or_else(|| {
                        Error::validation(
                            "synchronization.strategy",
                            format!("'{other}' is not any | all | m_of_n:N (N>=1)"),
                        )
                    })?;
                Ok(Self::MOfN { n })
            }
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnTimeout {
    ProceedWithAvailable,
    #[default]
    Fail,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeStrategy {
    Append,
    Collect,
    MergeObject,
    KeyedByBranch,
    LastWins,
}

/// How sibling branch values converge at a fan-in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeSpec {
    /// Dotted path into each sibling's branch env (e.g. `_branch.output`).
    pub source: String,
    /// Dotted path into the shared context (e.g. `state.votes`).
    pub target: String,
    pub strategy: MergeStrategy,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Synchronization {
    pub strategy: SyncStrategy,
    /// Must equal a group declared on a fan-out transition in the same
    /// definition.
    pub sibling_group: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub merge: Option<MergeSpec>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub on_timeout: OnTimeout,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForeachSpec {
    /// Expression yielding the collection to iterate.
    pub collection: Expr,
    /// Original source text, kept for diagnostics.
    pub collection_source: String,
    /// Variable seeded into each child's `_branch` store.
    pub item_var: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoopConfig {
    pub max_iterations: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transition {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub r#ref: Option<String>,
    pub from_node_id: String,
    pub to_node_id: String,
    #[serde(default)]
    pub priority: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub condition: Option<Expr>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub condition_source: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub spawn_count: Option<u32>,
    /// Declared on fan-out transitions; referenced by fan-in sync blocks.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sibling_group: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub foreach: Option<ForeachSpec>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub loop_config: Option<LoopConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub synchronization: Option<Synchronization>,
}

impl Transition {
    /// True when firing this transition multiplies tokens.
    pub fn is_fan_out(&self) -> bool {
        self.spawn_count.is_some() || self.foreach.is_some()
    }
}

/// Stored workflow content (post ref→id transform).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowContent {
    pub initial_node_id: String,
    pub nodes: Vec<Node>,
    pub transitions: Vec<Transition>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_schema: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_schema: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context_schema: Option<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub output_mapping: Vec<MappingRule>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Task / action content
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// What a task executes: a leaf action, or a sub-workflow run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "target", rename_all = "snake_case")]
pub enum TaskContent {
    Action {
        action_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        action_version: Option<u32>,
        #[serde(skip_serializing_if = "Option::is_none")]
        timeout_ms: Option<u64>,
    },
    Workflow {
        workflow_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        workflow_version: Option<u32>,
    },
}

/// Leaf units of work referenced by tasks.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ActionContent {
    /// Test/dev action: resolves to `result` after `delay_ms`, or fails.
    Mock {
        #[serde(default)]
        result: Value,
        #[serde(skip_serializing_if = "Option::is_none")]
        delay_ms: Option<u64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        fail: Option<String>,
    },
    /// One LLM completion over a prompt template.
    Llm {
        prompt: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        model_profile_ref: Option<String>,
    },
    /// Pure expression over the action input.
    Transform { expression: String },
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Persona / tool / model profile
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersonaContent {
    pub system_prompt: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_profile_ref: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context_assembly_workflow_ref: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_extraction_workflow_ref: Option<String>,
    #[serde(default = "d_recent_turns_limit")]
    pub recent_turns_limit: usize,
    #[serde(default)]
    pub tool_ids: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub constraints: Option<Value>,
}

fn d_recent_turns_limit() -> usize {
    10
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolTargetType {
    Task,
    Workflow,
    Agent,
}

/// Agent-targeted tool dispatch mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvocationMode {
    /// Fresh isolated conversation with the target agent.
    Delegate,
    /// A new turn on the calling conversation.
    LoopIn,
}

/// A tool an agent may invoke. Registered with the runtime (config or API)
/// and referenced by persona `tool_ids`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSpec {
    pub id: String,
    pub name: String,
    pub description: String,
    #[serde(default)]
    pub input_schema: Value,
    pub target_type: ToolTargetType,
    pub target_id: String,
    #[serde(rename = "async", default)]
    pub is_async: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub invocation_mode: Option<InvocationMode>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelProfileContent {
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}
