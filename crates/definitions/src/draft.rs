//! Author-facing draft types. Refs and condition strings live only here;
//! the transform pass rewrites them into the stored id-based form.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use weft_domain::definition::{
    DefinitionKind, LoopConfig, MappingRule, MergeSpec, OnFailure, Owner, RetryPolicy,
};

/// A create request as authored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateDefinition {
    pub kind: DefinitionKind,
    pub name: String,
    /// Defaults to `name`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reference: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub library_id: Option<String>,
    /// Kind-specific draft content. Workflows parse as [`DraftWorkflow`];
    /// other kinds are stored as-is.
    pub content: Value,
    #[serde(default)]
    pub autoversion: bool,
    /// Only meaningful with `autoversion = false`.
    #[serde(default)]
    pub force: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<u32>,
}

impl CreateDefinition {
    pub fn reference(&self) -> &str {
        self.reference.as_deref().unwrap_or(&self.name)
    }

    pub fn owner(&self) -> Option<Owner> {
        match (&self.project_id, &self.library_id) {
            (Some(p), _) => Some(Owner::Project(p.clone())),
            (None, Some(l)) => Some(Owner::Library(l.clone())),
            (None, None) => None,
        }
    }

    pub fn draft_workflow(&self) -> Result<DraftWorkflow, serde_json::Error> {
        serde_json::from_value(self.content.clone())
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Workflow draft
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DraftWorkflow {
    pub initial_node_ref: String,
    pub nodes: Vec<DraftNode>,
    #[serde(default)]
    pub transitions: Vec<DraftTransition>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_schema: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_schema: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context_schema: Option<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub output_mapping: Vec<MappingRule>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DraftNode {
    pub r#ref: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_version: Option<u32>,
    /// Parameter name → expression string.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub input_mapping: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub output_mapping: Vec<MappingRule>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub resource_bindings: BTreeMap<String, String>,
    #[serde(default)]
    pub on_failure: OnFailure,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryPolicy>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DraftTransition {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub r#ref: Option<String>,
    pub from_node_ref: String,
    pub to_node_ref: String,
    #[serde(default)]
    pub priority: i32,
    /// Condition expression source.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub spawn_count: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sibling_group: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub foreach: Option<DraftForeach>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub loop_config: Option<LoopConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub synchronization: Option<DraftSync>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DraftForeach {
    /// Collection expression source.
    pub collection: String,
    pub item_var: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DraftSync {
    /// `any` | `all` | `m_of_n:N`.
    pub strategy: String,
    pub sibling_group: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub merge: Option<MergeSpec>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    /// `proceed_with_available` | `fail`; defaults to `fail`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub on_timeout: Option<String>,
}
