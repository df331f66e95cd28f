//! Ref → id rewriting. Side-effect free; all ids for one call are minted
//! here and nowhere else.

use std::collections::{BTreeMap, HashMap};
use std::str::FromStr;

use serde_json::Value;
use uuid::Uuid;

use weft_domain::definition::{
    DefinitionKind, ForeachSpec, Node, OnTimeout, SyncStrategy, Synchronization, Transition,
    WorkflowContent,
};
use weft_domain::{Error, Result};

use crate::draft::CreateDefinition;

/// Transformed content ready to persist.
#[derive(Debug)]
pub struct Transformed {
    pub content: Value,
    /// Denormalized node rows (workflow kind only).
    pub nodes: Vec<Node>,
    pub transitions: Vec<Transition>,
}

/// Rewrite a validated draft into the stored id-based form. Non-workflow
/// kinds pass their content through untouched.
pub fn transform(input: &CreateDefinition) -> Result<Transformed> {
    if input.kind != DefinitionKind::Workflow {
        return Ok(Transformed {
            content: input.content.clone(),
            nodes: Vec::new(),
            transitions: Vec::new(),
        });
    }

    let draft = input
        .draft_workflow()
        .map_err(|e| Error::validation("content", format!("not a workflow draft: {e}")))?;

    // One id per node ref, minted once.
    let mut ref_to_id: HashMap<&str, String> = HashMap::new();
    let mut nodes = Vec::with_capacity(draft.nodes.len());
    for dn in &draft.nodes {
        let id = Uuid::new_v4().to_string();
        ref_to_id.insert(dn.r#ref.as_str(), id.clone());

        let mut input_mapping = BTreeMap::new();
        for (param, source) in &dn.input_mapping {
            let expr = weft_expr::parse(source).map_err(|e| {
                Error::validation(
                    format!("nodes[{}].input_mapping.{param}", dn.r#ref),
                    e.to_string(),
                )
            })?;
            input_mapping.insert(param.clone(), expr);
        }

        nodes.push(Node {
            id,
            r#ref: dn.r#ref.clone(),
            name: dn.name.clone().unwrap_or_else(|| dn.r#ref.clone()),
            task_id: dn.task_id.clone(),
            task_version: dn.task_version,
            input_mapping,
            output_mapping: dn.output_mapping.clone(),
            resource_bindings: dn.resource_bindings.clone(),
            on_failure: dn.on_failure,
            retry: dn.retry,
        });
    }

    let node_id = |r: &str| -> Result<String> {
        ref_to_id.get(r).cloned().ok_or_else(|| {
            Error::validation("transitions[]", format!("'{r}' is not a node ref"))
        })
    };

    let mut transitions = Vec::with_capacity(draft.transitions.len());
    for dt in &draft.transitions {
        let condition = match &dt.condition {
            Some(source) => Some(weft_expr::parse(source).map_err(|e| {
                Error::validation("transitions[].condition", e.to_string())
            })?),
            None => None,
        };

        let foreach = match &dt.foreach {
            Some(f) => Some(ForeachSpec {
                collection: weft_expr::parse(&f.collection).map_err(|e| {
                    Error::validation("transitions[].foreach.collection", e.to_string())
                })?,
                collection_source: f.collection.clone(),
                item_var: f.item_var.clone(),
            }),
            None => None,
        };

        let synchronization = match &dt.synchronization {
            Some(s) => Some(Synchronization {
                strategy: SyncStrategy::from_str(&s.strategy)?,
                sibling_group: s.sibling_group.clone(),
                merge: s.merge.clone(),
                timeout_ms: s.timeout_ms,
                on_timeout: match s.on_timeout.as_deref() {
                    Some("proceed_with_available") => OnTimeout::ProceedWithAvailable,
                    _ => OnTimeout::Fail,
                },
            }),
            None => None,
        };

        transitions.push(Transition {
            id: Uuid::new_v4().to_string(),
            r#ref: dt.r#ref.clone(),
            from_node_id: node_id(&dt.from_node_ref)?,
            to_node_id: node_id(&dt.to_node_ref)?,
            priority: dt.priority,
            condition,
            condition_source: dt.condition.clone(),
            spawn_count: dt.spawn_count,
            sibling_group: dt.sibling_group.clone(),
            foreach,
            loop_config: dt.loop_config,
            synchronization,
        });
    }

    let content = WorkflowContent {
        initial_node_id: node_id(&draft.initial_node_ref)?,
        nodes: nodes.clone(),
        transitions: transitions.clone(),
        input_schema: draft.input_schema.clone(),
        output_schema: draft.output_schema.clone(),
        context_schema: draft.context_schema.clone(),
        output_mapping: draft.output_mapping.clone(),
    };

    Ok(Transformed {
        content: serde_json::to_value(&content)?,
        nodes,
        transitions,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn input(content: Value) -> CreateDefinition {
        CreateDefinition {
            kind: DefinitionKind::Workflow,
            name: "wf".into(),
            reference: None,
            description: None,
            project_id: Some("p1".into()),
            library_id: None,
            content,
            autoversion: true,
            force: false,
            version: None,
        }
    }

    #[test]
    fn rewrites_refs_to_ids() {
        let t = transform(&input(json!({
            "initial_node_ref": "start",
            "nodes": [{ "ref": "start" }, { "ref": "end" }],
            "transitions": [{
                "from_node_ref": "start",
                "to_node_ref": "end",
                "condition": "state.ready == true"
            }]
        })))
        .unwrap();

        let content: WorkflowContent = serde_json::from_value(t.content).unwrap();
        let start = content.nodes.iter().find(|n| n.r#ref == "start").unwrap();
        let end = content.nodes.iter().find(|n| n.r#ref == "end").unwrap();
        assert_eq!(content.initial_node_id, start.id);
        assert_eq!(content.transitions[0].from_node_id, start.id);
        assert_eq!(content.transitions[0].to_node_id, end.id);
        assert!(content.transitions[0].condition.is_some());
        assert_eq!(
            content.transitions[0].condition_source.as_deref(),
            Some("state.ready == true")
        );
    }

    #[test]
    fn parses_strategy_and_foreach() {
        let t = transform(&input(json!({
            "initial_node_ref": "a",
            "nodes": [{ "ref": "a" }, { "ref": "b" }],
            "transitions": [
                {
                    "from_node_ref": "a",
                    "to_node_ref": "b",
                    "sibling_group": "G",
                    "foreach": { "collection": "input.items", "item_var": "item" }
                },
                {
                    "from_node_ref": "b",
                    "to_node_ref": "a",
                    "synchronization": {
                        "strategy": "m_of_n:2",
                        "sibling_group": "G",
                        "on_timeout": "proceed_with_available"
                    }
                }
            ]
        })))
        .unwrap();

        let sync = t.transitions[1].synchronization.as_ref().unwrap();
        assert_eq!(sync.strategy, SyncStrategy::MOfN { n: 2 });
        assert_eq!(sync.on_timeout, OnTimeout::ProceedWithAvailable);

        let foreach = t.transitions[0].foreach.as_ref().unwrap();
        assert_eq!(foreach.item_var, "item");
        assert_eq!(foreach.collection_source, "input.items");
    }

    #[test]
    fn unresolved_ref_is_a_validation_error() {
        // Transform rejects a dangling ref on its own, without leaning on
        // the validation pass having run first.
        let err = transform(&input(json!({
            "initial_node_ref": "ghost",
            "nodes": [{ "ref": "a" }]
        })))
        .unwrap_err();
        assert_eq!(err.kind(), "validation");
    }

    #[test]
    fn bad_condition_is_a_validation_error() {
        let err = transform(&input(json!({
            "initial_node_ref": "a",
            "nodes": [{ "ref": "a" }, { "ref": "b" }],
            "transitions": [{
                "from_node_ref": "a",
                "to_node_ref": "b",
                "condition": "state.x &&"
            }]
        })))
        .unwrap_err();
        assert_eq!(err.kind(), "validation");
    }

    #[test]
    fn non_workflow_content_passes_through() {
        let mut i = input(json!({ "system_prompt": "hi" }));
        i.kind = DefinitionKind::Persona;
        let t = transform(&i).unwrap();
        assert_eq!(t.content, json!({ "system_prompt": "hi" }));
        assert!(t.nodes.is_empty());
    }
}
