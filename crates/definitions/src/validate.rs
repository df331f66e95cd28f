//! Pure validation of authored definitions before any id is minted.

use std::collections::HashSet;
use std::str::FromStr;

use weft_domain::definition::{DefinitionKind, SyncStrategy};
use weft_domain::{Error, Result};

use crate::draft::{CreateDefinition, DraftWorkflow};

/// Validate a create request. Returns the first violated invariant as a
/// Validation error naming the offending field.
pub fn validate(input: &CreateDefinition) -> Result<()> {
    if input.name.trim().is_empty() {
        return Err(Error::validation("name", "must not be empty"));
    }
    validate_owner(input)?;

    if input.kind == DefinitionKind::Workflow {
        let draft = input
            .draft_workflow()
            .map_err(|e| Error::validation("content", format!("not a workflow draft: {e}")))?;
        validate_workflow(&draft)?;
    }

    Ok(())
}

fn validate_owner(input: &CreateDefinition) -> Result<()> {
    let has_project = input.project_id.is_some();
    let has_library = input.library_id.is_some();

    if input.kind.requires_exclusive_owner() {
        if has_project == has_library {
            return Err(Error::validation(
                "project_id/library_id",
                "exactly one of project_id or library_id must be set",
            ));
        }
    } else if input.kind == DefinitionKind::Persona && !has_project && !has_library {
        return Err(Error::validation(
            "project_id/library_id",
            "persona requires a project_id or library_id",
        ));
    }
    Ok(())
}

fn validate_workflow(draft: &DraftWorkflow) -> Result<()> {
    if draft.nodes.is_empty() {
        return Err(Error::validation("nodes", "workflow needs at least one node"));
    }

    // Node refs unique.
    let mut node_refs = HashSet::new();
    for node in &draft.nodes {
        if node.r#ref.trim().is_empty() {
            return Err(Error::validation("nodes[].ref", "must not be empty"));
        }
        if !node_refs.insert(node.r#ref.as_str()) {
            return Err(Error::validation(
                "nodes[].ref",
                format!("duplicate node ref '{}'", node.r#ref),
            ));
        }
    }

    // Initial node resolves.
    if !node_refs.contains(draft.initial_node_ref.as_str()) {
        return Err(Error::validation(
            "initial_node_ref",
            format!("'{}' is not a node ref", draft.initial_node_ref),
        ));
    }

    // Transition endpoints resolve; transition refs unique; declared
    // sibling groups collected for sync checks.
    let mut transition_refs = HashSet::new();
    let mut declared_groups = HashSet::new();
    for (i, t) in draft.transitions.iter().enumerate() {
        if let Some(r) = &t.r#ref {
            if !transition_refs.insert(r.as_str()) {
                return Err(Error::validation(
                    "transitions[].ref",
                    format!("duplicate transition ref '{r}'"),
                ));
            }
        }
        if !node_refs.contains(t.from_node_ref.as_str()) {
            return Err(Error::validation(
                format!("transitions[{i}].from_node_ref"),
                format!("'{}' is not a node ref", t.from_node_ref),
            ));
        }
        if !node_refs.contains(t.to_node_ref.as_str()) {
            return Err(Error::validation(
                format!("transitions[{i}].to_node_ref"),
                format!("'{}' is not a node ref", t.to_node_ref),
            ));
        }
        if let Some(n) = t.spawn_count {
            if n < 1 {
                return Err(Error::validation(
                    format!("transitions[{i}].spawn_count"),
                    "must be >= 1",
                ));
            }
        }
        if let Some(f) = &t.foreach {
            if f.item_var.trim().is_empty() {
                return Err(Error::validation(
                    format!("transitions[{i}].foreach.item_var"),
                    "must not be empty",
                ));
            }
        }
        if let Some(lc) = &t.loop_config {
            if lc.max_iterations < 1 {
                return Err(Error::validation(
                    format!("transitions[{i}].loop_config.max_iterations"),
                    "must be >= 1",
                ));
            }
        }
        if let Some(group) = &t.sibling_group {
            declared_groups.insert(group.as_str());
        }
    }

    // Synchronization blocks reference a declared group and a valid strategy.
    for (i, t) in draft.transitions.iter().enumerate() {
        let Some(sync) = &t.synchronization else {
            continue;
        };
        SyncStrategy::from_str(&sync.strategy)?;
        if !declared_groups.contains(sync.sibling_group.as_str()) {
            return Err(Error::validation(
                format!("transitions[{i}].synchronization.sibling_group"),
                format!(
                    "group '{}' is not declared on any transition",
                    sync.sibling_group
                ),
            ));
        }
        if let Some(on_timeout) = &sync.on_timeout {
            if on_timeout != "proceed_with_available" && on_timeout != "fail" {
                return Err(Error::validation(
                    format!("transitions[{i}].synchronization.on_timeout"),
                    "must be proceed_with_available | fail",
                ));
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn workflow_input(content: serde_json::Value) -> CreateDefinition {
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

    fn minimal_graph() -> serde_json::Value {
        json!({
            "initial_node_ref": "start",
            "nodes": [{ "ref": "start" }, { "ref": "end" }],
            "transitions": [
                { "from_node_ref": "start", "to_node_ref": "end" }
            ]
        })
    }

    #[test]
    fn accepts_minimal_workflow() {
        assert!(validate(&workflow_input(minimal_graph())).is_ok());
    }

    #[test]
    fn rejects_duplicate_node_refs() {
        let input = workflow_input(json!({
            "initial_node_ref": "a",
            "nodes": [{ "ref": "a" }, { "ref": "a" }]
        }));
        let err = validate(&input).unwrap_err();
        assert!(err.to_string().contains("duplicate node ref"));
    }

    #[test]
    fn rejects_unresolved_transition_endpoint() {
        let input = workflow_input(json!({
            "initial_node_ref": "a",
            "nodes": [{ "ref": "a" }],
            "transitions": [{ "from_node_ref": "a", "to_node_ref": "ghost" }]
        }));
        assert!(validate(&input).is_err());
    }

    #[test]
    fn rejects_unresolved_initial_node() {
        let input = workflow_input(json!({
            "initial_node_ref": "ghost",
            "nodes": [{ "ref": "a" }]
        }));
        assert!(validate(&input).is_err());
    }

    #[test]
    fn rejects_undeclared_sibling_group() {
        let input = workflow_input(json!({
            "initial_node_ref": "a",
            "nodes": [{ "ref": "a" }, { "ref": "b" }],
            "transitions": [{
                "from_node_ref": "a",
                "to_node_ref": "b",
                "synchronization": { "strategy": "all", "sibling_group": "G" }
            }]
        }));
        let err = validate(&input).unwrap_err();
        assert!(err.to_string().contains("not declared"));
    }

    #[test]
    fn accepts_declared_sibling_group() {
        let input = workflow_input(json!({
            "initial_node_ref": "a",
            "nodes": [{ "ref": "a" }, { "ref": "b" }, { "ref": "c" }],
            "transitions": [
                {
                    "from_node_ref": "a",
                    "to_node_ref": "b",
                    "spawn_count": 3,
                    "sibling_group": "G"
                },
                {
                    "from_node_ref": "b",
                    "to_node_ref": "c",
                    "synchronization": { "strategy": "m_of_n:2", "sibling_group": "G" }
                }
            ]
        }));
        assert!(validate(&input).is_ok());
    }

    #[test]
    fn rejects_bad_strategy() {
        let input = workflow_input(json!({
            "initial_node_ref": "a",
            "nodes": [{ "ref": "a" }, { "ref": "b" }],
            "transitions": [
                { "from_node_ref": "a", "to_node_ref": "b", "sibling_group": "G" },
                {
                    "from_node_ref": "a",
                    "to_node_ref": "b",
                    "synchronization": { "strategy": "m_of_n:0", "sibling_group": "G" }
                }
            ]
        }));
        assert!(validate(&input).is_err());
    }

    #[test]
    fn owner_exclusivity() {
        let mut input = workflow_input(minimal_graph());
        input.library_id = Some("l1".into());
        assert!(validate(&input).is_err());

        input.project_id = None;
        assert!(validate(&input).is_ok());

        input.library_id = None;
        assert!(validate(&input).is_err());
    }

    #[test]
    fn persona_requires_some_owner() {
        let input = CreateDefinition {
            kind: DefinitionKind::Persona,
            name: "helper".into(),
            reference: None,
            description: None,
            project_id: None,
            library_id: None,
            content: json!({ "system_prompt": "be helpful" }),
            autoversion: true,
            force: false,
            version: None,
        };
        assert!(validate(&input).is_err());
    }
}
