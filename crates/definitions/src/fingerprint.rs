//! Deterministic content fingerprinting.
//!
//! The hash covers structural content only: schemas, nodes sorted by ref,
//! transitions sorted by (from_ref, to_ref, priority), with every object
//! key recursively sorted. Identity (names, refs of transitions), tags,
//! timestamps, and ownership never enter the hash, so two authors writing
//! the same graph in different key orders produce the same fingerprint.

use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use weft_domain::definition::DefinitionKind;
use weft_domain::{Error, Result};

use crate::draft::CreateDefinition;

/// Hex SHA-256 of the normalized structural content.
pub fn fingerprint(input: &CreateDefinition) -> Result<String> {
    let structural = match input.kind {
        DefinitionKind::Workflow => workflow_structural(input)?,
        _ => input.content.clone(),
    };
    let canonical = canonical_string(&structural);
    let digest = Sha256::digest(canonical.as_bytes());
    Ok(hex::encode(digest))
}

fn workflow_structural(input: &CreateDefinition) -> Result<Value> {
    let draft = input
        .draft_workflow()
        .map_err(|e| Error::validation("content", format!("not a workflow draft: {e}")))?;

    let mut nodes: Vec<Value> = draft
        .nodes
        .iter()
        .map(|n| serde_json::to_value(n).map_err(Error::Json))
        .collect::<Result<_>>()?;
    nodes.sort_by(|a, b| {
        let ra = a.get("ref").and_then(Value::as_str).unwrap_or("");
        let rb = b.get("ref").and_then(Value::as_str).unwrap_or("");
        ra.cmp(rb)
    });

    let mut transitions: Vec<Value> = draft
        .transitions
        .iter()
        .map(|t| {
            let mut v = serde_json::to_value(t).map_err(Error::Json)?;
            // The transition ref is an author label, not structure.
            if let Some(obj) = v.as_object_mut() {
                obj.remove("ref");
            }
            Ok(v)
        })
        .collect::<Result<_>>()?;
    transitions.sort_by(|a, b| {
        let key = |v: &Value| {
            (
                v.get("from_node_ref")
                    .and_then(Value::as_str)
                    .unwrap_or("")
                    .to_string(),
                v.get("to_node_ref")
                    .and_then(Value::as_str)
                    .unwrap_or("")
                    .to_string(),
                v.get("priority").and_then(Value::as_i64).unwrap_or(0),
            )
        };
        key(a).cmp(&key(b))
    });

    let mut structural = Map::new();
    structural.insert("initial_node_ref".into(), Value::String(draft.initial_node_ref));
    structural.insert("nodes".into(), Value::Array(nodes));
    structural.insert("transitions".into(), Value::Array(transitions));
    if let Some(s) = draft.input_schema {
        structural.insert("input_schema".into(), s);
    }
    if let Some(s) = draft.output_schema {
        structural.insert("output_schema".into(), s);
    }
    if let Some(s) = draft.context_schema {
        structural.insert("context_schema".into(), s);
    }
    if !draft.output_mapping.is_empty() {
        structural.insert(
            "output_mapping".into(),
            serde_json::to_value(&draft.output_mapping)?,
        );
    }
    Ok(Value::Object(structural))
}

/// Compact JSON with recursively sorted object keys.
fn canonical_string(v: &Value) -> String {
    let mut out = String::new();
    write_canonical(v, &mut out);
    out
}

fn write_canonical(v: &Value, out: &mut String) {
    match v {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String((*key).clone()).to_string());
                out.push(':');
                write_canonical(&map[*key], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn workflow(content: Value) -> CreateDefinition {
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
    fn canonical_sorts_keys_recursively() {
        let a = json!({ "b": { "y": 1, "x": 2 }, "a": 3 });
        let b = json!({ "a": 3, "b": { "x": 2, "y": 1 } });
        assert_eq!(canonical_string(&a), canonical_string(&b));
        assert_eq!(canonical_string(&a), r#"{"a":3,"b":{"x":2,"y":1}}"#);
    }

    #[test]
    fn stable_under_key_reordering() {
        let h1 = fingerprint(&workflow(json!({
            "initial_node_ref": "a",
            "nodes": [{ "ref": "a", "name": "A" }],
            "transitions": []
        })))
        .unwrap();
        let h2 = fingerprint(&workflow(json!({
            "transitions": [],
            "nodes": [{ "name": "A", "ref": "a" }],
            "initial_node_ref": "a"
        })))
        .unwrap();
        assert_eq!(h1, h2);
    }

    #[test]
    fn stable_under_node_reordering() {
        let h1 = fingerprint(&workflow(json!({
            "initial_node_ref": "a",
            "nodes": [{ "ref": "a" }, { "ref": "b" }]
        })))
        .unwrap();
        let h2 = fingerprint(&workflow(json!({
            "initial_node_ref": "a",
            "nodes": [{ "ref": "b" }, { "ref": "a" }]
        })))
        .unwrap();
        assert_eq!(h1, h2);
    }

    #[test]
    fn transition_ref_is_not_structural() {
        let h1 = fingerprint(&workflow(json!({
            "initial_node_ref": "a",
            "nodes": [{ "ref": "a" }, { "ref": "b" }],
            "transitions": [{ "ref": "t1", "from_node_ref": "a", "to_node_ref": "b" }]
        })))
        .unwrap();
        let h2 = fingerprint(&workflow(json!({
            "initial_node_ref": "a",
            "nodes": [{ "ref": "a" }, { "ref": "b" }],
            "transitions": [{ "ref": "renamed", "from_node_ref": "a", "to_node_ref": "b" }]
        })))
        .unwrap();
        assert_eq!(h1, h2);
    }

    #[test]
    fn priority_change_bumps_hash() {
        let h1 = fingerprint(&workflow(json!({
            "initial_node_ref": "a",
            "nodes": [{ "ref": "a" }, { "ref": "b" }],
            "transitions": [{ "from_node_ref": "a", "to_node_ref": "b", "priority": 0 }]
        })))
        .unwrap();
        let h2 = fingerprint(&workflow(json!({
            "initial_node_ref": "a",
            "nodes": [{ "ref": "a" }, { "ref": "b" }],
            "transitions": [{ "from_node_ref": "a", "to_node_ref": "b", "priority": 5 }]
        })))
        .unwrap();
        assert_ne!(h1, h2);
    }

    #[test]
    fn non_workflow_hashes_raw_content() {
        let mut p1 = workflow(json!({ "system_prompt": "x", "tool_ids": ["a"] }));
        p1.kind = DefinitionKind::Persona;
        let mut p2 = workflow(json!({ "tool_ids": ["a"], "system_prompt": "x" }));
        p2.kind = DefinitionKind::Persona;
        assert_eq!(fingerprint(&p1).unwrap(), fingerprint(&p2).unwrap());
    }
}
