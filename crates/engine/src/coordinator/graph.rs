//! Indexed view over a workflow definition's graph content.

use std::collections::HashMap;

use weft_domain::definition::{MappingRule, Node, Transition, WorkflowContent};

pub struct Graph {
    content: WorkflowContent,
    node_idx: HashMap<String, usize>,
    /// Node id → outgoing transition indices, sorted by (priority, id) for
    /// deterministic routing.
    outgoing: HashMap<String, Vec<usize>>,
    transition_idx: HashMap<String, usize>,
    /// Sibling group → transition ids declaring it on a fan-out.
    groups: HashMap<String, Vec<String>>,
}

impl Graph {
    pub fn new(content: WorkflowContent) -> Self {
        let mut node_idx = HashMap::new();
        for (i, node) in content.nodes.iter().enumerate() {
            node_idx.insert(node.id.clone(), i);
        }

        let mut transition_idx = HashMap::new();
        let mut outgoing: HashMap<String, Vec<usize>> = HashMap::new();
        let mut groups: HashMap<String, Vec<String>> = HashMap::new();
        for (i, t) in content.transitions.iter().enumerate() {
            transition_idx.insert(t.id.clone(), i);
            outgoing.entry(t.from_node_id.clone()).or_default().push(i);
            if let Some(group) = &t.sibling_group {
                groups.entry(group.clone()).or_default().push(t.id.clone());
            }
        }
        for indices in outgoing.values_mut() {
            indices.sort_by(|a, b| {
                let ta = &content.transitions[*a];
                let tb = &content.transitions[*b];
                (ta.priority, &ta.id).cmp(&(tb.priority, &tb.id))
            });
        }

        Self {
            content,
            node_idx,
            outgoing,
            transition_idx,
            groups,
        }
    }

    pub fn initial_node_id(&self) -> &str {
        &self.content.initial_node_id
    }

    pub fn node(&self, id: &str) -> Option<&Node> {
        self.node_idx.get(id).map(|i| &self.content.nodes[*i])
    }

    pub fn transition(&self, id: &str) -> Option<&Transition> {
        self.transition_idx
            .get(id)
            .map(|i| &self.content.transitions[*i])
    }

    pub fn outgoing(&self, node_id: &str) -> Vec<&Transition> {
        self.outgoing
            .get(node_id)
            .map(|indices| {
                indices
                    .iter()
                    .map(|i| &self.content.transitions[*i])
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Transition ids declaring `group` as their sibling group.
    pub fn group_transitions(&self, group: &str) -> &[String] {
        self.groups
            .get(group)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn output_mapping(&self) -> &[MappingRule] {
        &self.content.output_mapping
    }

    pub fn output_schema(&self) -> Option<&serde_json::Value> {
        self.content.output_schema.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use weft_domain::definition::Node;

    fn node(id: &str) -> Node {
        Node {
            id: id.into(),
            r#ref: id.into(),
            name: id.into(),
            task_id: None,
            task_version: None,
            input_mapping: Default::default(),
            output_mapping: vec![],
            resource_bindings: Default::default(),
            on_failure: Default::default(),
            retry: None,
        }
    }

    fn transition(id: &str, from: &str, to: &str, priority: i32) -> Transition {
        Transition {
            id: id.into(),
            r#ref: None,
            from_node_id: from.into(),
            to_node_id: to.into(),
            priority,
            condition: None,
            condition_source: None,
            spawn_count: None,
            sibling_group: None,
            foreach: None,
            loop_config: None,
            synchronization: None,
        }
    }

    #[test]
    fn outgoing_sorted_by_priority_then_id() {
        let content = WorkflowContent {
            initial_node_id: "a".into(),
            nodes: vec![node("a"), node("b")],
            transitions: vec![
                transition("t-z", "a", "b", 1),
                transition("t-b", "a", "b", 0),
                transition("t-a", "a", "b", 1),
            ],
            input_schema: None,
            output_schema: None,
            context_schema: None,
            output_mapping: vec![],
        };
        let graph = Graph::new(content);
        let ids: Vec<&str> = graph.outgoing("a").iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, vec!["t-b", "t-a", "t-z"]);
    }

    #[test]
    fn groups_index_fan_out_transitions() {
        let mut t1 = transition("t1", "a", "b", 0);
        t1.sibling_group = Some("G".into());
        t1.spawn_count = Some(3);
        let content = WorkflowContent {
            initial_node_id: "a".into(),
            nodes: vec![node("a"), node("b")],
            transitions: vec![t1],
            input_schema: None,
            output_schema: None,
            context_schema: None,
            output_mapping: vec![],
        };
        let graph = Graph::new(content);
        assert_eq!(graph.group_transitions("G"), &["t1".to_string()]);
        assert!(graph.group_transitions("other").is_empty());
    }
}
