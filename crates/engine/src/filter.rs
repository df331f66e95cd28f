//! Subscriber filters for live event/trace broadcast.
//!
//! Absent fields do not restrict. Wire-facing field names are camelCase to
//! match the subscription message shape.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use weft_domain::event::{ExecutionType, WorkflowEvent};
use weft_domain::trace::{TraceCategory, TraceEvent};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SubscriberFilter {
    pub stream_id: Option<String>,
    pub execution_id: Option<String>,
    pub execution_type: Option<ExecutionType>,
    pub project_id: Option<String>,
    /// Exact event type match.
    pub event_type: Option<String>,
    /// Any-of event type match.
    pub event_types: Option<Vec<String>>,
    pub node_id: Option<String>,
    pub token_id: Option<Uuid>,
    /// Trace category match.
    pub category: Option<TraceCategory>,
    /// Trace kind match.
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub min_duration_ms: Option<u64>,
}

impl SubscriberFilter {
    pub fn for_stream(stream_id: impl Into<String>) -> Self {
        Self {
            stream_id: Some(stream_id.into()),
            ..Default::default()
        }
    }

    pub fn matches_event(&self, event: &WorkflowEvent) -> bool {
        if let Some(s) = &self.stream_id {
            if &event.stream_id != s {
                return false;
            }
        }
        if let Some(e) = &self.execution_id {
            if &event.execution_id != e {
                return false;
            }
        }
        if let Some(t) = self.execution_type {
            if event.execution_type != t {
                return false;
            }
        }
        if let Some(p) = &self.project_id {
            if event.project_id.as_deref() != Some(p.as_str()) {
                return false;
            }
        }
        if let Some(et) = &self.event_type {
            if event.event_type.as_str() != et {
                return false;
            }
        }
        if let Some(types) = &self.event_types {
            if !types.iter().any(|t| t == event.event_type.as_str()) {
                return false;
            }
        }
        if let Some(n) = &self.node_id {
            if event.node_id.as_deref() != Some(n.as_str()) {
                return false;
            }
        }
        if let Some(t) = self.token_id {
            if event.token_id != Some(t) {
                return false;
            }
        }
        true
    }

    pub fn matches_trace(&self, trace: &TraceEvent) -> bool {
        if let Some(s) = &self.stream_id {
            if &trace.stream_id != s {
                return false;
            }
        }
        if let Some(e) = &self.execution_id {
            if &trace.execution_id != e {
                return false;
            }
        }
        if let Some(t) = self.execution_type {
            if trace.execution_type != t {
                return false;
            }
        }
        if let Some(c) = self.category {
            if trace.category != c {
                return false;
            }
        }
        if let Some(k) = &self.kind {
            if &trace.kind != k {
                return false;
            }
        }
        if let Some(min) = self.min_duration_ms {
            if trace.duration_ms.unwrap_or(0) < min {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;
    use weft_domain::event::EventKind;

    fn event(event_type: EventKind, node: Option<&str>) -> WorkflowEvent {
        WorkflowEvent {
            id: Uuid::new_v4(),
            stream_id: "s1".into(),
            execution_id: "s1".into(),
            execution_type: ExecutionType::Workflow,
            project_id: Some("p1".into()),
            sequence: 1,
            event_type,
            timestamp: Utc::now(),
            node_id: node.map(str::to_owned),
            token_id: None,
            metadata: serde_json::Value::Null,
        }
    }

    fn trace(category: TraceCategory, kind: &str, duration_ms: Option<u64>) -> TraceEvent {
        TraceEvent {
            id: Uuid::new_v4(),
            stream_id: "s1".into(),
            execution_id: "s1".into(),
            execution_type: ExecutionType::Workflow,
            sequence: 1,
            category,
            kind: kind.into(),
            duration_ms,
            payload: serde_json::Value::Null,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn empty_filter_matches_everything() {
        let f = SubscriberFilter::default();
        assert!(f.matches_event(&event(EventKind::WorkflowStarted, None)));
        assert!(f.matches_trace(&trace(TraceCategory::Debug, "debug", None)));
    }

    #[test]
    fn event_type_exact_and_any_of() {
        let mut f = SubscriberFilter::default();
        f.event_type = Some("workflow.started".into());
        assert!(f.matches_event(&event(EventKind::WorkflowStarted, None)));
        assert!(!f.matches_event(&event(EventKind::WorkflowCompleted, None)));

        let mut f = SubscriberFilter::default();
        f.event_types = Some(vec!["token.created".into(), "token.completed".into()]);
        assert!(f.matches_event(&event(EventKind::TokenCreated, None)));
        assert!(!f.matches_event(&event(EventKind::WorkflowStarted, None)));
    }

    #[test]
    fn node_and_project_filters() {
        let mut f = SubscriberFilter::default();
        f.node_id = Some("n1".into());
        assert!(f.matches_event(&event(EventKind::TaskDispatched, Some("n1"))));
        assert!(!f.matches_event(&event(EventKind::TaskDispatched, Some("n2"))));
        assert!(!f.matches_event(&event(EventKind::TaskDispatched, None)));

        let mut f = SubscriberFilter::default();
        f.project_id = Some("other".into());
        assert!(!f.matches_event(&event(EventKind::TaskDispatched, None)));
    }

    #[test]
    fn trace_category_kind_and_duration() {
        let mut f = SubscriberFilter::default();
        f.category = Some(TraceCategory::Sql);
        f.min_duration_ms = Some(10);
        assert!(f.matches_trace(&trace(TraceCategory::Sql, "sql", Some(25))));
        assert!(!f.matches_trace(&trace(TraceCategory::Sql, "sql", Some(5))));
        assert!(!f.matches_trace(&trace(TraceCategory::Sql, "sql", None)));
        assert!(!f.matches_trace(&trace(TraceCategory::Debug, "debug", Some(25))));
    }

    #[test]
    fn camel_case_wire_shape() {
        let f: SubscriberFilter = serde_json::from_value(json!({
            "streamId": "s1",
            "eventTypes": ["turn.completed"],
            "minDurationMs": 5,
            "type": "route"
        }))
        .unwrap();
        assert_eq!(f.stream_id.as_deref(), Some("s1"));
        assert_eq!(f.min_duration_ms, Some(5));
        assert_eq!(f.kind.as_deref(), Some("route"));
    }
}
