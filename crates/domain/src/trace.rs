//! Trace events — the engine's second, higher-volume stream: decisions,
//! operations, dispatches, storage calls, and debug breadcrumbs.
//!
//! Inputs are a tagged sum on `category` with kind-specific payloads; the
//! streamer assigns id/sequence/timestamp and stores [`TraceEvent`] rows on
//! a counter separate from the event stream.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::event::ExecutionType;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TraceCategory {
    Decision,
    Operation,
    Dispatch,
    Sql,
    Debug,
}

/// Emit input for a trace event.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "category", rename_all = "snake_case")]
pub enum TraceInput {
    /// A routing/sync/completion decision the coordinator took.
    Decision {
        kind: String,
        #[serde(default)]
        payload: Value,
    },
    /// A unit of internal work, optionally timed.
    Operation {
        kind: String,
        #[serde(default)]
        payload: Value,
        #[serde(skip_serializing_if = "Option::is_none")]
        duration_ms: Option<u64>,
    },
    /// An outbound dispatch to another actor or the executor.
    Dispatch {
        kind: String,
        #[serde(default)]
        payload: Value,
    },
    /// A storage round-trip.
    Sql {
        statement: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        duration_ms: Option<u64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        rows: Option<u64>,
    },
    Debug {
        message: String,
        #[serde(default)]
        payload: Value,
    },
}

impl TraceInput {
    pub fn category(&self) -> TraceCategory {
        match self {
            Self::Decision { .. } => TraceCategory::Decision,
            Self::Operation { .. } => TraceCategory::Operation,
            Self::Dispatch { .. } => TraceCategory::Dispatch,
            Self::Sql { .. } => TraceCategory::Sql,
            Self::Debug { .. } => TraceCategory::Debug,
        }
    }

    /// The kind tag within the category.
    pub fn kind(&self) -> &str {
        match self {
            Self::Decision { kind, .. }
            | Self::Operation { kind, .. }
            | Self::Dispatch { kind, .. } => kind,
            Self::Sql { .. } => "sql",
            Self::Debug { .. } => "debug",
        }
    }

    pub fn duration_ms(&self) -> Option<u64> {
        match self {
            Self::Operation { duration_ms, .. } | Self::Sql { duration_ms, .. } => *duration_ms,
            _ => None,
        }
    }

    pub fn payload(&self) -> Value {
        match self {
            Self::Decision { payload, .. }
            | Self::Operation { payload, .. }
            | Self::Dispatch { payload, .. }
            | Self::Debug { payload, .. } => payload.clone(),
            Self::Sql {
                statement, rows, ..
            } => serde_json::json!({ "statement": statement, "rows": rows }),
        }
    }
}

/// A stored trace row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceEvent {
    pub id: Uuid,
    pub stream_id: String,
    pub execution_id: String,
    pub execution_type: ExecutionType,
    pub sequence: u64,
    pub category: TraceCategory,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(default)]
    pub payload: Value,
    pub timestamp: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn category_tagging() {
        let input = TraceInput::Decision {
            kind: "route".into(),
            payload: json!({ "transition": "t1" }),
        };
        assert_eq!(input.category(), TraceCategory::Decision);
        assert_eq!(input.kind(), "route");

        let v = serde_json::to_value(&input).unwrap();
        assert_eq!(v["category"], "decision");
    }

    #[test]
    fn sql_payload_carries_statement() {
        let input = TraceInput::Sql {
            statement: "insert workflow_events".into(),
            duration_ms: Some(3),
            rows: Some(7),
        };
        assert_eq!(input.kind(), "sql");
        assert_eq!(input.duration_ms(), Some(3));
        assert_eq!(input.payload()["rows"], 7);
    }

    #[test]
    fn trace_event_type_field_name() {
        let row = TraceEvent {
            id: Uuid::new_v4(),
            stream_id: "s".into(),
            execution_id: "s".into(),
            execution_type: ExecutionType::Workflow,
            sequence: 1,
            category: TraceCategory::Operation,
            kind: "tick".into(),
            duration_ms: None,
            payload: Value::Null,
            timestamp: Utc::now(),
        };
        let v = serde_json::to_value(&row).unwrap();
        assert_eq!(v["type"], "tick");
    }
}
