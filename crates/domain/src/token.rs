//! Tokens — live points of execution in a workflow run.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenStatus {
    Pending,
    Dispatched,
    Completed,
    Failed,
    Cancelled,
    Waiting,
}

impl TokenStatus {
    /// Active tokens keep the run alive.
    pub fn is_active(self) -> bool {
        matches!(self, Self::Pending | Self::Dispatched | Self::Waiting)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Token {
    pub id: Uuid,
    pub run_id: Uuid,
    pub node_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_token_id: Option<Uuid>,
    /// Set when this token was spawned by a fan-out transition.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fan_out_transition_id: Option<String>,
    #[serde(default)]
    pub branch_index: u32,
    #[serde(default = "d_one")]
    pub branch_total: u32,
    pub status: TokenStatus,
    /// Dispatch attempt counter (bumped by on_failure=retry).
    #[serde(default)]
    pub attempt: u32,
    /// Per-transition loop counters, forked with the lineage so sibling
    /// branches do not share quota.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub loop_counts: BTreeMap<String, u32>,
    /// Transition id this token is parked on while status is `waiting`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub waiting_on: Option<String>,
    pub created_at: DateTime<Utc>,
}

fn d_one() -> u32 {
    1
}

impl Token {
    /// The token created at the initial node when a run starts.
    pub fn initial(run_id: Uuid, node_id: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            run_id,
            node_id: node_id.into(),
            parent_token_id: None,
            fan_out_transition_id: None,
            branch_index: 0,
            branch_total: 1,
            status: TokenStatus::Pending,
            attempt: 0,
            loop_counts: BTreeMap::new(),
            waiting_on: None,
            created_at: Utc::now(),
        }
    }

    /// A child token created when a transition fires. Fan-out children carry
    /// the fan-out transition id and their branch coordinates; plain routing
    /// passes `None` and (0, 1).
    pub fn child(
        parent: &Token,
        node_id: impl Into<String>,
        fan_out_transition_id: Option<String>,
        branch_index: u32,
        branch_total: u32,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            run_id: parent.run_id,
            node_id: node_id.into(),
            parent_token_id: Some(parent.id),
            fan_out_transition_id,
            branch_index,
            branch_total,
            status: TokenStatus::Pending,
            attempt: 0,
            loop_counts: parent.loop_counts.clone(),
            waiting_on: None,
            created_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn active_statuses() {
        assert!(TokenStatus::Pending.is_active());
        assert!(TokenStatus::Dispatched.is_active());
        assert!(TokenStatus::Waiting.is_active());
        assert!(!TokenStatus::Completed.is_active());
        assert!(!TokenStatus::Failed.is_active());
        assert!(!TokenStatus::Cancelled.is_active());
    }

    #[test]
    fn child_inherits_lineage_and_loop_counts() {
        let run_id = Uuid::new_v4();
        let mut parent = Token::initial(run_id, "n1");
        parent.loop_counts.insert("t1".into(), 2);

        let child = Token::child(&parent, "n2", Some("t2".into()), 1, 3);
        assert_eq!(child.run_id, run_id);
        assert_eq!(child.parent_token_id, Some(parent.id));
        assert_eq!(child.fan_out_transition_id.as_deref(), Some("t2"));
        assert_eq!(child.branch_index, 1);
        assert_eq!(child.branch_total, 3);
        assert_eq!(child.loop_counts.get("t1"), Some(&2));
        // Forked, not shared.
        assert_ne!(child.id, parent.id);
    }
}
