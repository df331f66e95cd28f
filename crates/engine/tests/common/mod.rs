//! Shared fixtures for engine integration tests.
#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use uuid::Uuid;

use weft_definitions::CreateDefinition;
use weft_domain::config::Config;
use weft_domain::conversation::{Turn, TurnStatus};
use weft_domain::definition::DefinitionKind;
use weft_domain::event::{EventKind, WorkflowEvent};
use weft_domain::run::WorkflowRun;
use weft_engine::{DefaultExecutor, Runtime};
use weft_llm::MockLlm;
pub use weft_store::Store;
use weft_store::MemoryStore;

pub const PROJECT: &str = "p1";

pub fn owner() -> weft_domain::definition::Owner {
    weft_domain::definition::Owner::Project(PROJECT.into())
}

/// Runtime over a fresh in-memory store with fast flush intervals.
pub fn engine(llm: MockLlm) -> Arc<Runtime> {
    engine_with_config(llm, Config::default())
}

pub fn engine_with_config(llm: MockLlm, mut config: Config) -> Arc<Runtime> {
    config.streamer.flush_interval_ms = 10;
    let store = Arc::new(MemoryStore::new());
    let llm = Arc::new(llm);
    let executor = Arc::new(DefaultExecutor::new(store.clone(), llm.clone()));
    Runtime::new(store, llm, executor, config)
}

pub async fn create_def(rt: &Runtime, kind: DefinitionKind, name: &str, content: Value) -> String {
    rt.definitions
        .create(CreateDefinition {
            kind,
            name: name.into(),
            reference: None,
            description: None,
            project_id: Some(PROJECT.into()),
            library_id: None,
            content,
            autoversion: true,
            force: false,
            version: None,
        })
        .await
        .expect("definition create")
        .definition
        .id
}

/// An action-backed task with a mock behavior.
pub async fn mock_task(
    rt: &Runtime,
    name: &str,
    result: Value,
    delay_ms: Option<u64>,
) -> String {
    let action_id = create_def(
        rt,
        DefinitionKind::Action,
        &format!("{name}-action"),
        json!({ "type": "mock", "result": result, "delay_ms": delay_ms }),
    )
    .await;
    create_def(
        rt,
        DefinitionKind::Task,
        name,
        json!({ "target": "action", "action_id": action_id }),
    )
    .await
}

pub async fn failing_task(rt: &Runtime, name: &str, message: &str) -> String {
    let action_id = create_def(
        rt,
        DefinitionKind::Action,
        &format!("{name}-action"),
        json!({ "type": "mock", "fail": message }),
    )
    .await;
    create_def(
        rt,
        DefinitionKind::Task,
        name,
        json!({ "target": "action", "action_id": action_id }),
    )
    .await
}

/// A workflow whose single node runs a mock task, with the whole task
/// result mapped to `output.<target>`.
pub async fn single_step_workflow(
    rt: &Runtime,
    name: &str,
    result: Value,
    delay_ms: Option<u64>,
    output_target: &str,
) -> String {
    let task_id = mock_task(rt, &format!("{name}-task"), result, delay_ms).await;
    create_def(
        rt,
        DefinitionKind::Workflow,
        name,
        json!({
            "initial_node_ref": "step",
            "nodes": [{ "ref": "step", "task_id": task_id }],
            "transitions": [],
            "output_mapping": [{ "source": "_branch.output", "target": output_target }]
        }),
    )
    .await
}

/// Flush streamers and read a stream's persisted events in sequence order.
pub async fn events(rt: &Runtime, stream_id: &str) -> Vec<WorkflowEvent> {
    rt.flush_streams().await;
    rt.store.list_events(stream_id).await.expect("list events")
}

pub fn count(events: &[WorkflowEvent], kind: EventKind) -> usize {
    events.iter().filter(|e| e.event_type == kind).count()
}

pub fn of_kind<'a>(events: &'a [WorkflowEvent], kind: EventKind) -> Vec<&'a WorkflowEvent> {
    events.iter().filter(|e| e.event_type == kind).collect()
}

/// Sequence of the first event of `kind`; panics when absent.
pub fn first_seq(events: &[WorkflowEvent], kind: EventKind) -> u64 {
    of_kind(events, kind)
        .first()
        .unwrap_or_else(|| panic!("no {kind} event"))
        .sequence
}

/// Assert events are gap-free from 1.
pub fn assert_gap_free(events: &[WorkflowEvent]) {
    for (i, e) in events.iter().enumerate() {
        assert_eq!(e.sequence, i as u64 + 1, "sequence gap at index {i}");
    }
}

pub async fn wait_run_terminal(rt: &Runtime, run_id: Uuid) -> WorkflowRun {
    for _ in 0..400 {
        if let Ok(run) = rt.get_run(run_id).await {
            if run.status.is_terminal() {
                return run;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("run {run_id} did not reach a terminal status");
}

pub async fn wait_turn_terminal(rt: &Runtime, turn_id: Uuid) -> Turn {
    for _ in 0..400 {
        if let Ok(Some(turn)) = rt.store.get_turn(turn_id).await {
            if turn.status != TurnStatus::Active {
                return turn;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("turn {turn_id} did not finish");
}

pub async fn wait_turn_completed(rt: &Runtime, turn_id: Uuid) -> Turn {
    let turn = wait_turn_terminal(rt, turn_id).await;
    assert_eq!(turn.status, TurnStatus::Completed, "turn failed: {:?}", turn.error);
    turn
}

/// Metadata turn id of an event, when present.
pub fn event_turn_id(event: &WorkflowEvent) -> Option<String> {
    event
        .metadata
        .get("turn_id")
        .and_then(Value::as_str)
        .map(str::to_owned)
}
