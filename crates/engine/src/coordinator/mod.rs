//! The Workflow Coordinator — a per-run actor driving a definition graph
//! deterministically: token lifecycle, conditional routing, fan-out,
//! fan-in synchronization with merges, loop limits, dispatch of tasks and
//! sub-workflows, snapshots, and events.
//!
//! Every inbox message is one *tick*: apply the message, advance every
//! newly runnable token to quiescence, dispatch, snapshot, emit. The actor
//! never blocks a tick on an external operation; task and sub-workflow
//! results come back as messages.

pub mod graph;

pub use graph::Graph;

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Map, Value};
use tokio::sync::oneshot;
use uuid::Uuid;

use weft_domain::definition::{
    MergeSpec, MergeStrategy, Node, OnFailure, OnTimeout, SyncStrategy, Synchronization,
    TaskContent, Transition, WorkflowContent,
};
use weft_domain::event::{EventInput, EventKind};
use weft_domain::run::{RunStatus, WorkflowRun};
use weft_domain::token::{Token, TokenStatus};
use weft_domain::trace::TraceInput;
use weft_domain::Result;
use weft_store::Store;

use crate::dispatch::{self, ReplyTo};
use crate::emitter::Emitter;
use crate::executor::{TaskExecutor, TaskInvocation};
use crate::mailbox::{mailbox, Addr};
use crate::runtime::{ParentLink, Runtime};
use crate::DispatchResult;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Messages
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub enum RunMsg {
    TaskResult {
        token_id: Uuid,
        result: DispatchResult,
    },
    SubworkflowResult {
        token_id: Uuid,
        result: DispatchResult,
    },
    SyncTimeout {
        transition_id: String,
        anchor_token: Uuid,
    },
    Cancel {
        reply: Option<oneshot::Sender<()>>,
    },
}

/// Spawn the coordinator actor for a run. Performs the start tick (initial
/// token, `workflow.started`, first dispatch) before the actor accepts
/// messages.
///
/// Returns a manually boxed future rather than using `async fn`: the
/// coordinator/dispatch call graph is mutually recursive (a sub-workflow
/// node dispatches back into this function), and an opaque `impl Future`
/// return type here would make that recursion self-referential, which the
/// compiler cannot resolve when checking the inner `tokio::spawn` task for
/// `Send`.
pub fn spawn(
    rt: Arc<Runtime>,
    content: WorkflowContent,
    run: WorkflowRun,
    emitter: Emitter,
    reply: ReplyTo,
) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<Addr<RunMsg>>> + Send>> {
    Box::pin(async move {
        let (addr, mut rx) = mailbox::<RunMsg>();

        let mut actor = Coordinator {
            rt,
            graph: Graph::new(content),
            run,
            emitter,
            addr: addr.clone(),
            reply: Some(reply),
            timers: HashMap::new(),
            outstanding: HashMap::new(),
        };

        tokio::spawn(async move {
            actor.start().await;
            while let Some(msg) = rx.recv().await {
                actor.handle(msg).await;
                if actor.run.status.is_terminal() {
                    break;
                }
            }
        });

        Ok(addr)
    })
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Actor
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// An in-flight external operation owned by one dispatched token.
enum Outstanding {
    Invocation(Uuid),
    ChildRun(Uuid),
}

/// The fan-out instance a token's lineage anchors to: which sibling group
/// fanned out, under which parent token. Keying on the group (rather than
/// one transition id) unifies siblings created by several transitions
/// declaring the same group, while the parent token guards against
/// unrelated fan-outs reusing the name at other nesting depths.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct FanOutInstance {
    parent_token_id: Option<Uuid>,
    group: String,
}

struct Coordinator {
    rt: Arc<Runtime>,
    graph: Graph,
    run: WorkflowRun,
    emitter: Emitter,
    addr: Addr<RunMsg>,
    reply: Option<ReplyTo>,
    /// Armed synchronization timers keyed by (transition, instance).
    timers: HashMap<String, tokio::task::JoinHandle<()>>,
    outstanding: HashMap<Uuid, Outstanding>,
}

impl Coordinator {
    // ── Start tick ───────────────────────────────────────────────────

    async fn start(&mut self) {
        self.emitter.event(
            EventKind::WorkflowStarted,
            json!({
                "workflow_def_id": &self.run.workflow_def_id,
                "workflow_def_version": self.run.workflow_def_version,
                "parent_run_id": self.run.parent_run_id,
            }),
        );

        let token = Token::initial(self.run.id, self.graph.initial_node_id());
        let token_id = token.id;
        self.emit_token_created(&token);
        self.run.tokens.insert(token_id, token);

        let mut ready = VecDeque::new();
        self.dispatch_token(token_id, &mut ready).await;
        self.drain(ready).await;
        self.snapshot().await;
    }

    // ── Tick entry ───────────────────────────────────────────────────

    async fn handle(&mut self, msg: RunMsg) {
        if self.run.status.is_terminal() {
            return;
        }
        match msg {
            RunMsg::TaskResult { token_id, result } => {
                self.on_result(token_id, result, false).await;
            }
            RunMsg::SubworkflowResult { token_id, result } => {
                self.on_result(token_id, result, true).await;
            }
            RunMsg::SyncTimeout {
                transition_id,
                anchor_token,
            } => {
                self.on_sync_timeout(&transition_id, anchor_token).await;
            }
            RunMsg::Cancel { reply } => {
                self.on_cancel("cancelled").await;
                if let Some(reply) = reply {
                    let _ = reply.send(());
                }
            }
        }
        self.snapshot().await;
    }

    // ── Result delivery ──────────────────────────────────────────────

    async fn on_result(&mut self, token_id: Uuid, result: DispatchResult, is_sub: bool) {
        let Some(token) = self.run.tokens.get(&token_id) else {
            tracing::warn!(run_id = %self.run.id, %token_id, "result for unknown token");
            return;
        };
        if token.status != TokenStatus::Dispatched {
            tracing::debug!(run_id = %self.run.id, %token_id, "late result for settled token");
            return;
        }
        let node_id = token.node_id.clone();
        self.outstanding.remove(&token_id);

        match result {
            Ok(value) => {
                let kind = if is_sub {
                    EventKind::SubworkflowCompleted
                } else {
                    EventKind::TaskCompleted
                };
                self.emitter
                    .token_event(kind, token_id, node_id, json!({}));
                self.drain(VecDeque::from([(token_id, value)])).await;
            }
            Err(message) => {
                let kind = if is_sub {
                    EventKind::SubworkflowFailed
                } else {
                    EventKind::TaskFailed
                };
                self.emitter.token_event(
                    kind,
                    token_id,
                    node_id.clone(),
                    json!({ "error": &message }),
                );
                self.on_task_failure(token_id, &node_id, message).await;
            }
        }
    }

    async fn on_task_failure(&mut self, token_id: Uuid, node_id: &str, message: String) {
        let node = match self.graph.node(node_id) {
            Some(n) => n.clone(),
            None => {
                self.fail_run("internal", format!("node {node_id} missing")).await;
                return;
            }
        };

        match node.on_failure {
            OnFailure::Retry => {
                let allowed = node.retry.map(|r| r.max_attempts).unwrap_or(1);
                let attempt = self
                    .run
                    .token(token_id)
                    .map(|t| t.attempt)
                    .unwrap_or(0);
                if attempt + 1 < allowed {
                    if let Some(token) = self.run.token_mut(token_id) {
                        token.attempt += 1;
                        token.status = TokenStatus::Pending;
                    }
                    self.emitter.decision(
                        "retry",
                        json!({ "token_id": token_id, "attempt": attempt + 1 }),
                    );
                    let mut ready = VecDeque::new();
                    self.dispatch_token(token_id, &mut ready).await;
                    self.drain(ready).await;
                    return;
                }
                self.fail_token_and_run(token_id, message).await;
            }
            OnFailure::Continue => {
                // Route as on success with a sentinel error value.
                self.drain(VecDeque::from([(token_id, json!({ "error": message }))]))
                    .await;
            }
            OnFailure::Abort => {
                self.fail_token_and_run(token_id, message).await;
            }
        }
    }

    async fn fail_token_and_run(&mut self, token_id: Uuid, message: String) {
        if let Some(token) = self.run.token_mut(token_id) {
            token.status = TokenStatus::Failed;
            let node_id = token.node_id.clone();
            self.emitter.token_event(
                EventKind::TokenFailed,
                token_id,
                node_id,
                json!({ "error": &message }),
            );
        }
        self.fail_run("task_failure", message).await;
    }

    // ── Advance loop ─────────────────────────────────────────────────

    /// Settle completed tokens until no immediately-runnable work remains,
    /// then check run completion.
    async fn drain(&mut self, mut ready: VecDeque<(Uuid, Value)>) {
        while let Some((token_id, value)) = ready.pop_front() {
            if self.run.status.is_terminal() {
                return;
            }
            self.settle_token(token_id, value, &mut ready).await;
        }
        self.check_completion().await;
    }

    /// One token's completion: record its result, route, fire transitions.
    async fn settle_token(
        &mut self,
        token_id: Uuid,
        value: Value,
        ready: &mut VecDeque<(Uuid, Value)>,
    ) {
        let Some(token) = self.run.tokens.get(&token_id) else {
            return;
        };
        if !matches!(
            token.status,
            TokenStatus::Pending | TokenStatus::Dispatched
        ) {
            return;
        }
        let node_id = token.node_id.clone();

        // The task result is visible to routing conditions via `_branch`.
        let _ = self
            .run
            .context
            .set_path("_branch.output", value.clone(), Some(token_id));

        // Routing reads the pre-mapping context snapshot.
        let env = self.run.context.env_for(Some(token_id));
        let selected = self.select_transitions(&node_id, &env);

        if let Some(token) = self.run.token_mut(token_id) {
            token.status = TokenStatus::Completed;
        }
        self.emitter
            .token_event(EventKind::TokenCompleted, token_id, node_id.clone(), json!({}));

        // Node output mapping lands after planning, before new tokens.
        self.apply_node_output_mapping(&node_id, token_id, &value);

        if selected.is_empty() {
            // Branch closes; the branch store survives until run completion
            // so terminal output mapping can read it.
            self.emitter.decision(
                "branch_closed",
                json!({ "token_id": token_id, "node_id": node_id }),
            );
            return;
        }

        if selected.len() > 1 || selected.iter().any(|t| t.is_fan_out()) {
            self.emitter.token_event(
                EventKind::FanOutStarted,
                token_id,
                node_id.clone(),
                json!({
                    "transitions": selected.iter().map(|t| t.id.clone()).collect::<Vec<_>>(),
                    "sibling_group": &selected[0].sibling_group,
                }),
            );
        }

        let activated = selected.len() as u32;
        for (i, transition) in selected.into_iter().enumerate() {
            if self.run.status.is_terminal() {
                return;
            }
            // When several sibling transitions activate together they form
            // one fan-out; each carries its branch coordinates.
            let group_branch = transition
                .sibling_group
                .as_ref()
                .map(|_| (i as u32, activated));
            self.fire_transition(token_id, &transition, &env, group_branch, ready)
                .await;
        }
    }

    /// Routing: sorted outgoing transitions; first condition match is the
    /// primary; transitions sharing the primary's sibling group activate
    /// with it.
    fn select_transitions(&self, node_id: &str, env: &Value) -> Vec<Transition> {
        let outgoing = self.graph.outgoing(node_id);
        let mut primary: Option<&Transition> = None;
        for t in &outgoing {
            let matched = match &t.condition {
                None => true,
                Some(cond) => match cond.evaluate_bool(env) {
                    Ok(b) => b,
                    Err(e) => {
                        tracing::warn!(
                            run_id = %self.run.id,
                            transition = %t.id,
                            error = %e,
                            "condition evaluation failed, treating as false"
                        );
                        false
                    }
                },
            };
            if matched {
                primary = Some(t);
                break;
            }
        }

        let Some(primary) = primary else {
            return Vec::new();
        };

        let selected: Vec<Transition> = match &primary.sibling_group {
            Some(group) => outgoing
                .iter()
                .filter(|t| t.sibling_group.as_deref() == Some(group))
                .map(|t| (*t).clone())
                .collect(),
            None => vec![primary.clone()],
        };

        self.emitter.decision(
            "route",
            json!({
                "node_id": node_id,
                "primary": &primary.id,
                "selected": selected.iter().map(|t| t.id.clone()).collect::<Vec<_>>(),
            }),
        );
        selected
    }

    fn apply_node_output_mapping(&mut self, node_id: &str, token_id: Uuid, result: &Value) {
        let Some(node) = self.graph.node(node_id) else {
            return;
        };
        if node.output_mapping.is_empty() {
            return;
        }
        let rules = node.output_mapping.clone();
        let mut env = self.run.context.env_for(Some(token_id));
        if let Some(obj) = env.as_object_mut() {
            obj.insert("result".into(), result.clone());
        }
        for rule in rules {
            let segs: Vec<String> = rule.source.split('.').map(str::to_owned).collect();
            let value = weft_expr::eval::resolve_path(&env, &segs).clone();
            match self
                .run
                .context
                .set_path(&rule.target, value, Some(token_id))
            {
                Ok(()) => self.emitter.event(
                    EventKind::ContextUpdated,
                    json!({ "path": &rule.target, "token_id": token_id }),
                ),
                Err(e) => tracing::warn!(
                    run_id = %self.run.id,
                    target = %rule.target,
                    error = %e,
                    "output mapping write rejected"
                ),
            }
        }
    }

    // ── Firing transitions ───────────────────────────────────────────

    async fn fire_transition(
        &mut self,
        token_id: Uuid,
        transition: &Transition,
        env: &Value,
        group_branch: Option<(u32, u32)>,
        ready: &mut VecDeque<(Uuid, Value)>,
    ) {
        // Loop control is per-token-lineage: the counter travels on the
        // token so forked lineages never share quota.
        let prior = self
            .run
            .token(token_id)
            .and_then(|t| t.loop_counts.get(&transition.id).copied())
            .unwrap_or(0);
        let count = prior + 1;
        if let Some(lc) = &transition.loop_config {
            if count > lc.max_iterations {
                let message = format!(
                    "loop limit exceeded on transition {} (max {})",
                    transition.id, lc.max_iterations
                );
                if let Some(token) = self.run.token_mut(token_id) {
                    token.status = TokenStatus::Failed;
                }
                self.emitter.token_event(
                    EventKind::TokenFailed,
                    token_id,
                    transition.from_node_id.clone(),
                    json!({ "error": &message, "kind": "loop_limit_exceeded" }),
                );
                self.fail_run("loop_limit_exceeded", message).await;
                return;
            }
        }

        if transition.synchronization.is_some() {
            self.arrive_fan_in(token_id, transition, count, ready).await;
            return;
        }

        let parent = match self.run.token(token_id) {
            Some(t) => t.clone(),
            None => return,
        };

        let mut new_tokens: Vec<(Token, Option<Value>)> = Vec::new();
        if let Some(k) = transition.spawn_count {
            for i in 0..k {
                let child = Token::child(
                    &parent,
                    transition.to_node_id.clone(),
                    Some(transition.id.clone()),
                    i,
                    k,
                );
                new_tokens.push((child, None));
            }
        } else if let Some(foreach) = &transition.foreach {
            let collection = match foreach.collection.evaluate(env) {
                Ok(Value::Array(items)) => items,
                Ok(other) => {
                    self.fail_run(
                        "validation",
                        format!(
                            "foreach collection '{}' is not an array (got {other})",
                            foreach.collection_source
                        ),
                    )
                    .await;
                    return;
                }
                Err(e) => {
                    self.fail_run("expression", e.to_string()).await;
                    return;
                }
            };
            let total = collection.len() as u32;
            for (i, element) in collection.into_iter().enumerate() {
                let child = Token::child(
                    &parent,
                    transition.to_node_id.clone(),
                    Some(transition.id.clone()),
                    i as u32,
                    total,
                );
                let seed = json!({ foreach.item_var.clone(): element });
                new_tokens.push((child, Some(seed)));
            }
        } else if transition.sibling_group.is_some() {
            // A group-declaring transition without spawn/foreach is one
            // branch of a multi-transition fan-out.
            let (index, total) = group_branch.unwrap_or((0, 1));
            let child = Token::child(
                &parent,
                transition.to_node_id.clone(),
                Some(transition.id.clone()),
                index,
                total,
            );
            new_tokens.push((child, None));
        } else {
            // Plain routing continues the same branch; the branch store
            // travels with it.
            let child = Token::child(
                &parent,
                transition.to_node_id.clone(),
                None,
                parent.branch_index,
                parent.branch_total,
            );
            let inherited = self.run.context.branch.get(&parent.id).cloned();
            new_tokens.push((child, inherited));
        }

        let mut created = Vec::new();
        for (mut child, seed) in new_tokens {
            child.loop_counts.insert(transition.id.clone(), count);
            let child_id = child.id;
            if let Some(seed) = seed {
                self.run.context.branch.insert(child_id, seed);
            }
            self.emit_token_created(&child);
            self.run.tokens.insert(child_id, child);
            created.push(child_id);
        }

        for child_id in created {
            if self.run.status.is_terminal() {
                return;
            }
            self.dispatch_token(child_id, ready).await;
        }
    }

    // ── Fan-in ───────────────────────────────────────────────────────

    async fn arrive_fan_in(
        &mut self,
        token_id: Uuid,
        transition: &Transition,
        loop_count: u32,
        ready: &mut VecDeque<(Uuid, Value)>,
    ) {
        let Some(sync) = transition.synchronization.clone() else {
            return;
        };
        let group: HashSet<&str> = self
            .graph
            .group_transitions(&sync.sibling_group)
            .iter()
            .map(String::as_str)
            .collect();

        let Some((instance, _root)) =
            self.anchor_instance(token_id, &sync.sibling_group, &group)
        else {
            // No fan-out ancestor in this group: a degenerate single-branch
            // sync. Proceed with the arriving token alone.
            tracing::debug!(
                run_id = %self.run.id,
                group = %sync.sibling_group,
                "fan-in without fan-out ancestor, proceeding alone"
            );
            self.complete_fan_in(transition, &sync, loop_count, vec![token_id], token_id, ready)
                .await;
            return;
        };

        // Branch root → every live token anchored to this instance.
        let branches = self.instance_branches(&instance, &group);
        let total = branches.len();

        // A branch has arrived when its tip is parked on this transition
        // (or is the token being processed now).
        let mut arrived: Vec<(u32, Uuid)> = Vec::new();
        for (root, tokens) in &branches {
            let root_index = self
                .run
                .token(*root)
                .map(|t| t.branch_index)
                .unwrap_or(0);
            for tid in tokens {
                let arrived_here = *tid == token_id
                    || self
                        .run
                        .token(*tid)
                        .map(|t| {
                            t.status == TokenStatus::Waiting
                                && t.waiting_on.as_deref() == Some(transition.id.as_str())
                        })
                        .unwrap_or(false);
                if arrived_here {
                    arrived.push((root_index, *tid));
                    break;
                }
            }
        }
        arrived.sort_by_key(|(idx, _)| *idx);

        let satisfied = match sync.strategy {
            SyncStrategy::Any => !arrived.is_empty(),
            SyncStrategy::All => arrived.len() == total,
            SyncStrategy::MOfN { n } => arrived.len() >= n as usize,
        };

        self.emitter.decision(
            "synchronization",
            json!({
                "transition": &transition.id,
                "sibling_group": &sync.sibling_group,
                "strategy": sync.strategy,
                "arrived": arrived.len(),
                "total": total,
                "satisfied": satisfied,
            }),
        );

        if !satisfied {
            if let Some(token) = self.run.token_mut(token_id) {
                token.status = TokenStatus::Waiting;
                token.waiting_on = Some(transition.id.clone());
            }
            self.emitter.token_event(
                EventKind::TokenWaiting,
                token_id,
                transition.from_node_id.clone(),
                json!({
                    "sibling_group": &sync.sibling_group,
                    "arrived": arrived.len(),
                    "total": total,
                }),
            );
            if let Some(timeout_ms) = sync.timeout_ms {
                self.arm_sync_timer(transition, &instance, token_id, timeout_ms);
            }
            return;
        }

        self.clear_sync_timer(transition, &instance);
        let arrived_ids: Vec<Uuid> = arrived.iter().map(|(_, id)| *id).collect();
        self.complete_fan_in(transition, &sync, loop_count, arrived_ids, token_id, ready)
            .await;
    }

    /// Merge arrived branch values, cancel the losers, and proceed with a
    /// single surviving token.
    async fn complete_fan_in(
        &mut self,
        transition: &Transition,
        sync: &Synchronization,
        loop_count: u32,
        arrived: Vec<Uuid>,
        winner: Uuid,
        ready: &mut VecDeque<(Uuid, Value)>,
    ) {
        if let Some(merge) = &sync.merge {
            self.apply_merge(merge, &arrived, winner);
        }

        // Siblings that arrived but lost, and siblings still in flight,
        // are cancelled with their in-flight work.
        let group: HashSet<&str> = self
            .graph
            .group_transitions(&sync.sibling_group)
            .iter()
            .map(String::as_str)
            .collect();
        let instance = self
            .anchor_instance(winner, &sync.sibling_group, &group)
            .map(|(i, _)| i);
        let mut cancelled: Vec<Uuid> = Vec::new();
        if let Some(instance) = &instance {
            let branches = self.instance_branches(instance, &group);
            for tokens in branches.values() {
                for tid in tokens {
                    if *tid == winner {
                        continue;
                    }
                    let active = self
                        .run
                        .token(*tid)
                        .map(|t| t.status.is_active())
                        .unwrap_or(false);
                    if active {
                        if let Some(token) = self.run.token_mut(*tid) {
                            token.status = TokenStatus::Cancelled;
                            token.waiting_on = None;
                        }
                        self.cancel_outstanding_for(*tid).await;
                        cancelled.push(*tid);
                    }
                }
                // Merged branches drop their private stores.
                for tid in tokens {
                    self.run.context.drop_branch(*tid);
                }
            }
        }
        self.run.context.drop_branch(winner);

        self.emitter.emit(
            EventInput::new(EventKind::FanInCompleted)
                .with_token(winner)
                .with_node(transition.to_node_id.clone())
                .with_metadata(json!({
                    "transition": &transition.id,
                    "sibling_group": &sync.sibling_group,
                    "arrived": arrived.len(),
                })),
        );
        self.emitter.event(
            EventKind::BranchesMerged,
            json!({
                "sibling_group": &sync.sibling_group,
                "merge": sync.merge.as_ref().map(|m| &m.target),
                "cancelled_tokens": cancelled,
            }),
        );

        // Make sure the winner is settled before its successor runs.
        if let Some(token) = self.run.token_mut(winner) {
            if token.status.is_active() {
                token.status = TokenStatus::Completed;
                token.waiting_on = None;
            }
        }

        let Some(parent) = self.run.token(winner).cloned() else {
            return;
        };
        let mut child = Token::child(&parent, transition.to_node_id.clone(), None, 0, 1);
        child.loop_counts.insert(transition.id.clone(), loop_count);
        let child_id = child.id;
        self.emit_token_created(&child);
        self.run.tokens.insert(child_id, child);
        self.dispatch_token(child_id, ready).await;
    }

    fn apply_merge(&mut self, merge: &MergeSpec, arrived: &[Uuid], winner: Uuid) {
        let source_segs: Vec<String> = merge.source.split('.').map(str::to_owned).collect();
        let value_of = |ctx: &weft_domain::run::RunContext, tid: Uuid| -> Value {
            let env = ctx.env_for(Some(tid));
            weft_expr::eval::resolve_path(&env, &source_segs).clone()
        };

        let merged = match merge.strategy {
            MergeStrategy::Append => {
                let mut items = Vec::new();
                for tid in arrived {
                    items.push(value_of(&self.run.context, *tid));
                }
                Value::Array(items)
            }
            MergeStrategy::Collect => {
                let mut items: Vec<Value> = Vec::new();
                for tid in arrived {
                    let v = value_of(&self.run.context, *tid);
                    if !items.contains(&v) {
                        items.push(v);
                    }
                }
                Value::Array(items)
            }
            MergeStrategy::MergeObject => {
                let mut out = Map::new();
                for tid in arrived {
                    if let Value::Object(map) = value_of(&self.run.context, *tid) {
                        for (k, v) in map {
                            out.insert(k, v);
                        }
                    }
                }
                Value::Object(out)
            }
            MergeStrategy::KeyedByBranch => {
                let mut out = Map::new();
                for tid in arrived {
                    let index = self
                        .run
                        .token(*tid)
                        .map(|t| {
                            self.branch_index_of(*tid).unwrap_or(t.branch_index)
                        })
                        .unwrap_or(0);
                    out.insert(index.to_string(), value_of(&self.run.context, *tid));
                }
                Value::Object(out)
            }
            MergeStrategy::LastWins => value_of(&self.run.context, winner),
        };

        match self.run.context.set_path(&merge.target, merged, None) {
            Ok(()) => self.emitter.event(
                EventKind::ContextUpdated,
                json!({ "path": &merge.target, "merge": true }),
            ),
            Err(e) => tracing::warn!(
                run_id = %self.run.id,
                target = %merge.target,
                error = %e,
                "merge write rejected"
            ),
        }
    }

    // ── Lineage helpers ──────────────────────────────────────────────

    /// Walk the lineage (self first) to the nearest token created by a
    /// fan-out transition declaring `group_name`. Returns the instance plus
    /// the branch root (the fan-out child itself).
    fn anchor_instance(
        &self,
        token_id: Uuid,
        group_name: &str,
        group: &HashSet<&str>,
    ) -> Option<(FanOutInstance, Uuid)> {
        let mut cur = Some(token_id);
        while let Some(id) = cur {
            let token = self.run.token(id)?;
            if let Some(ft) = &token.fan_out_transition_id {
                if group.contains(ft.as_str()) {
                    return Some((
                        FanOutInstance {
                            parent_token_id: token.parent_token_id,
                            group: group_name.to_string(),
                        },
                        id,
                    ));
                }
            }
            cur = token.parent_token_id;
        }
        None
    }

    /// Branch root → tokens of every branch anchored to `instance`.
    fn instance_branches(
        &self,
        instance: &FanOutInstance,
        group: &HashSet<&str>,
    ) -> HashMap<Uuid, Vec<Uuid>> {
        let mut branches: HashMap<Uuid, Vec<Uuid>> = HashMap::new();
        for token in self.run.tokens.values() {
            if let Some((i, root)) = self.anchor_instance(token.id, &instance.group, group) {
                if &i == instance {
                    branches.entry(root).or_default().push(token.id);
                }
            }
        }
        branches
    }

    /// The branch index of the fan-out root above a token, if any.
    fn branch_index_of(&self, token_id: Uuid) -> Option<u32> {
        let token = self.run.token(token_id)?;
        if token.fan_out_transition_id.is_some() {
            return Some(token.branch_index);
        }
        self.branch_index_of(token.parent_token_id?)
    }

    // ── Sync timers ──────────────────────────────────────────────────

    fn sync_timer_key(&self, transition: &Transition, instance: &FanOutInstance) -> String {
        format!(
            "{}@{}:{}",
            transition.id,
            instance
                .parent_token_id
                .map(|id| id.to_string())
                .unwrap_or_else(|| "root".into()),
            instance.group
        )
    }

    fn arm_sync_timer(
        &mut self,
        transition: &Transition,
        instance: &FanOutInstance,
        anchor_token: Uuid,
        timeout_ms: u64,
    ) {
        let key = self.sync_timer_key(transition, instance);
        // Refresh: the newest arrival re-arms the window.
        if let Some(handle) = self.timers.remove(&key) {
            handle.abort();
        }
        let addr = self.addr.clone();
        let transition_id = transition.id.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(timeout_ms)).await;
            addr.send(RunMsg::SyncTimeout {
                transition_id,
                anchor_token,
            });
        });
        self.timers.insert(key, handle);
    }

    fn clear_sync_timer(&mut self, transition: &Transition, instance: &FanOutInstance) {
        let key = self.sync_timer_key(transition, instance);
        if let Some(handle) = self.timers.remove(&key) {
            handle.abort();
        }
    }

    async fn on_sync_timeout(&mut self, transition_id: &str, anchor_token: Uuid) {
        let Some(transition) = self.graph.transition(transition_id).cloned() else {
            return;
        };
        let Some(sync) = transition.synchronization.clone() else {
            return;
        };
        let group: HashSet<&str> = self
            .graph
            .group_transitions(&sync.sibling_group)
            .iter()
            .map(String::as_str)
            .collect();
        let Some((instance, _)) =
            self.anchor_instance(anchor_token, &sync.sibling_group, &group)
        else {
            return;
        };
        self.timers
            .remove(&self.sync_timer_key(&transition, &instance));

        // Everything parked on this sync within the instance.
        let branches = self.instance_branches(&instance, &group);
        let mut waiting: Vec<(u32, Uuid)> = Vec::new();
        for (root, tokens) in &branches {
            let root_index = self.run.token(*root).map(|t| t.branch_index).unwrap_or(0);
            for tid in tokens {
                let parked = self
                    .run
                    .token(*tid)
                    .map(|t| {
                        t.status == TokenStatus::Waiting
                            && t.waiting_on.as_deref() == Some(transition_id)
                    })
                    .unwrap_or(false);
                if parked {
                    waiting.push((root_index, *tid));
                }
            }
        }
        if waiting.is_empty() {
            return;
        }
        waiting.sort_by_key(|(idx, _)| *idx);

        match sync.on_timeout {
            OnTimeout::ProceedWithAvailable => {
                self.emitter.decision(
                    "synchronization_timeout",
                    json!({
                        "transition": transition_id,
                        "outcome": "proceed_with_available",
                        "available": waiting.len(),
                    }),
                );
                let arrived: Vec<Uuid> = waiting.iter().map(|(_, id)| *id).collect();
                let winner = arrived[0];
                let loop_count = self
                    .run
                    .token(winner)
                    .and_then(|t| t.loop_counts.get(transition_id).copied())
                    .unwrap_or(0)
                    + 1;
                let mut ready = VecDeque::new();
                self.complete_fan_in(&transition, &sync, loop_count, arrived, winner, &mut ready)
                    .await;
                self.drain(ready).await;
            }
            OnTimeout::Fail => {
                let message = format!(
                    "synchronization timeout in group {}",
                    sync.sibling_group
                );
                for (_, tid) in &waiting {
                    if let Some(token) = self.run.token_mut(*tid) {
                        token.status = TokenStatus::Failed;
                        token.waiting_on = None;
                    }
                    let node_id = self
                        .run
                        .token(*tid)
                        .map(|t| t.node_id.clone())
                        .unwrap_or_default();
                    self.emitter.token_event(
                        EventKind::TokenFailed,
                        *tid,
                        node_id,
                        json!({ "kind": "synchronization_timeout" }),
                    );
                }
                self.fail_run("synchronization_timeout", message).await;
            }
        }
    }

    // ── Dispatch ─────────────────────────────────────────────────────

    /// Send a pending token's node work out: executor for action tasks,
    /// a child coordinator for workflow tasks. Task-less nodes complete
    /// immediately.
    async fn dispatch_token(&mut self, token_id: Uuid, ready: &mut VecDeque<(Uuid, Value)>) {
        let Some(token) = self.run.token(token_id) else {
            return;
        };
        if token.status != TokenStatus::Pending {
            return;
        }
        let node_id = token.node_id.clone();
        let Some(node) = self.graph.node(&node_id).cloned() else {
            self.fail_run("internal", format!("node {node_id} missing")).await;
            return;
        };

        let Some(task_id) = node.task_id.clone() else {
            // No task: the node completes in place.
            ready.push_back((token_id, Value::Null));
            return;
        };

        let input = match self.resolve_task_input(&node, token_id) {
            Ok(v) => v,
            Err(e) => {
                self.fail_token_and_run(token_id, e.to_string()).await;
                return;
            }
        };

        let task_def = match self
            .rt
            .store
            .get_definition(&task_id, node.task_version)
            .await
        {
            Ok(Some(def)) => def,
            Ok(None) => {
                self.fail_token_and_run(token_id, format!("task {task_id} not found"))
                    .await;
                return;
            }
            Err(e) => {
                self.fail_token_and_run(token_id, e.to_string()).await;
                return;
            }
        };
        let content = match task_def.task_content() {
            Ok(c) => c,
            Err(e) => {
                self.fail_token_and_run(token_id, e.to_string()).await;
                return;
            }
        };

        if let Some(token) = self.run.token_mut(token_id) {
            token.status = TokenStatus::Dispatched;
        }

        match content {
            TaskContent::Action { .. } => {
                let invocation = TaskInvocation {
                    invocation_id: Uuid::new_v4(),
                    task_id: task_id.clone(),
                    task_version: node.task_version,
                    input,
                    resource_bindings: node.resource_bindings.clone(),
                };
                self.emitter.token_event(
                    EventKind::TaskDispatched,
                    token_id,
                    node_id,
                    json!({ "task_id": task_id, "attempt": self.run.token(token_id).map(|t| t.attempt) }),
                );
                self.outstanding
                    .insert(token_id, Outstanding::Invocation(invocation.invocation_id));
                dispatch::dispatch_task(
                    &self.rt,
                    &self.emitter,
                    dispatch::token_correlator(self.run.id, token_id),
                    invocation,
                    ReplyTo::RunTaskToken {
                        addr: self.addr.clone(),
                        token_id,
                    },
                );
            }
            TaskContent::Workflow {
                workflow_id,
                workflow_version,
            } => {
                let link = ParentLink {
                    parent_run_id: self.run.id,
                    parent_node_id: node_id.clone(),
                    parent_token_id: token_id,
                };
                match dispatch::dispatch_workflow(
                    &self.rt,
                    &self.emitter,
                    dispatch::token_correlator(self.run.id, token_id),
                    &workflow_id,
                    workflow_version,
                    input,
                    false,
                    Some(link),
                    ReplyTo::RunSubworkflowToken {
                        addr: self.addr.clone(),
                        token_id,
                    },
                )
                .await
                {
                    Ok(child_run_id) => {
                        self.emitter.token_event(
                            EventKind::SubworkflowStarted,
                            token_id,
                            node_id,
                            json!({ "workflow_id": workflow_id, "child_run_id": child_run_id }),
                        );
                        self.outstanding
                            .insert(token_id, Outstanding::ChildRun(child_run_id));
                    }
                    Err(e) => {
                        self.fail_token_and_run(token_id, e.to_string()).await;
                    }
                }
            }
        }
    }

    fn resolve_task_input(&self, node: &Node, token_id: Uuid) -> Result<Value> {
        let env = self.run.context.env_for(Some(token_id));
        let mut input = Map::new();
        for (param, expr) in &node.input_mapping {
            let value = expr.evaluate(&env)?;
            input.insert(param.clone(), value);
        }
        Ok(Value::Object(input))
    }

    // ── Completion & failure ─────────────────────────────────────────

    async fn check_completion(&mut self) {
        if self.run.status.is_terminal() {
            return;
        }
        if self.run.active_token_count() > 0 || !self.outstanding.is_empty() {
            return;
        }

        // Build the terminal env from leaf tokens (completed tokens with no
        // successor), so the output mapping reads `_branch` at the points
        // where execution actually ended.
        let parents: HashSet<Uuid> = self
            .run
            .tokens
            .values()
            .filter_map(|t| t.parent_token_id)
            .collect();
        let mut leaves: Vec<&Token> = self
            .run
            .tokens
            .values()
            .filter(|t| t.status == TokenStatus::Completed && !parents.contains(&t.id))
            .collect();
        leaves.sort_by_key(|t| t.created_at);
        let mut terminal_branch = Map::new();
        for leaf in leaves {
            if let Some(Value::Object(map)) = self.run.context.branch.get(&leaf.id) {
                for (k, v) in map {
                    terminal_branch.insert(k.clone(), v.clone());
                }
            }
        }
        let env = json!({
            "input": &self.run.context.input,
            "state": &self.run.context.state,
            "output": &self.run.context.output,
            "_branch": Value::Object(terminal_branch),
        });

        for rule in self.graph.output_mapping().to_vec() {
            let segs: Vec<String> = rule.source.split('.').map(str::to_owned).collect();
            let value = weft_expr::eval::resolve_path(&env, &segs).clone();
            let target = if rule.target == "output"
                || rule.target.starts_with("output.")
                || rule.target == "state"
                || rule.target.starts_with("state.")
            {
                rule.target.clone()
            } else {
                format!("output.{}", rule.target)
            };
            if let Err(e) = self.run.context.set_path(&target, value, None) {
                tracing::warn!(run_id = %self.run.id, target = %target, error = %e, "output mapping write rejected");
            }
        }
        self.emitter.event(
            EventKind::ContextOutputApplied,
            json!({ "output": &self.run.context.output }),
        );

        if let Some(schema) = self.graph.output_schema() {
            if let Err(e) = crate::schema::validate(schema, &self.run.context.output, "output") {
                self.fail_run("output_validation", e.to_string()).await;
                return;
            }
        }

        self.run.finish(RunStatus::Completed);
        self.emitter.event(
            EventKind::WorkflowCompleted,
            json!({ "output": &self.run.context.output }),
        );
        tracing::info!(run_id = %self.run.id, "workflow run completed");

        if let Some(reply) = self.reply.take() {
            reply.deliver(Ok(self.run.context.output.clone()));
        }
        self.rt.remove_run(self.run.id);
    }

    async fn fail_run(&mut self, reason: &str, message: String) {
        if self.run.status.is_terminal() {
            return;
        }
        self.cancel_all_outstanding().await;
        self.run.cancel_active_tokens();
        self.run.error = Some(message.clone());
        self.run.finish(RunStatus::Failed);
        self.emitter.event(
            EventKind::WorkflowFailed,
            json!({ "reason": reason, "error": &message }),
        );
        tracing::warn!(run_id = %self.run.id, reason, error = %message, "workflow run failed");

        if let Some(reply) = self.reply.take() {
            reply.deliver(Err(message));
        }
        self.rt.remove_run(self.run.id);
    }

    async fn on_cancel(&mut self, reason: &str) {
        self.fail_run(reason, "cancelled".into()).await;
    }

    async fn cancel_all_outstanding(&mut self) {
        let ops: Vec<Outstanding> = self
            .outstanding
            .drain()
            .map(|(_, op)| op)
            .collect();
        for op in ops {
            match op {
                Outstanding::Invocation(id) => self.rt.executor.cancel(id).await,
                Outstanding::ChildRun(id) => {
                    let _ = self.rt.cancel_run(id).await;
                }
            }
        }
        for (_, handle) in self.timers.drain() {
            handle.abort();
        }
    }

    async fn cancel_outstanding_for(&mut self, token_id: Uuid) {
        if let Some(op) = self.outstanding.remove(&token_id) {
            match op {
                Outstanding::Invocation(id) => self.rt.executor.cancel(id).await,
                Outstanding::ChildRun(id) => {
                    let _ = self.rt.cancel_run(id).await;
                }
            }
        }
    }

    // ── Persistence & events ─────────────────────────────────────────

    fn emit_token_created(&self, token: &Token) {
        self.emitter.emit(
            EventInput::new(EventKind::TokenCreated)
                .with_token(token.id)
                .with_node(token.node_id.clone())
                .with_metadata(json!({
                    "parent_token_id": token.parent_token_id,
                    "fan_out_transition_id": &token.fan_out_transition_id,
                    "branch_index": token.branch_index,
                    "branch_total": token.branch_total,
                })),
        );
    }

    async fn snapshot(&mut self) {
        if !self.run.status.is_terminal() {
            let all_waiting = self
                .run
                .active_tokens()
                .all(|t| t.status == TokenStatus::Waiting);
            self.run.status = if all_waiting && self.run.active_token_count() > 0 {
                RunStatus::Waiting
            } else {
                RunStatus::Running
            };
        }

        let started = std::time::Instant::now();
        if let Err(e) = self.rt.store.put_run(&self.run).await {
            // The actor remains authoritative; the next tick snapshots again.
            tracing::warn!(run_id = %self.run.id, error = %e, "run snapshot failed");
            return;
        }
        self.emitter.trace(TraceInput::Sql {
            statement: "upsert workflow_runs".into(),
            duration_ms: Some(started.elapsed().as_millis() as u64),
            rows: Some(1),
        });
    }
}
