//! Execution Scheduler — drives a validated workflow to a terminal state.
//!
//! One decision loop owns the [`ExecutionState`] and the [`ResourcePool`].
//! Node bodies run on worker tasks (at most `max_parallelism` at a time) and
//! report back over a single mpsc channel; the loop is the only reader and
//! the only place state is mutated.
//!
//! Each loop iteration:
//! 1. reacts to cancellation and pause requests,
//! 2. promotes newly ready nodes and dispatches from the priority queue,
//! 3. persists a checkpoint if anything changed,
//! 4. finishes when nothing is left to run, or suspends until the next
//!    worker event or control signal.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use nodes::{NodeContext, NodeError, NodeExecutor};

use crate::config::EngineConfig;
use crate::dag::DependencyGraph;
use crate::error::{EngineError, StoreError};
use crate::models::Workflow;
use crate::resources::ResourcePool;
use crate::state::{ExecutionState, FailureReason, NodeState, WorkflowStatus};
use crate::state_manager::StateManager;

// ---------------------------------------------------------------------------
// Control inputs
// ---------------------------------------------------------------------------

/// External signals observed by a running scheduler.
pub struct ExecutionControl {
    /// Cooperative cancellation of the whole workflow.
    pub cancel: CancellationToken,
    /// `true` while dispatch is paused. A dropped sender keeps the last value.
    pub pause: watch::Receiver<bool>,
}

impl ExecutionControl {
    /// Control handles that are never signalled.
    pub fn detached() -> Self {
        let (_tx, pause) = watch::channel(false);
        Self {
            cancel: CancellationToken::new(),
            pause,
        }
    }
}

// ---------------------------------------------------------------------------
// Ready queue
// ---------------------------------------------------------------------------

/// Priority of a READY node: widest fan-out first, then earliest
/// topological position, then lowest id.
#[derive(Debug, Clone, PartialEq, Eq)]
struct ReadyEntry {
    fan_out: usize,
    topo_pos: usize,
    id: String,
}

impl Ord for ReadyEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.fan_out
            .cmp(&other.fan_out)
            .then_with(|| other.topo_pos.cmp(&self.topo_pos))
            .then_with(|| other.id.cmp(&self.id))
    }
}

impl PartialOrd for ReadyEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

// ---------------------------------------------------------------------------
// Worker events
// ---------------------------------------------------------------------------

#[derive(Debug)]
enum NodeOutcome {
    Succeeded(Value),
    Failed { reason: FailureReason, message: String },
}

#[derive(Debug)]
struct WorkerEvent {
    node_id: String,
    attempts: u32,
    outcome: NodeOutcome,
}

/// Per-dispatch retry and deadline settings.
#[derive(Debug, Clone, Copy)]
struct RetryPolicy {
    max_retries: u32,
    base_delay: Duration,
    deadline: Option<Duration>,
}

impl RetryPolicy {
    fn delay(&self, attempt: u32) -> Duration {
        self.base_delay * 2u32.saturating_pow(attempt.saturating_sub(1))
    }
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

/// Runs workflows against a node executor, checkpointing through a
/// [`StateManager`].
#[derive(Clone)]
pub struct Scheduler {
    executor: Arc<dyn NodeExecutor>,
    state_manager: StateManager,
    config: EngineConfig,
}

impl Scheduler {
    pub fn new(executor: Arc<dyn NodeExecutor>, state_manager: StateManager, config: EngineConfig) -> Self {
        Self {
            executor,
            state_manager,
            config,
        }
    }

    /// Execute `workflow` from `state` until every node is terminal or the
    /// run is cancelled. Every published snapshot has been persisted first.
    ///
    /// Node failures never surface here; they end up in the returned state.
    ///
    /// # Errors
    /// `Persistence` if a checkpoint cannot be written. Running nodes are
    /// cancelled and no further node is dispatched.
    #[instrument(skip_all, fields(workflow_id = %workflow.id))]
    pub async fn execute(
        &self,
        workflow: &Workflow,
        graph: &DependencyGraph,
        state: ExecutionState,
        mut control: ExecutionControl,
        snapshots: &watch::Sender<ExecutionState>,
    ) -> Result<ExecutionState, EngineError> {
        let (tx, mut events) = mpsc::channel::<WorkerEvent>(self.config.event_channel_capacity.max(1));
        let mut run = Run::new(workflow, graph, state);
        let mut workers: JoinSet<()> = JoinSet::new();
        let mut pause_open = true;
        let slots = workflow.slots();

        info!(nodes = workflow.nodes.len(), slots, "execution started");

        loop {
            // ------------------------------------------------------------------
            // 1. Control signals
            // ------------------------------------------------------------------
            if control.cancel.is_cancelled() && !run.cancelling {
                run.begin_cancel();
            }
            let paused = *control.pause.borrow_and_update();
            if !run.cancelling {
                let wanted = if paused { WorkflowStatus::Paused } else { WorkflowStatus::Running };
                if run.state.status != wanted {
                    info!(status = %wanted, "workflow status changed");
                    run.state.set_status(wanted);
                    run.dirty = true;
                }
            }

            // ------------------------------------------------------------------
            // 2. Readiness and dispatch
            // ------------------------------------------------------------------
            let mut dispatched = 0usize;
            if !run.cancelling && !paused {
                run.refresh_ready();
                while run.running.len() < slots {
                    let Some(entry) = run.next_dispatchable() else { break };
                    self.dispatch(&mut run, &mut workers, &tx, &entry.id);
                    dispatched += 1;
                }
            }

            // ------------------------------------------------------------------
            // 3. Checkpoint
            // ------------------------------------------------------------------
            if run.dirty {
                if let Err(e) = self.checkpoint(&run.state, snapshots).await {
                    return Err(run.abort(workers, e));
                }
                run.dirty = false;
            }

            // ------------------------------------------------------------------
            // 4. Finish or suspend
            // ------------------------------------------------------------------
            // A start may release ON_START dependents.
            if dispatched > 0 {
                continue;
            }
            if run.running.is_empty() {
                if run.cancelling || run.state.all_nodes_terminal() {
                    break;
                }
                if !paused {
                    run.skip_unreachable();
                    continue;
                }
            }

            tokio::select! {
                Some(event) = events.recv(), if !run.running.is_empty() => {
                    run.complete(event);
                }
                _ = control.cancel.cancelled(), if !run.cancelling => {}
                changed = control.pause.changed(), if pause_open => {
                    if changed.is_err() {
                        pause_open = false;
                    }
                }
            }
        }

        let status = run.terminal_status();
        run.state.set_status(status);
        if let Err(e) = self.checkpoint(&run.state, snapshots).await {
            return Err(run.abort(workers, e));
        }
        info!(status = %status, "execution finished");
        Ok(run.state)
    }

    async fn checkpoint(
        &self,
        state: &ExecutionState,
        snapshots: &watch::Sender<ExecutionState>,
    ) -> Result<(), StoreError> {
        self.state_manager.persist(state).await?;
        snapshots.send_replace(state.clone());
        Ok(())
    }

    fn dispatch(
        &self,
        run: &mut Run<'_>,
        workers: &mut JoinSet<()>,
        tx: &mpsc::Sender<WorkerEvent>,
        node_id: &str,
    ) {
        let workflow = run.workflow;
        let Some(node) = workflow.node(node_id) else { return };

        let acquired = run.pool.acquire(&node.resource_requirements);
        debug_assert!(acquired, "dispatched '{node_id}' without free capacity");
        run.state.transition(node_id, NodeState::Running);
        run.dirty = true;

        let token = CancellationToken::new();
        run.running.insert(node_id.to_owned(), token.clone());

        let attempts_so_far = run.state.nodes.get(node_id).map_or(0, |r| r.attempts);
        let ctx = NodeContext {
            workflow_id: workflow.id,
            node_id: node_id.to_owned(),
            kind: node.kind.clone(),
            config: node.config.clone(),
            attempt: attempts_so_far + 1,
            cancel: token,
        };
        let policy = RetryPolicy {
            max_retries: node.max_retries().unwrap_or(self.config.max_retries),
            base_delay: self.config.retry_base_delay,
            deadline: node.timeout().or(self.config.default_node_timeout),
        };

        info!(node = %node_id, attempt = ctx.attempt, "node dispatched");
        workers.spawn(run_node(self.executor.clone(), ctx, policy, tx.clone()));
    }
}

// ---------------------------------------------------------------------------
// Worker
// ---------------------------------------------------------------------------

/// Body of a worker slot: run the node with retries inside its deadline and
/// report exactly one event.
async fn run_node(
    executor: Arc<dyn NodeExecutor>,
    ctx: NodeContext,
    policy: RetryPolicy,
    tx: mpsc::Sender<WorkerEvent>,
) {
    let node_id = ctx.node_id.clone();
    let cancel = ctx.cancel.clone();
    let mut attempts = 0;
    // Dropping the set (worker aborted) aborts any body still in flight.
    let mut bodies = JoinSet::new();

    let outcome = match policy.deadline {
        Some(deadline) => {
            let attempts_run = attempt_loop(&executor, &mut bodies, ctx, policy, &mut attempts);
            match tokio::time::timeout(deadline, attempts_run).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    cancel.cancel();
                    // The body must be gone before the slot and its resources are released.
                    bodies.shutdown().await;
                    NodeOutcome::Failed {
                        reason: FailureReason::Timeout,
                        message: format!("deadline of {deadline:?} expired"),
                    }
                }
            }
        }
        None => attempt_loop(&executor, &mut bodies, ctx, policy, &mut attempts).await,
    };

    if tx.send(WorkerEvent { node_id, attempts, outcome }).await.is_err() {
        debug!("decision loop gone; dropping worker event");
    }
}

async fn attempt_loop(
    executor: &Arc<dyn NodeExecutor>,
    bodies: &mut JoinSet<Result<Value, NodeError>>,
    mut ctx: NodeContext,
    policy: RetryPolicy,
    attempts: &mut u32,
) -> NodeOutcome {
    let first_attempt = ctx.attempt;
    loop {
        *attempts += 1;
        ctx.attempt = first_attempt + *attempts - 1;

        // The body runs on its own task so a panicking executor fails the
        // node instead of taking the worker down with it.
        let body_executor = executor.clone();
        let body_ctx = ctx.clone();
        bodies.spawn(async move { body_executor.execute_node(&body_ctx).await });
        let result = match bodies.join_next().await {
            Some(Ok(result)) => result,
            Some(Err(join_err)) => Err(NodeError::Fatal(format!("executor task failed: {join_err}"))),
            None => Err(NodeError::Fatal("executor task vanished".into())),
        };

        match result {
            Ok(output) => return NodeOutcome::Succeeded(output),
            Err(NodeError::Retryable(message)) if *attempts <= policy.max_retries => {
                let delay = policy.delay(*attempts);
                warn!(node = %ctx.node_id, attempt = ctx.attempt, ?delay, %message, "retryable failure");
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = ctx.cancel.cancelled() => {
                        return NodeOutcome::Failed {
                            reason: FailureReason::Cancelled,
                            message: "cancelled while waiting to retry".into(),
                        };
                    }
                }
            }
            Err(NodeError::Retryable(message)) => {
                return NodeOutcome::Failed {
                    reason: FailureReason::RetryExhausted,
                    message,
                };
            }
            Err(NodeError::Fatal(message)) => {
                return NodeOutcome::Failed {
                    reason: FailureReason::Error,
                    message,
                };
            }
            Err(NodeError::Cancelled) => {
                return NodeOutcome::Failed {
                    reason: FailureReason::Cancelled,
                    message: "node observed cancellation".into(),
                };
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Per-run bookkeeping owned by the decision loop
// ---------------------------------------------------------------------------

struct Run<'a> {
    workflow: &'a Workflow,
    graph: &'a DependencyGraph,
    state: ExecutionState,
    pool: ResourcePool,
    queue: BinaryHeap<ReadyEntry>,
    queued: HashSet<String>,
    running: HashMap<String, CancellationToken>,
    cancelling: bool,
    dirty: bool,
}

impl<'a> Run<'a> {
    fn new(workflow: &'a Workflow, graph: &'a DependencyGraph, state: ExecutionState) -> Self {
        Self {
            workflow,
            graph,
            state,
            pool: ResourcePool::new(&workflow.resource_pool),
            queue: BinaryHeap::new(),
            queued: HashSet::new(),
            running: HashMap::new(),
            cancelling: false,
            dirty: false,
        }
    }

    /// Promote WAITING nodes whose conditions hold and enqueue every ready
    /// node not already queued.
    fn refresh_ready(&mut self) {
        for id in self.graph.compute_ready_set(&self.state) {
            if self.state.node_state(&id) == Some(NodeState::Waiting) {
                self.state.transition(&id, NodeState::Ready);
                self.dirty = true;
                debug!(node = %id, "node ready");
            }
            if self.queued.insert(id.clone()) {
                self.queue.push(ReadyEntry {
                    fan_out: self.graph.direct_dependents(&id),
                    topo_pos: self.graph.position(&id).unwrap_or(usize::MAX),
                    id,
                });
            }
        }
    }

    /// Pop the best entry that can start right now. Entries blocked by a
    /// running RESOURCE peer or by pool capacity stay queued.
    fn next_dispatchable(&mut self) -> Option<ReadyEntry> {
        let mut deferred = Vec::new();
        let mut found = None;

        while let Some(entry) = self.queue.pop() {
            if self.state.node_state(&entry.id) != Some(NodeState::Ready) {
                self.queued.remove(&entry.id);
                continue;
            }
            let peer_running = self
                .graph
                .resource_peers(&entry.id)
                .any(|peer| self.running.contains_key(peer));
            let fits = self
                .workflow
                .node(&entry.id)
                .is_some_and(|n| self.pool.can_acquire(&n.resource_requirements));

            if !peer_running && fits {
                self.queued.remove(&entry.id);
                found = Some(entry);
                break;
            }
            deferred.push(entry);
        }

        self.queue.extend(deferred);
        found
    }

    fn complete(&mut self, event: WorkerEvent) {
        let WorkerEvent { node_id, attempts, outcome } = event;

        self.running.remove(&node_id);
        if let Some(node) = self.workflow.node(&node_id) {
            self.pool.release(&node.resource_requirements);
        }
        if let Some(record) = self.state.nodes.get_mut(&node_id) {
            record.attempts += attempts;
        }

        match outcome {
            NodeOutcome::Succeeded(output) => {
                self.state.transition(&node_id, NodeState::Succeeded);
                if let Some(record) = self.state.nodes.get_mut(&node_id) {
                    record.detail = Some(output);
                }
                info!(node = %node_id, attempts, "node succeeded");
            }
            NodeOutcome::Failed { reason, message } => {
                self.state.transition(&node_id, NodeState::Failed);
                if let Some(record) = self.state.nodes.get_mut(&node_id) {
                    record.reason = Some(reason);
                    record.detail = Some(Value::String(message.clone()));
                }
                error!(node = %node_id, attempts, ?reason, %message, "node failed");
                self.skip_data_dependents(&node_id);
            }
        }
        self.dirty = true;
    }

    /// Failure flows along DATA edges only.
    fn skip_data_dependents(&mut self, failed: &str) {
        for id in self.graph.transitive_data_dependents(failed) {
            if self.skip(&id, FailureReason::UpstreamFailed) {
                debug!(node = %id, upstream = %failed, "node skipped");
            }
        }
    }

    fn skip(&mut self, id: &str, reason: FailureReason) -> bool {
        if !self.state.transition(id, NodeState::Skipped) {
            return false;
        }
        if let Some(record) = self.state.nodes.get_mut(id) {
            record.reason = Some(reason);
        }
        self.dirty = true;
        true
    }

    fn begin_cancel(&mut self) {
        info!(running = self.running.len(), "cancellation requested");
        self.cancelling = true;
        for token in self.running.values() {
            token.cancel();
        }
        let pending: Vec<String> = self
            .state
            .nodes
            .iter()
            .filter(|(_, r)| matches!(r.state, NodeState::Waiting | NodeState::Ready))
            .map(|(id, _)| id.clone())
            .collect();
        for id in pending {
            self.skip(&id, FailureReason::Cancelled);
        }
        self.queue.clear();
        self.queued.clear();
        self.dirty = true;
    }

    /// Nothing runs and nothing could be dispatched, yet nodes remain: their
    /// conditions can never hold. End the run instead of waiting forever.
    fn skip_unreachable(&mut self) {
        let stuck: Vec<String> = self
            .state
            .nodes
            .iter()
            .filter(|(_, r)| !r.state.is_terminal())
            .map(|(id, _)| id.clone())
            .collect();
        warn!(?stuck, "no node can make progress");
        for id in stuck {
            self.skip(&id, FailureReason::UpstreamFailed);
        }
    }

    fn terminal_status(&self) -> WorkflowStatus {
        if self.cancelling {
            return WorkflowStatus::Cancelled;
        }

        let critical: Vec<&str> = self
            .workflow
            .nodes
            .iter()
            .filter(|n| self.workflow.is_critical(n))
            .map(|n| n.id.as_str())
            .collect();

        let critical_incomplete = critical
            .iter()
            .any(|id| self.state.node_state(id) != Some(NodeState::Succeeded));
        let failure_on_critical_path = self.state.nodes_in(NodeState::Failed).iter().any(|failed| {
            critical
                .iter()
                .any(|c| *c == failed.as_str() || self.graph.is_ancestor(failed, c))
        });

        if critical_incomplete || failure_on_critical_path {
            WorkflowStatus::Failed
        } else {
            WorkflowStatus::Completed
        }
    }

    /// Cancel everything in flight after a checkpoint write failed.
    fn abort(&mut self, mut workers: JoinSet<()>, cause: StoreError) -> EngineError {
        error!(error = %cause, running = self.running.len(), "checkpoint write failed; halting dispatch");
        for token in self.running.values() {
            token.cancel();
        }
        workers.abort_all();
        EngineError::Persistence(cause)
    }
}
