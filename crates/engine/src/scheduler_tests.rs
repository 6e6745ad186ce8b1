//! End-to-end scenarios for the scheduler, driven through `WorkflowEngine`
//! with `MockExecutor` and an in-memory checkpoint store.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use uuid::Uuid;

use nodes::mock::{MockBehaviour, MockExecutor};
use nodes::{NodeContext, NodeError, NodeExecutor};

use crate::config::EngineConfig;
use crate::conflict::ConflictKind;
use crate::engine::WorkflowEngine;
use crate::error::{EngineError, StoreError};
use crate::models::{Workflow, WorkflowEdge, WorkflowNode};
use crate::state::{ExecutionState, FailureReason, NodeState, WorkflowStatus};
use crate::state_manager::StateManager;
use crate::store::{Checkpoint, CheckpointStore, MemoryCheckpointStore};

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

fn fast_config() -> EngineConfig {
    EngineConfig {
        retry_base_delay: Duration::from_millis(1),
        ..EngineConfig::default()
    }
}

fn engine_on(store: Arc<dyn CheckpointStore>, mock: &MockExecutor) -> WorkflowEngine {
    WorkflowEngine::new(Arc::new(mock.clone()), StateManager::new(store), fast_config())
}

fn engine_with(mock: &MockExecutor) -> WorkflowEngine {
    engine_on(Arc::new(MemoryCheckpointStore::new()), mock)
}

async fn run_to_end(engine: &WorkflowEngine, workflow: Workflow) -> ExecutionState {
    let id = engine.submit_workflow(workflow).await.expect("valid workflow");
    engine.start(id).await.expect("start accepted");
    engine.wait(id).await.expect("run finishes")
}

async fn wait_until(
    engine: &WorkflowEngine,
    id: Uuid,
    condition: impl Fn(&ExecutionState) -> bool,
) -> ExecutionState {
    for _ in 0..10_000 {
        let state = engine.get_status(id).await.unwrap();
        if condition(&state) {
            return state;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    panic!("condition never held for workflow {id}");
}

fn node(id: &str) -> WorkflowNode {
    WorkflowNode::new(id, "mock")
}

/// A→B, A→C, B→D, C→D, all DATA, two worker slots.
fn diamond() -> Workflow {
    Workflow::new(
        "diamond",
        vec![node("a"), node("b"), node("c"), node("d").with_config(json!({ "critical": true }))],
        vec![
            WorkflowEdge::data("a", "b"),
            WorkflowEdge::data("a", "c"),
            WorkflowEdge::data("b", "d"),
            WorkflowEdge::data("c", "d"),
        ],
    )
    .with_parallelism(2)
}

fn reason(state: &ExecutionState, id: &str) -> Option<FailureReason> {
    state.nodes.get(id).and_then(|r| r.reason)
}

// ---------------------------------------------------------------------------
// Scheduling
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn diamond_runs_a_then_b_and_c_together_then_d() {
    let mock = MockExecutor::new().with_default_delay(Duration::from_millis(10));
    let engine = engine_with(&mock);

    let state = run_to_end(&engine, diamond()).await;

    assert_eq!(state.status, WorkflowStatus::Completed);
    let calls = mock.calls();
    assert_eq!(calls.first().map(String::as_str), Some("a"));
    assert_eq!(calls.last().map(String::as_str), Some("d"));
    assert!(mock.ran_concurrently("b", "c"));
    assert!(!mock.ran_concurrently("a", "b"));
    assert!(!mock.ran_concurrently("a", "c"));
    assert!(!mock.ran_concurrently("b", "d"));
    assert!(!mock.ran_concurrently("c", "d"));
    assert_eq!(mock.max_concurrency(), 2);
    assert!(state.nodes.values().all(|r| r.state == NodeState::Succeeded));
}

#[tokio::test(start_paused = true)]
async fn failed_branch_skips_critical_join_and_fails_workflow() {
    let mock = MockExecutor::new()
        .with_default_delay(Duration::from_millis(10))
        .with("b", MockBehaviour::FailFatal("boom".into()));
    let engine = engine_with(&mock);

    let state = run_to_end(&engine, diamond()).await;

    assert_eq!(state.status, WorkflowStatus::Failed);
    assert_eq!(state.node_state("b"), Some(NodeState::Failed));
    assert_eq!(reason(&state, "b"), Some(FailureReason::Error));
    assert_eq!(state.node_state("c"), Some(NodeState::Succeeded));
    assert_eq!(state.node_state("d"), Some(NodeState::Skipped));
    assert_eq!(reason(&state, "d"), Some(FailureReason::UpstreamFailed));
    assert_eq!(mock.call_count("d"), 0);
}

#[tokio::test]
async fn failure_follows_data_edges_but_not_control_edges() {
    let mock = MockExecutor::new().with("a", MockBehaviour::FailFatal("bad input".into()));
    let engine = engine_with(&mock);
    let wf = Workflow::new(
        "propagation",
        vec![node("a"), node("b"), node("c")],
        vec![WorkflowEdge::data("a", "b"), WorkflowEdge::control("a", "c")],
    );

    let state = run_to_end(&engine, wf).await;

    assert_eq!(state.node_state("b"), Some(NodeState::Skipped));
    assert_eq!(state.node_state("c"), Some(NodeState::Succeeded));
    assert_eq!(state.status, WorkflowStatus::Failed);
}

#[tokio::test]
async fn failure_off_the_critical_path_still_completes() {
    let mock = MockExecutor::new().with("a", MockBehaviour::FailFatal("flaky sensor".into()));
    let engine = engine_with(&mock);
    let wf = Workflow::new(
        "optional-branch",
        vec![node("a"), node("b"), node("report").with_config(json!({ "critical": true }))],
        vec![WorkflowEdge::data("a", "b")],
    );

    let state = run_to_end(&engine, wf).await;

    assert_eq!(state.node_state("a"), Some(NodeState::Failed));
    assert_eq!(state.node_state("b"), Some(NodeState::Skipped));
    assert_eq!(state.status, WorkflowStatus::Completed);
}

#[tokio::test(start_paused = true)]
async fn resource_peers_never_overlap() {
    let mock = MockExecutor::new().with_default_delay(Duration::from_millis(20));
    let engine = engine_with(&mock);
    let wf = Workflow::new(
        "exclusive",
        vec![node("a"), node("b"), node("c")],
        vec![WorkflowEdge::resource("a", "b")],
    );

    let state = run_to_end(&engine, wf).await;

    assert_eq!(state.status, WorkflowStatus::Completed);
    assert!(!mock.ran_concurrently("a", "b"));
    assert!(mock.ran_concurrently("a", "c") || mock.ran_concurrently("b", "c"));
}

#[tokio::test(start_paused = true)]
async fn named_capacity_limits_concurrency() {
    let mock = MockExecutor::new().with_default_delay(Duration::from_millis(10));
    let engine = engine_with(&mock);
    let wf = Workflow::new(
        "gpu-bound",
        ["t1", "t2", "t3", "t4"].iter().map(|id| node(id).requiring("gpu", 1)).collect(),
        vec![],
    )
    .with_resource("gpu", 2);

    let state = run_to_end(&engine, wf).await;

    assert_eq!(state.status, WorkflowStatus::Completed);
    assert_eq!(mock.max_concurrency(), 2);
}

#[tokio::test(start_paused = true)]
async fn on_start_control_edge_lets_target_overlap_source() {
    let mock = MockExecutor::new()
        .with("a", MockBehaviour::Delay(Duration::from_millis(50), json!({})))
        .with("b", MockBehaviour::Delay(Duration::from_millis(10), json!({})));
    let engine = engine_with(&mock);
    let wf = Workflow::new(
        "warmup",
        vec![node("a"), node("b")],
        vec![WorkflowEdge::control_on_start("a", "b")],
    );

    let state = run_to_end(&engine, wf).await;

    assert_eq!(state.status, WorkflowStatus::Completed);
    assert_eq!(mock.calls(), vec!["a", "b"]);
    assert!(mock.ran_concurrently("a", "b"));
}

#[tokio::test]
async fn wider_fan_out_dispatches_first() {
    let mock = MockExecutor::new();
    let engine = engine_with(&mock);
    let wf = Workflow::new(
        "priority",
        vec![node("z"), node("y"), node("x"), node("p"), node("q")],
        vec![WorkflowEdge::data("x", "p"), WorkflowEdge::data("x", "q")],
    )
    .with_parallelism(1);

    let state = run_to_end(&engine, wf).await;

    assert_eq!(state.status, WorkflowStatus::Completed);
    assert_eq!(mock.calls(), vec!["x", "p", "q", "y", "z"]);
}

#[tokio::test]
async fn edgeless_workflow_completes_within_parallelism() {
    let mock = MockExecutor::new().with_default_delay(Duration::from_millis(2));
    let engine = engine_with(&mock);
    let wf = Workflow::new(
        "flat",
        ["e", "d", "c", "b", "a"].iter().map(|id| node(id)).collect(),
        vec![],
    )
    .with_parallelism(2);

    let state = run_to_end(&engine, wf).await;

    assert_eq!(state.status, WorkflowStatus::Completed);
    assert!(mock.max_concurrency() <= 2);
    assert_eq!(mock.calls().len(), 5);
}

#[tokio::test]
async fn empty_workflow_completes_immediately() {
    let engine = engine_with(&MockExecutor::new());

    let state = run_to_end(&engine, Workflow::new("empty", vec![], vec![])).await;

    assert_eq!(state.status, WorkflowStatus::Completed);
    assert!(state.nodes.is_empty());
}

// ---------------------------------------------------------------------------
// Deadlines and retries
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn expired_deadline_fails_node_with_timeout() {
    let mock = MockExecutor::new().with("slow", MockBehaviour::WaitForCancel);
    let engine = engine_with(&mock);
    let wf = Workflow::new(
        "deadline",
        vec![node("slow").with_config(json!({ "timeout_ms": 50 })), node("after")],
        vec![WorkflowEdge::data("slow", "after")],
    );

    let state = run_to_end(&engine, wf).await;

    assert_eq!(state.node_state("slow"), Some(NodeState::Failed));
    assert_eq!(reason(&state, "slow"), Some(FailureReason::Timeout));
    assert_eq!(state.node_state("after"), Some(NodeState::Skipped));
    assert_eq!(state.status, WorkflowStatus::Failed);
}

#[derive(Debug, Default)]
struct BodyLog {
    alive: HashSet<String>,
    overlaps: Vec<(String, String)>,
    finished: Vec<String>,
}

/// Removes the node from `alive` when its body ends or is dropped.
struct Alive {
    node_id: String,
    log: Arc<Mutex<BodyLog>>,
}

impl Drop for Alive {
    fn drop(&mut self) {
        self.log.lock().unwrap().alive.remove(&self.node_id);
    }
}

/// Sleeps for its scripted duration without ever looking at `ctx.cancel`.
struct DeafExecutor {
    hold: HashMap<String, Duration>,
    log: Arc<Mutex<BodyLog>>,
}

#[async_trait]
impl NodeExecutor for DeafExecutor {
    async fn execute_node(&self, ctx: &NodeContext) -> Result<Value, NodeError> {
        let _alive = {
            let mut log = self.log.lock().unwrap();
            let peers: Vec<String> = log.alive.iter().cloned().collect();
            for peer in peers {
                log.overlaps.push((peer, ctx.node_id.clone()));
            }
            log.alive.insert(ctx.node_id.clone());
            Alive { node_id: ctx.node_id.clone(), log: self.log.clone() }
        };
        let hold = self.hold.get(&ctx.node_id).copied().unwrap_or_default();
        tokio::time::sleep(hold).await;
        self.log.lock().unwrap().finished.push(ctx.node_id.clone());
        Ok(json!({}))
    }
}

#[tokio::test(start_paused = true)]
async fn timed_out_body_is_stopped_before_its_resource_peer_starts() {
    let log = Arc::new(Mutex::new(BodyLog::default()));
    let executor = DeafExecutor {
        hold: HashMap::from([
            ("a".to_owned(), Duration::from_millis(200)),
            ("b".to_owned(), Duration::from_millis(10)),
        ]),
        log: log.clone(),
    };
    let engine = WorkflowEngine::new(
        Arc::new(executor),
        StateManager::new(Arc::new(MemoryCheckpointStore::new())),
        fast_config(),
    );
    let wf = Workflow::new(
        "deaf",
        vec![node("a").with_config(json!({ "timeout_ms": 20 })), node("b")],
        vec![WorkflowEdge::resource("a", "b")],
    );

    let state = run_to_end(&engine, wf).await;
    assert_eq!(state.node_state("a"), Some(NodeState::Failed));
    assert_eq!(reason(&state, "a"), Some(FailureReason::Timeout));
    assert_eq!(state.node_state("b"), Some(NodeState::Succeeded));

    // Long past a's scripted hold: its body must not come back to life.
    tokio::time::sleep(Duration::from_millis(500)).await;
    let log = log.lock().unwrap();
    assert!(log.overlaps.is_empty(), "bodies overlapped: {:?}", log.overlaps);
    assert_eq!(log.finished, vec!["b".to_owned()]);
    assert!(log.alive.is_empty());
}

#[tokio::test]
async fn retryable_errors_are_retried_until_success() {
    let mock = MockExecutor::new().with(
        "flaky",
        MockBehaviour::FailRetryable { times: 2, message: "connection reset".into() },
    );
    let engine = engine_with(&mock);

    let state = run_to_end(&engine, Workflow::new("retry", vec![node("flaky")], vec![])).await;

    assert_eq!(state.status, WorkflowStatus::Completed);
    assert_eq!(state.nodes["flaky"].attempts, 3);
    assert_eq!(mock.call_count("flaky"), 3);
}

#[tokio::test]
async fn retries_stop_at_the_node_limit() {
    let mock = MockExecutor::new().with(
        "flaky",
        MockBehaviour::FailRetryable { times: 10, message: "still down".into() },
    );
    let engine = engine_with(&mock);
    let wf = Workflow::new(
        "retry-exhausted",
        vec![node("flaky").with_config(json!({ "max_retries": 1 }))],
        vec![],
    );

    let state = run_to_end(&engine, wf).await;

    assert_eq!(state.status, WorkflowStatus::Failed);
    assert_eq!(reason(&state, "flaky"), Some(FailureReason::RetryExhausted));
    assert_eq!(state.nodes["flaky"].attempts, 2);
    assert_eq!(state.nodes["flaky"].detail, Some(json!("still down")));
}

// ---------------------------------------------------------------------------
// Lifecycle control
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn cancel_stops_running_nodes_and_skips_the_rest() {
    let mock = MockExecutor::new().with("a", MockBehaviour::WaitForCancel);
    let engine = engine_with(&mock);
    let wf = Workflow::new(
        "cancel",
        vec![node("a"), node("b")],
        vec![WorkflowEdge::data("a", "b")],
    );
    let id = engine.submit_workflow(wf).await.unwrap();
    engine.start(id).await.unwrap();
    wait_until(&engine, id, |s| s.node_state("a") == Some(NodeState::Running)).await;

    engine.cancel(id).await.unwrap();
    let state = engine.wait(id).await.unwrap();

    assert_eq!(state.status, WorkflowStatus::Cancelled);
    assert_eq!(reason(&state, "a"), Some(FailureReason::Cancelled));
    assert_eq!(state.node_state("b"), Some(NodeState::Skipped));
    assert_eq!(reason(&state, "b"), Some(FailureReason::Cancelled));
    assert_eq!(mock.call_count("b"), 0);
    assert!(matches!(
        engine.cancel(id).await,
        Err(EngineError::InvalidTransition { status: WorkflowStatus::Cancelled, .. })
    ));
}

#[tokio::test(start_paused = true)]
async fn pause_holds_new_dispatch_until_resume() {
    let mock = MockExecutor::new().with("a", MockBehaviour::Delay(Duration::from_millis(50), json!({})));
    let engine = engine_with(&mock);
    let wf = Workflow::new(
        "pausable",
        vec![node("a"), node("b")],
        vec![WorkflowEdge::data("a", "b")],
    );
    let id = engine.submit_workflow(wf).await.unwrap();
    engine.start(id).await.unwrap();
    wait_until(&engine, id, |s| s.node_state("a") == Some(NodeState::Running)).await;

    engine.pause(id).await.unwrap();
    wait_until(&engine, id, |s| {
        s.status == WorkflowStatus::Paused && s.node_state("a") == Some(NodeState::Succeeded)
    })
    .await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    let paused = engine.get_status(id).await.unwrap();
    assert_ne!(paused.node_state("b"), Some(NodeState::Running));
    assert_eq!(mock.call_count("b"), 0);

    engine.resume(id).await.unwrap();
    let state = engine.wait(id).await.unwrap();
    assert_eq!(state.status, WorkflowStatus::Completed);
    assert_eq!(mock.call_count("b"), 1);
}

#[tokio::test]
async fn lifecycle_misuse_is_rejected() {
    let engine = engine_with(&MockExecutor::new());
    let wf = Workflow::new("lifecycle", vec![node("a")], vec![]);
    let id = engine.submit(wf).await.unwrap();

    assert!(matches!(
        engine.start(id).await,
        Err(EngineError::InvalidTransition { action: "start", status: WorkflowStatus::Pending, .. })
    ));
    assert!(matches!(engine.pause(id).await, Err(EngineError::InvalidTransition { .. })));
    assert!(matches!(
        engine.get_status(Uuid::new_v4()).await,
        Err(EngineError::WorkflowNotFound(_))
    ));

    engine.cancel(id).await.unwrap();
    let state = engine.get_status(id).await.unwrap();
    assert_eq!(state.status, WorkflowStatus::Cancelled);
    assert_eq!(state.node_state("a"), Some(NodeState::Skipped));
    assert!(matches!(engine.validate(id).await, Err(EngineError::InvalidTransition { .. })));
}

#[tokio::test]
async fn cyclic_workflow_never_reaches_running() {
    let engine = engine_with(&MockExecutor::new());
    let wf = Workflow::new(
        "loop",
        vec![node("a"), node("b"), node("c")],
        vec![
            WorkflowEdge::data("a", "b"),
            WorkflowEdge::control("b", "c"),
            WorkflowEdge::data("c", "a"),
        ],
    );
    let id = wf.id;

    let err = engine.submit_workflow(wf).await.unwrap_err();
    let EngineError::Validation { conflicts, .. } = err else {
        panic!("expected validation error, got {err:?}");
    };
    assert!(conflicts
        .iter()
        .any(|c| c.kind == ConflictKind::Cycle && c.involved_node_ids.len() == 3));

    assert!(matches!(engine.start(id).await, Err(EngineError::InvalidTransition { .. })));
    let state = engine.get_status(id).await.unwrap();
    assert_eq!(state.status, WorkflowStatus::Failed);
    assert_eq!(state.conflicts, conflicts);

    let history = engine.get_history(id, None).await.unwrap();
    assert!(history.iter().all(|c| c.state.status != WorkflowStatus::Running));
}

#[tokio::test]
async fn history_versions_increase_and_end_terminal() {
    let engine = engine_with(&MockExecutor::new());
    let wf = Workflow::new(
        "audit",
        vec![node("a"), node("b")],
        vec![WorkflowEdge::data("a", "b")],
    );
    let id = wf.id;
    run_to_end(&engine, wf).await;

    let history = engine.get_history(id, None).await.unwrap();
    let versions: Vec<u64> = history.iter().map(|c| c.version).collect();
    assert_eq!(versions, (1..=versions.len() as u64).collect::<Vec<_>>());
    assert_eq!(history[0].state.status, WorkflowStatus::Pending);
    assert_eq!(history.last().map(|c| c.state.status), Some(WorkflowStatus::Completed));

    let tail = engine.get_history(id, Some(2)).await.unwrap();
    assert_eq!(tail.first().map(|c| c.version), Some(3));
}

// ---------------------------------------------------------------------------
// Durability
// ---------------------------------------------------------------------------

/// Accepts a fixed number of appends, then fails every write.
struct FlakyStore {
    inner: MemoryCheckpointStore,
    remaining: AtomicUsize,
}

#[async_trait]
impl CheckpointStore for FlakyStore {
    async fn save_workflow(&self, workflow: &Workflow) -> Result<(), StoreError> {
        self.inner.save_workflow(workflow).await
    }

    async fn load_workflow(&self, workflow_id: Uuid) -> Result<Workflow, StoreError> {
        self.inner.load_workflow(workflow_id).await
    }

    async fn append(&self, state: &ExecutionState) -> Result<Checkpoint, StoreError> {
        let left = self.remaining.load(Ordering::SeqCst);
        if left == 0 {
            return Err(StoreError::Database(db::DbError::NotFound));
        }
        self.remaining.store(left - 1, Ordering::SeqCst);
        self.inner.append(state).await
    }

    async fn latest(&self, workflow_id: Uuid) -> Result<Option<Checkpoint>, StoreError> {
        self.inner.latest(workflow_id).await
    }

    async fn list(&self, workflow_id: Uuid, since: Option<u64>) -> Result<Vec<Checkpoint>, StoreError> {
        self.inner.list(workflow_id, since).await
    }
}

#[tokio::test(start_paused = true)]
async fn checkpoint_failure_halts_dispatch_and_surfaces() {
    let mock = MockExecutor::new().with_default_delay(Duration::from_millis(10));
    // submit, validate and start each write one checkpoint.
    let store = Arc::new(FlakyStore {
        inner: MemoryCheckpointStore::new(),
        remaining: AtomicUsize::new(3),
    });
    let engine = engine_on(store, &mock);
    let wf = Workflow::new(
        "fragile",
        vec![node("a"), node("b")],
        vec![WorkflowEdge::data("a", "b")],
    );
    let id = engine.submit_workflow(wf).await.unwrap();
    engine.start(id).await.unwrap();

    let err = engine.wait(id).await.unwrap_err();
    assert!(matches!(err, EngineError::Persistence(_)));

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(mock.call_count("b"), 0);
    let state = engine.get_status(id).await.unwrap();
    assert_eq!(state.status, WorkflowStatus::Failed);
    assert!(state.detail.is_some());
}

#[tokio::test(start_paused = true)]
async fn recovery_after_crash_reaches_same_terminal_status() {
    let chain = || {
        Workflow::new(
            "chain",
            vec![node("a"), node("b"), node("c")],
            vec![WorkflowEdge::data("a", "b"), WorkflowEdge::data("b", "c")],
        )
    };

    // Uninterrupted run.
    let baseline = run_to_end(&engine_with(&MockExecutor::new()), chain()).await;

    // Crashed run: the log says a finished and b was in flight.
    let store = Arc::new(MemoryCheckpointStore::new());
    let wf = chain();
    let id = wf.id;
    store.save_workflow(&wf).await.unwrap();
    let mut crashed = ExecutionState::new(&wf);
    crashed.set_status(WorkflowStatus::Running);
    for (node_id, steps) in [
        ("a", &[NodeState::Ready, NodeState::Running, NodeState::Succeeded][..]),
        ("b", &[NodeState::Ready, NodeState::Running][..]),
    ] {
        for step in steps {
            assert!(crashed.transition(node_id, *step));
        }
    }
    store.append(&crashed).await.unwrap();

    let mock = MockExecutor::new();
    let engine = engine_on(store, &mock);
    engine.restore(id).await.unwrap();
    let recovered = engine.wait(id).await.unwrap();

    assert_eq!(recovered.status, baseline.status);
    assert_eq!(recovered.status, WorkflowStatus::Completed);
    assert_eq!(mock.call_count("a"), 0);
    assert_eq!(mock.call_count("b"), 1);
    assert_eq!(mock.call_count("c"), 1);
}

#[tokio::test]
async fn restoring_a_finished_workflow_keeps_its_terminal_state() {
    let store = Arc::new(MemoryCheckpointStore::new());
    let first = engine_on(store.clone(), &MockExecutor::new());
    let wf = Workflow::new("done", vec![node("a")], vec![]);
    let id = wf.id;
    let finished = run_to_end(&first, wf).await;

    let mock = MockExecutor::new();
    let second = engine_on(store, &mock);
    second.restore(id).await.unwrap();

    assert_eq!(second.get_status(id).await.unwrap(), finished);
    assert_eq!(second.wait(id).await.unwrap().status, WorkflowStatus::Completed);
    assert_eq!(mock.call_count("a"), 0);
}

#[tokio::test(start_paused = true)]
async fn restore_never_runs_an_unstarted_workflow() {
    let store = Arc::new(MemoryCheckpointStore::new());
    let first = engine_on(store.clone(), &MockExecutor::new());
    let submitted = Workflow::new("submitted", vec![node("a")], vec![]);
    let validated = Workflow::new("validated", vec![node("a")], vec![]);
    let (pending_id, validating_id) = (submitted.id, validated.id);
    first.submit(submitted).await.unwrap();
    first.submit_workflow(validated).await.unwrap();

    let mock = MockExecutor::new();
    let second = engine_on(store, &mock);
    second.restore(pending_id).await.unwrap();
    second.restore(validating_id).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(mock.call_count("a"), 0);
    assert_eq!(second.get_status(pending_id).await.unwrap().status, WorkflowStatus::Pending);
    assert_eq!(second.get_status(validating_id).await.unwrap().status, WorkflowStatus::Validating);
    assert!(matches!(
        second.wait(pending_id).await,
        Err(EngineError::InvalidTransition { .. })
    ));

    // Both carry on through the normal lifecycle.
    second.validate(pending_id).await.unwrap();
    for id in [pending_id, validating_id] {
        second.start(id).await.unwrap();
        assert_eq!(second.wait(id).await.unwrap().status, WorkflowStatus::Completed);
    }
    assert_eq!(mock.call_count("a"), 2);
}

#[tokio::test]
async fn unreadable_checkpoint_marks_workflow_failed() {
    let store = Arc::new(MemoryCheckpointStore::new());
    let wf = Workflow::new("corrupt", vec![node("a")], vec![]);
    let id = wf.id;
    store.save_workflow(&wf).await.unwrap();
    store.append_raw(id, "{\"status\": \"runn").await;

    let engine = engine_on(store.clone(), &MockExecutor::new());
    let err = engine.restore(id).await.unwrap_err();
    assert!(matches!(err, EngineError::Recovery { .. }));

    let state = engine.get_status(id).await.unwrap();
    assert_eq!(state.status, WorkflowStatus::Failed);
    assert!(state.detail.as_deref().is_some_and(|d| d.contains("unreadable")));

    // The failure is itself checkpointed, so a later restart adopts it.
    let later = engine_on(store, &MockExecutor::new());
    later.restore(id).await.unwrap();
    assert_eq!(later.get_status(id).await.unwrap().status, WorkflowStatus::Failed);
}
