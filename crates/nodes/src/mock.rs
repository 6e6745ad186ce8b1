//! `MockExecutor` — a scripted test double for `NodeExecutor`.
//!
//! Useful in unit and integration tests where a real task body is either
//! unavailable or irrelevant. Besides returning programmer-specified results
//! it records the call order and which nodes overlapped in time, so tests can
//! assert on parallelism and mutual exclusion.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::{NodeContext, NodeError, NodeExecutor};

/// Behaviour injected for a node id at construction time.
#[derive(Debug, Clone)]
pub enum MockBehaviour {
    /// Return a specific JSON value.
    ReturnValue(Value),
    /// Sleep for the duration (cancellable), then return the value.
    Delay(Duration, Value),
    /// Fail with a `Retryable` error on the first `times` calls, then succeed.
    FailRetryable { times: u32, message: String },
    /// Fail with a `Fatal` error.
    FailFatal(String),
    /// Block until the node is cancelled.
    WaitForCancel,
}

#[derive(Debug, Default)]
struct Recorder {
    calls: Vec<String>,
    running: HashSet<String>,
    overlaps: Vec<(String, String)>,
    max_concurrency: usize,
}

/// A mock executor that records every call it receives and behaves as
/// scripted per node id. Unscripted nodes succeed after `default_delay`.
#[derive(Clone, Default)]
pub struct MockExecutor {
    behaviours: HashMap<String, MockBehaviour>,
    default_delay: Duration,
    recorder: Arc<Mutex<Recorder>>,
}

impl MockExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Script the behaviour of a single node.
    pub fn with(mut self, node_id: impl Into<String>, behaviour: MockBehaviour) -> Self {
        self.behaviours.insert(node_id.into(), behaviour);
        self
    }

    /// Delay applied to nodes without an explicit behaviour.
    pub fn with_default_delay(mut self, delay: Duration) -> Self {
        self.default_delay = delay;
        self
    }

    /// Node ids in the order their attempts started.
    pub fn calls(&self) -> Vec<String> {
        self.recorder().calls.clone()
    }

    /// Number of attempts made for the given node.
    pub fn call_count(&self, node_id: &str) -> usize {
        self.recorder()
            .calls
            .iter()
            .filter(|id| id.as_str() == node_id)
            .count()
    }

    /// Whether the two nodes were ever executing at the same time.
    pub fn ran_concurrently(&self, a: &str, b: &str) -> bool {
        self.recorder()
            .overlaps
            .iter()
            .any(|(x, y)| (x == a && y == b) || (x == b && y == a))
    }

    /// Highest number of simultaneously running attempts observed.
    pub fn max_concurrency(&self) -> usize {
        self.recorder().max_concurrency
    }

    fn recorder(&self) -> MutexGuard<'_, Recorder> {
        self.recorder.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn enter(&self, node_id: &str) -> u32 {
        let mut rec = self.recorder();
        let peers: Vec<String> = rec.running.iter().cloned().collect();
        for peer in peers {
            rec.overlaps.push((peer, node_id.to_owned()));
        }
        rec.running.insert(node_id.to_owned());
        rec.max_concurrency = rec.max_concurrency.max(rec.running.len());
        rec.calls.push(node_id.to_owned());
        rec.calls.iter().filter(|id| id.as_str() == node_id).count() as u32
    }

    fn exit(&self, node_id: &str) {
        self.recorder().running.remove(node_id);
    }

    async fn behave(&self, ctx: &NodeContext, call: u32) -> Result<Value, NodeError> {
        let behaviour = self
            .behaviours
            .get(&ctx.node_id)
            .cloned()
            .unwrap_or_else(|| MockBehaviour::Delay(self.default_delay, json!({})));

        match behaviour {
            MockBehaviour::ReturnValue(v) => Ok(tag(&ctx.node_id, v)),
            MockBehaviour::Delay(delay, v) => {
                if !delay.is_zero() {
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = ctx.cancel.cancelled() => return Err(NodeError::Cancelled),
                    }
                }
                Ok(tag(&ctx.node_id, v))
            }
            MockBehaviour::FailRetryable { times, message } if call <= times => {
                Err(NodeError::Retryable(message))
            }
            MockBehaviour::FailRetryable { .. } => Ok(tag(&ctx.node_id, json!({}))),
            MockBehaviour::FailFatal(message) => Err(NodeError::Fatal(message)),
            MockBehaviour::WaitForCancel => {
                ctx.cancel.cancelled().await;
                Err(NodeError::Cancelled)
            }
        }
    }
}

/// Merge the node id into the output so tests can trace where it came from.
fn tag(node_id: &str, v: Value) -> Value {
    let mut out = json!({ "node": node_id });
    if let (Some(out_obj), Some(v_obj)) = (out.as_object_mut(), v.as_object()) {
        for (k, val) in v_obj {
            out_obj.insert(k.clone(), val.clone());
        }
    }
    out
}

#[async_trait]
impl NodeExecutor for MockExecutor {
    async fn execute_node(&self, ctx: &NodeContext) -> Result<Value, NodeError> {
        let call = self.enter(&ctx.node_id);
        let result = self.behave(ctx, call).await;
        self.exit(&ctx.node_id);
        result
    }
}
