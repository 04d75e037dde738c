//! Task lifecycle integration tests
//!
//! Covers the durable task state machine end to end:
//!
//! - Property: arbitrary interleavings of submit / cancel / claim / complete /
//!   fail only ever move tasks along legal edges, verified against an
//!   in-memory model (proptest)
//! - Claim exclusivity under real thread contention
//! - Cooperative cancellation through a running agent's checkpoints
//! - Exactly-once message effects when consumers race redelivery

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use proptest::prelude::*;
use serde_json::json;

use verbatim_core::tasks::{
    Agent, AgentContext, AgentError, AgentRuntime, AgentType, StoreError, TaskStatus, TaskStore,
};

fn temp_store() -> (tempfile::TempDir, TaskStore) {
    let dir = tempfile::tempdir().unwrap();
    let store = TaskStore::new(Some(dir.path().join("lifecycle.db"))).unwrap();
    (dir, store)
}

// ---------------------------------------------------------------------------
// Property: legal transitions only
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
enum Op {
    Submit,
    Cancel(usize),
    Claim,
    Complete(usize),
    Fail(usize),
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        Just(Op::Submit),
        (0..16usize).prop_map(Op::Cancel),
        Just(Op::Claim),
        (0..16usize).prop_map(Op::Complete),
        (0..16usize).prop_map(Op::Fail),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// Replays a random op sequence against a real store while tracking the
    /// expected status of every task in a model. Any interleaving that lets
    /// a task skip a state or leave a terminal state fails the property.
    #[test]
    fn random_interleavings_respect_the_state_machine(ops in prop::collection::vec(op_strategy(), 1..40)) {
        let (_dir, store) = temp_store();
        let mut model: HashMap<String, TaskStatus> = HashMap::new();
        let mut ids: Vec<String> = Vec::new();
        let mut claimed: Vec<String> = Vec::new();

        for op in ops {
            match op {
                Op::Submit => {
                    let id = store.submit(AgentType::Fetch, json!({})).unwrap();
                    model.insert(id.clone(), TaskStatus::Pending);
                    ids.push(id);
                }
                Op::Cancel(i) => {
                    if ids.is_empty() { continue; }
                    let id = &ids[i % ids.len()];
                    let accepted = store.cancel(id).unwrap();
                    match model[id] {
                        TaskStatus::Pending => {
                            prop_assert!(accepted);
                            model.insert(id.clone(), TaskStatus::Cancelled);
                        }
                        // Running tasks only get the cooperative flag
                        TaskStatus::Running => prop_assert!(accepted),
                        _ => prop_assert!(!accepted),
                    }
                }
                Op::Claim => {
                    let has_pending = model.values().any(|s| *s == TaskStatus::Pending);
                    match store.claim_next(&[AgentType::Fetch]).unwrap() {
                        Some(task) => {
                            prop_assert_eq!(model[&task.id], TaskStatus::Pending);
                            model.insert(task.id.clone(), TaskStatus::Running);
                            claimed.push(task.id);
                        }
                        None => prop_assert!(!has_pending),
                    }
                }
                Op::Complete(i) => {
                    if claimed.is_empty() { continue; }
                    let id = claimed[i % claimed.len()].clone();
                    let outcome = store.complete(&id, json!({"ok": true}));
                    if model[&id] == TaskStatus::Running {
                        prop_assert!(outcome.is_ok());
                        model.insert(id, TaskStatus::Completed);
                    } else {
                        let invalid = matches!(outcome, Err(StoreError::InvalidTransition { .. }));
                        prop_assert!(invalid, "complete on a non-running task must be rejected");
                    }
                }
                Op::Fail(i) => {
                    if claimed.is_empty() { continue; }
                    let id = claimed[i % claimed.len()].clone();
                    let outcome = store.fail(&id, "induced failure");
                    if model[&id] == TaskStatus::Running {
                        prop_assert!(outcome.is_ok());
                        model.insert(id, TaskStatus::Failed);
                    } else {
                        let invalid = matches!(outcome, Err(StoreError::InvalidTransition { .. }));
                        prop_assert!(invalid, "fail on a non-running task must be rejected");
                    }
                }
            }
        }

        // The store and the model agree on every task's final status
        for (id, expected) in &model {
            prop_assert_eq!(store.poll(id).unwrap().status, *expected);
        }
        let stats = store.stats().unwrap();
        let total = stats.pending + stats.running + stats.completed + stats.failed + stats.cancelled;
        prop_assert_eq!(total, model.len());
    }
}

// ---------------------------------------------------------------------------
// Claim exclusivity under contention
// ---------------------------------------------------------------------------

#[test]
fn concurrent_claims_never_hand_out_a_task_twice() {
    let (_dir, store) = temp_store();
    let store = Arc::new(store);
    for _ in 0..20 {
        store.submit(AgentType::Fetch, json!({})).unwrap();
    }

    let mut handles = Vec::new();
    for _ in 0..4 {
        let store = Arc::clone(&store);
        handles.push(std::thread::spawn(move || {
            let mut won = Vec::new();
            while let Some(task) = store.claim_next(&[AgentType::Fetch]).unwrap() {
                won.push(task.id);
            }
            won
        }));
    }

    let mut all: Vec<String> = handles
        .into_iter()
        .flat_map(|h| h.join().unwrap())
        .collect();
    let before = all.len();
    all.sort();
    all.dedup();
    assert_eq!(before, 20, "every task claimed");
    assert_eq!(all.len(), 20, "no task claimed twice");
    assert_eq!(store.stats().unwrap().running, 20);
}

// ---------------------------------------------------------------------------
// Cooperative cancellation through the runtime
// ---------------------------------------------------------------------------

/// Loops on checkpoints until cancelled; completes only if never cancelled
struct CheckpointLoopAgent;

#[async_trait]
impl Agent for CheckpointLoopAgent {
    fn agent_type(&self) -> AgentType {
        AgentType::Analyze
    }

    async fn execute(&self, ctx: &AgentContext) -> Result<serde_json::Value, AgentError> {
        for i in 0..200 {
            ctx.checkpoint()?;
            ctx.progress(i as f32 / 200.0)?;
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        Ok(json!({"ran_to_completion": true}))
    }
}

#[tokio::test]
async fn cancelling_a_running_task_stops_it_at_a_checkpoint() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(TaskStore::new(Some(dir.path().join("cancel.db"))).unwrap());

    let mut runtime =
        AgentRuntime::new(Arc::clone(&store), 1).with_poll_interval(Duration::from_millis(5));
    runtime.register(Arc::new(CheckpointLoopAgent));
    runtime.start();

    let id = store.submit(AgentType::Analyze, json!({})).unwrap();

    // Wait for the worker to pick it up, then cancel mid-flight
    let mut running = false;
    for _ in 0..100 {
        if store.poll(&id).unwrap().status == TaskStatus::Running {
            running = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(running, "task never started");
    assert!(store.cancel(&id).unwrap());

    let mut final_status = TaskStatus::Running;
    for _ in 0..200 {
        final_status = store.poll(&id).unwrap().status;
        if final_status.is_terminal() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    runtime.shutdown().await;

    assert_eq!(final_status, TaskStatus::Cancelled);
    let task = store.poll(&id).unwrap();
    assert!(task.result.is_none());
    assert!(task.completed_at.is_some());
}

#[tokio::test]
async fn uncancelled_sibling_tasks_are_untouched() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(TaskStore::new(Some(dir.path().join("sibling.db"))).unwrap());

    /// Completes quickly with one checkpoint
    struct QuickAgent;

    #[async_trait]
    impl Agent for QuickAgent {
        fn agent_type(&self) -> AgentType {
            AgentType::Optimize
        }

        async fn execute(&self, ctx: &AgentContext) -> Result<serde_json::Value, AgentError> {
            ctx.checkpoint()?;
            Ok(json!({"done": true}))
        }
    }

    let mut runtime =
        AgentRuntime::new(Arc::clone(&store), 2).with_poll_interval(Duration::from_millis(5));
    runtime.register(Arc::new(QuickAgent));
    runtime.start();

    let doomed = store.submit(AgentType::Optimize, json!({})).unwrap();
    store.cancel(&doomed).unwrap();
    let survivor = store.submit(AgentType::Optimize, json!({})).unwrap();

    let mut status = TaskStatus::Pending;
    for _ in 0..200 {
        status = store.poll(&survivor).unwrap().status;
        if status.is_terminal() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    runtime.shutdown().await;

    assert_eq!(status, TaskStatus::Completed);
    assert_eq!(store.poll(&doomed).unwrap().status, TaskStatus::Cancelled);
}

// ---------------------------------------------------------------------------
// Exactly-once message effects
// ---------------------------------------------------------------------------

#[test]
fn racing_consumers_apply_a_message_exactly_once() {
    let (_dir, store) = temp_store();
    let store = Arc::new(store);
    let id = store
        .send("fetch-1", "orchestrator", None, json!({"docs": 9}), Some("batch-1"))
        .unwrap();

    let mut handles = Vec::new();
    for _ in 0..8 {
        let store = Arc::clone(&store);
        let id = id.clone();
        handles.push(std::thread::spawn(move || store.mark_processed(&id).unwrap()));
    }

    let wins: usize = handles
        .into_iter()
        .map(|h| h.join().unwrap() as usize)
        .sum();
    assert_eq!(wins, 1, "exactly one consumer applies the effect");
    assert!(store.receive("orchestrator").unwrap().is_empty());
}

#[test]
fn redelivered_send_does_not_duplicate_the_message() {
    let (_dir, store) = temp_store();

    // Same dedup key, different payloads: the first send wins
    let first = store
        .send("fetch-1", "orchestrator", None, json!({"docs": 1}), Some("batch-7"))
        .unwrap();
    let second = store
        .send("fetch-1", "orchestrator", None, json!({"docs": 2}), Some("batch-7"))
        .unwrap();

    assert_eq!(first, second);
    let inbox = store.receive("orchestrator").unwrap();
    assert_eq!(inbox.len(), 1);
    assert_eq!(inbox[0].content["docs"], 1);
}
