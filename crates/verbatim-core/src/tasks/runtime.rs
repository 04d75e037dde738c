//! Agent Runtime - fixed worker pool over the task store
//!
//! Workers claim PENDING tasks, execute the matching agent, and record the
//! outcome. Each task runs inside its own spawned tokio task, so a panic
//! or error in one task never reaches another (per-task error boundary).
//!
//! Cancellation is cooperative: agents call [`AgentContext::checkpoint`] at
//! their natural boundaries (after each widening level, each fetched item)
//! and bail out with [`AgentError::Cancelled`] when a cancel request has
//! landed. Retries resubmit a fresh PENDING task carrying the failure
//! history forward until the agent's retry budget is spent.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::{AgentType, Message, StoreError, Task, TaskStore};

/// Idle sleep between empty claim attempts
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

// ============================================================================
// ERROR TYPES
// ============================================================================

/// Agent execution error
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    /// The agent observed a cancel request at a checkpoint
    #[error("Cancelled at checkpoint")]
    Cancelled,
    /// Execution failed; subject to the agent's retry policy
    #[error("{0}")]
    Failed(String),
    /// Store access failed mid-execution
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

// ============================================================================
// AGENT SEAM
// ============================================================================

/// One agent specialization
///
/// Every registered agent executes real work and returns a typed result
/// payload; the runtime has no fallback no-op behavior.
#[async_trait]
pub trait Agent: Send + Sync {
    /// Which tasks this agent claims
    fn agent_type(&self) -> AgentType;

    /// Retries after the first failure (0 = fail immediately)
    fn max_retries(&self) -> u32 {
        0
    }

    /// Execute one task to a JSON result
    async fn execute(&self, ctx: &AgentContext) -> Result<serde_json::Value, AgentError>;
}

/// Execution context handed to an agent for one task
///
/// Wraps the store so agents report progress, observe cancellation, and
/// exchange messages without touching task rows directly.
pub struct AgentContext {
    store: Arc<TaskStore>,
    task: Task,
    agent_id: String,
}

impl AgentContext {
    /// The task being executed (snapshot at claim time)
    pub fn task(&self) -> &Task {
        &self.task
    }

    /// The task's opaque configuration payload
    pub fn config(&self) -> &serde_json::Value {
        &self.task.config
    }

    /// This worker's agent id (sender address for messages)
    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    /// Report progress in [0, 1]
    pub fn progress(&self, fraction: f32) -> Result<(), AgentError> {
        self.store.update_progress(&self.task.id, fraction)?;
        Ok(())
    }

    /// Cooperative cancellation checkpoint
    ///
    /// Returns `Err(Cancelled)` once a cancel request has landed; the
    /// runtime then transitions the task to CANCELLED.
    pub fn checkpoint(&self) -> Result<(), AgentError> {
        if self.store.cancel_requested(&self.task.id)? {
            debug!(task = %self.task.id, "cancel observed at checkpoint");
            return Err(AgentError::Cancelled);
        }
        Ok(())
    }

    /// Send a message to another agent, with retry and dead-lettering
    pub async fn send(
        &self,
        to: &str,
        content: serde_json::Value,
        dedup_key: Option<&str>,
    ) -> Result<String, AgentError> {
        let id = self
            .store
            .send_with_retry(&self.agent_id, to, Some(&self.task.id), content, dedup_key)
            .await?;
        Ok(id)
    }

    /// Unprocessed messages addressed to this agent
    pub fn receive(&self) -> Result<Vec<Message>, AgentError> {
        Ok(self.store.receive(&self.agent_id)?)
    }

    /// Flip a received message to processed; true only on the first call
    pub fn mark_processed(&self, message_id: &str) -> Result<bool, AgentError> {
        Ok(self.store.mark_processed(message_id)?)
    }
}

// ============================================================================
// RUNTIME
// ============================================================================

/// Fixed-size pool of workers draining the task store
pub struct AgentRuntime {
    store: Arc<TaskStore>,
    agents: HashMap<AgentType, Arc<dyn Agent>>,
    workers: usize,
    poll_interval: Duration,
    shutdown: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl AgentRuntime {
    /// Runtime over a store with the given pool size
    pub fn new(store: Arc<TaskStore>, workers: usize) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            store,
            agents: HashMap::new(),
            workers: workers.max(1),
            poll_interval: DEFAULT_POLL_INTERVAL,
            shutdown,
            handles: Vec::new(),
        }
    }

    /// Override the idle poll interval
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Register an agent; replaces any previous agent of the same type
    pub fn register(&mut self, agent: Arc<dyn Agent>) {
        self.agents.insert(agent.agent_type(), agent);
    }

    /// Spawn the worker pool
    ///
    /// Workers only claim task types with a registered agent.
    pub fn start(&mut self) {
        let types: Vec<AgentType> = self.agents.keys().copied().collect();
        if types.is_empty() {
            warn!("agent runtime started with no registered agents");
        }
        for worker_index in 0..self.workers {
            let store = Arc::clone(&self.store);
            let agents = self.agents.clone();
            let types = types.clone();
            let poll_interval = self.poll_interval;
            let mut shutdown = self.shutdown.subscribe();

            let handle = tokio::spawn(async move {
                info!(worker = worker_index, "worker started");
                loop {
                    if *shutdown.borrow() {
                        break;
                    }
                    match store.claim_next(&types) {
                        Ok(Some(task)) => {
                            run_one(Arc::clone(&store), &agents, task, worker_index).await;
                        }
                        Ok(None) => {
                            // Idle; wake on shutdown or after the interval
                            tokio::select! {
                                _ = shutdown.changed() => {}
                                _ = tokio::time::sleep(poll_interval) => {}
                            }
                        }
                        Err(e) => {
                            error!(worker = worker_index, "claim failed: {}", e);
                            tokio::time::sleep(poll_interval).await;
                        }
                    }
                }
                info!(worker = worker_index, "worker stopped");
            });
            self.handles.push(handle);
        }
    }

    /// Signal shutdown and wait for every worker to stop
    ///
    /// In-flight tasks finish their current execution first.
    pub async fn shutdown(&mut self) {
        let _ = self.shutdown.send(true);
        for handle in self.handles.drain(..) {
            let _ = handle.await;
        }
    }

    /// The store this runtime drains
    pub fn store(&self) -> &Arc<TaskStore> {
        &self.store
    }
}

/// Execute one claimed task inside its own error boundary
async fn run_one(
    store: Arc<TaskStore>,
    agents: &HashMap<AgentType, Arc<dyn Agent>>,
    task: Task,
    worker_index: usize,
) {
    let Some(agent) = agents.get(&task.agent_type).cloned() else {
        // Claim set is derived from registrations, so this is a logic bug;
        // record it on the task rather than crashing the worker
        let _ = store.fail(&task.id, "no agent registered for task type");
        return;
    };

    let task_id = task.id.clone();
    let max_retries = agent.max_retries();
    let attempt = task.attempt;
    let agent_id = format!("{}-{}", task.agent_type, worker_index);
    let ctx = AgentContext {
        store: Arc::clone(&store),
        task,
        agent_id,
    };

    // Spawned so a panicking agent takes down only this task
    let outcome = tokio::spawn(async move {
        let result = agent.execute(&ctx).await;
        (ctx, result)
    })
    .await;

    match outcome {
        Ok((_ctx, Ok(result))) => {
            if let Err(e) = store.complete(&task_id, result) {
                // Lost a race with cancellation; the terminal state stands
                debug!(task = %task_id, "completion not recorded: {}", e);
            }
        }
        Ok((_ctx, Err(AgentError::Cancelled))) => {
            if let Err(e) = store.mark_cancelled(&task_id) {
                debug!(task = %task_id, "cancellation not recorded: {}", e);
            }
        }
        Ok((_ctx, Err(e))) => {
            record_failure(&store, &task_id, &e.to_string(), attempt, max_retries);
        }
        Err(join_error) => {
            let reason = if join_error.is_panic() {
                "agent panicked".to_string()
            } else {
                format!("agent aborted: {}", join_error)
            };
            record_failure(&store, &task_id, &reason, attempt, max_retries);
        }
    }
}

/// Record a failure and apply the retry policy
fn record_failure(
    store: &Arc<TaskStore>,
    task_id: &str,
    reason: &str,
    attempt: u32,
    max_retries: u32,
) {
    if let Err(e) = store.fail(task_id, reason) {
        debug!(task = %task_id, "failure not recorded: {}", e);
        return;
    }
    if attempt <= max_retries {
        match store.poll(task_id) {
            Ok(failed) => {
                if let Err(e) = store.resubmit(&failed) {
                    error!(task = %task_id, "retry resubmission failed: {}", e);
                }
            }
            Err(e) => error!(task = %task_id, "failed task vanished before retry: {}", e),
        }
    } else {
        warn!(task = %task_id, attempt, "retry budget exhausted, task stays failed");
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tasks::TaskStatus;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn temp_store() -> (tempfile::TempDir, Arc<TaskStore>) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(TaskStore::new(Some(dir.path().join("rt.db"))).unwrap());
        (dir, store)
    }

    async fn wait_terminal(store: &TaskStore, id: &str) -> Task {
        for _ in 0..200 {
            let task = store.poll(id).unwrap();
            if task.status.is_terminal() {
                return task;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("task {} never reached a terminal state", id);
    }

    struct SucceedingAgent;

    #[async_trait]
    impl Agent for SucceedingAgent {
        fn agent_type(&self) -> AgentType {
            AgentType::Analyze
        }

        async fn execute(&self, ctx: &AgentContext) -> Result<serde_json::Value, AgentError> {
            ctx.progress(0.5)?;
            Ok(json!({"echo": ctx.config().clone()}))
        }
    }

    struct FlakyAgent {
        failures_left: AtomicU32,
    }

    #[async_trait]
    impl Agent for FlakyAgent {
        fn agent_type(&self) -> AgentType {
            AgentType::Fetch
        }

        fn max_retries(&self) -> u32 {
            2
        }

        async fn execute(&self, _ctx: &AgentContext) -> Result<serde_json::Value, AgentError> {
            if self.failures_left.fetch_sub(1, Ordering::SeqCst) > 0 {
                Err(AgentError::Failed("transient failure".to_string()))
            } else {
                Ok(json!({"ok": true}))
            }
        }
    }

    struct AlwaysFailingAgent;

    #[async_trait]
    impl Agent for AlwaysFailingAgent {
        fn agent_type(&self) -> AgentType {
            AgentType::Fetch
        }

        fn max_retries(&self) -> u32 {
            2
        }

        async fn execute(&self, ctx: &AgentContext) -> Result<serde_json::Value, AgentError> {
            Err(AgentError::Failed(format!(
                "failure on attempt {}",
                ctx.task().attempt
            )))
        }
    }

    struct PanickingAgent;

    #[async_trait]
    impl Agent for PanickingAgent {
        fn agent_type(&self) -> AgentType {
            AgentType::Optimize
        }

        async fn execute(&self, _ctx: &AgentContext) -> Result<serde_json::Value, AgentError> {
            panic!("agent bug");
        }
    }

    #[tokio::test]
    async fn worker_completes_a_task() {
        let (_dir, store) = temp_store();
        let mut runtime = AgentRuntime::new(Arc::clone(&store), 2)
            .with_poll_interval(Duration::from_millis(5));
        runtime.register(Arc::new(SucceedingAgent));
        runtime.start();

        let id = store.submit(AgentType::Analyze, json!({"channel": "ml"})).unwrap();
        let task = wait_terminal(&store, &id).await;
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.progress, 1.0);
        assert_eq!(task.result.unwrap()["echo"]["channel"], "ml");

        runtime.shutdown().await;
    }

    #[tokio::test]
    async fn transient_failure_retries_to_success() {
        let (_dir, store) = temp_store();
        let mut runtime = AgentRuntime::new(Arc::clone(&store), 1)
            .with_poll_interval(Duration::from_millis(5));
        runtime.register(Arc::new(FlakyAgent {
            failures_left: AtomicU32::new(1),
        }));
        runtime.start();

        let id = store.submit(AgentType::Fetch, json!({})).unwrap();
        let first = wait_terminal(&store, &id).await;
        assert_eq!(first.status, TaskStatus::Failed);

        // The retry is a fresh task referencing the failed one
        tokio::time::sleep(Duration::from_millis(100)).await;
        let stats = store.stats().unwrap();
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.failed, 1);

        runtime.shutdown().await;
    }

    #[tokio::test]
    async fn retry_budget_exhaustion_retains_all_reasons() {
        let (_dir, store) = temp_store();
        let mut runtime = AgentRuntime::new(Arc::clone(&store), 1)
            .with_poll_interval(Duration::from_millis(5));
        runtime.register(Arc::new(AlwaysFailingAgent));
        runtime.start();

        store.submit(AgentType::Fetch, json!({})).unwrap();

        // max_retries = 2 means three attempts total
        for _ in 0..300 {
            let stats = store.stats().unwrap();
            if stats.failed == 3 && stats.pending == 0 && stats.running == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        runtime.shutdown().await;

        let failed = store.tasks_with_status(TaskStatus::Failed).unwrap();
        assert_eq!(failed.len(), 3);

        // The final attempt retains every prior attempt's reason
        let last = failed.iter().find(|t| t.attempt == 3).unwrap();
        let error = last.error.as_ref().unwrap();
        assert!(error.contains("attempt 1: failure on attempt 1"));
        assert!(error.contains("attempt 2: failure on attempt 2"));
        assert!(error.contains("attempt 3: failure on attempt 3"));
        assert!(last.retry_of.is_some());
    }

    #[tokio::test]
    async fn panic_is_contained_to_its_task() {
        let (_dir, store) = temp_store();
        let mut runtime = AgentRuntime::new(Arc::clone(&store), 1)
            .with_poll_interval(Duration::from_millis(5));
        runtime.register(Arc::new(PanickingAgent));
        runtime.register(Arc::new(SucceedingAgent));
        runtime.start();

        let bad = store.submit(AgentType::Optimize, json!({})).unwrap();
        let good = store.submit(AgentType::Analyze, json!({})).unwrap();

        let bad_task = wait_terminal(&store, &bad).await;
        assert_eq!(bad_task.status, TaskStatus::Failed);
        assert!(bad_task.error.unwrap().contains("panicked"));

        // The pool survived and still executes other tasks
        let good_task = wait_terminal(&store, &good).await;
        assert_eq!(good_task.status, TaskStatus::Completed);

        runtime.shutdown().await;
    }

    #[tokio::test]
    async fn checkpoint_cancellation_during_execution() {
        struct CheckpointingAgent;

        #[async_trait]
        impl Agent for CheckpointingAgent {
            fn agent_type(&self) -> AgentType {
                AgentType::Analyze
            }

            async fn execute(&self, ctx: &AgentContext) -> Result<serde_json::Value, AgentError> {
                for i in 0..100 {
                    ctx.checkpoint()?;
                    ctx.progress(i as f32 / 100.0)?;
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
                Ok(json!({}))
            }
        }

        let (_dir, store) = temp_store();
        let mut runtime = AgentRuntime::new(Arc::clone(&store), 1)
            .with_poll_interval(Duration::from_millis(5));
        runtime.register(Arc::new(CheckpointingAgent));
        runtime.start();

        let id = store.submit(AgentType::Analyze, json!({})).unwrap();

        // Wait for the claim, then request cancellation
        for _ in 0..200 {
            if store.poll(&id).unwrap().status == TaskStatus::Running {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        store.cancel(&id).unwrap();

        let task = wait_terminal(&store, &id).await;
        assert_eq!(task.status, TaskStatus::Cancelled);

        runtime.shutdown().await;
    }
}
