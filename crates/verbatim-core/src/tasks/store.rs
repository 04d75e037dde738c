//! Task Store - durable task and message records
//!
//! The single source of truth for task state. Every status transition goes
//! through guarded SQL (`WHERE status IN (...)`), so the PENDING -> RUNNING
//! -> terminal state machine cannot be violated no matter how calls
//! interleave. Claims are an atomic compare-and-set on the status column:
//! exactly one worker wins a given task.
//!
//! Messages ride in the same database: send-ordered delivery per recipient,
//! idempotent processing via the processed flag, duplicate-send collapse via
//! an optional dedup key, and a dead-letter table for sends that exhaust
//! their retries.

use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use chrono::Utc;
use rusqlite::{Connection, OptionalExtension};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::storage;

use super::{AgentType, Message, Task, TaskStatus};

// ============================================================================
// ERROR TYPES
// ============================================================================

/// Task store error type
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Database error
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),
    /// Task not found
    #[error("Task not found: {0}")]
    NotFound(String),
    /// Transition not permitted by the task state machine
    #[error("Invalid transition for task {id}: {detail}")]
    InvalidTransition {
        /// Task id
        id: String,
        /// What was attempted against which current status
        detail: String,
    },
    /// Message moved to the dead-letter table after exhausting retries
    #[error("Message to '{0}' dead-lettered: {1}")]
    DeadLettered(String, String),
    /// Initialization error
    #[error("Initialization error: {0}")]
    Init(String),
}

/// Task store result type
pub type Result<T> = std::result::Result<T, StoreError>;

impl From<storage::StorageError> for StoreError {
    fn from(e: storage::StorageError) -> Self {
        match e {
            storage::StorageError::Database(db) => StoreError::Database(db),
            other => StoreError::Init(other.to_string()),
        }
    }
}

// ============================================================================
// TASK STORE
// ============================================================================

/// Send attempts before a message is dead-lettered
pub const MAX_SEND_ATTEMPTS: u32 = 3;

/// Per-status task counts
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskStats {
    pub pending: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
}

/// Durable task and message store
///
/// All methods take `&self`; the writer connection is the serialization
/// point for status transitions (single-writer-per-row discipline).
pub struct TaskStore {
    writer: Mutex<Connection>,
    reader: Mutex<Connection>,
}

impl TaskStore {
    /// Open (or create) the store at the given path
    pub fn new(db_path: Option<PathBuf>) -> Result<Self> {
        let path = match db_path {
            Some(p) => p,
            None => storage::default_db_path()?,
        };
        let writer = storage::open(Some(path.clone()))?;
        let reader = storage::open(Some(path))?;
        Ok(Self {
            writer: Mutex::new(writer),
            reader: Mutex::new(reader),
        })
    }

    fn writer(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.writer
            .lock()
            .map_err(|_| StoreError::Init("Writer lock poisoned".into()))
    }

    fn reader(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.reader
            .lock()
            .map_err(|_| StoreError::Init("Reader lock poisoned".into()))
    }

    // ------------------------------------------------------------------
    // Submission and inspection
    // ------------------------------------------------------------------

    /// Create a PENDING task; never blocks on execution
    pub fn submit(&self, agent_type: AgentType, config: serde_json::Value) -> Result<String> {
        let id = Uuid::new_v4().to_string();
        let writer = self.writer()?;
        writer.execute(
            "INSERT INTO tasks (id, agent_type, status, created_at, config)
             VALUES (?1, ?2, 'pending', ?3, ?4)",
            rusqlite::params![
                id,
                agent_type.as_str(),
                Utc::now().to_rfc3339(),
                config.to_string(),
            ],
        )?;
        debug!(task = %id, agent = %agent_type, "task submitted");
        Ok(id)
    }

    /// Resubmit failed work as a fresh PENDING attempt
    ///
    /// Carries the accumulated failure history forward so the final FAILED
    /// row retains every attempt's reason.
    pub fn resubmit(&self, failed: &Task) -> Result<String> {
        let id = Uuid::new_v4().to_string();
        let writer = self.writer()?;
        writer.execute(
            "INSERT INTO tasks (id, agent_type, status, created_at, config, error, attempt, retry_of)
             VALUES (?1, ?2, 'pending', ?3, ?4, ?5, ?6, ?7)",
            rusqlite::params![
                id,
                failed.agent_type.as_str(),
                Utc::now().to_rfc3339(),
                failed.config.to_string(),
                failed.error,
                failed.attempt + 1,
                failed.id,
            ],
        )?;
        info!(task = %id, retry_of = %failed.id, attempt = failed.attempt + 1, "task resubmitted");
        Ok(id)
    }

    /// Current snapshot of a task, including progress
    pub fn poll(&self, task_id: &str) -> Result<Task> {
        let reader = self.reader()?;
        reader
            .query_row(
                "SELECT id, agent_type, status, created_at, started_at, completed_at,
                        config, result, error, progress, attempt, retry_of, cancel_requested
                 FROM tasks WHERE id = ?1",
                [task_id],
                row_to_task,
            )
            .optional()?
            .ok_or_else(|| StoreError::NotFound(task_id.to_string()))
    }

    /// All tasks currently in a given status, oldest first
    pub fn tasks_with_status(&self, status: TaskStatus) -> Result<Vec<Task>> {
        let reader = self.reader()?;
        let mut stmt = reader.prepare(
            "SELECT id, agent_type, status, created_at, started_at, completed_at,
                    config, result, error, progress, attempt, retry_of, cancel_requested
             FROM tasks WHERE status = ?1 ORDER BY created_at ASC, id ASC",
        )?;
        let rows = stmt.query_map([status.as_str()], row_to_task)?;
        let mut tasks = Vec::new();
        for row in rows {
            tasks.push(row?);
        }
        Ok(tasks)
    }

    /// Per-status counts
    pub fn stats(&self) -> Result<TaskStats> {
        let reader = self.reader()?;
        let mut stats = TaskStats::default();
        let mut stmt = reader.prepare("SELECT status, COUNT(*) FROM tasks GROUP BY status")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as usize))
        })?;
        for row in rows {
            let (status, count) = row?;
            match status.as_str() {
                "pending" => stats.pending = count,
                "running" => stats.running = count,
                "completed" => stats.completed = count,
                "failed" => stats.failed = count,
                "cancelled" => stats.cancelled = count,
                _ => {}
            }
        }
        Ok(stats)
    }

    // ------------------------------------------------------------------
    // Claims and transitions
    // ------------------------------------------------------------------

    /// Claim the oldest PENDING task for any of the given agent types
    ///
    /// The claim is a compare-and-set inside one write transaction; at most
    /// one worker can move a task out of PENDING.
    pub fn claim_next(&self, agent_types: &[AgentType]) -> Result<Option<Task>> {
        if agent_types.is_empty() {
            return Ok(None);
        }
        let mut writer = self.writer()?;
        let tx = writer.transaction()?;

        let placeholders: Vec<String> =
            (0..agent_types.len()).map(|i| format!("?{}", i + 1)).collect();
        let candidate: Option<String> = {
            let sql = format!(
                "SELECT id FROM tasks WHERE status = 'pending' AND agent_type IN ({})
                 ORDER BY created_at ASC, id ASC LIMIT 1",
                placeholders.join(", ")
            );
            let mut stmt = tx.prepare(&sql)?;
            let names: Vec<&'static str> = agent_types.iter().map(|t| t.as_str()).collect();
            let params: Vec<&dyn rusqlite::ToSql> =
                names.iter().map(|t| t as &dyn rusqlite::ToSql).collect();
            stmt.query_row(params.as_slice(), |row| row.get(0)).optional()?
        };

        let Some(id) = candidate else {
            tx.commit()?;
            return Ok(None);
        };

        // CAS: only a still-pending task can be claimed
        let changed = tx.execute(
            "UPDATE tasks SET status = 'running', started_at = ?1
             WHERE id = ?2 AND status = 'pending'",
            rusqlite::params![Utc::now().to_rfc3339(), id],
        )?;
        tx.commit()?;

        if changed == 0 {
            // Lost the race (cancelled between select and update)
            return Ok(None);
        }
        debug!(task = %id, "task claimed");
        self.poll(&id).map(Some)
    }

    /// Request cancellation
    ///
    /// PENDING tasks flip to CANCELLED immediately. RUNNING tasks get a
    /// cooperative flag the owning worker observes at its next checkpoint.
    /// Returns false when the task is already terminal.
    pub fn cancel(&self, task_id: &str) -> Result<bool> {
        let writer = self.writer()?;
        let direct = writer.execute(
            "UPDATE tasks SET status = 'cancelled', completed_at = ?1
             WHERE id = ?2 AND status = 'pending'",
            rusqlite::params![Utc::now().to_rfc3339(), task_id],
        )?;
        if direct == 1 {
            info!(task = %task_id, "pending task cancelled");
            return Ok(true);
        }
        let flagged = writer.execute(
            "UPDATE tasks SET cancel_requested = 1 WHERE id = ?1 AND status = 'running'",
            [task_id],
        )?;
        if flagged == 1 {
            info!(task = %task_id, "cancellation requested for running task");
            return Ok(true);
        }
        // Distinguish unknown ids from already-terminal tasks
        let exists: bool = writer
            .query_row("SELECT 1 FROM tasks WHERE id = ?1", [task_id], |_| Ok(true))
            .optional()?
            .unwrap_or(false);
        if exists {
            Ok(false)
        } else {
            Err(StoreError::NotFound(task_id.to_string()))
        }
    }

    /// Whether cancellation has been requested for a RUNNING task
    pub fn cancel_requested(&self, task_id: &str) -> Result<bool> {
        let reader = self.reader()?;
        reader
            .query_row(
                "SELECT cancel_requested FROM tasks WHERE id = ?1",
                [task_id],
                |row| row.get::<_, i64>(0).map(|v| v != 0),
            )
            .optional()?
            .ok_or_else(|| StoreError::NotFound(task_id.to_string()))
    }

    /// Update progress on a RUNNING task (clamped to [0, 1])
    pub fn update_progress(&self, task_id: &str, progress: f32) -> Result<()> {
        let writer = self.writer()?;
        let changed = writer.execute(
            "UPDATE tasks SET progress = ?1 WHERE id = ?2 AND status = 'running'",
            rusqlite::params![progress.clamp(0.0, 1.0) as f64, task_id],
        )?;
        if changed == 0 {
            return Err(self.transition_error(&writer, task_id, "progress update"));
        }
        Ok(())
    }

    /// RUNNING -> COMPLETED with a result payload
    pub fn complete(&self, task_id: &str, result: serde_json::Value) -> Result<()> {
        let writer = self.writer()?;
        let changed = writer.execute(
            "UPDATE tasks SET status = 'completed', completed_at = ?1, result = ?2, progress = 1.0
             WHERE id = ?3 AND status = 'running'",
            rusqlite::params![Utc::now().to_rfc3339(), result.to_string(), task_id],
        )?;
        if changed == 0 {
            return Err(self.transition_error(&writer, task_id, "complete"));
        }
        info!(task = %task_id, "task completed");
        Ok(())
    }

    /// RUNNING -> FAILED, appending this attempt's reason to the history
    pub fn fail(&self, task_id: &str, reason: &str) -> Result<()> {
        let writer = self.writer()?;
        let attempt: u32 = writer
            .query_row("SELECT attempt FROM tasks WHERE id = ?1", [task_id], |row| {
                row.get(0)
            })
            .optional()?
            .ok_or_else(|| StoreError::NotFound(task_id.to_string()))?;

        let line = format!("attempt {}: {}", attempt, reason);
        let changed = writer.execute(
            "UPDATE tasks SET status = 'failed', completed_at = ?1,
                    error = CASE WHEN error IS NULL OR error = '' THEN ?2
                                 ELSE error || char(10) || ?2 END
             WHERE id = ?3 AND status = 'running'",
            rusqlite::params![Utc::now().to_rfc3339(), line, task_id],
        )?;
        if changed == 0 {
            return Err(self.transition_error(&writer, task_id, "fail"));
        }
        warn!(task = %task_id, %reason, "task failed");
        Ok(())
    }

    /// RUNNING -> CANCELLED, the worker-observed half of cooperative cancel
    pub fn mark_cancelled(&self, task_id: &str) -> Result<()> {
        let writer = self.writer()?;
        let changed = writer.execute(
            "UPDATE tasks SET status = 'cancelled', completed_at = ?1
             WHERE id = ?2 AND status = 'running'",
            rusqlite::params![Utc::now().to_rfc3339(), task_id],
        )?;
        if changed == 0 {
            return Err(self.transition_error(&writer, task_id, "mark cancelled"));
        }
        info!(task = %task_id, "running task cancelled at checkpoint");
        Ok(())
    }

    fn transition_error(&self, conn: &Connection, task_id: &str, action: &str) -> StoreError {
        let current: Option<String> = conn
            .query_row("SELECT status FROM tasks WHERE id = ?1", [task_id], |row| {
                row.get(0)
            })
            .optional()
            .ok()
            .flatten();
        match current {
            Some(status) => StoreError::InvalidTransition {
                id: task_id.to_string(),
                detail: format!("cannot {} a '{}' task", action, status),
            },
            None => StoreError::NotFound(task_id.to_string()),
        }
    }

    // ------------------------------------------------------------------
    // Messages
    // ------------------------------------------------------------------

    /// Send a message to another agent
    ///
    /// A `dedup_key` makes redelivery harmless: duplicate sends to the same
    /// recipient collapse into the first row, and the first row's id comes
    /// back so senders cannot tell the difference.
    pub fn send(
        &self,
        from: &str,
        to: &str,
        task_id: Option<&str>,
        content: serde_json::Value,
        dedup_key: Option<&str>,
    ) -> Result<String> {
        let mut writer = self.writer()?;
        let tx = writer.transaction()?;

        if let Some(key) = dedup_key {
            let existing: Option<String> = tx
                .query_row(
                    "SELECT id FROM messages WHERE to_agent = ?1 AND dedup_key = ?2",
                    rusqlite::params![to, key],
                    |row| row.get(0),
                )
                .optional()?;
            if let Some(id) = existing {
                tx.commit()?;
                debug!(message = %id, "duplicate send collapsed by dedup key");
                return Ok(id);
            }
        }

        let seq: i64 = tx.query_row(
            "UPDATE message_seq SET next = next + 1 WHERE id = 1 RETURNING next - 1",
            [],
            |row| row.get(0),
        )?;
        let id = Uuid::new_v4().to_string();
        tx.execute(
            "INSERT INTO messages (id, from_agent, to_agent, task_id, content, created_at, seq, dedup_key)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            rusqlite::params![
                id,
                from,
                to,
                task_id,
                content.to_string(),
                Utc::now().to_rfc3339(),
                seq,
                dedup_key,
            ],
        )?;
        tx.commit()?;
        debug!(message = %id, %from, %to, "message sent");
        Ok(id)
    }

    /// Send with backoff; dead-letter the message after the final attempt
    ///
    /// The returned error is the only way a message leaves the system:
    /// nothing is dropped silently.
    pub async fn send_with_retry(
        &self,
        from: &str,
        to: &str,
        task_id: Option<&str>,
        content: serde_json::Value,
        dedup_key: Option<&str>,
    ) -> Result<String> {
        let mut last_error = String::new();
        for attempt in 0..MAX_SEND_ATTEMPTS {
            match self.send(from, to, task_id, content.clone(), dedup_key) {
                Ok(id) => return Ok(id),
                Err(e) => {
                    last_error = e.to_string();
                    warn!(%from, %to, attempt = attempt + 1, "message send failed: {}", last_error);
                    tokio::time::sleep(Duration::from_millis(50 * 2u64.pow(attempt))).await;
                }
            }
        }
        self.dead_letter(from, to, &content, &last_error, MAX_SEND_ATTEMPTS)?;
        Err(StoreError::DeadLettered(to.to_string(), last_error))
    }

    fn dead_letter(
        &self,
        from: &str,
        to: &str,
        content: &serde_json::Value,
        reason: &str,
        attempts: u32,
    ) -> Result<()> {
        let writer = self.writer()?;
        writer.execute(
            "INSERT INTO dead_letters (id, from_agent, to_agent, content, reason, attempts, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            rusqlite::params![
                Uuid::new_v4().to_string(),
                from,
                to,
                content.to_string(),
                reason,
                attempts,
                Utc::now().to_rfc3339(),
            ],
        )?;
        warn!(%from, %to, "message dead-lettered after {} attempts", attempts);
        Ok(())
    }

    /// Unprocessed messages for a recipient, in send order
    pub fn receive(&self, agent_id: &str) -> Result<Vec<Message>> {
        let reader = self.reader()?;
        let mut stmt = reader.prepare(
            "SELECT id, from_agent, to_agent, task_id, content, created_at, processed
             FROM messages WHERE to_agent = ?1 AND processed = 0 ORDER BY seq ASC",
        )?;
        let rows = stmt.query_map([agent_id], row_to_message)?;
        let mut messages = Vec::new();
        for row in rows {
            messages.push(row?);
        }
        Ok(messages)
    }

    /// Flip processed false -> true; idempotent
    ///
    /// Returns true only for the call that actually flipped the flag, so a
    /// consumer racing its own redelivery applies effects exactly once.
    pub fn mark_processed(&self, message_id: &str) -> Result<bool> {
        let writer = self.writer()?;
        let changed = writer.execute(
            "UPDATE messages SET processed = 1 WHERE id = ?1 AND processed = 0",
            [message_id],
        )?;
        Ok(changed == 1)
    }

    /// Number of dead-lettered messages
    pub fn dead_letter_count(&self) -> Result<usize> {
        let reader = self.reader()?;
        let count: i64 =
            reader.query_row("SELECT COUNT(*) FROM dead_letters", [], |row| row.get(0))?;
        Ok(count as usize)
    }
}

fn row_to_task(row: &rusqlite::Row<'_>) -> rusqlite::Result<Task> {
    let agent_type: String = row.get(1)?;
    let status: String = row.get(2)?;
    let config: String = row.get(6)?;
    let result: Option<String> = row.get(7)?;
    Ok(Task {
        id: row.get(0)?,
        agent_type: AgentType::parse_name(&agent_type).unwrap_or(AgentType::Analyze),
        status: TaskStatus::parse_name(&status).unwrap_or(TaskStatus::Failed),
        created_at: row.get(3)?,
        started_at: row.get(4)?,
        completed_at: row.get(5)?,
        config: serde_json::from_str(&config).unwrap_or(serde_json::Value::Null),
        result: result.and_then(|r| serde_json::from_str(&r).ok()),
        error: row.get(8)?,
        progress: row.get::<_, f64>(9)? as f32,
        attempt: row.get(10)?,
        retry_of: row.get(11)?,
        cancel_requested: row.get::<_, i64>(12)? != 0,
    })
}

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<Message> {
    let content: String = row.get(4)?;
    Ok(Message {
        id: row.get(0)?,
        from_agent: row.get(1)?,
        to_agent: row.get(2)?,
        task_id: row.get(3)?,
        content: serde_json::from_str(&content).unwrap_or(serde_json::Value::Null),
        created_at: row.get(5)?,
        processed: row.get::<_, i64>(6)? != 0,
    })
}

// ============================================================================
// TESTS
// ============================================================================
