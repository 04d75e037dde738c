//! Tasks Module
//!
//! Background work with an observable lifecycle:
//! - [`TaskStore`]: durable, transition-guarded record of every task and
//!   inter-agent message (single source of truth)
//! - [`AgentRuntime`]: fixed pool of workers draining the store
//! - Concrete agents: fetch, optimize, analyze
//!
//! Task state machine (terminal states are final):
//!
//! ```text
//! PENDING -> RUNNING -> COMPLETED
//!    |          |-----> FAILED
//!    +----------+-----> CANCELLED (cooperative, checkpoint-observed)
//! ```

mod agents;
mod runtime;
mod store;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use agents::{AnalyzeAgent, FetchAgent, OptimizeAgent, TranscriptSource};
pub use runtime::{Agent, AgentContext, AgentError, AgentRuntime, DEFAULT_POLL_INTERVAL};
pub use store::{StoreError, TaskStats, TaskStore, MAX_SEND_ATTEMPTS};

// ============================================================================
// STATUS AND AGENT TYPES
// ============================================================================

/// Task lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    /// Submitted, waiting for a worker claim
    Pending,
    /// Claimed by exactly one worker
    Running,
    /// Finished with a result payload
    Completed,
    /// Finished with an error payload
    Failed,
    /// Cancellation observed before or during execution
    Cancelled,
}

impl TaskStatus {
    /// String representation used in storage
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }

    /// Parse from the stored string
    pub fn parse_name(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(TaskStatus::Pending),
            "running" => Some(TaskStatus::Running),
            "completed" => Some(TaskStatus::Completed),
            "failed" => Some(TaskStatus::Failed),
            "cancelled" => Some(TaskStatus::Cancelled),
            _ => None,
        }
    }

    /// Terminal statuses permit no further mutation
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Capability tag selecting which agent executes a task
///
/// Every variant has a real executor; there is no silent no-op agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentType {
    /// Pull new transcripts from a source and index them
    Fetch,
    /// Batch-optimize queries through the query optimizer
    Optimize,
    /// Term and channel statistics over the indexed corpus
    Analyze,
}

impl AgentType {
    /// String representation used in storage
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentType::Fetch => "fetch",
            AgentType::Optimize => "optimize",
            AgentType::Analyze => "analyze",
        }
    }

    /// Parse from the stored string
    pub fn parse_name(s: &str) -> Option<Self> {
        match s {
            "fetch" => Some(AgentType::Fetch),
            "optimize" => Some(AgentType::Optimize),
            "analyze" => Some(AgentType::Analyze),
            _ => None,
        }
    }
}

impl std::fmt::Display for AgentType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ============================================================================
// TASKS AND MESSAGES
// ============================================================================

/// One unit of background work
///
/// Created by a submitter, mutated only through the store by the worker
/// that claimed it, immutable once terminal.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    /// Task identifier (UUID v4)
    pub id: String,
    /// Which agent executes this task
    pub agent_type: AgentType,
    /// Current lifecycle status
    pub status: TaskStatus,
    /// Submission time
    pub created_at: DateTime<Utc>,
    /// Claim time, once a worker picked it up
    pub started_at: Option<DateTime<Utc>>,
    /// Terminal transition time
    pub completed_at: Option<DateTime<Utc>>,
    /// Opaque agent configuration
    pub config: serde_json::Value,
    /// Opaque result payload (Completed only)
    pub result: Option<serde_json::Value>,
    /// Failure reasons, one line per attempt
    pub error: Option<String>,
    /// Progress fraction in [0, 1]
    pub progress: f32,
    /// 1-based attempt number across retries of the same logical work
    pub attempt: u32,
    /// Id of the previous attempt this task retries, if any
    pub retry_of: Option<String>,
    /// Cooperative cancellation flag, observed at checkpoints
    pub cancel_requested: bool,
}

/// One inter-agent message
///
/// Delivered at-least-once; the processed flag flips false -> true exactly
/// once, and the optional dedup key collapses duplicate sends so consumers
/// never double-apply effects.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    /// Message identifier (UUID v4)
    pub id: String,
    /// Sending agent id
    pub from_agent: String,
    /// Receiving agent id
    pub to_agent: String,
    /// Associated task, if any
    pub task_id: Option<String>,
    /// Opaque content payload
    pub content: serde_json::Value,
    /// Send time
    pub created_at: DateTime<Utc>,
    /// Whether the consumer has processed this message
    pub processed: bool,
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_through_storage_names() {
        for status in [
            TaskStatus::Pending,
            TaskStatus::Running,
            TaskStatus::Completed,
            TaskStatus::Failed,
            TaskStatus::Cancelled,
        ] {
            assert_eq!(TaskStatus::parse_name(status.as_str()), Some(status));
        }
        assert_eq!(TaskStatus::parse_name("exploded"), None);
    }

    #[test]
    fn terminal_statuses() {
        assert!(!TaskStatus::Pending.is_terminal());
        assert!(!TaskStatus::Running.is_terminal());
        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(TaskStatus::Cancelled.is_terminal());
    }

    #[test]
    fn agent_type_round_trips() {
        for agent in [AgentType::Fetch, AgentType::Optimize, AgentType::Analyze] {
            assert_eq!(AgentType::parse_name(agent.as_str()), Some(agent));
        }
        assert_eq!(AgentType::parse_name("noop"), None);
    }
}
