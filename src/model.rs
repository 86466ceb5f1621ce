//! Core data model.
//!
//! A task is one durable unit of enqueued work: an opaque prompt, the
//! identity of whoever reported it, a retry-tracked lifecycle, and an
//! append-only log. Field names serialize in camelCase to match the
//! on-disk store format.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Task
// ---------------------------------------------------------------------------

/// A unit of work tracked by the queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    /// Unique identifier, assigned at creation.
    pub id: TaskId,

    /// Current lifecycle status.
    pub status: TaskStatus,

    /// Opaque payload supplied by the producer. The queue doesn't interpret it.
    pub prompt: serde_json::Value,

    /// Producer identity, passed through unchanged for downstream reporting.
    pub reporter_email: String,

    /// Result from the processing capability. Present only when completed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<TaskResult>,

    /// Last failure message. Present only when failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Number of failed attempts so far.
    pub retries: u32,

    /// Retry budget. Re-queued while `retries < max_retries`.
    pub max_retries: u32,

    pub created_at: DateTime<Utc>,
    /// Set when picked for processing; cleared when the task returns to pending.
    pub started_at: Option<DateTime<Utc>>,
    /// Set when the task reaches a terminal status.
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,

    /// Append-only history of what happened to this task.
    pub logs: Vec<TaskLog>,
}

impl Task {
    /// Is this task in a terminal status?
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Append a log entry stamped with the current time.
    pub(crate) fn push_log(&mut self, level: LogLevel, message: impl Into<String>) {
        self.logs.push(TaskLog {
            timestamp: Utc::now(),
            level,
            message: message.into(),
        });
    }
}

/// Newtype for task IDs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskId(pub Uuid);

impl TaskId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Short display: first 8 chars of UUID
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::str::FromStr for TaskId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

/// Lifecycle status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    /// Waiting to be picked by the scheduler.
    Pending,
    /// Claimed by the scheduler, capability running.
    Processing,
    /// Done successfully. Terminal.
    Completed,
    /// Exhausted retries. Terminal.
    Failed,
}

impl TaskStatus {
    /// Can transition from self to `to`?
    pub fn can_transition_to(self, to: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, to),
            (Pending, Processing)
                | (Processing, Completed)
                | (Processing, Pending)   // failed attempt, retry budget left
                | (Processing, Failed) // exhausted retries
        )
    }

    /// Is this a terminal status?
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Processing => "processing",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TaskStatus::Pending),
            "processing" => Ok(TaskStatus::Processing),
            "completed" => Ok(TaskStatus::Completed),
            "failed" => Ok(TaskStatus::Failed),
            other => Err(format!("unknown task status: {other}")),
        }
    }
}

// ---------------------------------------------------------------------------
// Result
// ---------------------------------------------------------------------------

/// Structured value returned by the processing capability.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskResult {
    /// Capability output. Opaque to the queue.
    pub data: serde_json::Value,

    /// Wall-clock duration of the attempt that produced this result.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
}

impl TaskResult {
    pub fn new(data: serde_json::Value) -> Self {
        Self {
            data,
            duration_ms: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Logs
// ---------------------------------------------------------------------------

/// A log entry scoped to a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskLog {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warn => "WARN",
            LogLevel::Error => "ERROR",
        };
        write!(f, "{s}")
    }
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Builder for new tasks. The store's public API for enqueueing work.
pub struct NewTask {
    pub(crate) prompt: serde_json::Value,
    pub(crate) reporter_email: String,
    pub(crate) max_retries: Option<u32>,
}

impl NewTask {
    pub fn new(prompt: serde_json::Value, reporter_email: impl Into<String>) -> Self {
        Self {
            prompt,
            reporter_email: reporter_email.into(),
            max_retries: None,
        }
    }

    /// Override the store's default retry budget for this task.
    pub fn max_retries(mut self, n: u32) -> Self {
        self.max_retries = Some(n);
        self
    }
}

// ---------------------------------------------------------------------------
// Store container
// ---------------------------------------------------------------------------

/// The serialized container holding all tasks. Read, mutated in memory, and
/// rewritten in full on every transaction.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreFile {
    pub tasks: Vec<Task>,
    pub last_updated: DateTime<Utc>,
}

impl StoreFile {
    pub fn empty() -> Self {
        Self {
            tasks: Vec::new(),
            last_updated: Utc::now(),
        }
    }
}

/// Counts per status, for health reporting.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct StoreStats {
    pub pending: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
}

impl StoreStats {
    pub fn total(&self) -> usize {
        self.pending + self.processing + self.completed + self.failed
    }
}
