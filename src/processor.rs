//! Processing capability contract, plus the hook-command implementation.
//!
//! A processor turns a task's prompt into a result. Its internals are opaque
//! to the queue — the scheduler only cares about the contract: take a task
//! and a cancellation context, come back with a result or an error, and
//! abort promptly when the token fires.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::model::{Task, TaskResult};

/// Per-dispatch options handed to the processor.
#[derive(Debug, Clone)]
pub struct ProcessContext {
    /// Cooperative cancellation signal. Set on timeout and on forced
    /// shutdown; a well-behaved processor observes it and aborts promptly.
    pub cancellation: CancellationToken,

    /// Advisory deadline — how long the scheduler will nominally wait.
    pub timeout: Duration,
}

/// The pluggable processing capability.
#[async_trait]
pub trait TaskProcessor: Send + Sync {
    /// Process one task. Cancellation is cooperative: check
    /// `ctx.cancellation` at suspension points and bail with an error.
    async fn process(&self, task: &Task, ctx: &ProcessContext) -> Result<TaskResult>;

    /// Readiness check, called once before the scheduler starts dispatching.
    async fn is_ready(&self) -> bool {
        true
    }

    /// Teardown hook, called once after the scheduler drains.
    async fn destroy(&self) {}
}

// ---------------------------------------------------------------------------
// Hook-command processor
// ---------------------------------------------------------------------------

/// Processor that shells out to a configured executable.
///
/// For each task it creates a scratch directory, writes the full task as
/// `task.json`, runs the hook with the scratch dir as CWD, and reads
/// `result.json` back as the task result. Cancellation kills the child.
pub struct HookProcessor {
    command: PathBuf,
    base_dir: PathBuf,
}

impl HookProcessor {
    pub fn new(command: impl Into<PathBuf>, base_dir: impl Into<PathBuf>) -> Self {
        Self {
            command: command.into(),
            base_dir: base_dir.into(),
        }
    }

    async fn run_hook(&self, dir: &Path, task: &Task, ctx: &ProcessContext) -> Result<()> {
        // Resolve relative command paths against the process CWD, not the
        // scratch dir. Command::new + current_dir resolves relative paths
        // after chdir, which would look in the scratch dir instead.
        let abs_command = if self.command.is_relative() {
            std::env::current_dir()?.join(&self.command)
        } else {
            self.command.clone()
        };

        debug!(
            task_id = %task.id,
            command = %abs_command.display(),
            "running processing hook"
        );

        let mut child = Command::new(&abs_command)
            .current_dir(dir)
            .env("COURIER_TASK_DIR", dir)
            .env("COURIER_TASK_ID", task.id.0.to_string())
            .env("COURIER_TIMEOUT_MS", ctx.timeout.as_millis().to_string())
            .kill_on_drop(true)
            .spawn()?;

        let status = tokio::select! {
            status = child.wait() => status?,
            _ = ctx.cancellation.cancelled() => {
                warn!(task_id = %task.id, "cancellation requested, killing hook");
                let _ = child.kill().await;
                return Err(Error::Processing("cancelled".to_string()));
            }
        };

        if status.success() {
            Ok(())
        } else {
            Err(Error::Processing(format!(
                "hook exited with status {}",
                status.code().unwrap_or(-1)
            )))
        }
    }
}

#[async_trait]
impl TaskProcessor for HookProcessor {
    async fn process(&self, task: &Task, ctx: &ProcessContext) -> Result<TaskResult> {
        let start = Instant::now();
        let dir = self.base_dir.join(format!("task-{}", Uuid::new_v4()));
        tokio::fs::create_dir_all(&dir).await?;

        let task_json = serde_json::to_string_pretty(task)?;
        tokio::fs::write(dir.join("task.json"), task_json).await?;

        let run = self.run_hook(&dir, task, ctx).await;

        let outcome = match run {
            Ok(()) => {
                let content = tokio::fs::read_to_string(dir.join("result.json"))
                    .await
                    .map_err(|e| Error::Processing(format!("missing result.json: {e}")))?;
                let data = serde_json::from_str(&content)
                    .map_err(|e| Error::Processing(format!("bad result.json: {e}")))?;
                Ok(TaskResult {
                    data,
                    duration_ms: Some(start.elapsed().as_millis() as u64),
                })
            }
            Err(e) => Err(e),
        };

        if let Err(e) = tokio::fs::remove_dir_all(&dir).await {
            warn!(task_id = %task.id, "scratch dir cleanup failed: {e}");
        }

        outcome
    }

    async fn is_ready(&self) -> bool {
        let command = if self.command.is_relative() {
            std::env::current_dir()
                .map(|cwd| cwd.join(&self.command))
                .unwrap_or_else(|_| self.command.clone())
        } else {
            self.command.clone()
        };
        command.exists()
    }
}
