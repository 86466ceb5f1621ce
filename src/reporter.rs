//! Reporting collaborator contract.
//!
//! Once a task reaches a terminal status the scheduler hands it to a
//! reporter. Delivery is best-effort: a reporter failure is logged by the
//! scheduler and never affects task state or the retry count.

use async_trait::async_trait;
use tracing::{info, warn};

use crate::error::Result;
use crate::model::{Task, TaskStatus};

/// Consumer of terminal tasks. Rendering and delivery live outside this
/// core; the queue only owns the handoff.
#[async_trait]
pub trait Reporter: Send + Sync {
    async fn deliver(&self, task: &Task) -> Result<()>;
}

/// Default reporter: records terminal outcomes in the process log.
pub struct LogReporter;

#[async_trait]
impl Reporter for LogReporter {
    async fn deliver(&self, task: &Task) -> Result<()> {
        match task.status {
            TaskStatus::Completed => info!(
                id = %task.id,
                reporter = %task.reporter_email,
                "task completed; report ready"
            ),
            TaskStatus::Failed => warn!(
                id = %task.id,
                reporter = %task.reporter_email,
                error = task.error.as_deref().unwrap_or("unknown"),
                "task failed; failure report ready"
            ),
            _ => warn!(id = %task.id, status = %task.status, "reporter given non-terminal task"),
        }
        Ok(())
    }
}
