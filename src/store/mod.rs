//! Persistent task queue.
//!
//! Single source of truth for all task state, durable in one JSON document.
//! Every operation — reads included — is one transaction: take the
//! cross-process lock, read the full document, apply the change in memory,
//! rewrite the document through a temp file + rename, release the lock.
//! No other synchronization touches the store file.

mod lock;

pub use lock::{LockConfig, StoreLock};

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::model::{
    LogLevel, NewTask, StoreFile, StoreStats, Task, TaskId, TaskResult, TaskStatus,
};

/// The persistent task queue. Owns the store file path; safe to clone and
/// share — all coordination happens through the file lock, so independent
/// handles (and independent processes) serialize correctly.
#[derive(Debug, Clone)]
pub struct TaskStore {
    path: PathBuf,
    default_max_retries: u32,
    lock_config: LockConfig,
}

impl TaskStore {
    /// Create a handle to the store at `path`. Call [`initialize`](Self::initialize)
    /// before first use.
    pub fn new(path: impl Into<PathBuf>, default_max_retries: u32) -> Self {
        Self {
            path: path.into(),
            default_max_retries,
            lock_config: LockConfig::default(),
        }
    }

    /// Override lock staleness/backoff parameters.
    pub fn with_lock_config(mut self, lock_config: LockConfig) -> Self {
        self.lock_config = lock_config;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Ensure the store file exists with an empty task list.
    ///
    /// Idempotent: an existing store is left untouched.
    pub fn initialize(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let _lock = StoreLock::acquire(&self.path, &self.lock_config)?;
        if !self.path.exists() {
            write_store(&self.path, &StoreFile::empty())?;
            info!(path = %self.path.display(), "task store initialized");
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Mutations
    // -----------------------------------------------------------------------

    /// Append a new pending task.
    pub fn add_task(&self, new: NewTask) -> Result<Task> {
        let max_retries = new.max_retries.unwrap_or(self.default_max_retries);
        let now = Utc::now();

        let mut task = Task {
            id: TaskId::new(),
            status: TaskStatus::Pending,
            prompt: new.prompt,
            reporter_email: new.reporter_email,
            result: None,
            error: None,
            retries: 0,
            max_retries,
            created_at: now,
            started_at: None,
            completed_at: None,
            updated_at: now,
            logs: Vec::new(),
        };
        task.push_log(LogLevel::Info, "Task created");

        let stored = task.clone();
        self.with_store(|store| {
            store.tasks.push(task);
        })?;

        info!(id = %stored.id, reporter = %stored.reporter_email, "task added");
        Ok(stored)
    }

    /// Atomically claim the first pending task, transitioning it to
    /// processing. Returns `None` when nothing is pending.
    pub fn pick_task(&self) -> Result<Option<Task>> {
        let picked = self.with_store(|store| {
            let task = store
                .tasks
                .iter_mut()
                .find(|t| t.status == TaskStatus::Pending)?;

            let now = Utc::now();
            task.status = TaskStatus::Processing;
            task.started_at = Some(now);
            task.updated_at = now;
            task.push_log(LogLevel::Info, "Task picked for processing");
            Some(task.clone())
        })?;

        if let Some(ref task) = picked {
            debug!(id = %task.id, retries = task.retries, "task picked");
        }
        Ok(picked)
    }

    /// Mark a task completed and store its result.
    ///
    /// Unknown ids and tasks not currently processing are a logged no-op,
    /// not an error.
    pub fn complete_task(&self, id: TaskId, result: TaskResult) -> Result<Option<Task>> {
        let updated = self.with_store(|store| {
            let Some(task) = find_mut(store, id) else {
                warn!(id = %id, "complete_task: unknown task id, ignoring");
                return None;
            };
            if !task.status.can_transition_to(TaskStatus::Completed) {
                warn!(id = %id, status = %task.status, "complete_task: illegal transition, ignoring");
                return None;
            }
            let now = Utc::now();
            task.status = TaskStatus::Completed;
            task.result = Some(result);
            task.completed_at = Some(now);
            task.updated_at = now;
            task.push_log(LogLevel::Info, "Task completed");
            Some(task.clone())
        })?;

        if let Some(ref task) = updated {
            info!(id = %task.id, "task completed");
        }
        Ok(updated)
    }

    /// Record a failed attempt. Re-queues the task while retry budget
    /// remains; otherwise marks it failed with the error retained.
    ///
    /// Returns the updated task, or `None` for an unknown id or a task not
    /// currently processing (logged no-op).
    pub fn fail_task(&self, id: TaskId, error: &str) -> Result<Option<Task>> {
        let updated = self.with_store(|store| {
            let Some(task) = find_mut(store, id) else {
                warn!(id = %id, "fail_task: unknown task id, ignoring");
                return None;
            };
            // Both outcomes of a failed attempt start from processing.
            if !task.status.can_transition_to(TaskStatus::Failed) {
                warn!(id = %id, status = %task.status, "fail_task: illegal transition, ignoring");
                return None;
            }
            let now = Utc::now();
            task.retries += 1;
            task.updated_at = now;

            if task.retries < task.max_retries {
                task.status = TaskStatus::Pending;
                task.started_at = None;
                task.push_log(
                    LogLevel::Warn,
                    format!(
                        "Attempt {} failed, will retry: {error}",
                        task.retries
                    ),
                );
            } else {
                task.status = TaskStatus::Failed;
                task.error = Some(error.to_string());
                task.completed_at = Some(now);
                task.push_log(
                    LogLevel::Error,
                    format!("Task failed after {} attempts: {error}", task.retries),
                );
            }
            Some(task.clone())
        })?;

        match updated {
            Some(ref task) if task.status == TaskStatus::Failed => {
                warn!(id = %task.id, retries = task.retries, %error, "task failed permanently");
            }
            Some(ref task) => {
                info!(id = %task.id, retries = task.retries, %error, "task re-queued for retry");
            }
            None => {}
        }
        Ok(updated)
    }

    /// Append a log entry to a task, stamped with the current time.
    ///
    /// Unknown ids are a logged no-op.
    pub fn add_task_log(
        &self,
        id: TaskId,
        level: LogLevel,
        message: impl Into<String>,
    ) -> Result<()> {
        let message = message.into();
        let found = self.with_store(|store| {
            let task = find_mut(store, id)?;
            task.push_log(level, message);
            task.updated_at = Utc::now();
            Some(())
        })?;

        if found.is_none() {
            warn!(id = %id, "add_task_log: unknown task id, ignoring");
        }
        Ok(())
    }

    /// Remove terminal tasks whose `completed_at` is older than `max_age`.
    /// Non-terminal tasks are never removed, regardless of age.
    /// Returns the number removed.
    pub fn cleanup(&self, max_age: Duration) -> Result<usize> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(max_age)
                .map_err(|e| Error::Other(format!("cleanup max_age out of range: {e}")))?;

        let removed = self.with_store(|store| {
            let before = store.tasks.len();
            store.tasks.retain(|t| {
                if !t.is_terminal() {
                    return true;
                }
                match t.completed_at {
                    Some(done) => done >= cutoff,
                    // Terminal without a completion stamp shouldn't happen;
                    // keep it rather than guess.
                    None => true,
                }
            });
            before - store.tasks.len()
        })?;

        if removed > 0 {
            info!(removed, "cleanup removed old terminal tasks");
        }
        Ok(removed)
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    /// Snapshot read of a single task.
    pub fn get_task(&self, id: TaskId) -> Result<Option<Task>> {
        let store = self.read_store()?;
        Ok(store.tasks.into_iter().find(|t| t.id == id))
    }

    /// Snapshot of every task, in stored (insertion) order.
    pub fn get_all_tasks(&self) -> Result<Vec<Task>> {
        Ok(self.read_store()?.tasks)
    }

    /// Snapshot of tasks with the given status, in stored order.
    pub fn get_tasks_by_status(&self, status: TaskStatus) -> Result<Vec<Task>> {
        let store = self.read_store()?;
        Ok(store
            .tasks
            .into_iter()
            .filter(|t| t.status == status)
            .collect())
    }

    /// Counts per status.
    pub fn get_stats(&self) -> Result<StoreStats> {
        let store = self.read_store()?;
        let mut stats = StoreStats::default();
        for task in &store.tasks {
            match task.status {
                TaskStatus::Pending => stats.pending += 1,
                TaskStatus::Processing => stats.processing += 1,
                TaskStatus::Completed => stats.completed += 1,
                TaskStatus::Failed => stats.failed += 1,
            }
        }
        Ok(stats)
    }

    // -----------------------------------------------------------------------
    // Transaction plumbing
    // -----------------------------------------------------------------------

    /// Run one atomic read-modify-write transaction: lock, load, mutate,
    /// rewrite in full, unlock.
    fn with_store<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut StoreFile) -> T,
    {
        let _lock = StoreLock::acquire(&self.path, &self.lock_config)?;
        let mut store = load_store(&self.path)?;
        let out = f(&mut store);
        store.last_updated = Utc::now();
        write_store(&self.path, &store)?;
        Ok(out)
    }

    /// Lock, load, unlock — no rewrite. Reads still serialize against
    /// writers so they never observe a partial document.
    fn read_store(&self) -> Result<StoreFile> {
        let _lock = StoreLock::acquire(&self.path, &self.lock_config)?;
        load_store(&self.path)
    }
}

fn find_mut(store: &mut StoreFile, id: TaskId) -> Option<&mut Task> {
    store.tasks.iter_mut().find(|t| t.id == id)
}

fn load_store(path: &Path) -> Result<StoreFile> {
    match std::fs::read(path) {
        Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(StoreFile::empty()),
        Err(e) => Err(Error::Storage(e)),
    }
}

/// Rewrite the store atomically: serialize to a sibling temp file, then
/// rename over the target so a concurrent reader never sees a torn write.
fn write_store(path: &Path, store: &StoreFile) -> Result<()> {
    let tmp = path.with_extension(format!("tmp.{}", std::process::id()));
    let bytes = serde_json::to_vec_pretty(store)?;
    std::fs::write(&tmp, bytes)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    fn test_store(dir: &Path) -> TaskStore {
        let store = TaskStore::new(dir.join("queue.json"), 3);
        store.initialize().unwrap();
        store
    }

    #[test]
    fn initialize_is_idempotent() {
        let dir = tempdir().unwrap();
        let store = test_store(dir.path());

        let task = store
            .add_task(NewTask::new(json!({"subject": "A"}), "r@x.com"))
            .unwrap();

        store.initialize().unwrap();
        assert!(store.get_task(task.id).unwrap().is_some());
    }

    #[test]
    fn pick_skips_processing_tasks() {
        let dir = tempdir().unwrap();
        let store = test_store(dir.path());

        let first = store
            .add_task(NewTask::new(json!({"n": 1}), "r@x.com"))
            .unwrap();
        let second = store
            .add_task(NewTask::new(json!({"n": 2}), "r@x.com"))
            .unwrap();

        let picked = store.pick_task().unwrap().unwrap();
        assert_eq!(picked.id, first.id);
        assert_eq!(picked.status, TaskStatus::Processing);
        assert!(picked.started_at.is_some());

        // First is in flight; the next pick must return the second task.
        let next = store.pick_task().unwrap().unwrap();
        assert_eq!(next.id, second.id);

        assert!(store.pick_task().unwrap().is_none());
    }

    #[test]
    fn startedat_cleared_on_requeue() {
        let dir = tempdir().unwrap();
        let store = test_store(dir.path());

        let task = store
            .add_task(NewTask::new(json!({}), "r@x.com"))
            .unwrap();
        store.pick_task().unwrap().unwrap();

        let requeued = store.fail_task(task.id, "boom").unwrap().unwrap();
        assert_eq!(requeued.status, TaskStatus::Pending);
        assert!(requeued.started_at.is_none());
        assert_eq!(requeued.retries, 1);
    }

    #[test]
    fn logs_are_append_only() {
        let dir = tempdir().unwrap();
        let store = test_store(dir.path());

        let task = store
            .add_task(NewTask::new(json!({}), "r@x.com"))
            .unwrap();
        assert_eq!(task.logs.len(), 1); // "Task created"

        store
            .add_task_log(task.id, LogLevel::Debug, "first")
            .unwrap();
        store
            .add_task_log(task.id, LogLevel::Debug, "second")
            .unwrap();

        let task = store.get_task(task.id).unwrap().unwrap();
        assert_eq!(task.logs.len(), 3);
        assert_eq!(task.logs[1].message, "first");
        assert_eq!(task.logs[2].message, "second");
    }
}
