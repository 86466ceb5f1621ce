//! Scheduler: polls the task store, dispatches work to the processor.
//!
//! One scheduling authority per queue drives a timer-based poll loop. Each
//! tick claims at most one pending task, subject to the concurrency ceiling,
//! and spawns its dispatch as an independent unit — the loop never blocks on
//! a task. Per-task timeouts are cooperative: the deadline cancels the
//! task's token but the dispatch still awaits whatever the processor
//! eventually returns, so an ill-behaved processor occupies its slot until
//! it settles. Shutdown drains in-flight work within a bound, then cancels
//! whatever is left.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::model::{Task, TaskId, TaskResult, TaskStatus};
use crate::processor::{ProcessContext, TaskProcessor};
use crate::reporter::Reporter;
use crate::store::TaskStore;

/// How often `stop()` re-checks the in-flight set while draining.
const DRAIN_POLL: Duration = Duration::from_millis(50);

/// Configuration for the scheduler.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Tick period for the poll loop.
    pub poll_interval: Duration,
    /// Concurrency ceiling for in-flight dispatches.
    pub max_concurrent: usize,
    /// Cooperative per-task deadline. When it expires the task's token is
    /// cancelled; the dispatch still awaits the processor.
    pub task_timeout: Duration,
    /// How long `stop()` waits for in-flight work before cancelling it.
    pub graceful_shutdown_timeout: Duration,
    /// When false, `start()` is a no-op.
    pub enabled: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            max_concurrent: 2,
            task_timeout: Duration::from_secs(300),
            graceful_shutdown_timeout: Duration::from_secs(30),
            enabled: true,
        }
    }
}

/// Point-in-time view of the scheduler, for health/status reporting.
#[derive(Debug, Clone)]
pub struct SchedulerStatus {
    pub running: bool,
    pub draining: bool,
    pub in_flight: usize,
    pub in_flight_ids: Vec<TaskId>,
    pub config: SchedulerConfig,
}

/// Shared mutable scheduler state. The in-flight map is the single place
/// where task id → cancellation token is tracked; its length is the
/// in-flight count.
struct Shared {
    running: AtomicBool,
    draining: AtomicBool,
    in_flight: Mutex<HashMap<TaskId, CancellationToken>>,
    shutdown: Notify,
}

impl Shared {
    fn in_flight_count(&self) -> usize {
        self.in_flight.lock().expect("in_flight lock poisoned").len()
    }
}

/// The scheduler. Owns the poll loop; dispatched tasks run as spawned
/// concurrent units bounded by `max_concurrent`.
pub struct Scheduler {
    store: TaskStore,
    processor: Arc<dyn TaskProcessor>,
    reporter: Arc<dyn Reporter>,
    config: SchedulerConfig,
    shared: Arc<Shared>,
    poll_handle: Mutex<Option<JoinHandle<()>>>,
}

impl Scheduler {
    pub fn new(
        store: TaskStore,
        processor: Arc<dyn TaskProcessor>,
        reporter: Arc<dyn Reporter>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            store,
            processor,
            reporter,
            config,
            shared: Arc::new(Shared {
                running: AtomicBool::new(false),
                draining: AtomicBool::new(false),
                in_flight: Mutex::new(HashMap::new()),
                shutdown: Notify::new(),
            }),
            poll_handle: Mutex::new(None),
        }
    }

    /// Start the poll loop. No-op when disabled or already running.
    /// Fails when the processor reports not-ready.
    pub async fn start(&self) -> Result<()> {
        if !self.config.enabled {
            info!("scheduler disabled, not starting");
            return Ok(());
        }
        if self.shared.running.swap(true, Ordering::SeqCst) {
            debug!("scheduler already running");
            return Ok(());
        }

        if !self.processor.is_ready().await {
            self.shared.running.store(false, Ordering::SeqCst);
            return Err(Error::Processing("processor is not ready".to_string()));
        }

        self.shared.draining.store(false, Ordering::SeqCst);

        let store = self.store.clone();
        let processor = Arc::clone(&self.processor);
        let reporter = Arc::clone(&self.reporter);
        let shared = Arc::clone(&self.shared);
        let config = self.config.clone();

        let handle = tokio::spawn(async move {
            info!(
                poll_interval_ms = config.poll_interval.as_millis() as u64,
                max_concurrent = config.max_concurrent,
                "scheduler started"
            );

            // Immediate first tick, then one per interval.
            loop {
                tick(&store, &processor, &reporter, &shared, &config).await;

                tokio::select! {
                    _ = shared.shutdown.notified() => {
                        debug!("poll loop stopping");
                        break;
                    }
                    _ = tokio::time::sleep(config.poll_interval) => {}
                }
            }
        });

        *self.poll_handle.lock().expect("poll_handle lock poisoned") = Some(handle);
        Ok(())
    }

    /// Graceful shutdown: stop ticking, wait for in-flight work up to
    /// `graceful_shutdown_timeout`, then cancel whatever remains. Returns
    /// regardless of whether cancelled tasks actually finish.
    pub async fn stop(&self) {
        if !self.shared.running.load(Ordering::SeqCst) {
            return;
        }

        info!("scheduler draining");
        self.shared.draining.store(true, Ordering::SeqCst);
        self.shared.shutdown.notify_one();

        let handle = self
            .poll_handle
            .lock()
            .expect("poll_handle lock poisoned")
            .take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }

        let deadline = tokio::time::Instant::now() + self.config.graceful_shutdown_timeout;
        while self.shared.in_flight_count() > 0 {
            if tokio::time::Instant::now() >= deadline {
                let stragglers: Vec<TaskId> = {
                    let in_flight = self
                        .shared
                        .in_flight
                        .lock()
                        .expect("in_flight lock poisoned");
                    for token in in_flight.values() {
                        token.cancel();
                    }
                    in_flight.keys().copied().collect()
                };
                warn!(
                    count = stragglers.len(),
                    ?stragglers,
                    "shutdown timeout elapsed, cancelled remaining tasks"
                );
                break;
            }
            tokio::time::sleep(DRAIN_POLL).await;
        }

        self.processor.destroy().await;
        self.shared.running.store(false, Ordering::SeqCst);
        self.shared.draining.store(false, Ordering::SeqCst);
        info!("scheduler stopped");
    }

    /// Snapshot of running/draining flags, in-flight work, and config.
    pub fn status(&self) -> SchedulerStatus {
        let in_flight_ids: Vec<TaskId> = self
            .shared
            .in_flight
            .lock()
            .expect("in_flight lock poisoned")
            .keys()
            .copied()
            .collect();
        SchedulerStatus {
            running: self.shared.running.load(Ordering::SeqCst),
            draining: self.shared.draining.load(Ordering::SeqCst),
            in_flight: in_flight_ids.len(),
            in_flight_ids,
            config: self.config.clone(),
        }
    }
}

/// One poll tick: claim at most one pending task and spawn its dispatch.
async fn tick(
    store: &TaskStore,
    processor: &Arc<dyn TaskProcessor>,
    reporter: &Arc<dyn Reporter>,
    shared: &Arc<Shared>,
    config: &SchedulerConfig,
) {
    if shared.draining.load(Ordering::SeqCst) {
        return;
    }
    if shared.in_flight_count() >= config.max_concurrent {
        debug!(max_concurrent = config.max_concurrent, "at capacity, skipping tick");
        return;
    }

    // Transient store contention is expected; log and let the next tick retry.
    let task = match pick_task(store).await {
        Ok(Some(task)) => task,
        Ok(None) => return,
        Err(e) => {
            warn!("pick_task failed, will retry next tick: {e}");
            return;
        }
    };

    let token = CancellationToken::new();
    shared
        .in_flight
        .lock()
        .expect("in_flight lock poisoned")
        .insert(task.id, token.clone());
    let guard = SlotGuard {
        shared: Arc::clone(shared),
        id: task.id,
    };

    let store = store.clone();
    let processor = Arc::clone(processor);
    let reporter = Arc::clone(reporter);
    let task_timeout = config.task_timeout;

    tokio::spawn(async move {
        dispatch(task, token, task_timeout, store, processor, &*reporter, guard).await;
    });
}

/// Frees a task's concurrency slot on drop. Dropping covers every exit from
/// the dispatch — settlement, cancellation of the dispatch task, and panic
/// unwind — so a misbehaving processor can never leak its slot and starve
/// the other in-flight tasks.
struct SlotGuard {
    shared: Arc<Shared>,
    id: TaskId,
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        self.shared
            .in_flight
            .lock()
            .expect("in_flight lock poisoned")
            .remove(&self.id);
    }
}

/// Run one task to settlement and record the outcome. Every error path ends
/// in a `fail_task`/log call — nothing escapes to kill the poll loop or
/// touch other in-flight tasks.
async fn dispatch(
    task: Task,
    token: CancellationToken,
    task_timeout: Duration,
    store: TaskStore,
    processor: Arc<dyn TaskProcessor>,
    reporter: &dyn Reporter,
    guard: SlotGuard,
) {
    let id = task.id;
    debug!(task_id = %id, "dispatching task");

    // The guard lives until the store write below has settled, so the slot
    // is freed exactly once on every path out of this function.
    let _guard = guard;

    // Deadline timer: requests cancellation, nothing more. The processor
    // call below is still awaited to settlement either way.
    let deadline_token = token.clone();
    let timer = tokio::spawn(async move {
        tokio::time::sleep(task_timeout).await;
        warn!(task_id = %id, timeout_ms = task_timeout.as_millis() as u64, "task timeout, requesting cancellation");
        deadline_token.cancel();
    });

    let ctx = ProcessContext {
        cancellation: token,
        timeout: task_timeout,
    };

    // Run the processor in its own task so a panic aborts only that task
    // and surfaces here as a join error, flowing into `fail_task` like any
    // other processing failure.
    let proc_handle = {
        let task = task.clone();
        let ctx = ctx.clone();
        tokio::spawn(async move { processor.process(&task, &ctx).await })
    };
    let outcome = match proc_handle.await {
        Ok(result) => result,
        Err(join_err) if join_err.is_panic() => {
            error!(task_id = %id, "processor panicked");
            Err(Error::Processing("processor panicked".to_string()))
        }
        Err(join_err) => Err(Error::Processing(format!(
            "processor task aborted: {join_err}"
        ))),
    };
    timer.abort();

    match outcome {
        Ok(result) => {
            match complete_task(&store, id, result).await {
                Ok(Some(updated)) => report(reporter, &updated).await,
                Ok(None) => warn!(task_id = %id, "completed task vanished from store"),
                Err(e) => error!(task_id = %id, "complete_task failed: {e}"),
            }
        }
        Err(e) => {
            // Store the capability's own message, not the taxonomy wrapper.
            let message = match e {
                Error::Processing(msg) => msg,
                other => other.to_string(),
            };
            match fail_task(&store, id, message.clone()).await {
                Ok(Some(updated)) if updated.status == TaskStatus::Failed => {
                    report(reporter, &updated).await;
                }
                Ok(Some(_)) => {} // re-queued; no report until terminal
                Ok(None) => warn!(task_id = %id, "failed task vanished from store"),
                Err(store_err) => {
                    error!(task_id = %id, %message, "fail_task failed: {store_err}");
                }
            }
        }
    }
}

/// Best-effort handoff of a terminal task to the reporting collaborator.
async fn report(reporter: &dyn Reporter, task: &Task) {
    if let Err(e) = reporter.deliver(task).await {
        warn!(task_id = %task.id, "report delivery failed: {e}");
    }
}

// ---------------------------------------------------------------------------
// Blocking-store bridges
// ---------------------------------------------------------------------------
// Store operations do synchronous file I/O and may sleep in the lock backoff,
// so they run on the blocking pool rather than a reactor thread.

async fn pick_task(store: &TaskStore) -> Result<Option<Task>> {
    let store = store.clone();
    tokio::task::spawn_blocking(move || store.pick_task())
        .await
        .map_err(|e| Error::Other(format!("pick_task join error: {e}")))?
}

async fn complete_task(store: &TaskStore, id: TaskId, result: TaskResult) -> Result<Option<Task>> {
    let store = store.clone();
    tokio::task::spawn_blocking(move || store.complete_task(id, result))
        .await
        .map_err(|e| Error::Other(format!("complete_task join error: {e}")))?
}

async fn fail_task(store: &TaskStore, id: TaskId, message: String) -> Result<Option<Task>> {
    let store = store.clone();
    tokio::task::spawn_blocking(move || store.fail_task(id, &message))
        .await
        .map_err(|e| Error::Other(format!("fail_task join error: {e}")))?
}
