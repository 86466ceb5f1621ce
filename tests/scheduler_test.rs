//! Integration tests for the scheduler: dispatch, concurrency bound,
//! retries, cooperative timeout, graceful shutdown.

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use courier::error::{Error, Result};
use courier::model::{NewTask, Task, TaskResult, TaskStatus};
use courier::processor::{ProcessContext, TaskProcessor};
use courier::reporter::Reporter;
use courier::scheduler::{Scheduler, SchedulerConfig};
use courier::store::TaskStore;
use serde_json::json;
use tempfile::TempDir;

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

fn test_store(max_retries: u32) -> (TempDir, TaskStore) {
    let dir = tempfile::tempdir().expect("failed to create tempdir");
    let store = TaskStore::new(dir.path().join("queue.json"), max_retries);
    store.initialize().expect("failed to initialize store");
    (dir, store)
}

fn fast_config(max_concurrent: usize) -> SchedulerConfig {
    SchedulerConfig {
        poll_interval: Duration::from_millis(10),
        max_concurrent,
        task_timeout: Duration::from_secs(5),
        graceful_shutdown_timeout: Duration::from_secs(5),
        enabled: true,
    }
}

/// Poll `check` until it passes or the deadline elapses.
async fn wait_until<F: Fn() -> bool>(timeout: Duration, check: F) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

/// Always succeeds with a fixed summary.
struct OkProcessor;

#[async_trait]
impl TaskProcessor for OkProcessor {
    async fn process(&self, _task: &Task, _ctx: &ProcessContext) -> Result<TaskResult> {
        Ok(TaskResult::new(json!({"summary": "ok"})))
    }
}

/// Fails the first `failures` calls with "boom", then succeeds.
struct FlakyProcessor {
    failures: u32,
    calls: AtomicU32,
}

impl FlakyProcessor {
    fn new(failures: u32) -> Self {
        Self {
            failures,
            calls: AtomicU32::new(0),
        }
    }
}

#[async_trait]
impl TaskProcessor for FlakyProcessor {
    async fn process(&self, _task: &Task, _ctx: &ProcessContext) -> Result<TaskResult> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.failures {
            Err(Error::Processing("boom".to_string()))
        } else {
            Ok(TaskResult::new(json!({"summary": "recovered"})))
        }
    }
}

/// Sleeps for `delay` while tracking how many calls run concurrently.
struct CountingProcessor {
    delay: Duration,
    current: AtomicUsize,
    peak: AtomicUsize,
}

impl CountingProcessor {
    fn new(delay: Duration) -> Self {
        Self {
            delay,
            current: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl TaskProcessor for CountingProcessor {
    async fn process(&self, _task: &Task, _ctx: &ProcessContext) -> Result<TaskResult> {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        self.current.fetch_sub(1, Ordering::SeqCst);
        Ok(TaskResult::new(json!({})))
    }
}

/// Panics on the first call, succeeds afterwards.
struct PanickyProcessor {
    calls: AtomicU32,
}

impl PanickyProcessor {
    fn new() -> Self {
        Self {
            calls: AtomicU32::new(0),
        }
    }
}

#[async_trait]
impl TaskProcessor for PanickyProcessor {
    async fn process(&self, _task: &Task, _ctx: &ProcessContext) -> Result<TaskResult> {
        if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
            panic!("processor blew up");
        }
        Ok(TaskResult::new(json!({})))
    }
}

/// Well-behaved with respect to cancellation: waits on the token and bails.
struct HangingProcessor;

#[async_trait]
impl TaskProcessor for HangingProcessor {
    async fn process(&self, _task: &Task, ctx: &ProcessContext) -> Result<TaskResult> {
        ctx.cancellation.cancelled().await;
        Err(Error::Processing("cancelled by deadline".to_string()))
    }
}

/// Collects every terminal task handed to it.
#[derive(Default)]
struct CollectingReporter {
    delivered: Mutex<Vec<Task>>,
}

#[async_trait]
impl Reporter for CollectingReporter {
    async fn deliver(&self, task: &Task) -> Result<()> {
        self.delivered.lock().unwrap().push(task.clone());
        Ok(())
    }
}

/// Always errors — delivery failures must not affect task state.
struct BrokenReporter;

#[async_trait]
impl Reporter for BrokenReporter {
    async fn deliver(&self, _task: &Task) -> Result<()> {
        Err(Error::Other("smtp down".to_string()))
    }
}

// ---------------------------------------------------------------------------
// End-to-end dispatch
// ---------------------------------------------------------------------------

#[tokio::test]
async fn scheduler_completes_a_task_and_reports_it() {
    let (_dir, store) = test_store(3);
    let reporter = Arc::new(CollectingReporter::default());

    let task = store
        .add_task(NewTask::new(json!({"subject": "A"}), "r@x.com"))
        .unwrap();

    let scheduler = Scheduler::new(
        store.clone(),
        Arc::new(OkProcessor),
        reporter.clone(),
        fast_config(2),
    );
    scheduler.start().await.unwrap();

    let store2 = store.clone();
    let id = task.id;
    assert!(
        wait_until(Duration::from_secs(5), || {
            store2.get_task(id).unwrap().unwrap().status == TaskStatus::Completed
        })
        .await
    );
    scheduler.stop().await;

    let done = store.get_task(id).unwrap().unwrap();
    assert_eq!(done.result.unwrap().data, json!({"summary": "ok"}));

    let delivered = reporter.delivered.lock().unwrap();
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0].id, id);
    assert_eq!(delivered[0].status, TaskStatus::Completed);
}

#[tokio::test]
async fn reporter_failure_does_not_affect_task_state() {
    let (_dir, store) = test_store(3);

    let task = store
        .add_task(NewTask::new(json!({}), "r@x.com"))
        .unwrap();

    let scheduler = Scheduler::new(
        store.clone(),
        Arc::new(OkProcessor),
        Arc::new(BrokenReporter),
        fast_config(1),
    );
    scheduler.start().await.unwrap();

    let store2 = store.clone();
    let id = task.id;
    assert!(
        wait_until(Duration::from_secs(5), || {
            store2.get_task(id).unwrap().unwrap().status == TaskStatus::Completed
        })
        .await
    );
    scheduler.stop().await;

    let done = store.get_task(id).unwrap().unwrap();
    assert_eq!(done.status, TaskStatus::Completed);
    assert_eq!(done.retries, 0);
}

// ---------------------------------------------------------------------------
// Retry flows
// ---------------------------------------------------------------------------

#[tokio::test]
async fn exhausted_retries_end_failed_with_last_error() {
    let (_dir, store) = test_store(1);
    let reporter = Arc::new(CollectingReporter::default());

    let task = store
        .add_task(NewTask::new(json!({}), "r@x.com"))
        .unwrap();

    let scheduler = Scheduler::new(
        store.clone(),
        Arc::new(FlakyProcessor::new(u32::MAX)), // never succeeds
        reporter.clone(),
        fast_config(1),
    );
    scheduler.start().await.unwrap();

    let store2 = store.clone();
    let id = task.id;
    assert!(
        wait_until(Duration::from_secs(5), || {
            store2.get_task(id).unwrap().unwrap().status == TaskStatus::Failed
        })
        .await
    );
    scheduler.stop().await;

    let dead = store.get_task(id).unwrap().unwrap();
    assert_eq!(dead.retries, 1);
    // The capability's own message, without any wrapping
    assert_eq!(dead.error.as_deref(), Some("boom"));

    // Terminal failure is reported
    let delivered = reporter.delivered.lock().unwrap();
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0].status, TaskStatus::Failed);
}

#[tokio::test]
async fn fails_twice_then_succeeds_within_budget() {
    let (_dir, store) = test_store(3);
    let reporter = Arc::new(CollectingReporter::default());

    let task = store
        .add_task(NewTask::new(json!({}), "r@x.com"))
        .unwrap();

    let scheduler = Scheduler::new(
        store.clone(),
        Arc::new(FlakyProcessor::new(2)),
        reporter.clone(),
        fast_config(1),
    );
    scheduler.start().await.unwrap();

    let store2 = store.clone();
    let id = task.id;
    assert!(
        wait_until(Duration::from_secs(5), || {
            store2.get_task(id).unwrap().unwrap().status == TaskStatus::Completed
        })
        .await
    );
    scheduler.stop().await;

    let done = store.get_task(id).unwrap().unwrap();
    assert_eq!(done.retries, 2);
    assert_eq!(done.result.unwrap().data, json!({"summary": "recovered"}));

    // Only the terminal outcome is reported — not the two re-queues.
    assert_eq!(reporter.delivered.lock().unwrap().len(), 1);
}

// ---------------------------------------------------------------------------
// Concurrency bound
// ---------------------------------------------------------------------------

#[tokio::test]
async fn in_flight_never_exceeds_max_concurrent() {
    let (_dir, store) = test_store(1);

    for i in 0..5 {
        store
            .add_task(NewTask::new(json!({"n": i}), "r@x.com"))
            .unwrap();
    }

    let processor = Arc::new(CountingProcessor::new(Duration::from_millis(50)));
    let scheduler = Scheduler::new(
        store.clone(),
        processor.clone(),
        Arc::new(CollectingReporter::default()),
        fast_config(2),
    );
    scheduler.start().await.unwrap();

    let store2 = store.clone();
    assert!(
        wait_until(Duration::from_secs(10), || {
            let stats = store2.get_stats().unwrap();
            stats.completed == 5
        })
        .await
    );
    scheduler.stop().await;

    assert!(
        processor.peak.load(Ordering::SeqCst) <= 2,
        "concurrency ceiling breached: peak {}",
        processor.peak.load(Ordering::SeqCst)
    );
}

#[tokio::test]
async fn panicking_processor_frees_its_slot() {
    let (_dir, store) = test_store(2);

    let first = store
        .add_task(NewTask::new(json!({"n": 1}), "r@x.com"))
        .unwrap();
    let second = store
        .add_task(NewTask::new(json!({"n": 2}), "r@x.com"))
        .unwrap();

    // One slot only: a leaked slot would stall the queue outright.
    let scheduler = Scheduler::new(
        store.clone(),
        Arc::new(PanickyProcessor::new()),
        Arc::new(CollectingReporter::default()),
        fast_config(1),
    );
    scheduler.start().await.unwrap();

    let store2 = store.clone();
    assert!(
        wait_until(Duration::from_secs(10), || {
            store2.get_stats().unwrap().completed == 2
        })
        .await,
        "panicking attempt starved the scheduler"
    );
    scheduler.stop().await;

    assert_eq!(scheduler.status().in_flight, 0);

    // The panicked attempt was recorded as a failure, then retried.
    let retried = store.get_task(first.id).unwrap().unwrap();
    assert_eq!(retried.status, TaskStatus::Completed);
    assert_eq!(retried.retries, 1);

    let untouched = store.get_task(second.id).unwrap().unwrap();
    assert_eq!(untouched.status, TaskStatus::Completed);
    assert_eq!(untouched.retries, 0);
}

// ---------------------------------------------------------------------------
// Cooperative timeout
// ---------------------------------------------------------------------------

#[tokio::test]
async fn timeout_cancels_token_and_fails_the_task() {
    let (_dir, store) = test_store(1);

    let task = store
        .add_task(NewTask::new(json!({}), "r@x.com"))
        .unwrap();

    let config = SchedulerConfig {
        task_timeout: Duration::from_millis(50),
        ..fast_config(1)
    };
    let scheduler = Scheduler::new(
        store.clone(),
        Arc::new(HangingProcessor),
        Arc::new(CollectingReporter::default()),
        config,
    );
    scheduler.start().await.unwrap();

    let store2 = store.clone();
    let id = task.id;
    assert!(
        wait_until(Duration::from_secs(5), || {
            store2.get_task(id).unwrap().unwrap().status == TaskStatus::Failed
        })
        .await
    );
    scheduler.stop().await;

    let dead = store.get_task(id).unwrap().unwrap();
    assert!(dead.error.unwrap().contains("cancelled"));
}

// ---------------------------------------------------------------------------
// Shutdown
// ---------------------------------------------------------------------------

#[tokio::test]
async fn stop_drains_in_flight_work() {
    let (_dir, store) = test_store(3);

    let task = store
        .add_task(NewTask::new(json!({}), "r@x.com"))
        .unwrap();

    let processor = Arc::new(CountingProcessor::new(Duration::from_millis(100)));
    let scheduler = Scheduler::new(
        store.clone(),
        processor,
        Arc::new(CollectingReporter::default()),
        fast_config(1),
    );
    scheduler.start().await.unwrap();

    // Wait until the task is actually in flight, then stop.
    let store2 = store.clone();
    let id = task.id;
    assert!(
        wait_until(Duration::from_secs(5), || {
            store2.get_task(id).unwrap().unwrap().status != TaskStatus::Pending
        })
        .await
    );
    scheduler.stop().await;

    // Draining waited for the dispatch to settle.
    let done = store.get_task(id).unwrap().unwrap();
    assert_eq!(done.status, TaskStatus::Completed);

    let status = scheduler.status();
    assert!(!status.running);
    assert!(!status.draining);
    assert_eq!(status.in_flight, 0);
}

#[tokio::test]
async fn disabled_scheduler_does_not_start() {
    let (_dir, store) = test_store(3);

    store
        .add_task(NewTask::new(json!({}), "r@x.com"))
        .unwrap();

    let config = SchedulerConfig {
        enabled: false,
        ..fast_config(1)
    };
    let scheduler = Scheduler::new(
        store.clone(),
        Arc::new(OkProcessor),
        Arc::new(CollectingReporter::default()),
        config,
    );
    scheduler.start().await.unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!scheduler.status().running);
    // Nothing was picked
    assert_eq!(store.get_stats().unwrap().pending, 1);
}

// ---------------------------------------------------------------------------
// Persistence round-trip
// ---------------------------------------------------------------------------

#[tokio::test]
async fn restart_then_drain_reaches_terminal_states() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("queue.json");

    {
        let store = TaskStore::new(&path, 1);
        store.initialize().unwrap();
        for i in 0..3 {
            store
                .add_task(NewTask::new(json!({"n": i}), "r@x.com"))
                .unwrap();
        }
    }

    // Fresh handle over the same file — simulates a process restart.
    let store = TaskStore::new(&path, 1);
    store.initialize().unwrap();

    // Fails the first call, completes the rest.
    let scheduler = Scheduler::new(
        store.clone(),
        Arc::new(FlakyProcessor::new(1)),
        Arc::new(CollectingReporter::default()),
        fast_config(2),
    );
    scheduler.start().await.unwrap();

    let store2 = store.clone();
    assert!(
        wait_until(Duration::from_secs(10), || {
            let stats = store2.get_stats().unwrap();
            stats.completed + stats.failed == 3
        })
        .await
    );
    scheduler.stop().await;

    let stats = store.get_stats().unwrap();
    assert_eq!(stats.completed + stats.failed, 3);
    assert_eq!(stats.pending, 0);
    assert_eq!(stats.processing, 0);
}
