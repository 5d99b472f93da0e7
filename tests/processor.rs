#![allow(missing_docs)]
#![allow(clippy::expect_used)]
#![allow(clippy::panic)]
#![allow(clippy::unwrap_used)]
#![allow(clippy::indexing_slicing)]

use async_trait::async_trait;
use claims::{assert_err, assert_matches, assert_ok, assert_some};
use job_queue::{
    BackgroundJob, CancellationToken, EventChannel, EventKind, ExecuteError, Executor, JobData,
    JobEvent, JobExecutor, JobRegistry, JobStorage, JobStorageExt, JobTask, MemoryStorage, NewJob,
    Processor, Runner, StorageError,
};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::timeout;

#[derive(Debug, Default)]
struct TestContext {
    seen: Mutex<Vec<i32>>,
    built: AtomicUsize,
    dropped: AtomicUsize,
}

impl TestContext {
    fn seen(&self) -> Vec<i32> {
        self.seen.lock().unwrap().clone()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Value {
    value: i32,
}

impl JobData for Value {
    const DATA_TYPE: &'static str = "value";
}

/// Records every value it sees. Negative values fail, 13 panics.
struct RecordingJob {
    ctx: Arc<TestContext>,
}

impl BackgroundJob for RecordingJob {
    const JOB_TYPE: &'static str = "recording";
    type Data = Value;
    type Context = Arc<TestContext>;

    fn build(ctx: &Arc<TestContext>) -> Self {
        ctx.built.fetch_add(1, Ordering::SeqCst);
        Self { ctx: ctx.clone() }
    }

    async fn run(&self, data: Value) -> anyhow::Result<()> {
        if data.value == 13 {
            panic!("unlucky number");
        }
        self.ctx.seen.lock().unwrap().push(data.value);
        if data.value < 0 {
            anyhow::bail!("negative value: {}", data.value);
        }
        Ok(())
    }
}

impl Drop for RecordingJob {
    fn drop(&mut self) {
        self.ctx.dropped.fetch_add(1, Ordering::SeqCst);
    }
}

struct UnhandledJob;

impl BackgroundJob for UnhandledJob {
    const JOB_TYPE: &'static str = "unhandled";
    type Data = Value;
    type Context = Arc<TestContext>;

    fn build(_ctx: &Arc<TestContext>) -> Self {
        Self
    }

    async fn run(&self, _data: Value) -> anyhow::Result<()> {
        Ok(())
    }
}

fn registry() -> JobRegistry<Arc<TestContext>> {
    JobRegistry::new().register::<RecordingJob>()
}

fn create_storage() -> Arc<MemoryStorage> {
    Arc::new(MemoryStorage::new(registry().types().clone()))
}

fn create_executor(storage: &Arc<MemoryStorage>, ctx: &Arc<TestContext>) -> JobExecutor<Arc<TestContext>> {
    JobExecutor::new(storage.clone(), Arc::new(registry()), ctx.clone())
}

fn record_events(storage: &MemoryStorage) -> Arc<Mutex<Vec<JobEvent>>> {
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = events.clone();
    storage.events().subscribe(move |event| {
        let sink = sink.clone();
        async move {
            if event.kind() != EventKind::Enqueued {
                sink.lock().unwrap().push(event);
            }
            anyhow::Ok(())
        }
    });
    events
}

fn failure_message(event: &JobEvent) -> String {
    match event {
        JobEvent::Failed { error, .. } => error.to_string(),
        other => panic!("expected a failed event, got {other:?}"),
    }
}

#[tokio::test]
async fn executor_runs_the_handler_and_marks_the_job_succeeded() -> anyhow::Result<()> {
    let storage = create_storage();
    let ctx = Arc::new(TestContext::default());
    let executor = create_executor(&storage, &ctx);
    let events = record_events(&storage);

    storage.enqueue_job::<RecordingJob>(Value { value: 5 }).await?;
    let task = assert_some!(storage.dequeue().await?);
    assert_ok!(executor.execute(task).await);

    assert_eq!(ctx.seen(), vec![5]);
    assert!(storage.list_all().await?.is_empty());

    let events = events.lock().unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].kind(), EventKind::Succeeded);

    Ok(())
}

#[tokio::test]
async fn handler_instances_are_built_and_dropped_once_per_job() -> anyhow::Result<()> {
    let storage = create_storage();
    let ctx = Arc::new(TestContext::default());
    let executor = create_executor(&storage, &ctx);

    for value in [1, -1, 2] {
        storage.enqueue_job::<RecordingJob>(Value { value }).await?;
        let task = assert_some!(storage.dequeue().await?);
        assert_ok!(executor.execute(task).await);
    }

    assert_eq!(ctx.built.load(Ordering::SeqCst), 3);
    assert_eq!(ctx.dropped.load(Ordering::SeqCst), 3);

    Ok(())
}

#[tokio::test]
async fn handler_errors_are_recorded_as_failures() -> anyhow::Result<()> {
    let storage = create_storage();
    let ctx = Arc::new(TestContext::default());
    let executor = create_executor(&storage, &ctx);
    let events = record_events(&storage);

    storage.enqueue_job::<RecordingJob>(Value { value: -4 }).await?;
    let task = assert_some!(storage.dequeue().await?);
    assert_ok!(executor.execute(task).await);

    assert!(storage.list_all().await?.is_empty());
    let events = events.lock().unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(failure_message(&events[0]), "negative value: -4");

    Ok(())
}

#[tokio::test]
async fn handler_panics_are_recorded_as_failures() -> anyhow::Result<()> {
    let storage = create_storage();
    let ctx = Arc::new(TestContext::default());
    let executor = create_executor(&storage, &ctx);
    let events = record_events(&storage);

    storage.enqueue_job::<RecordingJob>(Value { value: 13 }).await?;
    let task = assert_some!(storage.dequeue().await?);
    assert_ok!(executor.execute(task).await);

    assert!(storage.list_all().await?.is_empty());
    let events = events.lock().unwrap();
    assert_eq!(events.len(), 1);
    assert!(failure_message(&events[0]).contains("unlucky number"));

    Ok(())
}

#[tokio::test]
async fn jobs_without_a_handler_are_marked_failed() -> anyhow::Result<()> {
    let types = JobRegistry::<Arc<TestContext>>::new()
        .register::<RecordingJob>()
        .register::<UnhandledJob>();
    let storage = Arc::new(MemoryStorage::new(types.types().clone()));
    let ctx = Arc::new(TestContext::default());
    let executor = create_executor(&storage, &ctx);
    let events = record_events(&storage);

    storage.enqueue_job::<UnhandledJob>(Value { value: 1 }).await?;
    let task = assert_some!(storage.dequeue().await?);
    assert_ok!(executor.execute(task).await);

    assert!(storage.list_all().await?.is_empty());
    assert_eq!(ctx.built.load(Ordering::SeqCst), 0);
    let events = events.lock().unwrap();
    assert_eq!(events.len(), 1);
    assert!(failure_message(&events[0]).contains("No handler registered"));

    Ok(())
}

#[tokio::test]
async fn executing_a_finalized_job_reports_the_unrecorded_outcome() -> anyhow::Result<()> {
    let storage = create_storage();
    let ctx = Arc::new(TestContext::default());
    let executor = create_executor(&storage, &ctx);

    storage.enqueue_job::<RecordingJob>(Value { value: 2 }).await?;
    let task = assert_some!(storage.dequeue().await?);
    assert_ok!(executor.execute(task.clone()).await);

    let error = assert_err!(executor.execute(task).await);
    assert_matches!(
        error,
        ExecuteError::OutcomeNotRecorded { source: StorageError::InvalidJobState { .. }, .. }
    );

    Ok(())
}

#[tokio::test]
async fn subscriber_failures_do_not_fail_execution() -> anyhow::Result<()> {
    async fn broken(_event: JobEvent) -> anyhow::Result<()> {
        anyhow::bail!("subscriber is broken")
    }

    let storage = create_storage();
    let ctx = Arc::new(TestContext::default());
    let executor = create_executor(&storage, &ctx);

    storage.enqueue_job::<RecordingJob>(Value { value: 8 }).await?;
    storage.events().subscribe_to(EventKind::Succeeded, broken);

    let task = assert_some!(storage.dequeue().await?);
    assert_ok!(executor.execute(task).await);
    assert!(storage.list_all().await?.is_empty());

    Ok(())
}

#[tokio::test]
async fn processor_drains_the_queue_in_order() -> anyhow::Result<()> {
    let storage = create_storage();
    let ctx = Arc::new(TestContext::default());
    let executor = Arc::new(create_executor(&storage, &ctx));

    for value in 1..=5 {
        storage.enqueue_job::<RecordingJob>(Value { value }).await?;
    }

    let processor = Processor::new(storage.clone(), executor).shutdown_when_queue_empty(true);
    timeout(Duration::from_secs(5), processor.run(CancellationToken::new())).await?;

    assert_eq!(ctx.seen(), vec![1, 2, 3, 4, 5]);
    assert!(storage.list_all().await?.is_empty());

    Ok(())
}

#[tokio::test]
async fn run_next_job_reports_whether_a_job_ran() -> anyhow::Result<()> {
    let storage = create_storage();
    let ctx = Arc::new(TestContext::default());
    let executor = Arc::new(create_executor(&storage, &ctx));
    let processor = Processor::new(storage.clone(), executor);

    assert_eq!(processor.run_next_job().await?, None);

    let id = storage.enqueue_job::<RecordingJob>(Value { value: 3 }).await?;
    assert_eq!(processor.run_next_job().await?, Some(id));
    assert_eq!(processor.run_next_job().await?, None);

    Ok(())
}

#[tokio::test]
async fn cancellation_interrupts_the_backoff() -> anyhow::Result<()> {
    let storage = create_storage();
    let ctx = Arc::new(TestContext::default());
    let executor = Arc::new(create_executor(&storage, &ctx));

    let processor = Processor::new(storage.clone(), executor).poll_interval(Duration::from_secs(3600));
    let cancel = CancellationToken::new();
    let handle = tokio::spawn({
        let cancel = cancel.clone();
        async move { processor.run(cancel).await }
    });

    tokio::time::sleep(Duration::from_millis(50)).await;
    cancel.cancel();
    timeout(Duration::from_secs(5), handle).await??;

    Ok(())
}

/// Panics on its first call, errors on its second, then succeeds.
#[derive(Default)]
struct FaultyExecutor {
    calls: AtomicUsize,
}

#[async_trait]
impl Executor for FaultyExecutor {
    async fn execute(&self, task: JobTask) -> Result<(), ExecuteError> {
        match self.calls.fetch_add(1, Ordering::SeqCst) {
            0 => panic!("executor exploded"),
            1 => Err(ExecuteError::OutcomeNotRecorded {
                job_id: task.id(),
                source: StorageError::InvalidJobState {
                    id: task.id(),
                    state: job_queue::InvalidJobState::NotFound,
                },
            }),
            _ => Ok(()),
        }
    }
}

#[tokio::test]
async fn executor_faults_do_not_stop_the_processor() -> anyhow::Result<()> {
    let storage = create_storage();
    let executor = Arc::new(FaultyExecutor::default());

    for value in 1..=3 {
        storage.enqueue_job::<RecordingJob>(Value { value }).await?;
    }

    let processor = Processor::new(storage.clone(), executor.clone()).shutdown_when_queue_empty(true);
    timeout(Duration::from_secs(5), processor.run(CancellationToken::new())).await?;

    assert_eq!(executor.calls.load(Ordering::SeqCst), 3);

    Ok(())
}

/// Fails the first `failures` dequeues with a pool timeout, then delegates.
struct FlakyStorage {
    inner: Arc<MemoryStorage>,
    failures: AtomicUsize,
    dequeues: AtomicUsize,
}

impl FlakyStorage {
    fn new(inner: Arc<MemoryStorage>, failures: usize) -> Self {
        Self {
            inner,
            failures: AtomicUsize::new(failures),
            dequeues: AtomicUsize::new(0),
        }
    }

    fn dequeues(&self) -> usize {
        self.dequeues.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl JobStorage for FlakyStorage {
    fn events(&self) -> &EventChannel {
        self.inner.events()
    }

    async fn enqueue(&self, job: NewJob) -> Result<i64, StorageError> {
        self.inner.enqueue(job).await
    }

    async fn dequeue(&self) -> Result<Option<JobTask>, StorageError> {
        self.dequeues.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(StorageError::Database(sqlx::Error::PoolTimedOut));
        }
        self.inner.dequeue().await
    }

    async fn mark_succeeded(&self, id: i64) -> Result<(), StorageError> {
        self.inner.mark_succeeded(id).await
    }

    async fn mark_failed(&self, id: i64, error: anyhow::Error) -> Result<(), StorageError> {
        self.inner.mark_failed(id, error).await
    }

    async fn list_all(&self) -> Result<Vec<JobTask>, StorageError> {
        self.inner.list_all().await
    }

    async fn list_by_job_type(&self, job_type: &str) -> Result<Vec<JobTask>, StorageError> {
        self.inner.list_by_job_type(job_type).await
    }

    async fn requeue_orphaned(&self) -> Result<u64, StorageError> {
        self.inner.requeue_orphaned().await
    }

    async fn repair_corrupt(&self) -> Result<u64, StorageError> {
        self.inner.repair_corrupt().await
    }
}

#[tokio::test]
async fn storage_faults_are_retried_after_the_poll_interval() -> anyhow::Result<()> {
    let inner = create_storage();
    let storage = Arc::new(FlakyStorage::new(inner.clone(), 2));
    let ctx = Arc::new(TestContext::default());
    let executor = Arc::new(JobExecutor::new(storage.clone(), Arc::new(registry()), ctx.clone()));

    storage.enqueue_job::<RecordingJob>(Value { value: 7 }).await?;

    let poll_interval = Duration::from_millis(50);
    let processor = Processor::new(storage.clone(), executor)
        .poll_interval(poll_interval)
        .shutdown_when_queue_empty(true);

    let start = tokio::time::Instant::now();
    timeout(Duration::from_secs(5), processor.run(CancellationToken::new())).await?;

    // two faults, one job, one empty poll
    assert_eq!(storage.dequeues(), 4);
    assert!(start.elapsed() >= poll_interval * 2);
    assert_eq!(ctx.seen(), vec![7]);
    assert!(inner.list_all().await?.is_empty());

    Ok(())
}

#[tokio::test]
async fn cancellation_interrupts_the_fault_backoff() -> anyhow::Result<()> {
    let storage = Arc::new(FlakyStorage::new(create_storage(), usize::MAX));
    let ctx = Arc::new(TestContext::default());
    let executor = Arc::new(JobExecutor::new(storage.clone(), Arc::new(registry()), ctx));

    let processor = Processor::new(storage.clone(), executor)
        .poll_interval(Duration::from_secs(3600))
        .shutdown_when_queue_empty(true);
    let cancel = CancellationToken::new();
    let handle = tokio::spawn({
        let cancel = cancel.clone();
        async move { processor.run(cancel).await }
    });

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(storage.dequeues(), 1);

    cancel.cancel();
    timeout(Duration::from_secs(5), handle).await??;
    assert_eq!(storage.dequeues(), 1);

    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn runner_recovers_orphaned_jobs_before_processing() -> anyhow::Result<()> {
    let storage = create_storage();
    let ctx = Arc::new(TestContext::default());

    for value in 1..=3 {
        storage.enqueue_job::<RecordingJob>(Value { value }).await?;
    }
    // Simulates a process that crashed while holding a claim.
    assert_some!(storage.dequeue().await?);

    let runner = Runner::new(storage.clone(), registry(), ctx.clone())
        .num_processors(2)
        .poll_interval(Duration::from_millis(10))
        .shutdown_when_queue_empty();

    let handle = runner.start().await?;
    timeout(Duration::from_secs(5), handle.wait_for_shutdown()).await?;

    let mut seen = ctx.seen();
    seen.sort_unstable();
    assert_eq!(seen, vec![1, 2, 3]);
    assert!(storage.list_all().await?.is_empty());

    Ok(())
}

#[tokio::test]
async fn runner_shutdown_stops_idle_processors() -> anyhow::Result<()> {
    let storage = create_storage();
    let ctx = Arc::new(TestContext::default());

    let runner = Runner::new(storage, registry(), ctx)
        .num_processors(3)
        .poll_interval(Duration::from_secs(3600));

    let handle = runner.start().await?;
    tokio::time::sleep(Duration::from_millis(50)).await;
    handle.shutdown();
    timeout(Duration::from_secs(5), handle.wait_for_shutdown()).await?;

    Ok(())
}
