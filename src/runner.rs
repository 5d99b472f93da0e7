use crate::errors::StorageError;
use crate::executor::{Executor, JobExecutor};
use crate::job_registry::JobRegistry;
use crate::processor::{DEFAULT_POLL_INTERVAL, Processor};
use crate::storage::JobStorage;
use futures_util::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, info, info_span, warn};

/// Wires storage, registry and processors together and starts them.
pub struct Runner<Context: Clone + Send + Sync + 'static> {
    storage: Arc<dyn JobStorage>,
    registry: Arc<JobRegistry<Context>>,
    context: Context,
    num_processors: usize,
    poll_interval: Duration,
    jitter: Duration,
    shutdown_when_queue_empty: bool,
}

impl<Context: std::fmt::Debug + Clone + Send + Sync + 'static> std::fmt::Debug for Runner<Context> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runner")
            .field("job_types", &self.registry.job_types())
            .field("context", &self.context)
            .field("num_processors", &self.num_processors)
            .field("poll_interval", &self.poll_interval)
            .field("shutdown_when_queue_empty", &self.shutdown_when_queue_empty)
            .finish_non_exhaustive()
    }
}

impl<Context: Clone + Send + Sync + 'static> Runner<Context> {
    /// Create a new runner with the given storage, registry and context.
    pub fn new(storage: Arc<dyn JobStorage>, registry: JobRegistry<Context>, context: Context) -> Self {
        Self {
            storage,
            registry: Arc::new(registry),
            context,
            num_processors: 1,
            poll_interval: DEFAULT_POLL_INTERVAL,
            jitter: Duration::ZERO,
            shutdown_when_queue_empty: false,
        }
    }

    /// Set the number of processors polling the storage.
    pub fn num_processors(mut self, num_processors: usize) -> Self {
        self.num_processors = num_processors;
        self
    }

    /// Set how long processors back off when the queue is empty or unreachable.
    pub fn poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Set the maximum random jitter to add to poll intervals.
    ///
    /// Jitter helps reduce thundering herd effects when multiple processors
    /// are polling for jobs simultaneously.
    pub fn jitter(mut self, jitter: Duration) -> Self {
        self.jitter = jitter;
        self
    }

    /// Set the runner to shut down when the job queue is empty.
    pub fn shutdown_when_queue_empty(mut self) -> Self {
        self.shutdown_when_queue_empty = true;
        self
    }

    /// The storage this runner consumes from.
    pub fn storage(&self) -> &Arc<dyn JobStorage> {
        &self.storage
    }

    /// Recover from a previous run, then start the processors.
    ///
    /// Jobs left processing by a crashed process are put back in the queue and
    /// records that can no longer be resolved are deleted. Both steps finish
    /// before the first processor polls, which is the only point where
    /// requeueing in-flight jobs is safe.
    ///
    /// The runner is consumed, so recovery runs at most once per runner:
    ///
    /// ```compile_fail
    /// # use job_queue::{JobRegistry, MemoryStorage, Runner};
    /// # use std::sync::Arc;
    /// # async fn restart() -> anyhow::Result<()> {
    /// let registry = JobRegistry::<()>::new();
    /// let storage = Arc::new(MemoryStorage::new(registry.types().clone()));
    /// let runner = Runner::new(storage, registry, ());
    ///
    /// let handle = runner.start().await?;
    /// let again = runner.start().await?;
    /// # Ok(())
    /// # }
    /// ```
    pub async fn start(self) -> Result<RunHandle, StorageError> {
        let requeued = self.storage.requeue_orphaned().await?;
        if requeued > 0 {
            info!(jobs.requeued = requeued, "Requeued jobs orphaned by a previous run");
        }
        let removed = self.storage.repair_corrupt().await?;
        if removed > 0 {
            warn!(jobs.removed = removed, "Removed malformed jobs from storage");
        }

        let executor: Arc<dyn Executor> = Arc::new(JobExecutor::new(
            self.storage.clone(),
            self.registry.clone(),
            self.context.clone(),
        ));

        let cancel = CancellationToken::new();
        let mut handles = Vec::with_capacity(self.num_processors);
        for i in 1..=self.num_processors {
            let name = format!("job-processor-{i}");
            info!(processor.name = %name, "Starting processor…");

            let processor = Processor::new(self.storage.clone(), executor.clone())
                .poll_interval(self.poll_interval)
                .jitter(self.jitter)
                .shutdown_when_queue_empty(self.shutdown_when_queue_empty);

            let span = info_span!("processor", processor.name = %name);
            let cancel = cancel.clone();
            let handle = tokio::spawn(async move { processor.run(cancel).instrument(span).await });

            handles.push(handle);
        }

        Ok(RunHandle { cancel, handles })
    }
}

/// Handle to a running set of processors
#[derive(Debug)]
pub struct RunHandle {
    cancel: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

impl RunHandle {
    /// Ask all processors to stop after their current job.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// A token that stops the processors when cancelled.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Wait for all processors to shut down.
    pub async fn wait_for_shutdown(self) {
        join_all(self.handles).await.into_iter().for_each(|result| {
            if let Err(error) = result {
                warn!(%error, "Processor task panicked");
            }
        });
    }
}
