use crate::errors::StorageError;
use crate::executor::Executor;
use crate::storage::JobStorage;
use crate::util::try_to_extract_panic_info;
use futures_util::FutureExt;
use rand::Rng;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace};

/// How long a processor waits after an empty queue or a failed dequeue.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Polls a [`JobStorage`] and hands claimed jobs to an [`Executor`], one at a time.
///
/// To run jobs concurrently, run several processors against the same storage;
/// the storage's atomic claim keeps them from picking up the same job.
pub struct Processor {
    storage: Arc<dyn JobStorage>,
    executor: Arc<dyn Executor>,
    poll_interval: Duration,
    jitter: Duration,
    shutdown_when_queue_empty: bool,
}

impl std::fmt::Debug for Processor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Processor")
            .field("poll_interval", &self.poll_interval)
            .field("jitter", &self.jitter)
            .field("shutdown_when_queue_empty", &self.shutdown_when_queue_empty)
            .finish_non_exhaustive()
    }
}

impl Processor {
    /// Create a processor with the default poll interval and no jitter.
    pub fn new(storage: Arc<dyn JobStorage>, executor: Arc<dyn Executor>) -> Self {
        Self {
            storage,
            executor,
            poll_interval: DEFAULT_POLL_INTERVAL,
            jitter: Duration::ZERO,
            shutdown_when_queue_empty: false,
        }
    }

    /// Set how long to back off after an empty queue or a failed dequeue.
    pub fn poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Set the maximum random jitter added to each backoff.
    pub fn jitter(mut self, jitter: Duration) -> Self {
        self.jitter = jitter;
        self
    }

    /// Stop as soon as a dequeue finds the queue empty.
    pub fn shutdown_when_queue_empty(mut self, enabled: bool) -> Self {
        self.shutdown_when_queue_empty = enabled;
        self
    }

    /// Calculate the backoff duration with random jitter applied.
    fn backoff_with_jitter(&self) -> Duration {
        if self.jitter.is_zero() {
            return self.poll_interval;
        }

        let jitter_millis = u64::try_from(self.jitter.as_millis()).unwrap_or(u64::MAX);
        let random_jitter = rand::thread_rng().gen_range(0..=jitter_millis);
        self.poll_interval + Duration::from_millis(random_jitter)
    }

    /// Wait out a backoff, returning early if `cancel` fires.
    async fn backoff(&self, cancel: &CancellationToken) {
        let duration = self.backoff_with_jitter();
        tokio::select! {
            () = cancel.cancelled() => {}
            () = sleep(duration) => {}
        }
    }

    /// Process jobs until `cancel` fires.
    ///
    /// Cancellation is checked between jobs and during backoff; a job that is
    /// already executing always runs to completion.
    pub async fn run(&self, cancel: CancellationToken) {
        while !cancel.is_cancelled() {
            match self.run_next_job().await {
                Ok(Some(_)) => {}
                Ok(None) if self.shutdown_when_queue_empty => {
                    debug!("No queued jobs found. Shutting down the processor…");
                    break;
                }
                Ok(None) => {
                    trace!("No queued jobs found. Polling again in {:?}…", self.poll_interval);
                    self.backoff(&cancel).await;
                }
                Err(error) => {
                    error!("Couldn't dequeue a job to run: {error}");
                    self.backoff(&cancel).await;
                }
            }
        }
        debug!("Processor stopped");
    }

    /// Claim and execute the next job, if there is one.
    ///
    /// Returns:
    /// - `Ok(Some(job_id))` if a job was run
    /// - `Ok(None)` if no jobs were waiting
    /// - `Err(...)` if the dequeue itself failed
    pub async fn run_next_job(&self) -> Result<Option<i64>, StorageError> {
        trace!("Looking for next job…");
        let Some(task) = self.storage.dequeue().await? else {
            return Ok(None);
        };

        let job_id = task.id();
        match AssertUnwindSafe(self.executor.execute(task)).catch_unwind().await {
            Ok(Ok(())) => {}
            Ok(Err(error)) => {
                error!(job.id = job_id, "Problem executing job: {:#}", anyhow::Error::new(error));
            }
            Err(panic) => {
                let error = try_to_extract_panic_info(&*panic);
                error!(job.id = job_id, "Executor panicked: {error}");
            }
        }

        Ok(Some(job_id))
    }
}
