use crate::errors::{ExecuteError, StorageError};
use crate::job_registry::JobRegistry;
use crate::storage::JobStorage;
use crate::task::JobTask;
use crate::util::try_to_extract_panic_info;
use anyhow::anyhow;
use async_trait::async_trait;
use futures_util::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{Instrument, debug, error, info_span, warn};

/// Runs a claimed job and records its outcome.
#[async_trait]
pub trait Executor: Send + Sync {
    /// Run `task` to completion and finalize it in storage.
    ///
    /// Handler failures are recorded with `mark_failed` and are not returned.
    /// An error means the outcome itself could not be recorded.
    async fn execute(&self, task: JobTask) -> Result<(), ExecuteError>;
}

/// The default [`Executor`]: dispatches through a [`JobRegistry`].
pub struct JobExecutor<Context> {
    storage: Arc<dyn JobStorage>,
    registry: Arc<JobRegistry<Context>>,
    context: Context,
}

impl<Context: std::fmt::Debug> std::fmt::Debug for JobExecutor<Context> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobExecutor")
            .field("registry", &self.registry)
            .field("context", &self.context)
            .finish_non_exhaustive()
    }
}

impl<Context: Clone + Send + Sync + 'static> JobExecutor<Context> {
    /// Create an executor finalizing jobs in `storage`.
    pub fn new(
        storage: Arc<dyn JobStorage>,
        registry: Arc<JobRegistry<Context>>,
        context: Context,
    ) -> Self {
        Self {
            storage,
            registry,
            context,
        }
    }

    async fn run(&self, task: &JobTask) -> anyhow::Result<()> {
        let job_type = task.job_type();
        let run_task_fn = self
            .registry
            .get(job_type.name())
            .ok_or_else(|| anyhow!("No handler registered for job type {job_type}"))?;

        AssertUnwindSafe(run_task_fn(self.context.clone(), task.payload()))
            .catch_unwind()
            .await
            .map_err(|e| try_to_extract_panic_info(&*e))
            .and_then(std::convert::identity)
    }
}

#[async_trait]
impl<Context: Clone + Send + Sync + 'static> Executor for JobExecutor<Context> {
    async fn execute(&self, task: JobTask) -> Result<(), ExecuteError> {
        let job_id = task.id();
        let span = info_span!("job", job.id = %job_id, job.type = %task.job_type());

        async move {
            debug!("Running job…");
            let recorded = match self.run(&task).await {
                Ok(()) => {
                    debug!("Marking job as succeeded…");
                    self.storage.mark_succeeded(job_id).await
                }
                Err(error) => {
                    warn!("Failed to run job: {error:#}");
                    self.storage.mark_failed(job_id, error).await
                }
            };

            match recorded {
                Ok(()) => Ok(()),
                Err(StorageError::Publish { source, .. }) => {
                    warn!("Job outcome recorded, but an event subscriber failed: {source}");
                    Ok(())
                }
                Err(source) => {
                    error!("Failed to record job outcome, job stays claimed until requeued: {source}");
                    Err(ExecuteError::OutcomeNotRecorded { job_id, source })
                }
            }
        }
        .instrument(span)
        .await
    }
}
