//! The job storage contract and its two backends.
//!
//! Both [`PgStorage`] and [`MemoryStorage`] implement [`JobStorage`] with the
//! same semantics:
//!
//! - A record exists only while it is queued or processing. Finishing a job
//!   deletes it, and the outcome is announced through the [`EventChannel`].
//! - [`JobStorage::dequeue`] claims the oldest queued record atomically, so
//!   a record is handed to at most one caller.
//! - Events are published only after the change they describe is committed.

mod memory;
mod postgres;

pub use memory::MemoryStorage;
pub use postgres::{PgStorage, setup_database};

use crate::errors::{InvalidJobState, StorageError};
use crate::events::EventChannel;
use crate::schema::{JobRecord, JobStatus};
use crate::task::{JobTask, Payload};
use crate::types::{JobData, TypeRegistry};
use crate::BackgroundJob;
use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use tracing::warn;

/// A job about to be enqueued: its type identifiers, its serialized payload,
/// and the decoded payload that goes into the `Enqueued` event.
#[derive(Clone)]
pub struct NewJob {
    pub(crate) job_type: String,
    pub(crate) data_type: String,
    pub(crate) data: String,
    pub(crate) payload: Payload,
}

impl NewJob {
    /// Serialize `data` for the job type `J`.
    pub fn new<J: BackgroundJob>(data: J::Data) -> Result<Self, serde_json::Error> {
        Ok(Self {
            job_type: J::JOB_TYPE.to_string(),
            data_type: <J::Data as JobData>::DATA_TYPE.to_string(),
            data: serde_json::to_string(&data)?,
            payload: Arc::new(data),
        })
    }

    /// Identifier of the handler this job is dispatched to.
    pub fn job_type(&self) -> &str {
        &self.job_type
    }
}

impl std::fmt::Debug for NewJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NewJob")
            .field("job_type", &self.job_type)
            .field("data_type", &self.data_type)
            .field("data", &self.data)
            .finish_non_exhaustive()
    }
}

/// Owns job records and their state transitions.
///
/// Callers must run [`requeue_orphaned`](Self::requeue_orphaned) only while no
/// processor is consuming from the same storage: it cannot tell a job
/// abandoned by a crashed process from one that is legitimately in flight.
/// [`Runner::start`](crate::Runner::start) takes care of this ordering.
#[async_trait]
pub trait JobStorage: Send + Sync {
    /// The channel lifecycle events are published on.
    fn events(&self) -> &EventChannel;

    /// Persist a new queued job and publish an `Enqueued` event.
    ///
    /// Returns the id assigned to the job.
    async fn enqueue(&self, job: NewJob) -> Result<i64, StorageError>;

    /// Claim the oldest queued job, moving it to processing.
    ///
    /// Returns `Ok(None)` if no job is queued. If the claimed record cannot be
    /// decoded, the claim stays in place and [`StorageError::MalformedJob`] is
    /// returned; [`repair_corrupt`](Self::repair_corrupt) removes it later.
    async fn dequeue(&self) -> Result<Option<JobTask>, StorageError>;

    /// Delete a processing job and publish a `Succeeded` event.
    async fn mark_succeeded(&self, id: i64) -> Result<(), StorageError>;

    /// Delete a processing job and publish a `Failed` event carrying `error`.
    async fn mark_failed(&self, id: i64, error: anyhow::Error) -> Result<(), StorageError>;

    /// All stored jobs, oldest first.
    async fn list_all(&self) -> Result<Vec<JobTask>, StorageError>;

    /// All stored jobs of one job type, oldest first.
    async fn list_by_job_type(&self, job_type: &str) -> Result<Vec<JobTask>, StorageError>;

    /// Move every processing job back to queued. Returns how many moved.
    async fn requeue_orphaned(&self) -> Result<u64, StorageError>;

    /// Delete every record that cannot be resolved. Returns how many were removed.
    async fn repair_corrupt(&self) -> Result<u64, StorageError>;
}

/// Typed helpers available on every [`JobStorage`].
pub trait JobStorageExt: JobStorage {
    /// Enqueue `data` for the job type `J`.
    fn enqueue_job<J: BackgroundJob>(
        &self,
        data: J::Data,
    ) -> impl Future<Output = Result<i64, StorageError>> + Send {
        async move {
            let job = NewJob::new::<J>(data)?;
            self.enqueue(job).await
        }
    }

    /// All stored jobs of the job type `J`, oldest first.
    fn list_jobs<J: BackgroundJob>(
        &self,
    ) -> impl Future<Output = Result<Vec<JobTask>, StorageError>> + Send {
        self.list_by_job_type(J::JOB_TYPE)
    }
}

impl<S: JobStorage + ?Sized> JobStorageExt for S {}

/// Rebuild the task for a stored record.
pub(crate) fn materialize(types: &TypeRegistry, record: &JobRecord) -> Result<JobTask, StorageError> {
    let (job_type, payload) = types
        .resolve(&record.job_type, &record.job_data_type, &record.job_data)
        .map_err(|source| StorageError::MalformedJob {
            id: record.id,
            source,
        })?;
    Ok(JobTask::new(record.id, job_type, payload))
}

/// Rebuild tasks for a listing, leaving out records that cannot be resolved.
pub(crate) fn materialize_all<'a>(
    types: &TypeRegistry,
    records: impl IntoIterator<Item = &'a JobRecord>,
) -> Vec<JobTask> {
    records
        .into_iter()
        .filter_map(|record| match materialize(types, record) {
            Ok(task) => Some(task),
            Err(error) => {
                warn!(job.id = record.id, "Skipping job that cannot be listed: {error}");
                None
            }
        })
        .collect()
}

/// Checks the precondition shared by `mark_succeeded` and `mark_failed`.
pub(crate) fn ensure_processing(
    id: i64,
    record: Option<&JobRecord>,
) -> Result<&JobRecord, StorageError> {
    match record {
        None => Err(StorageError::InvalidJobState {
            id,
            state: InvalidJobState::NotFound,
        }),
        Some(record) if record.status != JobStatus::Processing => {
            Err(StorageError::InvalidJobState {
                id,
                state: InvalidJobState::NotProcessing,
            })
        }
        Some(record) => Ok(record),
    }
}
