use super::{JobStorage, NewJob, ensure_processing, materialize, materialize_all};
use crate::errors::StorageError;
use crate::events::{EventChannel, JobEvent};
use crate::schema::{JobRecord, JobStatus};
use crate::task::JobTask;
use crate::types::TypeRegistry;
use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, instrument};

#[derive(Debug, Default)]
struct State {
    next_id: i64,
    records: Vec<JobRecord>,
}

/// In-memory [`JobStorage`] for embedding and testing.
///
/// A single mutex guards the whole record set and is held across each
/// operation's check-and-mutate sequence, which is what makes claims atomic.
/// Not durable: all jobs are lost when the storage is dropped.
#[derive(Debug)]
pub struct MemoryStorage {
    types: TypeRegistry,
    events: Arc<EventChannel>,
    state: Mutex<State>,
}

impl MemoryStorage {
    /// Create an empty storage that resolves jobs with `types`.
    pub fn new(types: TypeRegistry) -> Self {
        Self::with_events(types, Arc::new(EventChannel::new()))
    }

    /// Create an empty storage publishing to an existing channel.
    pub fn with_events(types: TypeRegistry, events: Arc<EventChannel>) -> Self {
        Self {
            types,
            events,
            state: Mutex::new(State::default()),
        }
    }

    async fn finalize(&self, id: i64) -> Result<JobTask, StorageError> {
        let mut state = self.state.lock().await;
        let record = ensure_processing(id, state.records.iter().find(|record| record.id == id))?;
        let task = materialize(&self.types, record)?;
        state.records.retain(|record| record.id != id);
        Ok(task)
    }

    async fn publish(&self, id: i64, event: JobEvent) -> Result<(), StorageError> {
        self.events
            .publish(event)
            .await
            .map_err(|source| StorageError::Publish { id, source })
    }
}

#[async_trait]
impl JobStorage for MemoryStorage {
    fn events(&self) -> &EventChannel {
        &self.events
    }

    #[instrument(name = "jobs.enqueue", skip_all, fields(job.type = %job.job_type))]
    async fn enqueue(&self, job: NewJob) -> Result<i64, StorageError> {
        let job_type = self
            .types
            .check(&job.job_type, &job.data_type)
            .map_err(StorageError::UnknownType)?;

        let id = {
            let mut state = self.state.lock().await;
            state.next_id += 1;
            let id = state.next_id;
            state.records.push(JobRecord {
                id,
                queued_on: Utc::now(),
                status: JobStatus::Queued,
                job_type: job.job_type,
                job_data_type: job.data_type,
                job_data: job.data,
            });
            id
        };

        debug!(job.id = id, "Job enqueued");
        let task = JobTask::new(id, job_type, job.payload);
        self.publish(id, JobEvent::Enqueued(task)).await?;
        Ok(id)
    }

    #[instrument(name = "jobs.dequeue", skip_all)]
    async fn dequeue(&self) -> Result<Option<JobTask>, StorageError> {
        let mut state = self.state.lock().await;
        let next = state
            .records
            .iter_mut()
            .filter(|record| record.status == JobStatus::Queued)
            .min_by(|a, b| a.queued_on.cmp(&b.queued_on).then(a.id.cmp(&b.id)));

        let Some(record) = next else {
            return Ok(None);
        };

        record.status = JobStatus::Processing;
        debug!(job.id = record.id, job.type = %record.job_type, "Job claimed");
        materialize(&self.types, record).map(Some)
    }

    #[instrument(name = "jobs.mark_succeeded", skip(self))]
    async fn mark_succeeded(&self, id: i64) -> Result<(), StorageError> {
        let task = self.finalize(id).await?;
        debug!("Job succeeded, record deleted");
        self.publish(id, JobEvent::Succeeded(task)).await
    }

    #[instrument(name = "jobs.mark_failed", skip(self, error))]
    async fn mark_failed(&self, id: i64, error: anyhow::Error) -> Result<(), StorageError> {
        let job = self.finalize(id).await?;
        debug!("Job failed, record deleted");
        let error = Arc::new(error);
        self.publish(id, JobEvent::Failed { job, error }).await
    }

    async fn list_all(&self) -> Result<Vec<JobTask>, StorageError> {
        let state = self.state.lock().await;
        let mut records: Vec<&JobRecord> = state.records.iter().collect();
        records.sort_by(|a, b| a.queued_on.cmp(&b.queued_on).then(a.id.cmp(&b.id)));
        Ok(materialize_all(&self.types, records))
    }

    async fn list_by_job_type(&self, job_type: &str) -> Result<Vec<JobTask>, StorageError> {
        let state = self.state.lock().await;
        let mut records: Vec<&JobRecord> = state
            .records
            .iter()
            .filter(|record| record.job_type == job_type)
            .collect();
        records.sort_by(|a, b| a.queued_on.cmp(&b.queued_on).then(a.id.cmp(&b.id)));
        Ok(materialize_all(&self.types, records))
    }

    #[instrument(name = "jobs.requeue_orphaned", skip_all)]
    async fn requeue_orphaned(&self) -> Result<u64, StorageError> {
        let mut state = self.state.lock().await;
        let mut requeued = 0;
        for record in state
            .records
            .iter_mut()
            .filter(|record| record.status == JobStatus::Processing)
        {
            record.status = JobStatus::Queued;
            requeued += 1;
        }
        Ok(requeued)
    }

    #[instrument(name = "jobs.repair_corrupt", skip_all)]
    async fn repair_corrupt(&self) -> Result<u64, StorageError> {
        let mut state = self.state.lock().await;
        let before = state.records.len();
        state.records.retain(|record| match materialize(&self.types, record) {
            Ok(_) => true,
            Err(error) => {
                error!(job.id = record.id, job.type = %record.job_type, "Detected problematic job, deleting: {error}");
                false
            }
        });
        Ok((before - state.records.len()) as u64)
    }
}
