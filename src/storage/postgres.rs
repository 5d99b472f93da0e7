use super::{JobStorage, NewJob, ensure_processing, materialize, materialize_all};
use crate::errors::StorageError;
use crate::events::{EventChannel, JobEvent};
use crate::schema::{JobRecord, JobStatus};
use crate::task::JobTask;
use crate::types::TypeRegistry;
use async_trait::async_trait;
use sqlx::migrate::MigrateError;
use sqlx::{PgPool, Postgres, Transaction};
use std::sync::Arc;
use tracing::{debug, error, instrument};

/// Create the `jobs` table and its indexes, if they do not exist yet.
pub async fn setup_database(pool: &PgPool) -> Result<(), MigrateError> {
    sqlx::migrate!("./migrations").run(pool).await
}

/// PostgreSQL-backed [`JobStorage`].
///
/// Every mutating operation runs in a single transaction that is committed
/// before any event is published. Claims rely on row locks
/// (`FOR UPDATE SKIP LOCKED`), so any number of processors, in any number of
/// processes, can share one database.
#[derive(Debug, Clone)]
pub struct PgStorage {
    pool: PgPool,
    types: TypeRegistry,
    events: Arc<EventChannel>,
}

impl PgStorage {
    /// Create a storage on top of an existing pool.
    ///
    /// The schema must already exist, see [`setup_database`].
    pub fn new(pool: PgPool, types: TypeRegistry) -> Self {
        Self::with_events(pool, types, Arc::new(EventChannel::new()))
    }

    /// Create a storage publishing to an existing channel.
    pub fn with_events(pool: PgPool, types: TypeRegistry, events: Arc<EventChannel>) -> Self {
        Self {
            pool,
            types,
            events,
        }
    }

    /// The underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn finalize(&self, id: i64) -> Result<JobTask, StorageError> {
        let mut tx = self.pool.begin().await?;
        let record = find_job_for_update(&mut tx, id).await?;
        let record = ensure_processing(id, record.as_ref())?;
        let task = materialize(&self.types, record)?;
        delete_job(&mut tx, id).await?;
        tx.commit().await?;
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
impl JobStorage for PgStorage {
    fn events(&self) -> &EventChannel {
        &self.events
    }

    #[instrument(name = "jobs.enqueue", skip_all, fields(job.type = %job.job_type))]
    async fn enqueue(&self, job: NewJob) -> Result<i64, StorageError> {
        let job_type = self
            .types
            .check(&job.job_type, &job.data_type)
            .map_err(StorageError::UnknownType)?;

        let mut tx = self.pool.begin().await?;
        let id = sqlx::query_scalar::<_, i64>(
            "INSERT INTO jobs (status, job_type, job_data_type, job_data) VALUES ($1, $2, $3, $4) RETURNING id",
        )
        .bind(JobStatus::Queued)
        .bind(&job.job_type)
        .bind(&job.data_type)
        .bind(&job.data)
        .fetch_one(&mut *tx)
        .await?;
        tx.commit().await?;

        debug!(job.id = id, "Job enqueued");
        let task = JobTask::new(id, job_type, job.payload);
        self.publish(id, JobEvent::Enqueued(task)).await?;
        Ok(id)
    }

    #[instrument(name = "jobs.dequeue", skip_all)]
    async fn dequeue(&self) -> Result<Option<JobTask>, StorageError> {
        let mut tx = self.pool.begin().await?;

        let Some(record) = find_next_queued_job_tx(&mut tx).await? else {
            tx.rollback().await?;
            return Ok(None);
        };

        let claimed = sqlx::query("UPDATE jobs SET status = $1 WHERE id = $2 AND status = $3")
            .bind(JobStatus::Processing)
            .bind(record.id)
            .bind(JobStatus::Queued)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        tx.commit().await?;

        if claimed == 0 {
            // The row lock makes this unreachable in practice; treat it as an
            // empty queue rather than handing out a job we do not own.
            return Ok(None);
        }

        debug!(job.id = record.id, job.type = %record.job_type, "Job claimed");
        materialize(&self.types, &record).map(Some)
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
        let records = sqlx::query_as::<_, JobRecord>(
            r"
            SELECT id, queued_on, status, job_type, job_data_type, job_data
            FROM jobs
            ORDER BY queued_on ASC, id ASC
            ",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(materialize_all(&self.types, &records))
    }

    async fn list_by_job_type(&self, job_type: &str) -> Result<Vec<JobTask>, StorageError> {
        let records = sqlx::query_as::<_, JobRecord>(
            r"
            SELECT id, queued_on, status, job_type, job_data_type, job_data
            FROM jobs
            WHERE job_type = $1
            ORDER BY queued_on ASC, id ASC
            ",
        )
        .bind(job_type)
        .fetch_all(&self.pool)
        .await?;

        Ok(materialize_all(&self.types, &records))
    }

    #[instrument(name = "jobs.requeue_orphaned", skip_all)]
    async fn requeue_orphaned(&self) -> Result<u64, StorageError> {
        let mut tx = self.pool.begin().await?;
        let requeued = sqlx::query("UPDATE jobs SET status = $1 WHERE status = $2")
            .bind(JobStatus::Queued)
            .bind(JobStatus::Processing)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        tx.commit().await?;
        Ok(requeued)
    }

    #[instrument(name = "jobs.repair_corrupt", skip_all)]
    async fn repair_corrupt(&self) -> Result<u64, StorageError> {
        let mut tx = self.pool.begin().await?;
        let records = sqlx::query_as::<_, JobRecord>(
            r"
            SELECT id, queued_on, status, job_type, job_data_type, job_data
            FROM jobs
            ORDER BY id ASC
            FOR UPDATE
            ",
        )
        .fetch_all(&mut *tx)
        .await?;

        let mut removed = 0;
        for record in &records {
            if let Err(error) = materialize(&self.types, record) {
                error!(job.id = record.id, job.type = %record.job_type, "Detected problematic job, deleting: {error}");
                delete_job(&mut tx, record.id).await?;
                removed += 1;
            }
        }

        tx.commit().await?;
        Ok(removed)
    }
}

/// Finds the oldest queued job that no other transaction has locked.
async fn find_next_queued_job_tx(
    tx: &mut Transaction<'_, Postgres>,
) -> Result<Option<JobRecord>, sqlx::Error> {
    sqlx::query_as::<_, JobRecord>(
        r"
        SELECT id, queued_on, status, job_type, job_data_type, job_data
        FROM jobs
        WHERE status = $1
        ORDER BY queued_on ASC, id ASC
        FOR UPDATE SKIP LOCKED
        LIMIT 1
        ",
    )
    .bind(JobStatus::Queued)
    .fetch_optional(&mut **tx)
    .await
}

/// Loads a job and locks its row until the transaction ends.
async fn find_job_for_update(
    tx: &mut Transaction<'_, Postgres>,
    job_id: i64,
) -> Result<Option<JobRecord>, sqlx::Error> {
    sqlx::query_as::<_, JobRecord>(
        r"
        SELECT id, queued_on, status, job_type, job_data_type, job_data
        FROM jobs
        WHERE id = $1
        FOR UPDATE
        ",
    )
    .bind(job_id)
    .fetch_optional(&mut **tx)
    .await
}

async fn delete_job(tx: &mut Transaction<'_, Postgres>, job_id: i64) -> Result<(), sqlx::Error> {
    sqlx::query("DELETE FROM jobs WHERE id = $1")
        .bind(job_id)
        .execute(&mut **tx)
        .await?;
    Ok(())
}
