/// Errors raised while resolving a stored job back into typed values.
///
/// Every variant means the record itself is bad, as opposed to the storage
/// medium being unavailable. [`JobStorage::repair_corrupt`] relies on that
/// distinction to decide which records to quarantine.
///
/// [`JobStorage::repair_corrupt`]: crate::JobStorage::repair_corrupt
#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    /// No job type with this identifier is registered.
    #[error("unknown job type `{0}`")]
    UnknownJobType(String),
    /// No data type with this identifier is registered.
    #[error("unknown job data type `{0}`")]
    UnknownDataType(String),
    /// The job type is registered, but expects a different data type.
    #[error("job type `{job_type}` expects data type `{expected}`, found `{found}`")]
    DataTypeMismatch {
        /// Stored job type identifier
        job_type: String,
        /// Data type the registered job type works with
        expected: &'static str,
        /// Data type identifier found in the record
        found: String,
    },
    /// The payload could not be deserialized into its data type.
    #[error("failed to decode payload as `{data_type}`: {source}")]
    Decode {
        /// Data type identifier the payload was decoded as
        data_type: String,
        /// Underlying deserialization error
        #[source]
        source: serde_json::Error,
    },
}

/// A job registration that would shadow an existing one.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    /// The job type identifier is already registered.
    #[error("job type `{job_type}` is already registered with data type `{data_type}`")]
    DuplicateJobType {
        /// Job type identifier
        job_type: &'static str,
        /// Data type of the existing registration
        data_type: &'static str,
    },
    /// Two different Rust types declare the same data type identifier.
    #[error("data type `{data_type}` is already taken by `{registered}`, refusing `{rejected}`")]
    DataTypeConflict {
        /// Data type identifier
        data_type: &'static str,
        /// Rust type registered first
        registered: &'static str,
        /// Rust type that was refused
        rejected: &'static str,
    },
}

/// Why a job could not be marked as succeeded or failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum InvalidJobState {
    /// No record with this id exists.
    #[error("no such job")]
    NotFound,
    /// The record exists, but was never claimed by a dequeue.
    #[error("job is not being processed")]
    NotProcessing,
}

/// One or more event subscribers failed while an event was being delivered.
///
/// All subscribers have run by the time this is returned.
#[derive(Debug, thiserror::Error)]
#[error("{failed} of {total} event subscribers failed: {first:#}")]
pub struct PublishError {
    /// Number of subscribers that returned an error or panicked
    pub failed: usize,
    /// Number of subscribers the event was delivered to
    pub total: usize,
    /// The first failure, in subscription order
    pub first: anyhow::Error,
}

/// Errors returned by [`JobStorage`](crate::JobStorage) operations.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// The database could not be reached or the transaction could not commit.
    #[error("storage medium error: {0}")]
    Database(#[from] sqlx::Error),

    /// The job payload could not be serialized.
    #[error("failed to serialize job data: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A job was enqueued with type identifiers the storage cannot resolve.
    #[error("refusing to enqueue job: {0}")]
    UnknownType(#[source] ResolveError),

    /// `mark_succeeded`/`mark_failed` was called on a job that is not in flight.
    #[error("job {id} cannot be finalized: {state}")]
    InvalidJobState {
        /// Id passed by the caller
        id: i64,
        /// What was wrong with the record
        state: InvalidJobState,
    },

    /// A stored record could not be resolved into a [`JobTask`](crate::JobTask).
    #[error("job {id} is malformed: {source}")]
    MalformedJob {
        /// Id of the offending record
        id: i64,
        /// Resolution failure
        #[source]
        source: ResolveError,
    },

    /// The state change was committed, but an event subscriber failed.
    #[error("job {id} was updated, but publishing its event failed: {source}")]
    Publish {
        /// Id of the job the event was about
        id: i64,
        /// Subscriber failures
        #[source]
        source: PublishError,
    },
}

/// Errors returned by [`Executor::execute`](crate::Executor::execute).
///
/// Handler failures never show up here, they are recorded as failed jobs.
#[derive(Debug, thiserror::Error)]
pub enum ExecuteError {
    /// The job ran, but its outcome could not be written back to storage.
    ///
    /// The record stays in the processing state until
    /// [`JobStorage::requeue_orphaned`](crate::JobStorage::requeue_orphaned) runs.
    #[error("failed to record the outcome of job {job_id}")]
    OutcomeNotRecorded {
        /// Id of the job that ran
        job_id: i64,
        /// Storage failure
        #[source]
        source: StorageError,
    },
}
