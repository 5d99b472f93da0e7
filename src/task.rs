use std::any::Any;
use std::fmt;
use std::sync::Arc;

use crate::types::JobData;

/// A deserialized, type-erased job payload.
pub type Payload = Arc<dyn Any + Send + Sync>;

/// A resolved job type: the handler identifier and the payload type it expects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct JobType {
    pub(crate) name: &'static str,
    pub(crate) data_type: &'static str,
}

impl JobType {
    /// Identifier of the handler, as stored in the `job_type` column.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Identifier of the payload type, as stored in the `job_data_type` column.
    pub fn data_type(&self) -> &'static str {
        self.data_type
    }
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

/// A job materialized from storage, ready to be handed to an executor.
///
/// Tasks are never stored. They are rebuilt from the job record every time a
/// job is dequeued, listed, or finalized.
#[derive(Clone)]
pub struct JobTask {
    id: i64,
    job_type: JobType,
    data: Payload,
}

impl JobTask {
    pub(crate) fn new(id: i64, job_type: JobType, data: Payload) -> Self {
        Self { id, job_type, data }
    }

    /// Id of the underlying job record.
    pub fn id(&self) -> i64 {
        self.id
    }

    /// The resolved job type.
    pub fn job_type(&self) -> JobType {
        self.job_type
    }

    /// The payload, if it is a `T`.
    pub fn data<T: JobData>(&self) -> Option<&T> {
        self.data.downcast_ref::<T>()
    }

    pub(crate) fn payload(&self) -> Payload {
        Arc::clone(&self.data)
    }
}

impl fmt::Debug for JobTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobTask")
            .field("id", &self.id)
            .field("job_type", &self.job_type.name)
            .field("data_type", &self.job_type.data_type)
            .finish_non_exhaustive()
    }
}
