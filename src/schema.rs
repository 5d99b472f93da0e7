//! Database schema definitions for SQLx.
//!
//! This module contains the record type stored by both backends. The
//! PostgreSQL table is created by [`setup_database`](crate::setup_database).

use chrono::{DateTime, Utc};
use sqlx::FromRow;

/// Lifecycle state of a stored job.
///
/// There are no terminal states: a finished job is deleted, and its outcome
/// only exists as a published [`JobEvent`](crate::JobEvent).
#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::Type)]
#[repr(i16)]
pub enum JobStatus {
    /// Waiting to be claimed
    Queued = 0,
    /// Claimed by a processor and not yet finalized
    Processing = 1,
}

/// Represents a job record in the database
#[derive(Debug, Clone, FromRow)]
pub struct JobRecord {
    /// Unique identifier for the job, assigned on enqueue
    pub id: i64,
    /// Timestamp when the job was enqueued (used for FIFO ordering)
    pub queued_on: DateTime<Utc>,
    /// Current lifecycle state
    pub status: JobStatus,
    /// Type identifier of the handler (used for dispatch)
    pub job_type: String,
    /// Type identifier of the payload
    pub job_data_type: String,
    /// Serialized payload
    pub job_data: String,
}
