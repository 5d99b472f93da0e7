#![doc = include_str!("../README.md")]
#![warn(missing_docs)]
#![forbid(unsafe_code)]

mod background_job;
mod errors;
mod events;
mod executor;
mod job_registry;
mod processor;
mod runner;
/// Database schema definitions.
pub mod schema;
mod storage;
mod task;
mod types;
mod util;

/// The main trait for defining job handlers.
pub use self::background_job::BackgroundJob;
/// Error types for storage, execution and event delivery.
pub use self::errors::{
    ExecuteError, InvalidJobState, PublishError, RegistryError, ResolveError, StorageError,
};
/// Lifecycle events and the channel they are published on.
pub use self::events::{EventChannel, EventKind, JobEvent, SubscriptionId};
/// Job execution.
pub use self::executor::{Executor, JobExecutor};
/// Maps job types to handlers.
pub use self::job_registry::JobRegistry;
/// The polling loop.
pub use self::processor::{DEFAULT_POLL_INTERVAL, Processor};
/// Startup wiring for processors.
pub use self::runner::{RunHandle, Runner};
/// The storage contract and its backends.
pub use self::storage::{
    JobStorage, JobStorageExt, MemoryStorage, NewJob, PgStorage, setup_database,
};
/// Materialized jobs.
pub use self::task::{JobTask, JobType, Payload};
/// Type identifier resolution.
pub use self::types::{JobData, TypeRegistry};

pub use tokio_util::sync::CancellationToken;
