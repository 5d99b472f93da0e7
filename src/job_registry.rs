use crate::errors::RegistryError;
use crate::task::Payload;
use crate::types::{JobData, TypeRegistry};
use crate::BackgroundJob;
use anyhow::anyhow;
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::error;

pub(crate) type RunTaskFn<Context> =
    dyn Fn(Context, Payload) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync;

/// Maps job type identifiers to the handlers that run them.
///
/// The registry also owns the [`TypeRegistry`] that storage backends use to
/// decode stored jobs, so registering a job here is all that is needed for it
/// to be enqueued, listed and executed.
pub struct JobRegistry<Context> {
    types: TypeRegistry,
    handlers: HashMap<&'static str, Arc<RunTaskFn<Context>>>,
}

impl<Context> Default for JobRegistry<Context> {
    fn default() -> Self {
        Self {
            types: TypeRegistry::default(),
            handlers: HashMap::new(),
        }
    }
}

impl<Context> std::fmt::Debug for JobRegistry<Context> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobRegistry")
            .field("job_types", &self.job_types())
            .finish()
    }
}

impl<Context: Clone + Send + Sync + 'static> JobRegistry<Context> {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a job type so it can be decoded and executed.
    ///
    /// A registration that would shadow an earlier one is logged and
    /// skipped; use [`try_register`](Self::try_register) to fail instead.
    pub fn register<J: BackgroundJob<Context = Context>>(mut self) -> Self {
        if let Err(error) = self.add::<J>() {
            error!("Skipping job registration: {error}");
        }
        self
    }

    /// Register a job type, failing if its job type or data type identifier
    /// is already taken by a different registration.
    pub fn try_register<J: BackgroundJob<Context = Context>>(mut self) -> Result<Self, RegistryError> {
        self.add::<J>()?;
        Ok(self)
    }

    fn add<J: BackgroundJob<Context = Context>>(&mut self) -> Result<(), RegistryError> {
        self.types.insert::<J::Data>(J::JOB_TYPE)?;

        let run_task_fn: Arc<RunTaskFn<Context>> = Arc::new(|ctx: Context, payload: Payload| {
            async move {
                let data = payload
                    .downcast_ref::<J::Data>()
                    .cloned()
                    .ok_or_else(|| {
                        anyhow!(
                            "payload of job type {} is not a {}",
                            J::JOB_TYPE,
                            <J::Data as JobData>::DATA_TYPE
                        )
                    })?;

                let job = J::build(&ctx);
                job.run(data).await
            }
            .boxed()
        });

        self.handlers.insert(J::JOB_TYPE, run_task_fn);
        Ok(())
    }
}

impl<Context> JobRegistry<Context> {
    /// The type registry to hand to a storage backend.
    pub fn types(&self) -> &TypeRegistry {
        &self.types
    }

    /// Identifiers of all registered job types.
    pub fn job_types(&self) -> Vec<&'static str> {
        self.types.job_types()
    }

    pub(crate) fn get(&self, job_type: &str) -> Option<&Arc<RunTaskFn<Context>>> {
        self.handlers.get(job_type)
    }
}
