use crate::types::JobData;
use std::future::Future;

/// Trait for defining the handlers that background jobs are dispatched to.
///
/// A fresh handler is built from the context for every invocation and
/// dropped as soon as the invocation ends, whether it succeeded or not.
/// Anything the handler owns (connections, temp files, guards) is released
/// at that point.
///
/// ```ignore
/// #[derive(Debug, Clone, Serialize, Deserialize)]
/// struct Resize { path: String, width: u32 }
///
/// impl JobData for Resize {
///     const DATA_TYPE: &'static str = "resize";
/// }
///
/// struct ResizeImage { store: ImageStore }
///
/// impl BackgroundJob for ResizeImage {
///     const JOB_TYPE: &'static str = "resize_image";
///     type Data = Resize;
///     type Context = AppState;
///
///     fn build(ctx: &AppState) -> Self {
///         Self { store: ctx.images.clone() }
///     }
///
///     async fn run(&self, data: Resize) -> anyhow::Result<()> {
///         self.store.resize(&data.path, data.width).await
///     }
/// }
/// ```
pub trait BackgroundJob: Send + Sync + Sized + 'static {
    /// Unique name of the job type.
    ///
    /// This MUST be unique for the whole application.
    const JOB_TYPE: &'static str;

    /// The payload this job is enqueued with.
    type Data: JobData;

    /// The application data provided to this job at runtime.
    type Context: Clone + Send + Sync + 'static;

    /// Create the handler instance for a single invocation.
    fn build(ctx: &Self::Context) -> Self;

    /// Execute the task. This method should define its logic.
    fn run(&self, data: Self::Data) -> impl Future<Output = anyhow::Result<()>> + Send;
}
