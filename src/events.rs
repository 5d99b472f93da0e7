//! Job lifecycle events.
//!
//! Storage backends own an [`EventChannel`] and publish to it after every
//! committed state change. Subscribers are awaited before the storage
//! operation returns, so by the time `enqueue` or `mark_succeeded` completes,
//! every subscriber has seen the event.

use crate::errors::PublishError;
use crate::task::JobTask;
use crate::util::try_to_extract_panic_info;
use futures_util::FutureExt;
use futures_util::future::{BoxFuture, join_all};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use tracing::warn;

/// The three kinds of lifecycle events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// A job was committed to storage.
    Enqueued,
    /// A job ran successfully and was removed from storage.
    Succeeded,
    /// A job failed and was removed from storage.
    Failed,
}

/// A fact about a job's lifecycle.
#[derive(Debug, Clone)]
pub enum JobEvent {
    /// A job was committed to storage.
    Enqueued(JobTask),
    /// A job ran successfully and was removed from storage.
    Succeeded(JobTask),
    /// A job failed and was removed from storage.
    Failed {
        /// The job that failed
        job: JobTask,
        /// What went wrong
        error: Arc<anyhow::Error>,
    },
}

impl JobEvent {
    /// The kind of this event.
    pub fn kind(&self) -> EventKind {
        match self {
            Self::Enqueued(_) => EventKind::Enqueued,
            Self::Succeeded(_) => EventKind::Succeeded,
            Self::Failed { .. } => EventKind::Failed,
        }
    }

    /// The job this event is about.
    pub fn job(&self) -> &JobTask {
        match self {
            Self::Enqueued(job) | Self::Succeeded(job) | Self::Failed { job, .. } => job,
        }
    }
}

/// Handle returned by [`EventChannel::subscribe`], used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type SubscriberFn = dyn Fn(JobEvent) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync;

struct Subscription {
    id: SubscriptionId,
    kind: Option<EventKind>,
    subscriber: Arc<SubscriberFn>,
}

/// Fan-out channel delivering [`JobEvent`]s to asynchronous subscribers.
#[derive(Default)]
pub struct EventChannel {
    next_id: AtomicU64,
    subscriptions: RwLock<Vec<Subscription>>,
}

impl std::fmt::Debug for EventChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventChannel")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

impl EventChannel {
    /// Create a channel with no subscribers.
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to every event.
    pub fn subscribe<F, Fut>(&self, subscriber: F) -> SubscriptionId
    where
        F: Fn(JobEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.add(None, subscriber)
    }

    /// Subscribe to events of a single kind.
    pub fn subscribe_to<F, Fut>(&self, kind: EventKind, subscriber: F) -> SubscriptionId
    where
        F: Fn(JobEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.add(Some(kind), subscriber)
    }

    fn add<F, Fut>(&self, kind: Option<EventKind>, subscriber: F) -> SubscriptionId
    where
        F: Fn(JobEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let subscriber: Arc<SubscriberFn> = Arc::new(move |event| subscriber(event).boxed());

        self.subscriptions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Subscription {
                id,
                kind,
                subscriber,
            });

        id
    }

    /// Remove a subscriber. Returns `false` if it was already removed.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscriptions = self
            .subscriptions
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let before = subscriptions.len();
        subscriptions.retain(|subscription| subscription.id != id);
        subscriptions.len() != before
    }

    /// Number of active subscribers, across all kinds.
    pub fn subscriber_count(&self) -> usize {
        self.subscriptions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Deliver an event to all matching subscribers and wait for them.
    ///
    /// Subscribers run concurrently. A failing or panicking subscriber does
    /// not stop delivery to the others; the failures are collected and
    /// reported once everyone is done.
    pub async fn publish(&self, event: JobEvent) -> Result<(), PublishError> {
        let kind = event.kind();
        let subscribers: Vec<Arc<SubscriberFn>> = self
            .subscriptions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|subscription| subscription.kind.is_none_or(|k| k == kind))
            .map(|subscription| Arc::clone(&subscription.subscriber))
            .collect();

        if subscribers.is_empty() {
            return Ok(());
        }

        let total = subscribers.len();
        let deliveries = subscribers.iter().map(|subscriber| {
            AssertUnwindSafe(subscriber(event.clone()))
                .catch_unwind()
                .map(flatten_delivery)
        });

        let failures: Vec<anyhow::Error> = join_all(deliveries)
            .await
            .into_iter()
            .filter_map(Result::err)
            .collect();

        for error in &failures {
            warn!(event.kind = ?kind, job.id = event.job().id(), "Event subscriber failed: {error:#}");
        }

        let failed = failures.len();
        match failures.into_iter().next() {
            None => Ok(()),
            Some(first) => Err(PublishError {
                failed,
                total,
                first,
            }),
        }
    }
}

fn flatten_delivery(result: std::thread::Result<anyhow::Result<()>>) -> anyhow::Result<()> {
    result
        .map_err(|e| try_to_extract_panic_info(&*e))
        .and_then(std::convert::identity)
}
