use crate::backoff::Backoff;
use crate::client::Client;
use crate::errors::{DisposeError, StoreError};
use crate::job::Job;
use crate::store::{FailOutcome, Store};
use async_trait::async_trait;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio_util::sync::CancellationToken;

/// Processes the jobs claimed by a [Worker](super::Worker).
///
/// Returning `Ok(result)` acknowledges the job with `result`, returning an
/// error fails the delivery. Handlers that need the disposition to commit
/// together with their own side effects use [JobContext::ack] or
/// [JobContext::nack] instead, in which case the return value is ignored.
#[async_trait]
pub trait Handler<S: Store>: Send + Sync + 'static {
    async fn handle(&self, ctx: JobContext<S>, job: Job) -> anyhow::Result<Value>;
}

/// A [Handler] built from a closure, see [handler_fn].
#[derive(Debug, Clone)]
pub struct HandlerFn<F>(F);

/// Turns an async closure into a [Handler].
///
/// ```
/// use lease_queue::{Job, JobContext, MemoryStore, handler_fn};
///
/// let handler = handler_fn(|_ctx: JobContext<MemoryStore>, job: Job| async move {
///     Ok(serde_json::json!({ "handled": job.id }))
/// });
/// # let _ = handler;
/// ```
pub fn handler_fn<S, F, Fut>(f: F) -> HandlerFn<F>
where
    S: Store,
    F: Fn(JobContext<S>, Job) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
{
    HandlerFn(f)
}

#[async_trait]
impl<S, F, Fut> Handler<S> for HandlerFn<F>
where
    S: Store,
    F: Fn(JobContext<S>, Job) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
{
    async fn handle(&self, ctx: JobContext<S>, job: Job) -> anyhow::Result<Value> {
        (self.0)(ctx, job).await
    }
}

/// What a handler gets to see besides the job itself.
#[derive(Debug, Clone)]
pub struct JobContext<S: Store> {
    client: Client<S>,
    job: Job,
    token: CancellationToken,
    backoff: Backoff,
    disposed: Arc<AtomicBool>,
}

impl<S: Store> JobContext<S> {
    pub(crate) fn new(
        client: Client<S>,
        job: Job,
        token: CancellationToken,
        backoff: Backoff,
    ) -> Self {
        Self {
            client,
            job,
            token,
            backoff,
            disposed: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn client(&self) -> &Client<S> {
        &self.client
    }

    /// Cancelled when the worker is stopping, or when the lease on the job
    /// was lost and another worker may already be running it.
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }

    /// The retry strategy [JobContext::nack] applies.
    pub fn backoff(&self) -> &Backoff {
        &self.backoff
    }

    /// Opens a store transaction for the handler's side effects and the
    /// disposition of the job.
    pub async fn begin(&self) -> Result<S::Session, StoreError> {
        self.client.begin().await
    }

    /// Acknowledges the job within `session`.
    ///
    /// After this returns `Ok` or a lease conflict the worker no longer
    /// disposes the job itself. If `session` is rolled back afterwards, the
    /// lease lapses and the job is delivered again.
    pub async fn ack(
        &self,
        session: &mut S::Session,
        result: &Value,
    ) -> Result<(), DisposeError> {
        let outcome = self.client.ack(session, &self.job, result).await;
        self.mark_disposed(&outcome);
        outcome
    }

    /// Fails the delivery of the job within `session`, see [JobContext::ack].
    pub async fn nack(
        &self,
        session: &mut S::Session,
        error: &Value,
    ) -> Result<FailOutcome, DisposeError> {
        let outcome = self
            .client
            .nack(session, &self.job, &self.backoff, error)
            .await;
        self.mark_disposed(&outcome);
        outcome
    }

    fn mark_disposed<T>(&self, outcome: &Result<T, DisposeError>) {
        let disposed = match outcome {
            Ok(_) => true,
            Err(error) => error.is_lease_conflict(),
        };
        if disposed {
            self.disposed.store(true, Ordering::Release);
        }
    }

    pub(crate) fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }
}
