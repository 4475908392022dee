use crate::client::Client;
use crate::errors::EnqueueError;
use crate::job::{DEFAULT_MAX_ATTEMPTS, DEFAULT_QUEUE, EnqueueRequest, Enqueued};
use crate::store::Store;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::time::Duration;

/// A typed job description that serializes itself into the payload of a
/// queued job.
///
/// Handlers get the value back with [`Job::payload_as`](crate::Job::payload_as).
pub trait BackgroundJob: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Job queue where this job will be executed.
    const QUEUE: &'static str = DEFAULT_QUEUE;

    /// Default priority of the job.
    ///
    /// [Self::enqueue_with_priority] can be used to override the priority value.
    const PRIORITY: i16 = 0;

    /// Number of deliveries before the job is dead-lettered.
    const MAX_ATTEMPTS: i32 = DEFAULT_MAX_ATTEMPTS;

    /// Key used to deduplicate the job against active jobs of the same queue.
    ///
    /// `None` disables deduplication.
    fn unique_key(&self) -> Option<String> {
        None
    }

    fn enqueue<S: Store>(
        &self,
        client: &Client<S>,
    ) -> impl Future<Output = Result<Enqueued, EnqueueError>> + Send {
        self.enqueue_with(client, Self::PRIORITY, Duration::ZERO)
    }

    fn enqueue_with_priority<S: Store>(
        &self,
        client: &Client<S>,
        priority: i16,
    ) -> impl Future<Output = Result<Enqueued, EnqueueError>> + Send {
        self.enqueue_with(client, priority, Duration::ZERO)
    }

    /// Enqueues the job so that it becomes eligible after `delay`.
    fn enqueue_after<S: Store>(
        &self,
        client: &Client<S>,
        delay: Duration,
    ) -> impl Future<Output = Result<Enqueued, EnqueueError>> + Send {
        self.enqueue_with(client, Self::PRIORITY, delay)
    }

    fn enqueue_with<S: Store>(
        &self,
        client: &Client<S>,
        priority: i16,
        delay: Duration,
    ) -> impl Future<Output = Result<Enqueued, EnqueueError>> + Send {
        let request = self.enqueue_request(priority, delay);
        async move { client.enqueue(&request?).await }
    }

    /// Enqueues the job as part of `session`, see [Client::enqueue_in].
    fn enqueue_in<S: Store>(
        &self,
        client: &Client<S>,
        session: &mut S::Session,
    ) -> impl Future<Output = Result<Enqueued, EnqueueError>> + Send {
        let request = self.enqueue_request(Self::PRIORITY, Duration::ZERO);
        async move { client.enqueue_in(session, &request?).await }
    }

    fn enqueue_request(
        &self,
        priority: i16,
        delay: Duration,
    ) -> Result<EnqueueRequest, serde_json::Error> {
        let payload = serde_json::to_value(self)?;

        Ok(EnqueueRequest::builder()
            .queue_name(Self::QUEUE)
            .priority(priority)
            .maybe_unique_key(self.unique_key())
            .payload(payload)
            .max_attempts(Self::MAX_ATTEMPTS)
            .delay(delay)
            .build())
    }
}
