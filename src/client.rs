use crate::backoff::Backoff;
use crate::errors::{DisposeError, EnqueueError, StoreError};
use crate::job::{EnqueueRequest, Enqueued, HistoryFilter, Job, JobHistory, JobId, QueueStats};
use crate::metrics::QueueMetrics;
use crate::store::{FailOutcome, PgStore, Session, Store};
use prometheus::IntCounterVec;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

/// How many expired leases [Client::recover_expired_leases] clears when it
/// is not given a positive limit.
pub const DEFAULT_RECOVERY_LIMIT: i64 = 1000;

/// The producer- and consumer-facing API of the queue.
///
/// A `Client` is a cheap handle around a [Store] and can be cloned freely.
#[derive(Debug, Clone)]
pub struct Client<S: Store = PgStore> {
    store: S,
    metrics: Option<Arc<QueueMetrics>>,
}

impl<S: Store> Client<S> {
    pub fn new(store: S) -> Self {
        Self {
            store,
            metrics: None,
        }
    }

    /// Records queue events in `metrics`, from this client and every worker
    /// built on it.
    pub fn with_metrics(mut self, metrics: Arc<QueueMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn metrics(&self) -> Option<&QueueMetrics> {
        self.metrics.as_deref()
    }

    fn count(&self, counter: impl FnOnce(&QueueMetrics) -> &IntCounterVec, queue_name: &str) {
        if let Some(metrics) = &self.metrics {
            QueueMetrics::queue_counter(counter(metrics), queue_name);
        }
    }

    /// Adds a job to its queue.
    ///
    /// If the request carries a unique key and an active job with the same
    /// queue name and key exists, nothing is inserted and the ID of the
    /// existing job is returned with `existed` set.
    #[instrument(name = "lease_queue.enqueue", skip_all, fields(queue = %request.queue_name))]
    pub async fn enqueue(&self, request: &EnqueueRequest) -> Result<Enqueued, EnqueueError> {
        request.validate()?;

        let enqueued = self.store.insert_job(request).await?;
        self.record_enqueue(request, &enqueued);
        Ok(enqueued)
    }

    /// Adds a job to its queue as part of `session`.
    ///
    /// The job becomes visible to workers only when `session` commits, and
    /// is discarded if it rolls back. Unique keys are deduplicated the same
    /// way as in [Client::enqueue]. A concurrent enqueue with the same key
    /// waits until `session` finishes.
    #[instrument(name = "lease_queue.enqueue", skip_all, fields(queue = %request.queue_name))]
    pub async fn enqueue_in(
        &self,
        session: &mut S::Session,
        request: &EnqueueRequest,
    ) -> Result<Enqueued, EnqueueError> {
        request.validate()?;

        let enqueued = session.insert_job(request).await?;
        self.record_enqueue(request, &enqueued);
        Ok(enqueued)
    }

    fn record_enqueue(&self, request: &EnqueueRequest, enqueued: &Enqueued) {
        if enqueued.existed {
            debug!(job.id = enqueued.id, "Job with the same unique key is still active");
            self.count(|m| &m.jobs_deduplicated_total, &request.queue_name);
        } else {
            debug!(job.id = enqueued.id, "Job enqueued");
            self.count(|m| &m.jobs_enqueued_total, &request.queue_name);
        }
    }

    /// Opens a store transaction to pass to [Client::ack], [Client::nack]
    /// or [Client::enqueue_in].
    pub async fn begin(&self) -> Result<S::Session, StoreError> {
        self.store.begin().await
    }

    /// Moves a leased job to the history table as `completed`.
    ///
    /// Nothing is persisted until `session` is committed.
    #[instrument(skip_all, fields(job.id = job.id, job.queue = %job.queue_name))]
    pub async fn ack(
        &self,
        session: &mut S::Session,
        job: &Job,
        result: &Value,
    ) -> Result<(), DisposeError> {
        if !session.complete_job(job, result).await? {
            return Err(self.lease_conflict(job));
        }

        self.count(|m| &m.jobs_completed_total, &job.queue_name);
        Ok(())
    }

    /// Records a failed delivery of a leased job.
    ///
    /// The job is rescheduled according to `backoff`, unless this failure
    /// exhausts its retry budget, in which case it is dead-lettered.
    /// Nothing is persisted until `session` is committed.
    #[instrument(skip_all, fields(job.id = job.id, job.queue = %job.queue_name))]
    pub async fn nack(
        &self,
        session: &mut S::Session,
        job: &Job,
        backoff: &Backoff,
        error: &Value,
    ) -> Result<FailOutcome, DisposeError> {
        let Some(outcome) = session.fail_job(job, error, backoff).await? else {
            return Err(self.lease_conflict(job));
        };

        match outcome {
            FailOutcome::Rescheduled {
                attempts,
                available_at,
            } => {
                debug!(attempts, %available_at, "Job rescheduled");
                self.count(|m| &m.jobs_retried_total, &job.queue_name);
            }
            FailOutcome::DeadLettered { attempts } => {
                warn!(attempts, "Job exhausted its retry budget and was dead-lettered");
                self.count(|m| &m.jobs_dead_lettered_total, &job.queue_name);
            }
        }

        Ok(outcome)
    }

    /// [Client::ack] in a transaction of its own.
    pub async fn ack_now(&self, job: &Job, result: &Value) -> Result<(), DisposeError> {
        let mut session = self.begin().await?;
        self.ack(&mut session, job, result).await?;
        session.commit().await?;
        Ok(())
    }

    /// [Client::nack] in a transaction of its own.
    pub async fn nack_now(
        &self,
        job: &Job,
        backoff: &Backoff,
        error: &Value,
    ) -> Result<FailOutcome, DisposeError> {
        let mut session = self.begin().await?;
        let outcome = self.nack(&mut session, job, backoff, error).await?;
        session.commit().await?;
        Ok(outcome)
    }

    fn lease_conflict(&self, job: &Job) -> DisposeError {
        warn!(
            job.id = job.id,
            lease.owner = job.lease_owner.as_deref(),
            "Lease is no longer held, refusing to finalize job"
        );
        self.count(|m| &m.lease_conflicts_total, &job.queue_name);
        DisposeError::LeaseConflict { job_id: job.id }
    }

    /// Leases the next eligible job of `queues` to `owner`.
    pub async fn claim_next(
        &self,
        queues: &[String],
        owner: &str,
        lease: Duration,
    ) -> Result<Option<Job>, StoreError> {
        let job = self.store.claim_next(queues, owner, lease).await?;
        if let Some(job) = &job {
            self.count(|m| &m.jobs_claimed_total, &job.queue_name);
        }
        Ok(job)
    }

    /// Leases a specific job to `owner`, if nobody else holds it and it is
    /// available.
    pub async fn claim_job(
        &self,
        id: JobId,
        owner: &str,
        lease: Duration,
    ) -> Result<Option<Job>, StoreError> {
        let job = self.store.claim_job(id, owner, lease).await?;
        if let Some(job) = &job {
            self.count(|m| &m.jobs_claimed_total, &job.queue_name);
        }
        Ok(job)
    }

    /// Extends the lease `owner` holds on a job to `now + lease`.
    ///
    /// Returns `false` if the lease was already lost.
    pub async fn heartbeat(
        &self,
        id: JobId,
        owner: &str,
        lease: Duration,
    ) -> Result<bool, StoreError> {
        self.store.extend_lease(id, owner, lease).await
    }

    /// Clears the leases of up to `limit` jobs whose lease has expired,
    /// leaving their attempt counters untouched.
    ///
    /// A `limit` of zero or less means [DEFAULT_RECOVERY_LIMIT].
    #[instrument(skip(self))]
    pub async fn recover_expired_leases(&self, limit: i64) -> Result<u64, StoreError> {
        let limit = if limit > 0 {
            limit
        } else {
            DEFAULT_RECOVERY_LIMIT
        };

        let recovered = self.store.release_expired_leases(limit).await?;
        if recovered > 0 {
            info!(recovered, "Recovered jobs with expired leases");
            if let Some(metrics) = &self.metrics {
                metrics.jobs_recovered_total.inc_by(recovered);
            }
        }
        Ok(recovered)
    }

    /// Submits a finished job again as a fresh active job.
    ///
    /// The new job starts with zero attempts and `max_attempts` (or the
    /// budget of the finished job). Returns `None` if there is no history
    /// row with this ID.
    #[instrument(skip(self))]
    pub async fn requeue_from_history(
        &self,
        id: JobId,
        max_attempts: Option<i32>,
    ) -> Result<Option<Enqueued>, EnqueueError> {
        let Some(history) = self.store.find_history(id).await? else {
            return Ok(None);
        };

        let request = EnqueueRequest::builder()
            .queue_name(history.queue_name)
            .priority(history.priority)
            .maybe_unique_key(history.unique_key)
            .payload(history.payload)
            .max_attempts(max_attempts.unwrap_or(history.max_attempts))
            .build();

        let enqueued = self.enqueue(&request).await?;
        info!(new_job.id = enqueued.id, "Requeued job from history");
        Ok(Some(enqueued))
    }

    /// Deletes an active job that is not currently leased.
    #[instrument(skip(self))]
    pub async fn remove(&self, id: JobId) -> Result<bool, StoreError> {
        self.store.remove_job(id).await
    }

    /// Moves an active job to the history table as `dead_letter`, whether or
    /// not a worker currently holds its lease.
    #[instrument(skip(self, reason))]
    pub async fn dead_letter(&self, id: JobId, reason: &Value) -> Result<bool, StoreError> {
        let Some(job) = self.store.find_job(id).await? else {
            return Ok(false);
        };

        let moved = self.store.dead_letter_job(id, reason).await?;
        if moved {
            warn!(job.queue = %job.queue_name, "Job was dead-lettered manually");
            self.count(|m| &m.jobs_dead_lettered_total, &job.queue_name);
        }
        Ok(moved)
    }

    pub async fn job(&self, id: JobId) -> Result<Option<Job>, StoreError> {
        self.store.find_job(id).await
    }

    pub async fn history(&self, id: JobId) -> Result<Option<JobHistory>, StoreError> {
        self.store.find_history(id).await
    }

    pub async fn list_jobs(&self, queue_name: &str, limit: i64) -> Result<Vec<Job>, StoreError> {
        self.store.list_jobs(queue_name, limit).await
    }

    pub async fn list_history(&self, filter: &HistoryFilter) -> Result<Vec<JobHistory>, StoreError> {
        self.store.list_history(filter).await
    }

    pub async fn queue_stats(&self, queue_name: &str) -> Result<QueueStats, StoreError> {
        self.store.queue_stats(queue_name).await
    }
}
