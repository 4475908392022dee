//! Access to the tables holding active and finished jobs.
//!
//! [Store] covers everything that runs as a single statement. Dispositions
//! (`Ack`/`Nack`) go through a [Session], which is one store transaction
//! that the caller may share with its own side effects.

use crate::backoff::Backoff;
use crate::errors::StoreError;
use crate::job::{EnqueueRequest, Enqueued, HistoryFilter, Job, JobHistory, JobId, QueueStats};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::time::Duration;

mod memory;
mod postgres;

pub use self::memory::{MemorySession, MemoryStore};
pub use self::postgres::{PgSession, PgStore, run_migrations};

/// What a failed delivery did to the job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum FailOutcome {
    /// The lease was cleared and the job becomes eligible again at
    /// `available_at`.
    Rescheduled {
        attempts: i32,
        available_at: DateTime<Utc>,
    },
    /// The retry budget is exhausted and the job was moved to the history
    /// table.
    DeadLettered { attempts: i32 },
}

impl FailOutcome {
    pub fn attempts(&self) -> i32 {
        match *self {
            FailOutcome::Rescheduled { attempts, .. } => attempts,
            FailOutcome::DeadLettered { attempts } => attempts,
        }
    }

    pub fn is_dead_lettered(&self) -> bool {
        matches!(self, FailOutcome::DeadLettered { .. })
    }
}

#[async_trait]
pub trait Store: Clone + Send + Sync + 'static {
    type Session: Session;

    /// Opens a new transaction.
    async fn begin(&self) -> Result<Self::Session, StoreError>;

    /// Inserts a new, unleased job, unless an active job with the same
    /// queue name and unique key exists, in which case that job's ID is
    /// returned instead.
    async fn insert_job(&self, request: &EnqueueRequest) -> Result<Enqueued, StoreError>;

    /// Leases the highest-priority, earliest-available eligible job in any
    /// of `queues` to `owner`.
    async fn claim_next(
        &self,
        queues: &[String],
        owner: &str,
        lease: Duration,
    ) -> Result<Option<Job>, StoreError>;

    /// Leases a specific job to `owner`, if it is currently eligible.
    async fn claim_job(
        &self,
        id: JobId,
        owner: &str,
        lease: Duration,
    ) -> Result<Option<Job>, StoreError>;

    /// Pushes the lease of a job held by `owner` to `now + lease`. Returns
    /// `false` if `owner` no longer holds an unexpired lease on the job.
    async fn extend_lease(&self, id: JobId, owner: &str, lease: Duration)
    -> Result<bool, StoreError>;

    /// Clears the lease fields of up to `limit` jobs whose lease has
    /// expired. `attempts` is left untouched.
    async fn release_expired_leases(&self, limit: i64) -> Result<u64, StoreError>;

    async fn find_job(&self, id: JobId) -> Result<Option<Job>, StoreError>;

    async fn find_history(&self, id: JobId) -> Result<Option<JobHistory>, StoreError>;

    /// Active jobs of a queue, in claim order.
    async fn list_jobs(&self, queue_name: &str, limit: i64) -> Result<Vec<Job>, StoreError>;

    /// History rows matching `filter`, most recently finished first.
    async fn list_history(&self, filter: &HistoryFilter) -> Result<Vec<JobHistory>, StoreError>;

    async fn queue_stats(&self, queue_name: &str) -> Result<QueueStats, StoreError>;

    /// Deletes an active job that is not currently leased.
    async fn remove_job(&self, id: JobId) -> Result<bool, StoreError>;

    /// Moves an active job to the history table as `dead_letter`, whether
    /// or not it is leased.
    async fn dead_letter_job(&self, id: JobId, reason: &Value) -> Result<bool, StoreError>;

    /// Waits until a job might have become eligible, or `timeout` elapsed.
    async fn wait_for_job(&self, timeout: Duration) {
        tokio::time::sleep(timeout).await;
    }
}

/// One store transaction.
///
/// The disposition methods return `false`/`None` when the job is gone or
/// the lease recorded in `job` is no longer held. Nothing is persisted
/// until [Session::commit] is called; dropping a session rolls it back.
#[async_trait]
pub trait Session: Send {
    /// Inserts a job that only becomes visible to workers once the session
    /// commits. Deduplicates on `unique_key` like [`Store::insert_job`],
    /// including against jobs inserted earlier in the same session.
    async fn insert_job(&mut self, request: &EnqueueRequest) -> Result<Enqueued, StoreError>;

    /// Moves a leased job to the history table as `completed`.
    async fn complete_job(&mut self, job: &Job, result: &Value) -> Result<bool, StoreError>;

    /// Records a failed delivery of a leased job. The job is rescheduled
    /// according to `backoff`, or dead-lettered if this failure exhausts
    /// its retry budget.
    async fn fail_job(
        &mut self,
        job: &Job,
        error: &Value,
        backoff: &Backoff,
    ) -> Result<Option<FailOutcome>, StoreError>;

    async fn commit(self) -> Result<(), StoreError>;

    async fn rollback(self) -> Result<(), StoreError>;
}
