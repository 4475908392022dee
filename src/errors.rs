use crate::job::JobId;
use diesel_async::pooled_connection::deadpool::PoolError;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::time::Duration;

/// The enqueue request itself is malformed. Retrying it will not help.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProducerError {
    #[error("queue name must not be empty")]
    EmptyQueueName,

    #[error("max_attempts must be at least 1, got {0}")]
    InvalidMaxAttempts(i32),

    #[error("unique key must not be empty, omit it to disable deduplication")]
    EmptyUniqueKey,
}

/// An error occurred talking to the job store
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum StoreError {
    #[error(transparent)]
    Database(#[from] diesel::result::Error),

    /// No connection could be checked out of the pool
    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error(transparent)]
    Serialization(#[from] serde_json::Error),

    /// The active job holding a unique key kept disappearing between the
    /// conflicting insert and the lookup of the existing row.
    #[error("unique key {unique_key:?} on queue {queue_name:?} is contended")]
    Contended {
        queue_name: String,
        unique_key: String,
    },
}

/// An error occurred queueing the job
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum EnqueueError {
    #[error(transparent)]
    Producer(#[from] ProducerError),

    /// An error occurred serializing the job
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),

    /// An error occurred inserting the job into the store
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// An error occurred acknowledging, failing or otherwise finalizing a job
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum DisposeError {
    /// The caller no longer holds the lease on the job. The lease expired
    /// and was taken over by another worker, or the job was already
    /// finalized.
    #[error("lease on job {job_id} is no longer held by this worker")]
    LeaseConflict { job_id: JobId },

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl DisposeError {
    pub fn is_lease_conflict(&self) -> bool {
        matches!(self, DisposeError::LeaseConflict { .. })
    }
}

/// Invalid worker or reaper configuration
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("at least one queue must be configured")]
    NoQueues,

    #[error("queue names must not be blank")]
    BlankQueueName,

    #[error("worker id must not be empty")]
    EmptyWorkerId,

    #[error("concurrency must be at least 1")]
    ZeroConcurrency,

    #[error("{0} must be greater than zero")]
    ZeroDuration(&'static str),

    #[error("heartbeat interval ({heartbeat:?}) must be shorter than the lease ({lease:?})")]
    HeartbeatNotShorterThanLease { heartbeat: Duration, lease: Duration },

    #[error("backoff jitter must be within 0 and 1, got {0}")]
    InvalidJitter(f64),

    #[error("batch size must be at least 1")]
    ZeroBatchSize,
}

/// A handler reported an error or panicked while processing a job.
///
/// This is ordinary data. It ends up as the error payload of the failed
/// delivery, `{"error": "...", "panicked": false}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{error}")]
pub struct DeliveryFailure {
    pub error: String,
    pub panicked: bool,
}

impl DeliveryFailure {
    pub fn from_error(error: &anyhow::Error) -> Self {
        DeliveryFailure {
            error: format!("{error:#}"),
            panicked: false,
        }
    }

    pub fn from_panic(message: impl Into<String>) -> Self {
        DeliveryFailure {
            error: message.into(),
            panicked: true,
        }
    }

    pub fn to_payload(&self) -> Value {
        json!({ "error": self.error, "panicked": self.panicked })
    }
}
