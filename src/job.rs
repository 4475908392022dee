use crate::errors::ProducerError;
use crate::schema::{job_history, jobs};
use bon::Builder;
use chrono::{DateTime, Utc};
use diesel::deserialize::{self, FromSql, FromSqlRow};
use diesel::expression::AsExpression;
use diesel::pg::{Pg, PgValue};
use diesel::prelude::*;
use diesel::serialize::{self, IsNull, Output, ToSql};
use diesel::sql_types::Text;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::io::Write;
use std::time::Duration;

pub type JobId = i64;

pub const DEFAULT_QUEUE: &str = "default";
pub const DEFAULT_MAX_ATTEMPTS: i32 = 5;

/// The `processed_by` value of jobs dead-lettered by an operator.
pub const MANUAL_PROCESSOR: &str = "manual";

/// Upper bound for the number of rows returned by the listing operations.
pub const MAX_LIST_LIMIT: i64 = 100;

/// A row of the active `jobs` table.
#[derive(
    Debug,
    Clone,
    PartialEq,
    Serialize,
    Deserialize,
    Queryable,
    QueryableByName,
    Selectable,
    Identifiable,
)]
#[diesel(table_name = jobs, check_for_backend(Pg))]
pub struct Job {
    pub id: JobId,
    pub queue_name: String,
    /// Higher priorities are claimed first.
    pub priority: i16,
    pub payload: Value,
    pub unique_key: Option<String>,
    /// Number of failed deliveries so far.
    pub attempts: i32,
    pub max_attempts: i32,
    /// The job is not eligible for a claim before this point in time.
    pub available_at: DateTime<Utc>,
    pub lease_owner: Option<String>,
    pub lease_until: Option<DateTime<Utc>>,
    /// When the job was claimed for the first time.
    pub started_at: Option<DateTime<Utc>>,
    /// Error payload of the most recent failed delivery.
    pub last_error: Option<Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// Whether a worker holds an unexpired lease on this job at `now`.
    pub fn is_leased(&self, now: DateTime<Utc>) -> bool {
        self.lease_until.is_some_and(|until| until >= now)
    }

    /// Whether a claim attempted at `now` can succeed.
    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        self.available_at <= now && !self.is_leased(now)
    }

    pub fn state(&self, now: DateTime<Utc>) -> JobState {
        if self.is_leased(now) {
            JobState::Leased
        } else {
            JobState::Pending
        }
    }

    /// Whether `owner` holds the lease on this job at `now`.
    pub fn is_leased_by(&self, owner: &str, now: DateTime<Utc>) -> bool {
        self.lease_owner.as_deref() == Some(owner) && self.is_leased(now)
    }

    /// Deserializes the payload into a typed job description.
    pub fn payload_as<T: DeserializeOwned>(&self) -> serde_json::Result<T> {
        T::deserialize(&self.payload)
    }

    /// Whether the next failed delivery exhausts the retry budget.
    pub fn is_last_attempt(&self) -> bool {
        self.attempts + 1 >= self.max_attempts
    }
}

/// The state of a job as seen from the active table.
///
/// Terminal states only exist in the history table, see [FinalStatus].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Pending,
    Leased,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, FromSqlRow, AsExpression,
)]
#[diesel(sql_type = Text)]
#[serde(rename_all = "snake_case")]
pub enum FinalStatus {
    Completed,
    DeadLetter,
}

impl FinalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FinalStatus::Completed => "completed",
            FinalStatus::DeadLetter => "dead_letter",
        }
    }
}

impl std::fmt::Display for FinalStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl ToSql<Text, Pg> for FinalStatus {
    fn to_sql<'b>(&'b self, out: &mut Output<'b, '_, Pg>) -> serialize::Result {
        out.write_all(self.as_str().as_bytes())?;
        Ok(IsNull::No)
    }
}

impl FromSql<Text, Pg> for FinalStatus {
    fn from_sql(bytes: PgValue<'_>) -> deserialize::Result<Self> {
        match bytes.as_bytes() {
            b"completed" => Ok(FinalStatus::Completed),
            b"dead_letter" => Ok(FinalStatus::DeadLetter),
            other => {
                let other = String::from_utf8_lossy(other);
                Err(format!("Unrecognized final status: {other}").into())
            }
        }
    }
}

/// A row of the `job_history` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Queryable, Selectable, Identifiable)]
#[diesel(table_name = job_history, check_for_backend(Pg))]
pub struct JobHistory {
    pub id: JobId,
    pub queue_name: String,
    pub priority: i16,
    pub unique_key: Option<String>,
    pub status_final: FinalStatus,
    pub payload: Value,
    pub result_or_error: Value,
    pub attempts: i32,
    pub max_attempts: i32,
    /// The worker that disposed the job, or [MANUAL_PROCESSOR].
    pub processed_by: String,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: DateTime<Utc>,
}

impl JobHistory {
    /// Builds the history row for `job` finishing with `status` at `now`.
    pub(crate) fn finish(
        job: Job,
        status: FinalStatus,
        result_or_error: Value,
        processed_by: String,
        now: DateTime<Utc>,
    ) -> Self {
        JobHistory {
            id: job.id,
            queue_name: job.queue_name,
            priority: job.priority,
            unique_key: job.unique_key,
            status_final: status,
            payload: job.payload,
            result_or_error,
            attempts: job.attempts,
            max_attempts: job.max_attempts,
            processed_by,
            created_at: job.created_at,
            started_at: job.started_at,
            finished_at: now,
        }
    }
}

/// A request to add a job to a queue.
///
/// ```
/// use lease_queue::EnqueueRequest;
/// use std::time::Duration;
///
/// let request = EnqueueRequest::builder()
///     .queue_name("email")
///     .priority(10)
///     .unique_key("welcome-mail-42")
///     .payload(serde_json::json!({ "user_id": 42 }))
///     .delay(Duration::from_secs(60))
///     .build();
///
/// assert_eq!(request.max_attempts, 5);
/// ```
#[derive(Debug, Clone, PartialEq, Builder)]
pub struct EnqueueRequest {
    #[builder(into)]
    pub queue_name: String,
    #[builder(default)]
    pub priority: i16,
    /// Re-submitting with the same key while the first job is still
    /// active returns the first job instead of inserting a new one.
    #[builder(into)]
    pub unique_key: Option<String>,
    #[builder(default = Value::Null)]
    pub payload: Value,
    #[builder(default = DEFAULT_MAX_ATTEMPTS)]
    pub max_attempts: i32,
    /// The job becomes eligible for a claim this long after it was enqueued.
    #[builder(default)]
    pub delay: Duration,
}

impl EnqueueRequest {
    pub fn validate(&self) -> Result<(), ProducerError> {
        if self.queue_name.trim().is_empty() {
            return Err(ProducerError::EmptyQueueName);
        }

        if self.max_attempts < 1 {
            return Err(ProducerError::InvalidMaxAttempts(self.max_attempts));
        }

        if self.unique_key.as_deref().is_some_and(|key| key.is_empty()) {
            return Err(ProducerError::EmptyUniqueKey);
        }

        Ok(())
    }
}

/// The result of a successful enqueue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Enqueued {
    pub id: JobId,
    /// `true` if an active job with the same unique key already existed and
    /// nothing was inserted.
    pub existed: bool,
}

/// Selection criteria for listing history rows, newest first.
#[derive(Debug, Clone, Builder)]
pub struct HistoryFilter {
    #[builder(into)]
    pub queue_name: Option<String>,
    pub status: Option<FinalStatus>,
    #[builder(default = MAX_LIST_LIMIT)]
    pub limit: i64,
}

impl Default for HistoryFilter {
    fn default() -> Self {
        HistoryFilter::builder().build()
    }
}

/// A point-in-time summary of one queue.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    /// Unleased jobs that can be claimed right now.
    pub pending: i64,
    /// Unleased jobs whose `available_at` lies in the future.
    pub delayed: i64,
    /// Jobs with an unexpired lease.
    pub leased: i64,
    /// Jobs whose lease has lapsed without a disposition.
    pub expired: i64,
    pub completed: i64,
    pub dead_lettered: i64,
}
