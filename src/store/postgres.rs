use crate::backoff::Backoff;
use crate::errors::StoreError;
use crate::job::{
    EnqueueRequest, Enqueued, FinalStatus, HistoryFilter, Job, JobHistory, JobId,
    MANUAL_PROCESSOR, MAX_LIST_LIMIT, QueueStats,
};
use crate::schema::{job_history, jobs};
use crate::store::{FailOutcome, Session, Store};
use crate::util::spawn_blocking;
use anyhow::anyhow;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use diesel::pg::data_types::PgInterval;
use diesel::prelude::*;
use diesel::sql_query;
use diesel::sql_types::{
    Array, BigInt, Int2, Int4, Int8, Interval, Jsonb, Nullable, Text, Timestamptz,
};
use diesel_async::async_connection_wrapper::AsyncConnectionWrapper;
use diesel_async::pooled_connection::deadpool::{Object, Pool};
use diesel_async::{
    AnsiTransactionManager, AsyncConnection, AsyncPgConnection, RunQueryDsl, TransactionManager,
};
use diesel_migrations::{EmbeddedMigrations, MigrationHarness, embed_migrations};
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, info, instrument};

pub const MIGRATIONS: EmbeddedMigrations = embed_migrations!("./migrations");

/// How often an enqueue is retried when the job holding its unique key is
/// finalized between the conflicting insert and the lookup.
const MAX_DEDUPE_ROUNDS: usize = 3;

/// A [Store] backed by the `jobs` and `job_history` Postgres tables.
///
/// All lease math uses the database clock.
#[derive(Clone)]
pub struct PgStore {
    pool: Pool<AsyncPgConnection>,
}

impl PgStore {
    pub fn new(pool: Pool<AsyncPgConnection>) -> Self {
        PgStore { pool }
    }

    pub fn pool(&self) -> &Pool<AsyncPgConnection> {
        &self.pool
    }

    async fn connection(&self) -> Result<Object<AsyncPgConnection>, StoreError> {
        Ok(self.pool.get().await?)
    }
}

impl std::fmt::Debug for PgStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let status = self.pool.status();
        f.debug_struct("PgStore")
            .field("pool_size", &status.size)
            .field("pool_available", &status.available)
            .finish()
    }
}

/// Applies all pending migrations in `migrations/` to the database at
/// `database_url`.
pub async fn run_migrations(database_url: &str) -> anyhow::Result<()> {
    let conn = AsyncPgConnection::establish(database_url).await?;
    let mut conn = AsyncConnectionWrapper::<AsyncPgConnection>::from(conn);

    spawn_blocking(move || {
        info!("Migrating the database");
        conn.run_pending_migrations(MIGRATIONS)
            .map_err(|err| anyhow!("Failed to run migrations: {err}"))?;

        Ok(())
    })
    .await
}

fn interval(duration: Duration) -> PgInterval {
    let micros = i64::try_from(duration.as_micros()).unwrap_or(i64::MAX);
    PgInterval::from_microseconds(micros)
}

#[derive(QueryableByName)]
struct InsertedId {
    #[diesel(sql_type = Int8)]
    id: JobId,
}

#[derive(QueryableByName)]
struct Rescheduled {
    #[diesel(sql_type = Timestamptz)]
    available_at: DateTime<Utc>,
}

#[derive(QueryableByName)]
struct ActiveCounts {
    #[diesel(sql_type = BigInt)]
    pending: i64,
    #[diesel(sql_type = BigInt)]
    delayed: i64,
    #[diesel(sql_type = BigInt)]
    leased: i64,
    #[diesel(sql_type = BigInt)]
    expired: i64,
}

#[derive(QueryableByName)]
struct FinishedCounts {
    #[diesel(sql_type = BigInt)]
    completed: i64,
    #[diesel(sql_type = BigInt)]
    dead_lettered: i64,
}

/// Moves the job selected by the `moved` CTE into the history table. `$2`
/// is the result payload, `$3` the final status. The CTE also has to return
/// a `processed_by` column.
const MOVE_TO_HISTORY: &str = r#"
    INSERT INTO job_history (id, queue_name, priority, unique_key, status_final, payload,
                             result_or_error, attempts, max_attempts, processed_by,
                             created_at, started_at, finished_at)
    SELECT id, queue_name, priority, unique_key, $3, payload,
           $2, attempts, max_attempts, processed_by,
           created_at, started_at, statement_timestamp()
    FROM moved
"#;

async fn insert_job(
    conn: &mut AsyncPgConnection,
    request: &EnqueueRequest,
) -> QueryResult<Option<JobId>> {
    let inserted = sql_query(
        r#"
        INSERT INTO jobs (queue_name, priority, unique_key, payload, max_attempts, available_at)
        VALUES ($1, $2, $3, $4, $5, now() + $6)
        ON CONFLICT (queue_name, unique_key) WHERE unique_key IS NOT NULL DO NOTHING
        RETURNING id
        "#,
    )
    .bind::<Text, _>(&request.queue_name)
    .bind::<Int2, _>(request.priority)
    .bind::<Nullable<Text>, _>(request.unique_key.as_deref())
    .bind::<Jsonb, _>(&request.payload)
    .bind::<Int4, _>(request.max_attempts)
    .bind::<Interval, _>(interval(request.delay))
    .get_result::<InsertedId>(conn)
    .await
    .optional()?;

    Ok(inserted.map(|row| row.id))
}

/// Inserts `request`, or finds the active job already holding its unique
/// key. Runs inside whatever transaction `conn` has open.
async fn insert_or_find(
    conn: &mut AsyncPgConnection,
    request: &EnqueueRequest,
) -> Result<Enqueued, StoreError> {
    let Some(key) = &request.unique_key else {
        let id = insert_job(conn, request).await?;
        let id = id.ok_or(diesel::result::Error::NotFound)?;
        return Ok(Enqueued { id, existed: false });
    };

    for _ in 0..MAX_DEDUPE_ROUNDS {
        if let Some(id) = insert_job(conn, request).await? {
            return Ok(Enqueued { id, existed: false });
        }

        let existing = jobs::table
            .filter(jobs::queue_name.eq(&request.queue_name))
            .filter(jobs::unique_key.eq(key))
            .select(jobs::id)
            .first::<JobId>(conn)
            .await
            .optional()?;

        if let Some(id) = existing {
            return Ok(Enqueued { id, existed: true });
        }

        debug!(unique_key = %key, "Conflicting job was finalized before the lookup, retrying…");
    }

    Err(StoreError::Contended {
        queue_name: request.queue_name.clone(),
        unique_key: key.clone(),
    })
}

#[async_trait]
impl Store for PgStore {
    type Session = PgSession;

    async fn begin(&self) -> Result<PgSession, StoreError> {
        let mut conn = self.connection().await?;
        AnsiTransactionManager::begin_transaction(&mut *conn).await?;
        Ok(PgSession { conn: Some(conn) })
    }

    async fn insert_job(&self, request: &EnqueueRequest) -> Result<Enqueued, StoreError> {
        let mut conn = self.connection().await?;
        insert_or_find(&mut conn, request).await
    }

    async fn claim_next(
        &self,
        queues: &[String],
        owner: &str,
        lease: Duration,
    ) -> Result<Option<Job>, StoreError> {
        let mut conn = self.connection().await?;

        // The outer condition repeats the eligibility check so that the
        // update is a no-op if the row changed after the subquery saw it.
        let job = sql_query(
            r#"
            UPDATE jobs
            SET lease_owner = $1,
                lease_until = now() + $2,
                started_at = COALESCE(started_at, now()),
                updated_at = now()
            WHERE id = (
                SELECT id FROM jobs
                WHERE queue_name = ANY($3)
                  AND available_at <= now()
                  AND (lease_until IS NULL OR lease_until < now())
                ORDER BY priority DESC, available_at ASC, id ASC
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            AND (lease_until IS NULL OR lease_until < now())
            RETURNING *
            "#,
        )
        .bind::<Text, _>(owner)
        .bind::<Interval, _>(interval(lease))
        .bind::<Array<Text>, _>(queues)
        .get_result::<Job>(&mut conn)
        .await
        .optional()?;

        Ok(job)
    }

    async fn claim_job(
        &self,
        id: JobId,
        owner: &str,
        lease: Duration,
    ) -> Result<Option<Job>, StoreError> {
        let mut conn = self.connection().await?;

        let job = sql_query(
            r#"
            UPDATE jobs
            SET lease_owner = $1,
                lease_until = now() + $2,
                started_at = COALESCE(started_at, now()),
                updated_at = now()
            WHERE id = $3
              AND available_at <= now()
              AND (lease_until IS NULL OR lease_until < now())
            RETURNING *
            "#,
        )
        .bind::<Text, _>(owner)
        .bind::<Interval, _>(interval(lease))
        .bind::<Int8, _>(id)
        .get_result::<Job>(&mut conn)
        .await
        .optional()?;

        Ok(job)
    }

    async fn extend_lease(
        &self,
        id: JobId,
        owner: &str,
        lease: Duration,
    ) -> Result<bool, StoreError> {
        let mut conn = self.connection().await?;

        let updated = sql_query(
            r#"
            UPDATE jobs
            SET lease_until = now() + $1, updated_at = now()
            WHERE id = $2 AND lease_owner = $3 AND lease_until >= now()
            "#,
        )
        .bind::<Interval, _>(interval(lease))
        .bind::<Int8, _>(id)
        .bind::<Text, _>(owner)
        .execute(&mut conn)
        .await?;

        Ok(updated > 0)
    }

    async fn release_expired_leases(&self, limit: i64) -> Result<u64, StoreError> {
        let mut conn = self.connection().await?;

        let released = sql_query(
            r#"
            UPDATE jobs
            SET lease_owner = NULL, lease_until = NULL, updated_at = now()
            WHERE id IN (
                SELECT id FROM jobs
                WHERE lease_until < now()
                ORDER BY lease_until
                LIMIT $1
                FOR UPDATE SKIP LOCKED
            )
            AND lease_until < now()
            "#,
        )
        .bind::<BigInt, _>(limit.max(0))
        .execute(&mut conn)
        .await?;

        Ok(released as u64)
    }

    async fn find_job(&self, id: JobId) -> Result<Option<Job>, StoreError> {
        let mut conn = self.connection().await?;

        let job = jobs::table
            .find(id)
            .select(Job::as_select())
            .first(&mut conn)
            .await
            .optional()?;

        Ok(job)
    }

    async fn find_history(&self, id: JobId) -> Result<Option<JobHistory>, StoreError> {
        let mut conn = self.connection().await?;

        let row = job_history::table
            .find(id)
            .select(JobHistory::as_select())
            .first(&mut conn)
            .await
            .optional()?;

        Ok(row)
    }

    async fn list_jobs(&self, queue_name: &str, limit: i64) -> Result<Vec<Job>, StoreError> {
        let mut conn = self.connection().await?;

        let jobs = jobs::table
            .filter(jobs::queue_name.eq(queue_name))
            .order((
                jobs::priority.desc(),
                jobs::available_at.asc(),
                jobs::id.asc(),
            ))
            .limit(limit.clamp(0, MAX_LIST_LIMIT))
            .select(Job::as_select())
            .load(&mut conn)
            .await?;

        Ok(jobs)
    }

    async fn list_history(&self, filter: &HistoryFilter) -> Result<Vec<JobHistory>, StoreError> {
        let mut conn = self.connection().await?;

        let mut query = job_history::table
            .select(JobHistory::as_select())
            .into_boxed();

        if let Some(queue_name) = &filter.queue_name {
            query = query.filter(job_history::queue_name.eq(queue_name));
        }
        if let Some(status) = filter.status {
            query = query.filter(job_history::status_final.eq(status));
        }

        let rows = query
            .order((job_history::finished_at.desc(), job_history::id.desc()))
            .limit(filter.limit.clamp(0, MAX_LIST_LIMIT))
            .load(&mut conn)
            .await?;

        Ok(rows)
    }

    async fn queue_stats(&self, queue_name: &str) -> Result<QueueStats, StoreError> {
        let mut conn = self.connection().await?;

        let active = sql_query(
            r#"
            SELECT
                count(*) FILTER (WHERE lease_until IS NULL AND available_at <= now()) AS pending,
                count(*) FILTER (WHERE lease_until IS NULL AND available_at > now()) AS delayed,
                count(*) FILTER (WHERE lease_until >= now()) AS leased,
                count(*) FILTER (WHERE lease_until < now()) AS expired
            FROM jobs
            WHERE queue_name = $1
            "#,
        )
        .bind::<Text, _>(queue_name)
        .get_result::<ActiveCounts>(&mut conn)
        .await?;

        let finished = sql_query(
            r#"
            SELECT
                count(*) FILTER (WHERE status_final = 'completed') AS completed,
                count(*) FILTER (WHERE status_final = 'dead_letter') AS dead_lettered
            FROM job_history
            WHERE queue_name = $1
            "#,
        )
        .bind::<Text, _>(queue_name)
        .get_result::<FinishedCounts>(&mut conn)
        .await?;

        Ok(QueueStats {
            pending: active.pending,
            delayed: active.delayed,
            leased: active.leased,
            expired: active.expired,
            completed: finished.completed,
            dead_lettered: finished.dead_lettered,
        })
    }

    async fn remove_job(&self, id: JobId) -> Result<bool, StoreError> {
        let mut conn = self.connection().await?;

        let deleted = sql_query(
            r#"
            DELETE FROM jobs
            WHERE id = $1 AND (lease_until IS NULL OR lease_until < now())
            "#,
        )
        .bind::<Int8, _>(id)
        .execute(&mut conn)
        .await?;

        Ok(deleted > 0)
    }

    async fn dead_letter_job(&self, id: JobId, reason: &Value) -> Result<bool, StoreError> {
        let mut conn = self.connection().await?;

        let query = format!(
            "WITH moved AS (
                DELETE FROM jobs WHERE id = $1
                RETURNING *, $4::text AS processed_by
            ) {MOVE_TO_HISTORY}"
        );
        let moved = sql_query(query)
            .bind::<Int8, _>(id)
            .bind::<Jsonb, _>(reason)
            .bind::<Text, _>(FinalStatus::DeadLetter)
            .bind::<Text, _>(MANUAL_PROCESSOR)
            .execute(&mut conn)
            .await?;

        Ok(moved > 0)
    }
}

/// A [Session] holding a pooled connection with an open transaction.
///
/// Dropping the session without committing discards the connection
/// instead of returning it to the pool, which rolls the transaction back.
pub struct PgSession {
    /// Only `None` while the session is being dropped.
    conn: Option<Object<AsyncPgConnection>>,
}

impl PgSession {
    /// The connection running this transaction. Queries issued on it commit
    /// or roll back together with the dispositions of this session.
    pub fn connection(&mut self) -> &mut AsyncPgConnection {
        match self.conn.as_deref_mut() {
            Some(conn) => conn,
            None => unreachable!("session connection taken before drop"),
        }
    }

    /// Row-locks `job` if its lease is still held, returning the current
    /// row.
    ///
    /// `now()` is frozen at the start of the transaction, so lease checks
    /// use the statement time instead.
    async fn lock_leased(&mut self, job: &Job) -> QueryResult<Option<Job>> {
        let Some(owner) = &job.lease_owner else {
            return Ok(None);
        };

        sql_query(
            r#"
            SELECT * FROM jobs
            WHERE id = $1 AND lease_owner = $2 AND lease_until >= statement_timestamp()
            FOR UPDATE
            "#,
        )
        .bind::<Int8, _>(job.id)
        .bind::<Text, _>(owner)
        .get_result::<Job>(self.connection())
        .await
        .optional()
    }

    async fn move_to_history(
        &mut self,
        job: &Job,
        status: FinalStatus,
        attempts: i32,
        result: &Value,
    ) -> QueryResult<usize> {
        let query = format!(
            "WITH moved AS (
                DELETE FROM jobs WHERE id = $1
                RETURNING id, queue_name, priority, unique_key, payload, $4::int4 AS attempts,
                          max_attempts, lease_owner AS processed_by, created_at, started_at
            ) {MOVE_TO_HISTORY}"
        );

        sql_query(query)
            .bind::<Int8, _>(job.id)
            .bind::<Jsonb, _>(result)
            .bind::<Text, _>(status)
            .bind::<Int4, _>(attempts)
            .execute(self.connection())
            .await
    }
}

#[async_trait]
impl Session for PgSession {
    #[instrument(skip_all, fields(queue_name = %request.queue_name))]
    async fn insert_job(&mut self, request: &EnqueueRequest) -> Result<Enqueued, StoreError> {
        insert_or_find(self.connection(), request).await
    }

    #[instrument(skip_all, fields(job.id = job.id))]
    async fn complete_job(&mut self, job: &Job, result: &Value) -> Result<bool, StoreError> {
        let Some(current) = self.lock_leased(job).await? else {
            return Ok(false);
        };

        let moved = self
            .move_to_history(&current, FinalStatus::Completed, current.attempts, result)
            .await?;

        Ok(moved > 0)
    }

    #[instrument(skip_all, fields(job.id = job.id))]
    async fn fail_job(
        &mut self,
        job: &Job,
        error: &Value,
        backoff: &Backoff,
    ) -> Result<Option<FailOutcome>, StoreError> {
        let Some(current) = self.lock_leased(job).await? else {
            return Ok(None);
        };

        let attempts = current.attempts + 1;
        if current.is_last_attempt() {
            self.move_to_history(&current, FinalStatus::DeadLetter, attempts, error)
                .await?;
            return Ok(Some(FailOutcome::DeadLettered { attempts }));
        }

        let delay = backoff.delay_for(attempts);
        let rescheduled = sql_query(
            r#"
            UPDATE jobs
            SET attempts = $2,
                last_error = $3,
                lease_owner = NULL,
                lease_until = NULL,
                available_at = statement_timestamp() + $4,
                updated_at = statement_timestamp()
            WHERE id = $1
            RETURNING available_at
            "#,
        )
        .bind::<Int8, _>(current.id)
        .bind::<Int4, _>(attempts)
        .bind::<Jsonb, _>(error)
        .bind::<Interval, _>(interval(delay))
        .get_result::<Rescheduled>(self.connection())
        .await?;

        Ok(Some(FailOutcome::Rescheduled {
            attempts,
            available_at: rescheduled.available_at,
        }))
    }

    async fn commit(mut self) -> Result<(), StoreError> {
        AnsiTransactionManager::commit_transaction(self.connection()).await?;
        Ok(())
    }

    async fn rollback(mut self) -> Result<(), StoreError> {
        AnsiTransactionManager::rollback_transaction(self.connection()).await?;
        Ok(())
    }
}

impl Drop for PgSession {
    fn drop(&mut self) {
        let Some(mut conn) = self.conn.take() else {
            return;
        };

        let status = AnsiTransactionManager::transaction_manager_status_mut(&mut *conn);
        if !matches!(status.transaction_depth(), Ok(None)) {
            debug!("Session dropped with an open transaction, closing its connection");
            // Closing the connection rolls the transaction back on the server.
            drop(Object::take(conn));
        }
    }
}
