use crate::backoff::Backoff;
use crate::clock::{self, Clock, SystemClock};
use crate::errors::StoreError;
use crate::job::{
    EnqueueRequest, Enqueued, FinalStatus, HistoryFilter, Job, JobHistory, JobId,
    MANUAL_PROCESSOR, MAX_LIST_LIMIT, QueueStats,
};
use crate::store::{FailOutcome, Session, Store};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, MutexGuard};
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

/// An in-process [Store], mainly useful for tests.
///
/// Sessions lock the rows they touch until they are committed or rolled
/// back, just like row locks in a relational store: claims skip locked rows
/// and other writers wait for them.
#[derive(Debug, Clone)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    clock: Arc<dyn Clock>,
    state: Mutex<State>,
    /// Signalled when a job is inserted or becomes eligible again.
    ready: Notify,
    /// Signalled when a session releases its row locks or unique keys.
    unlocked: Notify,
}

#[derive(Debug, Default)]
struct State {
    next_id: JobId,
    jobs: BTreeMap<JobId, Job>,
    history: BTreeMap<JobId, JobHistory>,
    locked: HashSet<JobId>,
    /// `(queue_name, unique_key)` of jobs inserted by uncommitted sessions.
    reserved: HashSet<UniqueKey>,
}

type UniqueKey = (String, String);

fn unique_key(request: &EnqueueRequest) -> Option<UniqueKey> {
    let key = request.unique_key.as_ref()?;
    Some((request.queue_name.clone(), key.clone()))
}

impl State {
    fn next_id(&mut self) -> JobId {
        self.next_id += 1;
        self.next_id
    }

    fn active_job_with_key(&self, (queue_name, key): &UniqueKey) -> Option<JobId> {
        self.jobs
            .values()
            .find(|job| &job.queue_name == queue_name && job.unique_key.as_ref() == Some(key))
            .map(|job| job.id)
    }

    fn new_job(&mut self, request: &EnqueueRequest, now: DateTime<Utc>) -> Job {
        Job {
            id: self.next_id(),
            queue_name: request.queue_name.clone(),
            priority: request.priority,
            payload: request.payload.clone(),
            unique_key: request.unique_key.clone(),
            attempts: 0,
            max_attempts: request.max_attempts,
            available_at: clock::add(now, request.delay),
            lease_owner: None,
            lease_until: None,
            started_at: None,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn finish(
        &mut self,
        id: JobId,
        status: FinalStatus,
        result: Value,
        processed_by: String,
        now: DateTime<Utc>,
    ) {
        if let Some(job) = self.jobs.remove(&id) {
            let history = JobHistory::finish(job, status, result, processed_by, now);
            self.history.insert(id, history);
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        MemoryStore::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_clock(SystemClock)
    }

    pub fn with_clock(clock: impl Clock) -> Self {
        let inner = Inner {
            clock: Arc::new(clock),
            state: Mutex::new(State::default()),
            ready: Notify::new(),
            unlocked: Notify::new(),
        };

        MemoryStore {
            inner: Arc::new(inner),
        }
    }

    fn now(&self) -> DateTime<Utc> {
        self.inner.clock.now()
    }

    /// Locks the store state once `available` holds for it, waiting for
    /// sessions to release their locks in between.
    async fn lock_when(&self, available: impl Fn(&State) -> bool) -> MutexGuard<'_, State> {
        loop {
            let unlocked = self.inner.unlocked.notified();
            {
                let state = self.inner.state.lock();
                if available(&state) {
                    return state;
                }
            }
            unlocked.await;
        }
    }

    /// Locks the store state once no session holds a row lock on `id`.
    async fn lock_unlocked_row(&self, id: JobId) -> MutexGuard<'_, State> {
        self.lock_when(|state| !state.locked.contains(&id)).await
    }

    /// Locks the store state once no uncommitted session has inserted a job
    /// with the unique key of `request`.
    async fn lock_unreserved_key(&self, key: Option<&UniqueKey>) -> MutexGuard<'_, State> {
        self.lock_when(|state| key.is_none_or(|key| !state.reserved.contains(key)))
            .await
    }

    fn claim(&self, state: &mut State, id: JobId, owner: &str, lease: Duration) -> Option<Job> {
        let now = self.now();
        let job = state.jobs.get_mut(&id)?;
        job.lease_owner = Some(owner.to_string());
        job.lease_until = Some(clock::add(now, lease));
        job.started_at.get_or_insert(now);
        job.updated_at = now;
        Some(job.clone())
    }
}

#[async_trait]
impl Store for MemoryStore {
    type Session = MemorySession;

    async fn begin(&self) -> Result<MemorySession, StoreError> {
        Ok(MemorySession {
            store: self.clone(),
            locked: Vec::new(),
            reserved: Vec::new(),
            staged: Vec::new(),
        })
    }

    async fn insert_job(&self, request: &EnqueueRequest) -> Result<Enqueued, StoreError> {
        let key = unique_key(request);
        let mut state = self.lock_unreserved_key(key.as_ref()).await;
        let now = self.now();

        if let Some(id) = key.as_ref().and_then(|key| state.active_job_with_key(key)) {
            return Ok(Enqueued { id, existed: true });
        }

        let job = state.new_job(request, now);
        let id = job.id;
        state.jobs.insert(id, job);
        drop(state);

        self.inner.ready.notify_waiters();
        Ok(Enqueued { id, existed: false })
    }

    async fn claim_next(
        &self,
        queues: &[String],
        owner: &str,
        lease: Duration,
    ) -> Result<Option<Job>, StoreError> {
        let now = self.now();
        let mut state = self.inner.state.lock();

        let next = state
            .jobs
            .values()
            .filter(|job| queues.contains(&job.queue_name))
            .filter(|job| job.is_eligible(now) && !state.locked.contains(&job.id))
            .min_by_key(|job| (std::cmp::Reverse(job.priority), job.available_at, job.id))
            .map(|job| job.id);

        Ok(next.and_then(|id| self.claim(&mut state, id, owner, lease)))
    }

    async fn claim_job(
        &self,
        id: JobId,
        owner: &str,
        lease: Duration,
    ) -> Result<Option<Job>, StoreError> {
        let now = self.now();
        let mut state = self.inner.state.lock();

        let claimable = state.jobs.get(&id).is_some_and(|job| job.is_eligible(now))
            && !state.locked.contains(&id);
        if !claimable {
            return Ok(None);
        }

        Ok(self.claim(&mut state, id, owner, lease))
    }

    async fn extend_lease(
        &self,
        id: JobId,
        owner: &str,
        lease: Duration,
    ) -> Result<bool, StoreError> {
        let mut state = self.lock_unlocked_row(id).await;
        let now = self.now();

        let Some(job) = state.jobs.get_mut(&id) else {
            return Ok(false);
        };
        if !job.is_leased_by(owner, now) {
            return Ok(false);
        }

        job.lease_until = Some(clock::add(now, lease));
        job.updated_at = now;
        Ok(true)
    }

    async fn release_expired_leases(&self, limit: i64) -> Result<u64, StoreError> {
        let now = self.now();
        let mut state = self.inner.state.lock();
        let state = &mut *state;

        let mut released = 0;
        let expired = state.jobs.values_mut().filter(|job| {
            job.lease_until.is_some_and(|until| until < now) && !state.locked.contains(&job.id)
        });
        for job in expired.take(usize::try_from(limit).unwrap_or_default()) {
            job.lease_owner = None;
            job.lease_until = None;
            job.updated_at = now;
            released += 1;
        }

        if released > 0 {
            self.inner.ready.notify_waiters();
        }
        Ok(released)
    }

    async fn find_job(&self, id: JobId) -> Result<Option<Job>, StoreError> {
        Ok(self.inner.state.lock().jobs.get(&id).cloned())
    }

    async fn find_history(&self, id: JobId) -> Result<Option<JobHistory>, StoreError> {
        Ok(self.inner.state.lock().history.get(&id).cloned())
    }

    async fn list_jobs(&self, queue_name: &str, limit: i64) -> Result<Vec<Job>, StoreError> {
        let state = self.inner.state.lock();

        let mut jobs = state
            .jobs
            .values()
            .filter(|job| job.queue_name == queue_name)
            .cloned()
            .collect::<Vec<_>>();
        jobs.sort_by_key(|job| (std::cmp::Reverse(job.priority), job.available_at, job.id));
        jobs.truncate(list_limit(limit));

        Ok(jobs)
    }

    async fn list_history(&self, filter: &HistoryFilter) -> Result<Vec<JobHistory>, StoreError> {
        let state = self.inner.state.lock();

        let mut rows = state
            .history
            .values()
            .filter(|row| {
                filter
                    .queue_name
                    .as_ref()
                    .is_none_or(|queue_name| &row.queue_name == queue_name)
            })
            .filter(|row| filter.status.is_none_or(|status| row.status_final == status))
            .cloned()
            .collect::<Vec<_>>();
        rows.sort_by_key(|row| std::cmp::Reverse((row.finished_at, row.id)));
        rows.truncate(list_limit(filter.limit));

        Ok(rows)
    }

    async fn queue_stats(&self, queue_name: &str) -> Result<QueueStats, StoreError> {
        let now = self.now();
        let state = self.inner.state.lock();

        let mut stats = QueueStats::default();
        for job in state.jobs.values().filter(|j| j.queue_name == queue_name) {
            match job.lease_until {
                Some(until) if until >= now => stats.leased += 1,
                Some(_) => stats.expired += 1,
                None if job.available_at <= now => stats.pending += 1,
                None => stats.delayed += 1,
            }
        }
        for row in state.history.values().filter(|r| r.queue_name == queue_name) {
            match row.status_final {
                FinalStatus::Completed => stats.completed += 1,
                FinalStatus::DeadLetter => stats.dead_lettered += 1,
            }
        }

        Ok(stats)
    }

    async fn remove_job(&self, id: JobId) -> Result<bool, StoreError> {
        let mut state = self.lock_unlocked_row(id).await;
        let now = self.now();

        let removable = state.jobs.get(&id).is_some_and(|job| !job.is_leased(now));
        if removable {
            state.jobs.remove(&id);
        }

        Ok(removable)
    }

    async fn dead_letter_job(&self, id: JobId, reason: &Value) -> Result<bool, StoreError> {
        let mut state = self.lock_unlocked_row(id).await;
        let now = self.now();

        if !state.jobs.contains_key(&id) {
            return Ok(false);
        }

        let processed_by = MANUAL_PROCESSOR.to_string();
        state.finish(id, FinalStatus::DeadLetter, reason.clone(), processed_by, now);
        Ok(true)
    }

    async fn wait_for_job(&self, timeout: Duration) {
        let _ = tokio::time::timeout(timeout, self.inner.ready.notified()).await;
    }
}

fn list_limit(limit: i64) -> usize {
    usize::try_from(limit.clamp(0, MAX_LIST_LIMIT)).unwrap_or_default()
}

#[derive(Debug)]
enum Staged {
    Insert(Job),
    Finish {
        id: JobId,
        status: FinalStatus,
        attempts: i32,
        result: Value,
        processed_by: String,
    },
    Reschedule {
        id: JobId,
        attempts: i32,
        available_at: DateTime<Utc>,
        error: Value,
    },
}

/// A [Session] on a [MemoryStore].
///
/// Dispositions are staged and applied atomically on commit.
#[derive(Debug)]
pub struct MemorySession {
    store: MemoryStore,
    locked: Vec<JobId>,
    reserved: Vec<UniqueKey>,
    staged: Vec<Staged>,
}

impl MemorySession {
    /// Row-locks `job` for this session if its lease is still held.
    async fn lock_leased(&mut self, job: &Job) -> Option<(Job, DateTime<Utc>)> {
        let owner = job.lease_owner.as_deref()?;

        // The row was already disposed earlier in this session.
        if self.locked.contains(&job.id) {
            return None;
        }

        let mut state = self.store.lock_unlocked_row(job.id).await;
        let now = self.store.now();

        let current = state.jobs.get(&job.id)?;
        if !current.is_leased_by(owner, now) {
            return None;
        }

        let current = current.clone();
        state.locked.insert(job.id);
        drop(state);

        self.locked.push(job.id);
        Some((current, now))
    }

    /// A job inserted earlier in this session with the unique key `key`.
    fn staged_job_with_key(&self, (queue_name, key): &UniqueKey) -> Option<JobId> {
        self.staged.iter().find_map(|staged| match staged {
            Staged::Insert(job)
                if &job.queue_name == queue_name && job.unique_key.as_ref() == Some(key) =>
            {
                Some(job.id)
            }
            _ => None,
        })
    }

    fn release(&mut self) {
        if self.locked.is_empty() && self.reserved.is_empty() {
            return;
        }

        let mut state = self.store.inner.state.lock();
        for id in self.locked.drain(..) {
            state.locked.remove(&id);
        }
        for key in self.reserved.drain(..) {
            state.reserved.remove(&key);
        }
        drop(state);

        self.store.inner.unlocked.notify_waiters();
    }
}

#[async_trait]
impl Session for MemorySession {
    async fn insert_job(&mut self, request: &EnqueueRequest) -> Result<Enqueued, StoreError> {
        let key = unique_key(request);

        if let Some(id) = key.as_ref().and_then(|key| self.staged_job_with_key(key)) {
            return Ok(Enqueued { id, existed: true });
        }

        let mut state = self.store.lock_unreserved_key(key.as_ref()).await;
        let now = self.store.now();

        if let Some(id) = key.as_ref().and_then(|key| state.active_job_with_key(key)) {
            return Ok(Enqueued { id, existed: true });
        }

        let job = state.new_job(request, now);
        let id = job.id;
        if let Some(key) = key {
            state.reserved.insert(key.clone());
            self.reserved.push(key);
        }
        drop(state);

        self.staged.push(Staged::Insert(job));
        Ok(Enqueued { id, existed: false })
    }

    async fn complete_job(&mut self, job: &Job, result: &Value) -> Result<bool, StoreError> {
        let Some((current, _)) = self.lock_leased(job).await else {
            return Ok(false);
        };

        self.staged.push(Staged::Finish {
            id: current.id,
            status: FinalStatus::Completed,
            attempts: current.attempts,
            result: result.clone(),
            processed_by: current.lease_owner.clone().unwrap_or_default(),
        });
        Ok(true)
    }

    async fn fail_job(
        &mut self,
        job: &Job,
        error: &Value,
        backoff: &Backoff,
    ) -> Result<Option<FailOutcome>, StoreError> {
        let Some((current, now)) = self.lock_leased(job).await else {
            return Ok(None);
        };

        let attempts = current.attempts + 1;
        if current.is_last_attempt() {
            self.staged.push(Staged::Finish {
                id: current.id,
                status: FinalStatus::DeadLetter,
                attempts,
                result: error.clone(),
                processed_by: current.lease_owner.clone().unwrap_or_default(),
            });
            return Ok(Some(FailOutcome::DeadLettered { attempts }));
        }

        let available_at = clock::add(now, backoff.delay_for(attempts));
        self.staged.push(Staged::Reschedule {
            id: current.id,
            attempts,
            available_at,
            error: error.clone(),
        });
        Ok(Some(FailOutcome::Rescheduled {
            attempts,
            available_at,
        }))
    }

    async fn commit(mut self) -> Result<(), StoreError> {
        let now = self.store.now();
        let mut ready = false;

        {
            let mut state = self.store.inner.state.lock();
            for staged in self.staged.drain(..) {
                match staged {
                    Staged::Insert(job) => {
                        state.jobs.insert(job.id, job);
                        ready = true;
                    }
                    Staged::Finish {
                        id,
                        status,
                        attempts,
                        result,
                        processed_by,
                    } => {
                        if let Some(job) = state.jobs.get_mut(&id) {
                            job.attempts = attempts;
                        }
                        state.finish(id, status, result, processed_by, now);
                    }
                    Staged::Reschedule {
                        id,
                        attempts,
                        available_at,
                        error,
                    } => {
                        if let Some(job) = state.jobs.get_mut(&id) {
                            job.attempts = attempts;
                            job.available_at = available_at;
                            job.last_error = Some(error);
                            job.lease_owner = None;
                            job.lease_until = None;
                            job.updated_at = now;
                            ready = true;
                        }
                    }
                }
            }
        }

        self.release();
        if ready {
            self.store.inner.ready.notify_waiters();
        }
        Ok(())
    }

    async fn rollback(mut self) -> Result<(), StoreError> {
        self.staged.clear();
        self.release();
        Ok(())
    }
}

impl Drop for MemorySession {
    fn drop(&mut self) {
        self.release();
    }
}
