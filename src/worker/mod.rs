//! Claims jobs from the store and runs them through a [Handler].
//!
//! A worker runs a single polling loop that claims a job whenever one of
//! its `concurrency` slots is free, and one task per claimed job. Every
//! running job has its lease extended in the background until its handler
//! returns.

use crate::backoff::Backoff;
use crate::client::Client;
use crate::config::WorkerConfig;
use crate::errors::{ConfigError, DeliveryFailure};
use crate::job::Job;
use crate::store::Store;
use crate::util::{try_to_extract_panic_info, with_sentry_transaction};
use futures_util::FutureExt;
use sentry_core::{Hub, SentryFutureExt};
use serde::Serialize;
use serde_json::Value;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{Instrument, debug, error, info, info_span, warn};

mod handler;
mod heartbeat;

pub use self::handler::{Handler, HandlerFn, JobContext, handler_fn};
use self::heartbeat::{LeaseRegistry, Renewal};

pub struct Worker<S: Store, H> {
    client: Client<S>,
    config: WorkerConfig,
    handler: Arc<H>,
    shutdown_when_queue_empty: bool,
}

impl<S: Store, H: Handler<S>> Worker<S, H> {
    pub fn new(client: Client<S>, config: WorkerConfig, handler: H) -> Result<Self, ConfigError> {
        config.validate()?;

        Ok(Self {
            client,
            config,
            handler: Arc::new(handler),
            shutdown_when_queue_empty: false,
        })
    }

    /// Stop polling once no job is eligible and no job is running.
    pub fn shutdown_when_queue_empty(mut self) -> Self {
        self.shutdown_when_queue_empty = true;
        self
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// Spawns the polling loop onto the current tokio runtime.
    pub fn start(self) -> WorkerHandle {
        let shutdown = CancellationToken::new();
        let tracker = TaskTracker::new();
        let leases = LeaseRegistry::default();
        let shutdown_timeout = self.config.shutdown_timeout;

        let span = info_span!("worker", worker.id = %self.config.worker_id);
        info!(parent: &span, queues = ?self.config.queues, "Starting worker…");

        let poll_loop = PollLoop {
            slots: Arc::new(Semaphore::new(self.config.concurrency)),
            client: self.client,
            config: self.config,
            handler: self.handler,
            shutdown: shutdown.clone(),
            tracker: tracker.clone(),
            leases: leases.clone(),
            shutdown_when_queue_empty: self.shutdown_when_queue_empty,
        };

        let poll_loop = tokio::spawn(poll_loop.run().instrument(span));

        WorkerHandle {
            shutdown,
            tracker,
            leases,
            poll_loop,
            shutdown_timeout,
        }
    }
}

impl<S: Store, H> std::fmt::Debug for Worker<S, H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("config", &self.config)
            .field("shutdown_when_queue_empty", &self.shutdown_when_queue_empty)
            .finish_non_exhaustive()
    }
}

struct PollLoop<S: Store, H> {
    client: Client<S>,
    config: WorkerConfig,
    handler: Arc<H>,
    slots: Arc<Semaphore>,
    shutdown: CancellationToken,
    tracker: TaskTracker,
    leases: LeaseRegistry,
    shutdown_when_queue_empty: bool,
}

impl<S: Store, H: Handler<S>> PollLoop<S, H> {
    async fn run(self) {
        loop {
            let permit = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                permit = self.slots.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let claimed = self
                .client
                .claim_next(&self.config.queues, &self.config.worker_id, self.config.lease)
                .await;

            match claimed {
                Ok(Some(job)) => self.dispatch(job, permit),
                Ok(None) if self.shutdown_when_queue_empty && self.tracker.is_empty() => {
                    debug!("No eligible jobs found. Shutting down the worker…");
                    break;
                }
                Ok(None) => {
                    drop(permit);
                    debug!(
                        "No eligible jobs found. Polling again in {:?}…",
                        self.config.poll_interval
                    );

                    let store = self.client.store();
                    tokio::select! {
                        _ = self.shutdown.cancelled() => break,
                        _ = store.wait_for_job(self.config.poll_interval) => {}
                    }
                }
                Err(error) => {
                    drop(permit);
                    error!("Failed to claim job: {error}");

                    tokio::select! {
                        _ = self.shutdown.cancelled() => break,
                        _ = sleep(self.config.poll_interval) => {}
                    }
                }
            }
        }

        debug!("Polling loop stopped");
    }

    fn dispatch(&self, job: Job, permit: OwnedSemaphorePermit) {
        let span = info_span!("job", job.id = job.id, job.queue = %job.queue_name);

        let token = self.shutdown.child_token();
        let renewal = Renewal {
            owner: self.config.worker_id.clone(),
            lease: self.config.lease,
            every: self.config.heartbeat_every,
        };
        let renewal = span.in_scope(|| {
            let client = self.client.clone();
            self.leases.start(client, &job, renewal, token.clone())
        });

        let ctx = JobContext::new(self.client.clone(), job.clone(), token, self.config.backoff);
        let client = self.client.clone();
        let handler = self.handler.clone();
        let backoff = self.config.backoff;

        self.tracker.spawn(
            async move {
                let _permit = permit;
                if let Some(metrics) = client.metrics() {
                    metrics.jobs_in_flight.inc();
                }

                debug!(attempts = job.attempts, "Running job…");
                let queue_name = job.queue_name.clone();
                let result = with_sentry_transaction(&queue_name, || async {
                    AssertUnwindSafe(handler.handle(ctx.clone(), job.clone()))
                        .catch_unwind()
                        .await
                        .map_err(|e| DeliveryFailure::from_panic(try_to_extract_panic_info(&*e)))
                        .and_then(|result| result.map_err(|e| DeliveryFailure::from_error(&e)))
                })
                .bind_hub(Hub::current())
                .await;

                drop(renewal);

                if ctx.is_disposed() {
                    debug!("Job was disposed by its handler");
                } else {
                    dispose(&client, &job, &backoff, result).await;
                }

                if let Some(metrics) = client.metrics() {
                    metrics.jobs_in_flight.dec();
                }
            }
            .instrument(span),
        );
    }
}

async fn dispose<S: Store>(
    client: &Client<S>,
    job: &Job,
    backoff: &Backoff,
    result: Result<Value, DeliveryFailure>,
) {
    match result {
        Ok(result) => match client.ack_now(job, &result).await {
            Ok(()) => debug!("Job completed"),
            // Already logged and counted by the client.
            Err(error) if error.is_lease_conflict() => {}
            Err(error) => error!("Failed to acknowledge job: {error}"),
        },
        Err(failure) => {
            warn!(panicked = failure.panicked, "Failed to run job: {failure}");
            match client.nack_now(job, backoff, &failure.to_payload()).await {
                Ok(_) => {}
                Err(error) if error.is_lease_conflict() => {}
                Err(error) => error!("Failed to record failed delivery: {error}"),
            }
        }
    }
}

/// Handle to a running [Worker].
#[derive(Debug)]
pub struct WorkerHandle {
    shutdown: CancellationToken,
    tracker: TaskTracker,
    leases: LeaseRegistry,
    poll_loop: JoinHandle<()>,
    shutdown_timeout: Duration,
}

/// How the jobs that were running when a worker stopped ended up.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ShutdownReport {
    /// Jobs whose handlers returned within the shutdown timeout.
    pub finished: usize,
    /// Jobs whose handlers were still running when the timeout elapsed. Their
    /// leases are no longer renewed and lapse on their own.
    pub abandoned: usize,
}

impl ShutdownReport {
    pub fn is_clean(&self) -> bool {
        self.abandoned == 0
    }
}

impl WorkerHandle {
    /// Number of jobs currently being handled.
    pub fn in_flight(&self) -> usize {
        self.tracker.len()
    }

    /// Cancels all running handlers, stops claiming jobs and waits up to the
    /// shutdown timeout for the running handlers to return.
    pub async fn stop(mut self) -> ShutdownReport {
        info!("Stopping worker…");
        self.shutdown.cancel();
        self.stop_polling().await;

        let running = self.tracker.len();
        match timeout(self.shutdown_timeout, self.tracker.wait()).await {
            Ok(()) => {
                info!(finished = running, "Worker stopped");
                ShutdownReport {
                    finished: running,
                    abandoned: 0,
                }
            }
            Err(_) => {
                let abandoned = self.tracker.len();
                self.leases.abort_all();
                warn!(abandoned, "Shutdown timeout elapsed, abandoning running jobs");
                ShutdownReport {
                    finished: running.saturating_sub(abandoned),
                    abandoned,
                }
            }
        }
    }

    /// Waits for the worker to stop on its own, which only happens for
    /// workers started with [Worker::shutdown_when_queue_empty].
    pub async fn wait_for_shutdown(mut self) -> ShutdownReport {
        self.stop_polling().await;

        let running = self.tracker.len();
        self.tracker.wait().await;
        ShutdownReport {
            finished: running,
            abandoned: 0,
        }
    }

    async fn stop_polling(&mut self) {
        if let Err(error) = (&mut self.poll_loop).await {
            error!("Worker polling loop failed: {error}");
        }
        self.tracker.close();
    }
}
