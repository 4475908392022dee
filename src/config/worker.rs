//! Configuration for a worker process
//!
//! - `WORKER_QUEUES`: Comma-separated list of queues to claim jobs from.
//! - `WORKER_ID`: Identity recorded as the lease owner. Defaults to the
//!   hostname and process ID.
//! - `WORKER_CONCURRENCY`: Maximum number of jobs handled at the same time.
//! - `WORKER_LEASE_SECONDS`: Duration of a lease granted by a claim.
//! - `WORKER_HEARTBEAT_SECONDS`: Interval at which running jobs' leases are
//!   extended.
//! - `WORKER_POLL_INTERVAL_MS`: Pause before polling again when no job is
//!   eligible.
//! - `WORKER_SHUTDOWN_TIMEOUT_SECONDS`: Grace period for running jobs when
//!   the worker is stopped.
//! - `WORKER_BACKOFF_BASE_SECONDS`, `WORKER_BACKOFF_JITTER`: Exponential
//!   retry delay of failed deliveries.

use crate::backoff::Backoff;
use crate::errors::ConfigError;
use crate::job::DEFAULT_QUEUE;
use lease_queue_env_vars::{list, var, var_parsed_or};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq)]
pub struct WorkerConfig {
    pub queues: Vec<String>,
    pub worker_id: String,
    pub concurrency: usize,
    pub lease: Duration,
    pub heartbeat_every: Duration,
    pub poll_interval: Duration,
    pub shutdown_timeout: Duration,
    pub backoff: Backoff,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            queues: vec![DEFAULT_QUEUE.to_string()],
            worker_id: default_worker_id(None),
            concurrency: 4,
            lease: Duration::from_secs(30),
            heartbeat_every: Duration::from_secs(10),
            poll_interval: Duration::from_secs(1),
            shutdown_timeout: Duration::from_secs(30),
            backoff: Backoff::default(),
        }
    }
}

fn default_worker_id(hostname: Option<String>) -> String {
    let hostname = hostname.unwrap_or_else(|| "worker".to_string());
    format!("{hostname}-{}", std::process::id())
}

impl WorkerConfig {
    pub fn from_environment() -> anyhow::Result<Self> {
        let default = Self::default();

        let mut queues = list("WORKER_QUEUES")?;
        if queues.is_empty() {
            queues = default.queues;
        }

        let worker_id = match var("WORKER_ID")? {
            Some(worker_id) => worker_id,
            None => default_worker_id(var("HOSTNAME")?),
        };

        let concurrency = var_parsed_or("WORKER_CONCURRENCY", default.concurrency)?;
        let lease = var_parsed_or("WORKER_LEASE_SECONDS", default.lease.as_secs())?;
        let heartbeat =
            var_parsed_or("WORKER_HEARTBEAT_SECONDS", default.heartbeat_every.as_secs())?;
        let poll_interval = var_parsed_or(
            "WORKER_POLL_INTERVAL_MS",
            default.poll_interval.as_millis() as u64,
        )?;
        let shutdown_timeout = var_parsed_or(
            "WORKER_SHUTDOWN_TIMEOUT_SECONDS",
            default.shutdown_timeout.as_secs(),
        )?;
        let backoff_base = var_parsed_or("WORKER_BACKOFF_BASE_SECONDS", 1)?;
        let backoff_jitter = var_parsed_or("WORKER_BACKOFF_JITTER", 0.1)?;

        Ok(Self {
            queues,
            worker_id,
            concurrency,
            lease: Duration::from_secs(lease),
            heartbeat_every: Duration::from_secs(heartbeat),
            poll_interval: Duration::from_millis(poll_interval),
            shutdown_timeout: Duration::from_secs(shutdown_timeout),
            backoff: Backoff::exponential(Duration::from_secs(backoff_base), backoff_jitter),
        })
    }

    pub fn queues<I, Q>(mut self, queues: I) -> Self
    where
        I: IntoIterator<Item = Q>,
        Q: Into<String>,
    {
        self.queues = queues.into_iter().map(Into::into).collect();
        self
    }

    pub fn worker_id(mut self, worker_id: impl Into<String>) -> Self {
        self.worker_id = worker_id.into();
        self
    }

    pub fn concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn lease(mut self, lease: Duration) -> Self {
        self.lease = lease;
        self
    }

    pub fn heartbeat_every(mut self, heartbeat_every: Duration) -> Self {
        self.heartbeat_every = heartbeat_every;
        self
    }

    pub fn poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn shutdown_timeout(mut self, shutdown_timeout: Duration) -> Self {
        self.shutdown_timeout = shutdown_timeout;
        self
    }

    pub fn backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.queues.is_empty() {
            return Err(ConfigError::NoQueues);
        }
        if self.queues.iter().any(|queue| queue.trim().is_empty()) {
            return Err(ConfigError::BlankQueueName);
        }
        if self.worker_id.is_empty() {
            return Err(ConfigError::EmptyWorkerId);
        }
        if self.concurrency == 0 {
            return Err(ConfigError::ZeroConcurrency);
        }
        if self.lease.is_zero() {
            return Err(ConfigError::ZeroDuration("lease"));
        }
        if self.heartbeat_every.is_zero() {
            return Err(ConfigError::ZeroDuration("heartbeat interval"));
        }
        if self.heartbeat_every >= self.lease {
            return Err(ConfigError::HeartbeatNotShorterThanLease {
                heartbeat: self.heartbeat_every,
                lease: self.lease,
            });
        }
        if self.poll_interval.is_zero() {
            return Err(ConfigError::ZeroDuration("poll interval"));
        }

        self.backoff.validate()
    }
}
