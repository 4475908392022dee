#![doc = include_str!("../README.md")]

mod background_job;
mod backoff;
mod client;
mod clock;
pub mod config;
mod errors;
mod job;
pub mod metrics;
mod reaper;
pub mod schema;
mod store;
pub mod util;
mod worker;

pub use self::background_job::BackgroundJob;
pub use self::backoff::Backoff;
pub use self::client::{Client, DEFAULT_RECOVERY_LIMIT};
pub use self::clock::{Clock, ManualClock, SystemClock};
pub use self::errors::{
    ConfigError, DeliveryFailure, DisposeError, EnqueueError, ProducerError, StoreError,
};
pub use self::job::{
    DEFAULT_MAX_ATTEMPTS, DEFAULT_QUEUE, EnqueueRequest, Enqueued, FinalStatus, HistoryFilter, Job,
    JobHistory, JobId, JobState, MANUAL_PROCESSOR, MAX_LIST_LIMIT, QueueStats,
};
pub use self::reaper::{Reaper, ReaperHandle};
pub use self::store::{
    FailOutcome, MemorySession, MemoryStore, PgSession, PgStore, Session, Store, run_migrations,
};
pub use self::worker::{
    Handler, HandlerFn, JobContext, ShutdownReport, Worker, WorkerHandle, handler_fn,
};
