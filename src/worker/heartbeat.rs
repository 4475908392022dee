use crate::client::Client;
use crate::job::{Job, JobId};
use crate::store::Store;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::AbortHandle;
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Span, debug, error, warn};

/// The lease renewal tasks of the jobs a worker is currently running.
///
/// Tasks are keyed by job ID and a per-registry sequence number, since a
/// worker can reclaim a job whose lease it lost while the stale delivery is
/// still running.
#[derive(Debug, Clone, Default)]
pub(crate) struct LeaseRegistry {
    renewals: Arc<Mutex<Renewals>>,
}

type RenewalKey = (JobId, u64);

#[derive(Debug, Default)]
struct Renewals {
    next_seq: u64,
    tasks: HashMap<RenewalKey, AbortHandle>,
}

/// Parameters of the renewal task of a single job.
#[derive(Debug, Clone)]
pub(crate) struct Renewal {
    pub owner: String,
    pub lease: Duration,
    pub every: Duration,
}

impl LeaseRegistry {
    /// Spawns a task extending the lease on `job` every `renewal.every`
    /// until the returned guard is dropped.
    ///
    /// `on_lost` is cancelled if the store reports that the lease is no
    /// longer held, after which the task stops.
    pub fn start<S: Store>(
        &self,
        client: Client<S>,
        job: &Job,
        renewal: Renewal,
        on_lost: CancellationToken,
    ) -> RenewalGuard {
        let id = job.id;
        let Renewal {
            owner,
            lease,
            every,
        } = renewal;

        let task = tokio::spawn(
            async move {
                let mut ticks = interval_at(Instant::now() + every, every);
                ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);

                loop {
                    ticks.tick().await;
                    match client.heartbeat(id, &owner, lease).await {
                        Ok(true) => debug!("Lease extended"),
                        Ok(false) => {
                            warn!("Lease on running job was lost, cancelling the handler");
                            on_lost.cancel();
                            return;
                        }
                        Err(error) => error!("Failed to extend lease: {error}"),
                    }
                }
            }
            .instrument(Span::current()),
        );

        let key = {
            let mut renewals = self.renewals.lock();
            renewals.next_seq += 1;
            let key = (id, renewals.next_seq);
            renewals.tasks.insert(key, task.abort_handle());
            key
        };

        RenewalGuard {
            key,
            registry: self.clone(),
        }
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.renewals.lock().tasks.len()
    }

    /// Stops renewing every lease, so that the leases of abandoned jobs
    /// lapse and the jobs can be recovered.
    pub fn abort_all(&self) {
        for (_, task) in self.renewals.lock().tasks.drain() {
            task.abort();
        }
    }

    fn stop(&self, key: RenewalKey) {
        if let Some(task) = self.renewals.lock().tasks.remove(&key) {
            task.abort();
        }
    }
}

/// Tears down the renewal task of a job when dropped.
#[derive(Debug)]
pub(crate) struct RenewalGuard {
    key: RenewalKey,
    registry: LeaseRegistry,
}

impl Drop for RenewalGuard {
    fn drop(&mut self) {
        self.registry.stop(self.key);
    }
}
