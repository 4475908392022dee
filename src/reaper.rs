//! Periodically recovers jobs whose worker stopped renewing their lease.

use crate::client::Client;
use crate::config::ReaperConfig;
use crate::errors::ConfigError;
use crate::store::Store;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span};

#[derive(Debug)]
pub struct Reaper<S: Store> {
    client: Client<S>,
    config: ReaperConfig,
}

impl<S: Store> Reaper<S> {
    pub fn new(client: Client<S>, config: ReaperConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self { client, config })
    }

    /// Runs a single sweep, recovering batches until a batch comes back
    /// short. Returns the total number of recovered jobs.
    pub async fn sweep(&self) -> u64 {
        let mut total = 0;
        loop {
            match self.client.recover_expired_leases(self.config.batch_size).await {
                Ok(recovered) => {
                    total += recovered;
                    if recovered < self.config.batch_size as u64 {
                        return total;
                    }
                }
                Err(error) => {
                    error!("Failed to recover expired leases: {error}");
                    return total;
                }
            }
        }
    }

    /// Spawns the sweep loop onto the current tokio runtime.
    pub fn start(self) -> ReaperHandle {
        let shutdown = CancellationToken::new();
        let token = shutdown.clone();

        let task = tokio::spawn(
            async move {
                info!(interval = ?self.config.interval, "Starting reaper…");
                loop {
                    let recovered = self.sweep().await;
                    debug!(recovered, "Reaper sweep finished");

                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = sleep(self.config.interval) => {}
                    }
                }
                info!("Reaper stopped");
            }
            .instrument(info_span!("reaper")),
        );

        ReaperHandle { shutdown, task }
    }
}

/// Handle to a running [Reaper].
#[derive(Debug)]
pub struct ReaperHandle {
    shutdown: CancellationToken,
    task: JoinHandle<()>,
}

impl ReaperHandle {
    /// Stops the reaper after its current sweep.
    pub async fn stop(self) {
        self.shutdown.cancel();
        if let Err(error) = self.task.await {
            error!("Reaper task failed: {error}");
        }
    }
}
