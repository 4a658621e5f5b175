//! Periodic maintenance sweeps.
//!
//! The sweep scheduler runs the runnability check and the
//! archival-resume check on fixed intervals until its cancellation token
//! fires. Sweep failures are logged, never fatal.

pub mod runnability;

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::archival::{ArchiveQueue, Archiver};
use crate::config::ServerConfig;
use runnability::RunnabilityChecker;

pub struct SweepScheduler {
    runnability: Arc<RunnabilityChecker>,
    archiver: Arc<Archiver>,
    archive_queue: ArchiveQueue,
    config: Arc<ServerConfig>,
}

impl SweepScheduler {
    pub fn new(
        runnability: Arc<RunnabilityChecker>,
        archiver: Arc<Archiver>,
        archive_queue: ArchiveQueue,
        config: Arc<ServerConfig>,
    ) -> Self {
        Self {
            runnability,
            archiver,
            archive_queue,
            config,
        }
    }

    /// Spawn the sweep loop.
    pub fn start(self: Arc<Self>, token: CancellationToken) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut runnability_interval =
                tokio::time::interval(self.config.runnability_check_interval);
            let mut archival_interval = tokio::time::interval(self.config.archive_resume_interval);
            // The first tick fires immediately; skip it so sweeps start
            // one interval after boot.
            runnability_interval.tick().await;
            archival_interval.tick().await;

            info!("sweep scheduler started");
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = runnability_interval.tick() => {
                        if let Err(e) = self.runnability.check_all_jobs().await {
                            error!(error = %e, "runnability sweep failed");
                        }
                    }
                    _ = archival_interval.tick() => {
                        if let Err(e) = self.archiver.resume_archiving(&self.archive_queue).await {
                            error!(error = %e, "archival resume sweep failed");
                        }
                    }
                }
            }
            info!("sweep scheduler stopped");
        })
    }
}
