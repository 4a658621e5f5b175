//! Job archival.
//!
//! Archiving moves a terminal job's tasks and logs out of the live store
//! into a compressed offline ZIP. The request that triggers archival only
//! flips the job to `archiving` and submits it here; the expensive steps
//! (JSON dumps, log compression, zipping) run out-of-band in a worker
//! task so user-visible latency stays decoupled from archive size. A
//! periodic sweep re-submits jobs stuck in `archiving`, which makes the
//! whole pipeline crash-resumable.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use flate2::Compression;
use flate2::write::GzEncoder;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use zip::write::{SimpleFileOptions, ZipWriter};

use crate::config::ServerConfig;
use crate::database::models::JobStatus;
use crate::database::repositories::{JobRepository, TaskRepository};
use crate::jobs::status::JobStatusMachine;
use crate::{Error, Result};

/// Subdirectory of the archive storage dir that job ZIPs land in.
const ARCHIVE_BLOB_PREFIX: &str = "flamenco-jobs";

/// Handle for submitting jobs to the archive worker.
#[derive(Clone)]
pub struct ArchiveQueue {
    tx: mpsc::UnboundedSender<String>,
}

impl ArchiveQueue {
    pub fn submit(&self, job_id: &str) {
        if self.tx.send(job_id.to_string()).is_err() {
            warn!(job_id, "archive worker is gone, dropping archival request");
        }
    }
}

/// The background archive worker.
pub struct Archiver {
    jobs: Arc<dyn JobRepository>,
    tasks: Arc<dyn TaskRepository>,
    machine: Arc<JobStatusMachine>,
    config: Arc<ServerConfig>,
}

impl Archiver {
    pub fn new(
        jobs: Arc<dyn JobRepository>,
        tasks: Arc<dyn TaskRepository>,
        machine: Arc<JobStatusMachine>,
        config: Arc<ServerConfig>,
    ) -> Self {
        Self {
            jobs,
            tasks,
            machine,
            config,
        }
    }

    /// Spawn the worker task, returning the submission handle.
    pub fn start(
        self: Arc<Self>,
        token: CancellationToken,
    ) -> (ArchiveQueue, tokio::task::JoinHandle<()>) {
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        let worker = self;
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    received = rx.recv() => match received {
                        None => break,
                        Some(job_id) => {
                            if let Err(e) = worker.archive_job(&job_id).await {
                                error!(job_id, error = %e, "job archival failed");
                            }
                        }
                    }
                }
            }
        });
        (ArchiveQueue { tx }, handle)
    }

    /// Archive one job: dump job + tasks to JSON, gzip each task's logs,
    /// zip it all into the archive storage, purge tasks and logs from the
    /// live store, and flip the job to `archived`.
    pub async fn archive_job(&self, job_id: &str) -> Result<()> {
        let job = match self.jobs.get_job(job_id).await {
            Ok(job) => job,
            Err(Error::NotFound { .. }) => {
                info!(job_id, "job does not exist (any more), not archiving");
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        if job.get_status() == Some(JobStatus::Archived) {
            info!(job_id, "job already archived, not archiving again");
            return Ok(());
        }

        info!(job_id, "archiving job");
        if job.get_status() != Some(JobStatus::Archiving) {
            self.machine.set_job_status(job_id, JobStatus::Archiving).await?;
        }

        let staging = tempfile::Builder::new()
            .prefix(&format!("job-archival-{job_id}-"))
            .tempdir()?;
        self.dump_job_and_tasks(&job, staging.path()).await?;

        let zip_path = staging.path().join(format!("flamenco-job-{job_id}.zip"));
        write_zip(staging.path(), &zip_path)?;
        let blob_name = self.store_blob(job_id, &zip_path)?;

        // Only now that the archive is safely stored, purge the live data.
        self.tasks.delete_logs_for_job(job_id).await?;
        let deleted = self.tasks.delete_tasks_for_job(job_id).await?;
        info!(job_id, deleted, "purged tasks and task logs");

        self.jobs.set_archive_blob_name(job_id, &blob_name).await?;
        self.jobs.set_pre_archive_status(job_id, None).await?;
        self.machine.set_job_status(job_id, JobStatus::Archived).await?;

        info!(job_id, blob_name, "job archived");
        Ok(())
    }

    async fn dump_job_and_tasks(
        &self,
        job: &crate::database::models::JobDbModel,
        staging: &Path,
    ) -> Result<()> {
        // The dumped job document carries the status it had before
        // archiving started.
        let mut job_doc = job.clone();
        if let Some(pre_archive) = job_doc.pre_archive_status.take() {
            job_doc.status = pre_archive;
        }
        let job_json = serde_json::to_string_pretty(&job_doc)?;
        std::fs::write(staging.join(format!("job-{}.json", job.id)), job_json)?;

        for task in self.tasks.tasks_for_job(&job.id).await? {
            let task_json = serde_json::to_string_pretty(&task)?;
            std::fs::write(staging.join(format!("task-{}.json", task.id)), task_json)?;

            let logs = self.tasks.logs_for_task(&task.id).await?;
            if logs.is_empty() {
                continue;
            }
            let log_file = std::fs::File::create(staging.join(format!("task-{}.log.gz", task.id)))?;
            let mut encoder = GzEncoder::new(log_file, Compression::default());
            for entry in logs {
                encoder.write_all(entry.log.as_bytes())?;
            }
            encoder.finish()?;
        }
        Ok(())
    }

    /// Move the ZIP into the archive storage directory, uniquifying the
    /// name when a blob from an earlier run already exists.
    fn store_blob(&self, job_id: &str, zip_path: &Path) -> Result<String> {
        let blob_dir = self.config.archive_storage_dir.join(ARCHIVE_BLOB_PREFIX);
        std::fs::create_dir_all(&blob_dir)?;

        let mut blob_name = format!("{ARCHIVE_BLOB_PREFIX}/flamenco-job-{job_id}.zip");
        let mut blob_path = self.config.archive_storage_dir.join(&blob_name);
        let mut counter = 1u32;
        while blob_path.exists() {
            warn!(job_id, blob = %blob_path.display(), "blob already exists, uniquifying name");
            blob_name = format!("{ARCHIVE_BLOB_PREFIX}/flamenco-job-{job_id}-{counter}.zip");
            blob_path = self.config.archive_storage_dir.join(&blob_name);
            counter += 1;
        }

        std::fs::copy(zip_path, &blob_path)?;
        Ok(blob_name)
    }

    /// Re-submit jobs that have been stuck in `archiving` for longer than
    /// the configured age, e.g. because the worker crashed mid-job.
    pub async fn resume_archiving(&self, queue: &ArchiveQueue) -> Result<()> {
        let age = chrono::Duration::from_std(self.config.archive_resume_age)
            .unwrap_or_else(|_| chrono::Duration::days(1));
        let cutoff = (chrono::Utc::now() - age).to_rfc3339();

        let stale = self.jobs.list_stale_archiving_jobs(&cutoff).await?;
        if stale.is_empty() {
            return Ok(());
        }
        info!(count = stale.len(), "resuming archival of stuck jobs");
        for job in stale {
            queue.submit(&job.id);
        }
        Ok(())
    }
}

fn write_zip(staging: &Path, zip_path: &PathBuf) -> Result<()> {
    let zip_file = std::fs::File::create(zip_path)?;
    let mut writer = ZipWriter::new(zip_file);
    let options = SimpleFileOptions::default().compression_method(zip::CompressionMethod::Deflated);

    for entry in std::fs::read_dir(staging)? {
        let path = entry?.path();
        let is_archivable = path
            .extension()
            .is_some_and(|ext| ext == "json" || ext == "gz");
        if !is_archivable {
            continue;
        }
        let Some(file_name) = path.file_name().map(|n| n.to_string_lossy().into_owned()) else {
            continue;
        };
        writer.start_file(file_name, options)?;
        writer.write_all(&std::fs::read(&path)?)?;
    }
    writer.finish()?;
    Ok(())
}
