//! Runnability checks for active jobs.
//!
//! A job can be `active` yet unable to make progress: all of its
//! remaining tasks depend on failed or canceled tasks, while the number
//! of failed tasks stays below the job-failure threshold. No task update
//! will ever surface that state, since the blocked tasks are simply
//! never picked up, so a periodic sweep detects it and fails the job.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::Result;
use crate::database::models::JobStatus;
use crate::database::repositories::{JobRepository, TaskRepository};
use crate::jobs::status::JobStatusMachine;

pub struct RunnabilityChecker {
    jobs: Arc<dyn JobRepository>,
    tasks: Arc<dyn TaskRepository>,
    machine: Arc<JobStatusMachine>,
}

impl RunnabilityChecker {
    pub fn new(
        jobs: Arc<dyn JobRepository>,
        tasks: Arc<dyn TaskRepository>,
        machine: Arc<JobStatusMachine>,
    ) -> Self {
        Self {
            jobs,
            tasks,
            machine,
        }
    }

    /// Check every active job. One bad job must not block the rest of the
    /// sweep, so per-job errors are logged and skipped.
    pub async fn check_all_jobs(&self) -> Result<()> {
        for job in self.jobs.list_jobs_by_status(JobStatus::Active).await? {
            if let Err(e) = self.check_job(&job.id).await {
                warn!(job_id = %job.id, error = %e, "runnability check failed for job");
            }
        }
        Ok(())
    }

    /// Fail one job via `fail-requested` when it has tasks that can never
    /// run because a parent failed or was canceled.
    pub async fn check_job(&self, job_id: &str) -> Result<()> {
        let job = self.jobs.get_job(job_id).await?;
        if job.get_status() != Some(JobStatus::Active) {
            debug!(job_id, status = %job.status, "job is not active any more, skipping");
            return Ok(());
        }

        let unrunnable = self.unrunnable_task_ids(job_id).await?;
        if unrunnable.is_empty() {
            debug!(job_id, "job has no unrunnable tasks");
            return Ok(());
        }

        info!(
            job_id,
            count = unrunnable.len(),
            "job has unrunnable tasks, failing it"
        );
        let reason = format!(
            "{} tasks have a failed/canceled parent and will not be able to run",
            unrunnable.len()
        );
        self.machine
            .set_job_status_with_reason(job_id, JobStatus::FailRequested, Some(&reason))
            .await
    }

    /// Unresolved tasks with at least one failed/canceled parent.
    async fn unrunnable_task_ids(&self, job_id: &str) -> Result<Vec<String>> {
        let graph = self.tasks.task_graph(job_id).await?;

        let dead_parents: HashSet<String> = graph
            .iter()
            .filter(|node| {
                node.get_status()
                    .map(|status| status.is_failed_terminal())
                    .unwrap_or(false)
            })
            .map(|node| node.id.clone())
            .collect();
        if dead_parents.is_empty() {
            return Ok(Vec::new());
        }

        Ok(graph
            .iter()
            .filter(|node| {
                node.get_status()
                    .map(|status| status.is_unresolved())
                    .unwrap_or(false)
            })
            .filter(|node| {
                node.get_parents()
                    .iter()
                    .any(|parent| dead_parents.contains(parent))
            })
            .map(|node| node.id.clone())
            .collect())
    }
}
