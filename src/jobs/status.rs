//! The job/task bidirectional status propagation engine.
//!
//! Two entry points drive the machine: [`JobStatusMachine::set_job_status`]
//! reacts to an explicit job status change by cascading task updates and
//! chaining follow-up job statuses, and
//! [`JobStatusMachine::update_job_after_task_status_change`] reacts to a
//! single task's status change by deriving the job's new status.
//!
//! Status transitions are read-then-write; near-simultaneous updates on
//! the same job may race on the derived status. The cascading bulk
//! updates themselves re-check their precondition atomically, which is
//! what prevents double-claims and double-cancels.

use std::sync::Arc;

use tracing::{debug, error, info, warn};

use crate::config::ServerConfig;
use crate::database::models::{JobStatus, TaskStatus};
use crate::database::repositories::{JobRepository, TaskRepository};
use crate::{Error, Result};

/// Upper bound on chained job status transitions. The transition table is
/// acyclic; exceeding this means the table got a cycle and is an internal
/// error.
const MAX_STATUS_CHAIN: usize = 8;

pub struct JobStatusMachine {
    jobs: Arc<dyn JobRepository>,
    tasks: Arc<dyn TaskRepository>,
    config: Arc<ServerConfig>,
}

impl JobStatusMachine {
    pub fn new(
        jobs: Arc<dyn JobRepository>,
        tasks: Arc<dyn TaskRepository>,
        config: Arc<ServerConfig>,
    ) -> Self {
        Self {
            jobs,
            tasks,
            config,
        }
    }

    /// Set a job's status and apply all follow-up transitions.
    pub async fn set_job_status(&self, job_id: &str, new_status: JobStatus) -> Result<()> {
        self.set_job_status_with_reason(job_id, new_status, None)
            .await
    }

    /// Set a job's status, recording a human-readable reason, and apply
    /// all follow-up transitions the table chains to.
    pub async fn set_job_status_with_reason(
        &self,
        job_id: &str,
        new_status: JobStatus,
        reason: Option<&str>,
    ) -> Result<()> {
        let job = self.jobs.get_job(job_id).await?;
        let mut old_status = job.get_status().ok_or_else(|| Error::InvalidStatus {
            status: job.status.clone(),
        })?;
        let mut next_status = new_status;
        let mut reason = reason;

        for _ in 0..MAX_STATUS_CHAIN {
            info!(
                job_id,
                old_status = %old_status,
                new_status = %next_status,
                "setting job status"
            );
            self.jobs
                .update_job_status(job_id, next_status, reason)
                .await?;
            reason = None;

            match self
                .handle_job_status_change(job_id, old_status, next_status)
                .await?
            {
                None => return Ok(()),
                Some(chained) => {
                    old_status = next_status;
                    next_status = chained;
                }
            }
        }

        error!(
            job_id,
            "job status chain exceeded {MAX_STATUS_CHAIN} transitions; transition table has a cycle"
        );
        Err(Error::StatusChainTooLong {
            job_id: job_id.to_string(),
        })
    }

    /// Apply the task cascade for one job status transition. Returns the
    /// next job status when the table chains onwards.
    async fn handle_job_status_change(
        &self,
        job_id: &str,
        old_status: JobStatus,
        new_status: JobStatus,
    ) -> Result<Option<JobStatus>> {
        match new_status {
            JobStatus::Completed | JobStatus::Canceled | JobStatus::Active => {
                // These are consequences of task status changes, not
                // causes; nothing to cascade.
                Ok(None)
            }
            JobStatus::CancelRequested | JobStatus::Failed | JobStatus::FailRequested => {
                // Tasks a Manager may be running need its confirmation to
                // stop; tasks nothing has touched yet are canceled
                // unilaterally.
                let cancel_requested_count = self
                    .tasks
                    .set_status_where_in(
                        job_id,
                        &[TaskStatus::Active, TaskStatus::ClaimedByManager],
                        TaskStatus::CancelRequested,
                        Some(&format!(
                            "Manager was asked to stop this task because the job went to {new_status}"
                        )),
                    )
                    .await?;
                self.tasks
                    .set_status_where_in(
                        job_id,
                        &[TaskStatus::Queued],
                        TaskStatus::Canceled,
                        Some(&format!(
                            "Task was canceled because the job went to {new_status}"
                        )),
                    )
                    .await?;
                self.jobs.refresh_tasks_status(job_id).await?;

                if cancel_requested_count == 0 {
                    // Nothing is running, so there is no Manager to wait
                    // for; settle the job immediately.
                    match new_status {
                        JobStatus::CancelRequested => {
                            info!(
                                job_id,
                                "no tasks were cancel-requested, transitioning directly to canceled"
                            );
                            return Ok(Some(JobStatus::Canceled));
                        }
                        JobStatus::FailRequested => {
                            info!(
                                job_id,
                                "no tasks were cancel-requested, transitioning directly to failed"
                            );
                            return Ok(Some(JobStatus::Failed));
                        }
                        _ => {}
                    }
                }
                Ok(None)
            }
            JobStatus::Requeued => {
                match old_status {
                    // The compiler queued the tasks moments ago.
                    JobStatus::UnderConstruction => {}
                    JobStatus::Completed => {
                        // Leave cancel-requested tasks alone; only
                        // Managers may move those, to avoid races.
                        self.tasks
                            .set_status_where_not_in(
                                job_id,
                                &[TaskStatus::CancelRequested],
                                TaskStatus::Queued,
                                Some("Task was requeued"),
                            )
                            .await?;
                    }
                    _ => {
                        self.tasks
                            .set_status_where_not_in(
                                job_id,
                                &[TaskStatus::Completed, TaskStatus::CancelRequested],
                                TaskStatus::Queued,
                                Some("Task was requeued"),
                            )
                            .await?;
                    }
                }
                self.jobs.refresh_tasks_status(job_id).await?;
                Ok(Some(JobStatus::Queued))
            }
            JobStatus::Queued => {
                // Forcing a job back to queued when every task is already
                // done must not leave it stuck there.
                let statuses = self.tasks.distinct_statuses(job_id).await?;
                if !statuses.is_empty() && statuses.iter().all(|s| *s == TaskStatus::Completed) {
                    info!(job_id, "all tasks already completed, chaining to completed");
                    return Ok(Some(JobStatus::Completed));
                }
                Ok(None)
            }
            _ => {
                debug!(
                    job_id,
                    old_status = %old_status,
                    new_status = %new_status,
                    "job status change has no effect on tasks"
                );
                Ok(None)
            }
        }
    }

    /// React to a single task's status change, possibly re-deriving the
    /// job status. `task_id` is `None` for batch operations that report
    /// once per job (e.g. the scheduler's claim).
    pub async fn update_job_after_task_status_change(
        &self,
        job_id: &str,
        task_id: Option<&str>,
        new_task_status: TaskStatus,
    ) -> Result<()> {
        self.jobs.refresh_tasks_status(job_id).await?;
        let task_id = task_id.unwrap_or("<batch>");

        match new_task_status {
            TaskStatus::Queued => {
                // A task re-entering the queue re-opens a completed job.
                let job = self.jobs.get_job(job_id).await?;
                if job.get_status() == Some(JobStatus::Completed) {
                    info!(job_id, task_id, "task was requeued, re-opening completed job");
                    self.set_job_status(job_id, JobStatus::Queued).await?;
                }
            }
            TaskStatus::ClaimedByManager => {
                // Claiming doesn't start work; if nothing is running any
                // more the job is queued rather than active.
                let active_count = self
                    .tasks
                    .count_tasks_with_status(job_id, TaskStatus::Active)
                    .await?;
                if active_count == 0 {
                    let job = self.jobs.get_job(job_id).await?;
                    if job.get_status() == Some(JobStatus::Active) {
                        self.set_job_status(job_id, JobStatus::Queued).await?;
                    }
                }
            }
            TaskStatus::CancelRequested => {
                // No job effect; the job already reflects the request.
            }
            TaskStatus::Canceled => {
                // This may be the last straggler the Manager confirmed.
                let statuses = self.tasks.distinct_statuses(job_id).await?;
                if !statuses.contains(&TaskStatus::CancelRequested) {
                    let job = self.jobs.get_job(job_id).await?;
                    // A job that was asked to fail settles as failed; a
                    // job that already failed keeps its failure.
                    let settled = match job.get_status() {
                        Some(JobStatus::FailRequested) => Some(JobStatus::Failed),
                        Some(JobStatus::Failed) => None,
                        _ => Some(JobStatus::Canceled),
                    };
                    if let Some(settled) = settled {
                        info!(
                            job_id,
                            task_id,
                            settled = %settled,
                            "last cancel-requested task was confirmed"
                        );
                        self.set_job_status(job_id, settled).await?;
                    }
                }
            }
            TaskStatus::Failed => {
                let total_count = self.tasks.count_tasks(job_id).await?.max(1);
                let fail_count = self
                    .tasks
                    .count_tasks_with_status(job_id, TaskStatus::Failed)
                    .await?;
                let fail_percentage = fail_count as f64 / total_count as f64 * 100.0;
                if fail_percentage >= self.config.task_fail_job_percentage {
                    warn!(
                        job_id,
                        task_id,
                        fail_count,
                        total_count,
                        "failing job because {fail_percentage:.0}% of its tasks failed"
                    );
                    self.set_job_status_with_reason(
                        job_id,
                        JobStatus::Failed,
                        Some(&format!("{fail_count} of {total_count} tasks failed")),
                    )
                    .await?;
                } else {
                    warn!(
                        job_id,
                        task_id,
                        fail_count,
                        total_count,
                        "task failed; only {fail_percentage:.0}% of the job's tasks failed, ignoring for now"
                    );
                    self.job_active_if_queued(job_id).await?;
                }
            }
            TaskStatus::Active => {
                let job = self.jobs.get_job(job_id).await?;
                if job.get_status() != Some(JobStatus::Active) {
                    info!(job_id, task_id, "job became active");
                    self.set_job_status(job_id, JobStatus::Active).await?;
                }
            }
            TaskStatus::Completed => {
                let statuses = self.tasks.distinct_statuses(job_id).await?;
                if !statuses.is_empty() && statuses.iter().all(|s| *s == TaskStatus::Completed) {
                    info!(job_id, task_id, "all tasks completed, completing job");
                    self.set_job_status(job_id, JobStatus::Completed).await?;
                } else {
                    self.job_active_if_queued(job_id).await?;
                }
            }
            other => {
                // Not fatal; log and move on.
                warn!(
                    job_id,
                    task_id,
                    task_status = %other,
                    "task obtained status we do not know how to handle"
                );
            }
        }
        Ok(())
    }

    async fn job_active_if_queued(&self, job_id: &str) -> Result<()> {
        let job = self.jobs.get_job(job_id).await?;
        if job.get_status() == Some(JobStatus::Queued) {
            info!(job_id, "job became active");
            self.set_job_status(job_id, JobStatus::Active).await?;
        }
        Ok(())
    }
}
