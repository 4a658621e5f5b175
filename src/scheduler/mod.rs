//! Task scheduling and Manager-facing task updates.
//!
//! [`Scheduler::schedule_tasks`] atomically claims a batch of runnable
//! tasks for a Manager, and [`Scheduler::task_update_batch`] processes a
//! Manager's batched status/progress reports.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::ServerConfig;
use crate::database::models::task::ACCEPTED_AFTER_CANCEL_REQUESTED;
use crate::database::models::{TaskDbModel, TaskLogDbModel, TaskStatus};
use crate::database::repositories::{TaskFieldUpdate, TaskRepository};
use crate::jobs::status::JobStatusMachine;
use crate::{Error, Result};

/// One task update in a Manager's batch report.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskUpdate {
    /// Manager-generated update ID, echoed back so the Manager can drop
    /// the update from its retry queue.
    pub id: String,
    pub task_id: String,
    #[serde(default)]
    pub task_status: Option<String>,
    #[serde(default)]
    pub activity: Option<String>,
    #[serde(default)]
    pub worker: Option<String>,
    #[serde(default)]
    pub task_progress_percentage: Option<i64>,
    #[serde(default)]
    pub current_command_index: Option<i64>,
    #[serde(default)]
    pub command_progress_percentage: Option<i64>,
    /// Full log chunk; stored separately and also used to derive the
    /// log tail when `log_tail` is absent.
    #[serde(default)]
    pub log: Option<String>,
    #[serde(default)]
    pub log_tail: Option<String>,
    #[serde(default)]
    pub received_on_manager: Option<String>,
}

/// Response of [`Scheduler::task_update_batch`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskUpdateBatchResponse {
    pub modified_count: u64,
    pub handled_update_ids: Vec<String>,
    /// All tasks of this Manager currently in `cancel-requested`,
    /// computed after the batch was applied, so the Manager immediately
    /// learns which running tasks it must stop.
    pub cancel_task_ids: Vec<String>,
}

pub struct Scheduler {
    tasks: Arc<dyn TaskRepository>,
    machine: Arc<JobStatusMachine>,
    config: Arc<ServerConfig>,
}

impl Scheduler {
    pub fn new(
        tasks: Arc<dyn TaskRepository>,
        machine: Arc<JobStatusMachine>,
        config: Arc<ServerConfig>,
    ) -> Self {
        Self {
            tasks,
            machine,
            config,
        }
    }

    /// Claim up to `chunk_size` runnable tasks for a Manager.
    ///
    /// A task is only handed out when its job is in a runnable status and
    /// every parent task is completed. The claim itself is one atomic
    /// update-many re-checking `status = queued`, so two concurrent
    /// scheduler calls can never return overlapping task sets. An empty
    /// result just means no work is available.
    pub async fn schedule_tasks(
        &self,
        manager_id: &str,
        chunk_size: usize,
        job_type: Option<&str>,
    ) -> Result<Vec<TaskDbModel>> {
        let candidates = self
            .tasks
            .scheduler_candidates(manager_id, job_type)
            .await?;
        if candidates.is_empty() {
            debug!(manager_id, "no queued tasks for manager");
            return Ok(Vec::new());
        }

        let runnable = self.filter_runnable(&candidates).await?;
        let selected: Vec<String> = runnable
            .into_iter()
            .take(chunk_size)
            .map(|task| task.id.clone())
            .collect();
        if selected.is_empty() {
            return Ok(Vec::new());
        }

        let claimed_ids = self.tasks.claim_tasks(&selected).await?;
        if claimed_ids.is_empty() {
            // A concurrent scheduler grabbed them all; valid outcome.
            return Ok(Vec::new());
        }
        let claimed = self.tasks.tasks_by_id(&claimed_ids).await?;

        // One job-status reaction per distinct job, not one per task.
        let job_ids: HashSet<&str> = claimed.iter().map(|task| task.job_id.as_str()).collect();
        for job_id in job_ids {
            self.machine
                .update_job_after_task_status_change(job_id, None, TaskStatus::ClaimedByManager)
                .await?;
        }

        info!(
            manager_id,
            task_count = claimed.len(),
            "handed tasks to manager"
        );
        Ok(claimed)
    }

    /// Keep only candidates whose parents are all completed.
    async fn filter_runnable<'t>(
        &self,
        candidates: &'t [TaskDbModel],
    ) -> Result<Vec<&'t TaskDbModel>> {
        let parent_ids: Vec<String> = candidates
            .iter()
            .flat_map(|task| task.get_parents())
            .collect::<HashSet<String>>()
            .into_iter()
            .collect();
        let parent_statuses = self.tasks.statuses_by_id(&parent_ids).await?;

        Ok(candidates
            .iter()
            .filter(|task| {
                task.get_parents().iter().all(|parent| {
                    parent_statuses.get(parent) == Some(&TaskStatus::Completed)
                })
            })
            .collect())
    }

    /// Process a Manager's batch of task updates.
    ///
    /// Per-update semantics: unknown tasks are handled silently (already
    /// deleted elsewhere); tasks of another Manager are dropped with a
    /// warning but do not reject the batch; a `cancel-requested` task only
    /// accepts transitions that end the cancellation; unrecognized status
    /// strings are logged and NOT applied, while the rest of the update
    /// still is.
    pub async fn task_update_batch(
        &self,
        manager_id: &str,
        updates: &[TaskUpdate],
    ) -> Result<TaskUpdateBatchResponse> {
        debug!(
            manager_id,
            update_count = updates.len(),
            "received task update batch"
        );

        let mut modified_count = 0u64;
        let mut handled_update_ids = Vec::with_capacity(updates.len());

        for update in updates {
            let task = match self.tasks.get_task(&update.task_id).await {
                Ok(task) => task,
                Err(Error::NotFound { .. }) => {
                    warn!(
                        manager_id,
                        task_id = %update.task_id,
                        "manager sent update for non-existing task; accepting but ignoring"
                    );
                    handled_update_ids.push(update.id.clone());
                    continue;
                }
                Err(e) => return Err(e),
            };

            if task.manager_id != manager_id {
                warn!(
                    manager_id,
                    task_id = %task.id,
                    owner = %task.manager_id,
                    "manager sent update for task belonging to another manager"
                );
                continue;
            }

            if let Some(log) = &update.log {
                self.tasks
                    .store_task_log(&TaskLogDbModel {
                        id: update.id.clone(),
                        task_id: task.id.clone(),
                        received_at: update
                            .received_on_manager
                            .clone()
                            .unwrap_or_else(crate::database::now_rfc3339),
                        log: log.clone(),
                    })
                    .await?;
            }

            let new_status = self.determine_new_task_status(manager_id, &task, update);
            let field_update = self.build_field_update(&task, update, new_status);
            modified_count += self
                .tasks
                .apply_manager_update(&task.id, &field_update)
                .await?;
            handled_update_ids.push(update.id.clone());

            if let Some(status) = new_status {
                self.machine
                    .update_job_after_task_status_change(&task.job_id, Some(&task.id), status)
                    .await?;
            }
        }

        // Computed after the batch so just-changed statuses are included.
        let cancel_task_ids = self.tasks.cancel_requested_ids(manager_id).await?;
        if !cancel_task_ids.is_empty() {
            debug!(
                manager_id,
                count = cancel_task_ids.len(),
                "returning tasks to be canceled by manager"
            );
        }

        Ok(TaskUpdateBatchResponse {
            modified_count,
            handled_update_ids,
            cancel_task_ids,
        })
    }

    /// The status to store for this update, or `None` when the reported
    /// status must not be applied.
    fn determine_new_task_status(
        &self,
        manager_id: &str,
        task: &TaskDbModel,
        update: &TaskUpdate,
    ) -> Option<TaskStatus> {
        let reported = update.task_status.as_deref()?;

        let Some(new_status) = TaskStatus::parse(reported) else {
            // Keep the old status; the update is still handled so the
            // Manager does not re-deliver it forever.
            warn!(
                manager_id,
                task_id = %task.id,
                status = reported,
                "manager sent invalid task status, keeping previous status"
            );
            return None;
        };

        let current = task.get_status()?;
        if new_status == current {
            return None;
        }

        // A stale "active" report must not resurrect a task the server
        // already asked the Manager to stop.
        if current == TaskStatus::CancelRequested
            && !ACCEPTED_AFTER_CANCEL_REQUESTED.contains(&new_status)
        {
            info!(
                manager_id,
                task_id = %task.id,
                requested = %new_status,
                "ignoring status for cancel-requested task"
            );
            return None;
        }

        Some(new_status)
    }

    fn build_field_update(
        &self,
        task: &TaskDbModel,
        update: &TaskUpdate,
        new_status: Option<TaskStatus>,
    ) -> TaskFieldUpdate {
        // Derive the log tail from the full log when no explicit tail was
        // sent.
        let log_tail = update.log_tail.clone().or_else(|| {
            update.log.as_ref().map(|log| {
                let lines: Vec<&str> = log.lines().collect();
                let skip = lines.len().saturating_sub(self.config.log_tail_lines);
                lines[skip..].join("\n")
            })
        });

        // A worker that fails a task is remembered on it.
        let failed_by_workers = match (new_status, &update.worker) {
            (Some(TaskStatus::Failed), Some(worker)) => {
                let mut workers = task.get_failed_by_workers();
                if !workers.contains(worker) {
                    workers.push(worker.clone());
                }
                serde_json::to_string(&workers).ok()
            }
            _ => None,
        };

        TaskFieldUpdate {
            status: new_status,
            activity: update.activity.clone(),
            worker: update.worker.clone(),
            task_progress_percentage: update.task_progress_percentage,
            current_command_index: update.current_command_index,
            command_progress_percentage: update.command_progress_percentage,
            log_tail,
            failed_by_workers,
        }
    }
}
