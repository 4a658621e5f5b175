//! Job management: creation, compilation, and the administrative
//! operations exposed to the API layer.

pub mod rna_overrides;
pub mod status;

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use tracing::{error, info};

use crate::archival::ArchiveQueue;
use crate::compilers::{CompileContext, CompilerRegistry};
use crate::database::models::{JobDbModel, JobStatus, TaskStatus};
use crate::database::repositories::{JobRepository, ManagerRepository, TaskRepository};
use crate::{Error, Result};
use status::JobStatusMachine;

/// Parameters for creating a job.
#[derive(Debug, Clone)]
pub struct CreateJobRequest {
    pub name: String,
    pub description: String,
    pub job_type: String,
    pub settings: serde_json::Value,
    pub project_id: String,
    pub user_id: String,
    pub manager_id: String,
    pub priority: i64,
    pub start_paused: bool,
}

/// Service facade over jobs: creation, recompilation and the PATCH-style
/// administrative operations.
pub struct JobManager {
    jobs: Arc<dyn JobRepository>,
    tasks: Arc<dyn TaskRepository>,
    managers: Arc<dyn ManagerRepository>,
    machine: Arc<JobStatusMachine>,
    registry: Arc<CompilerRegistry>,
    archive_queue: ArchiveQueue,
}

impl JobManager {
    pub fn new(
        jobs: Arc<dyn JobRepository>,
        tasks: Arc<dyn TaskRepository>,
        managers: Arc<dyn ManagerRepository>,
        machine: Arc<JobStatusMachine>,
        registry: Arc<CompilerRegistry>,
        archive_queue: ArchiveQueue,
    ) -> Self {
        Self {
            jobs,
            tasks,
            managers,
            machine,
            registry,
            archive_queue,
        }
    }

    /// Create a job and compile it into tasks.
    ///
    /// Setting validation happens before the job document is inserted, so
    /// bad user input rejects the request outright. Later compilation
    /// errors fail the job (status `construction-failed`), never the
    /// request.
    pub async fn create_job(&self, request: CreateJobRequest) -> Result<JobDbModel> {
        if !(1..=100).contains(&request.priority) {
            return Err(Error::validation(format!(
                "priority must be in [1, 100], got {}",
                request.priority
            )));
        }
        let compiler = self.registry.get(&request.job_type).ok_or_else(|| {
            Error::validation(format!("unknown job type {:?}", request.job_type))
        })?;

        let job = JobDbModel::new(
            request.name,
            request.description,
            request.job_type,
            request.settings,
            request.project_id,
            request.user_id,
            request.manager_id,
            request.priority,
            request.start_paused,
        );
        compiler.validate_job_settings(&job)?;

        info!(
            job_id = %job.id,
            job_type = %job.job_type,
            manager_id = %job.manager_id,
            "creating job"
        );
        self.jobs.create_job(&job).await?;
        self.construct_job(&job.id).await
    }

    /// Compile an under-construction job into tasks and flip everything
    /// to its runnable status. On any compilation error the job ends up
    /// `construction-failed` with no tasks at all, and stays inspectable.
    async fn construct_job(&self, job_id: &str) -> Result<JobDbModel> {
        let job = self.jobs.get_job(job_id).await?;

        match self.compile_into_tasks(&job).await {
            Ok(task_count) => {
                let (job_status, task_status) = if job.start_paused {
                    (JobStatus::Paused, TaskStatus::Paused)
                } else {
                    (JobStatus::Queued, TaskStatus::Queued)
                };
                self.tasks
                    .set_status_for_job(job_id, TaskStatus::UnderConstruction, task_status, None)
                    .await?;
                self.machine.set_job_status(job_id, job_status).await?;
                self.jobs.refresh_tasks_status(job_id).await?;
                info!(job_id, task_count, "job compiled");
                self.jobs.get_job(job_id).await
            }
            Err(compile_error) => {
                error!(job_id, error = %compile_error, "job compilation failed");
                // A construction-failed job must have no queued (or any
                // other) tasks left behind.
                self.tasks.delete_logs_for_job(job_id).await?;
                self.tasks.delete_tasks_for_job(job_id).await?;
                self.machine
                    .set_job_status_with_reason(
                        job_id,
                        JobStatus::ConstructionFailed,
                        Some(&compile_error.to_string()),
                    )
                    .await?;
                self.jobs.refresh_tasks_status(job_id).await?;
                self.jobs.get_job(job_id).await
            }
        }
    }

    async fn compile_into_tasks(&self, job: &JobDbModel) -> Result<usize> {
        let compiler = self
            .registry
            .get(&job.job_type)
            .ok_or_else(|| Error::validation(format!("unknown job type {:?}", job.job_type)))?;
        compiler.validate_job_settings(job)?;

        let manager = match self.managers.get_manager(&job.manager_id).await {
            Ok(manager) => Some(manager),
            Err(Error::NotFound { .. }) => None,
            Err(e) => return Err(e),
        };

        let mut ctx = CompileContext::new(job, manager.as_ref());
        compiler.compile(&mut ctx)?;

        let tasks = ctx.into_tasks();
        let task_count = tasks.len();
        self.tasks.create_tasks(&tasks).await?;
        Ok(task_count)
    }

    /// Set a job status from an untrusted status string, rejecting
    /// unknown values without touching the job.
    pub async fn set_job_status_str(
        &self,
        job_id: &str,
        new_status: &str,
        reason: Option<&str>,
    ) -> Result<()> {
        let status = JobStatus::parse(new_status).ok_or_else(|| Error::InvalidStatus {
            status: new_status.to_string(),
        })?;
        self.machine
            .set_job_status_with_reason(job_id, status, reason)
            .await
    }

    /// Change a job's priority, keeping the denormalized copy on its
    /// tasks in sync.
    pub async fn set_job_priority(&self, job_id: &str, priority: i64) -> Result<()> {
        if !(1..=100).contains(&priority) {
            return Err(Error::validation(format!(
                "priority must be in [1, 100], got {priority}"
            )));
        }
        info!(job_id, priority, "setting job priority");
        self.jobs.set_job_priority(job_id, priority).await?;
        self.tasks.sync_job_priority(job_id, priority).await?;
        Ok(())
    }

    /// Start archival of a job. Only the status flip happens here; the
    /// export itself runs in the background archive worker.
    pub async fn archive_job(&self, job_id: &str) -> Result<()> {
        let job = self.jobs.get_job(job_id).await?;
        let status = job.get_status().ok_or_else(|| Error::InvalidStatus {
            status: job.status.clone(),
        })?;

        if matches!(status, JobStatus::Archiving | JobStatus::Archived) {
            return Err(Error::InvalidStateTransition {
                from: status.to_string(),
                to: JobStatus::Archiving.to_string(),
            });
        }
        if !status.is_archivable() {
            return Err(Error::InvalidStateTransition {
                from: status.to_string(),
                to: JobStatus::Archiving.to_string(),
            });
        }

        info!(job_id, "starting archival of job");
        self.jobs
            .set_pre_archive_status(job_id, Some(status))
            .await?;
        self.machine
            .set_job_status(job_id, JobStatus::Archiving)
            .await?;
        self.archive_queue.submit(job_id);
        Ok(())
    }

    /// Delete a job's tasks and compile it afresh. Only allowed from
    /// statuses that guarantee the Manager has stopped executing it; the
    /// new tasks get IDs disjoint from the old ones.
    pub async fn recreate_job(&self, job_id: &str) -> Result<JobDbModel> {
        let job = self.jobs.get_job(job_id).await?;
        let status = job.get_status().ok_or_else(|| Error::InvalidStatus {
            status: job.status.clone(),
        })?;
        if !status.is_recreatable() {
            return Err(Error::InvalidStateTransition {
                from: status.to_string(),
                to: JobStatus::UnderConstruction.to_string(),
            });
        }

        info!(job_id, "recreating job");
        self.tasks.delete_logs_for_job(job_id).await?;
        self.tasks.delete_tasks_for_job(job_id).await?;
        self.machine
            .set_job_status(job_id, JobStatus::UnderConstruction)
            .await?;
        self.construct_job(job_id).await
    }

    /// Re-queue all failed tasks of a job. The job status itself is left
    /// alone; requeue the job to make the scheduler pick the tasks up.
    pub async fn requeue_failed_tasks(&self, job_id: &str) -> Result<u64> {
        info!(job_id, "requeueing failed tasks");
        let requeued = self
            .tasks
            .set_status_for_job(
                job_id,
                TaskStatus::Failed,
                TaskStatus::Queued,
                Some("Failed task was requeued"),
            )
            .await?;
        if requeued > 0 {
            self.machine
                .update_job_after_task_status_change(job_id, None, TaskStatus::Queued)
                .await?;
        }
        Ok(requeued)
    }

    /// Re-queue a task and everything downstream of it.
    ///
    /// Walks the children adjacency iteratively with a visited set, so it
    /// terminates even on corrupt data; actually re-reaching the starting
    /// task means the "acyclic" graph has a cycle, which is surfaced as a
    /// data-integrity error instead of silently broken out of.
    pub async fn requeue_task_and_successors(&self, task_id: &str) -> Result<u64> {
        let task = self.tasks.get_task(task_id).await?;
        let graph = self.tasks.task_graph(&task.job_id).await?;

        let task_ids: HashSet<&str> = graph.iter().map(|node| node.id.as_str()).collect();
        let mut children: HashMap<String, Vec<String>> = HashMap::new();
        for node in &graph {
            for parent in node.get_parents() {
                // Parents always reference tasks within the same job;
                // anything else is stale data and skipped.
                if task_ids.contains(parent.as_str()) {
                    children.entry(parent).or_default().push(node.id.clone());
                }
            }
        }

        let mut visited: HashSet<String> = HashSet::new();
        let mut to_requeue: Vec<String> = Vec::new();
        let mut queue: VecDeque<String> = VecDeque::from([task_id.to_string()]);
        while let Some(current) = queue.pop_front() {
            if !visited.insert(current.clone()) {
                continue;
            }
            for child in children.get(&current).into_iter().flatten() {
                if child == task_id {
                    return Err(Error::validation(format!(
                        "task graph of job {} contains a cycle through task {task_id}",
                        task.job_id
                    )));
                }
                if !visited.contains(child) {
                    queue.push_back(child.clone());
                }
            }
            to_requeue.push(current);
        }

        info!(
            task_id,
            job_id = %task.job_id,
            count = to_requeue.len(),
            "requeueing task and its successors"
        );
        let requeued = self
            .tasks
            .requeue_tasks_by_id(&to_requeue, "Task was requeued")
            .await?;
        self.machine
            .update_job_after_task_status_change(&task.job_id, Some(task_id), TaskStatus::Queued)
            .await?;
        Ok(requeued)
    }

    /// Replace a job's RNA overrides after validating them as Python.
    /// On a syntax error nothing is stored and no task graph is touched.
    pub async fn set_rna_overrides(&self, job_id: &str, lines: Vec<String>) -> Result<()> {
        rna_overrides::validate_rna_overrides(&lines)?;

        let job = self.jobs.get_job(job_id).await?;
        let mut settings = job.get_settings();
        settings.insert(
            "rna_overrides".to_string(),
            serde_json::Value::Array(lines.into_iter().map(serde_json::Value::String).collect()),
        );
        self.jobs
            .update_job_settings(job_id, &serde_json::Value::Object(settings).to_string())
            .await?;
        info!(job_id, "updated RNA overrides");
        Ok(())
    }

    /// Tasks of the job that no other task depends on, i.e. the possible
    /// final tasks of the DAG.
    pub async fn find_job_enders(&self, job_id: &str) -> Result<Vec<String>> {
        self.tasks.find_job_enders(job_id).await
    }
}
