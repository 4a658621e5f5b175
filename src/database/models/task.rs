//! Task database models and status/type enumerations.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::compilers::commands::Command;
use crate::database::models::JobDbModel;
use crate::{Error, Result};

/// Task database model.
///
/// One concrete unit of work, belonging to a job. The `parents` column is
/// a JSON array of task IDs within the same job; an empty array marks a
/// root task. `commands` is the JSON-serialized ordered command list the
/// Manager executes verbatim.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct TaskDbModel {
    pub id: String,
    pub job_id: String,
    pub manager_id: String,
    pub user_id: String,
    pub project_id: String,
    pub name: String,
    pub status: String,
    pub job_type: String,
    pub task_type: String,
    /// JSON array of commands.
    pub commands: String,
    /// Task-local priority, higher first. Defaults to 0.
    pub priority: i64,
    /// Denormalized copy of the job priority, kept in sync.
    pub job_priority: i64,
    /// JSON array of parent task IDs.
    pub parents: String,
    /// Identifier of the worker that last ran this task.
    pub worker: Option<String>,
    /// Human-readable note about the latest status change.
    pub activity: String,
    /// JSON array of worker identifiers that failed this task before.
    pub failed_by_workers: String,
    pub task_progress_percentage: i64,
    pub current_command_index: i64,
    pub command_progress_percentage: i64,
    /// Last few lines of the task log.
    pub log_tail: String,
    /// Pointer to the externally stored full log, if any.
    pub log_file: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl TaskDbModel {
    /// Create an under-construction task for the given job.
    ///
    /// Tasks are always created `under-construction`; the compile boundary
    /// flips them to `queued` (or `paused`) only once the whole DAG exists,
    /// so a Manager can never claim half a job.
    pub fn new(
        job: &JobDbModel,
        name: impl Into<String>,
        task_type: TaskType,
        commands: &[Command],
        parents: &[String],
        priority: i64,
    ) -> Result<Self> {
        let now = crate::database::now_rfc3339();
        Ok(Self {
            id: uuid::Uuid::new_v4().to_string(),
            job_id: job.id.clone(),
            manager_id: job.manager_id.clone(),
            user_id: job.user_id.clone(),
            project_id: job.project_id.clone(),
            name: name.into(),
            status: TaskStatus::UnderConstruction.as_str().to_string(),
            job_type: job.job_type.clone(),
            task_type: task_type.as_str().to_string(),
            commands: serde_json::to_string(commands)?,
            priority,
            job_priority: job.priority,
            parents: serde_json::to_string(parents)?,
            worker: None,
            activity: String::new(),
            failed_by_workers: "[]".to_string(),
            task_progress_percentage: 0,
            current_command_index: 0,
            command_progress_percentage: 0,
            log_tail: String::new(),
            log_file: None,
            created_at: now.clone(),
            updated_at: now,
        })
    }

    pub fn get_status(&self) -> Option<TaskStatus> {
        TaskStatus::parse(&self.status)
    }

    pub fn get_parents(&self) -> Vec<String> {
        serde_json::from_str(&self.parents).unwrap_or_default()
    }

    pub fn get_commands(&self) -> Result<Vec<Command>> {
        Ok(serde_json::from_str(&self.commands)?)
    }

    pub fn get_failed_by_workers(&self) -> Vec<String> {
        serde_json::from_str(&self.failed_by_workers).unwrap_or_default()
    }

    pub fn is_root(&self) -> bool {
        self.get_parents().is_empty()
    }
}

/// Minimal task projection for graph traversals: id, status, parents.
#[derive(Debug, Clone, FromRow)]
pub struct TaskGraphNode {
    pub id: String,
    pub status: String,
    pub parents: String,
}

impl TaskGraphNode {
    pub fn get_status(&self) -> Option<TaskStatus> {
        TaskStatus::parse(&self.status)
    }

    pub fn get_parents(&self) -> Vec<String> {
        serde_json::from_str(&self.parents).unwrap_or_default()
    }
}

/// A full task log chunk received from a Manager, keyed by the update ID
/// so duplicate deliveries overwrite rather than duplicate.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct TaskLogDbModel {
    pub id: String,
    pub task_id: String,
    pub received_at: String,
    pub log: String,
}

/// Task status values.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[strum(serialize_all = "kebab-case")]
#[serde(rename_all = "kebab-case")]
pub enum TaskStatus {
    UnderConstruction,
    Paused,
    Queued,
    /// Handed to a Manager by the scheduler, not yet started.
    ClaimedByManager,
    Completed,
    Active,
    /// The server asked the Manager to stop this task; waiting for the
    /// Manager's confirmation.
    CancelRequested,
    Canceled,
    Failed,
    /// Failed on one worker but eligible for retry on another.
    SoftFailed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::UnderConstruction => "under-construction",
            Self::Paused => "paused",
            Self::Queued => "queued",
            Self::ClaimedByManager => "claimed-by-manager",
            Self::Completed => "completed",
            Self::Active => "active",
            Self::CancelRequested => "cancel-requested",
            Self::Canceled => "canceled",
            Self::Failed => "failed",
            Self::SoftFailed => "soft-failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        use std::str::FromStr;
        Self::from_str(s).ok()
    }

    /// Terminal failure states; a child of a task in one of these states
    /// can never run.
    pub fn is_failed_terminal(&self) -> bool {
        matches!(self, Self::Failed | Self::Canceled)
    }

    /// States that still count as "not yet resolved" for the runnability
    /// check.
    pub fn is_unresolved(&self) -> bool {
        matches!(
            self,
            Self::Queued | Self::ClaimedByManager | Self::Active | Self::CancelRequested
        )
    }
}

/// Statuses a Manager may report for a task that is in `cancel-requested`.
pub const ACCEPTED_AFTER_CANCEL_REQUESTED: [TaskStatus; 3] =
    [TaskStatus::Canceled, TaskStatus::Failed, TaskStatus::Completed];

/// Task type values; Managers advertise which of these their workers
/// support.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[strum(serialize_all = "kebab-case")]
#[serde(rename_all = "kebab-case")]
pub enum TaskType {
    Sleep,
    BlenderRender,
    ExrMerge,
    FileManagement,
    VideoEncoding,
    Debug,
}

impl TaskType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sleep => "sleep",
            Self::BlenderRender => "blender-render",
            Self::ExrMerge => "exr-merge",
            Self::FileManagement => "file-management",
            Self::VideoEncoding => "video-encoding",
            Self::Debug => "debug",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_job() -> JobDbModel {
        JobDbModel::new(
            "test",
            "",
            "sleep",
            serde_json::json!({}),
            "project-1",
            "user-1",
            "manager-1",
            70,
            false,
        )
    }

    #[test]
    fn test_new_task() {
        let job = test_job();
        let task = TaskDbModel::new(
            &job,
            "sleep-1-10",
            TaskType::Sleep,
            &[Command::Echo {
                message: "Preparing to sleep".to_string(),
            }],
            &[],
            0,
        )
        .unwrap();

        assert_eq!(task.status, "under-construction");
        assert_eq!(task.job_priority, 70);
        assert!(task.is_root());
        assert_eq!(task.get_commands().unwrap().len(), 1);
    }

    #[test]
    fn test_parents_round_trip() {
        let job = test_job();
        let parent = TaskDbModel::new(&job, "parent", TaskType::FileManagement, &[], &[], 0).unwrap();
        let child = TaskDbModel::new(
            &job,
            "child",
            TaskType::BlenderRender,
            &[],
            std::slice::from_ref(&parent.id),
            0,
        )
        .unwrap();

        assert!(!child.is_root());
        assert_eq!(child.get_parents(), vec![parent.id]);
    }

    #[test]
    fn test_status_round_trip() {
        for status in [
            TaskStatus::UnderConstruction,
            TaskStatus::ClaimedByManager,
            TaskStatus::CancelRequested,
            TaskStatus::SoftFailed,
        ] {
            assert_eq!(TaskStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(TaskStatus::parse("unknown-status"), None);
    }
}
