//! Job database model and status enumeration.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::{Error, Result};

/// Job database model.
///
/// A job is a user-submitted render/processing request that gets compiled
/// into a DAG of tasks. The `settings` column is an open JSON object
/// interpreted by the job-type's compiler; the field names of this model
/// are wire-contract surface and must stay stable.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct JobDbModel {
    pub id: String,
    pub name: String,
    pub description: String,
    /// Key into the compiler registry, e.g. "blender-render".
    pub job_type: String,
    pub project_id: String,
    pub user_id: String,
    /// The one Manager responsible for this job. Immutable after creation.
    pub manager_id: String,
    pub status: String,
    /// Human-readable explanation of the current status.
    pub status_reason: Option<String>,
    /// Priority in [1, 100], higher is more urgent.
    pub priority: i64,
    /// When set, compilation leaves the tasks (and job) paused.
    pub start_paused: bool,
    /// JSON object with job-type specific settings.
    pub settings: String,
    pub tasks_total: i64,
    pub tasks_completed: i64,
    pub tasks_failed: i64,
    pub tasks_canceled: i64,
    /// Name of the archive blob, set once the job has been archived.
    pub archive_blob_name: Option<String>,
    /// Status the job had before archiving started; restored in the
    /// archived job document.
    pub pre_archive_status: Option<String>,
    /// RFC 3339 timestamp (UTC) of job creation.
    pub created_at: String,
    /// RFC 3339 timestamp (UTC) of the last update.
    pub updated_at: String,
}

impl JobDbModel {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        job_type: impl Into<String>,
        settings: serde_json::Value,
        project_id: impl Into<String>,
        user_id: impl Into<String>,
        manager_id: impl Into<String>,
        priority: i64,
        start_paused: bool,
    ) -> Self {
        let now = crate::database::now_rfc3339();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.into(),
            description: description.into(),
            job_type: job_type.into(),
            project_id: project_id.into(),
            user_id: user_id.into(),
            manager_id: manager_id.into(),
            status: JobStatus::UnderConstruction.as_str().to_string(),
            status_reason: None,
            priority,
            start_paused,
            settings: settings.to_string(),
            tasks_total: 0,
            tasks_completed: 0,
            tasks_failed: 0,
            tasks_canceled: 0,
            archive_blob_name: None,
            pre_archive_status: None,
            created_at: now.clone(),
            updated_at: now,
        }
    }

    /// Get the job status as an enum.
    pub fn get_status(&self) -> Option<JobStatus> {
        JobStatus::parse(&self.status)
    }

    /// Get the settings as a JSON object, empty when unset or invalid.
    pub fn get_settings(&self) -> serde_json::Map<String, serde_json::Value> {
        serde_json::from_str::<serde_json::Value>(&self.settings)
            .ok()
            .and_then(|v| match v {
                serde_json::Value::Object(map) => Some(map),
                _ => None,
            })
            .unwrap_or_default()
    }

    pub fn setting(&self, key: &str) -> Option<serde_json::Value> {
        self.get_settings().get(key).cloned()
    }

    /// Fetch a required string setting, with a typed error naming the key.
    pub fn setting_str(&self, key: &str) -> Result<String> {
        match self.setting(key) {
            Some(serde_json::Value::String(s)) => Ok(s),
            Some(other) => Err(Error::job_setting(format!(
                "setting {key:?} must be a string, not {other}"
            ))),
            None => Err(Error::job_setting(format!("missing setting {key:?}"))),
        }
    }

    /// Fetch a required integer setting.
    pub fn setting_i64(&self, key: &str) -> Result<i64> {
        match self.setting(key) {
            Some(serde_json::Value::Number(n)) => n.as_i64().ok_or_else(|| {
                Error::job_setting(format!("setting {key:?} must be an integer, not {n}"))
            }),
            Some(other) => Err(Error::job_setting(format!(
                "setting {key:?} must be an integer, not {other}"
            ))),
            None => Err(Error::job_setting(format!("missing setting {key:?}"))),
        }
    }

    /// Fetch a required numeric setting, accepting integers and floats.
    pub fn setting_f64(&self, key: &str) -> Result<f64> {
        match self.setting(key) {
            Some(serde_json::Value::Number(n)) => n.as_f64().ok_or_else(|| {
                Error::job_setting(format!("setting {key:?} must be numeric, not {n}"))
            }),
            Some(other) => Err(Error::job_setting(format!(
                "setting {key:?} must be numeric, not {other}"
            ))),
            None => Err(Error::job_setting(format!("missing setting {key:?}"))),
        }
    }

    /// Fetch a required boolean setting.
    pub fn setting_bool(&self, key: &str) -> Result<bool> {
        match self.setting(key) {
            Some(serde_json::Value::Bool(b)) => Ok(b),
            Some(other) => Err(Error::job_setting(format!(
                "setting {key:?} must be a boolean, not {other}"
            ))),
            None => Err(Error::job_setting(format!("missing setting {key:?}"))),
        }
    }

    /// Job creation time as a `DateTime`, for deterministic timestamped
    /// paths derived by compilers.
    pub fn created_at_utc(&self) -> Result<chrono::DateTime<chrono::Utc>> {
        chrono::DateTime::parse_from_rfc3339(&self.created_at)
            .map(|dt| dt.with_timezone(&chrono::Utc))
            .map_err(|e| Error::validation(format!("invalid created_at on job {}: {e}", self.id)))
    }
}

/// Job status values.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[strum(serialize_all = "kebab-case")]
#[serde(rename_all = "kebab-case")]
pub enum JobStatus {
    /// Job document exists but its files are still being transferred.
    WaitingForFiles,
    /// The compiler is creating the job's tasks.
    UnderConstruction,
    /// Compilation raised an error; the job has no runnable tasks.
    ConstructionFailed,
    Paused,
    Completed,
    Active,
    Canceled,
    /// Cancellation was requested; waiting for the Manager to confirm.
    CancelRequested,
    Queued,
    /// Transient status that re-queues tasks, then chains to `queued`.
    Requeued,
    Failed,
    /// Failure was requested (e.g. by the runnability check); cascades
    /// like a cancellation but settles in `failed`.
    FailRequested,
    Archiving,
    Archived,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::WaitingForFiles => "waiting-for-files",
            Self::UnderConstruction => "under-construction",
            Self::ConstructionFailed => "construction-failed",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Active => "active",
            Self::Canceled => "canceled",
            Self::CancelRequested => "cancel-requested",
            Self::Queued => "queued",
            Self::Requeued => "requeued",
            Self::Failed => "failed",
            Self::FailRequested => "fail-requested",
            Self::Archiving => "archiving",
            Self::Archived => "archived",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        use std::str::FromStr;
        Self::from_str(s).ok()
    }

    /// Statuses from which a job may be archived.
    pub fn is_archivable(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Canceled | Self::Failed | Self::Paused
        )
    }

    /// Statuses from which a job may be recreated; both guarantee the
    /// Manager has fully stopped executing it.
    pub fn is_recreatable(&self) -> bool {
        matches!(self, Self::Canceled | Self::Completed)
    }

    /// Statuses in which the scheduler may hand out the job's tasks.
    pub fn is_schedulable(&self) -> bool {
        matches!(self, Self::Queued | Self::Active | Self::CancelRequested)
    }
}
