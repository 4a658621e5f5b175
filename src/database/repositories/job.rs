//! Job repository.

use async_trait::async_trait;
use sqlx::SqlitePool;

use crate::database::models::{JobDbModel, JobStatus};
use crate::database::now_rfc3339;
use crate::{Error, Result};

/// Job repository trait.
#[async_trait]
pub trait JobRepository: Send + Sync {
    async fn get_job(&self, id: &str) -> Result<JobDbModel>;
    async fn create_job(&self, job: &JobDbModel) -> Result<()>;
    async fn list_jobs_by_status(&self, status: JobStatus) -> Result<Vec<JobDbModel>>;
    /// Set the job status, optionally replacing the status reason.
    async fn update_job_status(
        &self,
        id: &str,
        status: JobStatus,
        reason: Option<&str>,
    ) -> Result<()>;
    async fn set_job_priority(&self, id: &str, priority: i64) -> Result<()>;
    async fn update_job_settings(&self, id: &str, settings: &str) -> Result<()>;
    async fn set_pre_archive_status(&self, id: &str, status: Option<JobStatus>) -> Result<()>;
    async fn set_archive_blob_name(&self, id: &str, blob_name: &str) -> Result<()>;
    /// Jobs stuck in `archiving` whose last update is at or before the
    /// given RFC 3339 cutoff.
    async fn list_stale_archiving_jobs(&self, cutoff: &str) -> Result<Vec<JobDbModel>>;
    /// Refresh the denormalized task counters from the tasks table.
    async fn refresh_tasks_status(&self, id: &str) -> Result<()>;
}

/// SQLx implementation of JobRepository.
pub struct SqlxJobRepository {
    pool: SqlitePool,
}

impl SqlxJobRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl JobRepository for SqlxJobRepository {
    async fn get_job(&self, id: &str) -> Result<JobDbModel> {
        sqlx::query_as::<_, JobDbModel>("SELECT * FROM jobs WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| Error::not_found("Job", id))
    }

    async fn create_job(&self, job: &JobDbModel) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO jobs (
                id, name, description, job_type, project_id, user_id, manager_id,
                status, status_reason, priority, start_paused, settings,
                tasks_total, tasks_completed, tasks_failed, tasks_canceled,
                archive_blob_name, pre_archive_status, created_at, updated_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&job.id)
        .bind(&job.name)
        .bind(&job.description)
        .bind(&job.job_type)
        .bind(&job.project_id)
        .bind(&job.user_id)
        .bind(&job.manager_id)
        .bind(&job.status)
        .bind(&job.status_reason)
        .bind(job.priority)
        .bind(job.start_paused)
        .bind(&job.settings)
        .bind(job.tasks_total)
        .bind(job.tasks_completed)
        .bind(job.tasks_failed)
        .bind(job.tasks_canceled)
        .bind(&job.archive_blob_name)
        .bind(&job.pre_archive_status)
        .bind(&job.created_at)
        .bind(&job.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_jobs_by_status(&self, status: JobStatus) -> Result<Vec<JobDbModel>> {
        let jobs = sqlx::query_as::<_, JobDbModel>(
            "SELECT * FROM jobs WHERE status = ? ORDER BY created_at",
        )
        .bind(status.as_str())
        .fetch_all(&self.pool)
        .await?;
        Ok(jobs)
    }

    async fn update_job_status(
        &self,
        id: &str,
        status: JobStatus,
        reason: Option<&str>,
    ) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET status = ?, status_reason = COALESCE(?, status_reason), updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(status.as_str())
        .bind(reason)
        .bind(now_rfc3339())
        .bind(id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(Error::not_found("Job", id));
        }
        Ok(())
    }

    async fn set_job_priority(&self, id: &str, priority: i64) -> Result<()> {
        let result = sqlx::query("UPDATE jobs SET priority = ?, updated_at = ? WHERE id = ?")
            .bind(priority)
            .bind(now_rfc3339())
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(Error::not_found("Job", id));
        }
        Ok(())
    }

    async fn update_job_settings(&self, id: &str, settings: &str) -> Result<()> {
        sqlx::query("UPDATE jobs SET settings = ?, updated_at = ? WHERE id = ?")
            .bind(settings)
            .bind(now_rfc3339())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn set_pre_archive_status(&self, id: &str, status: Option<JobStatus>) -> Result<()> {
        sqlx::query("UPDATE jobs SET pre_archive_status = ?, updated_at = ? WHERE id = ?")
            .bind(status.map(|s| s.as_str()))
            .bind(now_rfc3339())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn set_archive_blob_name(&self, id: &str, blob_name: &str) -> Result<()> {
        let result = sqlx::query("UPDATE jobs SET archive_blob_name = ?, updated_at = ? WHERE id = ?")
            .bind(blob_name)
            .bind(now_rfc3339())
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(Error::not_found("Job", id));
        }
        Ok(())
    }

    async fn list_stale_archiving_jobs(&self, cutoff: &str) -> Result<Vec<JobDbModel>> {
        let jobs = sqlx::query_as::<_, JobDbModel>(
            "SELECT * FROM jobs WHERE status = 'archiving' AND updated_at <= ?",
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;
        Ok(jobs)
    }

    async fn refresh_tasks_status(&self, id: &str) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE jobs SET
                tasks_total = (SELECT COUNT(*) FROM tasks WHERE job_id = jobs.id),
                tasks_completed = (SELECT COUNT(*) FROM tasks WHERE job_id = jobs.id AND status = 'completed'),
                tasks_failed = (SELECT COUNT(*) FROM tasks WHERE job_id = jobs.id AND status = 'failed'),
                tasks_canceled = (SELECT COUNT(*) FROM tasks WHERE job_id = jobs.id AND status = 'canceled'),
                updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(now_rfc3339())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
