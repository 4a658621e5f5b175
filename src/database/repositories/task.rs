//! Task repository: the store-level task operations of the orchestrator.
//!
//! Every bulk status mutation is a single `UPDATE` whose `WHERE` clause
//! re-checks the precondition at write time, so concurrent requests
//! cannot double-apply a transition. That single-statement atomicity is
//! the only coordination primitive in use.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use itertools::Itertools;
use sqlx::SqlitePool;

use crate::database::models::{TaskDbModel, TaskGraphNode, TaskLogDbModel, TaskStatus};
use crate::database::now_rfc3339;
use crate::{Error, Result};

/// Partial task update coming from a Manager's batch report. `None`
/// fields leave the stored value untouched.
#[derive(Debug, Clone, Default)]
pub struct TaskFieldUpdate {
    pub status: Option<TaskStatus>,
    pub activity: Option<String>,
    pub worker: Option<String>,
    pub task_progress_percentage: Option<i64>,
    pub current_command_index: Option<i64>,
    pub command_progress_percentage: Option<i64>,
    pub log_tail: Option<String>,
    /// Full replacement of the failed-by-workers list, already serialized.
    pub failed_by_workers: Option<String>,
}

/// Task repository trait.
#[async_trait]
pub trait TaskRepository: Send + Sync {
    async fn get_task(&self, id: &str) -> Result<TaskDbModel>;
    /// Insert a batch of tasks in a single transaction.
    async fn create_tasks(&self, tasks: &[TaskDbModel]) -> Result<()>;
    async fn tasks_for_job(&self, job_id: &str) -> Result<Vec<TaskDbModel>>;
    async fn tasks_by_id(&self, ids: &[String]) -> Result<Vec<TaskDbModel>>;
    /// Minimal (id, status, parents) projection of a job's tasks.
    async fn task_graph(&self, job_id: &str) -> Result<Vec<TaskGraphNode>>;
    async fn distinct_statuses(&self, job_id: &str) -> Result<Vec<TaskStatus>>;
    async fn count_tasks(&self, job_id: &str) -> Result<u64>;
    async fn count_tasks_with_status(&self, job_id: &str, status: TaskStatus) -> Result<u64>;

    /// Flip all tasks of a job from one status to another, optionally
    /// recording an activity note. Returns the number of modified tasks.
    async fn set_status_for_job(
        &self,
        job_id: &str,
        from: TaskStatus,
        to: TaskStatus,
        activity: Option<&str>,
    ) -> Result<u64>;
    /// Flip all tasks of a job whose status is in `from` to `to`.
    async fn set_status_where_in(
        &self,
        job_id: &str,
        from: &[TaskStatus],
        to: TaskStatus,
        activity: Option<&str>,
    ) -> Result<u64>;
    /// Flip all tasks of a job whose status is NOT in `excluded` to `to`.
    async fn set_status_where_not_in(
        &self,
        job_id: &str,
        excluded: &[TaskStatus],
        to: TaskStatus,
        activity: Option<&str>,
    ) -> Result<u64>;
    /// Unconditionally re-queue the given tasks.
    async fn requeue_tasks_by_id(&self, ids: &[String], activity: &str) -> Result<u64>;

    /// Queued tasks of the given manager whose job is in a schedulable
    /// status, ordered by job priority, then task priority, then creation.
    async fn scheduler_candidates(
        &self,
        manager_id: &str,
        job_type: Option<&str>,
    ) -> Result<Vec<TaskDbModel>>;
    /// Status lookup for a set of task IDs.
    async fn statuses_by_id(&self, ids: &[String]) -> Result<HashMap<String, TaskStatus>>;
    /// Atomically claim the given queued tasks for a Manager. Returns the
    /// IDs that were actually claimed; tasks grabbed by a concurrent
    /// scheduler call in the meantime are simply absent.
    async fn claim_tasks(&self, ids: &[String]) -> Result<Vec<String>>;

    /// Apply a Manager-reported partial update to one task.
    async fn apply_manager_update(&self, task_id: &str, update: &TaskFieldUpdate) -> Result<u64>;
    /// IDs of all `cancel-requested` tasks owned by a Manager.
    async fn cancel_requested_ids(&self, manager_id: &str) -> Result<Vec<String>>;

    /// Tasks of a job that no other task lists as a parent, i.e. the
    /// possible "ender" tasks of the DAG.
    async fn find_job_enders(&self, job_id: &str) -> Result<Vec<String>>;

    async fn delete_tasks_for_job(&self, job_id: &str) -> Result<u64>;
    /// Keep the denormalized `job_priority` on tasks in sync.
    async fn sync_job_priority(&self, job_id: &str, priority: i64) -> Result<u64>;

    /// Store a full task log chunk, overwriting a duplicate delivery of
    /// the same update.
    async fn store_task_log(&self, log: &TaskLogDbModel) -> Result<()>;
    async fn logs_for_task(&self, task_id: &str) -> Result<Vec<TaskLogDbModel>>;
    async fn delete_logs_for_job(&self, job_id: &str) -> Result<u64>;
}

/// SQLx implementation of TaskRepository.
pub struct SqlxTaskRepository {
    pool: SqlitePool,
}

impl SqlxTaskRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn placeholders(n: usize) -> String {
        std::iter::repeat_n("?", n).join(", ")
    }
}

#[async_trait]
impl TaskRepository for SqlxTaskRepository {
    async fn get_task(&self, id: &str) -> Result<TaskDbModel> {
        sqlx::query_as::<_, TaskDbModel>("SELECT * FROM tasks WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| Error::not_found("Task", id))
    }

    async fn create_tasks(&self, tasks: &[TaskDbModel]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for task in tasks {
            sqlx::query(
                r#"
                INSERT INTO tasks (
                    id, job_id, manager_id, user_id, project_id, name, status,
                    job_type, task_type, commands, priority, job_priority, parents,
                    worker, activity, failed_by_workers,
                    task_progress_percentage, current_command_index, command_progress_percentage,
                    log_tail, log_file, created_at, updated_at
                )
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&task.id)
            .bind(&task.job_id)
            .bind(&task.manager_id)
            .bind(&task.user_id)
            .bind(&task.project_id)
            .bind(&task.name)
            .bind(&task.status)
            .bind(&task.job_type)
            .bind(&task.task_type)
            .bind(&task.commands)
            .bind(task.priority)
            .bind(task.job_priority)
            .bind(&task.parents)
            .bind(&task.worker)
            .bind(&task.activity)
            .bind(&task.failed_by_workers)
            .bind(task.task_progress_percentage)
            .bind(task.current_command_index)
            .bind(task.command_progress_percentage)
            .bind(&task.log_tail)
            .bind(&task.log_file)
            .bind(&task.created_at)
            .bind(&task.updated_at)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn tasks_for_job(&self, job_id: &str) -> Result<Vec<TaskDbModel>> {
        let tasks = sqlx::query_as::<_, TaskDbModel>(
            "SELECT * FROM tasks WHERE job_id = ? ORDER BY rowid",
        )
        .bind(job_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(tasks)
    }

    async fn tasks_by_id(&self, ids: &[String]) -> Result<Vec<TaskDbModel>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let sql = format!(
            "SELECT * FROM tasks WHERE id IN ({}) ORDER BY job_priority DESC, priority DESC, rowid",
            Self::placeholders(ids.len())
        );
        let mut query = sqlx::query_as::<_, TaskDbModel>(&sql);
        for id in ids {
            query = query.bind(id);
        }
        Ok(query.fetch_all(&self.pool).await?)
    }

    async fn task_graph(&self, job_id: &str) -> Result<Vec<TaskGraphNode>> {
        let nodes = sqlx::query_as::<_, TaskGraphNode>(
            "SELECT id, status, parents FROM tasks WHERE job_id = ? ORDER BY rowid",
        )
        .bind(job_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(nodes)
    }

    async fn distinct_statuses(&self, job_id: &str) -> Result<Vec<TaskStatus>> {
        let raw: Vec<String> =
            sqlx::query_scalar("SELECT DISTINCT status FROM tasks WHERE job_id = ?")
                .bind(job_id)
                .fetch_all(&self.pool)
                .await?;
        Ok(raw.iter().filter_map(|s| TaskStatus::parse(s)).collect())
    }

    async fn count_tasks(&self, job_id: &str) -> Result<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM tasks WHERE job_id = ?")
            .bind(job_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(count as u64)
    }

    async fn count_tasks_with_status(&self, job_id: &str, status: TaskStatus) -> Result<u64> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM tasks WHERE job_id = ? AND status = ?")
                .bind(job_id)
                .bind(status.as_str())
                .fetch_one(&self.pool)
                .await?;
        Ok(count as u64)
    }

    async fn set_status_for_job(
        &self,
        job_id: &str,
        from: TaskStatus,
        to: TaskStatus,
        activity: Option<&str>,
    ) -> Result<u64> {
        self.set_status_where_in(job_id, &[from], to, activity).await
    }

    async fn set_status_where_in(
        &self,
        job_id: &str,
        from: &[TaskStatus],
        to: TaskStatus,
        activity: Option<&str>,
    ) -> Result<u64> {
        if from.is_empty() {
            return Ok(0);
        }
        let sql = format!(
            r#"
            UPDATE tasks
            SET status = ?, activity = COALESCE(?, activity), updated_at = ?
            WHERE job_id = ? AND status IN ({})
            "#,
            Self::placeholders(from.len())
        );
        let mut query = sqlx::query(&sql)
            .bind(to.as_str())
            .bind(activity)
            .bind(now_rfc3339())
            .bind(job_id);
        for status in from {
            query = query.bind(status.as_str());
        }
        let result = query.execute(&self.pool).await?;
        Ok(result.rows_affected())
    }

    async fn set_status_where_not_in(
        &self,
        job_id: &str,
        excluded: &[TaskStatus],
        to: TaskStatus,
        activity: Option<&str>,
    ) -> Result<u64> {
        let sql = format!(
            r#"
            UPDATE tasks
            SET status = ?, activity = COALESCE(?, activity), updated_at = ?
            WHERE job_id = ? AND status NOT IN ({})
            "#,
            Self::placeholders(excluded.len().max(1))
        );
        let mut query = sqlx::query(&sql)
            .bind(to.as_str())
            .bind(activity)
            .bind(now_rfc3339())
            .bind(job_id);
        if excluded.is_empty() {
            // NOT IN () is invalid SQL; bind a status value that never
            // occurs so the clause matches everything.
            query = query.bind("");
        } else {
            for status in excluded {
                query = query.bind(status.as_str());
            }
        }
        let result = query.execute(&self.pool).await?;
        Ok(result.rows_affected())
    }

    async fn requeue_tasks_by_id(&self, ids: &[String], activity: &str) -> Result<u64> {
        if ids.is_empty() {
            return Ok(0);
        }
        let sql = format!(
            "UPDATE tasks SET status = 'queued', activity = ?, updated_at = ? WHERE id IN ({})",
            Self::placeholders(ids.len())
        );
        let mut query = sqlx::query(&sql).bind(activity).bind(now_rfc3339());
        for id in ids {
            query = query.bind(id);
        }
        let result = query.execute(&self.pool).await?;
        Ok(result.rows_affected())
    }

    async fn scheduler_candidates(
        &self,
        manager_id: &str,
        job_type: Option<&str>,
    ) -> Result<Vec<TaskDbModel>> {
        let mut sql = String::from(
            r#"
            SELECT t.* FROM tasks t
            JOIN jobs j ON j.id = t.job_id
            WHERE t.manager_id = ?
              AND t.status = 'queued'
              AND j.status IN ('queued', 'active', 'cancel-requested')
            "#,
        );
        if job_type.is_some() {
            sql.push_str(" AND t.job_type = ?");
        }
        sql.push_str(" ORDER BY t.job_priority DESC, t.priority DESC, t.rowid");

        let mut query = sqlx::query_as::<_, TaskDbModel>(&sql).bind(manager_id);
        if let Some(job_type) = job_type {
            query = query.bind(job_type);
        }
        Ok(query.fetch_all(&self.pool).await?)
    }

    async fn statuses_by_id(&self, ids: &[String]) -> Result<HashMap<String, TaskStatus>> {
        if ids.is_empty() {
            return Ok(HashMap::new());
        }
        let sql = format!(
            "SELECT id, status FROM tasks WHERE id IN ({})",
            Self::placeholders(ids.len())
        );
        let mut query = sqlx::query_as::<_, (String, String)>(&sql);
        for id in ids {
            query = query.bind(id);
        }
        let rows = query.fetch_all(&self.pool).await?;
        Ok(rows
            .into_iter()
            .filter_map(|(id, status)| TaskStatus::parse(&status).map(|s| (id, s)))
            .collect())
    }

    async fn claim_tasks(&self, ids: &[String]) -> Result<Vec<String>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        // Single atomic update-many; the status precondition is re-checked
        // at write time so two concurrent claims can never overlap.
        let sql = format!(
            r#"
            UPDATE tasks
            SET status = 'claimed-by-manager', updated_at = ?
            WHERE id IN ({}) AND status = 'queued'
            RETURNING id
            "#,
            Self::placeholders(ids.len())
        );
        let mut query = sqlx::query_scalar::<_, String>(&sql).bind(now_rfc3339());
        for id in ids {
            query = query.bind(id);
        }
        Ok(query.fetch_all(&self.pool).await?)
    }

    async fn apply_manager_update(&self, task_id: &str, update: &TaskFieldUpdate) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE tasks SET
                status = COALESCE(?, status),
                activity = COALESCE(?, activity),
                worker = COALESCE(?, worker),
                task_progress_percentage = COALESCE(?, task_progress_percentage),
                current_command_index = COALESCE(?, current_command_index),
                command_progress_percentage = COALESCE(?, command_progress_percentage),
                log_tail = COALESCE(?, log_tail),
                failed_by_workers = COALESCE(?, failed_by_workers),
                updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(update.status.map(|s| s.as_str()))
        .bind(&update.activity)
        .bind(&update.worker)
        .bind(update.task_progress_percentage)
        .bind(update.current_command_index)
        .bind(update.command_progress_percentage)
        .bind(&update.log_tail)
        .bind(&update.failed_by_workers)
        .bind(now_rfc3339())
        .bind(task_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn cancel_requested_ids(&self, manager_id: &str) -> Result<Vec<String>> {
        let ids = sqlx::query_scalar::<_, String>(
            "SELECT id FROM tasks WHERE manager_id = ? AND status = 'cancel-requested'",
        )
        .bind(manager_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(ids)
    }

    async fn find_job_enders(&self, job_id: &str) -> Result<Vec<String>> {
        let nodes = self.task_graph(job_id).await?;
        let parent_ids: HashSet<String> = nodes
            .iter()
            .flat_map(|node| node.get_parents())
            .collect();
        Ok(nodes
            .into_iter()
            .map(|node| node.id)
            .filter(|id| !parent_ids.contains(id))
            .collect())
    }

    async fn delete_tasks_for_job(&self, job_id: &str) -> Result<u64> {
        let result = sqlx::query("DELETE FROM tasks WHERE job_id = ?")
            .bind(job_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn sync_job_priority(&self, job_id: &str, priority: i64) -> Result<u64> {
        let result =
            sqlx::query("UPDATE tasks SET job_priority = ?, updated_at = ? WHERE job_id = ?")
                .bind(priority)
                .bind(now_rfc3339())
                .bind(job_id)
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected())
    }

    async fn store_task_log(&self, log: &TaskLogDbModel) -> Result<()> {
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO task_logs (id, task_id, received_at, log)
            VALUES (?, ?, ?, ?)
            "#,
        )
        .bind(&log.id)
        .bind(&log.task_id)
        .bind(&log.received_at)
        .bind(&log.log)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn logs_for_task(&self, task_id: &str) -> Result<Vec<TaskLogDbModel>> {
        let logs = sqlx::query_as::<_, TaskLogDbModel>(
            "SELECT * FROM task_logs WHERE task_id = ? ORDER BY received_at, id",
        )
        .bind(task_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(logs)
    }

    async fn delete_logs_for_job(&self, job_id: &str) -> Result<u64> {
        let result = sqlx::query(
            "DELETE FROM task_logs WHERE task_id IN (SELECT id FROM tasks WHERE job_id = ?)",
        )
        .bind(job_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}
