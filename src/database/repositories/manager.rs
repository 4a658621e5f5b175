//! Manager repository.

use async_trait::async_trait;
use sqlx::SqlitePool;

use crate::database::models::ManagerDbModel;
use crate::database::now_rfc3339;
use crate::{Error, Result};

/// Manager repository trait.
#[async_trait]
pub trait ManagerRepository: Send + Sync {
    async fn get_manager(&self, id: &str) -> Result<ManagerDbModel>;
    async fn upsert_manager(&self, manager: &ManagerDbModel) -> Result<()>;
    /// Store a startup/update notification's fields verbatim.
    async fn store_notification(
        &self,
        id: &str,
        url: &str,
        variables: &str,
        path_replacement: &str,
        worker_task_types: Option<&str>,
        nr_of_workers: i64,
    ) -> Result<()>;
}

/// SQLx implementation of ManagerRepository.
pub struct SqlxManagerRepository {
    pool: SqlitePool,
}

impl SqlxManagerRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ManagerRepository for SqlxManagerRepository {
    async fn get_manager(&self, id: &str) -> Result<ManagerDbModel> {
        sqlx::query_as::<_, ManagerDbModel>("SELECT * FROM managers WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| Error::not_found("Manager", id))
    }

    async fn upsert_manager(&self, manager: &ManagerDbModel) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO managers (
                id, name, url, variables, path_replacement, worker_task_types,
                nr_of_workers, created_at, updated_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (id) DO UPDATE SET
                name = excluded.name,
                url = excluded.url,
                variables = excluded.variables,
                path_replacement = excluded.path_replacement,
                worker_task_types = excluded.worker_task_types,
                nr_of_workers = excluded.nr_of_workers,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&manager.id)
        .bind(&manager.name)
        .bind(&manager.url)
        .bind(&manager.variables)
        .bind(&manager.path_replacement)
        .bind(&manager.worker_task_types)
        .bind(manager.nr_of_workers)
        .bind(&manager.created_at)
        .bind(&manager.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn store_notification(
        &self,
        id: &str,
        url: &str,
        variables: &str,
        path_replacement: &str,
        worker_task_types: Option<&str>,
        nr_of_workers: i64,
    ) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE managers SET
                url = ?,
                variables = ?,
                path_replacement = ?,
                worker_task_types = COALESCE(?, worker_task_types),
                nr_of_workers = ?,
                updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(url)
        .bind(variables)
        .bind(path_replacement)
        .bind(worker_task_types)
        .bind(nr_of_workers)
        .bind(now_rfc3339())
        .bind(id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(Error::not_found("Manager", id));
        }
        Ok(())
    }
}
