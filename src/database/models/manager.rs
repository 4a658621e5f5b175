//! Manager database model.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Manager database model.
///
/// A Manager is a remote fleet controller that polls the scheduler for
/// tasks. The startup notification fields (`url`, `variables`,
/// `path_replacement`, `worker_task_types`, `nr_of_workers`) are stored
/// verbatim as the Manager reports them.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct ManagerDbModel {
    pub id: String,
    pub name: String,
    pub url: String,
    /// JSON object of variable replacements, e.g. {"blender": "..."}.
    pub variables: String,
    /// JSON object of path replacement variables.
    pub path_replacement: String,
    /// JSON array of supported task types; NULL means the Manager did not
    /// report any restriction and supports everything.
    pub worker_task_types: Option<String>,
    pub nr_of_workers: i64,
    pub created_at: String,
    pub updated_at: String,
}

impl ManagerDbModel {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        let now = crate::database::now_rfc3339();
        Self {
            id: id.into(),
            name: name.into(),
            url: String::new(),
            variables: "{}".to_string(),
            path_replacement: "{}".to_string(),
            worker_task_types: None,
            nr_of_workers: 0,
            created_at: now.clone(),
            updated_at: now,
        }
    }

    /// The task types this Manager's workers can run, or `None` when the
    /// Manager never reported a restriction.
    pub fn get_worker_task_types(&self) -> Option<Vec<String>> {
        let raw = self.worker_task_types.as_deref()?;
        serde_json::from_str(raw).ok()
    }

    /// Whether this Manager can run tasks of the given type.
    pub fn supports_task_type(&self, task_type: &str) -> bool {
        match self.get_worker_task_types() {
            Some(types) => types.iter().any(|t| t == task_type),
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_supports_task_type() {
        let mut manager = ManagerDbModel::new("manager-1", "farm");
        assert!(manager.supports_task_type("video-encoding"));

        manager.worker_task_types = Some(r#"["blender-render", "file-management"]"#.to_string());
        assert!(manager.supports_task_type("blender-render"));
        assert!(!manager.supports_task_type("video-encoding"));
    }
}
