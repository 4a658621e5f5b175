//! Manager registration and startup notifications.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::database::models::ManagerDbModel;
use crate::database::repositories::ManagerRepository;
use crate::{Error, Result};

/// Payload of a Manager's startup (or configuration update) notification.
/// Stored verbatim on the manager document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagerStartupNotification {
    pub manager_url: String,
    pub variables: serde_json::Value,
    pub path_replacement: serde_json::Value,
    pub nr_of_workers: i64,
    /// Task types the Manager's workers support; omitted means no
    /// restriction was reported.
    #[serde(default)]
    pub worker_task_types: Option<Vec<String>>,
}

pub struct ManagerService {
    managers: Arc<dyn ManagerRepository>,
}

impl ManagerService {
    pub fn new(managers: Arc<dyn ManagerRepository>) -> Self {
        Self { managers }
    }

    /// Register a Manager by ID, creating its document if needed.
    pub async fn register_manager(&self, id: &str, name: &str) -> Result<ManagerDbModel> {
        match self.managers.get_manager(id).await {
            Ok(manager) => Ok(manager),
            Err(Error::NotFound { .. }) => {
                info!(manager_id = id, "registering new manager");
                let manager = ManagerDbModel::new(id, name);
                self.managers.upsert_manager(&manager).await?;
                Ok(manager)
            }
            Err(e) => Err(e),
        }
    }

    /// Store a startup notification. Compilers read the stored
    /// `worker_task_types` to decide task-type availability.
    pub async fn handle_startup_notification(
        &self,
        manager_id: &str,
        notification: &ManagerStartupNotification,
    ) -> Result<()> {
        info!(manager_id, url = %notification.manager_url, "received startup notification");

        let worker_task_types = match &notification.worker_task_types {
            Some(types) => Some(serde_json::to_string(types)?),
            None => None,
        };
        self.managers
            .store_notification(
                manager_id,
                &notification.manager_url,
                &notification.variables.to_string(),
                &notification.path_replacement.to_string(),
                worker_task_types.as_deref(),
                notification.nr_of_workers,
            )
            .await
    }

    pub async fn get_manager(&self, id: &str) -> Result<ManagerDbModel> {
        self.managers.get_manager(id).await
    }
}
