//! Shared test harness: a file-backed SQLite store with migrations
//! applied and a fully wired service container.

#![allow(dead_code)]

use std::time::Duration;

use flamenco_server::config::ServerConfig;
use flamenco_server::database;
use flamenco_server::database::models::JobDbModel;
use flamenco_server::jobs::CreateJobRequest;
use flamenco_server::managers::ManagerStartupNotification;
use flamenco_server::scheduler::TaskUpdate;
use flamenco_server::services::ServiceContainer;

pub const MANAGER_ID: &str = "manager-1";

pub struct TestHarness {
    // Holds the database file alive for the duration of the test.
    _dir: tempfile::TempDir,
    pub container: ServiceContainer,
}

pub async fn harness() -> TestHarness {
    harness_with(|_| {}).await
}

pub async fn harness_with(tweak: impl FnOnce(&mut ServerConfig)) -> TestHarness {
    let dir = tempfile::TempDir::new().unwrap();
    let db_path = dir.path().join("flamenco-test.db");
    let db_url = format!(
        "sqlite:{}?mode=rwc",
        db_path.to_string_lossy().replace('\\', "/")
    );

    let pool = database::init_pool(&db_url).await.unwrap();
    database::run_migrations(&pool).await.unwrap();

    let mut config = ServerConfig {
        database_url: db_url,
        archive_storage_dir: dir.path().join("archive"),
        // Sweeps are driven explicitly in tests.
        runnability_check_interval: Duration::from_secs(3600),
        archive_resume_interval: Duration::from_secs(3600),
        ..ServerConfig::default()
    };
    tweak(&mut config);

    let container = ServiceContainer::new(pool, config).await.unwrap();
    TestHarness {
        _dir: dir,
        container,
    }
}

/// Register the test Manager, optionally restricting its worker task
/// types.
pub async fn register_manager(container: &ServiceContainer, task_types: Option<&[&str]>) {
    container
        .manager_service
        .register_manager(MANAGER_ID, "test-manager")
        .await
        .unwrap();
    container
        .manager_service
        .handle_startup_notification(
            MANAGER_ID,
            &ManagerStartupNotification {
                manager_url: "http://manager.local:8083/".to_string(),
                variables: serde_json::json!({"blender": "/usr/bin/blender"}),
                path_replacement: serde_json::json!({}),
                nr_of_workers: 4,
                worker_task_types: task_types
                    .map(|types| types.iter().map(|t| t.to_string()).collect()),
            },
        )
        .await
        .unwrap();
}

pub fn sleep_job_request(frames: &str, chunk_size: i64) -> CreateJobRequest {
    CreateJobRequest {
        name: "sleep test".to_string(),
        description: String::new(),
        job_type: "sleep".to_string(),
        settings: serde_json::json!({
            "frames": frames,
            "chunk_size": chunk_size,
            "time_in_seconds": 3,
        }),
        project_id: "project-1".to_string(),
        user_id: "user-1".to_string(),
        manager_id: MANAGER_ID.to_string(),
        priority: 50,
        start_paused: false,
    }
}

pub async fn create_sleep_job(
    container: &ServiceContainer,
    frames: &str,
    chunk_size: i64,
) -> JobDbModel {
    container
        .job_manager
        .create_job(sleep_job_request(frames, chunk_size))
        .await
        .unwrap()
}

pub fn blender_render_request(frames: &str, chunk_size: i64) -> CreateJobRequest {
    CreateJobRequest {
        name: "render test".to_string(),
        description: String::new(),
        job_type: "blender-render".to_string(),
        settings: serde_json::json!({
            "blender_cmd": "{blender}",
            "filepath": "/jobs/shot_010.blend",
            "render_output": "/render/shot_010/frames-######",
            "format": "EXR",
            "frames": frames,
            "chunk_size": chunk_size,
        }),
        project_id: "project-1".to_string(),
        user_id: "user-1".to_string(),
        manager_id: MANAGER_ID.to_string(),
        priority: 50,
        start_paused: false,
    }
}

/// A Manager status report for one task.
pub fn status_update(task_id: &str, status: &str) -> TaskUpdate {
    TaskUpdate {
        id: uuid::Uuid::new_v4().to_string(),
        task_id: task_id.to_string(),
        task_status: Some(status.to_string()),
        ..TaskUpdate::default()
    }
}

/// Report one status for a list of tasks in a single batch.
pub async fn report_status(container: &ServiceContainer, task_ids: &[String], status: &str) {
    let updates: Vec<TaskUpdate> = task_ids
        .iter()
        .map(|task_id| status_update(task_id, status))
        .collect();
    container
        .scheduler
        .task_update_batch(MANAGER_ID, &updates)
        .await
        .unwrap();
}
