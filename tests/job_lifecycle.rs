//! Job compilation and status-machine integration tests.

mod common;

use std::collections::HashSet;

use flamenco_server::Error;
use flamenco_server::database::models::{JobStatus, TaskStatus};
use flamenco_server::database::repositories::{JobRepository, TaskRepository};

use common::*;

#[tokio::test]
async fn test_compile_sleep_job() {
    let harness = harness().await;
    let container = &harness.container;
    register_manager(container, None).await;

    let job = create_sleep_job(container, "1-30,40-44", 13).await;
    assert_eq!(job.get_status(), Some(JobStatus::Queued));
    assert_eq!(job.tasks_total, 3);

    let tasks = container.task_repository.tasks_for_job(&job.id).await.unwrap();
    let names: Vec<&str> = tasks.iter().map(|t| t.name.as_str()).collect();
    assert_eq!(names, vec!["sleep-1-13", "sleep-14-26", "sleep-27-30,40-44"]);

    for task in &tasks {
        assert_eq!(task.get_status(), Some(TaskStatus::Queued));
        assert!(task.is_root());
        let commands = task.get_commands().unwrap();
        assert_eq!(commands.len(), 2);
        assert_eq!(commands[0].name(), "echo");
        assert_eq!(commands[1].name(), "sleep");
    }
}

#[tokio::test]
async fn test_start_paused_job() {
    let harness = harness().await;
    let container = &harness.container;
    register_manager(container, None).await;

    let mut request = sleep_job_request("1-10", 5);
    request.start_paused = true;
    let job = container.job_manager.create_job(request).await.unwrap();

    assert_eq!(job.get_status(), Some(JobStatus::Paused));
    for task in container.task_repository.tasks_for_job(&job.id).await.unwrap() {
        assert_eq!(task.get_status(), Some(TaskStatus::Paused));
    }
    // Paused tasks are invisible to the scheduler.
    let scheduled = container
        .scheduler
        .schedule_tasks(MANAGER_ID, 10, None)
        .await
        .unwrap();
    assert!(scheduled.is_empty());
}

#[tokio::test]
async fn test_missing_settings_reject_creation() {
    let harness = harness().await;
    let container = &harness.container;
    register_manager(container, None).await;

    let mut request = sleep_job_request("1-10", 5);
    request.settings = serde_json::json!({"frames": "1-10"});
    let err = container.job_manager.create_job(request).await.unwrap_err();

    match err {
        Error::JobSetting(message) => {
            assert!(message.contains("chunk_size"));
            assert!(message.contains("time_in_seconds"));
        }
        other => panic!("expected JobSetting error, got {other:?}"),
    }
}

#[tokio::test]
async fn test_invalid_priority_rejected() {
    let harness = harness().await;
    let container = &harness.container;
    register_manager(container, None).await;

    let mut request = sleep_job_request("1-10", 5);
    request.priority = 0;
    assert!(container.job_manager.create_job(request).await.is_err());

    let mut request = sleep_job_request("1-10", 5);
    request.priority = 101;
    assert!(container.job_manager.create_job(request).await.is_err());
}

#[tokio::test]
async fn test_cancel_cascade_waits_for_active_task() {
    let harness = harness().await;
    let container = &harness.container;
    register_manager(container, None).await;

    let job = create_sleep_job(container, "1-3", 1).await;

    // One task becomes active, two stay queued.
    let claimed = container
        .scheduler
        .schedule_tasks(MANAGER_ID, 1, None)
        .await
        .unwrap();
    assert_eq!(claimed.len(), 1);
    let active_task_id = claimed[0].id.clone();
    report_status(container, &[active_task_id.clone()], "active").await;

    let job_doc = container.job_repository.get_job(&job.id).await.unwrap();
    assert_eq!(job_doc.get_status(), Some(JobStatus::Active));

    container
        .job_manager
        .set_job_status_str(&job.id, "cancel-requested", None)
        .await
        .unwrap();

    // The active task must be confirmed by the Manager; the queued ones
    // are canceled unilaterally.
    let tasks = container.task_repository.tasks_for_job(&job.id).await.unwrap();
    for task in &tasks {
        if task.id == active_task_id {
            assert_eq!(task.get_status(), Some(TaskStatus::CancelRequested));
        } else {
            assert_eq!(task.get_status(), Some(TaskStatus::Canceled));
        }
    }
    let job_doc = container.job_repository.get_job(&job.id).await.unwrap();
    assert_eq!(job_doc.get_status(), Some(JobStatus::CancelRequested));

    // The Manager's confirmation settles the job.
    report_status(container, &[active_task_id], "canceled").await;
    let job_doc = container.job_repository.get_job(&job.id).await.unwrap();
    assert_eq!(job_doc.get_status(), Some(JobStatus::Canceled));
}

#[tokio::test]
async fn test_cancel_with_nothing_running_settles_immediately() {
    let harness = harness().await;
    let container = &harness.container;
    register_manager(container, None).await;

    let job = create_sleep_job(container, "1-2", 1).await;
    let claimed = container
        .scheduler
        .schedule_tasks(MANAGER_ID, 10, None)
        .await
        .unwrap();
    let task_ids: Vec<String> = claimed.iter().map(|t| t.id.clone()).collect();
    report_status(container, &task_ids, "completed").await;

    let job_doc = container.job_repository.get_job(&job.id).await.unwrap();
    assert_eq!(job_doc.get_status(), Some(JobStatus::Completed));

    // No task ends up cancel-requested, so the chain goes straight to
    // canceled without waiting for any Manager.
    container
        .job_manager
        .set_job_status_str(&job.id, "cancel-requested", None)
        .await
        .unwrap();
    let job_doc = container.job_repository.get_job(&job.id).await.unwrap();
    assert_eq!(job_doc.get_status(), Some(JobStatus::Canceled));
}

#[tokio::test]
async fn test_fail_percentage_threshold() {
    let harness = harness().await;
    let container = &harness.container;
    register_manager(container, None).await;

    // 20 tasks; one failure is 5%, two failures hit the 10% threshold.
    let job = create_sleep_job(container, "1-20", 1).await;
    let claimed = container
        .scheduler
        .schedule_tasks(MANAGER_ID, 20, None)
        .await
        .unwrap();
    assert_eq!(claimed.len(), 20);
    let task_ids: Vec<String> = claimed.iter().map(|t| t.id.clone()).collect();
    report_status(container, &task_ids, "active").await;

    report_status(container, &task_ids[..1], "failed").await;
    let job_doc = container.job_repository.get_job(&job.id).await.unwrap();
    assert_eq!(
        job_doc.get_status(),
        Some(JobStatus::Active),
        "a single failure below the threshold must be tolerated"
    );

    report_status(container, &task_ids[1..2], "failed").await;
    let job_doc = container.job_repository.get_job(&job.id).await.unwrap();
    assert_eq!(job_doc.get_status(), Some(JobStatus::Failed));
    assert!(job_doc.status_reason.unwrap().contains("2 of 20"));

    // The failure cascade asked the Manager to stop everything still
    // running.
    let tasks = container.task_repository.tasks_for_job(&job.id).await.unwrap();
    let cancel_requested = tasks
        .iter()
        .filter(|t| t.get_status() == Some(TaskStatus::CancelRequested))
        .count();
    assert_eq!(cancel_requested, 18);
}

#[tokio::test]
async fn test_requeue_after_failure() {
    let harness = harness().await;
    let container = &harness.container;
    register_manager(container, None).await;

    let job = create_sleep_job(container, "1-20", 1).await;
    let claimed = container
        .scheduler
        .schedule_tasks(MANAGER_ID, 20, None)
        .await
        .unwrap();
    let task_ids: Vec<String> = claimed.iter().map(|t| t.id.clone()).collect();
    report_status(container, &task_ids, "active").await;
    report_status(container, &task_ids[..2], "failed").await;
    // Confirm the cancellations so the job fully settles.
    let pending: Vec<String> = task_ids[2..].to_vec();
    report_status(container, &pending, "canceled").await;

    let job_doc = container.job_repository.get_job(&job.id).await.unwrap();
    assert_eq!(job_doc.get_status(), Some(JobStatus::Failed));

    container
        .job_manager
        .set_job_status_str(&job.id, "requeued", None)
        .await
        .unwrap();

    // Requeued chains to queued, with every non-completed task back in
    // the queue.
    let job_doc = container.job_repository.get_job(&job.id).await.unwrap();
    assert_eq!(job_doc.get_status(), Some(JobStatus::Queued));
    for task in container.task_repository.tasks_for_job(&job.id).await.unwrap() {
        assert_eq!(task.get_status(), Some(TaskStatus::Queued));
    }
}

#[tokio::test]
async fn test_requeue_failed_tasks_only() {
    let harness = harness().await;
    let container = &harness.container;
    register_manager(container, None).await;

    let job = create_sleep_job(container, "1-20", 1).await;
    let claimed = container
        .scheduler
        .schedule_tasks(MANAGER_ID, 20, None)
        .await
        .unwrap();
    let task_ids: Vec<String> = claimed.iter().map(|t| t.id.clone()).collect();
    report_status(container, &task_ids[..1], "failed").await;
    report_status(container, &task_ids[1..], "completed").await;

    let requeued = container
        .job_manager
        .requeue_failed_tasks(&job.id)
        .await
        .unwrap();
    assert_eq!(requeued, 1);

    let tasks = container.task_repository.tasks_for_job(&job.id).await.unwrap();
    let queued = tasks
        .iter()
        .filter(|t| t.get_status() == Some(TaskStatus::Queued))
        .count();
    assert_eq!(queued, 1);
}

#[tokio::test]
async fn test_forcing_queued_on_done_job_completes_it() {
    let harness = harness().await;
    let container = &harness.container;
    register_manager(container, None).await;

    let job = create_sleep_job(container, "1-2", 1).await;
    let claimed = container
        .scheduler
        .schedule_tasks(MANAGER_ID, 10, None)
        .await
        .unwrap();
    let task_ids: Vec<String> = claimed.iter().map(|t| t.id.clone()).collect();
    report_status(container, &task_ids, "completed").await;

    // All tasks are completed, so forcing the job back to queued chains
    // straight to completed again.
    container
        .job_manager
        .set_job_status_str(&job.id, "queued", None)
        .await
        .unwrap();
    let job_doc = container.job_repository.get_job(&job.id).await.unwrap();
    assert_eq!(job_doc.get_status(), Some(JobStatus::Completed));
}

#[tokio::test]
async fn test_requeued_task_reopens_completed_job() {
    let harness = harness().await;
    let container = &harness.container;
    register_manager(container, None).await;

    let job = create_sleep_job(container, "1-2", 1).await;
    let claimed = container
        .scheduler
        .schedule_tasks(MANAGER_ID, 10, None)
        .await
        .unwrap();
    let task_ids: Vec<String> = claimed.iter().map(|t| t.id.clone()).collect();
    report_status(container, &task_ids, "completed").await;

    container
        .job_manager
        .requeue_task_and_successors(&task_ids[0])
        .await
        .unwrap();

    let job_doc = container.job_repository.get_job(&job.id).await.unwrap();
    assert_eq!(job_doc.get_status(), Some(JobStatus::Queued));
    let task = container.task_repository.get_task(&task_ids[0]).await.unwrap();
    assert_eq!(task.get_status(), Some(TaskStatus::Queued));
}

#[tokio::test]
async fn test_recreate_job_produces_disjoint_task_ids() {
    let harness = harness().await;
    let container = &harness.container;
    register_manager(container, None).await;

    let job = create_sleep_job(container, "1-6", 2).await;
    let original_ids: HashSet<String> = container
        .task_repository
        .tasks_for_job(&job.id)
        .await
        .unwrap()
        .into_iter()
        .map(|t| t.id)
        .collect();
    assert_eq!(original_ids.len(), 3);

    // Recreation requires a settled job.
    let err = container.job_manager.recreate_job(&job.id).await.unwrap_err();
    assert!(matches!(err, Error::InvalidStateTransition { .. }));

    container
        .job_manager
        .set_job_status_str(&job.id, "cancel-requested", None)
        .await
        .unwrap();
    let recreated = container.job_manager.recreate_job(&job.id).await.unwrap();
    assert_eq!(recreated.get_status(), Some(JobStatus::Queued));

    let new_tasks = container.task_repository.tasks_for_job(&job.id).await.unwrap();
    assert_eq!(new_tasks.len(), original_ids.len());
    for task in &new_tasks {
        assert!(!original_ids.contains(&task.id), "task ID was reused");
        assert_eq!(task.get_status(), Some(TaskStatus::Queued));
    }
}

#[tokio::test]
async fn test_unknown_job_status_rejected() {
    let harness = harness().await;
    let container = &harness.container;
    register_manager(container, None).await;

    let job = create_sleep_job(container, "1-2", 1).await;
    let err = container
        .job_manager
        .set_job_status_str(&job.id, "totally-bogus", None)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidStatus { .. }));

    let job_doc = container.job_repository.get_job(&job.id).await.unwrap();
    assert_eq!(job_doc.get_status(), Some(JobStatus::Queued));
}

#[tokio::test]
async fn test_set_job_priority_syncs_tasks() {
    let harness = harness().await;
    let container = &harness.container;
    register_manager(container, None).await;

    let job = create_sleep_job(container, "1-4", 2).await;
    container.job_manager.set_job_priority(&job.id, 90).await.unwrap();

    let job_doc = container.job_repository.get_job(&job.id).await.unwrap();
    assert_eq!(job_doc.priority, 90);
    for task in container.task_repository.tasks_for_job(&job.id).await.unwrap() {
        assert_eq!(task.job_priority, 90);
    }

    assert!(container.job_manager.set_job_priority(&job.id, 0).await.is_err());
}

#[tokio::test]
async fn test_rna_override_syntax_error_rejected() {
    let harness = harness().await;
    let container = &harness.container;
    register_manager(container, None).await;

    let job = create_sleep_job(container, "1-2", 1).await;
    let err = container
        .job_manager
        .set_rna_overrides(
            &job.id,
            vec![
                "bpy.context.scene.cycles.samples = 400".to_string(),
                "not valid python at all!".to_string(),
            ],
        )
        .await
        .unwrap_err();

    match err {
        Error::RnaOverrideSyntax { line, .. } => assert_eq!(line, 2),
        other => panic!("expected RnaOverrideSyntax, got {other:?}"),
    }
    // Nothing was stored.
    let job_doc = container.job_repository.get_job(&job.id).await.unwrap();
    assert!(job_doc.setting("rna_overrides").is_none());

    container
        .job_manager
        .set_rna_overrides(&job.id, vec!["import bpy".to_string()])
        .await
        .unwrap();
    let job_doc = container.job_repository.get_job(&job.id).await.unwrap();
    assert!(job_doc.setting("rna_overrides").is_some());
}
