//! Service container for dependency injection.
//!
//! Wires the repositories into the domain services and owns the
//! background workers' lifecycle. There is no request-bound global state;
//! everything reaches its collaborators through this container.

use std::sync::Arc;

use sqlx::SqlitePool;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::Result;
use crate::archival::{ArchiveQueue, Archiver};
use crate::compilers::CompilerRegistry;
use crate::config::ServerConfig;
use crate::database::repositories::{
    JobRepository, ManagerRepository, SqlxJobRepository, SqlxManagerRepository,
    SqlxTaskRepository, TaskRepository,
};
use crate::jobs::JobManager;
use crate::jobs::status::JobStatusMachine;
use crate::managers::ManagerService;
use crate::scheduler::Scheduler;
use crate::sweeps::SweepScheduler;
use crate::sweeps::runnability::RunnabilityChecker;

/// Service container holding all application services.
pub struct ServiceContainer {
    pub pool: SqlitePool,
    pub config: Arc<ServerConfig>,
    pub job_repository: Arc<dyn JobRepository>,
    pub task_repository: Arc<dyn TaskRepository>,
    pub manager_repository: Arc<dyn ManagerRepository>,
    pub status_machine: Arc<JobStatusMachine>,
    pub job_manager: Arc<JobManager>,
    pub scheduler: Arc<Scheduler>,
    pub manager_service: Arc<ManagerService>,
    pub archiver: Arc<Archiver>,
    pub archive_queue: ArchiveQueue,
    pub sweep_scheduler: Arc<SweepScheduler>,
    cancellation_token: CancellationToken,
    worker_handles: Vec<tokio::task::JoinHandle<()>>,
}

impl ServiceContainer {
    /// Create the container and spawn the background workers.
    pub async fn new(pool: SqlitePool, config: ServerConfig) -> Result<Self> {
        info!("initializing service container");
        let config = Arc::new(config);
        let cancellation_token = CancellationToken::new();

        let job_repository: Arc<dyn JobRepository> =
            Arc::new(SqlxJobRepository::new(pool.clone()));
        let task_repository: Arc<dyn TaskRepository> =
            Arc::new(SqlxTaskRepository::new(pool.clone()));
        let manager_repository: Arc<dyn ManagerRepository> =
            Arc::new(SqlxManagerRepository::new(pool.clone()));

        let status_machine = Arc::new(JobStatusMachine::new(
            job_repository.clone(),
            task_repository.clone(),
            config.clone(),
        ));

        let archiver = Arc::new(Archiver::new(
            job_repository.clone(),
            task_repository.clone(),
            status_machine.clone(),
            config.clone(),
        ));
        let (archive_queue, archive_handle) =
            archiver.clone().start(cancellation_token.child_token());

        let registry = Arc::new(CompilerRegistry::with_default_compilers());
        let job_manager = Arc::new(JobManager::new(
            job_repository.clone(),
            task_repository.clone(),
            manager_repository.clone(),
            status_machine.clone(),
            registry,
            archive_queue.clone(),
        ));

        let scheduler = Arc::new(Scheduler::new(
            task_repository.clone(),
            status_machine.clone(),
            config.clone(),
        ));
        let manager_service = Arc::new(ManagerService::new(manager_repository.clone()));

        let runnability = Arc::new(RunnabilityChecker::new(
            job_repository.clone(),
            task_repository.clone(),
            status_machine.clone(),
        ));
        let sweep_scheduler = Arc::new(SweepScheduler::new(
            runnability,
            archiver.clone(),
            archive_queue.clone(),
            config.clone(),
        ));
        let sweep_handle = sweep_scheduler
            .clone()
            .start(cancellation_token.child_token());

        info!("service container initialized");
        Ok(Self {
            pool,
            config,
            job_repository,
            task_repository,
            manager_repository,
            status_machine,
            job_manager,
            scheduler,
            manager_service,
            archiver,
            archive_queue,
            sweep_scheduler,
            cancellation_token,
            worker_handles: vec![archive_handle, sweep_handle],
        })
    }

    /// Stop the background workers and wait for them to finish.
    pub async fn shutdown(mut self) {
        info!("shutting down service container");
        self.cancellation_token.cancel();
        for handle in self.worker_handles.drain(..) {
            let _ = handle.await;
        }
        self.pool.close().await;
        info!("service container shut down");
    }
}
