use flamenco_server::config::ServerConfig;
use flamenco_server::services::ServiceContainer;
use flamenco_server::{database, logging};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables before anything reads them.
    dotenvy::dotenv().ok();
    let _log_guard = logging::init();

    let config = ServerConfig::from_env()?;

    let pool = database::init_pool(&config.database_url).await?;
    database::run_migrations(&pool).await?;

    let container = ServiceContainer::new(pool, config).await?;
    tracing::info!("flamenco-server initialized");

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown signal received");
    container.shutdown().await;

    Ok(())
}
