use rust_nvr::config::AppConfig;
use rust_nvr::services::ServiceContainer;
use rust_nvr::logging;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    let config = AppConfig::from_env()?;
    let _log_guard = logging::init(&config.log_dir)?;

    info!(
        recordings_root = %config.recordings_root.display(),
        database_url = %config.database_url,
        "rust-nvr starting"
    );

    let container = ServiceContainer::new(&config).await?;
    let tasks = container.start();

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    container.shutdown().await;
    for task in tasks {
        let _ = task.await;
    }

    Ok(())
}
