use std::sync::Arc;

use anyhow::Result;
use tracing::{error, info};
use wsm_api::{create_app, start_background_tasks, AppState, Config};
use wsm_logging::{init_subscriber, LogSettings};
use wsm_orchestrator::db::{backup_database, create_pool, run_migrations};
use wsm_orchestrator::{ActivityTracker, MachineOrchestrator};
use wsm_provider::get_infrastructure;

#[tokio::main]
async fn main() -> Result<()> {
    let _log_guard = init_subscriber(&LogSettings::from_env());

    info!("Starting wsm-api service...");

    // Load configuration
    let config = Config::from_env();
    info!(
        "Configuration loaded: bind_addr={}, db_path={}, provider={}",
        config.bind_addr,
        config.db_path.display(),
        config.provider
    );

    // Backup before migrations
    let db_path = &config.db_path;
    if db_path.exists() {
        let backup_path = backup_database(db_path)?;
        info!("Database backed up to: {}", backup_path.display());
    }

    // Create pool and run migrations
    let pool = create_pool(db_path).await?;
    info!("Running database migrations...");
    run_migrations(&pool).await?;
    info!("Migrations complete");

    let infra = get_infrastructure(&config.infrastructure())?;
    let orchestrator = MachineOrchestrator::new(infra, pool, config.orchestrator());
    let activity = Arc::new(ActivityTracker::new(config.activity()));
    let state = AppState::new(orchestrator, activity);

    let tasks = start_background_tasks(&state, config.monitor());

    let app = create_app(state);

    // Start server
    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    info!("Listening on http://{}", config.bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tasks.abort();
    info!("wsm-api stopped");

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
        return;
    }
    info!("Shutdown signal received");
}
