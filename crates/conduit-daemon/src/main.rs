use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use conduit_daemon::features::instance_lifecycle::controller::InstanceController;
use conduit_daemon::features::policy::controller::PolicyController;
use conduit_daemon::server::{router, AppState};
use conduit_daemon::{
    ContainerProvisioner, DaemonConfig, DaemonError, HealthMonitor, JsonFileStore,
    LifecycleManager, ManagerOptions, ObservabilityController, PolicyEngine, PolicyRules, Store,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = DaemonConfig::from_env()?;
    info!(addr = %config.addr, db_path = %config.db_path.display(), "Starting Conduit daemon");

    let rules = PolicyRules::load(config.policy_file.as_deref())?;
    let engine = Arc::new(PolicyEngine::new(rules)?);
    let store: Arc<dyn Store> = Arc::new(JsonFileStore::open(&config.db_path).await?);
    let provisioner = Arc::new(ContainerProvisioner::new(config.container_runtime.clone()));
    let metrics = ObservabilityController::build().map_err(DaemonError::Internal)?;

    let manager = LifecycleManager::new(
        store.clone(),
        engine.clone(),
        provisioner,
        metrics.clone(),
        ManagerOptions::from(&config),
    );
    manager.recover_interrupted().await?;

    let monitor = Arc::new(HealthMonitor::new(manager.clone()));
    let health_loop = monitor.spawn_periodic_checks();

    let state = AppState {
        instances: InstanceController::new(manager.clone()),
        policy: Arc::new(PolicyController::new(engine)),
        metrics,
    };

    let listener = tokio::net::TcpListener::bind(config.addr).await?;
    info!(addr = %config.addr, "Conduit daemon listening");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Shutting down");
    health_loop.abort();
    let cancelled = manager.cancel_all_operations();
    if cancelled > 0 {
        warn!(count = cancelled, "Cancelled in-flight operations");
    }
    manager.wait_for_operations().await;
    store.close().await?;

    info!("Conduit daemon stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(error) = tokio::signal::ctrl_c().await {
        warn!(error = %error, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
}
