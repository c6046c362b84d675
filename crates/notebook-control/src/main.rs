use std::sync::Arc;

use notebook_control::{
    config::{ControlConfig, StoreKind},
    controller::LifecycleController,
    http,
    identity::ProjectUserResolver,
    state::AppState,
    store::{DbStore, MemoryStore, ServerStore},
};
use notebook_process::{HostLauncher, HostTerminator};
use sea_orm_migration::MigratorTrait;

async fn init_store(kind: &StoreKind) -> anyhow::Result<Arc<dyn ServerStore>> {
    match kind {
        StoreKind::Database(url) => {
            let db = notebook_db::connect(url).await?;

            // Apply migrations on boot (idempotent).
            notebook_migration::Migrator::up(&db, None).await?;
            Ok(Arc::new(DbStore::new(Arc::new(db))))
        }
        StoreKind::Memory => {
            tracing::warn!("NOTEBOOK_STORE=memory: server records are lost on restart");
            Ok(Arc::new(MemoryStore::default()))
        }
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutting down; running notebook servers are left in place");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = ControlConfig::from_env()?;
    let store = init_store(&config.store).await?;

    tracing::info!(
        data_root = %config.launcher.data_root.display(),
        command = %config.launcher.command,
        "notebook launcher configured"
    );
    let terminator = HostTerminator::new(config.terminator)
        .map_err(|e| anyhow::anyhow!("build shutdown HTTP client: {e}"))?;
    let controller = LifecycleController::new(
        store,
        Arc::new(HostLauncher::new(config.launcher.clone())),
        Arc::new(terminator),
        config.controller.clone(),
    );

    let state = AppState {
        controller: Arc::new(controller),
        identity: Arc::new(ProjectUserResolver::new(config.allowed_users.clone())),
    };
    let app = http::router(state);

    let addr = config.listen_addr;
    tracing::info!(%addr, "notebook-control HTTP listening");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}
