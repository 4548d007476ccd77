use std::sync::Arc;
use std::time::Duration;

use dotenv::dotenv;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod api;
mod backup;
mod config;
mod sites;

use backup::command::SystemCommandRunner;
use backup::executor::BackupExecutor;
use backup::registry::JobRegistry;
use backup::restore::RestoreService;
use backup::scheduler::AutoBackupScheduler;
use config::PanelConfig;
use sites::FsSiteDirectory;

#[tokio::main]
async fn main() {
    // Load .env file
    dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "site_backup_panel=debug,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = PanelConfig::from_env();
    info!(
        sites_root = %config.sites_root.display(),
        use_sudo = config.use_sudo,
        "Loaded panel configuration"
    );

    let shutdown = CancellationToken::new();
    let runner = Arc::new(SystemCommandRunner::new(config.use_sudo));
    let registry = Arc::new(JobRegistry::new(config.registry_policy()));
    let executor = BackupExecutor::new(
        registry,
        runner.clone(),
        config.backup_timeouts(),
        shutdown.clone(),
    );
    let sites = Arc::new(FsSiteDirectory::new(&config.sites_root));

    let scheduler = AutoBackupScheduler::new(sites.clone(), executor.clone(), config.scheduler())
        .spawn(shutdown.clone());

    let state = Arc::new(api::AppState {
        sites,
        executor,
        restore: RestoreService::new(runner, config.restore_timeout()),
    });
    let app = api::router(state);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .expect("Failed to bind listener");
    info!(addr = %config.bind_addr, "Server starting");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("Server error");

    // Running jobs are marked as cancelled and their tools killed
    shutdown.cancel();
    let _ = tokio::time::timeout(Duration::from_secs(5), scheduler).await;
    info!("Shutdown complete");
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl-C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    info!("Shutdown signal received");
}
