use std::sync::Arc;

use shareservice::api::{ApiServer, ApiServerConfig, AppState};
use shareservice::config::ShareConfig;
use shareservice::database::{self, repositories::SqlxShareJobRepository};
use shareservice::logging::init_logging;
use shareservice::utils::fs::ensure_dir_all_with_op;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    let config = ShareConfig::from_env_or_default();

    let (logging, _log_guard) = init_logging(&config.log_dir)?;

    ensure_dir_all_with_op("creating work directory", &config.work_dir).await?;
    ensure_dir_all_with_op("creating staging directory", &config.staging_dir()).await?;

    let pool = database::init_pool_with_busy_timeout(&config.database_url, config.busy_timeout).await?;
    database::run_migrations(&pool).await?;

    if let Err(e) = config.ensure_api_key_configured() {
        tracing::warn!("{}; uploads, downloads and the queue will be refused", e);
    }

    let repository = Arc::new(SqlxShareJobRepository::new(pool.clone()));
    let state = AppState::new(Arc::new(config), repository);
    let server = ApiServer::with_state(ApiServerConfig::from_env_or_default(), state);

    let cancel_token = server.cancel_token();
    logging.start_retention_cleanup(cancel_token.clone());

    tokio::spawn(async move {
        shutdown_signal().await;
        cancel_token.cancel();
    });

    tracing::info!("shareservice initialized successfully");
    server.run().await?;

    pool.close().await;
    Ok(())
}

/// Wait for SIGINT or, on Unix, SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => tracing::info!("Received SIGINT, starting graceful shutdown"),
        () = terminate => tracing::info!("Received SIGTERM, starting graceful shutdown"),
    }
}
