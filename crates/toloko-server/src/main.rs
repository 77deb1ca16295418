use tracing::info;
use tracing_subscriber::EnvFilter;

use toloko_server::{api, AppState, ServerConfig};
use toloko_shared::constants::APP_NAME;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // -----------------------------------------------------------------------
    // 1. Initialize tracing (respects RUST_LOG env var)
    // -----------------------------------------------------------------------
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,toloko_server=debug")),
        )
        .init();

    info!("Starting {} messaging server v{}", APP_NAME, env!("CARGO_PKG_VERSION"));

    // -----------------------------------------------------------------------
    // 2. Load configuration
    // -----------------------------------------------------------------------
    let config = ServerConfig::from_env();
    info!(
        http_addr = %config.http_addr,
        database = %config.database_path.display(),
        uploads = %config.upload_dir.display(),
        session = ?config.session,
        "Loaded configuration"
    );
    let http_addr = config.http_addr;

    // -----------------------------------------------------------------------
    // 3. Open the database and start the registry
    // -----------------------------------------------------------------------
    let (state, registry_task) = AppState::init(config).await?;
    let registry = state.registry.clone();

    // -----------------------------------------------------------------------
    // 4. Run the HTTP server (blocks until shutdown)
    // -----------------------------------------------------------------------
    tokio::select! {
        result = api::serve(state, http_addr) => {
            if let Err(e) = result {
                tracing::error!(error = %e, "HTTP server failed");
                return Err(e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
        }
    }

    // -----------------------------------------------------------------------
    // 5. Close every live session
    // -----------------------------------------------------------------------
    registry.shutdown().await;
    if let Err(e) = registry_task.await {
        tracing::warn!(error = %e, "registry task ended abnormally");
    }

    Ok(())
}
