use std::sync::Arc;

use yoink::api::{ApiServer, ApiServerConfig};
use yoink::config::Config;
use yoink::services::ServiceContainer;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let _log_guard = yoink::logging::init(Some("logs"))?;

    let config = Config::from_env();
    let port = config.port;

    yoink::utils::fs::ensure_clean_temp_dirs();

    let services = Arc::new(ServiceContainer::new(config));
    services.start_background_tasks();

    let server_config = ApiServerConfig { port, ..ApiServerConfig::default() };
    let server = ApiServer::new(server_config, services.clone());

    // Link server shutdown to container shutdown.
    let server_cancel = server.cancel_token();
    let container_token = services.shutdown_token();
    tokio::spawn(async move {
        container_token.cancelled().await;
        server_cancel.cancel();
    });

    services.alerts.server_started(port);
    tracing::info!(port, "yoink ready");

    tokio::select! {
        result = server.run() => {
            if let Err(e) = result {
                tracing::error!(error = %e, "API server error");
            }
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutdown signal received");
        }
    }

    services.alerts.server_stopping();
    services.shutdown();
    // Give detached alert posts a moment to flush.
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;

    Ok(())
}
