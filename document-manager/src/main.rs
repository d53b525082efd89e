use document_manager::config::Settings;
use document_manager::services::init_metrics;
use document_manager::startup::Application;
use service_core::observability::init_tracing;
use tokio::signal;

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
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
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let settings = Settings::load()?;

    init_tracing(
        "document-manager",
        &settings.observability.log_level,
        settings.observability.otlp_endpoint.as_deref(),
    )?;

    // Must be installed before any metrics are recorded.
    init_metrics()?;

    tracing::info!(
        backend = ?settings.storage.backend,
        database = %settings.database.name,
        "Starting document-manager"
    );

    let application = Application::build(settings).await.map_err(|e| {
        tracing::error!("Failed to build application: {}", e);
        e
    })?;

    application.run_until(shutdown_signal()).await?;

    tracing::info!("Server stopped");
    Ok(())
}
