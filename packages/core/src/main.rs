use std::sync::Arc;

use clap::Parser;
use dotenvy::dotenv;
use tokio::net::TcpListener;

use gov_data_sync::api::create_router;
use gov_data_sync::cli::Cli;
use gov_data_sync::config::{load_source_definitions, AppConfig};
use gov_data_sync::error::AppError;
use gov_data_sync::logging::init_logging;
use gov_data_sync::services::HttpJsonSource;
use gov_data_sync::Engine;

#[tokio::main]
async fn main() {
    dotenv().ok();
    init_logging();

    let cli = Cli::parse();
    let config = AppConfig::from_env()
        .and_then(|config| config.apply_cli(&cli))
        .map_err(AppError::Config)
        .unwrap_or_else(|err| {
            tracing::error!("{}", err);
            std::process::exit(1);
        });

    if let Err(err) = run(config).await {
        tracing::error!("{}", err);
        std::process::exit(1);
    }
}

async fn run(config: AppConfig) -> Result<(), AppError> {
    tracing::info!("Service starting with config: {:?}", config);
    let engine = Arc::new(Engine::new(config.engine.clone())?);

    match &config.sources_file {
        Some(path) => {
            for definition in load_source_definitions(path)? {
                let adapter = Arc::new(HttpJsonSource::from_definition(&definition)?);
                engine
                    .register_data_source(&definition.name, adapter, definition.config.clone())
                    .await?;
            }
        }
        None => tracing::warn!("No sources file configured; engine starts empty"),
    }

    engine.start().await;

    let listener = TcpListener::bind(&config.bind_addr).await?;
    tracing::info!("API listening on {}", config.bind_addr);

    axum::serve(listener, create_router(Arc::clone(&engine)))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    engine.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", err);
        return;
    }
    tracing::info!("Shutdown signal received");
}
