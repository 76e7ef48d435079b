use std::sync::Arc;

use anyhow::Result;
use axum::extract::DefaultBodyLimit;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

mod config;
mod engine;
mod error;
mod ingest;
mod qdrant;
mod routes;

use config::Config;
use qdrant::QdrantClient;
use routes::AppState;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config = Config::from_env();
    tracing::info!(
        bind = %config.bind,
        model = %config.encoder_model_path(),
        qdrant = %config.qdrant_url,
        collection = %config.qdrant_collection,
        image_size = config.image_size,
        "faceprintd starting"
    );

    // Fail fast: a missing or broken model should stop the daemon here.
    let engine = engine::spawn_engine(
        &config.encoder_model_path(),
        config.image_size,
        config.batch_size,
        config.flip_augment,
    )?;

    let qdrant = QdrantClient::new(&config.qdrant_url, &config.qdrant_collection);

    let bind = config.bind.clone();
    let max_upload_bytes = config.max_upload_bytes;
    let state = Arc::new(AppState::new(config, engine, qdrant));

    let app = routes::routes(state)
        .layer(TraceLayer::new_for_http())
        .layer(DefaultBodyLimit::max(max_upload_bytes));

    let listener = tokio::net::TcpListener::bind(&bind).await?;
    tracing::info!(addr = %listener.local_addr()?, "faceprintd ready");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("faceprintd shutting down");
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
