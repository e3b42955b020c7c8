use std::path::PathBuf;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use transpector_server::{AppState, ServerConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // initialize tracing
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let config = ServerConfig::from_path_or_env(std::env::args_os().nth(1).map(PathBuf::from))?;
    tracing::info!("Serving {} models", config.models.len());
    let bind_address = config.bind_address.clone();

    let app = transpector_server::router(Arc::new(AppState::new(config)))
        .layer(TraceLayer::new_for_http());

    let listener = tokio::net::TcpListener::bind(&bind_address).await?;
    tracing::info!("Transpector server listening on {bind_address}");
    axum::serve(listener, app).await?;
    Ok(())
}
