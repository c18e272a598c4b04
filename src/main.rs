//! Entry point: load config, wire dependencies, and run the server.

use axum::routing::get_service;
use roundcast::{create_app, AppState, Config, Hub, JetStreamRepository};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let config = Config::from_env().map_err(|e| anyhow::anyhow!("config: {}", e))?;

    let filter =
        EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(&config.log_level))?;
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    let stream = JetStreamRepository::connect(&config.nats_url).await;
    stream.ensure_streams().await;

    let hub = Hub::new(stream.clone());
    tokio::spawn(hub.clone().run());

    let state = AppState { hub, stream };

    let app = create_app(state)
        // Root (/): the competition UI
        .route_service(
            "/",
            get_service(tower_http::services::ServeFile::new("static/index.html")),
        );

    tracing::info!(addr = %config.server_addr, "listening");
    let listener = tokio::net::TcpListener::bind(config.server_addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}
