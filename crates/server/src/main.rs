use std::sync::Arc;

use db::DBService;
use server::{AppState, config::Config, routes};
use services::services::{
    cancellation::CancellationRegistry, generator::GenerationService, provider::GeminiProvider,
};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env()?;
    let db = DBService::new(&config.database_url).await?;
    let provider = Arc::new(GeminiProvider::new(
        config.gemini_api_key.clone(),
        config.gemini_model.clone(),
    ));
    let generation = GenerationService::new(db.clone(), provider, CancellationRegistry::new());

    let state = AppState {
        db,
        generation,
        config: Arc::new(config.clone()),
    };

    let listener = tokio::net::TcpListener::bind((config.host.as_str(), config.port)).await?;
    tracing::info!(host = %config.host, port = config.port, "listening");
    axum::serve(listener, routes::router(state)).await?;
    Ok(())
}
