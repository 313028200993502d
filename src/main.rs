//! Quote Compare - insurance quote extraction and comparison server.

mod api;
mod config;
mod encoding;
mod error;
mod export;
mod extraction;
mod fetch;
mod gemini;
mod pipeline;
mod prompts;
mod retry;
mod sanitize;
mod schema;
mod store;
mod sweeper;
mod synthesis;
#[cfg(test)]
mod testing;

use std::sync::Arc;

use anyhow::Context;
use api::AppState;
use config::AppConfig;
use fetch::HttpFetcher;
use gemini::{GeminiClient, ModelProvider};
use store::memory::MemoryStore;
use store::supabase::SupabaseStore;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| "quote_compare=debug,tower_http=debug".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = AppConfig::from_env().context("Failed to load configuration")?;

    let provider: Option<Arc<dyn ModelProvider>> = match GeminiClient::from_config(&config.gemini) {
        Some(client) => {
            info!("Gemini client initialized (model: {})", config.gemini.model);
            Some(Arc::new(client))
        }
        None => {
            warn!("GEMINI_API_KEY not set; comparisons will fail until it is configured");
            None
        }
    };

    let fetcher = Arc::new(HttpFetcher::new());
    let state = match &config.supabase {
        Some(supabase) => {
            info!("Using Supabase store at {}", supabase.url);
            AppState::from_store(
                Arc::new(SupabaseStore::new(supabase)),
                fetcher,
                provider,
                &config.pipeline,
            )
        }
        None => {
            info!("Using in-memory store");
            AppState::from_store(
                Arc::new(MemoryStore::new(config.public_base_url.clone())),
                fetcher,
                provider,
                &config.pipeline,
            )
        }
    };

    sweeper::spawn(state.comparisons.clone(), config.sweeper.clone());
    info!(
        "Stale-run sweeper every {}s (threshold {}s)",
        config.sweeper.interval.as_secs(),
        config.sweeper.stale_after.as_secs()
    );

    let app = api::router(state);

    // Run server
    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("Failed to bind {}", config.bind_addr))?;
    info!("Server listening on http://{}", config.bind_addr);
    axum::serve(listener, app).await?;

    Ok(())
}
