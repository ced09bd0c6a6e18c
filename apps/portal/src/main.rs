mod auth;
mod config;
mod errors;
mod models;
mod routes;
mod state;

use anyhow::Result;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::auth::gotrue::GoTrueProvider;
use crate::auth::resolver::{AuthBackend, SessionResolver};
use crate::auth::store::{FallbackStore, FileStore, MemoryStore};
use crate::config::Config;
use crate::routes::build_router;
use crate::state::AppState;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    // Initialize structured logging
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new(format!("{}={}", env!("CARGO_PKG_NAME"), &config.rust_log))
        }))
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting portal v{}", env!("CARGO_PKG_VERSION"));

    let store = build_fallback_store(&config)?;

    // Mode is decided here once and never re-derived.
    let backend = match &config.remote_auth {
        Some(remote) => {
            info!("Remote identity provider configured at {}", remote.url);
            AuthBackend::Remote(GoTrueProvider::new(
                &remote.url,
                &remote.anon_key,
                store.clone(),
            )?)
        }
        None => {
            info!("No remote identity provider configured; running in local mode");
            AuthBackend::Local
        }
    };

    let resolver = SessionResolver::start(backend, store).await;
    if resolver.identity().is_some() {
        // Show the cached role now; swap in the authoritative one if it loads.
        if let Err(e) = resolver.refresh_role().await {
            tracing::warn!("Startup role refresh failed: {e}");
        }
    }

    let state = AppState {
        resolver,
        config: config.clone(),
    };

    let app = build_router(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive()); // TODO: restrict origins once the portal UI has a fixed host

    let addr: SocketAddr = format!("0.0.0.0:{}", config.port).parse()?;
    info!("Listening on {addr}");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

/// Persists the fallback record on disk when a path is configured.
fn build_fallback_store(config: &Config) -> Result<Arc<dyn FallbackStore>> {
    match &config.fallback_store_path {
        Some(path) => {
            let store = FileStore::open(path)?;
            info!("Fallback store at {}", store.path().display());
            Ok(Arc::new(store))
        }
        None => {
            info!("Fallback store is in-memory");
            Ok(Arc::new(MemoryStore::new()))
        }
    }
}
