//! InnSync Server - channel sync runtime for property management.
//!
//! Publishes staged ARI changes to distribution channels and ingests their
//! reservations, over HTTP endpoints for the surrounding application.

use std::sync::Arc;

use innsync_server::channel::HttpTransport;
use innsync_server::config::{Config, StoreKind};
use innsync_server::db::{self, MemoryStore, PgStore, SyncStore};
use innsync_server::worker::{self, Runner};
use innsync_server::{build_router, AppState};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "innsync_server=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    dotenvy::dotenv().ok();
    let config = Config::from_env()?;

    tracing::info!("Starting InnSync Server on {}:{}", config.host, config.port);

    let store: Arc<dyn SyncStore> = match (config.store, config.database_url.as_deref()) {
        (StoreKind::Postgres, Some(url)) => {
            let pool = db::create_pool(url).await?;
            tracing::info!("Running database migrations...");
            db::run_migrations(&pool).await?;
            Arc::new(PgStore::new(pool))
        }
        (StoreKind::Postgres, None) => return Err("DATABASE_URL is required".into()),
        (StoreKind::Memory, _) => {
            tracing::warn!("Using in-memory store; state is lost on restart");
            Arc::new(MemoryStore::new())
        }
    };

    let transport = Arc::new(HttpTransport::new(
        &config.channel_base_url,
        &config.channel_auth_path,
    )?);
    let addr = format!("{}:{}", config.host, config.port);
    let state = AppState::new(store, transport, config);

    worker::recover_stalled(&state).await?;
    let runner = Runner::new(state.clone());
    tokio::spawn(runner.run());

    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Server listening on {}", addr);

    axum::serve(listener, app).await?;

    Ok(())
}
