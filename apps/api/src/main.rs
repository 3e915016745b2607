mod accounts;
mod config;
mod db;
mod errors;
mod models;
mod quota;
mod routes;
mod state;

use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::accounts::PgAccountStore;
use crate::config::{Config, CounterBackend};
use crate::db::create_pool;
use crate::quota::clock::{Clock, SystemClock};
use crate::quota::compaction::spawn_compaction;
use crate::quota::evaluator::QuotaEvaluator;
use crate::quota::policy::PolicyTable;
use crate::quota::store::{CounterStore, InMemoryCounterStore, PgCounterStore, RedisCounterStore};
use crate::routes::build_router;
use crate::state::AppState;

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration first (fails fast on missing required env vars)
    let config = Config::from_env()?;

    // Initialize structured logging
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new(format!("{}={}", env!("CARGO_CRATE_NAME"), &config.rust_log))
        }))
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting quota service v{}", env!("CARGO_PKG_VERSION"));

    // Initialize PostgreSQL (accounts, and counters when QUOTA_STORE=postgres)
    let db = create_pool(&config.database_url).await?;

    // Tier policy table: built-in limits, optionally overridden from file
    let policies = match &config.quota_policy_file {
        Some(path) => {
            info!("Loading quota policy overrides from {}", path.display());
            PolicyTable::from_file(path)
                .with_context(|| format!("Invalid quota policy file {}", path.display()))?
        }
        None => PolicyTable::defaults(),
    };

    // Counter store
    let store: Arc<dyn CounterStore> = match config.quota_store {
        CounterBackend::Redis => {
            let url = config
                .redis_url
                .clone()
                .context("REDIS_URL is required for the redis counter store")?;
            let client = redis::Client::open(url)?;
            info!("Quota counters stored in Redis (prefix '{}')", config.quota_key_prefix);
            Arc::new(RedisCounterStore::new(client, config.quota_key_prefix.clone()))
        }
        CounterBackend::Postgres => {
            info!("Quota counters stored in PostgreSQL");
            Arc::new(PgCounterStore::new(db.clone()))
        }
        CounterBackend::Memory => {
            info!("Quota counters stored in process memory");
            Arc::new(InMemoryCounterStore::new())
        }
    };

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let quota = Arc::new(QuotaEvaluator::new(policies, store.clone(), clock.clone()));
    spawn_compaction(store, clock, config.compaction_interval);

    // Build app state
    let state = AppState {
        quota,
        accounts: Arc::new(PgAccountStore::new(db)),
        config: config.clone(),
    };

    // Build router
    let app = build_router(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive()); // TODO: restrict CORS origins once the frontend domain is fixed

    let addr: SocketAddr = format!("0.0.0.0:{}", config.port).parse()?;
    info!("Listening on {addr}");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}
