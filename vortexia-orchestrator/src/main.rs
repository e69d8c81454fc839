use anyhow::Context;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use vortexia_engine::Scheduler;

pub mod api;
pub mod config;
pub mod db;
pub mod repository;

use config::Config;
use repository::PgStore;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "vortexia_orchestrator=debug,vortexia_engine=debug,tower_http=debug".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Vortexia Orchestrator...");

    let config = Config::from_env()?;
    config.validate().context("Invalid configuration")?;

    tracing::info!(
        "Admission ceiling: {} active build(s) per pipeline",
        config.engine.max_active_builds_per_pipeline
    );

    tracing::info!("Connecting to database...");

    // Create database connection pool
    let pool = db::create_pool(&config.database_url, config.max_connections)
        .await
        .context("Failed to create database pool")?;

    tracing::info!("Database connection pool created");

    // Run migrations
    db::run_migrations(&pool)
        .await
        .context("Failed to run database migrations")?;

    let store = Arc::new(PgStore::new(pool));
    let scheduler = Scheduler::with_shell(config.engine.clone(), store.clone(), store);

    // Builds left active by a previous process have no task driving them
    let recovered = scheduler
        .recover_orphans()
        .await
        .context("Failed to recover orphaned builds")?;
    if recovered > 0 {
        tracing::warn!("Marked {} orphaned build(s) as failed", recovered);
    }

    // Build router with all API endpoints
    let app = api::create_router(scheduler);

    tracing::info!("Listening on {}", config.bind_addr);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("Failed to bind to {}", config.bind_addr))?;

    axum::serve(listener, app)
        .await
        .context("Failed to start server")?;

    Ok(())
}
