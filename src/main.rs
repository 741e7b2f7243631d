//! Caller Admission Engine — Binary Entrypoint
//! Boots the Axum HTTP server, wiring the decision engine, background
//! workers (learning drain, whitelist expiry sweep) and metrics.

use std::sync::Arc;

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use caller_admission_engine::api::{create_router, AppState};
use caller_admission_engine::config::EngineConfig;
use caller_admission_engine::engine::DecisionEngine;
use caller_admission_engine::learning::spawn_expiry_sweep;
use caller_admission_engine::metrics::Metrics;

fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("engine=info,warn"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().compact())
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env in local/dev; no-op in prod environments.
    let _ = dotenvy::dotenv();
    init_tracing();

    let config = EngineConfig::load()?;
    let metrics = Metrics::init(config.features_ttl_secs, config.ml_result_ttl_secs);

    let engine = Arc::new(DecisionEngine::in_memory(config.clone()));

    // Background workers: learning drain + whitelist expiry sweep.
    let _learning_worker = engine.learning().spawn_worker(config.drain_interval_secs);
    let _sweep_worker = spawn_expiry_sweep(engine.whitelist().clone(), config.sweep_interval_secs);

    let router = create_router(AppState {
        engine: engine.clone(),
    })
    .merge(metrics.router());

    let port: u16 = std::env::var("PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(8080);
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
    tracing::info!(target: "engine", port, "caller admission engine listening");
    axum::serve(listener, router).await?;
    Ok(())
}
