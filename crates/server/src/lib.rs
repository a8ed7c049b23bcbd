pub mod api;
pub mod bootstrap;
pub mod health;
pub mod sla_registry;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use axum::Router;
use esgflow_core::backend::WorkflowBackend;
use esgflow_core::config::{AppConfig, LoadOptions};
use esgflow_db::DbPool;

use crate::api::ApiState;
use crate::sla_registry::SlaRegistry;

pub fn init_logging(config: &AppConfig) {
    use esgflow_core::config::LogFormat::*;
    use tracing::Level;

    let log_level = config.logging.level.parse::<Level>().unwrap_or(Level::INFO);

    match config.logging.format {
        Compact => {
            tracing_subscriber::fmt().with_target(false).with_max_level(log_level).compact().init();
        }
        Pretty => {
            tracing_subscriber::fmt().with_target(false).with_max_level(log_level).pretty().init();
        }
        Json => {
            tracing_subscriber::fmt().with_target(false).with_max_level(log_level).json().init();
        }
    }
}

/// Health probe plus the workflow API, sharing one listener.
pub fn app_router<B>(db_pool: DbPool, backend: Arc<B>, sla_monitors: Arc<SlaRegistry<B>>) -> Router
where
    B: WorkflowBackend + 'static,
{
    health::router(db_pool).merge(api::router(ApiState::new(backend, sla_monitors)))
}

pub async fn run() -> Result<()> {
    let config = AppConfig::load(LoadOptions::default())?;
    init_logging(&config);

    let app = bootstrap::bootstrap_with_config(config).await?;

    let address = format!("{}:{}", app.config.server.bind_address, app.config.server.port);
    let listener = tokio::net::TcpListener::bind(&address).await?;
    let router =
        app_router(app.db_pool.clone(), Arc::clone(&app.backend), Arc::clone(&app.sla_monitors));

    tracing::info!(
        event_name = "system.server.started",
        correlation_id = "bootstrap",
        bind_address = %address,
        "esgflow-server listening"
    );
    axum::serve(listener, router).with_graceful_shutdown(wait_for_shutdown()).await?;

    tracing::info!(
        event_name = "system.server.stopping",
        correlation_id = "shutdown",
        "esgflow-server stopping"
    );
    let grace = Duration::from_secs(app.config.server.graceful_shutdown_secs);
    if tokio::time::timeout(grace, app.sla_monitors.shutdown_all()).await.is_err() {
        tracing::warn!(
            event_name = "system.server.shutdown_timeout",
            correlation_id = "shutdown",
            grace_secs = grace.as_secs(),
            "SLA monitors did not stop within the grace period"
        );
    }
    app.db_pool.close().await;

    Ok(())
}

async fn wait_for_shutdown() {
    if let Err(error) = tokio::signal::ctrl_c().await {
        tracing::error!(
            event_name = "system.server.signal_error",
            correlation_id = "shutdown",
            error = %error,
            "failed to listen for shutdown signal"
        );
    }
}
