use std::sync::Arc;

use esgflow_core::config::{AppConfig, ConfigError, LoadOptions};
use esgflow_db::{connect_with_settings, migrations, DbPool, SqlWorkflowBackend};
use thiserror::Error;
use tracing::info;

use crate::sla_registry::SlaRegistry;

pub struct Application {
    pub config: AppConfig,
    pub db_pool: DbPool,
    pub backend: Arc<SqlWorkflowBackend>,
    pub sla_monitors: Arc<SlaRegistry<SqlWorkflowBackend>>,
}

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("database connection failed: {0}")]
    DatabaseConnect(#[source] sqlx::Error),
    #[error("database migration failed: {0}")]
    Migration(#[source] sqlx::migrate::MigrateError),
}

pub async fn bootstrap(options: LoadOptions) -> Result<Application, BootstrapError> {
    let config = AppConfig::load(options)?;
    bootstrap_with_config(config).await
}

pub async fn bootstrap_with_config(config: AppConfig) -> Result<Application, BootstrapError> {
    info!(
        event_name = "system.bootstrap.start",
        correlation_id = "bootstrap",
        "starting application bootstrap"
    );

    let db_pool = connect_with_settings(
        &config.database.url,
        config.database.max_connections,
        config.database.timeout_secs,
    )
    .await
    .map_err(BootstrapError::DatabaseConnect)?;
    info!(
        event_name = "system.bootstrap.database_connected",
        correlation_id = "bootstrap",
        "database connection established"
    );

    migrations::run_pending(&db_pool).await.map_err(BootstrapError::Migration)?;
    info!(
        event_name = "system.bootstrap.migrations_applied",
        correlation_id = "bootstrap",
        "database migrations applied"
    );

    let backend =
        Arc::new(SqlWorkflowBackend::new(db_pool.clone()).with_sla_policy(config.sla.policy));
    let sla_monitors = Arc::new(SlaRegistry::new(
        Arc::clone(&backend),
        config.sla.poll_interval(),
        config.sla.critical_overdue_hours,
    ));

    Ok(Application { config, db_pool, backend, sla_monitors })
}
