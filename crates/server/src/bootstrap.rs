use std::sync::Arc;

use expensa_core::config::{AppConfig, ConfigError, LoadOptions};
use expensa_db::{connect, migrations, DbPool};
use thiserror::Error;
use tracing::info;

use crate::audit::TracingAuditSink;
use crate::currency::{converter_from_config, ExchangeRateError};
use crate::workflow::{ExpenseWorkflow, Stores};

pub struct Application {
    pub config: AppConfig,
    pub db_pool: DbPool,
    pub workflow: ExpenseWorkflow,
}

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("database connection failed: {0}")]
    DatabaseConnect(#[source] sqlx::Error),
    #[error("database migration failed: {0}")]
    Migration(#[source] sqlx::migrate::MigrateError),
    #[error("exchange-rate client setup failed: {0}")]
    ExchangeRate(#[from] ExchangeRateError),
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

    let db_pool = connect(&config.database)
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

    let converter = converter_from_config(&config.currency)?;
    info!(
        event_name = "system.bootstrap.currency_configured",
        correlation_id = "bootstrap",
        currency_enabled = config.currency.enabled,
        "currency conversion configured"
    );

    let workflow = ExpenseWorkflow::new(
        Stores::sql(db_pool.clone()),
        converter,
        Arc::new(TracingAuditSink),
        config.approvals.no_rule_policy,
    );

    Ok(Application { config, db_pool, workflow })
}
