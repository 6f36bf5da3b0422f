//! Database pool, migrations, and the repository layer.

pub mod repository;

pub use repository::{
    IdentityStore, ModelStore, PricingStore, ReconciliationStore, SqliteIdentityStore,
    SqliteModelStore, SqlitePricingStore, SqliteReconciliationStore, SqliteUsageStore,
    UsageFilter, UsageStatBucket, UsageStore, UsageSummary,
};

use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::str::FromStr;
use std::time::Duration;
use tracing::info;

use crate::config::DatabaseConfig;
use crate::domain::Result;

/// Shared handle to the SQLite pool. Postgres parity is declared as a cargo
/// feature; deployments that need it swap the pool type behind this facade.
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(&config.url)?
            .create_if_missing(true)
            .busy_timeout(Duration::from_secs(config.deduction_timeout_secs));

        let pool = SqlitePoolOptions::new()
            .max_connections(config.pool_size)
            .acquire_timeout(Duration::from_secs(5))
            .connect_with(options)
            .await?;

        info!(url = %config.url, pool_size = config.pool_size, "database connected");
        Ok(Self { pool })
    }

    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| crate::domain::GatewayError::Internal(format!("migration failed: {}", e)))?;
        info!("database migrations applied");
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}
