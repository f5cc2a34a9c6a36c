// Database connection pool

use std::time::Duration;

use sqlx::postgres::{PgPool, PgPoolOptions};
use tracing::info;

use crate::config::DatabaseConfig;

/// Open a connection pool sized for the worker pool and verify it answers
///
/// Every worker pins one connection for its lifetime, so the pool must hold
/// at least `workers` connections; one extra is kept for migrations and
/// health queries.
pub async fn connect(config: &DatabaseConfig, workers: usize) -> Result<PgPool, sqlx::Error> {
    let max_connections = u32::try_from(workers + 1).unwrap_or(u32::MAX);

    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(Duration::from_secs(10))
        .connect_with(config.connect_options()?)
        .await?;

    sqlx::query("SELECT 1").execute(&pool).await?;

    info!(
        host = %config.host,
        database = %config.name,
        max_connections,
        "Connected to PostgreSQL"
    );

    Ok(pool)
}
