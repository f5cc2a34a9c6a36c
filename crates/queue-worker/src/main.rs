// pgq worker
//
// Drains the pgq_items table with a pool of claim/mark/commit workers and
// stops on Ctrl+C.

mod config;
mod database;
mod telemetry;

use std::sync::Arc;

use anyhow::{Context, Result};
use pgq_queue::persistence::PostgresQueueStore;
use pgq_queue::worker::WorkerPool;
use tracing::{info, warn};

use crate::config::{load_env_files, AppConfig};

#[tokio::main]
async fn main() -> Result<()> {
    let (environment, env_files) = load_env_files();

    let config = AppConfig::from_env().context("Failed to load configuration")?;
    telemetry::init_logging(config.pretty_log);

    info!(
        environment = %environment,
        env_files = ?env_files,
        pool_size = config.pool.pool_size,
        batch_size = config.pool.batch_size,
        grace_period_ms = config.pool.grace_period.as_millis() as u64,
        "Starting pgq worker"
    );

    let db = database::connect(&config.database, config.pool.pool_size)
        .await
        .context("Failed to connect to database")?;
    let store = PostgresQueueStore::new(db);

    if config.run_migrations {
        store.migrate().await.context("Failed to run migrations")?;
        info!("Migrations applied");
    }

    match store.backlog_len().await {
        Ok(backlog) => info!(backlog, "Queue backlog at startup"),
        Err(e) => warn!(error = %e, "Failed to read queue backlog"),
    }

    let pool = WorkerPool::new(Arc::new(store.clone()), config.pool.clone());

    let token = pool.cancellation_token();
    tokio::spawn(async move {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                match result {
                    Ok(()) => {
                        info!("Received shutdown signal");
                        token.cancel();
                    }
                    Err(e) => warn!(error = %e, "Failed to listen for shutdown signal"),
                }
            }
            _ = token.cancelled() => {}
        }
    });

    let report = pool.run().await.context("Worker pool failed to start")?;

    info!(
        run_id = %report.run_id,
        items_processed = report.items_processed,
        cycles_failed = report.cycles_failed,
        errors_dropped = report.errors_dropped,
        cancelled = report.cancelled,
        "Worker stopped"
    );

    store.pool().close().await;

    Ok(())
}
