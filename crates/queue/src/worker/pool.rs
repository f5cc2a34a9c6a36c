//! Worker pool for draining the queue
//!
//! Starts a fixed number of workers, each on its own connection, waits for
//! all of them to stop, then honors a grace period before reporting.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument};
use uuid::Uuid;

use super::runner::{Worker, WorkerExit, WorkerParams, WorkerState};
use super::shutdown::ShutdownCoordinator;
use super::sink::ErrorSink;
use crate::persistence::{QueueStore, StoreError};

/// Worker pool configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PoolConfig {
    /// Number of workers, one dedicated connection each
    pub pool_size: usize,

    /// Maximum items claimed per transaction
    pub batch_size: usize,

    /// Wait after all workers stop before declaring shutdown complete
    #[serde(with = "duration_millis")]
    pub grace_period: Duration,

    /// Error sink buffer size
    pub error_capacity: usize,

    /// How long a worker waits for error sink buffer space
    #[serde(with = "duration_millis")]
    pub error_send_timeout: Duration,

    /// Pause after a failed cycle
    #[serde(with = "duration_millis")]
    pub error_backoff: Duration,

    /// Interval between progress log lines
    #[serde(with = "duration_millis")]
    pub progress_interval: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            pool_size: 10,
            batch_size: 1000,
            grace_period: Duration::from_secs(3),
            error_capacity: 256,
            error_send_timeout: Duration::from_secs(1),
            error_backoff: Duration::from_secs(1),
            progress_interval: Duration::from_secs(5),
        }
    }
}

impl PoolConfig {
    /// Create a configuration with the given sizes
    pub fn new(pool_size: usize, batch_size: usize) -> Self {
        Self {
            pool_size,
            batch_size,
            ..Default::default()
        }
    }

    /// Set the number of workers
    pub fn with_pool_size(mut self, size: usize) -> Self {
        self.pool_size = size;
        self
    }

    /// Set the batch size
    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size;
        self
    }

    /// Set the post-drain grace period
    pub fn with_grace_period(mut self, period: Duration) -> Self {
        self.grace_period = period;
        self
    }

    /// Set the error sink buffer size
    pub fn with_error_capacity(mut self, capacity: usize) -> Self {
        self.error_capacity = capacity;
        self
    }

    /// Set the error send timeout
    pub fn with_error_send_timeout(mut self, timeout: Duration) -> Self {
        self.error_send_timeout = timeout;
        self
    }

    /// Set the pause after a failed cycle
    pub fn with_error_backoff(mut self, backoff: Duration) -> Self {
        self.error_backoff = backoff;
        self
    }

    /// Set the progress log interval
    pub fn with_progress_interval(mut self, interval: Duration) -> Self {
        self.progress_interval = interval;
        self
    }

    /// Check the sizes are usable
    pub fn validate(&self) -> Result<(), WorkerPoolError> {
        if self.error_capacity == 0 {
            return Err(WorkerPoolError::InvalidConfig(
                "error_capacity must be at least 1".to_string(),
            ));
        }
        if self.pool_size == 0 {
            return Err(WorkerPoolError::InvalidConfig(
                "pool_size must be at least 1".to_string(),
            ));
        }
        if self.batch_size == 0 {
            return Err(WorkerPoolError::InvalidConfig(
                "batch_size must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Worker pool errors
///
/// Only startup problems surface here; errors inside batch cycles go to the
/// error sink.
#[derive(Debug, thiserror::Error)]
pub enum WorkerPoolError {
    /// Configuration rejected
    #[error("invalid pool configuration: {0}")]
    InvalidConfig(String),

    /// A worker connection could not be acquired
    #[error("failed to acquire connection for worker {worker_id}: {source}")]
    Acquire {
        worker_id: usize,
        #[source]
        source: StoreError,
    },

    /// `run` was already called on this pool
    #[error("worker pool has already been started")]
    AlreadyStarted,
}

/// Aggregate counters shared by all workers
#[derive(Debug, Default)]
pub struct PoolStats {
    items_processed: AtomicU64,
    cycles_committed: AtomicU64,
    cycles_failed: AtomicU64,
    workers_drained: AtomicU64,
}

impl PoolStats {
    pub(crate) fn record_commit(&self, items: usize) {
        self.items_processed
            .fetch_add(items as u64, Ordering::Relaxed);
        self.cycles_committed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_failure(&self) {
        self.cycles_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_drained(&self) {
        self.workers_drained.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> PoolStatsSnapshot {
        PoolStatsSnapshot {
            items_processed: self.items_processed.load(Ordering::Relaxed),
            cycles_committed: self.cycles_committed.load(Ordering::Relaxed),
            cycles_failed: self.cycles_failed.load(Ordering::Relaxed),
            workers_drained: self.workers_drained.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`PoolStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolStatsSnapshot {
    pub items_processed: u64,
    pub cycles_committed: u64,
    pub cycles_failed: u64,
    pub workers_drained: u64,
}

/// Summary of a completed run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolReport {
    pub run_id: Uuid,
    pub items_processed: u64,
    pub cycles_committed: u64,
    pub cycles_failed: u64,
    pub workers_drained: u64,
    /// Workers that stopped because cancellation was observed
    pub workers_cancelled: u64,
    /// Worker tasks that panicked
    pub workers_failed: u64,
    pub errors_reported: u64,
    pub errors_dropped: u64,
    /// Cancellation was requested before every worker drained
    pub cancelled: bool,
    pub elapsed: Duration,
}

/// Fixed-size pool of queue workers
///
/// # Example
///
/// ```ignore
/// use pgq_queue::{PoolConfig, PostgresQueueStore, WorkerPool};
///
/// let store = Arc::new(PostgresQueueStore::new(pg_pool));
/// let pool = WorkerPool::new(store, PoolConfig::new(10, 1000));
///
/// let token = pool.cancellation_token();
/// tokio::spawn(async move {
///     tokio::signal::ctrl_c().await.ok();
///     token.cancel();
/// });
///
/// let report = pool.run().await?;
/// ```
pub struct WorkerPool {
    store: Arc<dyn QueueStore>,
    config: PoolConfig,
    shutdown: ShutdownCoordinator,
    stats: Arc<PoolStats>,
    states: Mutex<Vec<watch::Receiver<WorkerState>>>,
    started: AtomicBool,
}

impl WorkerPool {
    /// Create a new worker pool
    pub fn new(store: Arc<dyn QueueStore>, config: PoolConfig) -> Self {
        let shutdown = ShutdownCoordinator::new(config.grace_period);

        Self {
            store,
            config,
            shutdown,
            stats: Arc::new(PoolStats::default()),
            states: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
        }
    }

    /// Token that stops the pool when cancelled
    pub fn cancellation_token(&self) -> CancellationToken {
        self.shutdown.cancellation_token()
    }

    /// Request cancellation; workers stop after their current cycle
    pub fn shutdown(&self) {
        info!("Shutdown requested");
        self.shutdown.cancel();
    }

    /// Current state of every started worker
    pub fn worker_states(&self) -> Vec<WorkerState> {
        self.states.lock().iter().map(|rx| *rx.borrow()).collect()
    }

    /// Current aggregate counters
    pub fn stats(&self) -> PoolStatsSnapshot {
        self.stats.snapshot()
    }

    /// Run until every worker has stopped.
    ///
    /// Fails before any worker starts if the configuration is invalid or a
    /// connection cannot be acquired. Once workers run, errors are only
    /// reported through the error sink.
    #[instrument(skip(self), fields(pool_size = self.config.pool_size, batch_size = self.config.batch_size))]
    pub async fn run(&self) -> Result<PoolReport, WorkerPoolError> {
        self.config.validate()?;
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(WorkerPoolError::AlreadyStarted);
        }

        let run_id = Uuid::now_v7();
        let started_at = Instant::now();

        info!(%run_id, "Starting worker pool");

        let sink = ErrorSink::start(self.config.error_capacity, self.config.error_send_timeout);

        let mut conns = Vec::with_capacity(self.config.pool_size);
        for worker_id in 0..self.config.pool_size {
            match self.store.acquire().await {
                Ok(conn) => conns.push(conn),
                Err(source) => {
                    error!(worker_id, error = %source, "Failed to acquire connection");
                    drop(conns);
                    sink.close().await;
                    return Err(WorkerPoolError::Acquire { worker_id, source });
                }
            }
        }

        let mut handles = Vec::with_capacity(conns.len());
        {
            let mut states = self.states.lock();
            for (id, conn) in conns.into_iter().enumerate() {
                let (worker, state) = Worker::new(WorkerParams {
                    id,
                    conn,
                    batch_size: self.config.batch_size,
                    error_backoff: self.config.error_backoff,
                    reporter: sink.reporter(),
                    shutdown: self.shutdown.worker_token(),
                    stats: Arc::clone(&self.stats),
                });
                states.push(state);
                handles.push((id, self.shutdown.spawn(worker.run())));
            }
        }

        let progress = self.spawn_progress_reporter();

        info!(workers = handles.len(), "processing");
        self.shutdown.wait_for_workers().await;

        let mut workers_cancelled = 0;
        let mut workers_failed = 0;
        for (worker_id, handle) in handles {
            match handle.await {
                Ok(WorkerExit::Cancelled) => workers_cancelled += 1,
                Ok(WorkerExit::Drained) => {}
                Err(e) => {
                    workers_failed += 1;
                    error!(worker_id, "worker task failed: {}", e);
                }
            }
        }

        let cancelled = self.shutdown.is_cancelled();
        self.shutdown.cancel();
        if progress.await.is_err() {
            debug!("progress reporter ended abnormally");
        }

        info!(
            grace_period_ms = self.shutdown.grace_period().as_millis() as u64,
            "done! waiting for all in flights to finish"
        );
        self.shutdown.grace().await;

        let sink_stats = sink.close().await;
        let snapshot = self.stats.snapshot();

        let report = PoolReport {
            run_id,
            items_processed: snapshot.items_processed,
            cycles_committed: snapshot.cycles_committed,
            cycles_failed: snapshot.cycles_failed,
            workers_drained: snapshot.workers_drained,
            workers_cancelled,
            workers_failed,
            errors_reported: sink_stats.reported,
            errors_dropped: sink_stats.dropped,
            cancelled,
            elapsed: started_at.elapsed(),
        };

        info!(
            %run_id,
            items_processed = report.items_processed,
            cycles_failed = report.cycles_failed,
            workers_cancelled = report.workers_cancelled,
            workers_failed = report.workers_failed,
            errors_reported = report.errors_reported,
            errors_dropped = report.errors_dropped,
            cancelled = report.cancelled,
            elapsed_ms = report.elapsed.as_millis() as u64,
            "no more work to do, shutting down"
        );

        Ok(report)
    }

    /// Log aggregate counters until the pool is cancelled
    fn spawn_progress_reporter(&self) -> JoinHandle<()> {
        let stats = Arc::clone(&self.stats);
        let token = self.shutdown.cancellation_token();
        let interval = self.config.progress_interval.max(Duration::from_millis(1));

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick completes immediately
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let s = stats.snapshot();
                        info!(
                            items_processed = s.items_processed,
                            cycles_committed = s.cycles_committed,
                            cycles_failed = s.cycles_failed,
                            workers_drained = s.workers_drained,
                            "progress"
                        );
                    }
                    _ = token.cancelled() => break,
                }
            }
        })
    }
}

/// Serde support for Duration as milliseconds
mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
