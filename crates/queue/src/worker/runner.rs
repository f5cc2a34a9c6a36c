//! Sequential worker loop
//!
//! A worker owns one dedicated connection and runs batch cycles on it until
//! the queue is drained or cancellation is requested.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::batch::{BatchTransaction, CycleOutcome};
use super::pool::PoolStats;
use super::sink::ErrorReporter;
use crate::persistence::QueueConnection;

/// Lifecycle of a single worker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    /// Running batch cycles
    Running,
    /// Stop decided, releasing the connection
    Draining,
    /// Terminal
    Stopped,
}

/// Why a worker stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerExit {
    /// A claim returned no items
    Drained,
    /// Cancellation was observed between cycles
    Cancelled,
}

pub(crate) struct WorkerParams {
    pub id: usize,
    pub conn: Box<dyn QueueConnection>,
    pub batch_size: usize,
    pub error_backoff: Duration,
    pub reporter: ErrorReporter,
    pub shutdown: CancellationToken,
    pub stats: Arc<PoolStats>,
}

pub(crate) struct Worker {
    id: usize,
    conn: Box<dyn QueueConnection>,
    batch_size: usize,
    error_backoff: Duration,
    reporter: ErrorReporter,
    shutdown: CancellationToken,
    stats: Arc<PoolStats>,
    state: watch::Sender<WorkerState>,
}

impl Worker {
    pub(crate) fn new(params: WorkerParams) -> (Self, watch::Receiver<WorkerState>) {
        let (state, state_rx) = watch::channel(WorkerState::Running);

        let worker = Self {
            id: params.id,
            conn: params.conn,
            batch_size: params.batch_size,
            error_backoff: params.error_backoff,
            reporter: params.reporter,
            shutdown: params.shutdown,
            stats: params.stats,
            state,
        };

        (worker, state_rx)
    }

    pub(crate) async fn run(self) -> WorkerExit {
        let Worker {
            id,
            mut conn,
            batch_size,
            error_backoff,
            reporter,
            shutdown,
            stats,
            state,
        } = self;

        let cycle = BatchTransaction::new(id, batch_size, &reporter);
        let mut consecutive_failures: u32 = 0;

        debug!(worker_id = id, batch_size, "worker started");

        let exit = loop {
            // Checked between cycles only; an open transaction always
            // finishes first.
            if shutdown.is_cancelled() {
                break WorkerExit::Cancelled;
            }

            match cycle.run(conn.as_mut()).await {
                CycleOutcome::Drained => {
                    stats.record_drained();
                    break WorkerExit::Drained;
                }
                CycleOutcome::Committed { items } => {
                    consecutive_failures = 0;
                    stats.record_commit(items);
                }
                CycleOutcome::Failed => {
                    consecutive_failures += 1;
                    stats.record_failure();
                    warn!(
                        worker_id = id,
                        consecutive_failures, "batch cycle failed, retrying"
                    );

                    if !error_backoff.is_zero() {
                        tokio::select! {
                            _ = tokio::time::sleep(error_backoff) => {}
                            _ = shutdown.cancelled() => {}
                        }
                    }
                }
            }
        };

        state.send_replace(WorkerState::Draining);
        drop(conn);
        state.send_replace(WorkerState::Stopped);

        match exit {
            WorkerExit::Drained => info!(worker_id = id, "queue drained, worker stopped"),
            WorkerExit::Cancelled => info!(worker_id = id, "cancellation observed, worker stopped"),
        }

        exit
    }
}
