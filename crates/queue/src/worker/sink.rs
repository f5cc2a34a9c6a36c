//! Centralized error reporting
//!
//! Every worker reports failures through a cloneable [`ErrorReporter`]; a
//! single consumer task turns them into log lines. The channel is bounded and
//! producers give up after a timeout, so a slow consumer never stalls the
//! pool and a sustained outage cannot grow memory without limit.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::SendTimeoutError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

use crate::persistence::StoreError;

/// Store operation that produced an error
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Begin,
    Claim,
    MarkProcessed,
    Commit,
    Rollback,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Begin => write!(f, "begin"),
            Self::Claim => write!(f, "claim"),
            Self::MarkProcessed => write!(f, "mark_processed"),
            Self::Commit => write!(f, "commit"),
            Self::Rollback => write!(f, "rollback"),
        }
    }
}

/// A failed store operation, tagged with the worker that hit it
#[derive(Debug, thiserror::Error)]
#[error("worker {worker_id}: {operation} failed: {error}")]
pub struct ErrorEvent {
    pub worker_id: usize,
    pub operation: Operation,
    #[source]
    pub error: StoreError,
}

impl ErrorEvent {
    pub fn new(worker_id: usize, operation: Operation, error: StoreError) -> Self {
        Self {
            worker_id,
            operation,
            error,
        }
    }
}

/// Counters returned when the sink is closed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ErrorSinkStats {
    /// Events logged by the consumer
    pub reported: u64,
    /// Events dropped because the channel stayed full or was closed
    pub dropped: u64,
}

/// Producer side of the error sink
#[derive(Clone)]
pub struct ErrorReporter {
    tx: mpsc::Sender<ErrorEvent>,
    send_timeout: Duration,
    dropped: Arc<AtomicU64>,
}

impl ErrorReporter {
    /// Send an event to the sink.
    ///
    /// Waits at most the configured send timeout for buffer space. Returns
    /// `false` if the event was dropped.
    pub async fn report(&self, event: ErrorEvent) -> bool {
        match self.tx.send_timeout(event, self.send_timeout).await {
            Ok(()) => true,
            Err(SendTimeoutError::Timeout(event)) | Err(SendTimeoutError::Closed(event)) => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(
                    worker_id = event.worker_id,
                    operation = %event.operation,
                    error = %event.error,
                    dropped,
                    "error sink unavailable, dropping error event"
                );
                false
            }
        }
    }
}

/// Single-consumer error channel
///
/// # Example
///
/// ```ignore
/// let sink = ErrorSink::start(256, Duration::from_secs(1));
/// let reporter = sink.reporter();
/// reporter.report(ErrorEvent::new(0, Operation::Claim, err)).await;
/// let stats = sink.close().await;
/// ```
pub struct ErrorSink {
    reporter: ErrorReporter,
    close: CancellationToken,
    consumer: JoinHandle<u64>,
}

impl ErrorSink {
    /// Spawn the consumer task
    pub fn start(capacity: usize, send_timeout: Duration) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let close = CancellationToken::new();
        let consumer = tokio::spawn(consume(rx, close.clone()));

        Self {
            reporter: ErrorReporter {
                tx,
                send_timeout,
                dropped: Arc::new(AtomicU64::new(0)),
            },
            close,
            consumer,
        }
    }

    /// Get a new producer handle
    pub fn reporter(&self) -> ErrorReporter {
        self.reporter.clone()
    }

    /// Stop accepting events, drain everything already buffered, and return
    /// the final counters.
    pub async fn close(self) -> ErrorSinkStats {
        self.close.cancel();

        let reported = match self.consumer.await {
            Ok(reported) => reported,
            Err(e) => {
                error!("error sink consumer failed: {}", e);
                0
            }
        };

        ErrorSinkStats {
            reported,
            dropped: self.reporter.dropped.load(Ordering::Relaxed),
        }
    }
}

async fn consume(mut rx: mpsc::Receiver<ErrorEvent>, close: CancellationToken) -> u64 {
    let mut reported = 0;

    loop {
        tokio::select! {
            biased;

            event = rx.recv() => match event {
                Some(event) => {
                    log_event(&event);
                    reported += 1;
                }
                None => break,
            },
            _ = close.cancelled() => {
                rx.close();
                while let Some(event) = rx.recv().await {
                    log_event(&event);
                    reported += 1;
                }
                break;
            }
        }
    }

    reported
}

fn log_event(event: &ErrorEvent) {
    error!(
        worker_id = event.worker_id,
        operation = %event.operation,
        error = %event.error,
        "queue operation failed"
    );
}
