//! Worker pool and batch processing protocol
//!
//! This module provides:
//! - [`WorkerPool`] - Fixed-size pool draining the queue
//! - [`BatchTransaction`] - One atomic claim + mark-processed cycle
//! - [`ErrorSink`] - Bounded, single-consumer error reporting
//! - [`ShutdownCoordinator`] - Cancellation token, completion tracking, grace period
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       WorkerPool                             │
//! │  ┌──────────────────────┐   ┌────────────────────────────┐  │
//! │  │  ShutdownCoordinator │   │  Progress reporter (5s)    │  │
//! │  │  (token + tracker)   │   └────────────────────────────┘  │
//! │  └──────────┬───────────┘                                    │
//! │             ▼                                                │
//! │  ┌─────────────────────────────────────────────────────┐    │
//! │  │   Workers (one dedicated connection each)           │    │
//! │  │   [W0] [W1] [W2] ... [WN]                           │    │
//! │  │   loop { begin → claim → mark → commit }            │    │
//! │  └──────────┬──────────────────────────────────────────┘    │
//! │             ▼ errors                                         │
//! │  ┌─────────────────────────────────────────────────────┐    │
//! │  │   ErrorSink (bounded channel, single consumer)      │    │
//! │  └─────────────────────────────────────────────────────┘    │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```ignore
//! use pgq_queue::worker::{PoolConfig, WorkerPool};
//!
//! let config = PoolConfig::new(10, 1000).with_grace_period(Duration::from_secs(3));
//! let pool = WorkerPool::new(store, config);
//!
//! let report = pool.run().await?;
//! println!("processed {} items", report.items_processed);
//! ```

mod batch;
mod pool;
mod runner;
mod shutdown;
mod sink;

pub use batch::{BatchTransaction, CycleOutcome};
pub use pool::{
    PoolConfig, PoolReport, PoolStats, PoolStatsSnapshot, WorkerPool, WorkerPoolError,
};
pub use runner::{WorkerExit, WorkerState};
pub use shutdown::ShutdownCoordinator;
pub use sink::{ErrorEvent, ErrorReporter, ErrorSink, ErrorSinkStats, Operation};
