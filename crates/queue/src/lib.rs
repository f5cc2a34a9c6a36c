//! # pgq
//!
//! A consumer for a work queue stored in a PostgreSQL table.
//!
//! Producers insert rows into `pgq_items`; a fixed pool of workers drains
//! them. Each worker repeatedly claims a bounded batch with
//! `FOR UPDATE SKIP LOCKED`, marks it processed and commits, all in one
//! transaction, and stops once a claim comes back empty.
//!
//! ## Guarantees
//!
//! - **No overlap**: concurrent claims never return the same row while the
//!   claiming transaction is open
//! - **Atomic acknowledgement**: a batch is marked processed only if its
//!   transaction commits; on rollback every row is claimable again
//! - **Error isolation**: failures inside a cycle are reported through a
//!   bounded error sink and never stop the pool
//! - **Cooperative shutdown**: cancellation is observed between cycles, then
//!   the pool waits a grace period before returning
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       WorkerPool                             │
//! │  (spawns workers, waits for completion, grace period)       │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    BatchTransaction                          │
//! │  (begin → claim_batch → mark_processed → commit/rollback)   │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       QueueStore                             │
//! │  (PostgreSQL: pgq_items, or in-memory for tests)            │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use pgq_queue::prelude::*;
//!
//! let store = Arc::new(PostgresQueueStore::new(pg_pool));
//! let pool = WorkerPool::new(store, PoolConfig::new(10, 1000));
//! let report = pool.run().await?;
//! ```

pub mod persistence;
pub mod worker;

/// Prelude for common imports
pub mod prelude {
    pub use crate::persistence::{
        InMemoryQueueStore, ItemId, PostgresQueueStore, QueueItem, QueueStore, StoreError,
    };
    pub use crate::worker::{PoolConfig, PoolReport, WorkerPool, WorkerPoolError, WorkerState};
}

// Re-export key types at crate root
pub use persistence::{
    Batch, InMemoryQueueStore, ItemId, MarkOutcome, MarkResult, PostgresQueueStore,
    QueueConnection, QueueItem, QueueStore, QueueTransaction, StoreError,
};
pub use worker::{
    BatchTransaction, CycleOutcome, ErrorEvent, ErrorReporter, ErrorSink, ErrorSinkStats,
    Operation, PoolConfig, PoolReport, ShutdownCoordinator, WorkerPool, WorkerPoolError,
    WorkerState,
};
