//! QueueStore trait definitions

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Primary key of a queue row
pub type ItemId = i64;

/// Error type for store operations
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// Database error
    #[error("database error: {0}")]
    Database(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// A single item could not be marked processed
    #[error("item {id} not marked processed: {reason}")]
    MarkFailed { id: ItemId, reason: String },

    /// The transaction was already committed or rolled back
    #[error("transaction already closed")]
    TransactionClosed,

    /// Failure injected by a test store
    #[error("injected failure: {0}")]
    Injected(String),
}

/// A row claimed from the queue
///
/// The payload is owned by the producer; workers only need `id` to
/// acknowledge the item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueItem {
    pub id: ItemId,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// Items claimed together by one `claim_batch` call
pub type Batch = Vec<QueueItem>;

/// Per-identifier result of `mark_processed`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MarkResult {
    pub id: ItemId,
    pub outcome: MarkOutcome,
}

impl MarkResult {
    pub fn marked(id: ItemId) -> Self {
        Self {
            id,
            outcome: MarkOutcome::Marked,
        }
    }

    pub fn failed(id: ItemId, reason: impl Into<String>) -> Self {
        Self {
            id,
            outcome: MarkOutcome::Failed(reason.into()),
        }
    }

    pub fn is_marked(&self) -> bool {
        matches!(self.outcome, MarkOutcome::Marked)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MarkOutcome {
    /// The row is recorded as processed (or already was)
    Marked,

    /// The row could not be marked
    Failed(String),
}

/// Source of dedicated connections to the queue table
///
/// Each worker acquires exactly one connection at startup and keeps it for
/// its whole lifetime.
#[async_trait]
pub trait QueueStore: Send + Sync {
    /// Acquire a dedicated connection
    async fn acquire(&self) -> Result<Box<dyn QueueConnection>, StoreError>;
}

/// A connection owned by a single worker
#[async_trait]
pub trait QueueConnection: Send {
    /// Begin a transaction on this connection
    async fn begin<'c>(&'c mut self) -> Result<Box<dyn QueueTransaction + 'c>, StoreError>;
}

/// Transaction-scoped view of the queue table
///
/// Dropping a transaction without calling [`commit`](Self::commit) or
/// [`rollback`](Self::rollback) rolls it back.
#[async_trait]
pub trait QueueTransaction: Send {
    /// Claim up to `limit` unprocessed items.
    ///
    /// Implementations must use a locking read that skips rows locked by
    /// other open transactions: two concurrent claims never return the same
    /// item while either transaction is open. The returned batch never holds
    /// more than `limit` items.
    async fn claim_batch(&mut self, limit: usize) -> Result<Batch, StoreError>;

    /// Mark the given items processed.
    ///
    /// Idempotent. Returns one [`MarkResult`] per id, in input order; a
    /// failure for one id does not prevent the others from being marked.
    /// An `Err` means the statement itself failed.
    async fn mark_processed(&mut self, ids: &[ItemId]) -> Result<Vec<MarkResult>, StoreError>;

    /// Commit the transaction
    async fn commit(&mut self) -> Result<(), StoreError>;

    /// Roll the transaction back
    async fn rollback(&mut self) -> Result<(), StoreError>;
}
