//! Persistence layer for the queue table
//!
//! This module provides:
//! - [`QueueStore`], [`QueueConnection`] and [`QueueTransaction`], the contract workers rely on
//! - [`PostgresQueueStore`] for production
//! - [`InMemoryQueueStore`] for testing, with fault injection

mod memory;
mod postgres;
mod store;

pub use memory::InMemoryQueueStore;
pub use postgres::PostgresQueueStore;
pub use store::{
    Batch, ItemId, MarkOutcome, MarkResult, QueueConnection, QueueItem, QueueStore,
    QueueTransaction, StoreError,
};
