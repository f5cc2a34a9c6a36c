//! PostgreSQL implementation of QueueStore
//!
//! Production persistence using PostgreSQL with:
//! - One pooled connection per worker
//! - Batch claiming with FOR UPDATE SKIP LOCKED
//! - Idempotent acknowledgement inside the claiming transaction

use std::collections::HashSet;

use async_trait::async_trait;
use sqlx::pool::PoolConnection;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::{debug, error, instrument};

use super::store::*;

/// PostgreSQL implementation of QueueStore
///
/// Items live in the `pgq_items` table created by the embedded migration.
///
/// # Example
///
/// ```ignore
/// use pgq_queue::PostgresQueueStore;
/// use sqlx::PgPool;
///
/// let pool = PgPool::connect("postgres://localhost/mydb").await?;
/// let store = PostgresQueueStore::new(pool);
/// store.migrate().await?;
/// ```
#[derive(Clone)]
pub struct PostgresQueueStore {
    pool: PgPool,
}

impl PostgresQueueStore {
    /// Create a new PostgreSQL store with the given connection pool
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Get a reference to the connection pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply the embedded schema migrations
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))
    }

    /// Insert a new unprocessed item
    pub async fn enqueue(&self, payload: serde_json::Value) -> Result<ItemId, StoreError> {
        let row = sqlx::query("INSERT INTO pgq_items (payload) VALUES ($1) RETURNING id")
            .bind(payload)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;

        decode_id(&row)
    }

    /// Number of items not yet processed
    pub async fn backlog_len(&self) -> Result<u64, StoreError> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM pgq_items WHERE processed_at IS NULL")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;

        let n: i64 = row
            .try_get("n")
            .map_err(|e| StoreError::Serialization(e.to_string()))?;

        Ok(n as u64)
    }
}

#[async_trait]
impl QueueStore for PostgresQueueStore {
    async fn acquire(&self) -> Result<Box<dyn QueueConnection>, StoreError> {
        let conn = self.pool.acquire().await.map_err(|e| {
            error!("Failed to acquire connection: {}", e);
            StoreError::Database(e.to_string())
        })?;

        Ok(Box::new(PostgresQueueConnection { conn }))
    }
}

struct PostgresQueueConnection {
    conn: PoolConnection<Postgres>,
}

#[async_trait]
impl QueueConnection for PostgresQueueConnection {
    async fn begin<'c>(&'c mut self) -> Result<Box<dyn QueueTransaction + 'c>, StoreError> {
        let tx = sqlx::Connection::begin(&mut *self.conn)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;

        Ok(Box::new(PostgresQueueTransaction { tx: Some(tx) }))
    }
}

/// `None` once committed or rolled back
struct PostgresQueueTransaction<'c> {
    tx: Option<Transaction<'c, Postgres>>,
}

impl<'c> PostgresQueueTransaction<'c> {
    fn open(&mut self) -> Result<&mut Transaction<'c, Postgres>, StoreError> {
        self.tx.as_mut().ok_or(StoreError::TransactionClosed)
    }
}

/// Read the primary key, accepting `SERIAL` tables as well as `BIGSERIAL`
fn decode_id(row: &PgRow) -> Result<ItemId, StoreError> {
    row.try_get::<i64, _>("id")
        .or_else(|_| row.try_get::<i32, _>("id").map(ItemId::from))
        .map_err(|e| StoreError::Serialization(format!("id: {}", e)))
}

fn decode_item(row: &PgRow) -> Result<QueueItem, StoreError> {
    Ok(QueueItem {
        id: decode_id(row)?,
        payload: row
            .try_get("payload")
            .map_err(|e| StoreError::Serialization(format!("payload: {}", e)))?,
        created_at: row
            .try_get("created_at")
            .map_err(|e| StoreError::Serialization(format!("created_at: {}", e)))?,
    })
}

#[async_trait]
impl<'c> QueueTransaction for PostgresQueueTransaction<'c> {
    #[instrument(skip(self))]
    async fn claim_batch(&mut self, limit: usize) -> Result<Batch, StoreError> {
        if limit == 0 {
            return Ok(vec![]);
        }

        let tx = self.open()?;

        // SKIP LOCKED keeps concurrent claimers from ever returning the same
        // row while another transaction holds it.
        let rows = sqlx::query(
            r#"
            SELECT id, payload, created_at
            FROM pgq_items
            WHERE processed_at IS NULL
            ORDER BY id
            LIMIT $1
            FOR UPDATE SKIP LOCKED
            "#,
        )
        .bind(limit as i64)
        .fetch_all(&mut **tx)
        .await
        .map_err(|e| {
            error!("Failed to claim items: {}", e);
            StoreError::Database(e.to_string())
        })?;

        let batch = rows.iter().map(decode_item).collect::<Result<Batch, _>>()?;

        if !batch.is_empty() {
            debug!(count = batch.len(), "claimed items");
        }

        Ok(batch)
    }

    #[instrument(skip(self, ids), fields(count = ids.len()))]
    async fn mark_processed(&mut self, ids: &[ItemId]) -> Result<Vec<MarkResult>, StoreError> {
        if ids.is_empty() {
            return Ok(vec![]);
        }

        let tx = self.open()?;

        let rows = sqlx::query(
            r#"
            UPDATE pgq_items
            SET processed_at = COALESCE(processed_at, NOW())
            WHERE id = ANY($1)
            RETURNING id
            "#,
        )
        .bind(ids)
        .fetch_all(&mut **tx)
        .await
        .map_err(|e| {
            error!("Failed to mark items processed: {}", e);
            StoreError::Database(e.to_string())
        })?;

        let updated = rows
            .iter()
            .map(decode_id)
            .collect::<Result<HashSet<ItemId>, _>>()?;

        Ok(ids
            .iter()
            .map(|&id| {
                if updated.contains(&id) {
                    MarkResult::marked(id)
                } else {
                    MarkResult::failed(id, "item not found")
                }
            })
            .collect())
    }

    async fn commit(&mut self) -> Result<(), StoreError> {
        let tx = self.tx.take().ok_or(StoreError::TransactionClosed)?;
        tx.commit()
            .await
            .map_err(|e| StoreError::Database(e.to_string()))
    }

    async fn rollback(&mut self) -> Result<(), StoreError> {
        let tx = self.tx.take().ok_or(StoreError::TransactionClosed)?;
        tx.rollback()
            .await
            .map_err(|e| StoreError::Database(e.to_string()))
    }
}
