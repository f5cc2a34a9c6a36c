//! In-memory implementation of QueueStore for testing

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;

use super::store::*;

/// Internal row state
struct ItemState {
    item: QueueItem,
    processed: bool,
    /// Transaction currently holding the row lock
    locked_by: Option<u64>,
}

#[derive(Default)]
struct Faults {
    acquires: u32,
    begins: u32,
    claims: u32,
    commits: u32,
    marks: HashSet<ItemId>,
    claim_delay: Option<Duration>,
}

struct Inner {
    items: Mutex<BTreeMap<ItemId, ItemState>>,
    faults: Mutex<Faults>,
    next_id: AtomicI64,
    next_tx: AtomicU64,
    claim_calls: AtomicU64,
    mark_calls: AtomicU64,
}

impl Inner {
    fn release(&self, tx_id: u64, claimed: &[ItemId]) {
        let mut items = self.items.lock();
        for id in claimed {
            if let Some(state) = items.get_mut(id) {
                if state.locked_by == Some(tx_id) {
                    state.locked_by = None;
                }
            }
        }
    }

    fn take_fault(counter: &mut u32) -> bool {
        if *counter > 0 {
            *counter -= 1;
            true
        } else {
            false
        }
    }
}

/// In-memory implementation of QueueStore
///
/// Mirrors the PostgreSQL semantics the workers depend on: claimed and
/// marked rows are locked by their transaction and skipped by concurrent
/// claims, marks only become visible on commit, and rollback (or drop)
/// releases the locks. Marking a row locked by another open transaction
/// reports a failure for that row where PostgreSQL would block.
/// Faults can be injected per operation.
///
/// # Example
///
/// ```
/// use pgq_queue::InMemoryQueueStore;
///
/// let store = InMemoryQueueStore::new();
/// store.enqueue_many(3);
/// assert_eq!(store.backlog_len(), 3);
/// ```
#[derive(Clone)]
pub struct InMemoryQueueStore {
    inner: Arc<Inner>,
}

impl InMemoryQueueStore {
    /// Create a new, empty in-memory store
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                items: Mutex::new(BTreeMap::new()),
                faults: Mutex::new(Faults::default()),
                next_id: AtomicI64::new(1),
                next_tx: AtomicU64::new(1),
                claim_calls: AtomicU64::new(0),
                mark_calls: AtomicU64::new(0),
            }),
        }
    }

    /// Insert a new unprocessed item
    pub fn enqueue(&self, payload: serde_json::Value) -> ItemId {
        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        self.inner.items.lock().insert(
            id,
            ItemState {
                item: QueueItem {
                    id,
                    payload,
                    created_at: Utc::now(),
                },
                processed: false,
                locked_by: None,
            },
        );
        id
    }

    /// Insert `count` items with a sequence number payload
    pub fn enqueue_many(&self, count: usize) -> Vec<ItemId> {
        (0..count)
            .map(|n| self.enqueue(serde_json::json!({ "n": n })))
            .collect()
    }

    /// Number of items not yet processed
    pub fn backlog_len(&self) -> usize {
        self.inner
            .items
            .lock()
            .values()
            .filter(|s| !s.processed)
            .count()
    }

    /// Ids of committed, processed items in ascending order
    pub fn processed_ids(&self) -> Vec<ItemId> {
        self.inner
            .items
            .lock()
            .values()
            .filter(|s| s.processed)
            .map(|s| s.item.id)
            .collect()
    }

    /// Number of rows currently locked by an open transaction
    pub fn locked_len(&self) -> usize {
        self.inner
            .items
            .lock()
            .values()
            .filter(|s| s.locked_by.is_some())
            .count()
    }

    /// Number of `claim_batch` calls served
    pub fn claim_calls(&self) -> u64 {
        self.inner.claim_calls.load(Ordering::SeqCst)
    }

    /// Number of `mark_processed` calls served
    pub fn mark_calls(&self) -> u64 {
        self.inner.mark_calls.load(Ordering::SeqCst)
    }

    /// Fail the next `n` connection acquisitions
    pub fn fail_next_acquires(&self, n: u32) {
        self.inner.faults.lock().acquires = n;
    }

    /// Fail the next `n` transaction begins
    pub fn fail_next_begins(&self, n: u32) {
        self.inner.faults.lock().begins = n;
    }

    /// Fail the next `n` claims
    pub fn fail_next_claims(&self, n: u32) {
        self.inner.faults.lock().claims = n;
    }

    /// Fail the next `n` commits; the failed transaction is rolled back
    pub fn fail_next_commits(&self, n: u32) {
        self.inner.faults.lock().commits = n;
    }

    /// Report a per-id failure whenever one of `ids` is marked
    pub fn fail_marks_for(&self, ids: impl IntoIterator<Item = ItemId>) {
        self.inner.faults.lock().marks = ids.into_iter().collect();
    }

    /// Stop injecting per-id mark failures
    pub fn clear_mark_failures(&self) {
        self.inner.faults.lock().marks.clear();
    }

    /// Sleep this long at the start of every claim
    pub fn set_claim_delay(&self, delay: Duration) {
        self.inner.faults.lock().claim_delay = Some(delay);
    }
}

impl Default for InMemoryQueueStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl QueueStore for InMemoryQueueStore {
    async fn acquire(&self) -> Result<Box<dyn QueueConnection>, StoreError> {
        if Inner::take_fault(&mut self.inner.faults.lock().acquires) {
            return Err(StoreError::Injected("acquire".to_string()));
        }

        Ok(Box::new(InMemoryQueueConnection {
            inner: Arc::clone(&self.inner),
        }))
    }
}

struct InMemoryQueueConnection {
    inner: Arc<Inner>,
}

#[async_trait]
impl QueueConnection for InMemoryQueueConnection {
    async fn begin<'c>(&'c mut self) -> Result<Box<dyn QueueTransaction + 'c>, StoreError> {
        if Inner::take_fault(&mut self.inner.faults.lock().begins) {
            return Err(StoreError::Injected("begin".to_string()));
        }

        Ok(Box::new(InMemoryQueueTransaction {
            inner: Arc::clone(&self.inner),
            tx_id: self.inner.next_tx.fetch_add(1, Ordering::SeqCst),
            claimed: Vec::new(),
            pending_marks: Vec::new(),
            open: true,
        }))
    }
}

struct InMemoryQueueTransaction {
    inner: Arc<Inner>,
    tx_id: u64,
    claimed: Vec<ItemId>,
    pending_marks: Vec<ItemId>,
    open: bool,
}

impl InMemoryQueueTransaction {
    fn ensure_open(&self) -> Result<(), StoreError> {
        if self.open {
            Ok(())
        } else {
            Err(StoreError::TransactionClosed)
        }
    }

    fn finish(&mut self) {
        self.open = false;
        self.pending_marks.clear();
        self.inner.release(self.tx_id, &self.claimed);
    }
}

impl Drop for InMemoryQueueTransaction {
    fn drop(&mut self) {
        if self.open {
            self.finish();
        }
    }
}

#[async_trait]
impl QueueTransaction for InMemoryQueueTransaction {
    async fn claim_batch(&mut self, limit: usize) -> Result<Batch, StoreError> {
        self.ensure_open()?;
        if limit == 0 {
            return Ok(vec![]);
        }
        self.inner.claim_calls.fetch_add(1, Ordering::SeqCst);

        let delay = {
            let mut faults = self.inner.faults.lock();
            if Inner::take_fault(&mut faults.claims) {
                return Err(StoreError::Injected("claim".to_string()));
            }
            faults.claim_delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut items = self.inner.items.lock();
        let mut batch = Vec::with_capacity(limit.min(items.len()));

        for state in items.values_mut() {
            if batch.len() >= limit {
                break;
            }

            if !state.processed && state.locked_by.is_none() {
                state.locked_by = Some(self.tx_id);
                self.claimed.push(state.item.id);
                batch.push(state.item.clone());
            }
        }

        Ok(batch)
    }

    async fn mark_processed(&mut self, ids: &[ItemId]) -> Result<Vec<MarkResult>, StoreError> {
        self.ensure_open()?;
        self.inner.mark_calls.fetch_add(1, Ordering::SeqCst);

        let failing = self.inner.faults.lock().marks.clone();
        let mut items = self.inner.items.lock();
        let mut results = Vec::with_capacity(ids.len());

        for &id in ids {
            if failing.contains(&id) {
                results.push(MarkResult::failed(id, "injected failure"));
                continue;
            }

            let Some(state) = items.get_mut(&id) else {
                results.push(MarkResult::failed(id, "item not found"));
                continue;
            };

            // An UPDATE would wait on another transaction's row lock; report
            // the row instead of blocking.
            match state.locked_by {
                Some(owner) if owner != self.tx_id => {
                    results.push(MarkResult::failed(id, "locked by another transaction"));
                }
                Some(_) => {
                    self.pending_marks.push(id);
                    results.push(MarkResult::marked(id));
                }
                None => {
                    state.locked_by = Some(self.tx_id);
                    self.claimed.push(id);
                    self.pending_marks.push(id);
                    results.push(MarkResult::marked(id));
                }
            }
        }

        Ok(results)
    }

    async fn commit(&mut self) -> Result<(), StoreError> {
        self.ensure_open()?;

        if Inner::take_fault(&mut self.inner.faults.lock().commits) {
            self.finish();
            return Err(StoreError::Injected("commit".to_string()));
        }

        {
            let mut items = self.inner.items.lock();
            for id in &self.pending_marks {
                if let Some(state) = items.get_mut(id) {
                    state.processed = true;
                }
            }
        }

        self.finish();
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), StoreError> {
        self.ensure_open()?;
        self.finish();
        Ok(())
    }
}
