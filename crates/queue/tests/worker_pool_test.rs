//! Worker pool scenarios against the in-memory store
//!
//! Run with: cargo test -p pgq-queue --test worker_pool_test

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio_test::assert_ok;

use pgq_queue::persistence::{InMemoryQueueStore, QueueConnection, QueueStore};
use pgq_queue::worker::{PoolConfig, WorkerPool, WorkerPoolError, WorkerState};

fn config(pool_size: usize, batch_size: usize) -> PoolConfig {
    PoolConfig::new(pool_size, batch_size)
        .with_grace_period(Duration::ZERO)
        .with_error_backoff(Duration::from_millis(1))
        .with_progress_interval(Duration::from_millis(50))
}

async fn run_to_completion(store: &InMemoryQueueStore, config: PoolConfig) -> pgq_queue::PoolReport {
    let pool = WorkerPool::new(Arc::new(store.clone()), config);
    let report = tokio::time::timeout(Duration::from_secs(10), pool.run())
        .await
        .expect("pool did not finish");
    let report = assert_ok!(report);

    assert!(pool
        .worker_states()
        .iter()
        .all(|state| *state == WorkerState::Stopped));
    report
}

// ============================================
// Drain scenarios
// ============================================

#[test_log::test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
async fn test_drains_large_backlog() {
    let store = InMemoryQueueStore::new();
    let ids = store.enqueue_many(2500);

    let report = run_to_completion(&store, config(10, 1000)).await;

    assert_eq!(store.backlog_len(), 0);
    assert_eq!(store.locked_len(), 0);
    assert_eq!(store.processed_ids(), ids);
    assert_eq!(report.items_processed, 2500);
    assert_eq!(report.workers_drained, 10);
    assert_eq!(report.workers_cancelled, 0);
    assert_eq!(report.workers_failed, 0);
    assert_eq!(report.cycles_failed, 0);
    assert_eq!(report.errors_reported, 0);
    assert!(!report.cancelled);
    // 2500 items in batches of at most 1000 need at least three commits
    assert!(report.cycles_committed >= 3);
}

#[tokio::test]
async fn test_empty_backlog_never_marks() {
    let store = InMemoryQueueStore::new();

    let report = run_to_completion(&store, config(10, 1000)).await;

    assert_eq!(report.items_processed, 0);
    assert_eq!(report.cycles_committed, 0);
    assert_eq!(report.workers_drained, 10);
    assert_eq!(store.claim_calls(), 10);
    assert_eq!(store.mark_calls(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_drain_terminates_for_any_sizes() {
    for pool_size in [1, 3, 8] {
        for batch_size in [1, 7, 100] {
            let store = InMemoryQueueStore::new();
            store.enqueue_many(50);

            let report = run_to_completion(&store, config(pool_size, batch_size)).await;

            assert_eq!(store.backlog_len(), 0, "pool {pool_size} batch {batch_size}");
            assert_eq!(report.items_processed, 50);
            assert_eq!(report.workers_drained, pool_size as u64);
            // Each committed cycle holds at most batch_size items
            assert!(report.cycles_committed >= 50_u64.div_ceil(batch_size as u64));
        }
    }
}

// ============================================
// Claim isolation
// ============================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_claims_never_overlap() {
    let store = InMemoryQueueStore::new();
    store.enqueue_many(100);

    let mut conns: Vec<Box<dyn QueueConnection>> = Vec::new();
    for _ in 0..8 {
        conns.push(store.acquire().await.unwrap());
    }

    // Hold every transaction open while the others claim
    let mut txs = Vec::new();
    for conn in conns.iter_mut() {
        txs.push(conn.begin().await.unwrap());
    }
    let batches = join_all(txs.iter_mut().map(|tx| tx.claim_batch(15))).await;

    let mut seen = HashSet::new();
    let mut total = 0;
    for batch in batches {
        let batch = batch.unwrap();
        assert!(batch.len() <= 15);
        total += batch.len();
        for item in batch {
            assert!(seen.insert(item.id), "item {} claimed twice", item.id);
        }
    }
    assert_eq!(total, 100);

    for tx in txs.iter_mut() {
        tx.rollback().await.unwrap();
    }
    drop(txs);
    assert_eq!(store.backlog_len(), 100);
    assert_eq!(store.locked_len(), 0);
}

// ============================================
// Error handling
// ============================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_transient_failure_does_not_stop_pool() {
    let store = InMemoryQueueStore::new();
    store.enqueue_many(400);
    store.fail_next_claims(1);
    store.fail_next_commits(1);

    let report = run_to_completion(&store, config(4, 50)).await;

    assert_eq!(store.backlog_len(), 0);
    assert_eq!(report.items_processed, 400);
    assert_eq!(report.cycles_failed, 2);
    assert_eq!(report.errors_reported, 2);
    assert_eq!(report.workers_drained, 4);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_failed_mark_keeps_item_claimable() {
    let store = InMemoryQueueStore::new();
    let ids = store.enqueue_many(10);
    let poisoned = ids[3];
    store.fail_marks_for([poisoned]);

    let pool = Arc::new(WorkerPool::new(Arc::new(store.clone()), config(2, 1)));
    let run = tokio::spawn({
        let pool = Arc::clone(&pool);
        async move { pool.run().await }
    });

    // The poisoned item can never commit, so the pool only stops on cancel
    tokio::time::timeout(Duration::from_secs(5), async {
        while store.backlog_len() > 1 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("healthy items were not processed");

    pool.shutdown();
    let report = run.await.unwrap().unwrap();

    assert!(report.cancelled);
    assert_eq!(report.items_processed, 9);
    assert!(report.cycles_failed >= 1);
    assert!(report.errors_reported + report.errors_dropped >= 1);
    assert_eq!(store.backlog_len(), 1);
    assert_eq!(store.locked_len(), 0);
    assert!(!store.processed_ids().contains(&poisoned));
}

#[tokio::test]
async fn test_acquire_failure_aborts_before_processing() {
    let store = InMemoryQueueStore::new();
    store.enqueue_many(10);
    store.fail_next_acquires(1);

    let pool = WorkerPool::new(Arc::new(store.clone()), config(3, 5));
    let result = pool.run().await;

    assert!(matches!(
        result,
        Err(WorkerPoolError::Acquire { worker_id: 0, .. })
    ));
    assert_eq!(store.claim_calls(), 0);
    assert_eq!(store.backlog_len(), 10);
    assert!(pool.worker_states().is_empty());
}

#[tokio::test]
async fn test_invalid_config_is_rejected() {
    let store = InMemoryQueueStore::new();
    let pool = WorkerPool::new(Arc::new(store.clone()), config(0, 5));

    assert!(matches!(
        pool.run().await,
        Err(WorkerPoolError::InvalidConfig(_))
    ));
    assert_eq!(store.claim_calls(), 0);
}

// ============================================
// Shutdown
// ============================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_external_cancellation_stops_between_cycles() {
    let store = InMemoryQueueStore::new();
    store.enqueue_many(1000);
    store.set_claim_delay(Duration::from_millis(10));

    let pool = Arc::new(WorkerPool::new(Arc::new(store.clone()), config(2, 1)));
    let token = pool.cancellation_token();
    let run = tokio::spawn({
        let pool = Arc::clone(&pool);
        async move { pool.run().await }
    });

    tokio::time::sleep(Duration::from_millis(60)).await;
    token.cancel();

    let report = tokio::time::timeout(Duration::from_secs(5), run)
        .await
        .expect("pool ignored cancellation")
        .unwrap()
        .unwrap();

    assert!(report.cancelled);
    assert_eq!(report.workers_drained, 0);
    assert_eq!(report.workers_cancelled, 2);
    assert!(store.backlog_len() > 0);
    // In-flight cycles completed; nothing is left locked
    assert_eq!(store.locked_len(), 0);
    assert_eq!(
        store.processed_ids().len() as u64,
        report.items_processed
    );
    assert_eq!(pool.worker_states(), vec![WorkerState::Stopped; 2]);
}

#[tokio::test(start_paused = true)]
async fn test_grace_period_is_honored() {
    let store = InMemoryQueueStore::new();
    store.enqueue_many(5);

    let pool = WorkerPool::new(
        Arc::new(store.clone()),
        config(2, 10).with_grace_period(Duration::from_secs(2)),
    );

    let start = tokio::time::Instant::now();
    pool.run().await.unwrap();

    assert!(start.elapsed() >= Duration::from_secs(2));
    assert_eq!(store.backlog_len(), 0);
}
