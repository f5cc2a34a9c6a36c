//! One claim-then-acknowledge cycle
//!
//! The claim and the mark run inside the same transaction: either both are
//! committed or neither is observable. Failures are handed to the error sink
//! and reported to the caller as [`CycleOutcome::Failed`]; they never
//! propagate further.

use tracing::{debug, trace};

use super::sink::{ErrorEvent, ErrorReporter, Operation};
use crate::persistence::{
    ItemId, MarkOutcome, QueueConnection, QueueTransaction, StoreError,
};

/// Result of a single batch cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// The claim returned no items
    Drained,

    /// `items` rows were claimed, marked and committed
    Committed { items: usize },

    /// The transaction was rolled back or failed to commit
    Failed,
}

/// Runs claim + mark-processed as one atomic unit of work
pub struct BatchTransaction<'a> {
    worker_id: usize,
    batch_size: usize,
    reporter: &'a ErrorReporter,
}

impl<'a> BatchTransaction<'a> {
    pub fn new(worker_id: usize, batch_size: usize, reporter: &'a ErrorReporter) -> Self {
        Self {
            worker_id,
            batch_size,
            reporter,
        }
    }

    /// Run one cycle on `conn`
    pub async fn run(&self, conn: &mut dyn QueueConnection) -> CycleOutcome {
        let mut tx = match conn.begin().await {
            Ok(tx) => tx,
            Err(e) => {
                self.report(Operation::Begin, e).await;
                return CycleOutcome::Failed;
            }
        };

        let batch = match tx.claim_batch(self.batch_size).await {
            Ok(batch) => batch,
            Err(e) => return self.abort(tx, Operation::Claim, vec![e]).await,
        };

        if batch.is_empty() {
            // Nothing was locked or written; close the transaction and let
            // the worker stop.
            if let Err(e) = tx.commit().await {
                self.report(Operation::Commit, e).await;
            }
            return CycleOutcome::Drained;
        }

        trace!(worker_id = self.worker_id, items = batch.len(), "claimed batch");

        let ids: Vec<ItemId> = batch.iter().map(|item| item.id).collect();

        let results = match tx.mark_processed(&ids).await {
            Ok(results) => results,
            Err(e) => return self.abort(tx, Operation::MarkProcessed, vec![e]).await,
        };

        let failures: Vec<StoreError> = results
            .into_iter()
            .filter_map(|result| match result.outcome {
                MarkOutcome::Marked => None,
                MarkOutcome::Failed(reason) => Some(StoreError::MarkFailed {
                    id: result.id,
                    reason,
                }),
            })
            .collect();

        if !failures.is_empty() {
            return self.abort(tx, Operation::MarkProcessed, failures).await;
        }

        match tx.commit().await {
            Ok(()) => {
                debug!(worker_id = self.worker_id, items = ids.len(), "batch committed");
                CycleOutcome::Committed { items: ids.len() }
            }
            Err(e) => {
                self.report(Operation::Commit, e).await;
                CycleOutcome::Failed
            }
        }
    }

    /// Report the triggering errors and roll back
    async fn abort(
        &self,
        mut tx: Box<dyn QueueTransaction + '_>,
        operation: Operation,
        errors: Vec<StoreError>,
    ) -> CycleOutcome {
        for error in errors {
            self.report(operation, error).await;
        }

        if let Err(e) = tx.rollback().await {
            self.report(Operation::Rollback, e).await;
        }

        CycleOutcome::Failed
    }

    async fn report(&self, operation: Operation, error: StoreError) {
        self.reporter
            .report(ErrorEvent::new(self.worker_id, operation, error))
            .await;
    }
}
