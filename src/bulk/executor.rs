//! Dispatching bulk writes as batched commands.

use super::batch::{batch_byte_limit, group_by_kind, split_batches, Batch};
use super::operation::{PreparedWrite, WriteOperation};
use super::result::BulkResult;
use crate::collection::Collection;
use crate::error::{MongoError, Result};
use bson::Document;
use futures::future::join_all;
use tracing::{debug, warn};

/// Lifecycle of a [`BulkExecutor`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutorState {
    /// Accepting operations.
    Building,
    /// `execute` has been called; the executor cannot be reused.
    Executed,
}

/// Runs a list of write operations against one collection.
///
/// Ordered executors send their batches one after another and stop after
/// the first batch that reports a write error. Unordered executors group
/// operations by command, send every batch concurrently and report all
/// failures.
pub struct BulkExecutor {
    collection: Collection<Document>,
    ordered: bool,
    operations: Vec<WriteOperation>,
    state: ExecutorState,
}

impl BulkExecutor {
    /// Create an executor writing to `collection`.
    pub fn new(collection: Collection<Document>, ordered: bool) -> Self {
        Self {
            collection,
            ordered,
            operations: Vec::new(),
            state: ExecutorState::Building,
        }
    }

    /// Whether operations run in submission order.
    pub fn is_ordered(&self) -> bool {
        self.ordered
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ExecutorState {
        self.state
    }

    /// Number of queued operations.
    pub fn len(&self) -> usize {
        self.operations.len()
    }

    /// Whether nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    /// Validate and queue an operation.
    pub fn add(&mut self, operation: WriteOperation) -> Result<()> {
        if self.state == ExecutorState::Executed {
            return Err(MongoError::invalid_operation(
                "Bulk operations can only be executed once.",
            ));
        }
        operation.validate()?;
        self.operations.push(operation);
        Ok(())
    }

    /// Send every queued operation and aggregate the replies.
    ///
    /// Returns [`MongoError::BulkWrite`] carrying the full result when any
    /// write error or write concern error was reported.
    pub async fn execute(&mut self) -> Result<BulkResult> {
        if self.state == ExecutorState::Executed {
            return Err(MongoError::invalid_operation(
                "Bulk operations can only be executed once.",
            ));
        }
        if self.operations.is_empty() {
            return Err(MongoError::invalid_operation("No operations to execute"));
        }
        self.state = ExecutorState::Executed;

        let operations = std::mem::take(&mut self.operations);
        let limits = self.collection.database().server_limits().await?;

        let mut prepared = operations
            .into_iter()
            .enumerate()
            .map(|(index, op)| op.prepare().map(|p| (index, p)))
            .collect::<Result<Vec<_>>>()?;
        if !self.ordered {
            prepared = group_by_kind(prepared, |p| p.kind);
        }
        let batches = split_batches(
            prepared,
            |p| p.kind,
            |p| p.size,
            limits.max_write_batch_size,
            batch_byte_limit(&limits),
        );

        let mut result = BulkResult::default();
        if self.ordered {
            for batch in &batches {
                let reply = self.send(batch, true).await?;
                result.merge_batch(batch, &reply);
                if result.has_write_errors() {
                    break;
                }
            }
        } else {
            let replies = join_all(batches.iter().map(|batch| self.send(batch, false))).await;
            for (batch, reply) in batches.iter().zip(replies) {
                result.merge_batch(batch, &reply?);
            }
        }
        result.finish();

        if result.has_errors() {
            warn!(
                ns = %self.collection.namespace(),
                write_errors = result.write_errors.len(),
                write_concern_errors = result.write_concern_errors.len(),
                "bulk write failed"
            );
            return Err(MongoError::bulk_write(result));
        }
        Ok(result)
    }

    async fn send(&self, batch: &Batch<PreparedWrite>, ordered: bool) -> Result<Document> {
        debug!(
            ns = %self.collection.namespace(),
            command = batch.kind.command_name(),
            size = batch.len(),
            bytes = batch.bytes,
            first_index = batch.global_index(0),
            "sending write batch"
        );
        let entries = batch.items.iter().map(|item| item.entry.clone()).collect();
        self.collection.run_write(batch.kind, entries, ordered).await
    }
}

impl std::fmt::Debug for BulkExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BulkExecutor")
            .field("namespace", &self.collection.namespace())
            .field("ordered", &self.ordered)
            .field("operations", &self.operations.len())
            .field("state", &self.state)
            .finish()
    }
}
