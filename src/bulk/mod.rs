//! Bulk write batching.
//!
//! A bulk write is a list of [`WriteOperation`]s executed against one
//! collection. Operations are validated when queued, turned into their wire
//! form, split into `insert` / `update` / `delete` commands that respect the
//! server's count and size limits, and the replies are folded into a single
//! [`BulkResult`] whose indexes always refer to the submitted sequence.

pub mod batch;
pub mod builder;
pub mod executor;
pub mod operation;
pub mod result;

pub use batch::{batch_byte_limit, group_by_kind, split_batches, Batch, COMMAND_OVERHEAD};
pub use builder::{BulkOperationBuilder, BulkUpsertOperation, BulkWriteOperation};
pub use executor::{BulkExecutor, ExecutorState};
pub use operation::{CommandKind, WriteOperation};
pub use result::{BulkResult, BulkWriteResult, Upserted, WriteError};
