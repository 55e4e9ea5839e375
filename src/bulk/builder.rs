//! Fluent bulk API: `bulk.find(selector).upsert().update_one(update)`.

use super::executor::BulkExecutor;
use super::operation::WriteOperation;
use super::result::BulkResult;
use crate::collection::Collection;
use crate::error::Result;
use bson::Document;

/// Collects writes for one bulk operation.
///
/// Created by `Collection::initialize_ordered_bulk_op` or
/// `Collection::initialize_unordered_bulk_op`.
///
/// # Example
///
/// ```ignore
/// let mut bulk = coll.initialize_unordered_bulk_op();
/// bulk.insert(doc! { "a": 1 })?;
/// bulk.find(doc! { "a": 1 }).update_one(doc! { "$set": { "b": 1 } })?;
/// bulk.find(doc! { "a": 3 }).remove()?;
/// let result = bulk.execute().await?;
/// ```
#[derive(Debug)]
pub struct BulkOperationBuilder {
    executor: BulkExecutor,
}

impl BulkOperationBuilder {
    pub(crate) fn new(collection: Collection<Document>, ordered: bool) -> Self {
        Self {
            executor: BulkExecutor::new(collection, ordered),
        }
    }

    /// Queue an insert.
    pub fn insert(&mut self, document: Document) -> Result<()> {
        self.executor.add(WriteOperation::insert_one(document))
    }

    /// Start an update, replace or remove of documents matching `selector`.
    pub fn find(&mut self, selector: Document) -> BulkWriteOperation<'_> {
        BulkWriteOperation {
            executor: &mut self.executor,
            selector,
            upsert: false,
            collation: None,
        }
    }

    /// Number of queued operations.
    pub fn len(&self) -> usize {
        self.executor.len()
    }

    /// Whether nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.executor.is_empty()
    }

    /// Execute everything queued so far. Can only succeed once.
    pub async fn execute(&mut self) -> Result<BulkResult> {
        self.executor.execute().await
    }
}

/// A pending write against a selector.
#[derive(Debug)]
pub struct BulkWriteOperation<'a> {
    executor: &'a mut BulkExecutor,
    selector: Document,
    upsert: bool,
    collation: Option<Document>,
}

impl<'a> BulkWriteOperation<'a> {
    /// Match the selector using `collation`.
    pub fn collation(mut self, collation: Document) -> Self {
        self.collation = Some(collation);
        self
    }

    /// Insert a document when nothing matches.
    pub fn upsert(mut self) -> BulkUpsertOperation<'a> {
        self.upsert = true;
        BulkUpsertOperation { inner: self }
    }

    /// Update the first matching document.
    pub fn update_one(self, update: Document) -> Result<()> {
        let op = WriteOperation::update_one(self.selector.clone(), update);
        self.push(op)
    }

    /// Update every matching document.
    pub fn update(self, update: Document) -> Result<()> {
        let op = WriteOperation::update_many(self.selector.clone(), update);
        self.push(op)
    }

    /// Replace the first matching document.
    pub fn replace_one(self, replacement: Document) -> Result<()> {
        let op = WriteOperation::replace_one(self.selector.clone(), replacement);
        self.push(op)
    }

    /// Remove the first matching document.
    pub fn remove_one(self) -> Result<()> {
        let op = WriteOperation::delete_one(self.selector.clone());
        self.push(op)
    }

    /// Remove every matching document.
    pub fn remove(self) -> Result<()> {
        let op = WriteOperation::delete_many(self.selector.clone());
        self.push(op)
    }

    fn push(self, op: WriteOperation) -> Result<()> {
        let mut op = op.with_upsert(self.upsert);
        if let Some(collation) = self.collation {
            op = op.with_collation(collation);
        }
        self.executor.add(op)
    }
}

/// A pending upsert; only updates and replacements can upsert.
#[derive(Debug)]
pub struct BulkUpsertOperation<'a> {
    inner: BulkWriteOperation<'a>,
}

impl<'a> BulkUpsertOperation<'a> {
    /// Match the selector using `collation`.
    pub fn collation(self, collation: Document) -> Self {
        Self {
            inner: self.inner.collation(collation),
        }
    }

    /// Update the first matching document, or insert one.
    pub fn update_one(self, update: Document) -> Result<()> {
        self.inner.update_one(update)
    }

    /// Update every matching document, or insert one.
    pub fn update(self, update: Document) -> Result<()> {
        self.inner.update(update)
    }

    /// Replace the first matching document, or insert the replacement.
    pub fn replace_one(self, replacement: Document) -> Result<()> {
        self.inner.replace_one(replacement)
    }
}
