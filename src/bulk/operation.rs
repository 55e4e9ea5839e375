//! Write operations and their client-side validation.

use crate::error::{MongoError, Result};
use crate::transport::bson_size;
use bson::{doc, oid::ObjectId, Document};

/// The write command that carries an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CommandKind {
    /// `insert`
    Insert,
    /// `update`
    Update,
    /// `delete`
    Delete,
}

impl CommandKind {
    /// Command name sent to the server.
    pub fn command_name(self) -> &'static str {
        match self {
            CommandKind::Insert => "insert",
            CommandKind::Update => "update",
            CommandKind::Delete => "delete",
        }
    }

    /// Field of the command holding the entries.
    pub fn entries_key(self) -> &'static str {
        match self {
            CommandKind::Insert => "documents",
            CommandKind::Update => "updates",
            CommandKind::Delete => "deletes",
        }
    }
}

/// A single write in a bulk operation.
///
/// # Example
///
/// ```ignore
/// let ops = vec![
///     WriteOperation::insert_one(doc! { "a": 1 }),
///     WriteOperation::update_one(doc! { "a": 1 }, doc! { "$inc": { "n": 1 } }).with_upsert(true),
///     WriteOperation::delete_many(doc! { "stale": true }),
/// ];
/// ```
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOperation {
    /// Insert one document.
    InsertOne {
        /// Document to insert.
        document: Document,
    },
    /// Apply update operators to the first matching document.
    UpdateOne {
        /// Selector.
        filter: Document,
        /// Update operators.
        update: Document,
        /// Insert when nothing matches.
        upsert: bool,
        /// Collation for the selector.
        collation: Option<Document>,
    },
    /// Apply update operators to every matching document.
    UpdateMany {
        /// Selector.
        filter: Document,
        /// Update operators.
        update: Document,
        /// Insert when nothing matches.
        upsert: bool,
        /// Collation for the selector.
        collation: Option<Document>,
    },
    /// Replace the first matching document.
    ReplaceOne {
        /// Selector.
        filter: Document,
        /// Replacement document.
        replacement: Document,
        /// Insert when nothing matches.
        upsert: bool,
        /// Collation for the selector.
        collation: Option<Document>,
    },
    /// Delete the first matching document.
    DeleteOne {
        /// Selector.
        filter: Document,
        /// Collation for the selector.
        collation: Option<Document>,
    },
    /// Delete every matching document.
    DeleteMany {
        /// Selector.
        filter: Document,
        /// Collation for the selector.
        collation: Option<Document>,
    },
}

impl WriteOperation {
    /// Insert `document`.
    pub fn insert_one(document: Document) -> Self {
        WriteOperation::InsertOne { document }
    }

    /// Update the first document matching `filter`.
    pub fn update_one(filter: Document, update: Document) -> Self {
        WriteOperation::UpdateOne {
            filter,
            update,
            upsert: false,
            collation: None,
        }
    }

    /// Update every document matching `filter`.
    pub fn update_many(filter: Document, update: Document) -> Self {
        WriteOperation::UpdateMany {
            filter,
            update,
            upsert: false,
            collation: None,
        }
    }

    /// Replace the first document matching `filter`.
    pub fn replace_one(filter: Document, replacement: Document) -> Self {
        WriteOperation::ReplaceOne {
            filter,
            replacement,
            upsert: false,
            collation: None,
        }
    }

    /// Delete the first document matching `filter`.
    pub fn delete_one(filter: Document) -> Self {
        WriteOperation::DeleteOne {
            filter,
            collation: None,
        }
    }

    /// Delete every document matching `filter`.
    pub fn delete_many(filter: Document) -> Self {
        WriteOperation::DeleteMany {
            filter,
            collation: None,
        }
    }

    /// Set the upsert flag. Inserts and deletes are returned unchanged.
    pub fn with_upsert(mut self, value: bool) -> Self {
        match &mut self {
            WriteOperation::UpdateOne { upsert, .. }
            | WriteOperation::UpdateMany { upsert, .. }
            | WriteOperation::ReplaceOne { upsert, .. } => *upsert = value,
            _ => {}
        }
        self
    }

    /// Set the collation. Inserts are returned unchanged.
    pub fn with_collation(mut self, value: Document) -> Self {
        match &mut self {
            WriteOperation::UpdateOne { collation, .. }
            | WriteOperation::UpdateMany { collation, .. }
            | WriteOperation::ReplaceOne { collation, .. }
            | WriteOperation::DeleteOne { collation, .. }
            | WriteOperation::DeleteMany { collation, .. } => *collation = Some(value),
            WriteOperation::InsertOne { .. } => {}
        }
        self
    }

    /// Which write command carries this operation.
    pub fn kind(&self) -> CommandKind {
        match self {
            WriteOperation::InsertOne { .. } => CommandKind::Insert,
            WriteOperation::UpdateOne { .. }
            | WriteOperation::UpdateMany { .. }
            | WriteOperation::ReplaceOne { .. } => CommandKind::Update,
            WriteOperation::DeleteOne { .. } | WriteOperation::DeleteMany { .. } => {
                CommandKind::Delete
            }
        }
    }

    /// Check the operation before anything is sent.
    pub fn validate(&self) -> Result<()> {
        match self {
            WriteOperation::InsertOne { document } => check_insert_keys(document),
            WriteOperation::UpdateOne { update, .. }
            | WriteOperation::UpdateMany { update, .. } => check_update(update),
            WriteOperation::ReplaceOne { replacement, .. } => check_replacement(replacement),
            WriteOperation::DeleteOne { .. } | WriteOperation::DeleteMany { .. } => Ok(()),
        }
    }

    /// The entry this operation contributes to its write command.
    pub fn into_entry(self) -> Document {
        match self {
            WriteOperation::InsertOne { document } => ensure_id(document),
            WriteOperation::UpdateOne {
                filter,
                update,
                upsert,
                collation,
            } => update_entry(filter, update, false, upsert, collation),
            WriteOperation::UpdateMany {
                filter,
                update,
                upsert,
                collation,
            } => update_entry(filter, update, true, upsert, collation),
            WriteOperation::ReplaceOne {
                filter,
                replacement,
                upsert,
                collation,
            } => update_entry(filter, replacement, false, upsert, collation),
            WriteOperation::DeleteOne { filter, collation } => delete_entry(filter, 1, collation),
            WriteOperation::DeleteMany { filter, collation } => delete_entry(filter, 0, collation),
        }
    }

    pub(crate) fn prepare(self) -> Result<PreparedWrite> {
        let kind = self.kind();
        let entry = self.into_entry();
        let size = bson_size(&entry)?;
        Ok(PreparedWrite { kind, entry, size })
    }
}

/// An operation in wire form, with its encoded size.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct PreparedWrite {
    pub kind: CommandKind,
    pub entry: Document,
    pub size: usize,
}

fn update_entry(
    filter: Document,
    update: Document,
    multi: bool,
    upsert: bool,
    collation: Option<Document>,
) -> Document {
    let mut entry = doc! { "q": filter, "u": update, "multi": multi, "upsert": upsert };
    if let Some(collation) = collation {
        entry.insert("collation", collation);
    }
    entry
}

fn delete_entry(filter: Document, limit: i32, collation: Option<Document>) -> Document {
    let mut entry = doc! { "q": filter, "limit": limit };
    if let Some(collation) = collation {
        entry.insert("collation", collation);
    }
    entry
}

/// Give `document` an `ObjectId` `_id` in first position unless it has one.
pub(crate) fn ensure_id(document: Document) -> Document {
    if document.contains_key("_id") {
        return document;
    }
    let mut out = doc! { "_id": ObjectId::new() };
    for (key, value) in document {
        out.insert(key, value);
    }
    out
}

/// Top-level keys of a stored document may not start with `$` or contain `.`.
pub(crate) fn check_insert_keys(document: &Document) -> Result<()> {
    for key in document.keys() {
        if key.starts_with('$') {
            return Err(MongoError::invalid_document(format!(
                "key '{}' must not start with '$'",
                key
            )));
        }
        if key.contains('.') {
            return Err(MongoError::invalid_document(format!(
                "key '{}' must not contain '.'",
                key
            )));
        }
    }
    Ok(())
}

pub(crate) fn check_update(update: &Document) -> Result<()> {
    if update.is_empty() {
        return Err(MongoError::invalid_argument(
            "update only works with $ operators",
        ));
    }
    if let Some(key) = update.keys().find(|key| !key.starts_with('$')) {
        return Err(MongoError::invalid_argument(format!(
            "update only works with $ operators, found '{}'",
            key
        )));
    }
    Ok(())
}

pub(crate) fn check_replacement(replacement: &Document) -> Result<()> {
    if let Some(key) = replacement.keys().find(|key| key.starts_with('$')) {
        return Err(MongoError::invalid_argument(format!(
            "replacement can not include $ operators, found '{}'",
            key
        )));
    }
    Ok(())
}
