//! Aggregating per-batch replies into one bulk result.

use super::batch::Batch;
use super::operation::{CommandKind, PreparedWrite};
use crate::error::Result;
use crate::transport::numeric;
use bson::{doc, Bson, Document};
use std::collections::BTreeMap;

/// An upsert performed by an update operation.
#[derive(Debug, Clone, PartialEq)]
pub struct Upserted {
    /// Position of the operation in the submitted sequence.
    pub index: usize,
    /// `_id` of the inserted document.
    pub id: Bson,
}

/// A failed operation.
#[derive(Debug, Clone, PartialEq)]
pub struct WriteError {
    /// Position of the operation in the submitted sequence.
    pub index: usize,
    /// Server error code.
    pub code: i32,
    /// Server error message.
    pub errmsg: String,
    /// The operation in wire form.
    pub op: Document,
}

/// Aggregated outcome of a bulk write.
#[derive(Debug, Clone, PartialEq)]
pub struct BulkResult {
    /// Documents inserted.
    pub n_inserted: i64,
    /// Documents matched by updates (excluding upserts).
    pub n_matched: i64,
    /// Documents modified by updates; `None` once any reply omitted it.
    pub n_modified: Option<i64>,
    /// Documents inserted by upserts.
    pub n_upserted: i64,
    /// Documents deleted.
    pub n_removed: i64,
    /// Upserts, by global index.
    pub upserted: Vec<Upserted>,
    /// Failed operations, by global index.
    pub write_errors: Vec<WriteError>,
    /// Write concern errors as reported by the server.
    pub write_concern_errors: Vec<Document>,
}

impl Default for BulkResult {
    fn default() -> Self {
        Self {
            n_inserted: 0,
            n_matched: 0,
            n_modified: Some(0),
            n_upserted: 0,
            n_removed: 0,
            upserted: Vec::new(),
            write_errors: Vec::new(),
            write_concern_errors: Vec::new(),
        }
    }
}

impl BulkResult {
    /// Fold one command reply into the totals.
    pub(crate) fn merge_batch(&mut self, batch: &Batch<PreparedWrite>, reply: &Document) {
        let n = numeric(reply, "n").unwrap_or(0);
        match batch.kind {
            CommandKind::Insert => self.n_inserted += n,
            CommandKind::Delete => self.n_removed += n,
            CommandKind::Update => {
                let upserted: Vec<&Document> = reply
                    .get_array("upserted")
                    .map(|ups| ups.iter().filter_map(Bson::as_document).collect())
                    .unwrap_or_default();
                self.n_upserted += upserted.len() as i64;
                self.n_matched += n - upserted.len() as i64;
                self.n_modified = match (self.n_modified, numeric(reply, "nModified")) {
                    (Some(total), Some(modified)) => Some(total + modified),
                    _ => None,
                };
                for up in upserted {
                    let local = numeric(up, "index").unwrap_or(0) as usize;
                    self.upserted.push(Upserted {
                        index: batch.global_index(local),
                        id: up.get("_id").cloned().unwrap_or(Bson::Null),
                    });
                }
            }
        }

        if let Ok(errors) = reply.get_array("writeErrors") {
            for error in errors.iter().filter_map(Bson::as_document) {
                let local = numeric(error, "index").unwrap_or(0) as usize;
                self.write_errors.push(WriteError {
                    index: batch.global_index(local),
                    code: numeric(error, "code").unwrap_or(0) as i32,
                    errmsg: error.get_str("errmsg").unwrap_or_default().to_string(),
                    op: batch
                        .items
                        .get(local)
                        .map(|item| item.entry.clone())
                        .unwrap_or_default(),
                });
            }
        }

        if let Ok(error) = reply.get_document("writeConcernError") {
            self.write_concern_errors.push(error.clone());
        }
    }

    /// Order errors and upserts by global index.
    pub(crate) fn finish(&mut self) {
        self.write_errors.sort_by_key(|error| error.index);
        self.upserted.sort_by_key(|up| up.index);
    }

    /// Whether any operation failed.
    pub fn has_write_errors(&self) -> bool {
        !self.write_errors.is_empty()
    }

    /// Whether the server reported any write concern error.
    pub fn has_write_concern_errors(&self) -> bool {
        !self.write_concern_errors.is_empty()
    }

    /// Whether the bulk write should be reported as failed.
    pub fn has_errors(&self) -> bool {
        self.has_write_errors() || self.has_write_concern_errors()
    }

    /// The result in the shape servers and shells print it.
    pub fn to_document(&self) -> Document {
        let upserted: Vec<Bson> = self
            .upserted
            .iter()
            .map(|up| Bson::Document(doc! { "index": up.index as i64, "_id": up.id.clone() }))
            .collect();
        let write_errors: Vec<Bson> = self
            .write_errors
            .iter()
            .map(|error| {
                Bson::Document(doc! {
                    "index": error.index as i64,
                    "code": error.code,
                    "errmsg": error.errmsg.clone(),
                    "op": error.op.clone(),
                })
            })
            .collect();

        let mut out = doc! {
            "nInserted": self.n_inserted,
            "nMatched": self.n_matched,
        };
        if let Some(modified) = self.n_modified {
            out.insert("nModified", modified);
        }
        out.insert("nUpserted", self.n_upserted);
        out.insert("nRemoved", self.n_removed);
        out.insert("upserted", upserted);
        out.insert("writeErrors", write_errors);
        out.insert("writeConcernErrors", self.write_concern_errors.clone());
        out
    }

    /// Relaxed extended JSON rendering of [`BulkResult::to_document`].
    pub fn to_json(&self) -> Result<String> {
        let value = Bson::Document(self.to_document()).into_relaxed_extjson();
        Ok(serde_json::to_string(&value)?)
    }
}

/// Summary returned by `Collection::bulk_write`.
#[derive(Debug, Clone, PartialEq)]
pub struct BulkWriteResult {
    /// Documents inserted.
    pub inserted_count: i64,
    /// Documents matched by updates.
    pub matched_count: i64,
    /// Documents modified, when every server reply reported it.
    pub modified_count: Option<i64>,
    /// Documents deleted.
    pub deleted_count: i64,
    /// Documents upserted.
    pub upserted_count: i64,
    /// Upserted `_id`s keyed by operation index.
    pub upserted_ids: BTreeMap<usize, Bson>,
    /// The full aggregated result.
    pub bulk_api_result: BulkResult,
}

impl From<BulkResult> for BulkWriteResult {
    fn from(result: BulkResult) -> Self {
        Self {
            inserted_count: result.n_inserted,
            matched_count: result.n_matched,
            modified_count: result.n_modified,
            deleted_count: result.n_removed,
            upserted_count: result.n_upserted,
            upserted_ids: result
                .upserted
                .iter()
                .map(|up| (up.index, up.id.clone()))
                .collect(),
            bulk_api_result: result,
        }
    }
}
