//! In-memory transport.
//!
//! [`MemoryServer`] answers the subset of server commands this crate issues
//! from process-local collections. It is what the test-suite runs against,
//! and it is handy for embedding the bulk and GridFS layers without a
//! running server.
//!
//! Supported query operators: `$eq $ne $gt $gte $lt $lte $in $nin $exists`
//! plus `$and`/`$or` at the top level. Supported update operators: `$set`,
//! `$unset`, `$inc`, and replacement documents.

use crate::error::{MongoError, Result, DUPLICATE_KEY_CODE};
use crate::transport::{bson_size, numeric, ServerLimits, Transport};
use async_trait::async_trait;
use bson::{doc, oid::ObjectId, Bson, Document};
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap, VecDeque};
use tokio::sync::Mutex;
use tracing::debug;

const FAILED_TO_PARSE_CODE: i32 = 9;
const TYPE_MISMATCH_CODE: i32 = 14;
const NAMESPACE_NOT_FOUND_CODE: i32 = 26;
const CURSOR_NOT_FOUND_CODE: i32 = 43;
const COMMAND_NOT_FOUND_CODE: i32 = 59;
const IMMUTABLE_FIELD_CODE: i32 = 66;
const OBJECT_TOO_LARGE_CODE: i32 = 10334;

/// Per-operation failure: server code and message.
type OpError = (i32, String);

#[derive(Debug, Clone)]
struct IndexSpec {
    name: String,
    key: Document,
    unique: bool,
}

impl IndexSpec {
    fn id_index() -> Self {
        Self {
            name: "_id_".to_string(),
            key: doc! { "_id": 1 },
            unique: true,
        }
    }

    fn to_document(&self) -> Document {
        let mut out = doc! { "v": 2, "key": self.key.clone(), "name": self.name.clone() };
        if self.unique && self.name != "_id_" {
            out.insert("unique", true);
        }
        out
    }

    fn key_values(&self, doc: &Document) -> Vec<Bson> {
        self.key
            .keys()
            .map(|path| lookup_path(doc, path).cloned().unwrap_or(Bson::Null))
            .collect()
    }
}

#[derive(Debug)]
struct MemCollection {
    docs: Vec<Document>,
    indexes: Vec<IndexSpec>,
}

impl Default for MemCollection {
    fn default() -> Self {
        Self {
            docs: Vec::new(),
            indexes: vec![IndexSpec::id_index()],
        }
    }
}

#[derive(Debug, Default)]
struct UpdateOutcome {
    matched: i64,
    modified: i64,
    upserted: Option<Bson>,
}

impl MemCollection {
    /// Message for the first unique index `candidate` would violate.
    /// `skip` is the position of the document being replaced, if any.
    fn duplicate_key(&self, candidate: &Document, skip: Option<usize>) -> Option<String> {
        for index in self.indexes.iter().filter(|index| index.unique) {
            let values = index.key_values(candidate);
            let clash = self.docs.iter().enumerate().any(|(pos, existing)| {
                Some(pos) != skip
                    && index
                        .key_values(existing)
                        .iter()
                        .zip(&values)
                        .all(|(a, b)| values_equal(a, b))
            });
            if clash {
                return Some(format!(
                    "E11000 duplicate key error index: {} dup key: {}",
                    index.name,
                    Bson::Array(values)
                ));
            }
        }
        None
    }

    fn check_size(doc: &Document, limits: &ServerLimits) -> std::result::Result<(), OpError> {
        let size = bson_size(doc).unwrap_or(usize::MAX);
        if size > limits.max_bson_object_size {
            return Err((
                OBJECT_TOO_LARGE_CODE,
                format!(
                    "object to insert too large. size in bytes: {}, max size: {}",
                    size, limits.max_bson_object_size
                ),
            ));
        }
        Ok(())
    }

    fn insert_one(
        &mut self,
        doc: Document,
        limits: &ServerLimits,
    ) -> std::result::Result<(), OpError> {
        Self::check_size(&doc, limits)?;
        let doc = with_id(doc, None);
        if let Some(message) = self.duplicate_key(&doc, None) {
            return Err((DUPLICATE_KEY_CODE, message));
        }
        self.docs.push(doc);
        Ok(())
    }

    fn positions(&self, filter: &Document) -> Vec<usize> {
        self.docs
            .iter()
            .enumerate()
            .filter(|(_, doc)| matches(doc, filter))
            .map(|(pos, _)| pos)
            .collect()
    }

    fn update(
        &mut self,
        filter: &Document,
        update: &Document,
        multi: bool,
        upsert: bool,
        limits: &ServerLimits,
    ) -> std::result::Result<UpdateOutcome, OpError> {
        let operator_style = update.keys().next().map_or(false, |k| k.starts_with('$'));
        if operator_style {
            if let Some(bad) = update.keys().find(|k| !k.starts_with('$')) {
                return Err((FAILED_TO_PARSE_CODE, format!("Unknown modifier: {}", bad)));
            }
        } else if update.keys().any(|k| k.starts_with('$')) {
            return Err((
                FAILED_TO_PARSE_CODE,
                "replacement document must not contain update operators".to_string(),
            ));
        } else if multi {
            return Err((
                FAILED_TO_PARSE_CODE,
                "multi update is not supported for replacement-style update".to_string(),
            ));
        }

        let mut targets = self.positions(filter);
        if !multi {
            targets.truncate(1);
        }

        if targets.is_empty() {
            if !upsert {
                return Ok(UpdateOutcome::default());
            }
            let seed = equality_seed(filter);
            let created = if operator_style {
                apply_operators(&seed, update)?
            } else {
                update.clone()
            };
            let created = with_id(created, seed.get("_id").cloned());
            Self::check_size(&created, limits)?;
            if let Some(message) = self.duplicate_key(&created, None) {
                return Err((DUPLICATE_KEY_CODE, message));
            }
            let id = created.get("_id").cloned().unwrap_or(Bson::Null);
            self.docs.push(created);
            return Ok(UpdateOutcome {
                upserted: Some(id),
                ..UpdateOutcome::default()
            });
        }

        let mut outcome = UpdateOutcome::default();
        for pos in targets {
            let current = &self.docs[pos];
            let next = if operator_style {
                apply_operators(current, update)?
            } else {
                let id = current.get("_id").cloned().unwrap_or(Bson::Null);
                if let Some(new_id) = update.get("_id") {
                    if !values_equal(new_id, &id) {
                        return Err((
                            IMMUTABLE_FIELD_CODE,
                            "the (immutable) field '_id' was found to have been altered"
                                .to_string(),
                        ));
                    }
                }
                with_id(update.clone(), Some(id))
            };
            outcome.matched += 1;
            if next != *current {
                Self::check_size(&next, limits)?;
                if let Some(message) = self.duplicate_key(&next, Some(pos)) {
                    return Err((DUPLICATE_KEY_CODE, message));
                }
                self.docs[pos] = next;
                outcome.modified += 1;
            }
        }
        Ok(outcome)
    }

    fn delete(&mut self, filter: &Document, limit: i64) -> i64 {
        let mut targets = self.positions(filter);
        if limit == 1 {
            targets.truncate(1);
        }
        for pos in targets.iter().rev() {
            self.docs.remove(*pos);
        }
        targets.len() as i64
    }
}

#[derive(Debug)]
struct PendingCursor {
    ns: String,
    docs: VecDeque<Document>,
    batch_size: Option<usize>,
}

#[derive(Debug, Default)]
struct ServerState {
    databases: HashMap<String, BTreeMap<String, MemCollection>>,
    cursors: HashMap<i64, PendingCursor>,
    next_cursor_id: i64,
    write_concern_error: Option<Document>,
    command_counts: HashMap<String, usize>,
}

/// A process-local server that implements [`Transport`].
///
/// # Example
///
/// ```ignore
/// use std::sync::Arc;
/// use mongo_bulkgrid::{memory::MemoryServer, Client, ClientOptions};
///
/// let client = Client::with_transport(Arc::new(MemoryServer::new()), ClientOptions::default());
/// let db = client.database("test");
/// ```
#[derive(Debug, Default)]
pub struct MemoryServer {
    state: Mutex<ServerState>,
    limits: ServerLimits,
}

impl MemoryServer {
    /// Create a server advertising the default limits.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a server advertising custom limits.
    pub fn with_limits(limits: ServerLimits) -> Self {
        Self {
            state: Mutex::new(ServerState::default()),
            limits,
        }
    }

    /// The limits this server advertises and enforces.
    pub fn limits(&self) -> &ServerLimits {
        &self.limits
    }

    /// Attach `error` as `writeConcernError` to every write reply (or stop doing so).
    pub async fn set_write_concern_error(&self, error: Option<Document>) {
        self.state.lock().await.write_concern_error = error;
    }

    /// How many times a command named `name` has been received.
    pub async fn command_count(&self, name: &str) -> usize {
        self.state
            .lock()
            .await
            .command_counts
            .get(name)
            .copied()
            .unwrap_or(0)
    }

    fn hello(&self) -> Document {
        doc! {
            "isWritablePrimary": true,
            "maxBsonObjectSize": self.limits.max_bson_object_size as i64,
            "maxMessageSizeBytes": self.limits.max_message_size_bytes as i64,
            "maxWriteBatchSize": self.limits.max_write_batch_size as i64,
            "ok": 1.0,
        }
    }
}

#[async_trait]
impl Transport for MemoryServer {
    async fn run_command(&self, db: &str, command: Document) -> Result<Document> {
        let name = command
            .keys()
            .next()
            .cloned()
            .ok_or_else(|| MongoError::command(FAILED_TO_PARSE_CODE, "empty command"))?;
        debug!(db, command = %name, "memory server command");

        let mut state = self.state.lock().await;
        *state.command_counts.entry(name.clone()).or_insert(0) += 1;
        match name.as_str() {
            "hello" | "isMaster" | "ismaster" => Ok(self.hello()),
            "insert" => state.insert(db, &command, &self.limits),
            "update" => state.update(db, &command, &self.limits),
            "delete" => state.delete(db, &command),
            "find" => state.find(db, &command),
            "getMore" => state.get_more(&command),
            "killCursors" => state.kill_cursors(&command),
            "count" => state.count(db, &command),
            "distinct" => state.distinct(db, &command),
            "createIndexes" => state.create_indexes(db, &command),
            "listIndexes" => state.list_indexes(db, &command),
            "listCollections" => Ok(state.list_collections(db)),
            "drop" => state.drop_collection(db, &command),
            other => Err(MongoError::command(
                COMMAND_NOT_FOUND_CODE,
                format!("no such command: '{}'", other),
            )),
        }
    }
}

impl ServerState {
    fn collection(&self, db: &str, name: &str) -> Option<&MemCollection> {
        self.databases.get(db)?.get(name)
    }

    fn collection_mut(&mut self, db: &str, name: &str) -> &mut MemCollection {
        self.databases
            .entry(db.to_string())
            .or_default()
            .entry(name.to_string())
            .or_default()
    }

    fn write_reply(&self, n: i64, write_errors: Vec<Bson>) -> Document {
        let mut reply = doc! { "n": n, "ok": 1.0 };
        if !write_errors.is_empty() {
            reply.insert("writeErrors", write_errors);
        }
        if let Some(ref error) = self.write_concern_error {
            reply.insert("writeConcernError", error.clone());
        }
        reply
    }

    fn insert(&mut self, db: &str, command: &Document, limits: &ServerLimits) -> Result<Document> {
        let name = command.get_str("insert")?.to_string();
        let ordered = command.get_bool("ordered").unwrap_or(true);
        let documents = command.get_array("documents")?.clone();

        let coll = self.collection_mut(db, &name);
        let mut n = 0;
        let mut write_errors = Vec::new();
        for (index, value) in documents.into_iter().enumerate() {
            let outcome = match value {
                Bson::Document(doc) => coll.insert_one(doc, limits),
                _ => Err((
                    FAILED_TO_PARSE_CODE,
                    "document to insert must be an object".to_string(),
                )),
            };
            match outcome {
                Ok(()) => n += 1,
                Err((code, errmsg)) => {
                    write_errors.push(Bson::Document(
                        doc! { "index": index as i32, "code": code, "errmsg": errmsg },
                    ));
                    if ordered {
                        break;
                    }
                }
            }
        }
        Ok(self.write_reply(n, write_errors))
    }

    fn update(&mut self, db: &str, command: &Document, limits: &ServerLimits) -> Result<Document> {
        let name = command.get_str("update")?.to_string();
        let ordered = command.get_bool("ordered").unwrap_or(true);
        let updates = command.get_array("updates")?.clone();

        let coll = self.collection_mut(db, &name);
        let mut n = 0;
        let mut n_modified = 0;
        let mut upserted = Vec::new();
        let mut write_errors = Vec::new();
        for (index, entry) in updates.iter().enumerate() {
            let outcome = match entry {
                Bson::Document(spec) => {
                    let filter = spec.get_document("q").cloned().unwrap_or_default();
                    match spec.get_document("u") {
                        Ok(update) => coll.update(
                            &filter,
                            update,
                            spec.get_bool("multi").unwrap_or(false),
                            spec.get_bool("upsert").unwrap_or(false),
                            limits,
                        ),
                        Err(_) => Err((
                            FAILED_TO_PARSE_CODE,
                            "update entry needs a 'u' document".to_string(),
                        )),
                    }
                }
                _ => Err((FAILED_TO_PARSE_CODE, "update entry must be an object".to_string())),
            };
            match outcome {
                Ok(outcome) => {
                    n += outcome.matched;
                    n_modified += outcome.modified;
                    if let Some(id) = outcome.upserted {
                        n += 1;
                        upserted.push(Bson::Document(doc! { "index": index as i32, "_id": id }));
                    }
                }
                Err((code, errmsg)) => {
                    write_errors.push(Bson::Document(
                        doc! { "index": index as i32, "code": code, "errmsg": errmsg },
                    ));
                    if ordered {
                        break;
                    }
                }
            }
        }

        let mut reply = self.write_reply(n, write_errors);
        reply.insert("nModified", n_modified);
        if !upserted.is_empty() {
            reply.insert("upserted", upserted);
        }
        Ok(reply)
    }

    fn delete(&mut self, db: &str, command: &Document) -> Result<Document> {
        let name = command.get_str("delete")?.to_string();
        let ordered = command.get_bool("ordered").unwrap_or(true);
        let deletes = command.get_array("deletes")?.clone();

        let coll = self.collection_mut(db, &name);
        let mut n = 0;
        let mut write_errors = Vec::new();
        for (index, entry) in deletes.iter().enumerate() {
            match entry {
                Bson::Document(spec) => {
                    let filter = spec.get_document("q").cloned().unwrap_or_default();
                    n += coll.delete(&filter, numeric(spec, "limit").unwrap_or(0));
                }
                _ => {
                    write_errors.push(Bson::Document(doc! {
                        "index": index as i32,
                        "code": FAILED_TO_PARSE_CODE,
                        "errmsg": "delete entry must be an object",
                    }));
                    if ordered {
                        break;
                    }
                }
            }
        }
        Ok(self.write_reply(n, write_errors))
    }

    fn find(&mut self, db: &str, command: &Document) -> Result<Document> {
        let name = command.get_str("find")?.to_string();
        let filter = command.get_document("filter").cloned().unwrap_or_default();

        let mut docs: Vec<Document> = self
            .collection(db, &name)
            .map(|coll| {
                coll.docs
                    .iter()
                    .filter(|doc| matches(doc, &filter))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();

        if let Ok(sort) = command.get_document("sort") {
            sort_documents(&mut docs, sort);
        }
        let skip = numeric(command, "skip").unwrap_or(0).max(0) as usize;
        docs.drain(..skip.min(docs.len()));
        let limit = numeric(command, "limit").unwrap_or(0);
        if limit != 0 {
            docs.truncate(limit.unsigned_abs() as usize);
        }
        if let Ok(projection) = command.get_document("projection") {
            docs = docs.iter().map(|doc| project(doc, projection)).collect();
        }

        let batch_size = numeric(command, "batchSize")
            .filter(|size| *size > 0)
            .map(|size| size as usize);
        let single_batch = command.get_bool("singleBatch").unwrap_or(false) || limit < 0;
        Ok(self.open_cursor(format!("{}.{}", db, name), docs, batch_size, single_batch))
    }

    fn open_cursor(
        &mut self,
        ns: String,
        docs: Vec<Document>,
        batch_size: Option<usize>,
        single_batch: bool,
    ) -> Document {
        let mut pending: VecDeque<Document> = docs.into();
        let take = batch_size.unwrap_or(pending.len()).min(pending.len());
        let batch: Vec<Bson> = pending.drain(..take).map(Bson::Document).collect();

        let id = if pending.is_empty() || single_batch {
            0
        } else {
            self.next_cursor_id += 1;
            let id = self.next_cursor_id;
            self.cursors.insert(
                id,
                PendingCursor {
                    ns: ns.clone(),
                    docs: pending,
                    batch_size,
                },
            );
            id
        };

        let mut cursor = Document::new();
        cursor.insert("firstBatch", batch);
        cursor.insert("id", id);
        cursor.insert("ns", ns);
        doc! { "cursor": cursor, "ok": 1.0 }
    }

    fn get_more(&mut self, command: &Document) -> Result<Document> {
        let id = numeric(command, "getMore").unwrap_or(0);
        let mut pending = self.cursors.remove(&id).ok_or_else(|| {
            MongoError::command(CURSOR_NOT_FOUND_CODE, format!("cursor id {} not found", id))
        })?;

        let batch_size = numeric(command, "batchSize")
            .filter(|size| *size > 0)
            .map(|size| size as usize)
            .or(pending.batch_size);
        let take = batch_size
            .unwrap_or(pending.docs.len())
            .min(pending.docs.len());
        let batch: Vec<Bson> = pending.docs.drain(..take).map(Bson::Document).collect();
        let ns = pending.ns.clone();

        let next_id = if pending.docs.is_empty() {
            0
        } else {
            self.cursors.insert(id, pending);
            id
        };
        Ok(doc! {
            "cursor": { "nextBatch": batch, "id": next_id, "ns": ns },
            "ok": 1.0,
        })
    }

    fn kill_cursors(&mut self, command: &Document) -> Result<Document> {
        let mut killed = Vec::new();
        for id in command.get_array("cursors")? {
            let id = match id {
                Bson::Int64(v) => *v,
                Bson::Int32(v) => i64::from(*v),
                _ => continue,
            };
            if self.cursors.remove(&id).is_some() {
                killed.push(Bson::Int64(id));
            }
        }
        Ok(doc! { "cursorsKilled": killed, "ok": 1.0 })
    }

    fn count(&self, db: &str, command: &Document) -> Result<Document> {
        let name = command.get_str("count")?;
        let query = command.get_document("query").cloned().unwrap_or_default();
        let total = self
            .collection(db, name)
            .map(|coll| coll.positions(&query).len())
            .unwrap_or(0);

        let skip = numeric(command, "skip").unwrap_or(0).max(0) as usize;
        let mut n = total.saturating_sub(skip);
        let limit = numeric(command, "limit").unwrap_or(0);
        if limit != 0 {
            n = n.min(limit.unsigned_abs() as usize);
        }
        Ok(doc! { "n": n as i64, "ok": 1.0 })
    }

    fn distinct(&self, db: &str, command: &Document) -> Result<Document> {
        let name = command.get_str("distinct")?;
        let key = command.get_str("key")?;
        let query = command.get_document("query").cloned().unwrap_or_default();

        let mut values: Vec<Bson> = Vec::new();
        if let Some(coll) = self.collection(db, name) {
            for doc in coll.docs.iter().filter(|doc| matches(doc, &query)) {
                let found = match lookup_path(doc, key) {
                    Some(Bson::Array(items)) => items.clone(),
                    Some(value) => vec![value.clone()],
                    None => continue,
                };
                for value in found {
                    if !values.iter().any(|seen| values_equal(seen, &value)) {
                        values.push(value);
                    }
                }
            }
        }
        Ok(doc! { "values": values, "ok": 1.0 })
    }

    fn create_indexes(&mut self, db: &str, command: &Document) -> Result<Document> {
        let name = command.get_str("createIndexes")?.to_string();
        let requested = command.get_array("indexes")?.clone();

        let coll = self.collection_mut(db, &name);
        let before = coll.indexes.len() as i32;
        for entry in requested {
            let spec = match entry {
                Bson::Document(spec) => spec,
                _ => {
                    return Err(MongoError::command(
                        FAILED_TO_PARSE_CODE,
                        "index specification must be an object",
                    ))
                }
            };
            let key = spec.get_document("key")?.clone();
            let index_name = match spec.get_str("name") {
                Ok(index_name) => index_name.to_string(),
                Err(_) => default_index_name(&key),
            };
            if coll.indexes.iter().any(|existing| existing.name == index_name) {
                continue;
            }
            let index = IndexSpec {
                name: index_name,
                key,
                unique: spec.get_bool("unique").unwrap_or(false),
            };
            if index.unique {
                let mut seen: Vec<Vec<Bson>> = Vec::new();
                for doc in &coll.docs {
                    let values = index.key_values(doc);
                    if seen.iter().any(|other| {
                        other.iter().zip(&values).all(|(a, b)| values_equal(a, b))
                    }) {
                        return Err(MongoError::command(
                            DUPLICATE_KEY_CODE,
                            format!("E11000 duplicate key error index: {}", index.name),
                        ));
                    }
                    seen.push(values);
                }
            }
            coll.indexes.push(index);
        }
        Ok(doc! {
            "numIndexesBefore": before,
            "numIndexesAfter": coll.indexes.len() as i32,
            "ok": 1.0,
        })
    }

    fn list_indexes(&mut self, db: &str, command: &Document) -> Result<Document> {
        let name = command.get_str("listIndexes")?.to_string();
        let specs: Vec<Document> = self
            .collection(db, &name)
            .ok_or_else(|| {
                MongoError::command(
                    NAMESPACE_NOT_FOUND_CODE,
                    format!("ns does not exist: {}.{}", db, name),
                )
            })?
            .indexes
            .iter()
            .map(IndexSpec::to_document)
            .collect();
        Ok(self.open_cursor(format!("{}.{}", db, name), specs, None, true))
    }

    fn list_collections(&mut self, db: &str) -> Document {
        let names: Vec<Document> = self
            .databases
            .get(db)
            .map(|colls| {
                colls
                    .keys()
                    .map(|name| doc! { "name": name.clone(), "type": "collection" })
                    .collect()
            })
            .unwrap_or_default();
        self.open_cursor(format!("{}.$cmd.listCollections", db), names, None, true)
    }

    fn drop_collection(&mut self, db: &str, command: &Document) -> Result<Document> {
        let name = command.get_str("drop")?;
        let removed = self
            .databases
            .get_mut(db)
            .and_then(|colls| colls.remove(name));
        match removed {
            Some(_) => Ok(doc! { "ns": format!("{}.{}", db, name), "ok": 1.0 }),
            None => Err(MongoError::command(NAMESPACE_NOT_FOUND_CODE, "ns not found")),
        }
    }
}

/// `{a: 1, b: -1}` becomes `a_1_b_-1`.
fn default_index_name(key: &Document) -> String {
    key.iter()
        .map(|(field, direction)| format!("{}_{}", field, direction))
        .collect::<Vec<_>>()
        .join("_")
}

/// Ensure `doc` has an `_id` in first position.
fn with_id(doc: Document, id: Option<Bson>) -> Document {
    let id = match (doc.get("_id"), id) {
        (Some(existing), _) => existing.clone(),
        (None, Some(id)) => id,
        (None, None) => Bson::ObjectId(ObjectId::new()),
    };
    let mut out = doc! { "_id": id };
    for (key, value) in doc {
        if key != "_id" {
            out.insert(key, value);
        }
    }
    out
}

fn lookup_path<'a>(doc: &'a Document, path: &str) -> Option<&'a Bson> {
    match path.split_once('.') {
        None => doc.get(path),
        Some((head, rest)) => match doc.get(head)? {
            Bson::Document(child) => lookup_path(child, rest),
            _ => None,
        },
    }
}

fn set_path(doc: &mut Document, path: &str, value: Bson) {
    match path.split_once('.') {
        None => {
            doc.insert(path, value);
        }
        Some((head, rest)) => {
            if !matches!(doc.get(head), Some(Bson::Document(_))) {
                doc.insert(head, Document::new());
            }
            if let Some(Bson::Document(child)) = doc.get_mut(head) {
                set_path(child, rest, value);
            }
        }
    }
}

fn unset_path(doc: &mut Document, path: &str) {
    match path.split_once('.') {
        None => {
            doc.remove(path);
        }
        Some((head, rest)) => {
            if let Some(Bson::Document(child)) = doc.get_mut(head) {
                unset_path(child, rest);
            }
        }
    }
}

fn is_operator_doc(value: &Bson) -> bool {
    match value {
        Bson::Document(d) => d.keys().next().map_or(false, |k| k.starts_with('$')),
        _ => false,
    }
}

/// Fields an upsert inherits from its filter.
fn equality_seed(filter: &Document) -> Document {
    let mut seed = Document::new();
    for (key, value) in filter {
        if key.starts_with('$') {
            continue;
        }
        match value {
            Bson::Document(ops) if is_operator_doc(value) => {
                if let Some(eq) = ops.get("$eq") {
                    set_path(&mut seed, key, eq.clone());
                }
            }
            _ => set_path(&mut seed, key, value.clone()),
        }
    }
    seed
}

fn apply_operators(doc: &Document, update: &Document) -> std::result::Result<Document, OpError> {
    let mut out = doc.clone();
    for (op, fields) in update {
        let fields = match fields {
            Bson::Document(fields) => fields,
            other => {
                return Err((
                    FAILED_TO_PARSE_CODE,
                    format!("Modifiers operate on fields but we found {} instead", other),
                ))
            }
        };
        for (path, value) in fields {
            match op.as_str() {
                "$set" => set_path(&mut out, path, value.clone()),
                "$unset" => unset_path(&mut out, path),
                "$inc" => {
                    let current = lookup_path(&out, path).cloned().unwrap_or(Bson::Int32(0));
                    let sum = add_numbers(&current, value).ok_or_else(|| {
                        (
                            TYPE_MISMATCH_CODE,
                            format!("Cannot apply $inc to a value of non-numeric type at {}", path),
                        )
                    })?;
                    set_path(&mut out, path, sum);
                }
                other => return Err((FAILED_TO_PARSE_CODE, format!("Unknown modifier: {}", other))),
            }
        }
    }
    Ok(out)
}

fn add_numbers(a: &Bson, b: &Bson) -> Option<Bson> {
    Some(match (a, b) {
        (Bson::Int32(x), Bson::Int32(y)) => Bson::Int32(x.wrapping_add(*y)),
        (Bson::Int32(x), Bson::Int64(y)) => Bson::Int64(i64::from(*x) + y),
        (Bson::Int64(x), Bson::Int32(y)) => Bson::Int64(x + i64::from(*y)),
        (Bson::Int64(x), Bson::Int64(y)) => Bson::Int64(x + y),
        _ => Bson::Double(as_f64(a)? + as_f64(b)?),
    })
}

fn as_f64(value: &Bson) -> Option<f64> {
    match value {
        Bson::Int32(v) => Some(f64::from(*v)),
        Bson::Int64(v) => Some(*v as f64),
        Bson::Double(v) => Some(*v),
        _ => None,
    }
}

fn values_equal(a: &Bson, b: &Bson) -> bool {
    match (as_f64(a), as_f64(b)) {
        (Some(x), Some(y)) => x == y,
        _ => a == b,
    }
}

fn compare_values(a: &Bson, b: &Bson) -> Option<Ordering> {
    if let (Some(x), Some(y)) = (as_f64(a), as_f64(b)) {
        return x.partial_cmp(&y);
    }
    match (a, b) {
        (Bson::String(x), Bson::String(y)) => Some(x.cmp(y)),
        (Bson::DateTime(x), Bson::DateTime(y)) => Some(x.cmp(y)),
        (Bson::ObjectId(x), Bson::ObjectId(y)) => Some(x.bytes().cmp(&y.bytes())),
        (Bson::Boolean(x), Bson::Boolean(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

fn type_rank(value: Option<&Bson>) -> u8 {
    match value {
        None | Some(Bson::Null) => 0,
        Some(Bson::Int32(_)) | Some(Bson::Int64(_)) | Some(Bson::Double(_)) => 1,
        Some(Bson::String(_)) => 2,
        Some(Bson::Document(_)) => 3,
        Some(Bson::Array(_)) => 4,
        Some(Bson::Binary(_)) => 5,
        Some(Bson::ObjectId(_)) => 6,
        Some(Bson::Boolean(_)) => 7,
        Some(Bson::DateTime(_)) => 8,
        Some(_) => 9,
    }
}

fn sort_documents(docs: &mut [Document], sort: &Document) {
    docs.sort_by(|a, b| {
        for (path, direction) in sort {
            let (left, right) = (lookup_path(a, path), lookup_path(b, path));
            let ordering = type_rank(left).cmp(&type_rank(right)).then_with(|| {
                match (left, right) {
                    (Some(x), Some(y)) => compare_values(x, y).unwrap_or(Ordering::Equal),
                    _ => Ordering::Equal,
                }
            });
            let descending = as_f64(direction).map_or(false, |d| d < 0.0);
            let ordering = if descending { ordering.reverse() } else { ordering };
            if ordering != Ordering::Equal {
                return ordering;
            }
        }
        Ordering::Equal
    });
}

fn is_truthy(value: &Bson) -> bool {
    match value {
        Bson::Boolean(v) => *v,
        Bson::Null => false,
        other => as_f64(other).map_or(true, |v| v != 0.0),
    }
}

fn project(doc: &Document, projection: &Document) -> Document {
    let inclusive = projection
        .iter()
        .any(|(key, value)| key != "_id" && is_truthy(value));
    if inclusive {
        let keep_id = projection.get("_id").map_or(true, is_truthy);
        let mut out = Document::new();
        for (key, value) in doc {
            let wanted = if key == "_id" {
                keep_id
            } else {
                projection.get(key).map_or(false, is_truthy)
            };
            if wanted {
                out.insert(key.clone(), value.clone());
            }
        }
        out
    } else {
        let mut out = doc.clone();
        for (key, value) in projection {
            if !is_truthy(value) {
                out.remove(key);
            }
        }
        out
    }
}

fn matches(doc: &Document, filter: &Document) -> bool {
    filter.iter().all(|(key, condition)| match key.as_str() {
        "$and" => sub_filters(condition).iter().all(|f| matches(doc, f)),
        "$or" => sub_filters(condition).iter().any(|f| matches(doc, f)),
        _ => matches_value(lookup_path(doc, key), condition),
    })
}

fn sub_filters(condition: &Bson) -> Vec<Document> {
    match condition {
        Bson::Array(items) => items
            .iter()
            .filter_map(|item| item.as_document().cloned())
            .collect(),
        _ => Vec::new(),
    }
}

fn equals_or_contains(value: Option<&Bson>, expected: &Bson) -> bool {
    match value {
        None => matches!(expected, Bson::Null),
        Some(Bson::Array(items)) => {
            values_equal(&Bson::Array(items.clone()), expected)
                || items.iter().any(|item| values_equal(item, expected))
        }
        Some(actual) => values_equal(actual, expected),
    }
}

fn matches_value(value: Option<&Bson>, condition: &Bson) -> bool {
    match condition {
        Bson::Document(ops) if is_operator_doc(condition) => ops
            .iter()
            .all(|(op, argument)| apply_query_operator(value, op, argument)),
        _ => equals_or_contains(value, condition),
    }
}

fn apply_query_operator(value: Option<&Bson>, op: &str, argument: &Bson) -> bool {
    let ordered = |wanted: &[Ordering]| {
        value
            .and_then(|actual| compare_values(actual, argument))
            .map_or(false, |ordering| wanted.contains(&ordering))
    };
    match op {
        "$eq" => equals_or_contains(value, argument),
        "$ne" => !equals_or_contains(value, argument),
        "$gt" => ordered(&[Ordering::Greater]),
        "$gte" => ordered(&[Ordering::Greater, Ordering::Equal]),
        "$lt" => ordered(&[Ordering::Less]),
        "$lte" => ordered(&[Ordering::Less, Ordering::Equal]),
        "$in" => match argument {
            Bson::Array(options) => options.iter().any(|option| equals_or_contains(value, option)),
            _ => false,
        },
        "$nin" => match argument {
            Bson::Array(options) => !options.iter().any(|option| equals_or_contains(value, option)),
            _ => true,
        },
        "$exists" => value.is_some() == is_truthy(argument),
        _ => false,
    }
}
