//! Collection struct with CRUD and bulk operations.

use crate::bulk::operation::{check_insert_keys, check_replacement, check_update, ensure_id};
use crate::bulk::{
    BulkExecutor, BulkOperationBuilder, BulkWriteResult, CommandKind, WriteOperation,
};
use crate::cursor::Cursor;
use crate::db::Database;
use crate::error::{MongoError, Result};
use crate::transport::numeric;
use bson::{doc, Bson, Document};
use serde::{de::DeserializeOwned, Serialize};
use std::collections::HashMap;
use std::marker::PhantomData;

const NAMESPACE_NOT_FOUND_CODE: i32 = 26;

/// Result of an insert_one operation.
#[derive(Debug, Clone)]
pub struct InsertOneResult {
    /// The ID of the inserted document.
    pub inserted_id: Bson,
}

/// Result of an insert_many operation.
#[derive(Debug, Clone)]
pub struct InsertManyResult {
    /// Map of index to inserted ID.
    pub inserted_ids: HashMap<usize, Bson>,
}

/// Result of an update operation.
#[derive(Debug, Clone)]
pub struct UpdateResult {
    /// Number of documents matched.
    pub matched_count: u64,
    /// Number of documents modified.
    pub modified_count: u64,
    /// The ID of the upserted document, if any.
    pub upserted_id: Option<Bson>,
}

/// Result of a delete operation.
#[derive(Debug, Clone)]
pub struct DeleteResult {
    /// Number of documents deleted.
    pub deleted_count: u64,
}

/// Options for find operations.
#[derive(Debug, Clone, Default)]
pub struct FindOptions {
    /// Maximum number of documents to return.
    pub limit: Option<i64>,
    /// Number of documents to skip.
    pub skip: Option<u64>,
    /// Sort order.
    pub sort: Option<Document>,
    /// Projection (fields to include/exclude).
    pub projection: Option<Document>,
    /// Batch size for cursor.
    pub batch_size: Option<u32>,
}

impl FindOptions {
    /// Create new find options.
    pub fn builder() -> FindOptionsBuilder {
        FindOptionsBuilder::default()
    }
}

/// Builder for FindOptions.
#[derive(Debug, Clone, Default)]
pub struct FindOptionsBuilder {
    options: FindOptions,
}

impl FindOptionsBuilder {
    /// Set the limit. A negative limit returns a single batch.
    pub fn limit(mut self, limit: i64) -> Self {
        self.options.limit = Some(limit);
        self
    }

    /// Set the skip.
    pub fn skip(mut self, skip: u64) -> Self {
        self.options.skip = Some(skip);
        self
    }

    /// Set the sort order.
    pub fn sort(mut self, sort: Document) -> Self {
        self.options.sort = Some(sort);
        self
    }

    /// Set the projection.
    pub fn projection(mut self, projection: Document) -> Self {
        self.options.projection = Some(projection);
        self
    }

    /// Set the batch size.
    pub fn batch_size(mut self, batch_size: u32) -> Self {
        self.options.batch_size = Some(batch_size);
        self
    }

    /// Build the options.
    pub fn build(self) -> FindOptions {
        self.options
    }
}

/// Options for update operations.
#[derive(Debug, Clone, Default)]
pub struct UpdateOptions {
    /// Whether to insert if no documents match.
    pub upsert: Option<bool>,
    /// Collation used to match the filter.
    pub collation: Option<Document>,
}

impl UpdateOptions {
    /// Create a builder.
    pub fn builder() -> UpdateOptionsBuilder {
        UpdateOptionsBuilder::default()
    }
}

/// Builder for UpdateOptions.
#[derive(Debug, Clone, Default)]
pub struct UpdateOptionsBuilder {
    options: UpdateOptions,
}

impl UpdateOptionsBuilder {
    /// Set upsert option.
    pub fn upsert(mut self, upsert: bool) -> Self {
        self.options.upsert = Some(upsert);
        self
    }

    /// Set the collation.
    pub fn collation(mut self, collation: Document) -> Self {
        self.options.collation = Some(collation);
        self
    }

    /// Build the options.
    pub fn build(self) -> UpdateOptions {
        self.options
    }
}

/// A handle to a collection.
///
/// # Type Parameters
///
/// * `T` - The type of documents in this collection.
///
/// # Example
///
/// ```ignore
/// use mongo_bulkgrid::bson::doc;
/// use serde::{Serialize, Deserialize};
///
/// #[derive(Debug, Serialize, Deserialize)]
/// struct User {
///     name: String,
///     email: String,
/// }
///
/// let users = db.collection::<User>("users");
/// let user = User { name: "John".to_string(), email: "john@example.com".to_string() };
/// users.insert_one(user).await?;
/// ```
pub struct Collection<T> {
    /// Owning database.
    pub(crate) db: Database,
    /// Collection name.
    pub(crate) name: String,
    /// Type marker.
    _marker: PhantomData<T>,
}

impl<T> Collection<T> {
    /// Create a new collection handle.
    pub(crate) fn new(db: Database, name: String) -> Self {
        Self {
            db,
            name,
            _marker: PhantomData,
        }
    }

    /// Get the collection name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get the database name.
    pub fn database_name(&self) -> &str {
        self.db.name()
    }

    /// Get the owning database.
    pub fn database(&self) -> &Database {
        &self.db
    }

    /// Get the full namespace (db.collection).
    pub fn namespace(&self) -> String {
        format!("{}.{}", self.db.name(), self.name)
    }

    /// Clone this collection with a new type parameter.
    pub fn clone_with_type<U>(&self) -> Collection<U> {
        Collection {
            db: self.db.clone(),
            name: self.name.clone(),
            _marker: PhantomData,
        }
    }

    /// A sub-collection, e.g. `fs.files` for `fs`.
    pub fn child(&self, suffix: &str) -> Collection<Document> {
        Collection::new(self.db.clone(), format!("{}.{}", self.name, suffix))
    }

    /// Send one write command (`insert`, `update` or `delete`) carrying `entries`.
    pub(crate) async fn run_write(
        &self,
        kind: CommandKind,
        entries: Vec<Document>,
        ordered: bool,
    ) -> Result<Document> {
        let mut command = Document::new();
        command.insert(kind.command_name(), self.name.clone());
        command.insert(kind.entries_key(), entries);
        command.insert("ordered", ordered);
        let write_concern = self.db.write_concern();
        if !write_concern.is_empty() {
            command.insert("writeConcern", write_concern.to_document());
        }
        self.db.run_command(command).await
    }

    /// Run a single-entry write and turn reported errors into [`MongoError::Write`].
    async fn write_one(&self, kind: CommandKind, entry: Document) -> Result<Document> {
        let reply = self.run_write(kind, vec![entry], true).await?;
        if let Ok(errors) = reply.get_array("writeErrors") {
            if let Some(Bson::Document(error)) = errors.first() {
                return Err(MongoError::write(
                    numeric(error, "code").map(|c| c as i32),
                    error.get_str("errmsg").unwrap_or("write failed"),
                ));
            }
        }
        if let Ok(error) = reply.get_document("writeConcernError") {
            return Err(MongoError::write(
                numeric(error, "code").map(|c| c as i32),
                error.get_str("errmsg").unwrap_or("write concern failed"),
            ));
        }
        Ok(reply)
    }

    async fn update_with(
        &self,
        filter: Document,
        update: Document,
        multi: bool,
        options: UpdateOptions,
    ) -> Result<UpdateResult> {
        let mut entry = doc! {
            "q": filter,
            "u": update,
            "multi": multi,
            "upsert": options.upsert.unwrap_or(false),
        };
        if let Some(collation) = options.collation {
            entry.insert("collation", collation);
        }

        let reply = self.write_one(CommandKind::Update, entry).await?;
        let upserted_id = reply
            .get_array("upserted")
            .ok()
            .and_then(|ups| ups.first())
            .and_then(Bson::as_document)
            .and_then(|up| up.get("_id").cloned());
        let n = numeric(&reply, "n").unwrap_or(0);
        let matched = if upserted_id.is_some() { n - 1 } else { n };
        Ok(UpdateResult {
            matched_count: matched.max(0) as u64,
            modified_count: numeric(&reply, "nModified").unwrap_or(0).max(0) as u64,
            upserted_id,
        })
    }

    async fn delete_with(&self, filter: Document, limit: i32) -> Result<DeleteResult> {
        let reply = self
            .write_one(CommandKind::Delete, doc! { "q": filter, "limit": limit })
            .await?;
        Ok(DeleteResult {
            deleted_count: numeric(&reply, "n").unwrap_or(0).max(0) as u64,
        })
    }

    /// Start an ordered bulk operation.
    ///
    /// # Example
    ///
    /// ```ignore
    /// let mut bulk = collection.initialize_ordered_bulk_op();
    /// bulk.insert(doc! { "a": 1 })?;
    /// bulk.find(doc! { "a": 2 }).upsert().update_one(doc! { "$set": { "b": 2 } })?;
    /// let result = bulk.execute().await?;
    /// ```
    pub fn initialize_ordered_bulk_op(&self) -> BulkOperationBuilder {
        BulkOperationBuilder::new(self.clone_with_type(), true)
    }

    /// Start an unordered bulk operation.
    pub fn initialize_unordered_bulk_op(&self) -> BulkOperationBuilder {
        BulkOperationBuilder::new(self.clone_with_type(), false)
    }

    /// Execute a list of write operations as one bulk write.
    ///
    /// # Example
    ///
    /// ```ignore
    /// let result = collection
    ///     .bulk_write(
    ///         vec![
    ///             WriteOperation::insert_one(doc! { "x": 1 }),
    ///             WriteOperation::delete_many(doc! { "x": 2 }),
    ///         ],
    ///         true,
    ///     )
    ///     .await?;
    /// println!("inserted {}", result.inserted_count);
    /// ```
    pub async fn bulk_write(
        &self,
        operations: impl IntoIterator<Item = WriteOperation>,
        ordered: bool,
    ) -> Result<BulkWriteResult> {
        let mut executor = BulkExecutor::new(self.clone_with_type(), ordered);
        for operation in operations {
            executor.add(operation)?;
        }
        executor.execute().await.map(BulkWriteResult::from)
    }

    /// Update a single document.
    ///
    /// # Example
    ///
    /// ```ignore
    /// let result = collection.update_one(
    ///     doc! { "_id": id },
    ///     doc! { "$set": { "name": "Jane" } },
    /// ).await?;
    /// ```
    pub async fn update_one(&self, filter: Document, update: Document) -> Result<UpdateResult> {
        self.update_one_with_options(filter, update, None).await
    }

    /// Update a single document with options.
    pub async fn update_one_with_options(
        &self,
        filter: Document,
        update: Document,
        options: impl Into<Option<UpdateOptions>>,
    ) -> Result<UpdateResult> {
        check_update(&update)?;
        self.update_with(filter, update, false, options.into().unwrap_or_default())
            .await
    }

    /// Update multiple documents.
    ///
    /// # Example
    ///
    /// ```ignore
    /// let result = collection.update_many(
    ///     doc! { "status": "pending" },
    ///     doc! { "$set": { "status": "processed" } },
    /// ).await?;
    /// ```
    pub async fn update_many(&self, filter: Document, update: Document) -> Result<UpdateResult> {
        self.update_many_with_options(filter, update, None).await
    }

    /// Update multiple documents with options.
    pub async fn update_many_with_options(
        &self,
        filter: Document,
        update: Document,
        options: impl Into<Option<UpdateOptions>>,
    ) -> Result<UpdateResult> {
        check_update(&update)?;
        self.update_with(filter, update, true, options.into().unwrap_or_default())
            .await
    }

    /// Delete a single document.
    ///
    /// # Example
    ///
    /// ```ignore
    /// let result = collection.delete_one(doc! { "_id": id }).await?;
    /// ```
    pub async fn delete_one(&self, filter: Document) -> Result<DeleteResult> {
        self.delete_with(filter, 1).await
    }

    /// Delete multiple documents.
    ///
    /// # Example
    ///
    /// ```ignore
    /// let result = collection.delete_many(doc! { "status": "deleted" }).await?;
    /// ```
    pub async fn delete_many(&self, filter: Document) -> Result<DeleteResult> {
        self.delete_with(filter, 0).await
    }

    /// Count documents matching a filter.
    ///
    /// # Example
    ///
    /// ```ignore
    /// let count = collection.count_documents(doc! { "status": "active" }).await?;
    /// ```
    pub async fn count_documents(&self, filter: impl Into<Option<Document>>) -> Result<u64> {
        let reply = self
            .db
            .run_command(doc! {
                "count": self.name.clone(),
                "query": filter.into().unwrap_or_default(),
            })
            .await?;
        numeric(&reply, "n")
            .map(|n| n.max(0) as u64)
            .ok_or_else(|| MongoError::Deserialization("Expected count as number".to_string()))
    }

    /// Get distinct values for a field.
    pub async fn distinct(
        &self,
        field_name: &str,
        filter: impl Into<Option<Document>>,
    ) -> Result<Vec<Bson>> {
        let reply = self
            .db
            .run_command(doc! {
                "distinct": self.name.clone(),
                "key": field_name,
                "query": filter.into().unwrap_or_default(),
            })
            .await?;
        Ok(reply.get_array("values").cloned().unwrap_or_default())
    }

    /// Drop the collection. Dropping a missing collection succeeds.
    pub async fn drop(&self) -> Result<()> {
        match self.db.run_command(doc! { "drop": self.name.clone() }).await {
            Err(MongoError::Command { code, .. }) if code == NAMESPACE_NOT_FOUND_CODE => Ok(()),
            other => other.map(|_| ()),
        }
    }

    /// Create an index and return its name.
    ///
    /// `options` is merged into the index specification (`unique`, `name`, ...).
    pub async fn create_index(
        &self,
        keys: Document,
        options: impl Into<Option<Document>>,
    ) -> Result<String> {
        let mut spec = options.into().unwrap_or_default();
        let name = match spec.get_str("name") {
            Ok(name) => name.to_string(),
            Err(_) => index_name(&keys),
        };
        spec.insert("key", keys);
        spec.insert("name", name.clone());

        self.db
            .run_command(doc! {
                "createIndexes": self.name.clone(),
                "indexes": [spec],
            })
            .await?;
        Ok(name)
    }

    /// List all indexes. A collection that does not exist has none.
    pub async fn list_indexes(&self) -> Result<Vec<Document>> {
        let reply = match self
            .db
            .run_command(doc! { "listIndexes": self.name.clone() })
            .await
        {
            Err(MongoError::Command { code, .. }) if code == NAMESPACE_NOT_FOUND_CODE => {
                return Ok(Vec::new())
            }
            other => other?,
        };
        let cursor: Cursor<Document> = Cursor::from_reply(self.db.clone(), &reply)?;
        cursor.collect().await
    }
}

impl<T> Clone for Collection<T> {
    fn clone(&self) -> Self {
        self.clone_with_type()
    }
}

impl<T> std::fmt::Debug for Collection<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collection")
            .field("namespace", &self.namespace())
            .finish()
    }
}

impl<T: Serialize + DeserializeOwned + Send + Sync + Unpin + 'static> Collection<T> {
    /// Insert a single document. An `_id` is generated when absent.
    ///
    /// # Example
    ///
    /// ```ignore
    /// let result = collection.insert_one(doc! { "name": "John" }).await?;
    /// println!("Inserted ID: {:?}", result.inserted_id);
    /// ```
    pub async fn insert_one(&self, doc: impl Into<T>) -> Result<InsertOneResult> {
        let document = ensure_id(bson::to_document(&doc.into())?);
        check_insert_keys(&document)?;
        let inserted_id = document.get("_id").cloned().unwrap_or(Bson::Null);

        self.write_one(CommandKind::Insert, document).await?;
        Ok(InsertOneResult { inserted_id })
    }

    /// Insert multiple documents in order, batched like a bulk write.
    ///
    /// # Example
    ///
    /// ```ignore
    /// let docs = vec![
    ///     doc! { "name": "John" },
    ///     doc! { "name": "Jane" },
    /// ];
    /// let result = collection.insert_many(docs).await?;
    /// ```
    pub async fn insert_many(&self, docs: impl IntoIterator<Item = T>) -> Result<InsertManyResult> {
        let mut executor = BulkExecutor::new(self.clone_with_type(), true);
        let mut inserted_ids = HashMap::new();
        for (index, doc) in docs.into_iter().enumerate() {
            let document = ensure_id(bson::to_document(&doc)?);
            inserted_ids.insert(index, document.get("_id").cloned().unwrap_or(Bson::Null));
            executor.add(WriteOperation::insert_one(document))?;
        }
        if inserted_ids.is_empty() {
            return Err(MongoError::invalid_argument("documents must be a non-empty list"));
        }

        executor.execute().await?;
        Ok(InsertManyResult { inserted_ids })
    }

    /// Find documents matching a filter.
    ///
    /// # Example
    ///
    /// ```ignore
    /// let cursor = collection.find(doc! { "status": "active" }).await?;
    /// let docs: Vec<User> = cursor.collect().await?;
    /// ```
    pub async fn find(&self, filter: impl Into<Option<Document>>) -> Result<Cursor<T>> {
        self.find_with_options(filter, None).await
    }

    /// Find documents with options.
    pub async fn find_with_options(
        &self,
        filter: impl Into<Option<Document>>,
        options: impl Into<Option<FindOptions>>,
    ) -> Result<Cursor<T>> {
        let options = options.into().unwrap_or_default();
        let mut command = doc! {
            "find": self.name.clone(),
            "filter": filter.into().unwrap_or_default(),
        };
        if let Some(sort) = options.sort {
            command.insert("sort", sort);
        }
        if let Some(projection) = options.projection {
            command.insert("projection", projection);
        }
        if let Some(skip) = options.skip {
            command.insert("skip", skip as i64);
        }
        if let Some(limit) = options.limit {
            command.insert("limit", limit);
        }
        if let Some(batch_size) = options.batch_size {
            command.insert("batchSize", i64::from(batch_size));
        }

        let reply = self.db.run_command(command).await?;
        Ok(Cursor::from_reply(self.db.clone(), &reply)?.with_batch_size(options.batch_size))
    }

    /// Find a single document.
    ///
    /// # Example
    ///
    /// ```ignore
    /// let user = collection.find_one(doc! { "email": "john@example.com" }).await?;
    /// ```
    pub async fn find_one(&self, filter: impl Into<Option<Document>>) -> Result<Option<T>> {
        let options = FindOptions::builder().limit(-1).build();
        self.find_with_options(filter, options).await?.try_next().await
    }

    /// Replace a single document.
    pub async fn replace_one(&self, filter: Document, replacement: T) -> Result<UpdateResult> {
        self.replace_one_with_options(filter, replacement, None).await
    }

    /// Replace a single document with options.
    pub async fn replace_one_with_options(
        &self,
        filter: Document,
        replacement: T,
        options: impl Into<Option<UpdateOptions>>,
    ) -> Result<UpdateResult> {
        let replacement = bson::to_document(&replacement)?;
        check_replacement(&replacement)?;
        self.update_with(filter, replacement, false, options.into().unwrap_or_default())
            .await
    }
}

/// `{a: 1, b: -1}` becomes `a_1_b_-1`.
pub(crate) fn index_name(keys: &Document) -> String {
    keys.iter()
        .map(|(field, direction)| match direction {
            Bson::String(s) => format!("{}_{}", field, s),
            other => format!("{}_{}", field, other),
        })
        .collect::<Vec<_>>()
        .join("_")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{Client, ClientOptions};
    use crate::error::DUPLICATE_KEY_CODE;
    use crate::memory::MemoryServer;
    use std::sync::Arc;

    fn collection() -> Collection<Document> {
        Client::with_transport(Arc::new(MemoryServer::new()), ClientOptions::default())
            .database("test")
            .collection_with_doc("things")
    }

    #[test]
    fn test_find_options_builder() {
        let options = FindOptions::builder()
            .limit(10)
            .skip(5)
            .sort(doc! { "created": -1 })
            .projection(doc! { "name": 1, "email": 1 })
            .batch_size(100)
            .build();

        assert_eq!(options.limit, Some(10));
        assert_eq!(options.skip, Some(5));
        assert!(options.sort.is_some());
        assert!(options.projection.is_some());
        assert_eq!(options.batch_size, Some(100));
    }

    #[test]
    fn test_update_options_builder() {
        let options = UpdateOptions::builder()
            .upsert(true)
            .collation(doc! { "locale": "en" })
            .build();

        assert_eq!(options.upsert, Some(true));
        assert!(options.collation.is_some());
    }

    #[test]
    fn test_index_name() {
        assert_eq!(index_name(&doc! { "files_id": 1, "n": 1 }), "files_id_1_n_1");
        assert_eq!(index_name(&doc! { "a": -1 }), "a_-1");
        assert_eq!(index_name(&doc! { "t": "text" }), "t_text");
    }

    #[test]
    fn test_namespace_and_child() {
        let coll = collection();
        assert_eq!(coll.namespace(), "test.things");
        assert_eq!(coll.child("files").name(), "things.files");
    }

    #[tokio::test]
    async fn test_insert_one_generates_id() {
        let coll = collection();
        let result = coll.insert_one(doc! { "a": 1 }).await.unwrap();
        assert!(result.inserted_id.as_object_id().is_some());

        let found = coll.find_one(doc! { "a": 1 }).await.unwrap().unwrap();
        assert_eq!(found.get("_id"), Some(&result.inserted_id));
    }

    #[tokio::test]
    async fn test_insert_one_duplicate_key() {
        let coll = collection();
        coll.insert_one(doc! { "_id": 1 }).await.unwrap();
        let err = coll.insert_one(doc! { "_id": 1 }).await.unwrap_err();
        assert!(matches!(err, MongoError::Write { .. }));
        assert_eq!(err.code(), Some(DUPLICATE_KEY_CODE));
    }

    #[tokio::test]
    async fn test_insert_one_rejects_bad_keys() {
        let coll = collection();
        let err = coll.insert_one(doc! { "$bad": 1 }).await.unwrap_err();
        assert!(matches!(err, MongoError::InvalidDocument(_)));
        let err = coll.insert_one(doc! { "a.b": 1 }).await.unwrap_err();
        assert!(matches!(err, MongoError::InvalidDocument(_)));
    }

    #[tokio::test]
    async fn test_insert_many_and_count() {
        let coll = collection();
        let result = coll
            .insert_many(vec![doc! { "x": 1 }, doc! { "x": 2 }, doc! { "x": 2 }])
            .await
            .unwrap();
        assert_eq!(result.inserted_ids.len(), 3);
        assert_eq!(coll.count_documents(None).await.unwrap(), 3);
        assert_eq!(coll.count_documents(doc! { "x": 2 }).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_insert_many_empty() {
        let coll = collection();
        let err = coll.insert_many(Vec::<Document>::new()).await.unwrap_err();
        assert!(matches!(err, MongoError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn test_update_and_replace() {
        let coll = collection();
        coll.insert_many(vec![doc! { "x": 1 }, doc! { "x": 1 }]).await.unwrap();

        let result = coll
            .update_many(doc! { "x": 1 }, doc! { "$set": { "y": 2 } })
            .await
            .unwrap();
        assert_eq!(result.matched_count, 2);
        assert_eq!(result.modified_count, 2);

        let result = coll
            .update_one(doc! { "x": 1 }, doc! { "$set": { "y": 2 } })
            .await
            .unwrap();
        assert_eq!(result.matched_count, 1);
        assert_eq!(result.modified_count, 0);

        let result = coll
            .replace_one(doc! { "x": 1 }, doc! { "z": 3 })
            .await
            .unwrap();
        assert_eq!(result.modified_count, 1);
        assert_eq!(coll.count_documents(doc! { "z": 3 }).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_update_upsert() {
        let coll = collection();
        let options = UpdateOptions::builder().upsert(true).build();
        let result = coll
            .update_one_with_options(doc! { "k": "v" }, doc! { "$set": { "n": 1 } }, options)
            .await
            .unwrap();
        assert_eq!(result.matched_count, 0);
        assert!(result.upserted_id.is_some());
        assert_eq!(coll.count_documents(doc! { "k": "v", "n": 1 }).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_update_validation() {
        let coll = collection();
        let err = coll.update_one(doc! {}, doc! {}).await.unwrap_err();
        assert!(matches!(err, MongoError::InvalidArgument(_)));
        let err = coll.update_one(doc! {}, doc! { "a": 1 }).await.unwrap_err();
        assert!(matches!(err, MongoError::InvalidArgument(_)));
        let err = coll
            .replace_one(doc! {}, doc! { "$set": { "a": 1 } })
            .await
            .unwrap_err();
        assert!(matches!(err, MongoError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn test_delete() {
        let coll = collection();
        coll.insert_many(vec![doc! { "x": 1 }, doc! { "x": 1 }, doc! { "x": 2 }])
            .await
            .unwrap();
        assert_eq!(coll.delete_one(doc! { "x": 1 }).await.unwrap().deleted_count, 1);
        assert_eq!(coll.delete_many(doc! {}).await.unwrap().deleted_count, 2);
        assert_eq!(coll.count_documents(None).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_distinct() {
        let coll = collection();
        coll.insert_many(vec![
            doc! { "f": "a" },
            doc! { "f": "b" },
            doc! { "f": "a" },
            doc! { "g": 1 },
        ])
        .await
        .unwrap();
        let values = coll.distinct("f", None).await.unwrap();
        assert_eq!(values, vec![Bson::from("a"), Bson::from("b")]);
    }

    #[tokio::test]
    async fn test_indexes() {
        let coll = collection();
        assert!(coll.list_indexes().await.unwrap().is_empty());

        let name = coll
            .create_index(doc! { "a": 1 }, doc! { "unique": true })
            .await
            .unwrap();
        assert_eq!(name, "a_1");
        let indexes = coll.list_indexes().await.unwrap();
        assert_eq!(indexes.len(), 2);
        assert!(indexes.iter().any(|ix| ix.get_document("key").ok() == Some(&doc! { "a": 1 })));

        coll.insert_one(doc! { "a": 1 }).await.unwrap();
        let err = coll.insert_one(doc! { "a": 1 }).await.unwrap_err();
        assert_eq!(err.code(), Some(DUPLICATE_KEY_CODE));
    }

    #[tokio::test]
    async fn test_drop_is_idempotent() {
        let coll = collection();
        coll.insert_one(doc! { "a": 1 }).await.unwrap();
        coll.drop().await.unwrap();
        coll.drop().await.unwrap();
        assert_eq!(coll.count_documents(None).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_find_with_options() {
        let coll = collection();
        coll.insert_many((0..5).map(|i| doc! { "i": i })).await.unwrap();
        let options = FindOptions::builder()
            .sort(doc! { "i": -1 })
            .skip(1)
            .limit(2)
            .projection(doc! { "_id": 0 })
            .build();
        let docs = coll
            .find_with_options(None, options)
            .await
            .unwrap()
            .collect()
            .await
            .unwrap();
        assert_eq!(docs, vec![doc! { "i": 3 }, doc! { "i": 2 }]);
    }
}
