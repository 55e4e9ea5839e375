//! GridFS: files stored as a sequence of fixed-size chunk documents.
//!
//! A bucket named `fs` keeps one document per file in `fs.files` and the
//! file's bytes in `fs.chunks`, split into documents of `chunkSize` bytes
//! each. Files are written through a [`GridIn`] and read back through a
//! [`GridOut`]; the [`GridFS`] handle ties both to a database.
//!
//! # Example
//!
//! ```ignore
//! let fs = GridFS::new(&client.database("media"))?;
//!
//! let id = fs
//!     .put(b"hello world", FileOptions::builder().filename("greeting.txt").build())
//!     .await?;
//!
//! let mut file = fs.get(id.clone()).await?;
//! assert_eq!(file.read_to_end().await?, b"hello world");
//!
//! fs.delete(id).await?;
//! ```

pub mod grid_in;
pub mod grid_out;

pub use grid_in::{GridIn, GridInState};
pub use grid_out::GridOut;

use crate::collection::{Collection, FindOptions};
use crate::db::Database;
use crate::error::{MongoError, Result};
use crate::transport::numeric;
use bson::{doc, Bson, Document};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::AsyncRead;
use tracing::{debug, warn};

/// Bucket used when none is given.
pub const DEFAULT_BUCKET: &str = "fs";

/// Fields of the files document that are managed by the writer.
const RESERVED_FIELDS: &[&str] = &[
    "_id",
    "filename",
    "length",
    "chunkSize",
    "uploadDate",
    "md5",
    "contentType",
    "aliases",
    "encoding",
];

/// Data accepted by [`GridFS::put`] and [`GridIn::write`].
///
/// Text is only accepted when the file was created with an `encoding`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileData<'a> {
    /// Raw bytes, written as is.
    Bytes(&'a [u8]),
    /// Text, encoded with the file's encoding.
    Text(&'a str),
}

impl<'a> From<&'a [u8]> for FileData<'a> {
    fn from(bytes: &'a [u8]) -> Self {
        FileData::Bytes(bytes)
    }
}

impl<'a, const N: usize> From<&'a [u8; N]> for FileData<'a> {
    fn from(bytes: &'a [u8; N]) -> Self {
        FileData::Bytes(bytes)
    }
}

impl<'a> From<&'a Vec<u8>> for FileData<'a> {
    fn from(bytes: &'a Vec<u8>) -> Self {
        FileData::Bytes(bytes)
    }
}

impl<'a> From<&'a str> for FileData<'a> {
    fn from(text: &'a str) -> Self {
        FileData::Text(text)
    }
}

impl<'a> From<&'a String> for FileData<'a> {
    fn from(text: &'a String) -> Self {
        FileData::Text(text)
    }
}

/// Options for a new file.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FileOptions {
    /// `_id` of the file; an `ObjectId` is generated when absent.
    pub id: Option<Bson>,
    /// File name.
    pub filename: Option<String>,
    /// Chunk size in bytes; the database default when absent.
    pub chunk_size: Option<usize>,
    /// Encoding used for text writes (`utf-8`, `ascii`, `latin-1`).
    pub encoding: Option<String>,
    /// MIME type.
    pub content_type: Option<String>,
    /// Alternative names.
    pub aliases: Option<Vec<String>>,
    /// Additional fields stored in the files document, in order.
    pub extra: Document,
}

impl FileOptions {
    /// Create a builder.
    pub fn builder() -> FileOptionsBuilder {
        FileOptionsBuilder::default()
    }

    fn check(&self) -> Result<()> {
        if let Some(key) = self.extra.keys().find(|key| RESERVED_FIELDS.contains(&key.as_str())) {
            return Err(MongoError::invalid_argument(format!(
                "'{}' cannot be set as an extra file field",
                key
            )));
        }
        if self.chunk_size == Some(0) {
            return Err(MongoError::invalid_argument("chunk size must be positive"));
        }
        Ok(())
    }
}

/// Builder for FileOptions.
#[derive(Debug, Clone, Default)]
pub struct FileOptionsBuilder {
    options: FileOptions,
}

impl FileOptionsBuilder {
    /// Set the file `_id`.
    pub fn id(mut self, id: impl Into<Bson>) -> Self {
        self.options.id = Some(id.into());
        self
    }

    /// Set the file name.
    pub fn filename(mut self, filename: impl Into<String>) -> Self {
        self.options.filename = Some(filename.into());
        self
    }

    /// Set the chunk size.
    pub fn chunk_size(mut self, chunk_size: usize) -> Self {
        self.options.chunk_size = Some(chunk_size);
        self
    }

    /// Set the text encoding.
    pub fn encoding(mut self, encoding: impl Into<String>) -> Self {
        self.options.encoding = Some(encoding.into());
        self
    }

    /// Set the MIME type.
    pub fn content_type(mut self, content_type: impl Into<String>) -> Self {
        self.options.content_type = Some(content_type.into());
        self
    }

    /// Set alternative names.
    pub fn aliases(mut self, aliases: Vec<String>) -> Self {
        self.options.aliases = Some(aliases);
        self
    }

    /// Add a field to the files document.
    pub fn field(mut self, key: impl Into<String>, value: impl Into<Bson>) -> Self {
        self.options.extra.insert(key.into(), value.into());
        self
    }

    /// Build the options.
    pub fn build(self) -> FileOptions {
        self.options
    }
}

/// The two collections of a bucket, shared by its readers and writers.
#[derive(Debug, Clone)]
pub(crate) struct Bucket {
    pub(crate) files: Collection<Document>,
    pub(crate) chunks: Collection<Document>,
    indexes_ensured: Arc<AtomicBool>,
}

impl Bucket {
    fn new(db: &Database, name: &str) -> Self {
        let root = db.collection_with_doc(name);
        Self {
            files: root.child("files"),
            chunks: root.child("chunks"),
            indexes_ensured: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Create `{filename: 1, uploadDate: 1}` on files and a unique
    /// `{files_id: 1, n: 1}` on chunks unless they already exist.
    pub(crate) async fn ensure_indexes(&self) -> Result<()> {
        if self.indexes_ensured.load(Ordering::Acquire) {
            return Ok(());
        }

        let files_key = doc! { "filename": 1, "uploadDate": 1 };
        if !has_index(&self.files.list_indexes().await?, &files_key) {
            self.files.create_index(files_key, None).await?;
        }
        let chunks_key = doc! { "files_id": 1, "n": 1 };
        if !has_index(&self.chunks.list_indexes().await?, &chunks_key) {
            self.chunks
                .create_index(chunks_key, doc! { "unique": true })
                .await?;
        }

        debug!(ns = %self.files.namespace(), "gridfs indexes ensured");
        self.indexes_ensured.store(true, Ordering::Release);
        Ok(())
    }
}

fn has_index(indexes: &[Document], keys: &Document) -> bool {
    indexes.iter().any(|index| {
        let Ok(existing) = index.get_document("key") else {
            return false;
        };
        existing.len() == keys.len()
            && existing
                .keys()
                .zip(keys.keys())
                .all(|(a, b)| a == b && numeric(existing, a) == numeric(keys, b))
    })
}

/// A GridFS bucket in a database.
#[derive(Debug, Clone)]
pub struct GridFS {
    name: String,
    bucket: Bucket,
    default_chunk_size: usize,
}

impl GridFS {
    /// Open the default `fs` bucket.
    pub fn new(db: &Database) -> Result<Self> {
        Self::with_bucket(db, DEFAULT_BUCKET)
    }

    /// Open the bucket named `bucket`.
    ///
    /// Fails with a configuration error when the database does not use an
    /// acknowledged write concern, since chunk writes must be confirmed.
    pub fn with_bucket(db: &Database, bucket: &str) -> Result<Self> {
        if !db.write_concern().is_acknowledged() {
            return Err(MongoError::configuration(
                "database must use acknowledged write_concern",
            ));
        }
        Ok(Self {
            name: bucket.to_string(),
            bucket: Bucket::new(db, bucket),
            default_chunk_size: db.options().default_chunk_size,
        })
    }

    /// Bucket name.
    pub fn bucket_name(&self) -> &str {
        &self.name
    }

    /// The `<bucket>.files` collection.
    pub fn files(&self) -> &Collection<Document> {
        &self.bucket.files
    }

    /// The `<bucket>.chunks` collection.
    pub fn chunks(&self) -> &Collection<Document> {
        &self.bucket.chunks
    }

    /// Start writing a new file.
    pub fn new_file(&self, options: impl Into<Option<FileOptions>>) -> Result<GridIn> {
        GridIn::new(
            self.bucket.clone(),
            options.into().unwrap_or_default(),
            self.default_chunk_size,
        )
    }

    /// Store `data` as a new file and return its `_id`.
    ///
    /// Fails with [`MongoError::FileExists`] when the requested `_id` is
    /// taken; nothing written by this call is left behind.
    pub async fn put<'a>(
        &self,
        data: impl Into<FileData<'a>>,
        options: impl Into<Option<FileOptions>>,
    ) -> Result<Bson> {
        let mut file = self.new_file(options)?;
        let written = match file.write(data).await {
            Ok(()) => file.close().await,
            Err(err) => Err(err),
        };
        finish_upload(file, written).await
    }

    /// Store everything `reader` yields as a new file and return its `_id`.
    pub async fn put_from<R>(
        &self,
        reader: &mut R,
        options: impl Into<Option<FileOptions>>,
    ) -> Result<Bson>
    where
        R: AsyncRead + Unpin,
    {
        let mut file = self.new_file(options)?;
        let written = match file.write_all_from(reader).await {
            Ok(_) => file.close().await,
            Err(err) => Err(err),
        };
        finish_upload(file, written).await
    }

    /// Open the file with `_id` `id`.
    pub async fn get(&self, id: impl Into<Bson>) -> Result<GridOut> {
        GridOut::open(self.bucket.clone(), id.into()).await
    }

    /// Open one version of a file.
    ///
    /// Files are selected by `filename` (when given) and the fields of
    /// `filter`, ordered by upload date. Version `0` is the oldest, `1` the
    /// next; `-1` is the newest, `-2` the one before it.
    pub async fn get_version(
        &self,
        filename: Option<&str>,
        version: i32,
        filter: impl Into<Option<Document>>,
    ) -> Result<GridOut> {
        let mut query = filter.into().unwrap_or_default();
        if let Some(name) = filename {
            query.insert("filename", name);
        }

        let (skip, direction) = if version < 0 {
            (-i64::from(version) - 1, -1)
        } else {
            (i64::from(version), 1)
        };
        let options = FindOptions::builder()
            .sort(doc! { "uploadDate": direction, "_id": direction })
            .skip(skip as u64)
            .limit(-1)
            .build();

        let found = self
            .bucket
            .files
            .find_with_options(query, options)
            .await?
            .try_next()
            .await?;
        match found {
            Some(document) => GridOut::from_document(self.bucket.clone(), document),
            None => Err(MongoError::no_file(match filename {
                Some(name) => format!("no version {} for filename {:?}", version, name),
                None => format!("no version {} for the given filter", version),
            })),
        }
    }

    /// Open the newest version of a file.
    pub async fn get_last_version(
        &self,
        filename: Option<&str>,
        filter: impl Into<Option<Document>>,
    ) -> Result<GridOut> {
        self.get_version(filename, -1, filter).await
    }

    /// Delete a file and its chunks. Deleting a missing file succeeds.
    pub async fn delete(&self, id: impl Into<Bson>) -> Result<()> {
        let id = id.into();
        let files = self.bucket.files.delete_one(doc! { "_id": id.clone() }).await?;
        let chunks = self
            .bucket
            .chunks
            .delete_many(doc! { "files_id": id.clone() })
            .await?;
        debug!(
            id = %id,
            files = files.deleted_count,
            chunks = chunks.deleted_count,
            "deleted grid file"
        );
        Ok(())
    }

    /// Names of all stored files.
    pub async fn list(&self) -> Result<Vec<String>> {
        let names = self.bucket.files.distinct("filename", None).await?;
        Ok(names
            .into_iter()
            .filter_map(|name| match name {
                Bson::String(name) => Some(name),
                _ => None,
            })
            .collect())
    }

    /// Whether any file matches `filter`.
    pub async fn exists(&self, filter: impl Into<Option<Document>>) -> Result<bool> {
        Ok(self.bucket.files.find_one(filter).await?.is_some())
    }

    /// Whether a file with `_id` `id` exists.
    pub async fn exists_id(&self, id: impl Into<Bson>) -> Result<bool> {
        self.exists(doc! { "_id": id.into() }).await
    }

    /// Open every file matching `filter`.
    pub async fn find(
        &self,
        filter: impl Into<Option<Document>>,
        options: impl Into<Option<FindOptions>>,
    ) -> Result<Vec<GridOut>> {
        let documents = self
            .bucket
            .files
            .find_with_options(filter, options)
            .await?
            .collect()
            .await?;
        documents
            .into_iter()
            .map(|document| GridOut::from_document(self.bucket.clone(), document))
            .collect()
    }
}

/// Return the id of an uploaded file, or discard what a failed upload left behind.
async fn finish_upload(mut file: GridIn, written: Result<()>) -> Result<Bson> {
    let Err(err) = written else {
        return Ok(file.id().clone());
    };
    if !file.is_closed() {
        if let Err(cleanup) = file.abort().await {
            warn!(id = %file.id(), error = %cleanup, "failed to clean up partial grid file");
        }
    }
    Err(err)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{Client, ClientOptions, WriteConcern};
    use crate::memory::MemoryServer;

    fn database(options: ClientOptions) -> Database {
        Client::with_transport(Arc::new(MemoryServer::new()), options).database("test")
    }

    #[test]
    fn test_requires_acknowledged_writes() {
        let options = ClientOptions::builder()
            .write_concern(WriteConcern::unacknowledged())
            .build();
        let err = GridFS::new(&database(options)).unwrap_err();
        assert!(matches!(err, MongoError::Configuration(_)));
    }

    #[test]
    fn test_bucket_collections() {
        let fs = GridFS::with_bucket(&database(ClientOptions::default()), "media").unwrap();
        assert_eq!(fs.bucket_name(), "media");
        assert_eq!(fs.files().name(), "media.files");
        assert_eq!(fs.chunks().namespace(), "test.media.chunks");
    }

    #[test]
    fn test_reserved_extra_fields() {
        let options = FileOptions::builder().field("length", 3).build();
        assert!(matches!(options.check(), Err(MongoError::InvalidArgument(_))));

        let options = FileOptions::builder().field("author", "mike").build();
        assert!(options.check().is_ok());
    }

    #[test]
    fn test_file_data_conversions() {
        assert_eq!(FileData::from(b"abc"), FileData::Bytes(b"abc"));
        assert_eq!(FileData::from(&vec![1u8, 2]), FileData::Bytes(&[1, 2]));
        assert_eq!(FileData::from("abc"), FileData::Text("abc"));
    }

    #[test]
    fn test_has_index_compares_directions_numerically() {
        let indexes = vec![doc! {
            "key": { "files_id": 1i64, "n": 1.0 },
            "name": "files_id_1_n_1",
        }];
        assert!(has_index(&indexes, &doc! { "files_id": 1, "n": 1 }));
        assert!(!has_index(&indexes, &doc! { "files_id": 1 }));
        assert!(!has_index(&indexes, &doc! { "n": 1, "files_id": 1 }));
    }

    #[tokio::test]
    async fn test_indexes_created_once() {
        let server = Arc::new(MemoryServer::new());
        let db = Client::with_transport(server.clone(), ClientOptions::default()).database("test");
        let fs = GridFS::new(&db).unwrap();
        fs.put(b"a", None).await.unwrap();
        fs.put(b"b", None).await.unwrap();
        assert_eq!(server.command_count("createIndexes").await, 2);
    }
}
