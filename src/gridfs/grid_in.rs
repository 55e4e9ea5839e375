//! Writing files into a bucket.

use super::{Bucket, FileData, FileOptions};
use crate::error::{MongoError, Result, DUPLICATE_KEY_CODE};
use bson::oid::ObjectId;
use bson::spec::BinarySubtype;
use bson::{doc, Binary, Bson, DateTime, Document};
use std::borrow::Cow;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{debug, warn};

/// Lifecycle of a [`GridIn`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GridInState {
    /// Accepting data.
    Open,
    /// Closed or aborted; no further writes.
    Closed,
    /// A chunk could not be stored. Only [`GridIn::abort`] is accepted.
    Failed,
}

/// A file being written.
///
/// Data is buffered and stored one chunk at a time as soon as a full chunk
/// is available. The files document is only inserted by [`GridIn::close`],
/// so readers never see a partially written file.
pub struct GridIn {
    bucket: Bucket,
    file: Document,
    id: Bson,
    chunk_size: usize,
    encoding: Option<String>,
    buffer: Vec<u8>,
    length: u64,
    next_chunk: i32,
    written: Vec<ObjectId>,
    md5: md5::Context,
    state: GridInState,
}

impl GridIn {
    pub(crate) fn new(
        bucket: Bucket,
        options: FileOptions,
        default_chunk_size: usize,
    ) -> Result<Self> {
        options.check()?;
        let chunk_size = options.chunk_size.unwrap_or(default_chunk_size);
        if chunk_size == 0 {
            return Err(MongoError::invalid_argument("chunk size must be positive"));
        }
        let chunk_size_field = i32::try_from(chunk_size)
            .map_err(|_| MongoError::invalid_argument("chunk size does not fit in 32 bits"))?;

        let id = options.id.unwrap_or_else(|| Bson::ObjectId(ObjectId::new()));
        let mut file = doc! { "_id": id.clone() };
        if let Some(filename) = options.filename {
            file.insert("filename", filename);
        }
        if let Some(content_type) = options.content_type {
            file.insert("contentType", content_type);
        }
        if let Some(aliases) = options.aliases {
            file.insert("aliases", aliases);
        }
        if let Some(encoding) = &options.encoding {
            file.insert("encoding", encoding.clone());
        }
        file.insert("chunkSize", chunk_size_field);
        for (key, value) in options.extra {
            file.insert(key, value);
        }

        Ok(Self {
            bucket,
            file,
            id,
            chunk_size,
            encoding: options.encoding,
            buffer: Vec::new(),
            length: 0,
            next_chunk: 0,
            written: Vec::new(),
            md5: md5::Context::new(),
            state: GridInState::Open,
        })
    }

    /// `_id` of the file.
    pub fn id(&self) -> &Bson {
        &self.id
    }

    /// File name, if one was given.
    pub fn filename(&self) -> Option<&str> {
        self.file.get_str("filename").ok()
    }

    /// Chunk size in bytes.
    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Bytes written so far.
    pub fn length(&self) -> u64 {
        self.length
    }

    /// Current lifecycle state.
    pub fn state(&self) -> GridInState {
        self.state
    }

    /// Whether the file has been closed.
    pub fn is_closed(&self) -> bool {
        self.state == GridInState::Closed
    }

    /// Upload date, set by `close`.
    pub fn upload_date(&self) -> Option<DateTime> {
        self.file.get_datetime("uploadDate").ok().copied()
    }

    /// Hex MD5 digest of the contents, set by `close`.
    pub fn md5(&self) -> Option<&str> {
        self.file.get_str("md5").ok()
    }

    /// The files document as it is (or will be) stored.
    pub fn document(&self) -> &Document {
        &self.file
    }

    /// Append data to the file.
    ///
    /// Text is encoded with the file's `encoding`; writing text to a file
    /// without one is an error.
    pub async fn write<'a>(&mut self, data: impl Into<FileData<'a>>) -> Result<()> {
        self.check_open()?;
        let bytes = match data.into() {
            FileData::Bytes(bytes) => Cow::Borrowed(bytes),
            FileData::Text(text) => Cow::Owned(encode_text(text, self.encoding.as_deref())?),
        };
        self.write_bytes(&bytes).await
    }

    /// Append everything `reader` yields. Returns the number of bytes read.
    pub async fn write_all_from<R>(&mut self, reader: &mut R) -> Result<u64>
    where
        R: AsyncRead + Unpin,
    {
        self.check_open()?;
        let mut buf = vec![0u8; self.chunk_size.min(1024 * 1024)];
        let mut total = 0u64;
        loop {
            let n = reader.read(&mut buf).await?;
            if n == 0 {
                return Ok(total);
            }
            self.write_bytes(&buf[..n]).await?;
            total += n as u64;
        }
    }

    async fn write_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        self.md5.consume(bytes);
        self.length += bytes.len() as u64;
        self.buffer.extend_from_slice(bytes);
        while self.buffer.len() >= self.chunk_size {
            let chunk: Vec<u8> = self.buffer.drain(..self.chunk_size).collect();
            self.flush_chunk(chunk).await?;
        }
        Ok(())
    }

    async fn flush_chunk(&mut self, data: Vec<u8>) -> Result<()> {
        self.bucket.ensure_indexes().await?;

        let chunk_id = ObjectId::new();
        let chunk = doc! {
            "_id": chunk_id,
            "files_id": self.id.clone(),
            "n": self.next_chunk,
            "data": Binary { subtype: BinarySubtype::Generic, bytes: data },
        };
        let inserted = self.bucket.chunks.insert_one(chunk).await;
        match inserted {
            Ok(_) => {
                self.written.push(chunk_id);
                self.next_chunk += 1;
                Ok(())
            }
            Err(MongoError::Write { code: Some(DUPLICATE_KEY_CODE), .. }) => {
                Err(self.file_exists().await)
            }
            Err(err) => {
                self.state = GridInState::Failed;
                warn!(id = %self.id, n = self.next_chunk, error = %err, "failed to store chunk");
                Err(err)
            }
        }
    }

    /// Flush buffered data and store the files document.
    ///
    /// Fails with [`MongoError::FileExists`] when a file with the same `_id`
    /// is already stored; the chunks written by this writer are removed first.
    pub async fn close(&mut self) -> Result<()> {
        self.check_open()?;
        self.state = GridInState::Closed;

        if !self.buffer.is_empty() {
            let tail = std::mem::take(&mut self.buffer);
            self.flush_chunk(tail).await?;
        }
        self.bucket.ensure_indexes().await?;

        let digest = std::mem::replace(&mut self.md5, md5::Context::new()).compute();
        self.file.insert("length", self.length as i64);
        self.file.insert("uploadDate", DateTime::now());
        self.file.insert("md5", format!("{:x}", digest));

        let inserted = self.bucket.files.insert_one(self.file.clone()).await;
        match inserted {
            Ok(_) => {
                debug!(
                    id = %self.id,
                    length = self.length,
                    chunks = self.written.len(),
                    "closed grid file"
                );
                Ok(())
            }
            Err(MongoError::Write { code: Some(DUPLICATE_KEY_CODE), .. }) => {
                Err(self.file_exists().await)
            }
            Err(err) => {
                self.state = GridInState::Failed;
                Err(err)
            }
        }
    }

    /// Discard the file: delete the chunks written so far and close
    /// without storing a files document.
    pub async fn abort(&mut self) -> Result<()> {
        if self.state == GridInState::Closed {
            return Err(MongoError::invalid_operation("cannot abort a closed file"));
        }
        self.state = GridInState::Closed;
        self.buffer.clear();
        self.remove_written().await
    }

    async fn file_exists(&mut self) -> MongoError {
        self.state = GridInState::Closed;
        warn!(
            id = %self.id,
            chunks = self.written.len(),
            "file id already exists, removing written chunks"
        );
        if let Err(err) = self.remove_written().await {
            warn!(id = %self.id, error = %err, "failed to remove written chunks");
        }
        MongoError::FileExists(self.id.clone())
    }

    async fn remove_written(&mut self) -> Result<()> {
        if self.written.is_empty() {
            return Ok(());
        }
        let ids: Vec<Bson> = self.written.drain(..).map(Bson::ObjectId).collect();
        self.bucket
            .chunks
            .delete_many(doc! { "_id": { "$in": ids } })
            .await?;
        Ok(())
    }

    fn check_open(&self) -> Result<()> {
        match self.state {
            GridInState::Open => Ok(()),
            GridInState::Closed => {
                Err(MongoError::invalid_operation("cannot write to a closed file"))
            }
            GridInState::Failed => Err(MongoError::invalid_operation(
                "a chunk of this file could not be stored; abort it",
            )),
        }
    }
}

impl std::fmt::Debug for GridIn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GridIn")
            .field("id", &self.id)
            .field("chunk_size", &self.chunk_size)
            .field("length", &self.length)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

fn encode_text(text: &str, encoding: Option<&str>) -> Result<Vec<u8>> {
    let encoding = encoding.ok_or_else(|| {
        MongoError::invalid_argument("must specify an encoding for file in order to write text")
    })?;
    let unrepresentable =
        || MongoError::invalid_argument(format!("text cannot be encoded as {}", encoding));

    match encoding.to_ascii_lowercase().replace('_', "-").as_str() {
        "utf-8" | "utf8" => Ok(text.as_bytes().to_vec()),
        "ascii" | "us-ascii" => {
            if text.is_ascii() {
                Ok(text.as_bytes().to_vec())
            } else {
                Err(unrepresentable())
            }
        }
        "latin-1" | "latin1" | "iso-8859-1" => text
            .chars()
            .map(|c| u8::try_from(c).map_err(|_| unrepresentable()))
            .collect(),
        _ => Err(MongoError::invalid_argument(format!(
            "unsupported encoding '{}'",
            encoding
        ))),
    }
}
