//! Reading files back out of a bucket.

use super::Bucket;
use crate::collection::{Collection, FindOptions};
use crate::cursor::Cursor;
use crate::error::{MongoError, Result};
use crate::transport::numeric;
use bson::{doc, Bson, DateTime, Document};
use futures::stream::{self, Stream};
use std::io::SeekFrom;
use tracing::warn;

/// Where each chunk of a file is expected to be.
#[derive(Debug, Clone, Copy)]
struct ChunkLayout {
    length: Option<u64>,
    chunk_size: u64,
}

impl ChunkLayout {
    fn count(&self) -> Option<i64> {
        self.length
            .map(|length| ((length + self.chunk_size - 1) / self.chunk_size) as i64)
    }

    fn expected_len(&self, n: i64) -> Option<usize> {
        let (length, count) = (self.length?, self.count()?);
        if n == count - 1 {
            Some((length - (n as u64) * self.chunk_size) as usize)
        } else {
            Some(self.chunk_size as usize)
        }
    }

    /// Check that `chunk` is chunk number `n` with the right size and take its bytes.
    fn extract(&self, id: &Bson, chunk: &Document, n: i64) -> Result<Vec<u8>> {
        if let Some(count) = self.count() {
            if n >= count {
                return Err(corrupt(id, format!("extra chunk found: expected {} chunks", count)));
            }
        }
        if numeric(chunk, "n") != Some(n) {
            return Err(corrupt(id, format!("no chunk #{}", n)));
        }
        let data = match chunk.get("data") {
            Some(Bson::Binary(binary)) => binary.bytes.clone(),
            _ => return Err(corrupt(id, format!("chunk #{} has no binary data", n))),
        };
        if let Some(expected) = self.expected_len(n) {
            if data.len() != expected {
                return Err(corrupt(
                    id,
                    format!(
                        "truncated chunk #{}: expected {} bytes but found {}",
                        n,
                        expected,
                        data.len()
                    ),
                ));
            }
        }
        Ok(data)
    }

    fn check_complete(&self, id: &Bson, seen: i64) -> Result<()> {
        match self.count() {
            Some(count) if seen < count => Err(corrupt(id, format!("no chunk #{}", seen))),
            _ => Ok(()),
        }
    }
}

fn corrupt(id: &Bson, message: String) -> MongoError {
    warn!(id = %id, "{}", message);
    MongoError::corrupt(message)
}

/// A stored file opened for reading.
///
/// Reads are sequential by default; [`GridOut::seek`] moves the position.
/// Every chunk is checked against the file's `length` and `chunkSize` as it
/// is fetched, and a full sequential read is checked against the stored
/// MD5 digest.
pub struct GridOut {
    bucket: Bucket,
    file: Document,
    id: Bson,
    layout: ChunkLayout,
    position: u64,
    chunk: Vec<u8>,
    offset: usize,
    next_chunk: i64,
    skip: usize,
    md5: Option<md5::Context>,
}

impl GridOut {
    /// Open the file with `_id` `id`.
    pub(crate) async fn open(bucket: Bucket, id: Bson) -> Result<Self> {
        let file = bucket
            .files
            .find_one(doc! { "_id": id.clone() })
            .await?
            .ok_or_else(|| {
                MongoError::no_file(format!(
                    "no file in gridfs collection {} with _id {}",
                    bucket.files.namespace(),
                    id
                ))
            })?;
        Self::from_document(bucket, file)
    }

    /// Wrap a files document that was already fetched.
    pub(crate) fn from_document(bucket: Bucket, file: Document) -> Result<Self> {
        let id = file.get("_id").cloned().unwrap_or(Bson::Null);
        let chunk_size = match numeric(&file, "chunkSize") {
            Some(size) if size > 0 => size as u64,
            _ => return Err(corrupt(&id, "file document has no valid chunkSize".to_string())),
        };
        let length = match numeric(&file, "length") {
            Some(length) if length >= 0 => Some(length as u64),
            Some(_) => return Err(corrupt(&id, "file document has a negative length".to_string())),
            None => None,
        };

        Ok(Self {
            bucket,
            file,
            id,
            layout: ChunkLayout { length, chunk_size },
            position: 0,
            chunk: Vec::new(),
            offset: 0,
            next_chunk: 0,
            skip: 0,
            md5: Some(md5::Context::new()),
        })
    }

    /// `_id` of the file.
    pub fn id(&self) -> &Bson {
        &self.id
    }

    /// File name.
    pub fn filename(&self) -> Option<&str> {
        self.file.get_str("filename").ok()
    }

    /// Length in bytes, when recorded.
    pub fn length(&self) -> Option<u64> {
        self.layout.length
    }

    /// Chunk size in bytes.
    pub fn chunk_size(&self) -> u64 {
        self.layout.chunk_size
    }

    /// When the file was stored.
    pub fn upload_date(&self) -> Option<DateTime> {
        self.file.get_datetime("uploadDate").ok().copied()
    }

    /// Stored hex MD5 digest.
    pub fn md5(&self) -> Option<&str> {
        self.file.get_str("md5").ok()
    }

    /// MIME type.
    pub fn content_type(&self) -> Option<&str> {
        self.file.get_str("contentType").ok()
    }

    /// Alternative names.
    pub fn aliases(&self) -> Vec<&str> {
        self.file
            .get_array("aliases")
            .map(|aliases| aliases.iter().filter_map(Bson::as_str).collect())
            .unwrap_or_default()
    }

    /// The raw files document, including user fields.
    pub fn metadata(&self) -> &Document {
        &self.file
    }

    /// Current position.
    pub fn tell(&self) -> u64 {
        self.position
    }

    /// Move the position. Returns the new position.
    ///
    /// Seeking past the end is allowed; reads there return no data.
    pub fn seek(&mut self, pos: SeekFrom) -> Result<u64> {
        let target = match pos {
            SeekFrom::Start(offset) => i128::from(offset),
            SeekFrom::Current(delta) => i128::from(self.position) + i128::from(delta),
            SeekFrom::End(delta) => {
                let length = self.layout.length.ok_or_else(|| {
                    MongoError::invalid_argument(
                        "cannot seek from the end of a file without a length",
                    )
                })?;
                i128::from(length) + i128::from(delta)
            }
        };
        if target < 0 {
            return Err(MongoError::invalid_argument("cannot seek to a negative position"));
        }
        let target = target as u64;
        if target == self.position {
            return Ok(target);
        }

        self.position = target;
        self.chunk.clear();
        self.offset = 0;
        self.next_chunk = (target / self.layout.chunk_size) as i64;
        self.skip = (target % self.layout.chunk_size) as usize;
        self.md5 = if target == 0 { Some(md5::Context::new()) } else { None };
        Ok(target)
    }

    /// Read up to `size` bytes, or everything that is left when `size` is `None`.
    pub async fn read(&mut self, size: Option<usize>) -> Result<Vec<u8>> {
        let remaining = match self.layout.length {
            Some(length) => length.saturating_sub(self.position) as usize,
            None => usize::MAX,
        };
        let wanted = size.map_or(remaining, |size| size.min(remaining));

        let mut out = Vec::new();
        while out.len() < wanted {
            if !self.fill().await? {
                break;
            }
            let available = &self.chunk[self.offset..];
            let take = available.len().min(wanted - out.len());
            out.extend_from_slice(&available[..take]);
            self.offset += take;
            self.position += take as u64;
        }

        if self.layout.length.is_some() && out.len() < wanted {
            return Err(corrupt(
                &self.id,
                format!("expected {} more bytes but the chunks ended", wanted - out.len()),
            ));
        }
        Ok(out)
    }

    /// Read everything from the current position to the end.
    pub async fn read_to_end(&mut self) -> Result<Vec<u8>> {
        self.read(None).await
    }

    /// Read up to and including the next `\n`, stopping early after `limit`
    /// bytes or at the end of the file.
    pub async fn readline(&mut self, limit: Option<usize>) -> Result<Vec<u8>> {
        let limit = limit.unwrap_or(usize::MAX);
        let mut out = Vec::new();
        while out.len() < limit {
            if !self.fill().await? {
                break;
            }
            let available = &self.chunk[self.offset..];
            let window = available.len().min(limit - out.len());
            let take = match available[..window].iter().position(|b| *b == b'\n') {
                Some(newline) => newline + 1,
                None => window,
            };
            out.extend_from_slice(&available[..take]);
            self.offset += take;
            self.position += take as u64;
            if out.last() == Some(&b'\n') {
                break;
            }
        }
        Ok(out)
    }

    /// Read the rest of the current chunk, or the next chunk when the
    /// current one is used up. Empty at the end of the file.
    pub async fn readchunk(&mut self) -> Result<Vec<u8>> {
        if !self.fill().await? {
            return Ok(Vec::new());
        }
        let out = self.chunk[self.offset..].to_vec();
        self.offset = self.chunk.len();
        self.position += out.len() as u64;
        Ok(out)
    }

    /// Stream the file's chunks in order, from the first.
    ///
    /// The stream is independent of the read position and fails with
    /// [`MongoError::CorruptGridFile`] on a missing, misplaced, wrongly
    /// sized or extra chunk, and after the last chunk when the data does not
    /// match the stored MD5.
    pub fn chunks(&self) -> impl Stream<Item = Result<Vec<u8>>> {
        let chunks = self.bucket.chunks.clone();
        let id = self.id.clone();
        let expected_md5 = self.md5().map(str::to_string);
        let layout = self.layout;

        stream::try_unfold((None, 0i64, md5::Context::new()), move |state| {
            next_stored_chunk(chunks.clone(), id.clone(), expected_md5.clone(), layout, state)
        })
    }

    /// Make sure unread bytes of the current chunk are available.
    /// Returns `false` at the end of the file.
    async fn fill(&mut self) -> Result<bool> {
        while self.offset >= self.chunk.len() {
            if let Some(length) = self.layout.length {
                if self.position >= length {
                    return Ok(false);
                }
            }
            match self.fetch_chunk().await? {
                Some(data) => {
                    self.offset = std::mem::take(&mut self.skip);
                    self.chunk = data;
                }
                None => return Ok(false),
            }
        }
        Ok(true)
    }

    async fn fetch_chunk(&mut self) -> Result<Option<Vec<u8>>> {
        let n = self.next_chunk;
        if let Some(count) = self.layout.count() {
            if n >= count {
                return Ok(None);
            }
        }

        let chunk = self
            .bucket
            .chunks
            .find_one(doc! { "files_id": self.id.clone(), "n": n })
            .await?;
        let data = match chunk {
            Some(chunk) => self.layout.extract(&self.id, &chunk, n)?,
            None if self.layout.length.is_some() => {
                return Err(corrupt(&self.id, format!("no chunk #{}", n)));
            }
            None => {
                self.verify_md5()?;
                return Ok(None);
            }
        };
        self.next_chunk += 1;

        if let Some(md5) = self.md5.as_mut() {
            md5.consume(&data);
        }
        if self.layout.count() == Some(self.next_chunk) {
            self.verify_md5()?;
        }
        Ok(Some(data))
    }

    fn verify_md5(&mut self) -> Result<()> {
        match (self.md5.take(), self.file.get_str("md5")) {
            (Some(context), Ok(expected)) => check_md5(&self.id, context, expected),
            _ => Ok(()),
        }
    }
}

/// Compare the digest of everything read with the stored one.
fn check_md5(id: &Bson, context: md5::Context, expected: &str) -> Result<()> {
    let actual = format!("{:x}", context.compute());
    if !actual.eq_ignore_ascii_case(expected) {
        return Err(corrupt(
            id,
            format!("md5 mismatch: stored {} but read {}", expected, actual),
        ));
    }
    Ok(())
}

/// Open cursor, next chunk number and digest of the chunks seen so far.
type ChunkCursorState = (Option<Cursor<Document>>, i64, md5::Context);

async fn next_stored_chunk(
    chunks: Collection<Document>,
    id: Bson,
    expected_md5: Option<String>,
    layout: ChunkLayout,
    (cursor, n, mut digest): ChunkCursorState,
) -> Result<Option<(Vec<u8>, ChunkCursorState)>> {
    let mut cursor = match cursor {
        Some(cursor) => cursor,
        None => {
            let options = FindOptions::builder().sort(doc! { "n": 1 }).build();
            chunks
                .find_with_options(doc! { "files_id": id.clone() }, options)
                .await?
        }
    };
    match cursor.try_next().await? {
        Some(chunk) => {
            let data = layout.extract(&id, &chunk, n)?;
            digest.consume(&data);
            Ok(Some((data, (Some(cursor), n + 1, digest))))
        }
        None => {
            layout.check_complete(&id, n)?;
            if let Some(expected) = expected_md5 {
                check_md5(&id, digest, &expected)?;
            }
            Ok(None)
        }
    }
}

impl std::fmt::Debug for GridOut {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GridOut")
            .field("id", &self.id)
            .field("length", &self.layout.length)
            .field("chunk_size", &self.layout.chunk_size)
            .field("position", &self.position)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{Client, ClientOptions};
    use crate::gridfs::{FileOptions, GridFS};
    use crate::memory::MemoryServer;
    use futures::TryStreamExt;
    use std::sync::Arc;

    fn gridfs() -> GridFS {
        let db = Client::with_transport(Arc::new(MemoryServer::new()), ClientOptions::default())
            .database("test");
        GridFS::new(&db).unwrap()
    }

    async fn put(fs: &GridFS, data: &[u8], chunk_size: usize) -> Bson {
        fs.put(data, FileOptions::builder().chunk_size(chunk_size).build())
            .await
            .unwrap()
    }

    #[test]
    fn test_chunk_layout() {
        let layout = ChunkLayout { length: Some(10), chunk_size: 4 };
        assert_eq!(layout.count(), Some(3));
        assert_eq!(layout.expected_len(0), Some(4));
        assert_eq!(layout.expected_len(2), Some(2));

        let empty = ChunkLayout { length: Some(0), chunk_size: 4 };
        assert_eq!(empty.count(), Some(0));

        let unknown = ChunkLayout { length: None, chunk_size: 4 };
        assert_eq!(unknown.expected_len(0), None);
    }

    #[tokio::test]
    async fn test_partial_reads() {
        let fs = gridfs();
        let id = put(&fs, b"hello world", 3).await;
        let mut file = fs.get(id).await.unwrap();

        assert_eq!(file.read(Some(4)).await.unwrap(), b"hell");
        assert_eq!(file.tell(), 4);
        assert_eq!(file.read(Some(100)).await.unwrap(), b"o world");
        assert_eq!(file.read(None).await.unwrap(), b"");
    }

    #[tokio::test]
    async fn test_seek_and_tell() {
        let fs = gridfs();
        let id = put(&fs, b"0123456789", 4).await;
        let mut file = fs.get(id).await.unwrap();

        assert_eq!(file.seek(SeekFrom::Start(6)).unwrap(), 6);
        assert_eq!(file.read(Some(2)).await.unwrap(), b"67");
        assert_eq!(file.seek(SeekFrom::Current(-5)).unwrap(), 3);
        assert_eq!(file.read(None).await.unwrap(), b"3456789");
        assert_eq!(file.seek(SeekFrom::End(-1)).unwrap(), 9);
        assert_eq!(file.read(None).await.unwrap(), b"9");
        assert!(matches!(
            file.seek(SeekFrom::Current(-20)),
            Err(MongoError::InvalidArgument(_))
        ));
        file.seek(SeekFrom::Start(50)).unwrap();
        assert_eq!(file.read(None).await.unwrap(), b"");
    }

    #[tokio::test]
    async fn test_readline() {
        let fs = gridfs();
        let id = put(&fs, b"first\nsecond line\nlast", 4).await;
        let mut file = fs.get(id).await.unwrap();

        assert_eq!(file.readline(None).await.unwrap(), b"first\n");
        assert_eq!(file.readline(Some(3)).await.unwrap(), b"sec");
        assert_eq!(file.readline(None).await.unwrap(), b"ond line\n");
        assert_eq!(file.readline(None).await.unwrap(), b"last");
        assert_eq!(file.readline(None).await.unwrap(), b"");
    }

    #[tokio::test]
    async fn test_readchunk() {
        let fs = gridfs();
        let id = put(&fs, b"abcdefghij", 4).await;
        let mut file = fs.get(id).await.unwrap();

        assert_eq!(file.read(Some(1)).await.unwrap(), b"a");
        assert_eq!(file.readchunk().await.unwrap(), b"bcd");
        assert_eq!(file.readchunk().await.unwrap(), b"efgh");
        assert_eq!(file.readchunk().await.unwrap(), b"ij");
        assert_eq!(file.readchunk().await.unwrap(), b"");
    }

    #[tokio::test]
    async fn test_chunks_stream() {
        let fs = gridfs();
        let id = put(&fs, b"abcdefghij", 4).await;
        let file = fs.get(id).await.unwrap();

        let chunks: Vec<Vec<u8>> = file.chunks().try_collect().await.unwrap();
        assert_eq!(chunks, vec![b"abcd".to_vec(), b"efgh".to_vec(), b"ij".to_vec()]);
    }

    #[tokio::test]
    async fn test_extra_chunk_detected_by_stream() {
        let fs = gridfs();
        let id = put(&fs, b"abcd", 4).await;
        let extra = bson::Binary {
            subtype: bson::spec::BinarySubtype::Generic,
            bytes: b"x".to_vec(),
        };
        fs.chunks()
            .insert_one(doc! { "files_id": id.clone(), "n": 1, "data": extra })
            .await
            .unwrap();
        let file = fs.get(id).await.unwrap();

        let err = file.chunks().try_collect::<Vec<_>>().await.unwrap_err();
        assert!(err.is_corrupt());
    }

    #[tokio::test]
    async fn test_md5_mismatch() {
        let fs = gridfs();
        let id = put(&fs, b"abcdef", 3).await;
        fs.files()
            .update_one(doc! { "_id": id.clone() }, doc! { "$set": { "md5": "0".repeat(32) } })
            .await
            .unwrap();

        let mut file = fs.get(id.clone()).await.unwrap();
        assert!(file.read_to_end().await.unwrap_err().is_corrupt());

        let mut file = fs.get(id).await.unwrap();
        file.seek(SeekFrom::Start(3)).unwrap();
        assert_eq!(file.read_to_end().await.unwrap(), b"def");
    }

    #[tokio::test]
    async fn test_chunk_stream_checks_md5() {
        let fs = gridfs();
        let id = put(&fs, b"foobar", 4).await;
        let tampered = bson::Binary {
            subtype: bson::spec::BinarySubtype::Generic,
            bytes: b"FOOB".to_vec(),
        };
        fs.chunks()
            .update_one(
                doc! { "files_id": id.clone(), "n": 0 },
                doc! { "$set": { "data": tampered } },
            )
            .await
            .unwrap();

        let file = fs.get(id.clone()).await.unwrap();
        let err = file.chunks().try_collect::<Vec<_>>().await.unwrap_err();
        assert!(matches!(err, MongoError::CorruptGridFile(ref msg) if msg.contains("md5")));

        let mut file = fs.get(id).await.unwrap();
        assert!(file.read_to_end().await.unwrap_err().is_corrupt());
    }

    #[tokio::test]
    async fn test_missing_chunk() {
        let fs = gridfs();
        let id = put(&fs, b"abcdef", 2).await;
        fs.chunks()
            .delete_one(doc! { "files_id": id.clone(), "n": 1 })
            .await
            .unwrap();

        let mut file = fs.get(id).await.unwrap();
        assert_eq!(file.read(Some(2)).await.unwrap(), b"ab");
        assert!(file.read(Some(2)).await.unwrap_err().is_corrupt());
    }

    #[tokio::test]
    async fn test_unknown_length_reads_until_chunks_end() {
        let fs = gridfs();
        let id = put(&fs, b"abcdefg", 3).await;
        fs.files()
            .update_one(doc! { "_id": id.clone() }, doc! { "$unset": { "length": "" } })
            .await
            .unwrap();

        let mut file = fs.get(id).await.unwrap();
        assert_eq!(file.length(), None);
        assert_eq!(file.read_to_end().await.unwrap(), b"abcdefg");
    }

    #[tokio::test]
    async fn test_metadata_accessors() {
        let fs = gridfs();
        let options = FileOptions::builder()
            .filename("a.txt")
            .content_type("text/plain")
            .aliases(vec!["b.txt".to_string()])
            .field("author", "mike")
            .build();
        let id = fs.put(b"x", options).await.unwrap();
        let file = fs.get(id).await.unwrap();

        assert_eq!(file.filename(), Some("a.txt"));
        assert_eq!(file.content_type(), Some("text/plain"));
        assert_eq!(file.aliases(), vec!["b.txt"]);
        assert_eq!(file.metadata().get_str("author").unwrap(), "mike");
        assert_eq!(file.length(), Some(1));
        assert!(file.upload_date().is_some());
    }
}
