//! Integration tests for GridFS.

use bson::{doc, Bson, Document};
use futures::TryStreamExt;
use mongo_bulkgrid::{
    client::DEFAULT_CHUNK_SIZE, error::MongoError, gridfs::FileOptions, Client, ClientOptions,
    Database, GridFS, MemoryServer,
};
use pretty_assertions::assert_eq;
use rand::{Rng, RngCore};
use std::io::SeekFrom;
use std::sync::Arc;
use std::time::Duration;

// ============================================================================
// Helpers
// ============================================================================

fn database() -> Database {
    Client::with_transport(Arc::new(MemoryServer::new()), ClientOptions::default())
        .database("gridfs_test")
}

fn setup() -> (Database, GridFS) {
    let db = database();
    let fs = GridFS::new(&db).unwrap();
    (db, fs)
}

async fn count(db: &Database, name: &str) -> u64 {
    db.collection_with_doc(name).count_documents(None).await.unwrap()
}

fn named(filename: &str) -> FileOptions {
    FileOptions::builder().filename(filename).build()
}

// Upload dates have millisecond precision.
async fn tick() {
    tokio::time::sleep(Duration::from_millis(2)).await;
}

// ============================================================================
// Basic Tests
// ============================================================================

mod basic_tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_basic() {
        let (db, fs) = setup();
        let id = fs.put(b"hello world", None).await.unwrap();
        assert_eq!(fs.get(id.clone()).await.unwrap().read_to_end().await.unwrap(), b"hello world");
        assert_eq!(count(&db, "fs.files").await, 1);
        assert_eq!(count(&db, "fs.chunks").await, 1);

        fs.delete(id.clone()).await.unwrap();
        assert!(matches!(fs.get(id).await, Err(MongoError::NoFile(_))));
        assert_eq!(count(&db, "fs.files").await, 0);
        assert_eq!(count(&db, "fs.chunks").await, 0);

        let id = fs
            .put(b"hello world", FileOptions::builder().id("foo").build())
            .await
            .unwrap();
        assert_eq!(id, Bson::String("foo".to_string()));
        assert_eq!(fs.get("foo").await.unwrap().read_to_end().await.unwrap(), b"hello world");
    }

    #[tokio::test]
    async fn test_multi_chunk_delete() {
        let (db, fs) = setup();
        let id = fs
            .put(b"hello", FileOptions::builder().chunk_size(1).build())
            .await
            .unwrap();
        assert_eq!(count(&db, "fs.files").await, 1);
        assert_eq!(count(&db, "fs.chunks").await, 5);

        fs.delete(id.clone()).await.unwrap();
        assert_eq!(count(&db, "fs.files").await, 0);
        assert_eq!(count(&db, "fs.chunks").await, 0);

        // Deleting again is fine.
        fs.delete(id).await.unwrap();
    }

    #[tokio::test]
    async fn test_list() {
        let (_db, fs) = setup();
        assert_eq!(fs.list().await.unwrap(), Vec::<String>::new());

        fs.put(b"hello world", None).await.unwrap();
        assert_eq!(fs.list().await.unwrap(), Vec::<String>::new());

        fs.put(b"", named("mike")).await.unwrap();
        fs.put(b"foo", named("test")).await.unwrap();
        fs.put(b"", named("hello world")).await.unwrap();
        fs.put(b"again", named("test")).await.unwrap();

        let mut names = fs.list().await.unwrap();
        names.sort();
        assert_eq!(names, vec!["hello world", "mike", "test"]);
    }

    #[tokio::test]
    async fn test_empty_file() {
        let (db, fs) = setup();
        let id = fs.put(b"", None).await.unwrap();
        assert_eq!(fs.get(id.clone()).await.unwrap().read_to_end().await.unwrap(), b"");
        assert_eq!(count(&db, "fs.files").await, 1);
        assert_eq!(count(&db, "fs.chunks").await, 0);

        let raw: Document = fs.files().find_one(None).await.unwrap().unwrap();
        assert_eq!(raw.get_i64("length").unwrap(), 0);
        assert_eq!(raw.get("_id"), Some(&id));
        assert!(raw.get_datetime("uploadDate").is_ok());
        assert_eq!(raw.get_i32("chunkSize").unwrap() as usize, DEFAULT_CHUNK_SIZE);
        assert_eq!(raw.get_str("md5").unwrap(), format!("{:x}", md5::compute(b"")));
    }

    #[tokio::test]
    async fn test_empty_file_without_length() {
        let (_db, fs) = setup();
        let id = fs.put(b"", None).await.unwrap();
        fs.files()
            .update_one(doc! { "_id": id.clone() }, doc! { "$unset": { "length": "" } })
            .await
            .unwrap();

        let mut file = fs.get(id).await.unwrap();
        assert_eq!(file.length(), None);
        assert_eq!(file.read_to_end().await.unwrap(), b"");
    }

    #[tokio::test]
    async fn test_exists() {
        let (_db, fs) = setup();
        let id = fs.put(b"data", named("exists.txt")).await.unwrap();

        assert!(fs.exists_id(id).await.unwrap());
        assert!(fs.exists(doc! { "filename": "exists.txt" }).await.unwrap());
        assert!(!fs.exists(doc! { "filename": "missing.txt" }).await.unwrap());
        assert!(!fs.exists_id("missing").await.unwrap());
    }

    #[tokio::test]
    async fn test_text_with_encoding() {
        let (_db, fs) = setup();
        let options = FileOptions::builder().encoding("latin-1").build();
        let id = fs.put("café", options).await.unwrap();
        assert_eq!(
            fs.get(id).await.unwrap().read_to_end().await.unwrap(),
            vec![b'c', b'a', b'f', 0xe9]
        );

        assert!(matches!(
            fs.put("café", None).await,
            Err(MongoError::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn test_put_from_reader() {
        let (_db, fs) = setup();
        let mut reader: &[u8] = b"streamed contents";
        let id = fs
            .put_from(&mut reader, FileOptions::builder().chunk_size(5).build())
            .await
            .unwrap();
        let mut file = fs.get(id).await.unwrap();
        assert_eq!(file.length(), Some(17));
        assert_eq!(file.read_to_end().await.unwrap(), b"streamed contents");
    }
}

// ============================================================================
// Round Trip Tests
// ============================================================================

mod round_trip_tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_random_round_trips() {
        let (db, fs) = setup();
        let mut rng = rand::thread_rng();

        for _ in 0..20 {
            let length = rng.gen_range(0..5000usize);
            let chunk_size = rng.gen_range(1..700usize);
            let mut data = vec![0u8; length];
            rng.fill_bytes(&mut data);

            let id = fs
                .put(&data, FileOptions::builder().chunk_size(chunk_size).build())
                .await
                .unwrap();
            let chunks = db
                .collection_with_doc("fs.chunks")
                .count_documents(doc! { "files_id": id.clone() })
                .await
                .unwrap();
            assert_eq!(chunks as usize, (length + chunk_size - 1) / chunk_size);

            let mut file = fs.get(id.clone()).await.unwrap();
            assert_eq!(file.length(), Some(length as u64));
            assert_eq!(file.md5(), Some(format!("{:x}", md5::compute(&data)).as_str()));
            assert_eq!(file.read_to_end().await.unwrap(), data);

            fs.delete(id).await.unwrap();
        }
        assert_eq!(count(&db, "fs.chunks").await, 0);
    }

    #[tokio::test]
    async fn test_chunk_stream_matches_contents() {
        let (_db, fs) = setup();
        let data: Vec<u8> = (0..=255u8).cycle().take(1000).collect();
        let id = fs
            .put(&data, FileOptions::builder().chunk_size(300).build())
            .await
            .unwrap();

        let file = fs.get(id).await.unwrap();
        let chunks: Vec<Vec<u8>> = file.chunks().try_collect().await.unwrap();
        assert_eq!(chunks.iter().map(Vec::len).collect::<Vec<_>>(), vec![300, 300, 300, 100]);
        assert_eq!(chunks.concat(), data);
    }

    #[tokio::test]
    async fn test_seek_across_chunks() {
        let (_db, fs) = setup();
        let data: Vec<u8> = (0..100u8).collect();
        let id = fs
            .put(&data, FileOptions::builder().chunk_size(7).build())
            .await
            .unwrap();

        let mut file = fs.get(id).await.unwrap();
        file.seek(SeekFrom::Start(50)).unwrap();
        assert_eq!(file.read(Some(10)).await.unwrap(), (50..60u8).collect::<Vec<_>>());
        file.seek(SeekFrom::End(-3)).unwrap();
        assert_eq!(file.read(None).await.unwrap(), vec![97, 98, 99]);
        file.seek(SeekFrom::Start(0)).unwrap();
        assert_eq!(file.read_to_end().await.unwrap(), data);
    }
}

// ============================================================================
// Consistency Tests
// ============================================================================

mod consistency_tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_corrupt_chunk() {
        let (_db, fs) = setup();
        let id = fs.put(b"foobar", None).await.unwrap();
        let short = bson::Binary {
            subtype: bson::spec::BinarySubtype::Generic,
            bytes: b"foo".to_vec(),
        };
        fs.chunks()
            .update_one(
                doc! { "files_id": id.clone() },
                doc! { "$set": { "data": short } },
            )
            .await
            .unwrap();

        let mut file = fs.get(id.clone()).await.unwrap();
        assert!(matches!(file.read(None).await, Err(MongoError::CorruptGridFile(_))));

        let mut file = fs.get(id).await.unwrap();
        assert!(matches!(file.readline(None).await, Err(MongoError::CorruptGridFile(_))));
    }

    #[tokio::test]
    async fn test_file_exists() {
        let (db, fs) = setup();
        fs.put(b"first", FileOptions::builder().id("dup").build())
            .await
            .unwrap();

        let err = fs
            .put(
                b"second, longer contents",
                FileOptions::builder().id("dup").chunk_size(4).build(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, MongoError::FileExists(Bson::String(ref id)) if id == "dup"));

        assert_eq!(count(&db, "fs.files").await, 1);
        assert_eq!(count(&db, "fs.chunks").await, 1);
        assert_eq!(fs.get("dup").await.unwrap().read_to_end().await.unwrap(), b"first");
    }

    #[tokio::test]
    async fn test_file_exists_on_close() {
        let (db, fs) = setup();
        fs.put(b"", FileOptions::builder().id(7).build()).await.unwrap();

        let mut file = fs
            .new_file(FileOptions::builder().id(7).chunk_size(2).build())
            .unwrap();
        file.write(b"abcd").await.unwrap();
        assert_eq!(count(&db, "fs.chunks").await, 2);

        assert!(matches!(file.close().await, Err(MongoError::FileExists(_))));
        assert!(file.is_closed());
        assert_eq!(count(&db, "fs.chunks").await, 0);
        assert_eq!(count(&db, "fs.files").await, 1);
    }

    #[tokio::test]
    async fn test_put_ensures_index() {
        let (db, fs) = setup();
        let names = db.list_collection_names().await.unwrap();
        assert!(!names.iter().any(|name| name.starts_with("fs")));

        fs.put(b"junk", None).await.unwrap();

        let chunk_indexes = fs.chunks().list_indexes().await.unwrap();
        assert!(chunk_indexes.iter().any(|index| {
            index.get_document("key").ok() == Some(&doc! { "files_id": 1, "n": 1 })
                && index.get_bool("unique").unwrap_or(false)
        }));
        let file_indexes = fs.files().list_indexes().await.unwrap();
        assert!(file_indexes.iter().any(|index| {
            index.get_document("key").ok() == Some(&doc! { "filename": 1, "uploadDate": 1 })
        }));
    }

    #[tokio::test]
    async fn test_unacknowledged_database_rejected() {
        let options = ClientOptions::parse("mongodb://localhost/?w=0").unwrap();
        let db = Client::with_transport(Arc::new(MemoryServer::new()), options).database("x");
        assert!(matches!(GridFS::new(&db), Err(MongoError::Configuration(_))));
    }
}

// ============================================================================
// Version Tests
// ============================================================================

mod version_tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_get_last_version() {
        let (_db, fs) = setup();
        let one = fs.put(b"foo", named("test")).await.unwrap();
        tick().await;
        let two = fs.put(b"bar", named("test")).await.unwrap();
        tick().await;
        let three = fs.put(b"baz", named("test")).await.unwrap();
        let last = |fs: &GridFS| {
            let fs = fs.clone();
            async move {
                fs.get_last_version(Some("test"), None)
                    .await
                    .unwrap()
                    .read_to_end()
                    .await
                    .unwrap()
            }
        };

        assert_eq!(last(&fs).await, b"baz");
        fs.delete(three).await.unwrap();
        assert_eq!(last(&fs).await, b"bar");
        fs.delete(two).await.unwrap();
        assert_eq!(last(&fs).await, b"foo");
        fs.delete(one).await.unwrap();
        assert!(matches!(
            fs.get_last_version(Some("test"), None).await,
            Err(MongoError::NoFile(_))
        ));
    }

    #[tokio::test]
    async fn test_get_version() {
        let (_db, fs) = setup();
        for contents in [&b"foo"[..], b"bar", b"baz"] {
            fs.put(contents, named("test")).await.unwrap();
            tick().await;
        }

        let read = |version: i32| {
            let fs = fs.clone();
            async move {
                fs.get_version(Some("test"), version, None)
                    .await?
                    .read_to_end()
                    .await
            }
        };
        assert_eq!(read(0).await.unwrap(), b"foo");
        assert_eq!(read(1).await.unwrap(), b"bar");
        assert_eq!(read(2).await.unwrap(), b"baz");
        assert_eq!(read(-1).await.unwrap(), b"baz");
        assert_eq!(read(-2).await.unwrap(), b"bar");
        assert_eq!(read(-3).await.unwrap(), b"foo");
        assert!(matches!(read(3).await, Err(MongoError::NoFile(_))));
        assert!(matches!(read(-4).await, Err(MongoError::NoFile(_))));
    }

    #[tokio::test]
    async fn test_get_last_version_with_metadata() {
        let (_db, fs) = setup();
        let with_author = |author: &str| {
            FileOptions::builder()
                .filename("test")
                .field("author", author)
                .build()
        };

        let one = fs.put(b"foo", with_author("author")).await.unwrap();
        tick().await;
        let two = fs.put(b"bar", with_author("author")).await.unwrap();
        assert_eq!(
            fs.get_last_version(None, doc! { "author": "author" })
                .await
                .unwrap()
                .read_to_end()
                .await
                .unwrap(),
            b"bar"
        );
        fs.delete(two).await.unwrap();
        assert_eq!(
            fs.get_last_version(None, doc! { "author": "author" })
                .await
                .unwrap()
                .read_to_end()
                .await
                .unwrap(),
            b"foo"
        );
        fs.delete(one).await.unwrap();

        fs.put(b"foo", with_author("author1")).await.unwrap();
        tick().await;
        fs.put(b"bar", with_author("author2")).await.unwrap();

        let by_author = |author: &'static str| {
            let fs = fs.clone();
            async move {
                fs.get_last_version(None, doc! { "author": author })
                    .await
                    .unwrap()
                    .read_to_end()
                    .await
                    .unwrap()
            }
        };
        assert_eq!(by_author("author1").await, b"foo");
        assert_eq!(by_author("author2").await, b"bar");
        assert_eq!(
            fs.get_last_version(Some("test"), None)
                .await
                .unwrap()
                .read_to_end()
                .await
                .unwrap(),
            b"bar"
        );
    }

    #[tokio::test]
    async fn test_find_files() {
        let (_db, fs) = setup();
        fs.put(b"a", named("a.txt")).await.unwrap();
        fs.put(b"bb", named("b.txt")).await.unwrap();
        fs.put(b"ccc", named("c.log")).await.unwrap();

        let options = mongo_bulkgrid::FindOptions::builder()
            .sort(doc! { "filename": -1 })
            .build();
        let files = fs
            .find(doc! { "length": { "$gte": 2 } }, options)
            .await
            .unwrap();
        let names: Vec<&str> = files.iter().filter_map(|file| file.filename()).collect();
        assert_eq!(names, vec!["c.log", "b.txt"]);
    }
}
