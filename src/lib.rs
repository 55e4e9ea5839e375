//! # mongo-bulkgrid
//!
//! Bulk write batching and GridFS file storage for MongoDB-compatible
//! servers.
//!
//! The crate builds and interprets database commands; the commands
//! themselves travel through a [`Transport`]. [`MemoryServer`] is an
//! in-process transport for tests and embedding.
//!
//! ## Features
//!
//! - Ordered and unordered bulk writes split into size- and count-bounded
//!   batches, with one aggregated result
//! - Fluent bulk builder (`find(..).upsert().update_one(..)`)
//! - GridFS: chunked writes, validated reads, versions by upload date
//! - Async/await support with tokio
//! - Cursor-based iteration
//!
//! ## Quick Start
//!
//! ```ignore
//! use mongo_bulkgrid::{bson::doc, Client, ClientOptions, GridFS, MemoryServer};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> mongo_bulkgrid::Result<()> {
//!     let server = Arc::new(MemoryServer::new());
//!     let client = Client::with_transport(server, ClientOptions::default());
//!     let db = client.database("mydb");
//!
//!     // Bulk writes
//!     let coll = db.collection_with_doc("items");
//!     let mut bulk = coll.initialize_unordered_bulk_op();
//!     bulk.insert(doc! { "sku": "a", "qty": 1 })?;
//!     bulk.find(doc! { "sku": "b" }).upsert().update_one(doc! { "$inc": { "qty": 2 } })?;
//!     bulk.find(doc! { "qty": 0 }).remove()?;
//!     let result = bulk.execute().await?;
//!     println!("inserted {}, upserted {}", result.n_inserted, result.n_upserted);
//!
//!     // Files
//!     let fs = GridFS::new(&db)?;
//!     let id = fs.put(b"hello world", None).await?;
//!     let data = fs.get(id).await?.read_to_end().await?;
//!     assert_eq!(data, b"hello world");
//!
//!     Ok(())
//! }
//! ```

pub mod bulk;
pub mod client;
pub mod collection;
pub mod cursor;
pub mod db;
pub mod error;
pub mod gridfs;
pub mod memory;
pub mod transport;

// Re-export main types
pub use bulk::{
    BulkExecutor, BulkOperationBuilder, BulkResult, BulkWriteResult, CommandKind, Upserted,
    WriteError, WriteOperation,
};
pub use client::{Acknowledgment, Client, ClientOptions, ClientOptionsBuilder, WriteConcern};
pub use collection::{
    Collection, DeleteResult, FindOptions, FindOptionsBuilder, InsertManyResult, InsertOneResult,
    UpdateOptions, UpdateOptionsBuilder, UpdateResult,
};
pub use cursor::Cursor;
pub use db::Database;
pub use error::{ErrorKind, MongoError, Result};
pub use gridfs::{FileData, FileOptions, FileOptionsBuilder, GridFS, GridIn, GridOut};
pub use memory::MemoryServer;
pub use transport::{ServerLimits, Transport};

// Re-export bson for convenience
pub use bson;
pub use bson::doc;

/// Prelude module for common imports.
pub mod prelude {
    pub use super::bulk::{BulkResult, WriteOperation};
    pub use super::client::{Client, ClientOptions, WriteConcern};
    pub use super::collection::{Collection, FindOptions, UpdateOptions};
    pub use super::cursor::Cursor;
    pub use super::db::Database;
    pub use super::error::{ErrorKind, MongoError, Result};
    pub use super::gridfs::{FileOptions, GridFS};
    pub use bson::{doc, Document};
    pub use serde::{Deserialize, Serialize};
}

/// Get the crate version.
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
