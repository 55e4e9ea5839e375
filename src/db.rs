//! Database handle.

use crate::client::{ClientOptions, WriteConcern};
use crate::collection::Collection;
use crate::cursor::Cursor;
use crate::error::Result;
use crate::transport::{check_reply, ServerLimits, Transport};
use bson::{doc, Document};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use tracing::debug;

/// A handle to a database.
///
/// # Example
///
/// ```ignore
/// let db = client.database("mydb");
///
/// let collections = db.list_collection_names().await?;
/// println!("Collections: {:?}", collections);
/// ```
#[derive(Clone)]
pub struct Database {
    /// Database name.
    pub(crate) name: String,
    /// Command transport.
    pub(crate) transport: Arc<dyn Transport>,
    /// Options inherited from the client.
    pub(crate) options: Arc<ClientOptions>,
}

impl Database {
    /// Create a new database handle.
    pub(crate) fn new(
        name: String,
        transport: Arc<dyn Transport>,
        options: Arc<ClientOptions>,
    ) -> Self {
        Self {
            name,
            transport,
            options,
        }
    }

    /// Get the database name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Options inherited from the client.
    pub fn options(&self) -> &ClientOptions {
        &self.options
    }

    /// Write concern applied to writes through this database.
    pub fn write_concern(&self) -> &WriteConcern {
        &self.options.write_concern
    }

    /// Get a handle to a collection with a specific type.
    ///
    /// # Example
    ///
    /// ```ignore
    /// #[derive(Debug, Serialize, Deserialize)]
    /// struct User {
    ///     name: String,
    ///     email: String,
    /// }
    ///
    /// let users = db.collection::<User>("users");
    /// ```
    pub fn collection<T>(&self, name: &str) -> Collection<T>
    where
        T: Serialize + DeserializeOwned + Send + Sync + Unpin + 'static,
    {
        Collection::new(self.clone(), name.to_string())
    }

    /// Get a handle to a collection with Document type.
    pub fn collection_with_doc(&self, name: &str) -> Collection<Document> {
        Collection::new(self.clone(), name.to_string())
    }

    /// Run a database command.
    ///
    /// # Example
    ///
    /// ```ignore
    /// let reply = db.run_command(doc! { "hello": 1 }).await?;
    /// ```
    pub async fn run_command(&self, command: Document) -> Result<Document> {
        let reply = self.transport.run_command(&self.name, command).await?;
        check_reply(reply)
    }

    /// Ask the server for its size limits, capped by the client options.
    pub async fn server_limits(&self) -> Result<ServerLimits> {
        let reply = self.run_command(self.hello_command()).await?;
        let mut limits = ServerLimits::from_hello(&reply);
        if let Some(cap) = self.options.max_write_batch_size {
            limits.max_write_batch_size = limits.max_write_batch_size.min(cap.max(1));
        }
        debug!(
            db = %self.name,
            max_bson_object_size = limits.max_bson_object_size,
            max_write_batch_size = limits.max_write_batch_size,
            "server limits"
        );
        Ok(limits)
    }

    /// `hello`, announcing the application name when one is configured.
    fn hello_command(&self) -> Document {
        let mut command = doc! { "hello": 1 };
        if let Some(app_name) = &self.options.app_name {
            command.insert("client", doc! { "application": { "name": app_name.as_str() } });
        }
        command
    }

    /// List all collection names in this database.
    pub async fn list_collection_names(&self) -> Result<Vec<String>> {
        let reply = self
            .run_command(doc! { "listCollections": 1, "nameOnly": true })
            .await?;
        let cursor: Cursor<Document> = Cursor::from_reply(self.clone(), &reply)?;
        let collections = cursor.collect().await?;
        Ok(collections
            .iter()
            .filter_map(|c| c.get_str("name").ok().map(|s| s.to_string()))
            .collect())
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}
