//! Client entry point and its configuration.

use crate::db::Database;
use crate::error::{MongoError, Result};
use crate::transport::Transport;
use bson::{Bson, Document};
use std::sync::Arc;

/// Default GridFS chunk size: 255 KiB.
pub const DEFAULT_CHUNK_SIZE: usize = 255 * 1024;

/// Acknowledgment level for writes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Acknowledgment {
    /// Acknowledged by this many nodes (`w: 0` is fire-and-forget).
    Nodes(i32),
    /// Acknowledged by a majority of nodes.
    Majority,
    /// A named tag set.
    Custom(String),
}

/// Write concern attached to every write command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteConcern {
    /// `w` value.
    pub w: Option<Acknowledgment>,
    /// Wait for the journal.
    pub journal: Option<bool>,
    /// Replication timeout in milliseconds.
    pub w_timeout_ms: Option<u64>,
}

impl WriteConcern {
    /// `w: 0`.
    pub fn unacknowledged() -> Self {
        Self {
            w: Some(Acknowledgment::Nodes(0)),
            ..Self::default()
        }
    }

    /// `w: "majority"`.
    pub fn majority() -> Self {
        Self {
            w: Some(Acknowledgment::Majority),
            ..Self::default()
        }
    }

    /// Whether the server will acknowledge writes.
    pub fn is_acknowledged(&self) -> bool {
        self.w != Some(Acknowledgment::Nodes(0)) || self.journal == Some(true)
    }

    /// Whether this is the server default (nothing to send).
    pub fn is_empty(&self) -> bool {
        self.w.is_none() && self.journal.is_none() && self.w_timeout_ms.is_none()
    }

    /// The `writeConcern` sub-document for a command.
    pub fn to_document(&self) -> Document {
        let mut doc = Document::new();
        match &self.w {
            Some(Acknowledgment::Nodes(n)) => {
                doc.insert("w", *n);
            }
            Some(Acknowledgment::Majority) => {
                doc.insert("w", "majority");
            }
            Some(Acknowledgment::Custom(tag)) => {
                doc.insert("w", tag.clone());
            }
            None => {}
        }
        if let Some(journal) = self.journal {
            doc.insert("j", journal);
        }
        if let Some(timeout) = self.w_timeout_ms {
            doc.insert("wtimeout", Bson::Int64(timeout as i64));
        }
        doc
    }
}

/// Options for a client.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Application name for server logs.
    pub app_name: Option<String>,
    /// Write concern for all writes issued through this client.
    pub write_concern: WriteConcern,
    /// Client-side cap on operations per write command (the server limit still applies).
    pub max_write_batch_size: Option<usize>,
    /// Default chunk size for new GridFS files.
    pub default_chunk_size: usize,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            app_name: None,
            write_concern: WriteConcern::default(),
            max_write_batch_size: None,
            default_chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }
}

impl ClientOptions {
    /// Create a new ClientOptions with defaults.
    pub fn builder() -> ClientOptionsBuilder {
        ClientOptionsBuilder::default()
    }

    /// Parse options from a connection string.
    pub fn parse(uri: &str) -> Result<Self> {
        let mut options = ClientOptions::default();

        if let Some(query_start) = uri.find('?') {
            let query = &uri[query_start + 1..];
            for param in query.split('&').filter(|p| !p.is_empty()) {
                let (key, value) = param.split_once('=').ok_or_else(|| {
                    MongoError::configuration(format!("malformed option '{}'", param))
                })?;

                match key {
                    "appName" => {
                        options.app_name = Some(value.to_string());
                    }
                    "w" => {
                        options.write_concern.w = Some(match value.parse::<i32>() {
                            Ok(n) => Acknowledgment::Nodes(n),
                            Err(_) if value == "majority" => Acknowledgment::Majority,
                            Err(_) => Acknowledgment::Custom(value.to_string()),
                        });
                    }
                    "journal" => {
                        options.write_concern.journal = Some(parse_bool(key, value)?);
                    }
                    "wtimeoutMS" => {
                        options.write_concern.w_timeout_ms = Some(parse_number(key, value)?);
                    }
                    "maxWriteBatchSize" => {
                        options.max_write_batch_size = Some(parse_number(key, value)?);
                    }
                    "chunkSize" => {
                        let size: usize = parse_number(key, value)?;
                        if size == 0 {
                            return Err(MongoError::configuration("chunkSize must be positive"));
                        }
                        options.default_chunk_size = size;
                    }
                    _ => {}
                }
            }
        }

        Ok(options)
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value {
        "true" => Ok(true),
        "false" => Ok(false),
        _ => Err(MongoError::configuration(format!(
            "{} expects true or false, got '{}'",
            key, value
        ))),
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value.parse().map_err(|_| {
        MongoError::configuration(format!("{} expects a number, got '{}'", key, value))
    })
}

/// Builder for ClientOptions.
#[derive(Debug, Clone, Default)]
pub struct ClientOptionsBuilder {
    options: ClientOptions,
}

impl ClientOptionsBuilder {
    /// Set the application name.
    pub fn app_name(mut self, name: impl Into<String>) -> Self {
        self.options.app_name = Some(name.into());
        self
    }

    /// Set the write concern.
    pub fn write_concern(mut self, write_concern: WriteConcern) -> Self {
        self.options.write_concern = write_concern;
        self
    }

    /// Cap the number of operations per write command.
    pub fn max_write_batch_size(mut self, size: usize) -> Self {
        self.options.max_write_batch_size = Some(size);
        self
    }

    /// Set the default GridFS chunk size.
    pub fn default_chunk_size(mut self, size: usize) -> Self {
        self.options.default_chunk_size = size;
        self
    }

    /// Build the options.
    pub fn build(self) -> ClientOptions {
        self.options
    }
}

/// A client bound to a transport.
///
/// # Example
///
/// ```ignore
/// use std::sync::Arc;
/// use mongo_bulkgrid::{memory::MemoryServer, Client, ClientOptions};
///
/// let options = ClientOptions::parse("mongodb://localhost/?w=majority&chunkSize=1024")?;
/// let client = Client::with_transport(Arc::new(MemoryServer::new()), options);
/// let db = client.database("mydb");
/// ```
#[derive(Clone)]
pub struct Client {
    transport: Arc<dyn Transport>,
    options: Arc<ClientOptions>,
}

impl Client {
    /// Create a client that sends its commands through `transport`.
    pub fn with_transport(transport: Arc<dyn Transport>, options: ClientOptions) -> Self {
        Self {
            transport,
            options: Arc::new(options),
        }
    }

    /// Get the client options.
    pub fn options(&self) -> &ClientOptions {
        &self.options
    }

    /// Get a handle to a database.
    pub fn database(&self, name: &str) -> Database {
        Database::new(name.to_string(), self.transport.clone(), self.options.clone())
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}
