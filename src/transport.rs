//! Transport seam between the driver layer and a database server.
//!
//! Everything above this module speaks in command documents
//! (`{insert: ..., documents: [...]}`, `{find: ..., filter: ...}`) and reply
//! documents. How those travel to a server is the transport's business.

use crate::error::{MongoError, Result};
use async_trait::async_trait;
use bson::{Bson, Document};

/// Default maximum size of a single BSON document.
pub const DEFAULT_MAX_BSON_OBJECT_SIZE: usize = 16 * 1024 * 1024;

/// Default maximum size of a wire message.
pub const DEFAULT_MAX_MESSAGE_SIZE_BYTES: usize = 48_000_000;

/// Default maximum number of operations in one write command.
pub const DEFAULT_MAX_WRITE_BATCH_SIZE: usize = 100_000;

/// Something that can deliver a database command and return the reply.
///
/// Implementations report replies with `ok: 0` as [`MongoError::Command`];
/// a returned `Ok` reply is always a successful command (which may still
/// carry per-operation `writeErrors`).
#[async_trait]
pub trait Transport: Send + Sync {
    /// Run `command` against database `db`.
    async fn run_command(&self, db: &str, command: Document) -> Result<Document>;
}

/// Size limits advertised by the server in its `hello` reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerLimits {
    /// Largest document the server accepts.
    pub max_bson_object_size: usize,
    /// Largest wire message the server accepts.
    pub max_message_size_bytes: usize,
    /// Largest number of operations in one write command.
    pub max_write_batch_size: usize,
}

impl Default for ServerLimits {
    fn default() -> Self {
        Self {
            max_bson_object_size: DEFAULT_MAX_BSON_OBJECT_SIZE,
            max_message_size_bytes: DEFAULT_MAX_MESSAGE_SIZE_BYTES,
            max_write_batch_size: DEFAULT_MAX_WRITE_BATCH_SIZE,
        }
    }
}

impl ServerLimits {
    /// Read the limits out of a `hello` reply, falling back to defaults.
    pub fn from_hello(reply: &Document) -> Self {
        let defaults = Self::default();
        let read = |key: &str, fallback: usize| {
            numeric(reply, key)
                .filter(|v| *v > 0)
                .map(|v| v as usize)
                .unwrap_or(fallback)
        };
        Self {
            max_bson_object_size: read("maxBsonObjectSize", defaults.max_bson_object_size),
            max_message_size_bytes: read("maxMessageSizeBytes", defaults.max_message_size_bytes),
            max_write_batch_size: read("maxWriteBatchSize", defaults.max_write_batch_size),
        }
    }
}

/// Read an integer field regardless of its numeric BSON type.
pub(crate) fn numeric(doc: &Document, key: &str) -> Option<i64> {
    match doc.get(key)? {
        Bson::Int32(v) => Some(i64::from(*v)),
        Bson::Int64(v) => Some(*v),
        Bson::Double(v) => Some(*v as i64),
        _ => None,
    }
}

/// Turn an `ok: 0` reply into a command error.
pub(crate) fn check_reply(reply: Document) -> Result<Document> {
    let ok = match reply.get("ok") {
        Some(Bson::Double(v)) => *v != 0.0,
        Some(Bson::Int32(v)) => *v != 0,
        Some(Bson::Int64(v)) => *v != 0,
        Some(Bson::Boolean(v)) => *v,
        _ => true,
    };
    if ok {
        return Ok(reply);
    }
    let code = numeric(&reply, "code").unwrap_or(0) as i32;
    let message = reply
        .get_str("errmsg")
        .unwrap_or("command failed")
        .to_string();
    Err(MongoError::command(code, message))
}

/// Encoded size of a document in bytes.
pub(crate) fn bson_size(doc: &Document) -> Result<usize> {
    Ok(bson::to_vec(doc)?.len())
}
