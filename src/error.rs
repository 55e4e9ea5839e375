//! Error types for bulk writes and GridFS operations.

use crate::bulk::BulkResult;
use bson::Bson;
use thiserror::Error;

/// Server error code reported by a bulk write that hit write errors.
pub const BULK_WRITE_ERROR_CODE: i32 = 65;

/// Server error code reported by a bulk write that only hit write concern errors.
pub const WRITE_CONCERN_ERROR_CODE: i32 = 64;

/// Duplicate key error code.
pub const DUPLICATE_KEY_CODE: i32 = 11000;

/// All errors that can occur during database operations.
#[derive(Debug, Error)]
pub enum MongoError {
    /// Configuration error.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Write error for a single-document operation.
    #[error("write error: {message}")]
    Write {
        /// Error code from server.
        code: Option<i32>,
        /// Error message.
        message: String,
    },

    /// Bulk write error, carrying the aggregated result so far.
    #[error(
        "bulk write error: {} write errors, {} write concern errors",
        .0.details.write_errors.len(),
        .0.details.write_concern_errors.len()
    )]
    BulkWrite(Box<BulkWriteFailure>),

    /// Command error.
    #[error("command error: {message}")]
    Command {
        /// Error code from server.
        code: i32,
        /// Error message.
        message: String,
    },

    /// Invalid argument (malformed operation, wrong input type).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Document that cannot be stored as given.
    #[error("invalid document: {0}")]
    InvalidDocument(String),

    /// Operation not valid in the current state.
    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    /// No file matched the request.
    #[error("no file: {0}")]
    NoFile(String),

    /// Persisted file data is inconsistent.
    #[error("corrupt grid file: {0}")]
    CorruptGridFile(String),

    /// A file with the requested id already exists.
    #[error("file exists with id {0}")]
    FileExists(Bson),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Deserialization error.
    #[error("deserialization error: {0}")]
    Deserialization(String),

    /// Network error.
    #[error("network error: {0}")]
    Network(String),

    /// I/O error while reading caller-supplied data.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// BSON error.
    #[error("bson error: {0}")]
    Bson(String),
}

/// Details of a failed bulk write.
#[derive(Debug, Clone)]
pub struct BulkWriteFailure {
    /// Server-style error code (65 for write errors, 64 for write concern only).
    pub code: i32,
    /// Everything that happened before execution stopped.
    pub details: BulkResult,
}

impl MongoError {
    /// Create a configuration error.
    pub fn configuration(msg: impl Into<String>) -> Self {
        MongoError::Configuration(msg.into())
    }

    /// Create a write error.
    pub fn write(code: Option<i32>, message: impl Into<String>) -> Self {
        MongoError::Write {
            code,
            message: message.into(),
        }
    }

    /// Create a command error.
    pub fn command(code: i32, message: impl Into<String>) -> Self {
        MongoError::Command {
            code,
            message: message.into(),
        }
    }

    /// Create an invalid argument error.
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        MongoError::InvalidArgument(msg.into())
    }

    /// Create an invalid document error.
    pub fn invalid_document(msg: impl Into<String>) -> Self {
        MongoError::InvalidDocument(msg.into())
    }

    /// Create an invalid operation error.
    pub fn invalid_operation(msg: impl Into<String>) -> Self {
        MongoError::InvalidOperation(msg.into())
    }

    /// Create a no-file error.
    pub fn no_file(msg: impl Into<String>) -> Self {
        MongoError::NoFile(msg.into())
    }

    /// Create a corrupt-file error.
    pub fn corrupt(msg: impl Into<String>) -> Self {
        MongoError::CorruptGridFile(msg.into())
    }

    /// Wrap an aggregated bulk result into a bulk write error.
    pub fn bulk_write(details: BulkResult) -> Self {
        let code = if details.write_errors.is_empty() {
            WRITE_CONCERN_ERROR_CODE
        } else {
            BULK_WRITE_ERROR_CODE
        };
        MongoError::BulkWrite(Box::new(BulkWriteFailure { code, details }))
    }

    /// Check if this is a connection error.
    pub fn is_connection_error(&self) -> bool {
        matches!(self, MongoError::Network(_))
    }

    /// Check if this error means the requested file does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(self, MongoError::NoFile(_))
    }

    /// Check if this error reports inconsistent stored file data.
    pub fn is_corrupt(&self) -> bool {
        matches!(self, MongoError::CorruptGridFile(_))
    }

    /// The aggregated result carried by a bulk write error.
    pub fn bulk_details(&self) -> Option<&BulkResult> {
        match self {
            MongoError::BulkWrite(failure) => Some(&failure.details),
            _ => None,
        }
    }

    /// Get the error code if available.
    pub fn code(&self) -> Option<i32> {
        match self {
            MongoError::Write { code, .. } => *code,
            MongoError::Command { code, .. } => Some(*code),
            MongoError::BulkWrite(failure) => Some(failure.code),
            _ => None,
        }
    }

    /// Get the error message.
    pub fn message(&self) -> String {
        self.to_string()
    }
}

impl From<serde_json::Error> for MongoError {
    fn from(err: serde_json::Error) -> Self {
        MongoError::Serialization(err.to_string())
    }
}

impl From<bson::ser::Error> for MongoError {
    fn from(err: bson::ser::Error) -> Self {
        MongoError::Bson(err.to_string())
    }
}

impl From<bson::de::Error> for MongoError {
    fn from(err: bson::de::Error) -> Self {
        MongoError::Bson(err.to_string())
    }
}

impl From<bson::document::ValueAccessError> for MongoError {
    fn from(err: bson::document::ValueAccessError) -> Self {
        MongoError::Deserialization(err.to_string())
    }
}

/// Result type alias for database operations.
pub type Result<T> = std::result::Result<T, MongoError>;

/// Error kind enumeration for pattern matching.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed input rejected before any network interaction.
    Validation,
    /// Server-reported write failure.
    Write,
    /// Requested file or version does not exist.
    NotFound,
    /// Stored data is inconsistent.
    Corruption,
    /// Misuse of a single-use object.
    State,
    /// Command error.
    Command,
    /// Serialization error.
    Serialization,
    /// Configuration error.
    Configuration,
    /// Network error.
    Network,
}

impl MongoError {
    /// Get the error kind.
    pub fn kind(&self) -> ErrorKind {
        match self {
            MongoError::InvalidArgument(_) | MongoError::InvalidDocument(_) => {
                ErrorKind::Validation
            }
            MongoError::Write { .. } | MongoError::BulkWrite(_) | MongoError::FileExists(_) => {
                ErrorKind::Write
            }
            MongoError::NoFile(_) => ErrorKind::NotFound,
            MongoError::CorruptGridFile(_) => ErrorKind::Corruption,
            MongoError::InvalidOperation(_) => ErrorKind::State,
            MongoError::Command { .. } => ErrorKind::Command,
            MongoError::Serialization(_) | MongoError::Deserialization(_) | MongoError::Bson(_) => {
                ErrorKind::Serialization
            }
            MongoError::Configuration(_) => ErrorKind::Configuration,
            MongoError::Network(_) | MongoError::Io(_) => ErrorKind::Network,
        }
    }
}
