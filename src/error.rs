//! WolfBatch Error Types

use thiserror::Error;

/// Result type alias for WolfBatch operations
pub type Result<T> = std::result::Result<T, Error>;

/// WolfBatch error types
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    // Schema errors
    #[error("Could not find the following table. It might have been dropped: {0}")]
    TableNotFound(String),

    #[error("Schema error: {0}")]
    Schema(String),

    // Extraction errors
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("Failed to open cursor: {0}")]
    Cursor(String),

    #[error("Database error: {0}")]
    Database(String),

    // Batch errors
    #[error("Batch {batch_id} for node {node_id} not found")]
    BatchNotFound { batch_id: i64, node_id: String },

    #[error("Batch {batch_id} was already extracted and staged")]
    AlreadyExtracted { batch_id: i64 },

    #[error("Batch {batch_id} was cancelled while extracting")]
    Cancelled { batch_id: i64 },

    #[error("Failed to copy batch {source_batch_id} to batch {target_batch_id}: {source}")]
    ChildCopy {
        source_batch_id: i64,
        target_batch_id: i64,
        #[source]
        source: Box<Error>,
    },

    // Staging errors
    #[error("Staging error: {0}")]
    Staging(String),

    // Lock errors
    #[error("Timed out waiting for lock on {0}")]
    LockTimeout(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Check if this error is an out-of-band cancellation rather than a failure
    pub fn is_cancellation(&self) -> bool {
        match self {
            Error::Cancelled { .. } => true,
            Error::ChildCopy { source, .. } => source.is_cancellation(),
            _ => false,
        }
    }

    /// Check if this error must abort the whole extraction session
    pub fn is_fatal_to_session(&self) -> bool {
        matches!(
            self,
            Error::TableNotFound(_)
                | Error::ProtocolViolation(_)
                | Error::Cursor(_)
                | Error::Database(_)
                | Error::Staging(_)
                | Error::Io(_)
        )
    }
}

impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        Error::Database(format!("SQLite error: {}", e))
    }
}
