//! Storage engine error types
//!
//! Defines all errors that can occur in the storage layer.

use thiserror::Error;

/// Errors that can occur in the storage engine
#[derive(Error, Debug)]
pub enum StorageError {
    /// I/O operation failed
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Compression or decompression failed
    #[error("Compression error: {0}")]
    Compression(String),

    /// A record line could not be parsed
    #[error("Malformed record: {0}")]
    MalformedRecord(String),

    /// Unknown type tag in a record
    #[error("Unknown type tag: {0}")]
    UnknownTypeTag(String),

    /// A value could not be parsed or encoded for its type
    #[error("Invalid value: {0}")]
    InvalidValue(String),

    /// Segment file name could not be decoded
    #[error("Invalid segment name: {0}")]
    InvalidSegmentName(String),

    /// Point identity is unusable (empty or unsafe components)
    #[error("Invalid point: {0}")]
    InvalidPoint(String),

    /// SQL backend failure
    #[error("Database error: {0}")]
    Database(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// The engine has been shut down
    #[error("Engine is shut down")]
    ShutDown,
}

impl From<zip::result::ZipError> for StorageError {
    fn from(err: zip::result::ZipError) -> Self {
        StorageError::Compression(err.to_string())
    }
}

impl From<rusqlite::Error> for StorageError {
    fn from(err: rusqlite::Error) -> Self {
        StorageError::Database(err.to_string())
    }
}

/// Result type alias for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = StorageError::UnknownTypeTag("cplx".to_string());
        assert_eq!(err.to_string(), "Unknown type tag: cplx");

        let err = StorageError::InvalidPoint("nodot".to_string());
        assert_eq!(err.to_string(), "Invalid point: nodot");
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let storage_err: StorageError = io_err.into();
        assert!(matches!(storage_err, StorageError::Io(_)));
    }
}
