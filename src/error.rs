//! Error types for roadmap-storage

use thiserror::Error;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Database error: {0}")]
    Database(#[from] diesel::result::Error),

    #[error("Connection pool error: {0}")]
    Pool(#[from] diesel::r2d2::PoolError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Outcome taxonomy exposed to collaborators (the HTTP layer maps these
/// onto status codes)
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ErrorKind {
    NotFound,
    Conflict,
    BadRequest,
    ServerError,
}

impl StorageError {
    /// Classify this error for the caller
    pub fn kind(&self) -> ErrorKind {
        match self {
            StorageError::NotFound(_) => ErrorKind::NotFound,
            StorageError::Conflict(_) => ErrorKind::Conflict,
            StorageError::InvalidInput(_) => ErrorKind::BadRequest,
            StorageError::Database(diesel::result::Error::NotFound) => ErrorKind::NotFound,
            StorageError::Database(diesel::result::Error::DatabaseError(
                diesel::result::DatabaseErrorKind::UniqueViolation,
                _,
            )) => ErrorKind::Conflict,
            _ => ErrorKind::ServerError,
        }
    }

    /// Translate a store error, turning unique-index violations into `Conflict`
    pub fn from_write(e: diesel::result::Error, what: &str) -> Self {
        match e {
            diesel::result::Error::DatabaseError(
                diesel::result::DatabaseErrorKind::UniqueViolation,
                info,
            ) => StorageError::Conflict(format!("{}: {}", what, info.message())),
            other => StorageError::Internal(format!("{} failed: {}", what, other)),
        }
    }
}
