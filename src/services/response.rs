//! JSON envelopes for service results
//!
//! Collaborators (HTTP layer, CLI) render a `Result<T, StorageError>` the
//! same way: `{"ok": true, "data": ...}` or
//! `{"ok": false, "error": {"kind": ..., "message": ...}}`.

use serde::Serialize;
use serde_json::{json, Value};

use crate::error::{ErrorKind, StorageError};

/// Error body carried in a failed envelope
#[derive(Debug, Clone, Serialize)]
pub struct ErrorBody {
    pub kind: ErrorKind,
    pub message: String,
}

impl From<&StorageError> for ErrorBody {
    fn from(err: &StorageError) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

/// Successful envelope
pub fn ok<T: Serialize>(data: &T) -> Value {
    json!({ "ok": true, "data": data })
}

/// Failed envelope
pub fn error(err: &StorageError) -> Value {
    json!({ "ok": false, "error": ErrorBody::from(err) })
}

/// Envelope for any service result
pub fn envelope<T: Serialize>(result: &Result<T, StorageError>) -> Value {
    match result {
        Ok(data) => ok(data),
        Err(err) => error(err),
    }
}
