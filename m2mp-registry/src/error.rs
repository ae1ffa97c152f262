//! Registry error types.

use thiserror::Error;
use uuid::Uuid;

/// Errors from the device registry and time-series store.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("device not found: {0}")]
    DeviceNotFound(Uuid),

    #[error("invalid identifier: {0:?}")]
    InvalidIdent(String),

    #[error("priority must be between 0 and 100, got {0}")]
    InvalidPriority(u8),

    #[error("invalid channel pattern {pattern:?}: {reason}")]
    InvalidPattern { pattern: String, reason: String },

    #[error("store unavailable: {0}")]
    Unavailable(String),
}
