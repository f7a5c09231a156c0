//! Error types for the relay.
//!
//! Two families:
//! - `RelayError` aborts an upload or summary request and maps to an HTTP status.
//! - `Degraded` reports a best-effort step (local save, remote backup, image
//!   archive) that failed. It is logged and returned, never turned into a
//!   request failure.

use serde_json::json;
use thiserror::Error;

/// Hard failures surfaced to the calling device.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("unauthorized")]
    Unauthorized,

    #[error("inference failed: {detail}")]
    InferenceFailure { detail: String },

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl RelayError {
    pub fn status(&self) -> u16 {
        match self {
            RelayError::InvalidInput(_) => 400,
            RelayError::Unauthorized => 401,
            RelayError::InferenceFailure { .. } | RelayError::Internal(_) => 500,
        }
    }

    /// JSON body sent with the error status.
    pub fn body(&self) -> serde_json::Value {
        match self {
            RelayError::InvalidInput(reason) => json!({ "error": reason }),
            RelayError::Unauthorized => json!({ "error": "unauthorized" }),
            RelayError::InferenceFailure { detail } => {
                json!({ "error": "inference failed", "detail": detail })
            }
            RelayError::Internal(err) => {
                json!({ "error": "internal error", "detail": err.to_string() })
            }
        }
    }
}

/// A best-effort side write that did not complete.
#[derive(Debug, Error)]
pub enum Degraded {
    #[error("local ledger save failed: {0}")]
    LocalSave(String),

    #[error("remote ledger backup failed: {0}")]
    RemoteBackup(String),

    #[error("image archive failed: {0}")]
    ImageArchive(String),
}

/// Outcome of a best-effort step. Callers may ignore it.
pub type BestEffort = std::result::Result<(), Degraded>;
