//! Crate-wide error type.
//!
//! Only `Config` is fatal (startup aborts before subscribing). Every other
//! kind is logged and noted by the caller, then dropped.

use crate::store::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum TapError {
    #[error("Invalid configuration: {0}")]
    Config(String),
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
    #[error("Publish failed on topic {topic}: {reason}")]
    Publish { topic: String, reason: String },
    #[error("Processor {processor} failed: {reason}")]
    Handler { processor: String, reason: String },
    #[error("Invalid message: {0}")]
    Invalid(String),
    #[error("Inventory error: {0}")]
    Inventory(String),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl TapError {
    /// Wraps any displayable failure from inside a processor.
    pub fn handler(processor: &str, reason: impl std::fmt::Display) -> Self {
        TapError::Handler {
            processor: processor.to_string(),
            reason: reason.to_string(),
        }
    }
}
