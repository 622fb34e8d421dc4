/// Error types for the portal chat core
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ChatError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Subscription error: {0}")]
    Subscription(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl ChatError {
    /// Failures that may succeed when the same call is repeated later
    pub fn is_transient(&self) -> bool {
        matches!(self, ChatError::Network(_) | ChatError::Subscription(_))
    }
}

pub type Result<T> = std::result::Result<T, ChatError>;
