//! Error types for vmrunner

use thiserror::Error;

/// Result type alias using vmrunner Error
pub type Result<T> = std::result::Result<T, Error>;

/// vmrunner error types
#[derive(Error, Debug)]
pub enum Error {
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Compute client error: {0}")]
    Client(String),
}
