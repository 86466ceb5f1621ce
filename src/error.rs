//! Error types for courier.
//!
//! A missing task is not an error: reads return `Option`, mutations no-op
//! and log. Errors here are hard failures of a single operation.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// File I/O failure against the store file.
    #[error("storage error: {0}")]
    Storage(#[from] std::io::Error),

    /// Could not acquire the store lock within the bounded retry budget.
    #[error("lock contended: {path} still held after {attempts} attempts")]
    LockContended { path: String, attempts: u32 },

    /// Store file contents could not be (de)serialized.
    #[error("store serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("config error: {0}")]
    Config(String),

    /// Failure raised by the processing capability.
    #[error("processing error: {0}")]
    Processing(String),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;
