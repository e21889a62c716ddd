//! Error types for the Sluice service.

use thiserror::Error;

use crate::sink::SinkError;
use crate::store::StoreError;

/// Main error type for Sluice operations.
#[derive(Error, Debug)]
pub enum SluiceError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Shared store errors (connectivity, protocol)
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Publish sink errors
    #[error("Sink error: {0}")]
    Sink(#[from] SinkError),

    /// The log transaction kept losing the optimistic race
    #[error("Transaction contention: gave up after {attempts} attempts")]
    Contention { attempts: u32 },

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for Sluice operations.
pub type Result<T> = std::result::Result<T, SluiceError>;
