//! Error types and handling for Verikad

use thiserror::Error;

use crate::crypto::item::ValidationError;

/// Result type alias for Verikad operations
pub type Result<T> = std::result::Result<T, Error>;

/// Verikad error types
#[derive(Debug, Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Bincode error: {0}")]
    Bincode(#[from] bincode::Error),

    #[error("Cryptographic error: {0}")]
    Crypto(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid data: {0}")]
    InvalidData(String),

    #[error("Item validation failed: {0}")]
    Validation(#[from] ValidationError),

    #[error("No peers available to start the lookup")]
    NoPeers,

    #[error("Lookup deadline elapsed")]
    Timeout,

    #[error("Value not found in the network")]
    ValueNotFound,

    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    #[error("Node engine has shut down")]
    EngineGone,

    #[error("Internal error: {0}")]
    Internal(String),
}
