//! Error types for sixtun

use thiserror::Error;

/// Result type alias using the sixtun Error
pub type Result<T> = std::result::Result<T, Error>;

/// Sixtun error types
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid IPv6 prefix: {0}")]
    InvalidPrefix(String),

    #[error("Base prefix must be /{expected}, got /{got}")]
    WrongMaskLength { expected: u8, got: u8 },

    #[error("Invalid user id: {0}")]
    InvalidUserId(String),

    #[error("Could not allocate a unique prefix after {attempts} attempts")]
    AllocationExhausted { attempts: u32 },

    #[error("Limit of {limit} active tunnels per user has been reached")]
    TunnelLimitReached { limit: u32 },

    #[error("Generated address failed validation: {0}")]
    AddressValidationFailed(String),

    #[error("Command failed: {command} ({output})")]
    CommandExecutionFailed { command: String, output: String },

    #[error("Resource not found: {kind} with id {id}")]
    NotFound { kind: String, id: String },

    #[error("Network error: {0}")]
    Network(String),

    #[error("Crypto error: {0}")]
    Crypto(String),
}
