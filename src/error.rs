//! Error types for trackwire

use thiserror::Error;

/// Main error type for the trackwire library
#[derive(Error, Debug)]
pub enum Error {
    /// Durable storage error (event queue, identity, SDK state)
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration error, detected at initialization
    #[error("configuration error: {0}")]
    Config(String),

    /// The service object was used before `init()`
    #[error("trackwire is not initialized")]
    NotInitialized,

    /// `init()` was called on an already-initialized service
    #[error("trackwire is already initialized")]
    AlreadyInitialized,

    /// Manual session call while automatic session tracking is active
    #[error("conflicting session mode: {0}")]
    ConflictingMode(String),

    /// Transport setup error; per-delivery failures are classified through
    /// [`crate::flush::DeliveryOutcome`] instead
    #[error("transport error: {0}")]
    Transport(String),
}

/// Result type alias for trackwire
pub type Result<T> = std::result::Result<T, Error>;
