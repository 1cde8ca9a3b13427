//! Error types for the v2note gateway

use thiserror::Error;

/// Result type alias for gateway operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the gateway
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Speech recognition error
    #[error("ASR error: {0}")]
    Asr(String),

    /// Completion service error
    #[error("{0}")]
    Llm(String),

    /// Tool server error
    #[error("{0}")]
    Tool(String),

    /// Skill error
    #[error("skill error: {0}")]
    Skill(String),

    /// Malformed control frame
    #[error("{0}")]
    Protocol(String),

    /// Session state error (e.g. no active chat)
    #[error("{0}")]
    Session(String),

    /// Resource not found
    #[error("not found: {0}")]
    NotFound(String),

    /// Database error
    #[error("database error: {0}")]
    Database(String),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP error
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// TOML parsing error
    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),

    /// `SQLite` error
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}
