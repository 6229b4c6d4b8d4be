//! Error types for lmsh-state

use thiserror::Error;

/// Errors raised while connecting to or preparing the state database
#[derive(Error, Debug)]
pub enum StateError {
    /// Database connection error
    #[error("Database connection failed: {0}")]
    Connection(String),

    /// Database query error
    #[error("Database query failed: {0}")]
    Query(String),

    /// Serialization error
    #[error("Serialization failed: {0}")]
    Serialization(String),

    /// Schema setup error
    #[error("Schema setup failed: {0}")]
    SchemaSetup(String),

    /// Configuration missing or malformed
    #[error("Invalid store configuration: {0}")]
    Config(String),
}

impl From<surrealdb::Error> for StateError {
    fn from(err: surrealdb::Error) -> Self {
        StateError::Query(err.to_string())
    }
}

impl From<serde_json::Error> for StateError {
    fn from(err: serde_json::Error) -> Self {
        StateError::Serialization(err.to_string())
    }
}

/// Errors returned by `StateStore` operations
#[derive(Error, Debug)]
pub enum StorageError {
    /// A record was written under a key it does not describe
    #[error("record key {actual} does not match storage key {expected}")]
    KeyMismatch { expected: String, actual: String },

    /// A digest string is not 64 hex characters
    #[error("invalid config digest: {digest}")]
    InvalidDigest { digest: String },

    /// A stored key could not be parsed
    #[error("invalid entity key: {key}")]
    InvalidKey { key: String },

    /// Record (de)serialization failed
    #[error("serialization failed: {0}")]
    Serialization(String),

    /// Backend failure (database unreachable, query rejected, ...)
    #[error("storage backend error: {0}")]
    Backend(String),
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::Serialization(err.to_string())
    }
}

impl From<StateError> for StorageError {
    fn from(err: StateError) -> Self {
        StorageError::Backend(err.to_string())
    }
}
