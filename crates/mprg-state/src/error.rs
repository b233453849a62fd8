//! Error types for mprg-state

use thiserror::Error;

/// Errors raised while connecting to or preparing the backing database
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

/// Errors surfaced through the [`crate::ReasoningStore`] trait.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    /// The task does not exist in the store
    #[error("task not found: {task_id}")]
    TaskNotFound { task_id: String },

    /// A stored value could not be decoded into its record type
    #[error("stored record is malformed: {0}")]
    Serialization(String),

    /// Invalid content digest
    #[error("invalid digest: {digest}")]
    InvalidDigest { digest: String },

    /// Another orchestrator holds an unexpired lease on the task
    #[error("task {task_id} is leased by another orchestrator")]
    LeaseHeld { task_id: String },

    /// The backing store cannot be reached
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// Backend reported an error while executing an operation
    #[error("storage backend error: {0}")]
    Backend(String),
}

impl From<StateError> for StorageError {
    fn from(err: StateError) -> Self {
        match err {
            StateError::Connection(msg) => StorageError::Unavailable(msg),
            StateError::Serialization(msg) => StorageError::Serialization(msg),
            other => StorageError::Backend(other.to_string()),
        }
    }
}
