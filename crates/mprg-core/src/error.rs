//! Error taxonomy for the reasoning pipeline.
//!
//! Per-run failures are not errors: they are carried as [`AgentOutcome`]
//! values and end up on the run record. Only task-level failures surface as
//! [`MprgError`].

use mprg_state::{ReasoningSummary, StorageError};

/// Task-level errors of the pipeline.
#[derive(Debug, thiserror::Error)]
pub enum MprgError {
    #[error("persistence error: {0}")]
    Persistence(#[from] StorageError),

    #[error("embedding failed: {0}")]
    Embedding(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("task not found: {0}")]
    TaskNotFound(String),

    #[error("task {task_id} is already {status}")]
    TaskTerminal { task_id: String, status: String },

    #[error("all {attempted} agents failed at the transport level")]
    AllAgentsUnreachable { attempted: usize },

    /// The reasoning provider cannot be called at all. Nothing was written
    /// for the affected slots and the task keeps its status.
    #[error("reasoning provider unavailable: {0}")]
    ProviderUnavailable(String),

    #[error("aborted")]
    Aborted,

    #[error("agent slot {run_index} terminated without a result: {detail}")]
    SlotLost { run_index: u32, detail: String },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type for pipeline operations.
pub type Result<T> = std::result::Result<T, MprgError>;

/// Transport-level failure of a provider call.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ProviderError {
    #[error("call timed out after {0}s")]
    Timeout(u64),

    #[error("request failed: {0}")]
    Http(String),

    #[error("provider returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("could not decode provider response: {0}")]
    Decode(String),

    #[error("API key not set ({0})")]
    MissingApiKey(&'static str),
}

impl ProviderError {
    /// Failures no retry can fix: the provider is not configured.
    pub fn is_configuration(&self) -> bool {
        matches!(self, ProviderError::MissingApiKey(_))
    }
}

/// Outcome of one validated agent attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum AgentOutcome {
    Valid(ReasoningSummary),
    SchemaError(String),
    TransportError(String),
}

impl AgentOutcome {
    pub fn is_valid(&self) -> bool {
        matches!(self, AgentOutcome::Valid(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_errors_convert_into_persistence() {
        let err: MprgError = StorageError::Unavailable("down".to_string()).into();
        assert!(matches!(err, MprgError::Persistence(_)));
        assert!(err.to_string().contains("store unavailable: down"));
    }

    #[test]
    fn provider_error_messages() {
        assert_eq!(
            ProviderError::Timeout(60).to_string(),
            "call timed out after 60s"
        );
        let err = ProviderError::Status {
            status: 429,
            body: "rate limited".to_string(),
        };
        assert!(err.to_string().contains("429"));
        assert_eq!(
            ProviderError::MissingApiKey("ANTHROPIC_API_KEY").to_string(),
            "API key not set (ANTHROPIC_API_KEY)"
        );
    }

    #[test]
    fn only_missing_keys_are_configuration_failures() {
        assert!(ProviderError::MissingApiKey("OPENAI_API_KEY").is_configuration());
        assert!(!ProviderError::Timeout(5).is_configuration());
        assert!(!ProviderError::Http("reset".into()).is_configuration());
    }
}
