//! Unified error handling for the orchestration core.

use thiserror::Error;

pub type TaskerResult<T> = Result<T, TaskerError>;

/// Error kinds the core can raise, plus the ambient variants every layer
/// in the stack needs (serialization, configuration, internal invariant
/// violations).
#[derive(Debug, Error)]
pub enum TaskerError {
    /// Raised at CLI compile time only; never at execution.
    #[error("ParseError: {0}")]
    ParseError(String),

    #[error("NotFound: {0}")]
    NotFound(String),

    /// Attempt to start a descriptor already running under `Skip` policy.
    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    /// A worker returned an error; triggers WorkerTaskQueue retry policy.
    #[error("WorkerFailure: {0}")]
    WorkerFailure(String),

    #[error("ExternalFailure: {0}")]
    ExternalFailure(String),

    #[error("Cancelled: {0}")]
    Cancelled(String),

    #[error("SerializationError: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("ConfigError: {0}")]
    ConfigError(String),

    #[error("Internal: {0}")]
    Internal(String),
}

impl TaskerError {
    /// The error-kind label the CLI renders as `"{kind}: {message}"`.
    pub fn kind(&self) -> &'static str {
        match self {
            TaskerError::ParseError(_) => "ParseError",
            TaskerError::NotFound(_) => "NotFound",
            TaskerError::Conflict(_) => "Conflict",
            TaskerError::Timeout(_) => "Timeout",
            TaskerError::WorkerFailure(_) => "WorkerFailure",
            TaskerError::ExternalFailure(_) => "ExternalFailure",
            TaskerError::Cancelled(_) => "Cancelled",
            TaskerError::SerializationError(_) => "SerializationError",
            TaskerError::ConfigError(_) => "ConfigError",
            TaskerError::Internal(_) => "Internal",
        }
    }

    /// Whether retrying the operation that produced this error is worthwhile.
    /// Used by WorkerTaskQueue retry and the CLI `http` stage's retry loop.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            TaskerError::Timeout(_) | TaskerError::WorkerFailure(_) | TaskerError::ExternalFailure(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_labels_match_variant_names() {
        assert_eq!(TaskerError::ParseError("x".into()).kind(), "ParseError");
        assert_eq!(TaskerError::Conflict("x".into()).kind(), "Conflict");
        assert_eq!(TaskerError::Cancelled("x".into()).kind(), "Cancelled");
    }

    #[test]
    fn display_prefixes_the_kind() {
        let err = TaskerError::NotFound("job xyz".into());
        assert_eq!(err.to_string(), "NotFound: job xyz");
    }

    #[test]
    fn recoverable_kinds() {
        assert!(TaskerError::Timeout("t".into()).is_recoverable());
        assert!(TaskerError::WorkerFailure("w".into()).is_recoverable());
        assert!(!TaskerError::ParseError("p".into()).is_recoverable());
        assert!(!TaskerError::Conflict("c".into()).is_recoverable());
    }

    #[test]
    fn from_serde_json_error() {
        let json_err = serde_json::from_str::<serde_json::Value>("{bad}").unwrap_err();
        let err: TaskerError = json_err.into();
        assert_eq!(err.kind(), "SerializationError");
    }
}
