//! Error taxonomy for the orchestration kernel

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Why a single attempt of a task's work failed.
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum TaskFailure {
    /// Network errors, 5xx responses and other conditions worth retrying.
    #[error("transient failure: {0}")]
    Transient(String),
    /// Malformed input, 4xx responses. Never retried.
    #[error("permanent failure: {0}")]
    Permanent(String),
    /// The attempt ran past its timeout.
    #[error("attempt timed out after {}ms", .0.as_millis())]
    TimedOut(Duration),
}

impl TaskFailure {
    pub fn transient(detail: impl fmt::Display) -> Self {
        Self::Transient(detail.to_string())
    }

    pub fn permanent(detail: impl fmt::Display) -> Self {
        Self::Permanent(detail.to_string())
    }

    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Permanent(_))
    }
}

/// Returned once a task has used up its attempts.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{cause} (after {attempts} attempt(s))")]
pub struct FinalFailure {
    pub cause: TaskFailure,
    pub attempts: u32,
}

/// Cache store failures. Callers treat every variant as a miss.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache unavailable: {0}")]
    Unavailable(String),
    #[error("cache entry could not be decoded: {0}")]
    Encoding(#[from] serde_json::Error),
}

impl From<rusqlite::Error> for CacheError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Unavailable(e.to_string())
    }
}

/// Invalid flow definitions or invocations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FlowError {
    #[error("flow '{0}' has no steps")]
    Empty(String),
    #[error("duplicate step name: {0}")]
    DuplicateStep(String),
    #[error("step '{step}' references '{reference}', which is not an earlier step")]
    UnknownStep { step: String, reference: String },
    #[error("step '{step}' reads argument '{arg}', which the flow does not declare")]
    UnknownArgument { step: String, arg: String },
    #[error("output step '{0}' is not declared")]
    UnknownOutput(String),
    #[error("missing flow argument: {0}")]
    MissingArgument(String),
}

/// Artifact persistence failures.
#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error("failed to write artifact '{key}': {source}")]
    Io {
        key: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to encode artifact '{key}': {source}")]
    Encoding {
        key: String,
        #[source]
        source: serde_json::Error,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_display() {
        assert_eq!(
            TaskFailure::transient("HTTP 503").to_string(),
            "transient failure: HTTP 503"
        );
        assert_eq!(
            TaskFailure::TimedOut(Duration::from_millis(250)).to_string(),
            "attempt timed out after 250ms"
        );

        let final_failure = FinalFailure {
            cause: TaskFailure::permanent("bad shape"),
            attempts: 3,
        };
        assert_eq!(
            final_failure.to_string(),
            "permanent failure: bad shape (after 3 attempt(s))"
        );
    }

    #[test]
    fn test_retryable_classification() {
        assert!(TaskFailure::transient("x").is_retryable());
        assert!(TaskFailure::TimedOut(Duration::from_secs(1)).is_retryable());
        assert!(!TaskFailure::permanent("x").is_retryable());
    }

    #[test]
    fn test_failure_serializes_tagged() {
        let json = serde_json::to_value(TaskFailure::permanent("HTTP 404")).unwrap();
        assert_eq!(json["kind"], "permanent");
        assert_eq!(json["detail"], "HTTP 404");
    }
}
