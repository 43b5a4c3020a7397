//! Error types for the timeline inspector.
//!
//! All errors are strongly typed using thiserror. Rule-domain failures are
//! values (they end up in an observable cell), engine-domain failures are
//! returned to the caller that can act on them.

use thiserror::Error;

use crate::message::{RuleId, SessionId};

/// Validation errors raised for malformed configuration or arguments.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("Field '{field}' must be greater than zero")]
    ZeroSize {
        field: String,
    },

    #[error("Prefetch tolerance {tolerance} must be less than half the page size {page_size}")]
    ToleranceTooLarge {
        tolerance: usize,
        page_size: usize,
    },

    #[error("At least {min} page buffers are required, got {actual}")]
    TooFewPages {
        min: usize,
        actual: usize,
    },

    #[error("Worker pool allows {actual} workers, at least {min} are required")]
    PoolTooSmall {
        min: usize,
        actual: usize,
    },

    #[error("Invalid sequence range: end ({end}) is before start ({start})")]
    InvalidRange {
        start: u64,
        end: u64,
    },

    #[error("Invalid configuration: {reason}")]
    InvalidConfig {
        reason: String,
    },
}

/// Errors reported by a message source.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SourceError {
    #[error("Session not found: {session}")]
    SessionNotFound {
        session: SessionId,
    },

    #[error("Message stream disconnected: {path}")]
    Disconnected {
        path: String,
    },

    #[error("Message source backend error: {message}")]
    Backend {
        message: String,
    },
}

/// Why a (session, rule) evaluation did not succeed.
///
/// This is what the error-cause cell of an evaluation holds.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EvaluationError {
    /// The rule itself signaled failure.
    #[error("Rule '{rule}' failed on session '{session}': {reason}")]
    RuleFailed {
        session: SessionId,
        rule: RuleId,
        reason: String,
    },

    /// The rule terminated in a shape the engine cannot interpret.
    #[error("Rule '{rule}' violated the termination contract on session '{session}': {detail}")]
    ContractViolation {
        session: SessionId,
        rule: RuleId,
        detail: String,
    },

    /// The session's message stream could not be opened.
    #[error("Could not subscribe rule '{rule}' to session '{session}': {source}")]
    Source {
        session: SessionId,
        rule: RuleId,
        #[source]
        source: SourceError,
    },

    /// The evaluation could not be started on the worker pool.
    #[error("Could not schedule rule '{rule}' on session '{session}': {source}")]
    Unscheduled {
        session: SessionId,
        rule: RuleId,
        #[source]
        source: ExecutionError,
    },
}

impl EvaluationError {
    /// Returns true if the rule reported this failure itself.
    #[must_use]
    pub const fn is_rule_failure(&self) -> bool {
        matches!(self, Self::RuleFailed { .. })
    }

    /// Returns true if this is an engine contract violation.
    #[must_use]
    pub const fn is_contract_violation(&self) -> bool {
        matches!(self, Self::ContractViolation { .. })
    }
}

/// Errors raised by the windowed message cache.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CacheError {
    #[error("Index {index} is out of range (size {size})")]
    IndexOutOfRange {
        index: usize,
        size: usize,
    },

    #[error("Failed to fetch page {page}: {source}")]
    Fetch {
        page: usize,
        #[source]
        source: SourceError,
    },

    #[error("Page {page} does not contain index {index} (fetched {fetched} messages)")]
    ShortPage {
        page: usize,
        index: usize,
        fetched: usize,
    },
}

/// Errors raised by the worker pool.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExecutionError {
    #[error("Job queue '{pool}' is full (capacity: {capacity})")]
    QueueFull {
        pool: String,
        capacity: usize,
    },

    #[error("Worker pool '{pool}' has no free worker (max_workers: {max_workers})")]
    Saturated {
        pool: String,
        max_workers: usize,
    },

    #[error("Worker pool '{pool}' is disconnected")]
    Disconnected {
        pool: String,
    },

    #[error("Job timed out after {duration_ms}ms")]
    Timeout {
        duration_ms: u64,
    },

    #[error("Failed to spawn a worker for pool '{pool}': {reason}")]
    SpawnFailed {
        pool: String,
        reason: String,
    },

    #[error("Job on pool '{pool}' panicked")]
    Panicked {
        pool: String,
    },
}

/// Top-level error type.
#[derive(Debug, Error)]
pub enum InspectorError {
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Source error: {0}")]
    Source(#[from] SourceError),

    #[error("Evaluation error: {0}")]
    Evaluation(#[from] EvaluationError),

    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("Execution error: {0}")]
    Execution(#[from] ExecutionError),

    #[error("Internal error: {message}")]
    Internal {
        message: String,
    },
}

impl InspectorError {
    /// Creates an internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Returns true if this is a validation error.
    #[must_use]
    pub const fn is_validation(&self) -> bool {
        matches!(self, Self::Validation(_))
    }

    /// Returns true if this is a cache error.
    #[must_use]
    pub const fn is_cache(&self) -> bool {
        matches!(self, Self::Cache(_))
    }

    /// Returns true if this is an internal error.
    #[must_use]
    pub const fn is_internal(&self) -> bool {
        matches!(self, Self::Internal { .. })
    }

    /// Returns true if this error is retryable.
    ///
    /// Evaluation errors are never retryable: a repeated request for the same
    /// pair returns the same cached outcome.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Validation(_) | Self::Evaluation(_) | Self::Internal { .. } => false,
            Self::Source(e) => matches!(e, SourceError::Disconnected { .. }),
            Self::Cache(e) => matches!(
                e,
                CacheError::Fetch {
                    source: SourceError::Disconnected { .. },
                    ..
                }
            ),
            Self::Execution(e) => matches!(
                e,
                ExecutionError::Timeout { .. } | ExecutionError::QueueFull { .. } | ExecutionError::Saturated { .. }
            ),
        }
    }
}

/// Result type alias for inspector operations.
pub type InspectorResult<T> = Result<T, InspectorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_error_tolerance() {
        let err = ValidationError::ToleranceTooLarge {
            tolerance: 1500,
            page_size: 2048,
        };
        let msg = format!("{err}");
        assert!(msg.contains("1500"));
        assert!(msg.contains("2048"));
    }

    #[test]
    fn test_evaluation_error_rule_failed() {
        let err = EvaluationError::RuleFailed {
            session: SessionId::new("s1"),
            rule: RuleId::new("no-overflow"),
            reason: "queue overflowed".to_string(),
        };
        assert!(err.is_rule_failure());
        assert!(!err.is_contract_violation());
        let msg = format!("{err}");
        assert!(msg.contains("no-overflow"));
        assert!(msg.contains("queue overflowed"));
    }

    #[test]
    fn test_cache_error_fetch_carries_source() {
        let err = CacheError::Fetch {
            page: 3,
            source: SourceError::Backend {
                message: "disk gone".to_string(),
            },
        };
        let msg = format!("{err}");
        assert!(msg.contains("page 3"));
        assert!(msg.contains("disk gone"));
    }

    #[test]
    fn test_inspector_error_from_validation() {
        let err: InspectorError = ValidationError::ZeroSize {
            field: "page_size".to_string(),
        }
        .into();
        assert!(err.is_validation());
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_inspector_error_retryable() {
        let err1: InspectorError = EvaluationError::ContractViolation {
            session: SessionId::new("s"),
            rule: RuleId::new("r"),
            detail: "panicked".to_string(),
        }
        .into();
        assert!(!err1.is_retryable());

        let err2: InspectorError = CacheError::Fetch {
            page: 0,
            source: SourceError::Disconnected {
                path: "replay".to_string(),
            },
        }
        .into();
        assert!(err2.is_cache());
        assert!(err2.is_retryable());

        let err3: InspectorError = ExecutionError::Timeout { duration_ms: 10 }.into();
        assert!(err3.is_retryable());
    }

    #[test]
    fn test_inspector_error_internal() {
        let err = InspectorError::internal("unexpected state");
        assert!(err.is_internal());
        assert!(format!("{err}").contains("unexpected state"));
    }
}
