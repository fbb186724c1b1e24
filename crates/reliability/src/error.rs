//! Failure taxonomy for job processing and saga steps.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use store::StoreError;
use thiserror::Error;

/// Sub-classification of retryable failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransientKind {
    Network,
    Timeout,
    Database,
    RateLimited,
}

impl TransientKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransientKind::Network => "network",
            TransientKind::Timeout => "timeout",
            TransientKind::Database => "database",
            TransientKind::RateLimited => "rate_limited",
        }
    }
}

/// The kind of a failure. Retry and breaker decisions are functions of this alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "detail")]
pub enum ErrorKind {
    /// Malformed or incomplete input. Never retried.
    Validation,
    /// Network, timeout, database or rate-limit failure. Retried with backoff.
    Transient(TransientKind),
    /// A downstream refusal that will not change on retry.
    Permanent,
    /// The work was already done elsewhere. Not a failure.
    AlreadyProcessed,
    /// The downstream circuit is open; the breaker governs the wait.
    CircuitOpen,
    /// A saga step failed and triggered compensation.
    SagaStep,
    /// A compensation failed, leaving partial state behind.
    SagaCompensation,
}

impl ErrorKind {
    /// Returns true if the runner should schedule another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorKind::Transient(_))
    }

    /// Returns true if the failure counts against the downstream service's breaker.
    ///
    /// Permanent refusals such as card declines come from a healthy downstream
    /// and never count.
    pub fn is_downstream_failure(&self) -> bool {
        matches!(
            self,
            ErrorKind::Transient(
                TransientKind::Network | TransientKind::Timeout | TransientKind::RateLimited
            )
        )
    }

    /// Stable label used in dead letters and metrics.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Validation => "validation",
            ErrorKind::Transient(kind) => kind.as_str(),
            ErrorKind::Permanent => "permanent",
            ErrorKind::AlreadyProcessed => "already_processed",
            ErrorKind::CircuitOpen => "circuit_open",
            ErrorKind::SagaStep => "saga_step",
            ErrorKind::SagaCompensation => "saga_compensation",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors returned by processors and downstream collaborators.
#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Transient {} failure: {message}", kind.as_str())]
    Transient {
        kind: TransientKind,
        message: String,
    },

    #[error("Permanent failure: {0}")]
    Permanent(String),

    #[error("Already processed")]
    AlreadyProcessed,

    #[error("Circuit open for {service}")]
    CircuitOpen {
        service: String,
        retry_after: Option<DateTime<Utc>>,
    },

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

impl ProcessError {
    pub fn validation(message: impl Into<String>) -> Self {
        ProcessError::Validation(message.into())
    }

    pub fn network(message: impl Into<String>) -> Self {
        ProcessError::Transient {
            kind: TransientKind::Network,
            message: message.into(),
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        ProcessError::Transient {
            kind: TransientKind::Timeout,
            message: message.into(),
        }
    }

    pub fn rate_limited(message: impl Into<String>) -> Self {
        ProcessError::Transient {
            kind: TransientKind::RateLimited,
            message: message.into(),
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        ProcessError::Permanent(message.into())
    }

    /// Classifies the error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            ProcessError::Validation(_) => ErrorKind::Validation,
            ProcessError::Transient { kind, .. } => ErrorKind::Transient(*kind),
            ProcessError::Permanent(_) => ErrorKind::Permanent,
            ProcessError::AlreadyProcessed => ErrorKind::AlreadyProcessed,
            ProcessError::CircuitOpen { .. } => ErrorKind::CircuitOpen,
            ProcessError::Store(_) => ErrorKind::Transient(TransientKind::Database),
        }
    }
}

pub type Result<T> = std::result::Result<T, ProcessError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_transient_errors_are_retryable() {
        assert!(ProcessError::network("reset").kind().is_retryable());
        assert!(ProcessError::timeout("slow").kind().is_retryable());
        assert!(ProcessError::rate_limited("429").kind().is_retryable());
        assert!(!ProcessError::validation("missing id").kind().is_retryable());
        assert!(!ProcessError::permanent("bad token").kind().is_retryable());
        assert!(!ProcessError::AlreadyProcessed.kind().is_retryable());
    }

    #[test]
    fn store_errors_are_transient_database_failures() {
        let err: ProcessError = StoreError::NotFound {
            entity: "job",
            id: "1".to_string(),
        }
        .into();
        assert_eq!(err.kind(), ErrorKind::Transient(TransientKind::Database));
        assert!(!err.kind().is_downstream_failure());
    }

    #[test]
    fn downstream_attribution() {
        assert!(ProcessError::network("x").kind().is_downstream_failure());
        assert!(!ProcessError::permanent("card declined").kind().is_downstream_failure());
        assert!(!ProcessError::validation("x").kind().is_downstream_failure());
        assert!(
            !ProcessError::CircuitOpen {
                service: "messaging".to_string(),
                retry_after: None,
            }
            .kind()
            .is_downstream_failure()
        );
    }

    #[test]
    fn labels() {
        assert_eq!(ErrorKind::Validation.as_str(), "validation");
        assert_eq!(
            ErrorKind::Transient(TransientKind::RateLimited).to_string(),
            "rate_limited"
        );
    }
}
