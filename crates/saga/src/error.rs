//! Saga error types.

use std::time::Duration;

use common::SagaId;
use reliability::{ErrorKind, ProcessError, TransientKind};
use store::StoreError;
use thiserror::Error;

/// Errors that can occur during saga operations.
#[derive(Debug, Error)]
pub enum SagaError {
    /// A step failed; compensation follows.
    #[error("Saga step '{step}' failed: {source}")]
    StepFailed {
        step: &'static str,
        #[source]
        source: ProcessError,
    },

    /// A step did not finish within its time budget.
    #[error("Saga step '{step}' timed out after {after:?}")]
    StepTimedOut { step: &'static str, after: Duration },

    /// A compensating action failed, leaving partial state behind.
    #[error("Compensation for '{step}' failed: {reason}")]
    CompensationFailed { step: &'static str, reason: String },

    /// The request cannot start a saga at all.
    #[error("Invalid checkout request: {0}")]
    InvalidRequest(String),

    #[error("Saga not found: {0}")]
    NotFound(SagaId),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl SagaError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SagaError::StepFailed { .. } | SagaError::StepTimedOut { .. } => ErrorKind::SagaStep,
            SagaError::CompensationFailed { .. } => ErrorKind::SagaCompensation,
            SagaError::InvalidRequest(_) | SagaError::NotFound(_) => ErrorKind::Validation,
            SagaError::Store(_) => ErrorKind::Transient(TransientKind::Database),
            SagaError::Serialization(_) => ErrorKind::Permanent,
        }
    }
}

/// Convenience type alias for saga results.
pub type Result<T> = std::result::Result<T, SagaError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn step_and_compensation_errors_are_distinct_kinds() {
        let step = SagaError::StepTimedOut {
            step: "process_payment",
            after: Duration::from_secs(10),
        };
        let compensation = SagaError::CompensationFailed {
            step: "reserve_inventory",
            reason: "catalog unavailable".to_string(),
        };
        assert_eq!(step.kind(), ErrorKind::SagaStep);
        assert_eq!(compensation.kind(), ErrorKind::SagaCompensation);
        assert_eq!(
            step.to_string(),
            "Saga step 'process_payment' timed out after 10s"
        );
    }
}
