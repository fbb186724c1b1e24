//! Saga and step state machines.

use serde::{Deserialize, Serialize};

/// The state of a saga execution.
///
/// State transitions:
/// ```text
/// Running ──┬──► Completed
///           └──► Compensating ──┬──► Compensated
///                               └──► CompensationFailed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SagaStatus {
    /// Steps are being executed.
    #[default]
    Running,

    /// A step failed and compensating actions are in progress.
    Compensating,

    /// All steps succeeded (terminal).
    Completed,

    /// A step failed and every earlier step was undone (terminal).
    Compensated,

    /// A step failed and at least one compensation failed too (terminal).
    /// Needs an operator.
    CompensationFailed,
}

impl SagaStatus {
    /// Returns true if compensation may begin.
    pub fn can_compensate(&self) -> bool {
        matches!(self, SagaStatus::Running)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SagaStatus::Completed | SagaStatus::Compensated | SagaStatus::CompensationFailed
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SagaStatus::Running => "running",
            SagaStatus::Compensating => "compensating",
            SagaStatus::Completed => "completed",
            SagaStatus::Compensated => "compensated",
            SagaStatus::CompensationFailed => "compensation_failed",
        }
    }
}

impl std::fmt::Display for SagaStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// The state of one step within an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Running,
    Succeeded,
    Failed,
    Compensated,
    CompensationFailed,
}

impl StepStatus {
    /// Returns true if the step's effects are in place and may need undoing.
    pub fn needs_compensation(&self) -> bool {
        matches!(self, StepStatus::Succeeded)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StepStatus::Running => "running",
            StepStatus::Succeeded => "succeeded",
            StepStatus::Failed => "failed",
            StepStatus::Compensated => "compensated",
            StepStatus::CompensationFailed => "compensation_failed",
        }
    }
}
