//! The persisted record of one saga run.

use chrono::{DateTime, Utc};
use common::SagaId;
use serde::{Deserialize, Serialize};
use store::SagaLogEntry;

use crate::checkout::CheckoutFailure;
use crate::error::{Result, SagaError};
use crate::state::{SagaStatus, StepStatus};

/// One step's outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    pub name: String,
    pub status: StepStatus,
    /// What the step produced (IDs, reserved lines, ...).
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// A compensating action that failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompensationError {
    pub step: String,
    pub error: String,
}

/// A saga execution, saved after every step transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SagaExecution {
    pub saga_id: SagaId,
    pub saga_type: String,
    pub status: SagaStatus,
    pub steps: Vec<StepRecord>,
    pub failed_step: Option<String>,
    pub error: Option<String>,
    pub compensated: bool,
    pub compensation_errors: Vec<CompensationError>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl SagaExecution {
    pub fn new(saga_type: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            saga_id: SagaId::new(),
            saga_type: saga_type.into(),
            status: SagaStatus::Running,
            steps: Vec::new(),
            failed_step: None,
            error: None,
            compensated: false,
            compensation_errors: Vec::new(),
            started_at: now,
            finished_at: None,
        }
    }

    pub fn step_started(&mut self, name: &str, now: DateTime<Utc>) {
        self.steps.push(StepRecord {
            name: name.to_string(),
            status: StepStatus::Running,
            result: None,
            error: None,
            started_at: now,
            finished_at: None,
        });
    }

    pub fn step_succeeded(&mut self, name: &str, result: serde_json::Value, now: DateTime<Utc>) {
        if let Some(step) = self.step_mut(name) {
            step.status = StepStatus::Succeeded;
            step.result = Some(result);
            step.finished_at = Some(now);
        }
    }

    /// Records the failure that stops the saga.
    pub fn step_failed(&mut self, name: &str, error: String, now: DateTime<Utc>) {
        if let Some(step) = self.step_mut(name) {
            step.status = StepStatus::Failed;
            step.error = Some(error.clone());
            step.finished_at = Some(now);
        }
        self.failed_step = Some(name.to_string());
        self.error = Some(error);
    }

    /// Moves to compensation. Returns false if the saga is not running.
    pub fn begin_compensation(&mut self) -> bool {
        if !self.status.can_compensate() {
            return false;
        }
        self.status = SagaStatus::Compensating;
        true
    }

    pub fn step_compensated(&mut self, name: &str) {
        if let Some(step) = self.step_mut(name) {
            step.status = StepStatus::Compensated;
        }
    }

    pub fn compensation_failed(&mut self, name: &str, error: String) {
        if let Some(step) = self.step_mut(name) {
            step.status = StepStatus::CompensationFailed;
        }
        self.compensation_errors.push(CompensationError {
            step: name.to_string(),
            error,
        });
    }

    /// Settles the terminal status from what was recorded.
    pub fn finish(&mut self, now: DateTime<Utc>) {
        self.status = match (self.failed_step.is_some(), self.compensation_errors.is_empty()) {
            (false, _) => SagaStatus::Completed,
            (true, true) => SagaStatus::Compensated,
            (true, false) => SagaStatus::CompensationFailed,
        };
        self.compensated = self.status == SagaStatus::Compensated;
        self.finished_at = Some(now);
    }

    pub fn step(&self, name: &str) -> Option<&StepRecord> {
        self.steps.iter().rev().find(|s| s.name == name)
    }

    fn step_mut(&mut self, name: &str) -> Option<&mut StepRecord> {
        self.steps.iter_mut().rev().find(|s| s.name == name)
    }

    pub fn to_log_entry(&self, now: DateTime<Utc>) -> Result<SagaLogEntry> {
        Ok(SagaLogEntry {
            saga_id: self.saga_id,
            saga_type: self.saga_type.clone(),
            status: self.status.as_str().to_string(),
            document: serde_json::to_value(self)?,
            updated_at: now,
        })
    }

    pub fn from_log_entry(entry: SagaLogEntry) -> Result<Self> {
        serde_json::from_value(entry.document).map_err(SagaError::from)
    }

    pub fn to_result(&self) -> SagaResult {
        SagaResult {
            saga_id: self.saga_id,
            status: self.status,
            success: self.status == SagaStatus::Completed,
            failed_step: self.failed_step.clone(),
            error: self.error.clone(),
            compensated: self.compensated,
            compensation_errors: self.compensation_errors.clone(),
            steps: self.steps.clone(),
        }
    }
}

/// What a checkout caller gets back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SagaResult {
    pub saga_id: SagaId,
    pub status: SagaStatus,
    pub success: bool,
    pub failed_step: Option<String>,
    pub error: Option<String>,
    /// True when a failed saga was fully undone.
    pub compensated: bool,
    pub compensation_errors: Vec<CompensationError>,
    pub steps: Vec<StepRecord>,
}

impl SagaResult {
    /// Where to send the customer, if checkout failed.
    ///
    /// A failure that left partial state behind always goes to support,
    /// whichever step failed.
    pub fn failure(&self) -> Option<CheckoutFailure> {
        if self.status == SagaStatus::CompensationFailed {
            return Some(CheckoutFailure::ContactSupport);
        }
        self.failed_step.as_deref().map(CheckoutFailure::from_step)
    }

    /// A string field from a step's result, e.g. `("create_order", "order_id")`.
    pub fn step_output(&self, step: &str, field: &str) -> Option<&str> {
        self.steps
            .iter()
            .find(|s| s.name == step)?
            .result
            .as_ref()?
            .get(field)?
            .as_str()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn successful_run_completes() {
        let now = Utc::now();
        let mut execution = SagaExecution::new("checkout", now);
        execution.step_started("create_order", now);
        execution.step_succeeded("create_order", json!({"order_id": "ORD-1"}), now);
        execution.finish(now);

        let result = execution.to_result();
        assert!(result.success);
        assert!(!result.compensated);
        assert!(result.failure().is_none());
        assert_eq!(result.step_output("create_order", "order_id"), Some("ORD-1"));
    }

    #[test]
    fn failed_run_with_clean_compensation_is_compensated() {
        let now = Utc::now();
        let mut execution = SagaExecution::new("checkout", now);
        execution.step_started("reserve_inventory", now);
        execution.step_succeeded("reserve_inventory", json!([]), now);
        execution.step_started("process_payment", now);
        execution.step_failed("process_payment", "declined".to_string(), now);
        assert!(execution.begin_compensation());
        assert!(!execution.begin_compensation());
        execution.step_compensated("reserve_inventory");
        execution.finish(now);

        assert_eq!(execution.status, SagaStatus::Compensated);
        let result = execution.to_result();
        assert!(!result.success);
        assert!(result.compensated);
        assert_eq!(result.failure(), Some(CheckoutFailure::RetryPayment));
        assert_eq!(
            execution.step("reserve_inventory").unwrap().status,
            StepStatus::Compensated
        );
    }

    #[test]
    fn compensation_errors_are_surfaced() {
        let now = Utc::now();
        let mut execution = SagaExecution::new("checkout", now);
        execution.step_started("create_order", now);
        execution.step_succeeded("create_order", json!({}), now);
        execution.step_started("process_payment", now);
        execution.step_failed("process_payment", "timeout".to_string(), now);
        execution.begin_compensation();
        execution.compensation_failed("create_order", "order service down".to_string());
        execution.finish(now);

        assert_eq!(execution.status, SagaStatus::CompensationFailed);
        assert!(!execution.compensated);
        assert_eq!(execution.compensation_errors.len(), 1);
        assert_eq!(
            execution.to_result().failure(),
            Some(CheckoutFailure::ContactSupport)
        );
    }

    #[test]
    fn log_entry_round_trip() {
        let now = Utc::now();
        let mut execution = SagaExecution::new("checkout", now);
        execution.step_started("validate_cart", now);
        let entry = execution.to_log_entry(now).unwrap();
        assert_eq!(entry.status, "running");
        assert_eq!(SagaExecution::from_log_entry(entry).unwrap(), execution);
    }
}
