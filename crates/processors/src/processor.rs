//! The contract every queued event type implements.

use std::sync::Arc;

use async_trait::async_trait;
use reliability::{CircuitBreaker, ProcessError, Result};
use store::IdempotencyScope;

/// Attempt budget for processors that do not override [`QueueProcessor::max_retries`].
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Queue priority of jobs whose processor does not override [`QueueProcessor::priority`].
pub const NORMAL_PRIORITY: i32 = 0;

/// Queue priority for customer-facing work that should jump routine jobs.
pub const HIGH_PRIORITY: i32 = 10;

/// What a successful `process` call did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// The side effects ran.
    Completed,
    /// Nothing was done on purpose (opt-out, quiet hours, ...). Not retried.
    Skipped(String),
}

/// Handles one kind of queued job.
///
/// The [`ProcessorRunner`](crate::ProcessorRunner) owns idempotency, retries,
/// breaker bookkeeping and dead-lettering; implementors only describe the
/// work and how their failures should be treated.
#[async_trait]
pub trait QueueProcessor: Send + Sync {
    /// Human-readable name for logs.
    fn name(&self) -> &'static str;

    /// The job hook this processor handles.
    fn hook_name(&self) -> &'static str;

    /// Namespace of the idempotency keys this processor derives.
    fn scope(&self) -> IdempotencyScope;

    /// Derives the idempotency key from the payload.
    ///
    /// Must be a validation error when the payload lacks the fields the key
    /// is built from.
    fn idempotency_key(&self, payload: &serde_json::Value) -> Result<String>;

    /// Checks whether the job should be skipped before any downstream call
    /// (and before the circuit breaker is consulted).
    async fn skip_reason(&self, _payload: &serde_json::Value) -> Result<Option<String>> {
        Ok(None)
    }

    /// Performs the work.
    async fn process(&self, payload: &serde_json::Value) -> Result<ProcessOutcome>;

    /// Returns true if `error` should be retried.
    fn should_retry(&self, error: &ProcessError) -> bool {
        error.kind().is_retryable()
    }

    /// Total attempts before the job is dead-lettered.
    fn max_retries(&self) -> u32 {
        DEFAULT_MAX_RETRIES
    }

    /// Queue priority of this processor's jobs. Higher runs first among jobs
    /// due at the same time.
    fn priority(&self) -> i32 {
        NORMAL_PRIORITY
    }

    /// The breaker guarding this processor's downstream service, if any.
    fn circuit_breaker(&self) -> Option<Arc<CircuitBreaker>> {
        None
    }

    /// Returns true if the downstream circuit rejects calls right now.
    ///
    /// A half-open breaker admits one trial per cooldown, so a `false`
    /// answer must be followed by a call whose result is reported back.
    fn is_circuit_open(&self) -> bool {
        self.circuit_breaker().is_some_and(|b| !b.is_available())
    }
}

/// Reads a required string field from a JSON payload.
pub(crate) fn required_str<'a>(payload: &'a serde_json::Value, field: &str) -> Result<&'a str> {
    payload
        .get(field)
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| ProcessError::validation(format!("missing field `{field}`")))
}

/// Deserializes a payload into a typed event, mapping failures to validation errors.
pub(crate) fn parse_payload<T: serde::de::DeserializeOwned>(
    payload: &serde_json::Value,
) -> Result<T> {
    serde_json::from_value(payload.clone()).map_err(|e| ProcessError::validation(e.to_string()))
}
