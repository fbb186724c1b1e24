//! HTTP route handlers.

pub mod admin;
pub mod checkout;
pub mod health;
pub mod messaging;
pub mod metrics;
pub mod payments;

use serde::Serialize;
use store::{ClaimOutcome, NewJob};

use crate::error::ApiError;
use crate::state::AppState;

/// What the ingestion gate did with one event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Admission {
    Accepted,
    Duplicate,
}

/// Claims the event's idempotency key and, if won, enqueues its job.
///
/// The job takes ownership of the claim, so the runner does not claim again.
/// If enqueueing fails the claim is released so a redelivery can retry.
pub(crate) async fn admit(
    state: &AppState,
    hook: &'static str,
    payload: serde_json::Value,
) -> Result<Admission, ApiError> {
    let claim = state.runner.claim_ref(hook, &payload)?;
    ::metrics::counter!("webhook_received_total", "hook" => hook).increment(1);

    match state.claims.claim(&claim.key, claim.scope).await? {
        ClaimOutcome::Claimed => {}
        outcome => {
            tracing::debug!(hook, key = %claim.key, ?outcome, "duplicate webhook");
            ::metrics::counter!("webhook_duplicates_total", "hook" => hook).increment(1);
            return Ok(Admission::Duplicate);
        }
    }

    let job = NewJob::new(hook, payload)
        .run_after(state.clock.now())
        .priority(state.runner.priority(hook))
        .with_claim(claim.clone());
    match state.queue.dispatch_job(job).await {
        Ok(job) => {
            tracing::debug!(hook, job_id = %job.id, "webhook accepted");
            Ok(Admission::Accepted)
        }
        Err(e) => {
            if let Err(release) = state.claims.release(&claim.key, claim.scope).await {
                tracing::warn!(error = %release, key = %claim.key, "failed to release claim");
            }
            Err(e.into())
        }
    }
}
