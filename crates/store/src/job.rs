//! Queued work items and dead-letter records.

use chrono::{DateTime, Utc};
use common::{DeadLetterId, JobId};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::idempotency::ClaimRef;

/// Default attempt budget for a job when the dispatcher does not specify one.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Lifecycle of a job.
///
/// ```text
/// Pending ──► Running ──┬──► Done
///    ▲                  ├──► Dead
///    └──────────────────┘ (rescheduled)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Done,
    Dead,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Done => "done",
            JobStatus::Dead => "dead",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(JobStatus::Pending),
            "running" => Some(JobStatus::Running),
            "done" => Some(JobStatus::Done),
            "dead" => Some(JobStatus::Dead),
            _ => None,
        }
    }

    /// Returns true for `Done` and `Dead`.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Done | JobStatus::Dead)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A queued unit of work for a named hook.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub hook_name: String,
    pub payload: serde_json::Value,
    /// Higher runs first among due jobs.
    pub priority: i32,
    pub attempt_count: u32,
    pub max_attempts: u32,
    pub run_after: DateTime<Utc>,
    pub status: JobStatus,
    /// Idempotency claim owned by this job, if any.
    pub claim: Option<ClaimRef>,
    /// Token of the worker currently running the job. Issued by `claim_due`,
    /// cleared when the job leaves `Running`.
    #[serde(default)]
    pub lease: Option<Uuid>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// Returns true if another attempt fits in the budget.
    pub fn has_attempts_left(&self) -> bool {
        self.attempt_count < self.max_attempts
    }

    /// Returns true if the job is pending and due at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Pending && self.run_after <= now
    }
}

/// Parameters for enqueueing a job.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub hook_name: String,
    pub payload: serde_json::Value,
    pub priority: i32,
    pub max_attempts: u32,
    pub run_after: DateTime<Utc>,
    pub claim: Option<ClaimRef>,
}

impl NewJob {
    /// A job due immediately with default priority and attempt budget.
    pub fn new(hook_name: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            hook_name: hook_name.into(),
            payload,
            priority: 0,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            run_after: Utc::now(),
            claim: None,
        }
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn run_after(mut self, at: DateTime<Utc>) -> Self {
        self.run_after = at;
        self
    }

    /// Attaches a claim already won by the caller; the job becomes its owner.
    pub fn with_claim(mut self, claim: ClaimRef) -> Self {
        self.claim = Some(claim);
        self
    }

    /// Materializes the job at `now`.
    pub fn into_job(self, now: DateTime<Utc>) -> Job {
        Job {
            id: JobId::new(),
            hook_name: self.hook_name,
            payload: self.payload,
            priority: self.priority,
            attempt_count: 0,
            max_attempts: self.max_attempts,
            run_after: self.run_after,
            status: JobStatus::Pending,
            claim: self.claim,
            lease: None,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// A job that exhausted its retries or failed permanently.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetter {
    pub id: DeadLetterId,
    pub job_id: JobId,
    pub hook_name: String,
    pub payload: serde_json::Value,
    pub attempt_count: u32,
    pub error: String,
    /// Error classification (`validation`, `transient`, ...).
    pub error_kind: String,
    pub dead_lettered_at: DateTime<Utc>,
    pub replayed_at: Option<DateTime<Utc>>,
    pub replay_job_id: Option<JobId>,
}

impl DeadLetter {
    /// Builds a record for a job that is being moved to the dead-letter store.
    pub fn from_job(
        job: &Job,
        error: impl Into<String>,
        error_kind: impl Into<String>,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: DeadLetterId::new(),
            job_id: job.id,
            hook_name: job.hook_name.clone(),
            payload: job.payload.clone(),
            attempt_count: job.attempt_count,
            error: error.into(),
            error_kind: error_kind.into(),
            dead_lettered_at: at,
            replayed_at: None,
            replay_job_id: None,
        }
    }

    pub fn is_replayed(&self) -> bool {
        self.replayed_at.is_some()
    }
}

/// Filter for listing dead letters.
#[derive(Debug, Clone)]
pub struct DeadLetterQuery {
    pub hook_name: Option<String>,
    pub include_replayed: bool,
    pub limit: usize,
}

impl Default for DeadLetterQuery {
    fn default() -> Self {
        Self {
            hook_name: None,
            include_replayed: false,
            limit: 100,
        }
    }
}

impl DeadLetterQuery {
    pub fn matches(&self, record: &DeadLetter) -> bool {
        if let Some(ref hook) = self.hook_name
            && &record.hook_name != hook
        {
            return false;
        }
        self.include_replayed || !record.is_replayed()
    }
}
