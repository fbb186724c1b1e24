//! Job dispatch and dead-letter inspection.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use common::{Clock, DeadLetterId, JobId, SystemClock};
use reliability::{ProcessError, Result};
use store::{
    DeadLetter, DeadLetterQuery, DeadLetterStore, Job, JobStatus, JobStore, NewJob, StoreError,
};

use crate::processor::NORMAL_PRIORITY;

/// Dispatches jobs onto the queue.
#[derive(Clone)]
pub struct JobQueue {
    jobs: Arc<dyn JobStore>,
    clock: Arc<dyn Clock>,
    priorities: Arc<RwLock<HashMap<String, i32>>>,
}

impl JobQueue {
    pub fn new(jobs: Arc<dyn JobStore>) -> Self {
        Self::with_clock(jobs, Arc::new(SystemClock))
    }

    pub fn with_clock(jobs: Arc<dyn JobStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            jobs,
            clock,
            priorities: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Sets the priority `dispatch` gives jobs for `hook_name`. Clones of this
    /// queue see the change.
    pub fn set_priority(&self, hook_name: &str, priority: i32) {
        self.priorities
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(hook_name.to_string(), priority);
    }

    pub fn priority_of(&self, hook_name: &str) -> i32 {
        self.priorities
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(hook_name)
            .copied()
            .unwrap_or(NORMAL_PRIORITY)
    }

    /// Enqueues `payload` for `hook_name`, due after `delay`, at the hook's
    /// priority.
    #[tracing::instrument(skip(self, payload))]
    pub async fn dispatch(
        &self,
        hook_name: &str,
        payload: serde_json::Value,
        delay: Duration,
    ) -> Result<Job> {
        let run_after = self.clock.now()
            + chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::zero());
        let priority = self.priority_of(hook_name);
        self.dispatch_job(
            NewJob::new(hook_name, payload)
                .run_after(run_after)
                .priority(priority),
        )
        .await
    }

    /// Enqueues a fully specified job.
    pub async fn dispatch_job(&self, job: NewJob) -> Result<Job> {
        let job = self.jobs.enqueue(job).await?;
        tracing::debug!(job_id = %job.id, hook = %job.hook_name, "job dispatched");
        Ok(job)
    }

    /// Returns true if an identical job is pending or running.
    pub async fn is_scheduled(&self, hook_name: &str, payload: &serde_json::Value) -> Result<bool> {
        Ok(self.jobs.find_scheduled(hook_name, payload).await?.is_some())
    }

    pub async fn get(&self, id: JobId) -> Result<Option<Job>> {
        Ok(self.jobs.get(id).await?)
    }
}

/// Inspection and manual replay of dead-lettered jobs.
#[derive(Clone)]
pub struct DeadLetterQueue {
    dead_letters: Arc<dyn DeadLetterStore>,
    jobs: Arc<dyn JobStore>,
    clock: Arc<dyn Clock>,
}

impl DeadLetterQueue {
    pub fn new(dead_letters: Arc<dyn DeadLetterStore>, jobs: Arc<dyn JobStore>) -> Self {
        Self::with_clock(dead_letters, jobs, Arc::new(SystemClock))
    }

    pub fn with_clock(
        dead_letters: Arc<dyn DeadLetterStore>,
        jobs: Arc<dyn JobStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            dead_letters,
            jobs,
            clock,
        }
    }

    pub async fn list(&self, query: DeadLetterQuery) -> Result<Vec<DeadLetter>> {
        Ok(self.dead_letters.list(query).await?)
    }

    pub async fn get(&self, id: DeadLetterId) -> Result<Option<DeadLetter>> {
        Ok(self.dead_letters.get(id).await?)
    }

    /// Re-enqueues a dead letter as a fresh job with a full attempt budget.
    ///
    /// The new job carries no claim, so the runner re-claims the key that
    /// was released when the original job died.
    #[tracing::instrument(skip(self))]
    pub async fn replay(&self, id: DeadLetterId) -> Result<Job> {
        let record = self
            .dead_letters
            .get(id)
            .await?
            .ok_or_else(|| StoreError::NotFound {
                entity: "dead letter",
                id: id.to_string(),
            })?;
        if record.is_replayed() {
            return Err(ProcessError::Store(StoreError::InvalidState {
                entity: "dead letter",
                id: id.to_string(),
                reason: "already replayed".to_string(),
            }));
        }

        let now = self.clock.now();
        let mut job = self
            .jobs
            .enqueue(NewJob::new(record.hook_name.clone(), record.payload.clone()).run_after(now))
            .await?;

        if let Err(e) = self.dead_letters.mark_replayed(id, job.id, now).await {
            // Lost a race with another replay; neutralize our copy.
            job.status = JobStatus::Done;
            job.last_error = Some("superseded by concurrent replay".to_string());
            self.jobs.update(&job).await?;
            return Err(e.into());
        }

        tracing::info!(job_id = %job.id, hook = %job.hook_name, "dead letter replayed");
        metrics::counter!("dead_letters_replayed_total", "hook" => job.hook_name.clone())
            .increment(1);
        Ok(job)
    }

    /// Deletes replayed records.
    pub async fn purge_replayed(&self) -> Result<u64> {
        Ok(self.dead_letters.purge_replayed().await?)
    }
}
