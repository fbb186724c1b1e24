//! Executes jobs through their processors.
//!
//! For each job the runner:
//! 1. derives and claims the idempotency key, unless the job already holds a claim
//! 2. completes duplicates without side effects
//! 3. honors the processor's skip check, before any downstream call
//! 4. defers the job while the processor's circuit is open, releasing the claim
//! 5. runs the processor, renewing the job's lease until it returns
//! 6. on success, completes the claim and records breaker success
//! 7. on failure, records breaker failure when the downstream is at fault, then
//!    either reschedules with backoff or dead-letters and releases the claim
//!
//! A job is only acted on while the runner still holds the lease handed out by
//! `claim_due`. Once another worker has taken the job over, the run stops with
//! [`JobOutcome::LeaseLost`] and leaves the claim and job to the new holder.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use common::{Clock, DeadLetterId, SystemClock};
use reliability::{CircuitBreaker, ErrorKind, ProcessError, Result, RetryPolicy};
use store::{
    ClaimOutcome, ClaimRef, DeadLetter, DeadLetterStore, IdempotencyStore, Job, JobStatus,
    JobStore, StoreError,
};

use crate::processor::{ProcessOutcome, QueueProcessor};

/// What happened to a job on one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    /// The processor ran successfully.
    Completed,
    /// The processor chose not to act.
    Skipped(String),
    /// The work was already done or is in progress elsewhere.
    Duplicate(ClaimOutcome),
    /// The circuit was open; the job waits without spending an attempt.
    Deferred { run_after: DateTime<Utc> },
    /// The attempt failed and another is scheduled.
    Retrying { attempt: u32, run_after: DateTime<Utc> },
    /// The job was moved to the dead-letter store.
    DeadLettered(DeadLetterId),
    /// Another worker took the job over; this run left it untouched.
    LeaseLost,
}

impl JobOutcome {
    fn label(&self) -> &'static str {
        match self {
            JobOutcome::Completed => "completed",
            JobOutcome::Skipped(_) => "skipped",
            JobOutcome::Duplicate(_) => "duplicate",
            JobOutcome::Deferred { .. } => "deferred",
            JobOutcome::Retrying { .. } => "retrying",
            JobOutcome::DeadLettered(_) => "dead_lettered",
            JobOutcome::LeaseLost => "lease_lost",
        }
    }
}

/// Runs jobs against registered processors.
pub struct ProcessorRunner {
    processors: HashMap<&'static str, Arc<dyn QueueProcessor>>,
    claims: Arc<dyn IdempotencyStore>,
    jobs: Arc<dyn JobStore>,
    dead_letters: Arc<dyn DeadLetterStore>,
    retry: RetryPolicy,
    heartbeat: Duration,
    clock: Arc<dyn Clock>,
}

impl ProcessorRunner {
    pub fn new(
        claims: Arc<dyn IdempotencyStore>,
        jobs: Arc<dyn JobStore>,
        dead_letters: Arc<dyn DeadLetterStore>,
    ) -> Self {
        Self {
            processors: HashMap::new(),
            claims,
            jobs,
            dead_letters,
            retry: RetryPolicy::default(),
            heartbeat: Duration::from_secs(30),
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// How often a running job's lease is renewed. Must stay well below the
    /// worker's stale threshold.
    pub fn with_heartbeat(mut self, heartbeat: Duration) -> Self {
        self.heartbeat = heartbeat;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Registers a processor under its hook name, replacing any previous one.
    pub fn register(&mut self, processor: Arc<dyn QueueProcessor>) {
        self.processors.insert(processor.hook_name(), processor);
    }

    pub fn processor(&self, hook_name: &str) -> Option<Arc<dyn QueueProcessor>> {
        self.processors.get(hook_name).cloned()
    }

    /// Queue priority of jobs for `hook_name`.
    pub fn priority(&self, hook_name: &str) -> i32 {
        self.processor(hook_name)
            .map_or(crate::processor::NORMAL_PRIORITY, |p| p.priority())
    }

    /// Hook names paired with the priority their jobs are queued at.
    pub fn priorities(&self) -> impl Iterator<Item = (&'static str, i32)> + '_ {
        self.processors
            .iter()
            .map(|(hook, processor)| (*hook, processor.priority()))
    }

    /// Returns the number of registered processors.
    pub fn processor_count(&self) -> usize {
        self.processors.len()
    }

    /// The claim a job for `hook_name` with this payload would take.
    pub fn claim_ref(&self, hook_name: &str, payload: &serde_json::Value) -> Result<ClaimRef> {
        let processor = self
            .processor(hook_name)
            .ok_or_else(|| unknown_hook(hook_name))?;
        Ok(ClaimRef::new(
            processor.idempotency_key(payload)?,
            processor.scope(),
        ))
    }

    /// Runs one claimed job to its next state.
    ///
    /// Errors are store failures while recording the outcome; the job stays
    /// `Running` and is picked up again once it goes stale.
    #[tracing::instrument(
        skip(self, job),
        fields(job_id = %job.id, hook = %job.hook_name, attempt = job.attempt_count)
    )]
    pub async fn run(&self, mut job: Job) -> Result<JobOutcome> {
        let started = std::time::Instant::now();
        let result = match self.processor(&job.hook_name) {
            Some(processor) => self.run_with(processor, &mut job).await,
            None => {
                let err = unknown_hook(&job.hook_name);
                self.dead_letter(&mut job, &err).await
            }
        };
        let outcome = match result {
            Ok(outcome) => outcome,
            Err(ProcessError::Store(StoreError::LeaseLost { .. })) => {
                tracing::warn!("lease lost to another worker, abandoning run");
                JobOutcome::LeaseLost
            }
            Err(e) => return Err(e),
        };

        metrics::counter!(
            "jobs_processed_total",
            "hook" => job.hook_name.clone(),
            "outcome" => outcome.label()
        )
        .increment(1);
        metrics::histogram!("job_duration_seconds", "hook" => job.hook_name.clone())
            .record(started.elapsed().as_secs_f64());
        Ok(outcome)
    }

    async fn run_with(
        &self,
        processor: Arc<dyn QueueProcessor>,
        job: &mut Job,
    ) -> Result<JobOutcome> {
        job.max_attempts = processor.max_retries().max(1);

        if job.claim.is_none() {
            let key = match processor.idempotency_key(&job.payload) {
                Ok(key) => key,
                Err(e) => return self.fail(processor.as_ref(), None, job, e).await,
            };
            let claim = ClaimRef::new(key, processor.scope());
            let outcome = self.claims.claim(&claim.key, claim.scope).await?;
            if !outcome.is_claimed() {
                tracing::debug!(claim = %claim, ?outcome, "duplicate job, skipping");
                metrics::counter!("jobs_duplicate_total", "hook" => job.hook_name.clone())
                    .increment(1);
                self.finish(job, false).await?;
                return Ok(JobOutcome::Duplicate(outcome));
            }
            job.claim = Some(claim);
            self.jobs.update(job).await?;
        }

        match processor.skip_reason(&job.payload).await {
            Ok(Some(reason)) => {
                tracing::info!(%reason, "job skipped");
                self.finish(job, true).await?;
                return Ok(JobOutcome::Skipped(reason));
            }
            Ok(None) => {}
            Err(e) => return self.fail(processor.as_ref(), None, job, e).await,
        }

        let breaker = processor.circuit_breaker();
        if processor.is_circuit_open() {
            let retry_after = breaker.as_ref().and_then(|b| b.retry_after());
            return self.defer(job, retry_after).await;
        }

        self.ensure_lease(job).await?;
        match self.process_leased(processor.as_ref(), job).await {
            Err(e @ ProcessError::Store(StoreError::LeaseLost { .. })) => {
                if let Some(b) = &breaker {
                    b.abandon_trial();
                }
                Err(e)
            }
            Ok(ProcessOutcome::Completed) => {
                if let Some(b) = &breaker {
                    b.record_success();
                }
                self.finish(job, true).await?;
                Ok(JobOutcome::Completed)
            }
            Ok(ProcessOutcome::Skipped(reason)) => {
                if let Some(b) = &breaker {
                    b.abandon_trial();
                }
                tracing::info!(%reason, "job skipped");
                self.finish(job, true).await?;
                Ok(JobOutcome::Skipped(reason))
            }
            Err(ProcessError::AlreadyProcessed) => {
                if let Some(b) = &breaker {
                    b.abandon_trial();
                }
                self.finish(job, true).await?;
                Ok(JobOutcome::Duplicate(ClaimOutcome::AlreadyProcessed))
            }
            Err(ProcessError::CircuitOpen { retry_after, .. }) => {
                self.defer(job, retry_after).await
            }
            Err(e) => self.fail(processor.as_ref(), breaker.as_deref(), job, e).await,
        }
    }

    /// Runs the processor, renewing the lease every heartbeat. The attempt is
    /// dropped as soon as a renewal finds the lease gone.
    async fn process_leased(
        &self,
        processor: &dyn QueueProcessor,
        job: &Job,
    ) -> Result<ProcessOutcome> {
        let Some(lease) = job.lease else {
            return processor.process(&job.payload).await;
        };

        let work = processor.process(&job.payload);
        tokio::pin!(work);
        let mut heartbeat = tokio::time::interval(self.heartbeat);
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        heartbeat.tick().await;

        loop {
            tokio::select! {
                result = &mut work => return result,
                _ = heartbeat.tick() => {
                    match self.jobs.renew_lease(job.id, lease, self.clock.now()).await {
                        Ok(true) => {}
                        Ok(false) => {
                            return Err(StoreError::LeaseLost { id: job.id.to_string() }.into());
                        }
                        Err(e) => tracing::warn!(error = %e, "lease renewal failed"),
                    }
                }
            }
        }
    }

    /// Fails with `LeaseLost` unless the job is still held under its lease.
    async fn ensure_lease(&self, job: &Job) -> Result<()> {
        let Some(lease) = job.lease else {
            return Ok(());
        };
        if self.jobs.renew_lease(job.id, lease, self.clock.now()).await? {
            Ok(())
        } else {
            Err(StoreError::LeaseLost {
                id: job.id.to_string(),
            }
            .into())
        }
    }

    /// Marks the job done, completing its claim when `complete_claim` is set.
    async fn finish(&self, job: &mut Job, complete_claim: bool) -> Result<()> {
        self.ensure_lease(job).await?;
        if complete_claim && let Some(claim) = &job.claim {
            self.claims.complete(&claim.key, claim.scope).await?;
        }
        job.status = JobStatus::Done;
        self.jobs.update(job).await?;
        Ok(())
    }

    async fn defer(&self, job: &mut Job, retry_after: Option<DateTime<Utc>>) -> Result<JobOutcome> {
        self.ensure_lease(job).await?;
        self.release_claim(job).await?;
        let now = self.clock.now();
        let run_after = retry_after
            .filter(|at| *at > now)
            .unwrap_or_else(|| self.retry.next_run_at(now, 0));

        job.status = JobStatus::Pending;
        job.run_after = run_after;
        self.jobs.update(job).await?;

        tracing::info!(%run_after, "circuit open, job deferred");
        metrics::counter!("jobs_deferred_total", "hook" => job.hook_name.clone()).increment(1);
        Ok(JobOutcome::Deferred { run_after })
    }

    async fn fail(
        &self,
        processor: &dyn QueueProcessor,
        breaker: Option<&CircuitBreaker>,
        job: &mut Job,
        err: ProcessError,
    ) -> Result<JobOutcome> {
        let kind = err.kind();
        if let Some(b) = breaker {
            if kind.is_downstream_failure() {
                b.record_failure(err.to_string());
            } else {
                b.abandon_trial();
            }
        }
        job.last_error = Some(err.to_string());

        if kind == ErrorKind::Validation {
            return self.dead_letter(job, &err).await;
        }

        let prior_attempts = job.attempt_count;
        job.attempt_count = job.attempt_count.saturating_add(1);

        if processor.should_retry(&err) && job.attempt_count < job.max_attempts {
            let run_after = self.retry.next_run_at(self.clock.now(), prior_attempts);
            job.status = JobStatus::Pending;
            job.run_after = run_after;
            self.jobs.update(job).await?;

            tracing::warn!(
                error = %err,
                attempt = job.attempt_count,
                max_attempts = job.max_attempts,
                %run_after,
                "job failed, retry scheduled"
            );
            metrics::counter!("jobs_retried_total", "hook" => job.hook_name.clone())
                .increment(1);
            return Ok(JobOutcome::Retrying {
                attempt: job.attempt_count,
                run_after,
            });
        }

        self.dead_letter(job, &err).await
    }

    async fn dead_letter(&self, job: &mut Job, err: &ProcessError) -> Result<JobOutcome> {
        self.ensure_lease(job).await?;
        let now = self.clock.now();
        let kind = err.kind();
        job.last_error = Some(err.to_string());

        let record = DeadLetter::from_job(job, err.to_string(), kind.as_str(), now);
        let id = record.id;
        self.dead_letters.insert(record).await?;
        self.release_claim(job).await?;

        job.status = JobStatus::Dead;
        self.jobs.update(job).await?;

        tracing::error!(
            error = %err,
            error_kind = %kind,
            attempts = job.attempt_count,
            dead_letter_id = %id,
            "job dead-lettered"
        );
        metrics::counter!(
            "jobs_dead_lettered_total",
            "hook" => job.hook_name.clone(),
            "kind" => kind.as_str()
        )
        .increment(1);
        Ok(JobOutcome::DeadLettered(id))
    }

    async fn release_claim(&self, job: &mut Job) -> Result<()> {
        if let Some(claim) = job.claim.take() {
            self.claims.release(&claim.key, claim.scope).await?;
        }
        Ok(())
    }
}

fn unknown_hook(hook_name: &str) -> ProcessError {
    ProcessError::validation(format!("no processor registered for hook `{hook_name}`"))
}
