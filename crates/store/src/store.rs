use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{DeadLetterId, JobId, SagaId};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    ClaimOutcome, DeadLetter, DeadLetterQuery, IdempotencyClaim, IdempotencyScope, Job, JobStatus,
    NewJob, Result,
};

/// A small key-value store with optional per-entry expiry.
///
/// Backs rate limits, cached breaker snapshots and the idempotency fallback.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Returns the value for `key` unless absent or expired.
    async fn get(&self, key: &str) -> Result<Option<serde_json::Value>>;

    /// Stores `value`, replacing any previous entry.
    async fn set(&self, key: &str, value: serde_json::Value, ttl: Option<Duration>) -> Result<()>;

    /// Stores `value` only if no live entry exists. Returns true if stored.
    async fn add(&self, key: &str, value: serde_json::Value, ttl: Option<Duration>)
    -> Result<bool>;

    /// Removes the entry. Returns true if a live entry was removed.
    async fn delete(&self, key: &str) -> Result<bool>;
}

/// Durable claim/complete ledger keyed by `(key, scope)`.
///
/// `claim` must be atomic: two concurrent calls for the same pair yield
/// exactly one `Claimed`.
#[async_trait]
pub trait IdempotencyStore: Send + Sync {
    /// Attempts to claim the key.
    async fn claim(&self, key: &str, scope: IdempotencyScope) -> Result<ClaimOutcome>;

    /// Marks the key completed. Completing an unclaimed key records it as
    /// completed so later deliveries are recognized as duplicates.
    async fn complete(&self, key: &str, scope: IdempotencyScope) -> Result<()>;

    /// Deletes an in-flight claim so a later attempt can re-claim it.
    /// Completed claims are never released. Returns true if a claim was removed.
    async fn release(&self, key: &str, scope: IdempotencyScope) -> Result<bool>;

    /// Returns the claim for inspection.
    async fn get_claim(&self, key: &str, scope: IdempotencyScope)
    -> Result<Option<IdempotencyClaim>>;
}

/// Persistence for queued jobs.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Inserts a new pending job.
    async fn enqueue(&self, job: NewJob) -> Result<Job>;

    /// Atomically moves up to `limit` due pending jobs to `Running` and
    /// returns them, highest priority first, then earliest `run_after`.
    ///
    /// A job is handed to exactly one caller, under a fresh `lease`.
    async fn claim_due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Job>>;

    /// Persists a job's mutable fields. Dead jobs cannot be updated.
    ///
    /// While the stored job is `Running`, the write only lands if `job.lease`
    /// matches the stored lease; otherwise it fails with `LeaseLost`. Writing
    /// any other status clears the lease.
    async fn update(&self, job: &Job) -> Result<()>;

    /// Refreshes `updated_at` of a running job held under `lease`.
    /// Returns false if the lease is no longer current.
    async fn renew_lease(&self, id: JobId, lease: Uuid, now: DateTime<Utc>) -> Result<bool>;

    /// Loads a job by ID.
    async fn get(&self, id: JobId) -> Result<Option<Job>>;

    /// Finds a pending or running job with this hook and payload.
    async fn find_scheduled(
        &self,
        hook_name: &str,
        payload: &serde_json::Value,
    ) -> Result<Option<Job>>;

    /// Returns running jobs not updated since `stale_before` to `Pending`,
    /// revoking their leases.
    /// Returns the number of jobs requeued.
    async fn requeue_stale(&self, stale_before: DateTime<Utc>) -> Result<u64>;

    /// Counts jobs in a given status.
    async fn count_by_status(&self, status: JobStatus) -> Result<u64>;
}

/// Terminal storage for jobs that exhausted their retries.
#[async_trait]
pub trait DeadLetterStore: Send + Sync {
    async fn insert(&self, record: DeadLetter) -> Result<()>;

    async fn get(&self, id: DeadLetterId) -> Result<Option<DeadLetter>>;

    /// Lists records, newest first.
    async fn list(&self, query: DeadLetterQuery) -> Result<Vec<DeadLetter>>;

    /// Stamps a record as replayed. Fails with `InvalidState` if it was
    /// already replayed, so a record yields at most one replay job.
    async fn mark_replayed(
        &self,
        id: DeadLetterId,
        replay_job_id: JobId,
        at: DateTime<Utc>,
    ) -> Result<()>;

    /// Deletes replayed records. Returns the number removed.
    async fn purge_replayed(&self) -> Result<u64>;
}

/// A persisted snapshot of a saga execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SagaLogEntry {
    pub saga_id: SagaId,
    pub saga_type: String,
    pub status: String,
    /// The serialized execution (steps, results, compensation outcome).
    pub document: serde_json::Value,
    pub updated_at: DateTime<Utc>,
}

/// Persistence for saga executions, written after every step transition.
#[async_trait]
pub trait SagaLogStore: Send + Sync {
    async fn save(&self, entry: SagaLogEntry) -> Result<()>;

    async fn load(&self, saga_id: SagaId) -> Result<Option<SagaLogEntry>>;
}

/// Exclusive per-cart lock used by the lock-based checkout path.
#[async_trait]
pub trait CartLock: Send + Sync {
    /// Blocks until the cart owned by `owner` is locked.
    async fn lock_cart(&self, owner: &str) -> Result<CartLockGuard>;
}

/// Holds a cart lock until released or dropped.
///
/// Dropping a PostgreSQL guard rolls back its transaction, which also
/// releases the row lock.
pub struct CartLockGuard {
    inner: GuardInner,
}

enum GuardInner {
    Memory(tokio::sync::OwnedMutexGuard<()>),
    Postgres(sqlx::Transaction<'static, sqlx::Postgres>),
}

impl CartLockGuard {
    pub(crate) fn memory(guard: tokio::sync::OwnedMutexGuard<()>) -> Self {
        Self {
            inner: GuardInner::Memory(guard),
        }
    }

    pub(crate) fn postgres(tx: sqlx::Transaction<'static, sqlx::Postgres>) -> Self {
        Self {
            inner: GuardInner::Postgres(tx),
        }
    }

    /// Releases the lock.
    pub async fn release(self) -> Result<()> {
        match self.inner {
            GuardInner::Memory(guard) => {
                drop(guard);
                Ok(())
            }
            GuardInner::Postgres(tx) => {
                tx.commit().await?;
                Ok(())
            }
        }
    }
}

impl std::fmt::Debug for CartLockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self.inner {
            GuardInner::Memory(_) => "memory",
            GuardInner::Postgres(_) => "postgres",
        };
        f.debug_struct("CartLockGuard").field("kind", &kind).finish()
    }
}
