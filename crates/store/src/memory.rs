use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{Clock, DeadLetterId, JobId, SagaId, SystemClock};
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

use crate::{
    CartLock, CartLockGuard, ClaimOutcome, ClaimStatus, DeadLetter, DeadLetterQuery,
    DeadLetterStore, IdempotencyClaim, IdempotencyScope, IdempotencyStore, Job, JobStatus,
    JobStore, KeyValueStore, NewJob, Result, SagaLogEntry, SagaLogStore, StoreError,
};

fn expiry(now: DateTime<Utc>, ttl: Option<Duration>) -> Option<DateTime<Utc>> {
    ttl.and_then(|d| chrono::Duration::from_std(d).ok())
        .map(|d| now + d)
}

#[derive(Debug, Clone)]
struct KvEntry {
    value: serde_json::Value,
    expires_at: Option<DateTime<Utc>>,
}

impl KvEntry {
    fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_none_or(|at| at > now)
    }
}

/// In-memory key-value store with lazy expiry.
///
/// Not shared across processes; suitable for tests and as a degraded
/// fallback when the durable table is unavailable.
#[derive(Clone)]
pub struct InMemoryKeyValueStore {
    entries: Arc<RwLock<HashMap<String, KvEntry>>>,
    clock: Arc<dyn Clock>,
}

impl InMemoryKeyValueStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: Arc::new(RwLock::new(HashMap::new())),
            clock,
        }
    }

    /// Returns the number of live entries.
    pub async fn len(&self) -> usize {
        let now = self.clock.now();
        self.entries
            .read()
            .await
            .values()
            .filter(|e| e.is_live(now))
            .count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

impl Default for InMemoryKeyValueStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KeyValueStore for InMemoryKeyValueStore {
    async fn get(&self, key: &str) -> Result<Option<serde_json::Value>> {
        let now = self.clock.now();
        let entries = self.entries.read().await;
        Ok(entries
            .get(key)
            .filter(|e| e.is_live(now))
            .map(|e| e.value.clone()))
    }

    async fn set(&self, key: &str, value: serde_json::Value, ttl: Option<Duration>) -> Result<()> {
        let now = self.clock.now();
        self.entries.write().await.insert(
            key.to_string(),
            KvEntry {
                value,
                expires_at: expiry(now, ttl),
            },
        );
        Ok(())
    }

    async fn add(
        &self,
        key: &str,
        value: serde_json::Value,
        ttl: Option<Duration>,
    ) -> Result<bool> {
        let now = self.clock.now();
        let mut entries = self.entries.write().await;
        if entries.get(key).is_some_and(|e| e.is_live(now)) {
            return Ok(false);
        }
        entries.insert(
            key.to_string(),
            KvEntry {
                value,
                expires_at: expiry(now, ttl),
            },
        );
        Ok(true)
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let now = self.clock.now();
        let removed = self.entries.write().await.remove(key);
        Ok(removed.is_some_and(|e| e.is_live(now)))
    }
}

/// In-memory idempotency ledger.
///
/// A single write lock around the map makes `claim` atomic within the
/// process.
#[derive(Clone)]
pub struct InMemoryIdempotencyStore {
    claims: Arc<RwLock<HashMap<(String, IdempotencyScope), IdempotencyClaim>>>,
    clock: Arc<dyn Clock>,
}

impl InMemoryIdempotencyStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            claims: Arc::new(RwLock::new(HashMap::new())),
            clock,
        }
    }

    /// Returns the number of claims in any status.
    pub async fn claim_count(&self) -> usize {
        self.claims.read().await.len()
    }
}

impl Default for InMemoryIdempotencyStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl IdempotencyStore for InMemoryIdempotencyStore {
    async fn claim(&self, key: &str, scope: IdempotencyScope) -> Result<ClaimOutcome> {
        let mut claims = self.claims.write().await;
        let map_key = (key.to_string(), scope);
        if let Some(existing) = claims.get(&map_key) {
            return Ok(ClaimOutcome::for_existing(existing.status));
        }
        claims.insert(
            map_key,
            IdempotencyClaim {
                key: key.to_string(),
                scope,
                status: ClaimStatus::Claimed,
                claimed_at: self.clock.now(),
                completed_at: None,
            },
        );
        Ok(ClaimOutcome::Claimed)
    }

    async fn complete(&self, key: &str, scope: IdempotencyScope) -> Result<()> {
        let now = self.clock.now();
        let mut claims = self.claims.write().await;
        let claim = claims
            .entry((key.to_string(), scope))
            .or_insert_with(|| IdempotencyClaim {
                key: key.to_string(),
                scope,
                status: ClaimStatus::Claimed,
                claimed_at: now,
                completed_at: None,
            });
        if claim.status == ClaimStatus::Claimed {
            claim.status = ClaimStatus::Completed;
            claim.completed_at = Some(now);
        }
        Ok(())
    }

    async fn release(&self, key: &str, scope: IdempotencyScope) -> Result<bool> {
        let mut claims = self.claims.write().await;
        let map_key = (key.to_string(), scope);
        match claims.get(&map_key) {
            Some(claim) if claim.status == ClaimStatus::Claimed => {
                claims.remove(&map_key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn get_claim(
        &self,
        key: &str,
        scope: IdempotencyScope,
    ) -> Result<Option<IdempotencyClaim>> {
        Ok(self
            .claims
            .read()
            .await
            .get(&(key.to_string(), scope))
            .cloned())
    }
}

/// In-memory job queue.
#[derive(Clone)]
pub struct InMemoryJobStore {
    jobs: Arc<RwLock<HashMap<JobId, Job>>>,
    clock: Arc<dyn Clock>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            jobs: Arc::new(RwLock::new(HashMap::new())),
            clock,
        }
    }

    /// Returns every job, oldest first.
    pub async fn all(&self) -> Vec<Job> {
        let mut jobs: Vec<_> = self.jobs.read().await.values().cloned().collect();
        jobs.sort_by_key(|j| j.created_at);
        jobs
    }
}

impl Default for InMemoryJobStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn enqueue(&self, job: NewJob) -> Result<Job> {
        let job = job.into_job(self.clock.now());
        self.jobs.write().await.insert(job.id, job.clone());
        Ok(job)
    }

    async fn claim_due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Job>> {
        let mut jobs = self.jobs.write().await;
        let mut due: Vec<&mut Job> = jobs.values_mut().filter(|j| j.is_due(now)).collect();
        due.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(a.run_after.cmp(&b.run_after))
        });

        Ok(due
            .into_iter()
            .take(limit)
            .map(|job| {
                job.status = JobStatus::Running;
                job.lease = Some(Uuid::new_v4());
                job.updated_at = now;
                job.clone()
            })
            .collect())
    }

    async fn update(&self, job: &Job) -> Result<()> {
        let mut jobs = self.jobs.write().await;
        let existing = jobs.get_mut(&job.id).ok_or_else(|| StoreError::NotFound {
            entity: "job",
            id: job.id.to_string(),
        })?;
        if existing.status == JobStatus::Dead {
            return Err(StoreError::InvalidState {
                entity: "job",
                id: job.id.to_string(),
                reason: "dead jobs are immutable".to_string(),
            });
        }
        if existing.status == JobStatus::Running && existing.lease != job.lease {
            return Err(StoreError::LeaseLost {
                id: job.id.to_string(),
            });
        }
        let mut updated = job.clone();
        if updated.status != JobStatus::Running {
            updated.lease = None;
        }
        updated.updated_at = self.clock.now();
        *existing = updated;
        Ok(())
    }

    async fn renew_lease(&self, id: JobId, lease: Uuid, now: DateTime<Utc>) -> Result<bool> {
        let mut jobs = self.jobs.write().await;
        match jobs.get_mut(&id) {
            Some(job) if job.status == JobStatus::Running && job.lease == Some(lease) => {
                job.updated_at = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn get(&self, id: JobId) -> Result<Option<Job>> {
        Ok(self.jobs.read().await.get(&id).cloned())
    }

    async fn find_scheduled(
        &self,
        hook_name: &str,
        payload: &serde_json::Value,
    ) -> Result<Option<Job>> {
        let jobs = self.jobs.read().await;
        Ok(jobs
            .values()
            .find(|j| {
                matches!(j.status, JobStatus::Pending | JobStatus::Running)
                    && j.hook_name == hook_name
                    && &j.payload == payload
            })
            .cloned())
    }

    async fn requeue_stale(&self, stale_before: DateTime<Utc>) -> Result<u64> {
        let now = self.clock.now();
        let mut count = 0;
        for job in self.jobs.write().await.values_mut() {
            if job.status == JobStatus::Running && job.updated_at < stale_before {
                job.status = JobStatus::Pending;
                job.lease = None;
                job.updated_at = now;
                count += 1;
            }
        }
        Ok(count)
    }

    async fn count_by_status(&self, status: JobStatus) -> Result<u64> {
        Ok(self
            .jobs
            .read()
            .await
            .values()
            .filter(|j| j.status == status)
            .count() as u64)
    }
}

/// In-memory dead-letter store.
#[derive(Clone, Default)]
pub struct InMemoryDeadLetterStore {
    records: Arc<RwLock<HashMap<DeadLetterId, DeadLetter>>>,
}

impl InMemoryDeadLetterStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn count(&self) -> usize {
        self.records.read().await.len()
    }
}

#[async_trait]
impl DeadLetterStore for InMemoryDeadLetterStore {
    async fn insert(&self, record: DeadLetter) -> Result<()> {
        self.records.write().await.insert(record.id, record);
        Ok(())
    }

    async fn get(&self, id: DeadLetterId) -> Result<Option<DeadLetter>> {
        Ok(self.records.read().await.get(&id).cloned())
    }

    async fn list(&self, query: DeadLetterQuery) -> Result<Vec<DeadLetter>> {
        let records = self.records.read().await;
        let mut matching: Vec<_> = records
            .values()
            .filter(|r| query.matches(r))
            .cloned()
            .collect();
        matching.sort_by(|a, b| b.dead_lettered_at.cmp(&a.dead_lettered_at));
        matching.truncate(query.limit);
        Ok(matching)
    }

    async fn mark_replayed(
        &self,
        id: DeadLetterId,
        replay_job_id: JobId,
        at: DateTime<Utc>,
    ) -> Result<()> {
        let mut records = self.records.write().await;
        let record = records.get_mut(&id).ok_or_else(|| StoreError::NotFound {
            entity: "dead letter",
            id: id.to_string(),
        })?;
        if record.is_replayed() {
            return Err(StoreError::InvalidState {
                entity: "dead letter",
                id: id.to_string(),
                reason: "already replayed".to_string(),
            });
        }
        record.replayed_at = Some(at);
        record.replay_job_id = Some(replay_job_id);
        Ok(())
    }

    async fn purge_replayed(&self) -> Result<u64> {
        let mut records = self.records.write().await;
        let before = records.len();
        records.retain(|_, r| !r.is_replayed());
        Ok((before - records.len()) as u64)
    }
}

/// In-memory saga log.
#[derive(Clone, Default)]
pub struct InMemorySagaLog {
    entries: Arc<RwLock<HashMap<SagaId, SagaLogEntry>>>,
}

impl InMemorySagaLog {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SagaLogStore for InMemorySagaLog {
    async fn save(&self, entry: SagaLogEntry) -> Result<()> {
        self.entries.write().await.insert(entry.saga_id, entry);
        Ok(())
    }

    async fn load(&self, saga_id: SagaId) -> Result<Option<SagaLogEntry>> {
        Ok(self.entries.read().await.get(&saga_id).cloned())
    }
}

/// In-process cart locks, one async mutex per cart owner.
#[derive(Clone, Default)]
pub struct InMemoryCartLock {
    locks: Arc<Mutex<HashMap<String, Arc<Mutex<()>>>>>,
}

impl InMemoryCartLock {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CartLock for InMemoryCartLock {
    async fn lock_cart(&self, owner: &str) -> Result<CartLockGuard> {
        let lock = {
            let mut locks = self.locks.lock().await;
            locks
                .entry(owner.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        Ok(CartLockGuard::memory(lock.lock_owned().await))
    }
}
