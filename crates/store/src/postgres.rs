use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{DeadLetterId, JobId, SagaId};
use sqlx::{PgPool, Row, postgres::PgRow};
use uuid::Uuid;

use crate::{
    CartLock, CartLockGuard, ClaimOutcome, ClaimRef, ClaimStatus, DeadLetter, DeadLetterQuery,
    DeadLetterStore, IdempotencyClaim, IdempotencyScope, IdempotencyStore, InMemoryCartLock,
    InMemoryDeadLetterStore, InMemoryJobStore, InMemoryKeyValueStore, InMemorySagaLog, Job,
    JobStatus, JobStore, KeyValueStore, KvIdempotencyStore, NewJob, Result, SagaLogEntry,
    SagaLogStore, StoreError, is_missing_table,
};

const JOB_COLUMNS: &str = "id, hook_name, payload, priority, attempt_count, max_attempts, \
     run_after, status, claim_key, claim_scope, last_error, created_at, updated_at, lease";

const DEAD_LETTER_COLUMNS: &str = "id, job_id, hook_name, payload, attempt_count, error, \
     error_kind, dead_lettered_at, replayed_at, replay_job_id";

/// In-memory stand-ins used when a table is missing.
#[derive(Clone)]
struct Fallback {
    kv: InMemoryKeyValueStore,
    claims: KvIdempotencyStore<InMemoryKeyValueStore>,
    jobs: InMemoryJobStore,
    dead_letters: InMemoryDeadLetterStore,
    sagas: InMemorySagaLog,
    carts: InMemoryCartLock,
}

impl Fallback {
    fn new() -> Self {
        let kv = InMemoryKeyValueStore::new();
        Self {
            claims: KvIdempotencyStore::new(kv.clone()),
            kv,
            jobs: InMemoryJobStore::new(),
            dead_letters: InMemoryDeadLetterStore::new(),
            sagas: InMemorySagaLog::new(),
            carts: InMemoryCartLock::new(),
        }
    }
}

/// PostgreSQL-backed store implementing every persistence trait on one pool.
///
/// If a table is missing (SQLSTATE `42P01`) the affected operation is served
/// by an in-memory fallback instead of failing. The fallback is not shared
/// across processes and does not survive restarts.
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
    fallback: Fallback,
    degraded: Arc<AtomicBool>,
}

impl PostgresStore {
    /// Creates a new PostgreSQL store.
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            fallback: Fallback::new(),
            degraded: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Gets a reference to the underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Runs the database migrations.
    pub async fn run_migrations(&self) -> std::result::Result<(), sqlx::migrate::MigrateError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await
    }

    /// Returns true once any operation has fallen back to memory.
    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Relaxed)
    }

    /// Returns true (and records the degradation) if `err` is a missing table.
    fn falls_back(&self, table: &'static str, err: &sqlx::Error) -> bool {
        if !is_missing_table(err) {
            return false;
        }
        if !self.degraded.swap(true, Ordering::Relaxed) {
            tracing::warn!(
                table,
                "table missing, falling back to in-memory store; guarantees no longer hold across processes"
            );
        }
        metrics::counter!("store_fallback_total", "table" => table).increment(1);
        true
    }

    fn row_to_claim(row: &PgRow) -> Result<IdempotencyClaim> {
        let scope: String = row.try_get("scope")?;
        let status: String = row.try_get("status")?;
        Ok(IdempotencyClaim {
            key: row.try_get("key")?,
            scope: parse_scope(&scope)?,
            status: ClaimStatus::parse(&status).ok_or_else(|| StoreError::Corrupt {
                entity: "idempotency claim",
                reason: format!("unknown status {status}"),
            })?,
            claimed_at: row.try_get("claimed_at")?,
            completed_at: row.try_get("completed_at")?,
        })
    }

    fn row_to_job(row: &PgRow) -> Result<Job> {
        let status: String = row.try_get("status")?;
        let claim_key: Option<String> = row.try_get("claim_key")?;
        let claim_scope: Option<String> = row.try_get("claim_scope")?;
        let claim = match (claim_key, claim_scope) {
            (Some(key), Some(scope)) => Some(ClaimRef::new(key, parse_scope(&scope)?)),
            _ => None,
        };

        Ok(Job {
            id: JobId::from_uuid(row.try_get::<Uuid, _>("id")?),
            hook_name: row.try_get("hook_name")?,
            payload: row.try_get("payload")?,
            priority: row.try_get("priority")?,
            attempt_count: row.try_get::<i32, _>("attempt_count")?.max(0) as u32,
            max_attempts: row.try_get::<i32, _>("max_attempts")?.max(1) as u32,
            run_after: row.try_get("run_after")?,
            status: JobStatus::parse(&status).ok_or_else(|| StoreError::Corrupt {
                entity: "job",
                reason: format!("unknown status {status}"),
            })?,
            claim,
            lease: row.try_get("lease")?,
            last_error: row.try_get("last_error")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    fn row_to_dead_letter(row: &PgRow) -> Result<DeadLetter> {
        Ok(DeadLetter {
            id: DeadLetterId::from_uuid(row.try_get::<Uuid, _>("id")?),
            job_id: JobId::from_uuid(row.try_get::<Uuid, _>("job_id")?),
            hook_name: row.try_get("hook_name")?,
            payload: row.try_get("payload")?,
            attempt_count: row.try_get::<i32, _>("attempt_count")?.max(0) as u32,
            error: row.try_get("error")?,
            error_kind: row.try_get("error_kind")?,
            dead_lettered_at: row.try_get("dead_lettered_at")?,
            replayed_at: row.try_get("replayed_at")?,
            replay_job_id: row
                .try_get::<Option<Uuid>, _>("replay_job_id")?
                .map(JobId::from_uuid),
        })
    }
}

fn parse_scope(s: &str) -> Result<IdempotencyScope> {
    IdempotencyScope::parse(s).ok_or_else(|| StoreError::Corrupt {
        entity: "idempotency claim",
        reason: format!("unknown scope {s}"),
    })
}

fn ttl_expiry(ttl: Option<Duration>) -> Option<DateTime<Utc>> {
    ttl.and_then(|d| chrono::Duration::from_std(d).ok())
        .map(|d| Utc::now() + d)
}

#[async_trait]
impl KeyValueStore for PostgresStore {
    async fn get(&self, key: &str) -> Result<Option<serde_json::Value>> {
        let result = sqlx::query_scalar::<_, serde_json::Value>(
            "SELECT value FROM kv_entries WHERE key = $1 AND (expires_at IS NULL OR expires_at > now())",
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await;

        match result {
            Ok(value) => Ok(value),
            Err(e) if self.falls_back("kv_entries", &e) => self.fallback.kv.get(key).await,
            Err(e) => Err(e.into()),
        }
    }

    async fn set(&self, key: &str, value: serde_json::Value, ttl: Option<Duration>) -> Result<()> {
        let result = sqlx::query(
            r#"
            INSERT INTO kv_entries (key, value, expires_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (key) DO UPDATE SET value = EXCLUDED.value, expires_at = EXCLUDED.expires_at
            "#,
        )
        .bind(key)
        .bind(&value)
        .bind(ttl_expiry(ttl))
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(e) if self.falls_back("kv_entries", &e) => {
                self.fallback.kv.set(key, value, ttl).await
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn add(
        &self,
        key: &str,
        value: serde_json::Value,
        ttl: Option<Duration>,
    ) -> Result<bool> {
        // Expired rows are overwritten; live rows win.
        let result = sqlx::query(
            r#"
            INSERT INTO kv_entries (key, value, expires_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (key) DO UPDATE SET value = EXCLUDED.value, expires_at = EXCLUDED.expires_at
            WHERE kv_entries.expires_at IS NOT NULL AND kv_entries.expires_at <= now()
            "#,
        )
        .bind(key)
        .bind(&value)
        .bind(ttl_expiry(ttl))
        .execute(&self.pool)
        .await;

        match result {
            Ok(r) => Ok(r.rows_affected() == 1),
            Err(e) if self.falls_back("kv_entries", &e) => {
                self.fallback.kv.add(key, value, ttl).await
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let result = sqlx::query(
            "DELETE FROM kv_entries WHERE key = $1 AND (expires_at IS NULL OR expires_at > now())",
        )
        .bind(key)
        .execute(&self.pool)
        .await;

        match result {
            Ok(r) => Ok(r.rows_affected() > 0),
            Err(e) if self.falls_back("kv_entries", &e) => self.fallback.kv.delete(key).await,
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl IdempotencyStore for PostgresStore {
    async fn claim(&self, key: &str, scope: IdempotencyScope) -> Result<ClaimOutcome> {
        // The row may be released between our failed insert and the read;
        // in that case the insert is retried.
        for _ in 0..3 {
            let inserted = sqlx::query(
                r#"
                INSERT INTO idempotency_claims (key, scope, status, claimed_at)
                VALUES ($1, $2, 'claimed', now())
                ON CONFLICT (key, scope) DO NOTHING
                "#,
            )
            .bind(key)
            .bind(scope.as_str())
            .execute(&self.pool)
            .await;

            let inserted = match inserted {
                Ok(r) => r.rows_affected() == 1,
                Err(e) if self.falls_back("idempotency_claims", &e) => {
                    return self.fallback.claims.claim(key, scope).await;
                }
                Err(e) => return Err(e.into()),
            };
            if inserted {
                return Ok(ClaimOutcome::Claimed);
            }

            let status: Option<String> = sqlx::query_scalar(
                "SELECT status FROM idempotency_claims WHERE key = $1 AND scope = $2",
            )
            .bind(key)
            .bind(scope.as_str())
            .fetch_optional(&self.pool)
            .await?;

            if let Some(status) = status {
                let status = ClaimStatus::parse(&status).ok_or_else(|| StoreError::Corrupt {
                    entity: "idempotency claim",
                    reason: format!("unknown status {status}"),
                })?;
                return Ok(ClaimOutcome::for_existing(status));
            }
        }
        Ok(ClaimOutcome::AlreadyProcessing)
    }

    async fn complete(&self, key: &str, scope: IdempotencyScope) -> Result<()> {
        let result = sqlx::query(
            r#"
            INSERT INTO idempotency_claims (key, scope, status, claimed_at, completed_at)
            VALUES ($1, $2, 'completed', now(), now())
            ON CONFLICT (key, scope) DO UPDATE
                SET status = 'completed', completed_at = now()
                WHERE idempotency_claims.status = 'claimed'
            "#,
        )
        .bind(key)
        .bind(scope.as_str())
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(e) if self.falls_back("idempotency_claims", &e) => {
                self.fallback.claims.complete(key, scope).await
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn release(&self, key: &str, scope: IdempotencyScope) -> Result<bool> {
        let result = sqlx::query(
            "DELETE FROM idempotency_claims WHERE key = $1 AND scope = $2 AND status = 'claimed'",
        )
        .bind(key)
        .bind(scope.as_str())
        .execute(&self.pool)
        .await;

        match result {
            Ok(r) => Ok(r.rows_affected() > 0),
            Err(e) if self.falls_back("idempotency_claims", &e) => {
                self.fallback.claims.release(key, scope).await
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn get_claim(
        &self,
        key: &str,
        scope: IdempotencyScope,
    ) -> Result<Option<IdempotencyClaim>> {
        let result = sqlx::query(
            "SELECT key, scope, status, claimed_at, completed_at FROM idempotency_claims WHERE key = $1 AND scope = $2",
        )
        .bind(key)
        .bind(scope.as_str())
        .fetch_optional(&self.pool)
        .await;

        match result {
            Ok(row) => row.as_ref().map(Self::row_to_claim).transpose(),
            Err(e) if self.falls_back("idempotency_claims", &e) => {
                self.fallback.claims.get_claim(key, scope).await
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl JobStore for PostgresStore {
    async fn enqueue(&self, job: NewJob) -> Result<Job> {
        let job = job.into_job(Utc::now());
        let result = sqlx::query(&format!(
            "INSERT INTO jobs ({JOB_COLUMNS}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)"
        ))
        .bind(job.id.as_uuid())
        .bind(&job.hook_name)
        .bind(&job.payload)
        .bind(job.priority)
        .bind(job.attempt_count as i32)
        .bind(job.max_attempts as i32)
        .bind(job.run_after)
        .bind(job.status.as_str())
        .bind(job.claim.as_ref().map(|c| c.key.clone()))
        .bind(job.claim.as_ref().map(|c| c.scope.as_str()))
        .bind(&job.last_error)
        .bind(job.created_at)
        .bind(job.updated_at)
        .bind(job.lease)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(job),
            Err(e) if self.falls_back("jobs", &e) => {
                let new_job = NewJob {
                    hook_name: job.hook_name,
                    payload: job.payload,
                    priority: job.priority,
                    max_attempts: job.max_attempts,
                    run_after: job.run_after,
                    claim: job.claim,
                };
                self.fallback.jobs.enqueue(new_job).await
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn claim_due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Job>> {
        // SKIP LOCKED lets concurrent workers claim disjoint batches.
        let result = sqlx::query(
            r#"
            WITH due AS (
                SELECT id FROM jobs
                WHERE status = 'pending' AND run_after <= $1
                ORDER BY priority DESC, run_after ASC
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            UPDATE jobs j
            SET status = 'running', updated_at = $1, lease = gen_random_uuid()
            FROM due
            WHERE j.id = due.id
            RETURNING j.*
            "#,
        )
        .bind(now)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await;

        let rows = match result {
            Ok(rows) => rows,
            Err(e) if self.falls_back("jobs", &e) => {
                return self.fallback.jobs.claim_due(now, limit).await;
            }
            Err(e) => return Err(e.into()),
        };

        let mut jobs = rows
            .iter()
            .map(Self::row_to_job)
            .collect::<Result<Vec<_>>>()?;
        jobs.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(a.run_after.cmp(&b.run_after))
        });
        Ok(jobs)
    }

    async fn update(&self, job: &Job) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET payload = $2, priority = $3, attempt_count = $4, max_attempts = $5,
                run_after = $6, status = $7, claim_key = $8, claim_scope = $9,
                last_error = $10, updated_at = now(),
                lease = CASE WHEN $7 = 'running' THEN $11 ELSE NULL END
            WHERE id = $1 AND status <> 'dead'
              AND (status <> 'running' OR lease IS NOT DISTINCT FROM $11)
            "#,
        )
        .bind(job.id.as_uuid())
        .bind(&job.payload)
        .bind(job.priority)
        .bind(job.attempt_count as i32)
        .bind(job.max_attempts as i32)
        .bind(job.run_after)
        .bind(job.status.as_str())
        .bind(job.claim.as_ref().map(|c| c.key.clone()))
        .bind(job.claim.as_ref().map(|c| c.scope.as_str()))
        .bind(&job.last_error)
        .bind(job.lease)
        .execute(&self.pool)
        .await;

        let rows = match result {
            Ok(r) => r.rows_affected(),
            Err(e) if self.falls_back("jobs", &e) => return self.fallback.jobs.update(job).await,
            Err(e) => return Err(e.into()),
        };

        if rows == 0 {
            return match JobStore::get(self, job.id).await? {
                Some(stored) if stored.status == JobStatus::Running => {
                    Err(StoreError::LeaseLost {
                        id: job.id.to_string(),
                    })
                }
                Some(_) => Err(StoreError::InvalidState {
                    entity: "job",
                    id: job.id.to_string(),
                    reason: "dead jobs are immutable".to_string(),
                }),
                None => Err(StoreError::NotFound {
                    entity: "job",
                    id: job.id.to_string(),
                }),
            };
        }
        Ok(())
    }

    async fn renew_lease(&self, id: JobId, lease: Uuid, now: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE jobs SET updated_at = $3 \
             WHERE id = $1 AND status = 'running' AND lease = $2",
        )
        .bind(id.as_uuid())
        .bind(lease)
        .bind(now)
        .execute(&self.pool)
        .await;

        match result {
            Ok(r) => Ok(r.rows_affected() == 1),
            Err(e) if self.falls_back("jobs", &e) => {
                self.fallback.jobs.renew_lease(id, lease, now).await
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn get(&self, id: JobId) -> Result<Option<Job>> {
        let result = sqlx::query(&format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1"))
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await;

        match result {
            Ok(row) => row.as_ref().map(Self::row_to_job).transpose(),
            Err(e) if self.falls_back("jobs", &e) => self.fallback.jobs.get(id).await,
            Err(e) => Err(e.into()),
        }
    }

    async fn find_scheduled(
        &self,
        hook_name: &str,
        payload: &serde_json::Value,
    ) -> Result<Option<Job>> {
        let result = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs \
             WHERE hook_name = $1 AND payload = $2 AND status IN ('pending', 'running') \
             LIMIT 1"
        ))
        .bind(hook_name)
        .bind(payload)
        .fetch_optional(&self.pool)
        .await;

        match result {
            Ok(row) => row.as_ref().map(Self::row_to_job).transpose(),
            Err(e) if self.falls_back("jobs", &e) => {
                self.fallback.jobs.find_scheduled(hook_name, payload).await
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn requeue_stale(&self, stale_before: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE jobs SET status = 'pending', lease = NULL, updated_at = now() \
             WHERE status = 'running' AND updated_at < $1",
        )
        .bind(stale_before)
        .execute(&self.pool)
        .await;

        match result {
            Ok(r) => Ok(r.rows_affected()),
            Err(e) if self.falls_back("jobs", &e) => {
                self.fallback.jobs.requeue_stale(stale_before).await
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn count_by_status(&self, status: JobStatus) -> Result<u64> {
        let result = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM jobs WHERE status = $1")
            .bind(status.as_str())
            .fetch_one(&self.pool)
            .await;

        match result {
            Ok(count) => Ok(count.max(0) as u64),
            Err(e) if self.falls_back("jobs", &e) => {
                self.fallback.jobs.count_by_status(status).await
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl DeadLetterStore for PostgresStore {
    async fn insert(&self, record: DeadLetter) -> Result<()> {
        let result = sqlx::query(&format!(
            "INSERT INTO dead_letters ({DEAD_LETTER_COLUMNS}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)"
        ))
        .bind(record.id.as_uuid())
        .bind(record.job_id.as_uuid())
        .bind(&record.hook_name)
        .bind(&record.payload)
        .bind(record.attempt_count as i32)
        .bind(&record.error)
        .bind(&record.error_kind)
        .bind(record.dead_lettered_at)
        .bind(record.replayed_at)
        .bind(record.replay_job_id.map(|id| id.as_uuid()))
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(e) if self.falls_back("dead_letters", &e) => {
                self.fallback.dead_letters.insert(record).await
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn get(&self, id: DeadLetterId) -> Result<Option<DeadLetter>> {
        let result = sqlx::query(&format!(
            "SELECT {DEAD_LETTER_COLUMNS} FROM dead_letters WHERE id = $1"
        ))
        .bind(id.as_uuid())
        .fetch_optional(&self.pool)
        .await;

        match result {
            Ok(row) => row.as_ref().map(Self::row_to_dead_letter).transpose(),
            Err(e) if self.falls_back("dead_letters", &e) => {
                self.fallback.dead_letters.get(id).await
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn list(&self, query: DeadLetterQuery) -> Result<Vec<DeadLetter>> {
        let result = sqlx::query(&format!(
            r#"
            SELECT {DEAD_LETTER_COLUMNS} FROM dead_letters
            WHERE ($1::text IS NULL OR hook_name = $1)
              AND ($2 OR replayed_at IS NULL)
            ORDER BY dead_lettered_at DESC
            LIMIT $3
            "#
        ))
        .bind(query.hook_name.as_deref())
        .bind(query.include_replayed)
        .bind(query.limit as i64)
        .fetch_all(&self.pool)
        .await;

        match result {
            Ok(rows) => rows.iter().map(Self::row_to_dead_letter).collect(),
            Err(e) if self.falls_back("dead_letters", &e) => {
                self.fallback.dead_letters.list(query).await
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn mark_replayed(
        &self,
        id: DeadLetterId,
        replay_job_id: JobId,
        at: DateTime<Utc>,
    ) -> Result<()> {
        let result = sqlx::query(
            "UPDATE dead_letters SET replayed_at = $2, replay_job_id = $3 \
             WHERE id = $1 AND replayed_at IS NULL",
        )
        .bind(id.as_uuid())
        .bind(at)
        .bind(replay_job_id.as_uuid())
        .execute(&self.pool)
        .await;

        let rows = match result {
            Ok(r) => r.rows_affected(),
            Err(e) if self.falls_back("dead_letters", &e) => {
                return self
                    .fallback
                    .dead_letters
                    .mark_replayed(id, replay_job_id, at)
                    .await;
            }
            Err(e) => return Err(e.into()),
        };

        if rows == 0 {
            return match DeadLetterStore::get(self, id).await? {
                Some(_) => Err(StoreError::InvalidState {
                    entity: "dead letter",
                    id: id.to_string(),
                    reason: "already replayed".to_string(),
                }),
                None => Err(StoreError::NotFound {
                    entity: "dead letter",
                    id: id.to_string(),
                }),
            };
        }
        Ok(())
    }

    async fn purge_replayed(&self) -> Result<u64> {
        let result = sqlx::query("DELETE FROM dead_letters WHERE replayed_at IS NOT NULL")
            .execute(&self.pool)
            .await;

        match result {
            Ok(r) => Ok(r.rows_affected()),
            Err(e) if self.falls_back("dead_letters", &e) => {
                self.fallback.dead_letters.purge_replayed().await
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl SagaLogStore for PostgresStore {
    async fn save(&self, entry: SagaLogEntry) -> Result<()> {
        let result = sqlx::query(
            r#"
            INSERT INTO saga_executions (saga_id, saga_type, status, document, updated_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (saga_id) DO UPDATE
                SET status = EXCLUDED.status, document = EXCLUDED.document, updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(entry.saga_id.as_uuid())
        .bind(&entry.saga_type)
        .bind(&entry.status)
        .bind(&entry.document)
        .bind(entry.updated_at)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(e) if self.falls_back("saga_executions", &e) => {
                self.fallback.sagas.save(entry).await
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn load(&self, saga_id: SagaId) -> Result<Option<SagaLogEntry>> {
        let result = sqlx::query(
            "SELECT saga_id, saga_type, status, document, updated_at FROM saga_executions WHERE saga_id = $1",
        )
        .bind(saga_id.as_uuid())
        .fetch_optional(&self.pool)
        .await;

        let row = match result {
            Ok(row) => row,
            Err(e) if self.falls_back("saga_executions", &e) => {
                return self.fallback.sagas.load(saga_id).await;
            }
            Err(e) => return Err(e.into()),
        };

        row.map(|row| {
            Ok(SagaLogEntry {
                saga_id: SagaId::from_uuid(row.try_get::<Uuid, _>("saga_id")?),
                saga_type: row.try_get("saga_type")?,
                status: row.try_get("status")?,
                document: row.try_get("document")?,
                updated_at: row.try_get("updated_at")?,
            })
        })
        .transpose()
    }
}

#[async_trait]
impl CartLock for PostgresStore {
    async fn lock_cart(&self, owner: &str) -> Result<CartLockGuard> {
        // Ensure the row exists outside the locking transaction so the lock
        // has something to attach to.
        let ensured = sqlx::query(
            "INSERT INTO carts (owner, updated_at) VALUES ($1, now()) ON CONFLICT (owner) DO NOTHING",
        )
        .bind(owner)
        .execute(&self.pool)
        .await;

        match ensured {
            Ok(_) => {}
            Err(e) if self.falls_back("carts", &e) => {
                return self.fallback.carts.lock_cart(owner).await;
            }
            Err(e) => return Err(e.into()),
        }

        let mut tx = self.pool.begin().await?;
        sqlx::query("SELECT owner FROM carts WHERE owner = $1 FOR UPDATE")
            .bind(owner)
            .fetch_one(&mut *tx)
            .await?;

        Ok(CartLockGuard::postgres(tx))
    }
}
