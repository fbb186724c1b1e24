//! Durable state for the webhook pipeline and checkout saga.
//!
//! Every store is a trait with an in-memory implementation for tests and
//! single-process use, and [`PostgresStore`] for production.

pub mod error;
pub mod fallback;
pub mod idempotency;
pub mod job;
pub mod memory;
pub mod postgres;
pub mod store;

pub use error::{Result, StoreError, is_missing_table};
pub use fallback::{DEFAULT_CLAIM_TTL, DEFAULT_COMPLETED_TTL, KvIdempotencyStore};
pub use idempotency::{ClaimOutcome, ClaimRef, ClaimStatus, IdempotencyClaim, IdempotencyScope};
pub use job::{DEFAULT_MAX_ATTEMPTS, DeadLetter, DeadLetterQuery, Job, JobStatus, NewJob};
pub use memory::{
    InMemoryCartLock, InMemoryDeadLetterStore, InMemoryIdempotencyStore, InMemoryJobStore,
    InMemoryKeyValueStore, InMemorySagaLog,
};
pub use postgres::PostgresStore;
pub use store::{
    CartLock, CartLockGuard, DeadLetterStore, IdempotencyStore, JobStore, KeyValueStore,
    SagaLogEntry, SagaLogStore,
};
