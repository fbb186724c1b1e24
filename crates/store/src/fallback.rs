//! Best-effort idempotency on top of a [`KeyValueStore`].
//!
//! Used when the durable claims table is unavailable. Entries expire, so
//! the guarantee only holds within the TTL and, with the in-memory store,
//! only within one process.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use common::{Clock, SystemClock};

use crate::{
    ClaimOutcome, ClaimStatus, IdempotencyClaim, IdempotencyScope, IdempotencyStore,
    KeyValueStore, Result, StoreError,
};

/// How long an in-flight claim survives without completion.
pub const DEFAULT_CLAIM_TTL: Duration = Duration::from_secs(15 * 60);

/// How long a completed claim is remembered.
pub const DEFAULT_COMPLETED_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// TTL-cache idempotency store.
#[derive(Clone)]
pub struct KvIdempotencyStore<K: KeyValueStore> {
    kv: K,
    clock: Arc<dyn Clock>,
    claim_ttl: Duration,
    completed_ttl: Duration,
}

impl<K: KeyValueStore> KvIdempotencyStore<K> {
    pub fn new(kv: K) -> Self {
        Self {
            kv,
            clock: Arc::new(SystemClock),
            claim_ttl: DEFAULT_CLAIM_TTL,
            completed_ttl: DEFAULT_COMPLETED_TTL,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_ttls(mut self, claim_ttl: Duration, completed_ttl: Duration) -> Self {
        self.claim_ttl = claim_ttl;
        self.completed_ttl = completed_ttl;
        self
    }

    fn cache_key(key: &str, scope: IdempotencyScope) -> String {
        format!("idempotency:{}:{}", scope.as_str(), key)
    }

    async fn read(&self, key: &str, scope: IdempotencyScope) -> Result<Option<IdempotencyClaim>> {
        match self.kv.get(&Self::cache_key(key, scope)).await? {
            Some(value) => serde_json::from_value(value)
                .map(Some)
                .map_err(|e| StoreError::Corrupt {
                    entity: "idempotency claim",
                    reason: e.to_string(),
                }),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl<K: KeyValueStore> IdempotencyStore for KvIdempotencyStore<K> {
    async fn claim(&self, key: &str, scope: IdempotencyScope) -> Result<ClaimOutcome> {
        let claim = IdempotencyClaim {
            key: key.to_string(),
            scope,
            status: ClaimStatus::Claimed,
            claimed_at: self.clock.now(),
            completed_at: None,
        };
        let cache_key = Self::cache_key(key, scope);
        if self
            .kv
            .add(&cache_key, serde_json::to_value(&claim)?, Some(self.claim_ttl))
            .await?
        {
            return Ok(ClaimOutcome::Claimed);
        }

        match self.read(key, scope).await? {
            Some(existing) => Ok(ClaimOutcome::for_existing(existing.status)),
            // Expired between add and read; treat as in flight rather than
            // risk a double claim.
            None => Ok(ClaimOutcome::AlreadyProcessing),
        }
    }

    async fn complete(&self, key: &str, scope: IdempotencyScope) -> Result<()> {
        let now = self.clock.now();
        let claimed_at = self
            .read(key, scope)
            .await?
            .map(|c| c.claimed_at)
            .unwrap_or(now);
        let claim = IdempotencyClaim {
            key: key.to_string(),
            scope,
            status: ClaimStatus::Completed,
            claimed_at,
            completed_at: Some(now),
        };
        self.kv
            .set(
                &Self::cache_key(key, scope),
                serde_json::to_value(&claim)?,
                Some(self.completed_ttl),
            )
            .await
    }

    async fn release(&self, key: &str, scope: IdempotencyScope) -> Result<bool> {
        match self.read(key, scope).await? {
            Some(claim) if claim.status == ClaimStatus::Claimed => {
                self.kv.delete(&Self::cache_key(key, scope)).await
            }
            _ => Ok(false),
        }
    }

    async fn get_claim(
        &self,
        key: &str,
        scope: IdempotencyScope,
    ) -> Result<Option<IdempotencyClaim>> {
        self.read(key, scope).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::InMemoryKeyValueStore;
    use common::ManualClock;

    fn store_with_clock() -> (KvIdempotencyStore<InMemoryKeyValueStore>, ManualClock) {
        let clock = ManualClock::default();
        let kv = InMemoryKeyValueStore::with_clock(Arc::new(clock.clone()));
        let store = KvIdempotencyStore::new(kv)
            .with_clock(Arc::new(clock.clone()))
            .with_ttls(Duration::from_secs(60), Duration::from_secs(600));
        (store, clock)
    }

    #[tokio::test]
    async fn claim_complete_cycle() {
        let (store, _) = store_with_clock();
        let scope = IdempotencyScope::Webhook;
        assert_eq!(store.claim("m1", scope).await.unwrap(), ClaimOutcome::Claimed);
        assert_eq!(
            store.claim("m1", scope).await.unwrap(),
            ClaimOutcome::AlreadyProcessing
        );
        store.complete("m1", scope).await.unwrap();
        assert_eq!(
            store.claim("m1", scope).await.unwrap(),
            ClaimOutcome::AlreadyProcessed
        );
    }

    #[tokio::test]
    async fn abandoned_claims_expire() {
        let (store, clock) = store_with_clock();
        let scope = IdempotencyScope::Notification;
        store.claim("n1", scope).await.unwrap();
        clock.advance(chrono::Duration::seconds(61));
        assert_eq!(store.claim("n1", scope).await.unwrap(), ClaimOutcome::Claimed);
    }

    #[tokio::test]
    async fn completed_claims_outlive_claim_ttl() {
        let (store, clock) = store_with_clock();
        let scope = IdempotencyScope::Payment;
        store.claim("evt", scope).await.unwrap();
        store.complete("evt", scope).await.unwrap();
        clock.advance(chrono::Duration::seconds(120));
        assert_eq!(
            store.claim("evt", scope).await.unwrap(),
            ClaimOutcome::AlreadyProcessed
        );
    }

    #[tokio::test]
    async fn release_only_affects_in_flight_claims() {
        let (store, _) = store_with_clock();
        let scope = IdempotencyScope::Webhook;
        store.claim("a", scope).await.unwrap();
        assert!(store.release("a", scope).await.unwrap());
        assert!(store.get_claim("a", scope).await.unwrap().is_none());

        store.claim("b", scope).await.unwrap();
        store.complete("b", scope).await.unwrap();
        assert!(!store.release("b", scope).await.unwrap());
    }
}
