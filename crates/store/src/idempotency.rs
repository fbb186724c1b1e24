//! Idempotency claim types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The namespace an idempotency key belongs to.
///
/// The same raw key may appear in different scopes (a provider message ID
/// and a notification key can collide); uniqueness is on `(key, scope)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdempotencyScope {
    /// Inbound provider webhooks (messages, delivery statuses).
    Webhook,
    /// Outbound customer notifications.
    Notification,
    /// Payment gateway events.
    Payment,
}

impl IdempotencyScope {
    /// Returns the scope name as stored.
    pub fn as_str(&self) -> &'static str {
        match self {
            IdempotencyScope::Webhook => "webhook",
            IdempotencyScope::Notification => "notification",
            IdempotencyScope::Payment => "payment",
        }
    }

    /// Parses a stored scope name.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "webhook" => Some(IdempotencyScope::Webhook),
            "notification" => Some(IdempotencyScope::Notification),
            "payment" => Some(IdempotencyScope::Payment),
            _ => None,
        }
    }
}

impl std::fmt::Display for IdempotencyScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle of a claim. `Claimed` moves to `Completed` exactly once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClaimStatus {
    Claimed,
    Completed,
}

impl ClaimStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClaimStatus::Claimed => "claimed",
            ClaimStatus::Completed => "completed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "claimed" => Some(ClaimStatus::Claimed),
            "completed" => Some(ClaimStatus::Completed),
            _ => None,
        }
    }
}

/// The result of attempting to claim an idempotency key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClaimOutcome {
    /// The caller now owns the key and must complete or release it.
    Claimed,
    /// Another worker holds the key and has not finished.
    AlreadyProcessing,
    /// The key was completed earlier.
    AlreadyProcessed,
}

impl ClaimOutcome {
    /// Returns true if the caller won the claim.
    pub fn is_claimed(&self) -> bool {
        matches!(self, ClaimOutcome::Claimed)
    }

    /// Outcome for an existing row in the given status.
    pub fn for_existing(status: ClaimStatus) -> Self {
        match status {
            ClaimStatus::Claimed => ClaimOutcome::AlreadyProcessing,
            ClaimStatus::Completed => ClaimOutcome::AlreadyProcessed,
        }
    }
}

/// A persisted idempotency claim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdempotencyClaim {
    pub key: String,
    pub scope: IdempotencyScope,
    pub status: ClaimStatus,
    pub claimed_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// A reference to a claim held on behalf of a job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClaimRef {
    pub key: String,
    pub scope: IdempotencyScope,
}

impl ClaimRef {
    pub fn new(key: impl Into<String>, scope: IdempotencyScope) -> Self {
        Self {
            key: key.into(),
            scope,
        }
    }
}

impl std::fmt::Display for ClaimRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.scope, self.key)
    }
}
