//! Customer preferences and operator alerting.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reliability::Result;
use tokio::sync::RwLock;

/// Per-customer messaging preferences.
#[async_trait]
pub trait PreferenceStore: Send + Sync {
    async fn is_opted_out(&self, customer: &str) -> Result<bool>;

    async fn set_opted_out(&self, customer: &str, opted_out: bool) -> Result<()>;
}

#[derive(Debug, Clone, Default)]
pub struct InMemoryPreferenceStore {
    opted_out: Arc<RwLock<HashSet<String>>>,
}

impl InMemoryPreferenceStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PreferenceStore for InMemoryPreferenceStore {
    async fn is_opted_out(&self, customer: &str) -> Result<bool> {
        Ok(self.opted_out.read().await.contains(customer))
    }

    async fn set_opted_out(&self, customer: &str, opted_out: bool) -> Result<()> {
        let mut set = self.opted_out.write().await;
        if opted_out {
            set.insert(customer.to_string());
        } else {
            set.remove(customer);
        }
        Ok(())
    }
}

/// An alert raised for a human operator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Alert {
    pub subject: String,
    pub message: String,
    pub raised_at: DateTime<Utc>,
}

/// Notifies operators about conditions needing attention.
#[async_trait]
pub trait OperatorAlerter: Send + Sync {
    async fn alert(&self, subject: &str, message: &str) -> Result<()>;
}

/// Logs alerts at error level and keeps them for inspection.
#[derive(Debug, Clone, Default)]
pub struct InMemoryAlerter {
    alerts: Arc<RwLock<Vec<Alert>>>,
}

impl InMemoryAlerter {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn alerts(&self) -> Vec<Alert> {
        self.alerts.read().await.clone()
    }
}

#[async_trait]
impl OperatorAlerter for InMemoryAlerter {
    async fn alert(&self, subject: &str, message: &str) -> Result<()> {
        tracing::error!(subject, message, "operator alert");
        self.alerts.write().await.push(Alert {
            subject: subject.to_string(),
            message: message.to_string(),
            raised_at: Utc::now(),
        });
        Ok(())
    }
}
