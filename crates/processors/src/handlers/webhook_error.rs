use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reliability::{CircuitBreaker, ProcessError, Result};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use store::{IdempotencyScope, KeyValueStore};

use super::WEBHOOK_ERROR;
use crate::processor::{ProcessOutcome, QueueProcessor, parse_payload};
use crate::services::OperatorAlerter;

/// How a provider error code affects the rest of the system.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    RateLimit,
    Auth,
    Template,
    Recipient,
    Generic,
}

impl ErrorCategory {
    pub fn from_code(code: i64) -> Self {
        match code {
            4 | 80007 | 130429 | 131048 | 131056 => Self::RateLimit,
            0 | 190 => Self::Auth,
            132000..=132999 => Self::Template,
            131026 | 131047 => Self::Recipient,
            _ => Self::Generic,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RateLimit => "rate_limit",
            Self::Auth => "auth",
            Self::Template => "template",
            Self::Recipient => "recipient",
            Self::Generic => "generic",
        }
    }

    /// Errors that mean the provider itself is unusable right now.
    pub fn trips_breaker(&self) -> bool {
        matches!(self, Self::RateLimit | Self::Auth)
    }

    /// Errors an operator has to fix.
    pub fn needs_operator(&self) -> bool {
        matches!(self, Self::RateLimit | Self::Auth | Self::Template)
    }
}

#[derive(Debug, Deserialize)]
struct ProviderErrorEvent {
    code: i64,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    message_id: Option<String>,
    #[serde(default)]
    recipient: Option<String>,
}

/// Reacts to provider error callbacks: feeds the messaging breaker and
/// pages an operator, at most once per category per alert window.
pub struct WebhookErrorProcessor {
    breaker: Arc<CircuitBreaker>,
    alerter: Arc<dyn OperatorAlerter>,
    kv: Arc<dyn KeyValueStore>,
    alert_window: Duration,
}

impl WebhookErrorProcessor {
    pub fn new(
        breaker: Arc<CircuitBreaker>,
        alerter: Arc<dyn OperatorAlerter>,
        kv: Arc<dyn KeyValueStore>,
    ) -> Self {
        Self {
            breaker,
            alerter,
            kv,
            alert_window: Duration::from_secs(15 * 60),
        }
    }

    pub fn with_alert_window(mut self, window: Duration) -> Self {
        self.alert_window = window;
        self
    }

    async fn alert_once(&self, category: ErrorCategory, event: &ProviderErrorEvent) -> Result<bool> {
        let gate = format!("alert:{}", category.as_str());
        let value = serde_json::json!({"code": event.code});
        if !self.kv.add(&gate, value, Some(self.alert_window)).await? {
            return Ok(false);
        }

        let subject = format!("Messaging provider {} error", category.as_str());
        let message = format!(
            "code {}: {}",
            event.code,
            event.title.as_deref().unwrap_or("no details")
        );
        if let Err(e) = self.alerter.alert(&subject, &message).await {
            // Let the retry raise the alert.
            self.kv.delete(&gate).await?;
            return Err(e);
        }
        Ok(true)
    }
}

#[async_trait]
impl QueueProcessor for WebhookErrorProcessor {
    fn name(&self) -> &'static str {
        "WebhookErrorProcessor"
    }

    fn hook_name(&self) -> &'static str {
        WEBHOOK_ERROR
    }

    fn scope(&self) -> IdempotencyScope {
        IdempotencyScope::Webhook
    }

    /// `{message_id}:{code}`, or a digest of the whole payload when the
    /// error is not tied to a message.
    fn idempotency_key(&self, payload: &serde_json::Value) -> Result<String> {
        let code = payload
            .get("code")
            .and_then(serde_json::Value::as_i64)
            .ok_or_else(|| ProcessError::validation("missing numeric field `code`"))?;
        match payload.get("message_id").and_then(serde_json::Value::as_str) {
            Some(message_id) if !message_id.is_empty() => Ok(format!("{message_id}:{code}")),
            _ => {
                let digest = Sha256::digest(payload.to_string().as_bytes());
                Ok(format!("{code}:{}", hex::encode(digest)))
            }
        }
    }

    #[tracing::instrument(skip(self, payload))]
    async fn process(&self, payload: &serde_json::Value) -> Result<ProcessOutcome> {
        let event: ProviderErrorEvent = parse_payload(payload)?;
        let category = ErrorCategory::from_code(event.code);

        metrics::counter!("provider_errors_total", "category" => category.as_str())
            .increment(1);
        tracing::warn!(
            code = event.code,
            category = category.as_str(),
            message_id = event.message_id.as_deref().unwrap_or("-"),
            recipient = event.recipient.as_deref().unwrap_or("-"),
            "provider error"
        );

        if category.trips_breaker() {
            let reason = format!("provider error {}", event.code);
            if self.breaker.record_failure(reason) {
                tracing::warn!(service = self.breaker.service_id(), "messaging circuit opened");
            }
        }

        if category.needs_operator() && !self.alert_once(category, &event).await? {
            tracing::debug!(category = category.as_str(), "alert suppressed");
        }

        Ok(ProcessOutcome::Completed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::InMemoryAlerter;
    use async_trait::async_trait;
    use reliability::{CircuitBreakerConfig, CircuitState};
    use serde_json::json;
    use store::InMemoryKeyValueStore;

    fn processor(threshold: u32) -> (WebhookErrorProcessor, Arc<CircuitBreaker>, InMemoryAlerter) {
        let breaker = Arc::new(CircuitBreaker::new(
            "messaging",
            CircuitBreakerConfig {
                failure_threshold: threshold,
                ..Default::default()
            },
        ));
        let alerter = InMemoryAlerter::new();
        let processor = WebhookErrorProcessor::new(
            breaker.clone(),
            Arc::new(alerter.clone()),
            Arc::new(InMemoryKeyValueStore::new()),
        );
        (processor, breaker, alerter)
    }

    #[test]
    fn categorizes_codes() {
        assert_eq!(ErrorCategory::from_code(130429), ErrorCategory::RateLimit);
        assert_eq!(ErrorCategory::from_code(190), ErrorCategory::Auth);
        assert_eq!(ErrorCategory::from_code(132001), ErrorCategory::Template);
        assert_eq!(ErrorCategory::from_code(131026), ErrorCategory::Recipient);
        assert_eq!(ErrorCategory::from_code(500), ErrorCategory::Generic);
    }

    #[test]
    fn errors_without_a_message_are_keyed_by_content() {
        let (processor, _, _) = processor(3);
        let expired = json!({"code": 190, "title": "Token expired"});
        let revoked = json!({"code": 190, "title": "Token revoked"});

        let key = processor.idempotency_key(&expired).unwrap();
        assert!(key.starts_with("190:"));
        let redelivered = json!({"code": 190, "title": "Token expired"});
        assert_eq!(key, processor.idempotency_key(&redelivered).unwrap());
        assert_ne!(key, processor.idempotency_key(&revoked).unwrap());
        assert_eq!(
            processor
                .idempotency_key(&json!({"code": 190, "message_id": "wamid.1"}))
                .unwrap(),
            "wamid.1:190"
        );
        assert!(processor.idempotency_key(&json!({"code": "x"})).is_err());
    }

    #[tokio::test]
    async fn rate_limits_open_the_breaker() {
        let (processor, breaker, _) = processor(2);
        for i in 0..2 {
            processor
                .process(&json!({"code": 130429, "message_id": format!("m{i}")}))
                .await
                .unwrap();
        }
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn recipient_errors_leave_the_breaker_alone() {
        let (processor, breaker, alerter) = processor(1);
        processor.process(&json!({"code": 131026})).await.unwrap();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert!(alerter.alerts().await.is_empty());
    }

    #[tokio::test]
    async fn alerts_once_per_window() {
        let (processor, _, alerter) = processor(10);
        processor
            .process(&json!({"code": 132001, "title": "Template missing"}))
            .await
            .unwrap();
        processor.process(&json!({"code": 132005})).await.unwrap();
        processor.process(&json!({"code": 190})).await.unwrap();

        let alerts = alerter.alerts().await;
        assert_eq!(alerts.len(), 2);
        assert!(alerts[0].message.contains("Template missing"));
    }

    struct FailingAlerter;

    #[async_trait]
    impl OperatorAlerter for FailingAlerter {
        async fn alert(&self, _subject: &str, _message: &str) -> Result<()> {
            Err(ProcessError::network("pager down"))
        }
    }

    #[tokio::test]
    async fn failed_alert_releases_the_window() {
        let kv = InMemoryKeyValueStore::new();
        let processor = WebhookErrorProcessor::new(
            Arc::new(CircuitBreaker::new("messaging", CircuitBreakerConfig::default())),
            Arc::new(FailingAlerter),
            Arc::new(kv.clone()),
        );
        assert!(processor.process(&json!({"code": 190})).await.is_err());
        assert!(kv.get("alert:auth").await.unwrap().is_none());
    }
}
