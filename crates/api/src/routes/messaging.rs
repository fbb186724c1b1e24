//! Messaging provider webhook: subscription handshake and event delivery.

use std::sync::Arc;

use axum::Json;
use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::HeaderMap;
use processors::handlers::{DELIVERY_STATUS, INBOUND_MESSAGE};
use serde::{Deserialize, Serialize};
use serde_json::json;

use super::{Admission, admit};
use crate::error::ApiError;
use crate::signature;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct VerifyParams {
    #[serde(rename = "hub.mode")]
    pub mode: Option<String>,
    #[serde(rename = "hub.verify_token")]
    pub verify_token: Option<String>,
    #[serde(rename = "hub.challenge")]
    pub challenge: Option<String>,
}

/// GET /webhooks/messaging: echoes the challenge when the verify token matches.
#[tracing::instrument(skip_all)]
pub async fn verify(
    State(state): State<Arc<AppState>>,
    Query(params): Query<VerifyParams>,
) -> Result<String, ApiError> {
    let expected = state.config.messaging_verify_token.as_deref();
    let matches = params.mode.as_deref() == Some("subscribe")
        && expected.is_some()
        && params.verify_token.as_deref() == expected;
    match (matches, params.challenge) {
        (true, Some(challenge)) => {
            tracing::info!("messaging webhook subscription verified");
            Ok(challenge)
        }
        _ => Err(ApiError::Forbidden("verification failed".to_string())),
    }
}

// -- Provider envelope --

#[derive(Debug, Default, Deserialize)]
struct Envelope {
    #[serde(default)]
    entry: Vec<Entry>,
}

#[derive(Debug, Default, Deserialize)]
struct Entry {
    #[serde(default)]
    changes: Vec<Change>,
}

#[derive(Debug, Default, Deserialize)]
struct Change {
    #[serde(default)]
    value: ChangeValue,
}

#[derive(Debug, Default, Deserialize)]
struct ChangeValue {
    #[serde(default)]
    messages: Vec<ProviderMessage>,
    #[serde(default)]
    statuses: Vec<ProviderStatus>,
}

#[derive(Debug, Deserialize)]
struct ProviderMessage {
    id: String,
    from: String,
    #[serde(default)]
    timestamp: Option<String>,
    #[serde(rename = "type", default)]
    kind: Option<String>,
    #[serde(default)]
    text: Option<TextBody>,
}

#[derive(Debug, Deserialize)]
struct TextBody {
    body: String,
}

#[derive(Debug, Deserialize)]
struct ProviderStatus {
    id: String,
    status: String,
    #[serde(default)]
    recipient_id: Option<String>,
    #[serde(default)]
    errors: Vec<serde_json::Value>,
}

impl ProviderMessage {
    fn into_payload(self) -> serde_json::Value {
        let received_at = self
            .timestamp
            .and_then(|ts| ts.parse::<i64>().ok())
            .and_then(|ts| chrono::DateTime::from_timestamp(ts, 0));
        json!({
            "message_id": self.id,
            "from": self.from,
            "text": self.text.map(|t| t.body),
            "message_type": self.kind.unwrap_or_else(|| "text".to_string()),
            "received_at": received_at,
        })
    }
}

impl ProviderStatus {
    fn into_payload(self) -> serde_json::Value {
        json!({
            "message_id": self.id,
            "status": self.status,
            "recipient": self.recipient_id,
            "errors": self.errors,
        })
    }
}

#[derive(Debug, Default, Serialize)]
pub struct ReceiveResponse {
    pub accepted: usize,
    pub duplicates: usize,
}

impl ReceiveResponse {
    fn count(&mut self, admission: Admission) {
        match admission {
            Admission::Accepted => self.accepted += 1,
            Admission::Duplicate => self.duplicates += 1,
        }
    }
}

/// POST /webhooks/messaging: verifies, deduplicates and enqueues each event.
#[tracing::instrument(skip_all)]
pub async fn receive(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<ReceiveResponse>, ApiError> {
    let secret = state
        .config
        .messaging_app_secret
        .as_deref()
        .ok_or_else(|| ApiError::Internal("messaging webhook secret not configured".to_string()))?;
    signature::verify_messaging(
        secret,
        &headers,
        &body,
        state.clock.now().timestamp(),
        state.config.replay_window,
    )?;

    let envelope: Envelope = serde_json::from_slice(&body)
        .map_err(|e| ApiError::BadRequest(format!("malformed webhook body: {e}")))?;

    let mut response = ReceiveResponse::default();
    for change in envelope.entry.into_iter().flat_map(|e| e.changes) {
        for message in change.value.messages {
            response.count(admit(&state, INBOUND_MESSAGE, message.into_payload()).await?);
        }
        for status in change.value.statuses {
            response.count(admit(&state, DELIVERY_STATUS, status.into_payload()).await?);
        }
    }

    tracing::info!(
        accepted = response.accepted,
        duplicates = response.duplicates,
        "messaging webhook received"
    );
    Ok(Json(response))
}
