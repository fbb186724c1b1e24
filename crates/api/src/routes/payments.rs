//! Payment gateway webhooks.
//!
//! Signatures are checked by the [`VerifiedPayment`] extractor, so handlers
//! only ever see authenticated events.

use std::sync::Arc;

use axum::Json;
use axum::body::Bytes;
use axum::extract::{FromRequest, FromRequestParts, Path, Request, State};
use processors::handlers::PAYMENT_EVENT;
use serde::Serialize;

use super::{Admission, admit};
use crate::error::ApiError;
use crate::signature::{self, SignatureError};
use crate::state::AppState;

/// A payment event whose signature has been verified.
#[derive(Debug)]
pub struct VerifiedPayment {
    pub gateway: String,
    /// Event body with `gateway` (and `event_id`, when the gateway sent `id`) filled in.
    pub payload: serde_json::Value,
}

impl FromRequest<Arc<AppState>> for VerifiedPayment {
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &Arc<AppState>) -> Result<Self, Self::Rejection> {
        let (mut parts, body) = req.into_parts();
        let named = Path::<String>::from_request_parts(&mut parts, state)
            .await
            .ok()
            .map(|Path(gateway)| gateway);
        let headers = parts.headers.clone();

        let gateway = match named {
            Some(name) => state
                .config
                .gateway(&name)
                .ok_or_else(|| ApiError::NotFound(format!("unknown payment gateway `{name}`")))?,
            // Shared endpoint: the signature header names the gateway.
            None => state
                .config
                .payment_gateways
                .iter()
                .find(|g| headers.contains_key(g.signature_header().as_str()))
                .ok_or(SignatureError::Missing)?,
        };

        let body = Bytes::from_request(Request::from_parts(parts, body), state)
            .await
            .map_err(|e| ApiError::BadRequest(e.body_text()))?;

        signature::verify_payment(
            gateway,
            &headers,
            &body,
            state.clock.now().timestamp(),
            state.config.replay_window,
        )?;

        let mut payload: serde_json::Value = serde_json::from_slice(&body)
            .map_err(|e| ApiError::BadRequest(format!("malformed payment event: {e}")))?;
        let object = payload
            .as_object_mut()
            .ok_or_else(|| ApiError::BadRequest("payment event must be an object".to_string()))?;
        if !object.contains_key("event_id")
            && let Some(id) = object.get("id").cloned()
        {
            object.insert("event_id".to_string(), id);
        }
        object.insert("gateway".to_string(), gateway.name.clone().into());

        Ok(Self {
            gateway: gateway.name.clone(),
            payload,
        })
    }
}

#[derive(Debug, Serialize)]
pub struct PaymentWebhookResponse {
    pub gateway: String,
    pub status: Admission,
}

/// POST /webhooks/payments and /webhooks/payments/{gateway}
#[tracing::instrument(skip_all, fields(gateway = %event.gateway))]
pub async fn receive(
    State(state): State<Arc<AppState>>,
    event: VerifiedPayment,
) -> Result<Json<PaymentWebhookResponse>, ApiError> {
    let status = admit(&state, PAYMENT_EVENT, event.payload).await?;
    tracing::info!(?status, "payment webhook received");
    Ok(Json(PaymentWebhookResponse {
        gateway: event.gateway,
        status,
    }))
}
