//! API error types with HTTP response mapping.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use reliability::ProcessError;
use saga::SagaError;
use store::StoreError;

use crate::signature::SignatureError;

/// API-level error type that maps to HTTP responses.
#[derive(Debug)]
pub enum ApiError {
    /// Resource not found.
    NotFound(String),
    /// Bad request from the client.
    BadRequest(String),
    /// Webhook signature problem.
    Signature(SignatureError),
    /// Verify token mismatch and similar refusals.
    Forbidden(String),
    /// The request conflicts with current state.
    Conflict(String),
    /// Job processing error surfaced synchronously.
    Process(ProcessError),
    /// Saga error.
    Saga(SagaError),
    /// Internal server error.
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Signature(err) => signature_error_to_response(err),
            ApiError::Forbidden(msg) => (StatusCode::FORBIDDEN, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::Process(err) => process_error_to_response(err),
            ApiError::Saga(err) => saga_error_to_response(err),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };

        if status.is_server_error() {
            tracing::error!(error = %message, "internal server error");
        }

        let body = serde_json::json!({ "error": message });
        (status, axum::Json(body)).into_response()
    }
}

fn signature_error_to_response(err: SignatureError) -> (StatusCode, String) {
    metrics::counter!("webhook_rejected_total", "reason" => signature_reason(&err)).increment(1);
    match err {
        SignatureError::Missing => (StatusCode::UNAUTHORIZED, err.to_string()),
        SignatureError::Malformed | SignatureError::Invalid | SignatureError::Stale => {
            (StatusCode::FORBIDDEN, err.to_string())
        }
    }
}

fn signature_reason(err: &SignatureError) -> &'static str {
    match err {
        SignatureError::Missing => "missing",
        SignatureError::Malformed => "malformed",
        SignatureError::Invalid => "invalid",
        SignatureError::Stale => "stale",
    }
}

fn store_error_to_response(err: &StoreError) -> StatusCode {
    match err {
        StoreError::NotFound { .. } => StatusCode::NOT_FOUND,
        StoreError::InvalidState { .. } => StatusCode::CONFLICT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn process_error_to_response(err: ProcessError) -> (StatusCode, String) {
    let status = match &err {
        ProcessError::Validation(_) => StatusCode::BAD_REQUEST,
        ProcessError::Store(store_err) => store_error_to_response(store_err),
        ProcessError::CircuitOpen { .. } => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, err.to_string())
}

fn saga_error_to_response(err: SagaError) -> (StatusCode, String) {
    let status = match &err {
        SagaError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
        SagaError::NotFound(_) => StatusCode::NOT_FOUND,
        SagaError::Store(store_err) => store_error_to_response(store_err),
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, err.to_string())
}

impl From<SignatureError> for ApiError {
    fn from(err: SignatureError) -> Self {
        ApiError::Signature(err)
    }
}

impl From<ProcessError> for ApiError {
    fn from(err: ProcessError) -> Self {
        ApiError::Process(err)
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        ApiError::Process(ProcessError::Store(err))
    }
}

impl From<SagaError> for ApiError {
    fn from(err: SagaError) -> Self {
        ApiError::Saga(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_errors_map_to_auth_statuses() {
        let missing = ApiError::from(SignatureError::Missing).into_response();
        assert_eq!(missing.status(), StatusCode::UNAUTHORIZED);
        let stale = ApiError::from(SignatureError::Stale).into_response();
        assert_eq!(stale.status(), StatusCode::FORBIDDEN);
    }

    #[test]
    fn store_errors_keep_their_meaning() {
        let not_found = ApiError::from(StoreError::NotFound {
            entity: "dead letter",
            id: "x".to_string(),
        });
        assert_eq!(not_found.into_response().status(), StatusCode::NOT_FOUND);

        let replayed = ApiError::from(ProcessError::Store(StoreError::InvalidState {
            entity: "dead letter",
            id: "x".to_string(),
            reason: "already replayed".to_string(),
        }));
        assert_eq!(replayed.into_response().status(), StatusCode::CONFLICT);
    }

    #[test]
    fn validation_is_a_client_error() {
        let err = ApiError::from(ProcessError::validation("missing field `message_id`"));
        assert_eq!(err.into_response().status(), StatusCode::BAD_REQUEST);
    }
}
