//! Integration tests for the API server.

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use api::config::{Config, GatewayConfig};
use api::signature::{HUB_SIGNATURE_HEADER, WEBHOOK_TIMESTAMP_HEADER, sign};
use api::{AppState, Collaborators};
use axum::body::Body;
use axum::http::{Request, StatusCode};
use metrics_exporter_prometheus::PrometheusHandle;
use processors::handlers::{DELIVERY_STATUS, ORDER_NOTIFICATION, PAYMENT_EVENT};
use processors::{HIGH_PRIORITY, NORMAL_PRIORITY};
use processors::services::PaymentStatus;
use serde_json::{Value, json};
use store::JobStore;
use tower::ServiceExt;

const APP_SECRET: &str = "app-secret";
const VERIFY_TOKEN: &str = "verify-me";

static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

fn get_metrics_handle() -> PrometheusHandle {
    METRICS_HANDLE
        .get_or_init(|| {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            builder
                .install_recorder()
                .expect("failed to install Prometheus recorder")
        })
        .clone()
}

fn test_config() -> Config {
    Config {
        messaging_app_secret: Some(APP_SECRET.to_string()),
        messaging_verify_token: Some(VERIFY_TOKEN.to_string()),
        payment_gateways: vec![
            "stripe:signed_payload:whsec_test".parse::<GatewayConfig>().unwrap(),
            "adyen:timestamped_headers:adyen_key".parse::<GatewayConfig>().unwrap(),
        ],
        saga_step_timeout: Duration::from_secs(2),
        ..Default::default()
    }
}

fn setup_with_state() -> (axum::Router, Arc<AppState>, Collaborators) {
    let (state, collaborators) = api::create_default_state(test_config());
    let app = api::create_app(state.clone(), get_metrics_handle());
    (app, state, collaborators)
}

fn setup() -> axum::Router {
    setup_with_state().0
}

fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

async fn body_json(response: axum::response::Response) -> Value {
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&body).unwrap()
}

fn messaging_request(body: &str, signature: Option<String>) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri("/webhooks/messaging")
        .header("content-type", "application/json");
    if let Some(sig) = signature {
        builder = builder.header(HUB_SIGNATURE_HEADER, sig);
    }
    builder.body(Body::from(body.to_string())).unwrap()
}

fn signed_messaging_request(body: &str) -> Request<Body> {
    let sig = format!("sha256={}", sign(APP_SECRET, &[body.as_bytes()]));
    messaging_request(body, Some(sig))
}

fn inbound_text(message_id: &str, text: &str) -> String {
    json!({
        "object": "whatsapp_business_account",
        "entry": [{"changes": [{"value": {
            "messages": [{"id": message_id, "from": "15550001", "timestamp": now().to_string(),
                          "type": "text", "text": {"body": text}}]
        }}]}]
    })
    .to_string()
}

async fn drain(state: &AppState) {
    let worker = state.worker();
    while worker.run_once().await.unwrap() > 0 {}
}

#[tokio::test]
async fn test_health_check() {
    let app = setup();

    let response = app
        .oneshot(
            Request::builder()
                .uri("/health")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["status"], "ok");
    assert_eq!(json["pending_jobs"], 0);
}

#[tokio::test]
async fn test_subscription_verification() {
    let app = setup();

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri(format!(
                    "/webhooks/messaging?hub.mode=subscribe&hub.verify_token={VERIFY_TOKEN}&hub.challenge=1158201444"
                ))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    assert_eq!(&body[..], b"1158201444");

    let response = app
        .oneshot(
            Request::builder()
                .uri("/webhooks/messaging?hub.mode=subscribe&hub.verify_token=wrong&hub.challenge=1")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_messaging_webhook_rejects_unsigned_and_forged() {
    let app = setup();
    let body = inbound_text("wamid.auth", "hello");

    let response = app
        .clone()
        .oneshot(messaging_request(&body, None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let forged = format!("sha256={}", sign("not-the-secret", &[body.as_bytes()]));
    let response = app
        .oneshot(messaging_request(&body, Some(forged)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_messaging_webhook_rejects_stale_timestamp() {
    let app = setup();
    let body = inbound_text("wamid.stale", "hello");
    let mut request = signed_messaging_request(&body);
    request.headers_mut().insert(
        WEBHOOK_TIMESTAMP_HEADER,
        (now() - 600).to_string().parse().unwrap(),
    );

    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_messaging_webhook_rejects_malformed_body() {
    let app = setup();
    let response = app
        .oneshot(signed_messaging_request("{not json"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_missing_secret_is_a_server_error() {
    let (state, _) = api::create_default_state(Config::default());
    let app = api::create_app(state, get_metrics_handle());

    let response = app
        .oneshot(signed_messaging_request(&inbound_text("wamid.x", "hi")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
}

#[tokio::test]
async fn test_duplicate_delivery_is_acknowledged_without_side_effects() {
    let (app, state, collaborators) = setup_with_state();
    let body = inbound_text("wamid.dup", "where is my order?");

    let first = app
        .clone()
        .oneshot(signed_messaging_request(&body))
        .await
        .unwrap();
    assert_eq!(first.status(), StatusCode::OK);
    assert_eq!(body_json(first).await["accepted"], 1);

    let second = app
        .oneshot(signed_messaging_request(&body))
        .await
        .unwrap();
    assert_eq!(second.status(), StatusCode::OK);
    let json = body_json(second).await;
    assert_eq!(json["accepted"], 0);
    assert_eq!(json["duplicates"], 1);

    drain(&state).await;
    assert_eq!(collaborators.messages.count().await, 1);
}

#[tokio::test]
async fn test_failed_delivery_status_reaches_operator() {
    let (app, state, collaborators) = setup_with_state();
    let body = json!({
        "entry": [{"changes": [{"value": {
            "statuses": [{"id": "wamid.out", "status": "failed", "recipient_id": "15550002",
                          "errors": [{"code": 190, "title": "Access token expired"}]}]
        }}]}]
    })
    .to_string();

    let response = app.oneshot(signed_messaging_request(&body)).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    drain(&state).await;
    let alerts = collaborators.alerter.alerts().await;
    assert_eq!(alerts.len(), 1);
    assert!(alerts[0].subject.contains("auth"));
}

fn stripe_request(uri: &str, body: &str, timestamp: i64) -> Request<Body> {
    let sig = sign(
        "whsec_test",
        &[timestamp.to_string().as_bytes(), b".", body.as_bytes()],
    );
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .header("stripe-signature", format!("t={timestamp},v1={sig}"))
        .body(Body::from(body.to_string()))
        .unwrap()
}

#[tokio::test]
async fn test_payment_webhook_shared_endpoint() {
    let (app, state, collaborators) = setup_with_state();
    let body = json!({
        "id": "evt_123",
        "type": "payment.succeeded",
        "order_id": "ORD-9",
        "customer_id": "c1",
        "phone": "15550001"
    })
    .to_string();

    let response = app
        .clone()
        .oneshot(stripe_request("/webhooks/payments", &body, now()))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["gateway"], "stripe");
    assert_eq!(json["status"], "accepted");

    // Redelivery of the same event ID.
    let response = app
        .oneshot(stripe_request("/webhooks/payments", &body, now()))
        .await
        .unwrap();
    assert_eq!(body_json(response).await["status"], "duplicate");

    drain(&state).await;
    assert_eq!(
        collaborators.payment_statuses.history("ORD-9").await,
        vec![PaymentStatus::Paid]
    );
    assert_eq!(collaborators.messaging.sent().await.len(), 1);
}

#[tokio::test]
async fn test_payment_events_jump_routine_webhooks() {
    let (app, state, _) = setup_with_state();
    let status = json!({
        "entry": [{"changes": [{"value": {
            "statuses": [{"id": "wamid.out", "status": "delivered", "recipient_id": "15550002"}]
        }}]}]
    })
    .to_string();
    let payment = json!({
        "id": "evt_456",
        "type": "payment.succeeded",
        "order_id": "ORD-10",
        "customer_id": "c1",
        "phone": "15550001"
    })
    .to_string();

    let response = app
        .clone()
        .oneshot(signed_messaging_request(&status))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let response = app
        .oneshot(stripe_request("/webhooks/payments", &payment, now()))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let claimed = state
        .jobs
        .claim_due(chrono::Utc::now() + chrono::Duration::seconds(1), 1)
        .await
        .unwrap();
    assert_eq!(claimed[0].hook_name, PAYMENT_EVENT);
    assert_eq!(claimed[0].priority, HIGH_PRIORITY);
    assert_eq!(state.queue.priority_of(ORDER_NOTIFICATION), HIGH_PRIORITY);
    assert_eq!(state.queue.priority_of(DELIVERY_STATUS), NORMAL_PRIORITY);
}

#[tokio::test]
async fn test_payment_webhook_per_gateway() {
    let app = setup();
    let body = json!({"type": "payment.failed", "order_id": "ORD-3"}).to_string();
    let ts = now().to_string();
    let sig = sign("adyen_key", &[ts.as_bytes(), b".", body.as_bytes()]);

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/webhooks/payments/adyen")
                .header("adyen-signature", sig.clone())
                .header("adyen-timestamp", ts.clone())
                .body(Body::from(body.clone()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    // Signed for adyen, posted to stripe's endpoint.
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/webhooks/payments/stripe")
                .header("adyen-signature", sig)
                .header("adyen-timestamp", ts)
                .body(Body::from(body.clone()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let response = app
        .oneshot(stripe_request("/webhooks/payments/paypal", &body, now()))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_payment_webhook_rejects_replayed_signature() {
    let app = setup();
    let body = json!({"id": "evt_old", "type": "payment.succeeded", "order_id": "o"}).to_string();

    let response = app
        .oneshot(stripe_request("/webhooks/payments", &body, now() - 3600))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

fn checkout_body(customer: &str, quantity: u32) -> String {
    json!({
        "customer_id": customer,
        "lines": [{"product_id": "SKU-1", "quantity": quantity, "unit_price_cents": 1500}],
        "shipping_address": "1 Main St",
        "payment_method": {"type": "card", "token": "tok_visa"}
    })
    .to_string()
}

fn checkout_request(uri: &str, body: String) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body))
        .unwrap()
}

#[tokio::test]
async fn test_checkout_and_saga_lookup() {
    let (app, _, collaborators) = setup_with_state();
    collaborators.catalog.stock_product("SKU-1", 1500, 3).await;

    let response = app
        .clone()
        .oneshot(checkout_request("/checkout", checkout_body("c1", 2)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let json = body_json(response).await;
    assert_eq!(json["success"], true);
    assert!(json["order_id"].as_str().unwrap().starts_with("ORD-"));
    let saga_id = json["saga_id"].as_str().unwrap().to_string();

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri(format!("/sagas/{saga_id}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let saga = body_json(response).await;
    assert_eq!(saga["status"], "completed");
    assert_eq!(saga["steps"].as_array().unwrap().len(), 4);

    let response = app
        .oneshot(
            Request::builder()
                .uri(format!("/sagas/{}", common::SagaId::new()))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_checkout_failure_tells_customer_what_to_do() {
    let (app, _, collaborators) = setup_with_state();
    collaborators.catalog.stock_product("SKU-1", 1500, 1).await;

    let response = app
        .clone()
        .oneshot(checkout_request("/checkout?mode=locked", checkout_body("c2", 5)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CONFLICT);
    let json = body_json(response).await;
    assert_eq!(json["next_action"], "review_cart");
    assert_eq!(json["failed_step"], "validate_cart");
    assert!(json["message"].as_str().is_some());

    collaborators
        .payments
        .fail_with([reliability::ProcessError::permanent("card declined")])
        .await;
    let response = app
        .oneshot(checkout_request("/checkout", checkout_body("c2", 1)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::PAYMENT_REQUIRED);
    let json = body_json(response).await;
    assert_eq!(json["compensated"], true);
    assert_eq!(collaborators.catalog.stock("SKU-1").await, Some(1));
}

#[tokio::test]
async fn test_checkout_with_failed_compensation_sends_customer_to_support() {
    let (app, _, collaborators) = setup_with_state();
    collaborators.catalog.stock_product("SKU-1", 1500, 3).await;
    collaborators.catalog.set_fail_restore(true).await;
    collaborators
        .payments
        .fail_with([reliability::ProcessError::permanent("card declined")])
        .await;

    let response = app
        .oneshot(checkout_request("/checkout", checkout_body("c3", 1)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let json = body_json(response).await;
    assert_eq!(json["status"], "compensation_failed");
    assert_eq!(json["next_action"], "contact_support");
    assert!(json["message"].as_str().unwrap().contains("contact support"));
    assert_eq!(json["compensation_errors"][0]["step"], "reserve_inventory");
}

#[tokio::test]
async fn test_checkout_rejects_invalid_request() {
    let app = setup();
    let response = app
        .clone()
        .oneshot(checkout_request("/checkout", checkout_body("", 1)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let overflowing = json!({
        "customer_id": "c4",
        "lines": [{"product_id": "SKU-1", "quantity": 4_000_000_000u32,
                   "unit_price_cents": i64::MAX / 1000}],
        "shipping_address": "1 Main St",
        "payment_method": {"type": "card", "token": "tok_visa"}
    })
    .to_string();
    let response = app
        .oneshot(checkout_request("/checkout", overflowing))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_dead_letter_inspection_and_replay() {
    let (app, state, _) = setup_with_state();
    let job = state
        .queue
        .dispatch(ORDER_NOTIFICATION, json!({"status": "shipped"}), Duration::ZERO)
        .await
        .unwrap();
    drain(&state).await;

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/admin/dead-letters?hook=order_notification")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let list = body_json(response).await;
    let records = list.as_array().unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0]["job_id"], job.id.to_string());
    let id = records[0]["id"].as_str().unwrap().to_string();

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri(format!("/admin/dead-letters/{id}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let replay = || {
        Request::builder()
            .method("POST")
            .uri(format!("/admin/dead-letters/{id}/replay"))
            .body(Body::empty())
            .unwrap()
    };
    let response = app.clone().oneshot(replay()).await.unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    let replayed = body_json(response).await;
    assert_eq!(replayed["attempt_count"], 0);
    assert_eq!(replayed["status"], "pending");

    let response = app.clone().oneshot(replay()).await.unwrap();
    assert_eq!(response.status(), StatusCode::CONFLICT);

    let new_job = replayed["id"].as_str().unwrap();
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri(format!("/admin/jobs/{new_job}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("DELETE")
                .uri("/admin/dead-letters")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(body_json(response).await["purged"], 1);

    let response = app
        .oneshot(
            Request::builder()
                .uri("/admin/dead-letters/not-an-id")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_circuits_are_listed() {
    let app = setup();
    let response = app
        .oneshot(
            Request::builder()
                .uri("/admin/circuits")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    let services: Vec<&str> = json
        .as_array()
        .unwrap()
        .iter()
        .map(|s| s["service_id"].as_str().unwrap())
        .collect();
    assert_eq!(services, vec!["messaging", "payment_gateway"]);
    assert_eq!(json[0]["state"], "closed");
}

#[tokio::test]
async fn test_metrics_endpoint() {
    let app = setup();

    let response = app
        .oneshot(
            Request::builder()
                .uri("/metrics")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let content_type = response
        .headers()
        .get("content-type")
        .unwrap()
        .to_str()
        .unwrap();
    assert!(content_type.contains("text/plain"));
}
