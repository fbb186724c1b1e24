//! End-to-end job pipeline tests over the in-memory stores.

use std::sync::Arc;
use std::time::Duration;

use common::ManualClock;
use processors::handlers::{
    CONVERSATION_EVENT, DELIVERY_STATUS, INBOUND_MESSAGE, MESSAGING_SERVICE, ORDER_NOTIFICATION,
    PAYMENT_EVENT, WEBHOOK_ERROR,
};
use processors::services::{
    InMemoryAlerter, InMemoryDeliveryLog, InMemoryMessageRepository, InMemoryMessagingClient,
    InMemoryPaymentStatusSink, InMemoryPreferenceStore, KeywordClassifier, PaymentStatus,
    SimpleTemplateRenderer,
};
use processors::{
    DeadLetterQueue, DeliveryStatusProcessor, InboundMessageProcessor, JobQueue,
    OrderNotificationProcessor, PaymentEventProcessor, ProcessorRunner, WebhookErrorProcessor,
    Worker, WorkerConfig,
};
use reliability::{
    CircuitBreakerConfig, CircuitBreakerRegistry, CircuitState, EventBus, ProcessError,
    RecordingHandler, RetryPolicy,
};
use serde_json::json;
use store::{
    DeadLetterQuery, InMemoryDeadLetterStore, InMemoryIdempotencyStore, InMemoryJobStore,
    InMemoryKeyValueStore, JobStatus, JobStore,
};

struct Pipeline {
    clock: ManualClock,
    jobs: Arc<InMemoryJobStore>,
    queue: JobQueue,
    dlq: DeadLetterQueue,
    worker: Worker,
    breakers: CircuitBreakerRegistry,
    client: InMemoryMessagingClient,
    messages: InMemoryMessageRepository,
    payments: InMemoryPaymentStatusSink,
    alerter: InMemoryAlerter,
    conversations: RecordingHandler,
}

fn pipeline() -> Pipeline {
    let clock = ManualClock::default();
    let jobs = Arc::new(InMemoryJobStore::with_clock(Arc::new(clock.clone())));
    let dead_letters = Arc::new(InMemoryDeadLetterStore::new());
    let claims = Arc::new(InMemoryIdempotencyStore::with_clock(Arc::new(clock.clone())));
    let kv = Arc::new(InMemoryKeyValueStore::with_clock(Arc::new(clock.clone())));
    let queue = JobQueue::with_clock(jobs.clone(), Arc::new(clock.clone()));
    let dlq = DeadLetterQueue::with_clock(dead_letters.clone(), jobs.clone(), Arc::new(clock.clone()));

    let breakers = CircuitBreakerRegistry::with_clock(
        CircuitBreakerConfig {
            failure_threshold: 2,
            cooldown: chrono::Duration::seconds(60),
        },
        Arc::new(clock.clone()),
    );
    let messaging_breaker = breakers.get(MESSAGING_SERVICE);

    let client = InMemoryMessagingClient::new();
    let deliveries = InMemoryDeliveryLog::new();
    let messages = InMemoryMessageRepository::new();
    let preferences = InMemoryPreferenceStore::new();
    let payments = InMemoryPaymentStatusSink::new();
    let alerter = InMemoryAlerter::new();
    let conversations = RecordingHandler::new();
    let events = EventBus::builder()
        .on(CONVERSATION_EVENT, Arc::new(conversations.clone()))
        .build();

    let mut runner = ProcessorRunner::new(claims, jobs.clone(), dead_letters)
        .with_retry_policy(RetryPolicy::new(Duration::from_secs(10), Duration::from_secs(300)))
        .with_clock(Arc::new(clock.clone()));
    runner.register(Arc::new(InboundMessageProcessor::new(
        Arc::new(messages.clone()),
        Arc::new(KeywordClassifier::new()),
        Arc::new(preferences.clone()),
        events,
    )));
    runner.register(Arc::new(DeliveryStatusProcessor::new(
        Arc::new(deliveries.clone()),
        queue.clone(),
    )));
    runner.register(Arc::new(
        OrderNotificationProcessor::new(
            Arc::new(client.clone()),
            Arc::new(SimpleTemplateRenderer::default()),
            Arc::new(deliveries),
            Arc::new(preferences),
            messaging_breaker.clone(),
        )
        .with_clock(Arc::new(clock.clone())),
    ));
    runner.register(Arc::new(WebhookErrorProcessor::new(
        messaging_breaker,
        Arc::new(alerter.clone()),
        kv,
    )));
    runner.register(Arc::new(PaymentEventProcessor::new(
        Arc::new(payments.clone()),
        queue.clone(),
    )));

    let worker = Worker::new(Arc::new(runner), jobs.clone(), WorkerConfig::default())
        .with_clock(Arc::new(clock.clone()));

    Pipeline {
        clock,
        jobs,
        queue,
        dlq,
        worker,
        breakers,
        client,
        messages,
        payments,
        alerter,
        conversations,
    }
}

impl Pipeline {
    async fn drain(&self) {
        while self.worker.run_once().await.unwrap() > 0 {}
    }

    async fn dispatch(&self, hook: &str, payload: serde_json::Value) {
        self.queue.dispatch(hook, payload, Duration::ZERO).await.unwrap();
    }
}

fn shipped() -> serde_json::Value {
    json!({"order_id": "A-17", "status": "shipped", "customer_id": "c1", "phone": "15550001"})
}

#[tokio::test]
async fn duplicate_notification_is_sent_once() {
    let p = pipeline();
    p.dispatch(ORDER_NOTIFICATION, shipped()).await;
    p.dispatch(ORDER_NOTIFICATION, shipped()).await;
    p.drain().await;

    assert_eq!(p.client.sent().await.len(), 1);
    assert_eq!(p.jobs.count_by_status(JobStatus::Done).await.unwrap(), 2);
}

#[tokio::test]
async fn duplicate_inbound_webhook_is_stored_and_classified_once() {
    let p = pipeline();
    let message = json!({"message_id": "wamid.in.1", "from": "15550002", "text": "hello"});
    p.dispatch(INBOUND_MESSAGE, message.clone()).await;
    p.dispatch(INBOUND_MESSAGE, message).await;
    p.drain().await;

    assert_eq!(p.messages.count().await, 1);
    let events = p.conversations.named(CONVERSATION_EVENT).await;
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].payload["event"], "greet");
}

#[tokio::test]
async fn transient_failures_retry_then_succeed() {
    let p = pipeline();
    p.client.fail_with([ProcessError::timeout("slow")]).await;
    p.dispatch(ORDER_NOTIFICATION, shipped()).await;

    p.drain().await;
    assert!(p.client.sent().await.is_empty());
    assert_eq!(p.jobs.count_by_status(JobStatus::Pending).await.unwrap(), 1);

    p.clock.advance(chrono::Duration::seconds(10));
    p.drain().await;
    assert_eq!(p.client.sent().await.len(), 1);
}

#[tokio::test]
async fn provider_rate_limits_pause_notifications() {
    let p = pipeline();
    p.dispatch(
        DELIVERY_STATUS,
        json!({
            "message_id": "wamid.out.9",
            "status": "failed",
            "recipient": "15550001",
            "errors": [{"code": 130429, "title": "Rate limit hit"}, {"code": 131056, "title": "Pair rate limit"}],
        }),
    )
    .await;
    p.drain().await;

    let breaker = p.breakers.get(MESSAGING_SERVICE);
    assert_eq!(breaker.state(), CircuitState::Open);
    assert_eq!(p.alerter.alerts().await.len(), 1);

    p.dispatch(ORDER_NOTIFICATION, shipped()).await;
    p.drain().await;
    assert!(p.client.sent().await.is_empty());
    let deferred = p
        .jobs
        .all()
        .await
        .into_iter()
        .find(|j| j.hook_name == ORDER_NOTIFICATION)
        .unwrap();
    assert_eq!(deferred.status, JobStatus::Pending);
    assert_eq!(deferred.attempt_count, 0);

    p.clock.advance(chrono::Duration::seconds(61));
    p.drain().await;
    assert_eq!(p.client.sent().await.len(), 1);
    assert_eq!(breaker.state(), CircuitState::Closed);
}

#[tokio::test]
async fn payment_event_updates_order_and_notifies_customer() {
    let p = pipeline();
    let event = json!({
        "gateway": "stripe",
        "event_id": "evt_42",
        "type": "payment.succeeded",
        "order_id": "A-17",
        "customer_id": "c1",
        "phone": "15550001",
    });
    p.dispatch(PAYMENT_EVENT, event.clone()).await;
    p.dispatch(PAYMENT_EVENT, event).await;
    p.drain().await;

    assert_eq!(p.payments.history("A-17").await, vec![PaymentStatus::Paid]);
    let sent = p.client.sent().await;
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].template, "payment_received");
}

#[tokio::test]
async fn exhausted_jobs_can_be_replayed() {
    let p = pipeline();
    p.client
        .fail_with([
            ProcessError::permanent("number not on network"),
            ProcessError::permanent("number not on network"),
        ])
        .await;
    p.dispatch(ORDER_NOTIFICATION, shipped()).await;
    p.drain().await;

    let dead = p.dlq.list(DeadLetterQuery::default()).await.unwrap();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].hook_name, ORDER_NOTIFICATION);

    // Refusals come from a healthy provider, so the breaker stays closed.
    p.dlq.replay(dead[0].id).await.unwrap();
    p.drain().await;
    assert!(p.client.sent().await.is_empty());
    assert_eq!(p.breakers.get(MESSAGING_SERVICE).state(), CircuitState::Closed);

    let all = DeadLetterQuery {
        include_replayed: true,
        ..Default::default()
    };
    assert_eq!(p.dlq.list(all).await.unwrap().len(), 2);
    let dead = p.dlq.list(DeadLetterQuery::default()).await.unwrap();
    assert_eq!(dead.len(), 1);

    let job = p.dlq.replay(dead[0].id).await.unwrap();
    p.drain().await;
    assert_eq!(p.queue.get(job.id).await.unwrap().unwrap().status, JobStatus::Done);
    assert_eq!(p.client.sent().await.len(), 1);
}

#[tokio::test]
async fn webhook_error_jobs_are_recorded() {
    let p = pipeline();
    p.dispatch(WEBHOOK_ERROR, json!({"code": 190, "title": "Token expired"})).await;
    p.drain().await;
    let alerts = p.alerter.alerts().await;
    assert_eq!(alerts.len(), 1);
    assert!(alerts[0].subject.contains("auth"));
}
