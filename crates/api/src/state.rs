//! Shared application state and its wiring.

use std::sync::Arc;

use async_trait::async_trait;
use common::{Clock, SystemClock};
use processors::handlers::{CONVERSATION_EVENT, MESSAGING_SERVICE};
use processors::services::{
    InMemoryAlerter, InMemoryDeliveryLog, InMemoryMessageRepository, InMemoryMessagingClient,
    InMemoryPaymentStatusSink, InMemoryPreferenceStore, KeywordClassifier, OperatorAlerter,
    SimpleTemplateRenderer,
};
use processors::{
    DeadLetterQueue, DeliveryStatusProcessor, InboundMessageProcessor, JobQueue,
    OrderNotificationProcessor, PaymentEventProcessor, ProcessorRunner, WebhookErrorProcessor,
    Worker, WorkerConfig,
};
use reliability::{
    CircuitBreakerConfig, CircuitBreakerRegistry, EventBus, EventHandler, RetryPolicy,
};
use saga::{
    COMPENSATION_FAILED_EVENT, CheckoutSaga, CheckoutServices, InMemoryCatalogService,
    InMemoryOrderService, InMemoryPaymentGateway, LockedCheckout, PAYMENT_GATEWAY,
};
use store::{
    CartLock, DeadLetterStore, IdempotencyStore, InMemoryCartLock, InMemoryDeadLetterStore,
    InMemoryIdempotencyStore, InMemoryJobStore, InMemoryKeyValueStore, InMemorySagaLog, JobStore,
    KeyValueStore, PostgresStore, SagaLogStore,
};

use crate::config::Config;

/// Shared application state accessible from all handlers.
pub struct AppState {
    pub config: Config,
    pub clock: Arc<dyn Clock>,
    pub claims: Arc<dyn IdempotencyStore>,
    pub jobs: Arc<dyn JobStore>,
    pub queue: JobQueue,
    pub runner: Arc<ProcessorRunner>,
    pub dead_letters: DeadLetterQueue,
    pub breakers: Arc<CircuitBreakerRegistry>,
    pub kv: Arc<dyn KeyValueStore>,
    pub checkout: CheckoutSaga,
    pub locked_checkout: LockedCheckout,
}

impl AppState {
    /// Builds the job worker draining this state's queue.
    pub fn worker(&self) -> Worker {
        let config = WorkerConfig {
            concurrency: self.config.worker_concurrency,
            poll_interval: self.config.worker_poll_interval,
            ..Default::default()
        };
        Worker::new(self.runner.clone(), self.jobs.clone(), config).with_clock(self.clock.clone())
    }
}

/// The durable stores, behind their traits.
#[derive(Clone)]
pub struct Stores {
    pub kv: Arc<dyn KeyValueStore>,
    pub claims: Arc<dyn IdempotencyStore>,
    pub jobs: Arc<dyn JobStore>,
    pub dead_letters: Arc<dyn DeadLetterStore>,
    pub saga_log: Arc<dyn SagaLogStore>,
    pub cart_lock: Arc<dyn CartLock>,
}

impl Stores {
    /// Process-local stores; nothing survives a restart.
    pub fn in_memory() -> Self {
        Self {
            kv: Arc::new(InMemoryKeyValueStore::new()),
            claims: Arc::new(InMemoryIdempotencyStore::new()),
            jobs: Arc::new(InMemoryJobStore::new()),
            dead_letters: Arc::new(InMemoryDeadLetterStore::new()),
            saga_log: Arc::new(InMemorySagaLog::new()),
            cart_lock: Arc::new(InMemoryCartLock::new()),
        }
    }

    pub fn postgres(store: PostgresStore) -> Self {
        let store = Arc::new(store);
        Self {
            kv: store.clone(),
            claims: store.clone(),
            jobs: store.clone(),
            dead_letters: store.clone(),
            saga_log: store.clone(),
            cart_lock: store,
        }
    }
}

/// In-memory stand-ins for the external systems the service talks to.
#[derive(Clone, Default)]
pub struct Collaborators {
    pub messages: InMemoryMessageRepository,
    pub deliveries: InMemoryDeliveryLog,
    pub messaging: InMemoryMessagingClient,
    pub preferences: InMemoryPreferenceStore,
    pub alerter: InMemoryAlerter,
    pub payment_statuses: InMemoryPaymentStatusSink,
    pub catalog: InMemoryCatalogService,
    pub orders: InMemoryOrderService,
    pub payments: InMemoryPaymentGateway,
}

/// Raises an operator alert for every failed saga compensation.
struct CompensationAlert {
    alerter: Arc<dyn OperatorAlerter>,
}

#[async_trait]
impl EventHandler for CompensationAlert {
    fn name(&self) -> &'static str {
        "CompensationAlert"
    }

    async fn handle(&self, _event: &str, payload: &serde_json::Value) -> reliability::Result<()> {
        let saga_id = payload["saga_id"].as_str().unwrap_or("-");
        let step = payload["step"].as_str().unwrap_or("-");
        let error = payload["error"].as_str().unwrap_or("-");
        self.alerter
            .alert(
                &format!("saga {saga_id}"),
                &format!("compensation of `{step}` failed: {error}; manual cleanup required"),
            )
            .await
    }
}

/// Logs conversation events for downstream consumers to pick up.
struct ConversationLog;

#[async_trait]
impl EventHandler for ConversationLog {
    fn name(&self) -> &'static str {
        "ConversationLog"
    }

    async fn handle(&self, _event: &str, payload: &serde_json::Value) -> reliability::Result<()> {
        tracing::info!(
            message_id = payload["message_id"].as_str().unwrap_or("-"),
            intent = payload["intent"].as_str().unwrap_or("-"),
            "conversation event"
        );
        Ok(())
    }
}

/// Wires every component together. This is the composition root.
pub fn build_state(config: Config, stores: Stores, collaborators: &Collaborators) -> Arc<AppState> {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let breakers = Arc::new(CircuitBreakerRegistry::with_clock(
        CircuitBreakerConfig {
            failure_threshold: config.circuit_failure_threshold.max(1),
            cooldown: chrono::Duration::from_std(config.circuit_cooldown)
                .unwrap_or(chrono::Duration::seconds(60)),
        },
        clock.clone(),
    ));
    let messaging_breaker = breakers.get(MESSAGING_SERVICE);

    let alerter: Arc<dyn OperatorAlerter> = Arc::new(collaborators.alerter.clone());
    let events = EventBus::builder()
        .on(CONVERSATION_EVENT, Arc::new(ConversationLog))
        .on(
            COMPENSATION_FAILED_EVENT,
            Arc::new(CompensationAlert {
                alerter: alerter.clone(),
            }),
        )
        .build();

    let queue = JobQueue::with_clock(stores.jobs.clone(), clock.clone());
    let dead_letters =
        DeadLetterQueue::with_clock(stores.dead_letters.clone(), stores.jobs.clone(), clock.clone());

    let mut runner = ProcessorRunner::new(
        stores.claims.clone(),
        stores.jobs.clone(),
        stores.dead_letters.clone(),
    )
    .with_retry_policy(RetryPolicy::new(config.retry_base_delay, config.retry_max_delay))
    .with_clock(clock.clone());

    runner.register(Arc::new(InboundMessageProcessor::new(
        Arc::new(collaborators.messages.clone()),
        Arc::new(KeywordClassifier::new()),
        Arc::new(collaborators.preferences.clone()),
        events.clone(),
    )));
    runner.register(Arc::new(DeliveryStatusProcessor::new(
        Arc::new(collaborators.deliveries.clone()),
        queue.clone(),
    )));
    runner.register(Arc::new(
        OrderNotificationProcessor::new(
            Arc::new(collaborators.messaging.clone()),
            Arc::new(SimpleTemplateRenderer::default()),
            Arc::new(collaborators.deliveries.clone()),
            Arc::new(collaborators.preferences.clone()),
            messaging_breaker.clone(),
        )
        .with_quiet_hours(config.quiet_hours)
        .with_clock(clock.clone()),
    ));
    runner.register(Arc::new(
        WebhookErrorProcessor::new(messaging_breaker, alerter, stores.kv.clone())
            .with_alert_window(config.alert_window),
    ));
    runner.register(Arc::new(PaymentEventProcessor::new(
        Arc::new(collaborators.payment_statuses.clone()),
        queue.clone(),
    )));
    for (hook, priority) in runner.priorities() {
        queue.set_priority(hook, priority);
    }

    let checkout_services = CheckoutServices::new(
        Arc::new(collaborators.catalog.clone()),
        Arc::new(collaborators.orders.clone()),
        Arc::new(collaborators.payments.clone()),
        breakers.get(PAYMENT_GATEWAY),
    );
    let checkout = CheckoutSaga::new(checkout_services.clone(), stores.saga_log.clone())
        .with_events(events.clone())
        .with_clock(clock.clone())
        .with_step_timeout(config.saga_step_timeout);
    let locked_checkout = LockedCheckout::new(
        checkout_services,
        stores.saga_log.clone(),
        stores.cart_lock.clone(),
    )
    .with_events(events)
    .with_clock(clock.clone())
    .with_step_timeout(config.saga_step_timeout);

    Arc::new(AppState {
        config,
        clock,
        claims: stores.claims,
        jobs: stores.jobs,
        queue,
        runner: Arc::new(runner),
        dead_letters,
        breakers,
        kv: stores.kv,
        checkout,
        locked_checkout,
    })
}
