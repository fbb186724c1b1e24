//! Asynchronous processing of webhook-derived work.
//!
//! Webhooks are verified and enqueued at the edge; everything with side
//! effects happens here, in a job executed by a [`Worker`]:
//!
//! - [`QueueProcessor`]: one implementation per job hook
//! - [`ProcessorRunner`]: idempotency claims, retries with backoff, breaker
//!   bookkeeping and dead-lettering around each processor
//! - [`JobQueue`] / [`DeadLetterQueue`]: dispatch and manual replay
//! - [`handlers`]: the concrete inbound message, delivery status, order
//!   notification, provider error and payment event processors

pub mod handlers;
pub mod processor;
pub mod queue;
pub mod quiet_hours;
pub mod runner;
pub mod services;
pub mod worker;

pub use handlers::{
    DeliveryStatusProcessor, ErrorCategory, InboundMessageProcessor, OrderNotificationProcessor,
    PaymentEventProcessor, WebhookErrorProcessor, payment_event_key,
};
pub use processor::{
    DEFAULT_MAX_RETRIES, HIGH_PRIORITY, NORMAL_PRIORITY, ProcessOutcome, QueueProcessor,
};
pub use queue::{DeadLetterQueue, JobQueue};
pub use quiet_hours::{QuietHours, QuietHoursParseError};
pub use runner::{JobOutcome, ProcessorRunner};
pub use worker::{Worker, WorkerConfig};
