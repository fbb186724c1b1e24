//! Concrete processors, one per job hook.

pub mod delivery_status;
pub mod inbound_message;
pub mod order_notification;
pub mod payment_event;
pub mod webhook_error;

pub use delivery_status::DeliveryStatusProcessor;
pub use inbound_message::InboundMessageProcessor;
pub use order_notification::OrderNotificationProcessor;
pub use payment_event::{PaymentEventProcessor, payment_event_key};
pub use webhook_error::{ErrorCategory, WebhookErrorProcessor};

pub const INBOUND_MESSAGE: &str = "inbound_message";
pub const DELIVERY_STATUS: &str = "delivery_status";
pub const ORDER_NOTIFICATION: &str = "order_notification";
pub const WEBHOOK_ERROR: &str = "webhook_error";
pub const PAYMENT_EVENT: &str = "payment_event";

/// Breaker ID for the messaging provider.
pub const MESSAGING_SERVICE: &str = "messaging";

/// Event published for each classified inbound message.
pub const CONVERSATION_EVENT: &str = "conversation.event";
