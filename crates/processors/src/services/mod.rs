//! Collaborators the processors call out to, each with an in-memory implementation.

pub mod conversation;
pub mod customers;
pub mod messaging;
pub mod payments;

pub use conversation::{
    InMemoryMessageRepository, InboundMessage, Intent, IntentClassifier, KeywordClassifier,
    MessageRepository,
};
pub use customers::{
    Alert, InMemoryAlerter, InMemoryPreferenceStore, OperatorAlerter, PreferenceStore,
};
pub use messaging::{
    DeliveryLog, DeliveryRecord, InMemoryDeliveryLog, InMemoryMessagingClient, MessagingClient,
    OutboundMessage, SimpleTemplateRenderer, TemplateRenderer,
};
pub use payments::{InMemoryPaymentStatusSink, PaymentStatus, PaymentStatusSink};
