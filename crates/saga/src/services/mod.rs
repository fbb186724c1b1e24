//! External services the checkout saga calls, with in-memory implementations.

pub mod catalog;
pub mod orders;
pub mod payments;

pub use catalog::{CatalogService, InMemoryCatalogService, Product};
pub use orders::{InMemoryOrderService, Order, OrderDraft, OrderService, OrderStatus};
pub use payments::{ChargeStatus, InMemoryPaymentGateway, PaymentGateway};
