//! Checkout as a saga.
//!
//! A checkout runs four steps in order: validate the cart, reserve
//! inventory, create the order, charge payment. If a step fails, the steps
//! that already took effect are compensated in reverse order. Every
//! transition is saved to a [`store::SagaLogStore`] so a run can be inspected
//! afterwards.
//!
//! [`CheckoutSaga`] is the orchestrated flow. [`LockedCheckout`] runs the
//! first three steps under a per-cart lock instead.

pub mod checkout;
pub mod error;
pub mod execution;
pub mod locked;
pub mod orchestrator;
pub mod services;
pub mod state;
pub mod steps;

pub use checkout::{CartLine, CheckoutFailure, CheckoutRequest, PaymentMethod};
pub use error::{Result, SagaError};
pub use execution::{CompensationError, SagaExecution, SagaResult, StepRecord};
pub use locked::{LOCKED_CHECKOUT_SAGA, LockedCheckout};
pub use orchestrator::{
    CHECKOUT_SAGA, COMPENSATION_FAILED_EVENT, CheckoutSaga, DEFAULT_STEP_TIMEOUT,
};
pub use services::{
    CatalogService, ChargeStatus, InMemoryCatalogService, InMemoryOrderService,
    InMemoryPaymentGateway, Order, OrderDraft, OrderService, OrderStatus, PaymentGateway, Product,
};
pub use state::{SagaStatus, StepStatus};
pub use steps::{
    CREATE_ORDER, CheckoutServices, CheckoutStep, PAYMENT_GATEWAY, PROCESS_PAYMENT,
    RESERVE_INVENTORY, StepOutput, VALIDATE_CART,
};
