//! Checkout under a per-cart lock.
//!
//! Validation, reservation and order creation run while the customer's cart
//! is locked, so two submissions of the same cart cannot interleave. The lock
//! is released before the charge, which can be slow. A failure anywhere still
//! compensates like the orchestrated saga.

use std::sync::Arc;
use std::time::Duration;

use common::{Clock, SagaId};
use reliability::EventBus;
use store::{CartLock, SagaLogStore};

use crate::checkout::CheckoutRequest;
use crate::error::Result;
use crate::execution::{SagaExecution, SagaResult};
use crate::orchestrator::{SagaRunner, check_request};
use crate::steps::{CheckoutServices, CheckoutStep};

/// Saga type recorded for lock-based checkouts.
pub const LOCKED_CHECKOUT_SAGA: &str = "checkout_locked";

const LOCKED_STEPS: [CheckoutStep; 3] = [
    CheckoutStep::ValidateCart,
    CheckoutStep::ReserveInventory,
    CheckoutStep::CreateOrder,
];

pub struct LockedCheckout {
    runner: SagaRunner,
    lock: Arc<dyn CartLock>,
}

impl LockedCheckout {
    pub fn new(
        services: CheckoutServices,
        log: Arc<dyn SagaLogStore>,
        lock: Arc<dyn CartLock>,
    ) -> Self {
        Self {
            runner: SagaRunner::new(services, log),
            lock,
        }
    }

    pub fn with_events(mut self, events: EventBus) -> Self {
        self.runner.set_events(events);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.runner.set_clock(clock);
        self
    }

    pub fn with_step_timeout(mut self, timeout: Duration) -> Self {
        self.runner.set_step_timeout(timeout);
        self
    }

    #[tracing::instrument(skip(self, request), fields(saga_type = LOCKED_CHECKOUT_SAGA))]
    pub async fn execute(&self, request: CheckoutRequest) -> Result<SagaResult> {
        check_request(&request)?;
        let guard = self.lock.lock_cart(&request.customer_id).await?;
        let mut run = self.runner.start(LOCKED_CHECKOUT_SAGA, request).await;

        let mut ok = true;
        for step in LOCKED_STEPS {
            if !self.runner.step(&mut run, step).await {
                ok = false;
                break;
            }
        }
        if let Err(e) = guard.release().await {
            tracing::warn!(error = %e, "failed to release cart lock");
        }

        if ok {
            ok = self.runner.step(&mut run, CheckoutStep::ProcessPayment).await;
        }
        if !ok {
            self.runner.compensate(&mut run).await;
        }
        Ok(self.runner.finish(run).await)
    }

    pub async fn get(&self, saga_id: SagaId) -> Result<Option<SagaExecution>> {
        self.runner.load(saga_id).await
    }
}
