//! The checkout steps and their compensating actions.

use std::sync::Arc;

use reliability::{CircuitBreaker, ProcessError, Result};
use serde_json::json;

use crate::checkout::{CartLine, CheckoutRequest, PaymentMethod};
use crate::services::{CatalogService, OrderDraft, OrderService, PaymentGateway};

pub const VALIDATE_CART: &str = "validate_cart";
pub const RESERVE_INVENTORY: &str = "reserve_inventory";
pub const CREATE_ORDER: &str = "create_order";
pub const PROCESS_PAYMENT: &str = "process_payment";

/// Breaker ID guarding the payment gateway.
pub const PAYMENT_GATEWAY: &str = "payment_gateway";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CheckoutStep {
    ValidateCart,
    ReserveInventory,
    CreateOrder,
    ProcessPayment,
}

impl CheckoutStep {
    /// Declared execution order.
    pub const ALL: [CheckoutStep; 4] = [
        CheckoutStep::ValidateCart,
        CheckoutStep::ReserveInventory,
        CheckoutStep::CreateOrder,
        CheckoutStep::ProcessPayment,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            CheckoutStep::ValidateCart => VALIDATE_CART,
            CheckoutStep::ReserveInventory => RESERVE_INVENTORY,
            CheckoutStep::CreateOrder => CREATE_ORDER,
            CheckoutStep::ProcessPayment => PROCESS_PAYMENT,
        }
    }
}

/// What a successful step leaves behind; compensation works from this.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutput {
    Validated { total_cents: i64 },
    Reserved(Vec<CartLine>),
    OrderCreated { order_id: String },
    Charged { payment_id: Option<String> },
}

impl StepOutput {
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            StepOutput::Validated { total_cents } => json!({"total_cents": total_cents}),
            StepOutput::Reserved(lines) => json!({
                "reserved": lines
                    .iter()
                    .map(|l| json!({"product_id": l.product_id, "quantity": l.quantity}))
                    .collect::<Vec<_>>(),
            }),
            StepOutput::OrderCreated { order_id } => json!({"order_id": order_id}),
            StepOutput::Charged {
                payment_id: Some(id),
            } => json!({"payment_id": id}),
            StepOutput::Charged { payment_id: None } => {
                json!({"skipped": true, "reason": "cash_on_delivery"})
            }
        }
    }

    /// False for outputs whose step changed nothing downstream.
    pub fn has_compensation(&self) -> bool {
        !matches!(
            self,
            StepOutput::Validated { .. } | StepOutput::Charged { payment_id: None }
        )
    }

    fn order_id(&self) -> Option<&str> {
        match self {
            StepOutput::OrderCreated { order_id } => Some(order_id),
            _ => None,
        }
    }
}

/// The services checkout steps call out to.
#[derive(Clone)]
pub struct CheckoutServices {
    pub catalog: Arc<dyn CatalogService>,
    pub orders: Arc<dyn OrderService>,
    pub payments: Arc<dyn PaymentGateway>,
    pub payment_breaker: Arc<CircuitBreaker>,
}

impl CheckoutServices {
    pub fn new(
        catalog: Arc<dyn CatalogService>,
        orders: Arc<dyn OrderService>,
        payments: Arc<dyn PaymentGateway>,
        payment_breaker: Arc<CircuitBreaker>,
    ) -> Self {
        Self {
            catalog,
            orders,
            payments,
            payment_breaker,
        }
    }

    /// Runs one step. `completed` holds the outputs of the steps before it.
    pub async fn run(
        &self,
        step: CheckoutStep,
        request: &CheckoutRequest,
        completed: &[StepOutput],
    ) -> Result<StepOutput> {
        match step {
            CheckoutStep::ValidateCart => self.validate_cart(request).await,
            CheckoutStep::ReserveInventory => self.reserve_inventory(request).await,
            CheckoutStep::CreateOrder => self.create_order(request).await,
            CheckoutStep::ProcessPayment => {
                let order_id = completed
                    .iter()
                    .find_map(StepOutput::order_id)
                    .ok_or_else(|| ProcessError::permanent("payment requires an order"))?;
                self.process_payment(request, order_id).await
            }
        }
    }

    /// Undoes a step. `reason` is recorded where the downstream keeps one.
    pub async fn compensate(&self, output: &StepOutput, reason: &str) -> Result<()> {
        match output {
            StepOutput::Validated { .. } | StepOutput::Charged { payment_id: None } => Ok(()),
            StepOutput::Reserved(lines) => self.restore(lines).await,
            StepOutput::OrderCreated { order_id } => {
                self.orders.cancel_order(order_id, reason).await
            }
            StepOutput::Charged {
                payment_id: Some(id),
            } => self.payments.refund(id).await,
        }
    }

    async fn validate_cart(&self, request: &CheckoutRequest) -> Result<StepOutput> {
        if request.lines.is_empty() {
            return Err(ProcessError::validation("cart is empty"));
        }
        for line in &request.lines {
            if line.quantity == 0 {
                return Err(ProcessError::validation(format!(
                    "line `{}` has no quantity",
                    line.product_id
                )));
            }
            let product = self
                .catalog
                .product(&line.product_id)
                .await?
                .ok_or_else(|| {
                    ProcessError::validation(format!("product `{}` not found", line.product_id))
                })?;
            if !product.purchasable {
                return Err(ProcessError::validation(format!(
                    "product `{}` is no longer available",
                    product.id
                )));
            }
            if product.stock < line.quantity {
                return Err(ProcessError::validation(format!(
                    "only {} of `{}` in stock",
                    product.stock, product.id
                )));
            }
            if product.price_cents != line.unit_price_cents {
                return Err(ProcessError::validation(format!(
                    "price of `{}` changed",
                    product.id
                )));
            }
        }
        Ok(StepOutput::Validated {
            total_cents: cart_total(request)?,
        })
    }

    async fn reserve_inventory(&self, request: &CheckoutRequest) -> Result<StepOutput> {
        let mut reserved: Vec<CartLine> = Vec::with_capacity(request.lines.len());
        for line in &request.lines {
            let failure = match self.catalog.reserve(&line.product_id, line.quantity).await {
                Ok(true) => {
                    reserved.push(line.clone());
                    continue;
                }
                Ok(false) => ProcessError::permanent(format!(
                    "insufficient stock for `{}`",
                    line.product_id
                )),
                Err(e) => e,
            };

            // Put back what this step already took before reporting failure.
            if let Err(rollback) = self.restore(&reserved).await {
                tracing::error!(error = %rollback, "failed to roll back partial reservation");
                metrics::counter!("saga_partial_rollback_failed_total").increment(1);
            }
            return Err(failure);
        }
        Ok(StepOutput::Reserved(reserved))
    }

    async fn restore(&self, lines: &[CartLine]) -> Result<()> {
        let mut first_error = None;
        for line in lines.iter().rev() {
            if let Err(e) = self.catalog.restore(&line.product_id, line.quantity).await {
                tracing::warn!(product_id = %line.product_id, error = %e, "stock restore failed");
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn create_order(&self, request: &CheckoutRequest) -> Result<StepOutput> {
        let draft = OrderDraft {
            customer_id: request.customer_id.clone(),
            lines: request.lines.clone(),
            shipping_address: request.shipping_address.clone(),
            shipping_method: request.shipping_method.clone(),
            payment_method: request.payment_method.clone(),
            total_cents: cart_total(request)?,
        };
        let order_id = self.orders.create_order(&draft).await?;
        Ok(StepOutput::OrderCreated { order_id })
    }

    async fn process_payment(
        &self,
        request: &CheckoutRequest,
        order_id: &str,
    ) -> Result<StepOutput> {
        let token = match &request.payment_method {
            PaymentMethod::CashOnDelivery => {
                return Ok(StepOutput::Charged { payment_id: None });
            }
            PaymentMethod::Card { token } => token,
        };

        let breaker = &self.payment_breaker;
        if !breaker.is_available() {
            return Err(ProcessError::CircuitOpen {
                service: breaker.service_id().to_string(),
                retry_after: breaker.retry_after(),
            });
        }

        match self
            .payments
            .charge(order_id, cart_total(request)?, token)
            .await
        {
            Ok(payment_id) => {
                breaker.record_success();
                Ok(StepOutput::Charged {
                    payment_id: Some(payment_id),
                })
            }
            Err(e) => {
                if e.kind().is_downstream_failure() {
                    breaker.record_failure(e.to_string());
                } else {
                    breaker.abandon_trial();
                }
                Err(e)
            }
        }
    }
}

fn cart_total(request: &CheckoutRequest) -> Result<i64> {
    request
        .total_cents()
        .ok_or_else(|| ProcessError::validation("cart total is out of range"))
}
