//! Checkout request types and user-facing failure mapping.

use serde::{Deserialize, Serialize};

use crate::steps::{PROCESS_PAYMENT, RESERVE_INVENTORY, VALIDATE_CART};

/// One product line in a customer's cart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CartLine {
    pub product_id: String,
    pub quantity: u32,
    /// Price the customer saw when adding the line.
    pub unit_price_cents: i64,
}

impl CartLine {
    pub fn new(product_id: impl Into<String>, quantity: u32, unit_price_cents: i64) -> Self {
        Self {
            product_id: product_id.into(),
            quantity,
            unit_price_cents,
        }
    }

    /// Line total, or `None` if it does not fit in an `i64`.
    pub fn total_cents(&self) -> Option<i64> {
        self.unit_price_cents.checked_mul(i64::from(self.quantity))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PaymentMethod {
    /// Charged up front through the payment gateway.
    Card { token: String },
    /// Collected by the courier; nothing to charge at checkout.
    CashOnDelivery,
}

/// Everything needed to turn a cart into a paid order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckoutRequest {
    pub customer_id: String,
    pub lines: Vec<CartLine>,
    pub shipping_address: String,
    #[serde(default = "default_shipping_method")]
    pub shipping_method: String,
    pub payment_method: PaymentMethod,
}

fn default_shipping_method() -> String {
    "standard".to_string()
}

impl CheckoutRequest {
    /// Cart total, or `None` if any line or the sum overflows.
    pub fn total_cents(&self) -> Option<i64> {
        self.lines
            .iter()
            .try_fold(0i64, |total, line| total.checked_add(line.total_cents()?))
    }
}

/// Where to send a customer whose checkout failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckoutFailure {
    /// Stock or price changed; the cart needs another look.
    ReviewCart,
    /// The charge did not go through.
    RetryPayment,
    /// Something on our side failed.
    TryAgainLater,
    /// The failure could not be fully undone; support has to sort out the
    /// order, reservation or charge left behind.
    ContactSupport,
}

impl CheckoutFailure {
    /// Maps the step that failed to the customer's next action.
    pub fn from_step(step: &str) -> Self {
        match step {
            VALIDATE_CART | RESERVE_INVENTORY => CheckoutFailure::ReviewCart,
            PROCESS_PAYMENT => CheckoutFailure::RetryPayment,
            _ => CheckoutFailure::TryAgainLater,
        }
    }

    pub fn message(&self) -> &'static str {
        match self {
            CheckoutFailure::ReviewCart => {
                "Some items in your cart are no longer available. Please review your cart."
            }
            CheckoutFailure::RetryPayment => {
                "We couldn't process your payment. Please try again or choose another method."
            }
            CheckoutFailure::TryAgainLater => {
                "We couldn't complete your order right now. Please try again in a few minutes."
            }
            CheckoutFailure::ContactSupport => {
                "Your order hit a problem we need to fix by hand. Please contact support before trying again."
            }
        }
    }
}
