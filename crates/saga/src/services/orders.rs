//! Order creation and cancellation.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use reliability::{ProcessError, Result};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::checkout::{CartLine, PaymentMethod};

/// What the order service needs to create an order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderDraft {
    pub customer_id: String,
    pub lines: Vec<CartLine>,
    pub shipping_address: String,
    pub shipping_method: String,
    pub payment_method: PaymentMethod,
    pub total_cents: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Pending,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
    pub id: String,
    pub draft: OrderDraft,
    pub status: OrderStatus,
    pub cancel_reason: Option<String>,
}

#[async_trait]
pub trait OrderService: Send + Sync {
    /// Creates a pending order and returns its ID.
    async fn create_order(&self, draft: &OrderDraft) -> Result<String>;

    async fn cancel_order(&self, order_id: &str, reason: &str) -> Result<()>;
}

#[derive(Debug, Default)]
struct OrderState {
    orders: HashMap<String, Order>,
    next_id: u32,
    fail_on_create: bool,
    fail_on_cancel: bool,
}

#[derive(Debug, Clone, Default)]
pub struct InMemoryOrderService {
    state: Arc<RwLock<OrderState>>,
}

impl InMemoryOrderService {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set_fail_on_create(&self, fail: bool) {
        self.state.write().await.fail_on_create = fail;
    }

    pub async fn set_fail_on_cancel(&self, fail: bool) {
        self.state.write().await.fail_on_cancel = fail;
    }

    pub async fn order(&self, order_id: &str) -> Option<Order> {
        self.state.read().await.orders.get(order_id).cloned()
    }

    /// Number of orders not cancelled.
    pub async fn active_count(&self) -> usize {
        self.state
            .read()
            .await
            .orders
            .values()
            .filter(|o| o.status == OrderStatus::Pending)
            .count()
    }
}

#[async_trait]
impl OrderService for InMemoryOrderService {
    async fn create_order(&self, draft: &OrderDraft) -> Result<String> {
        let mut state = self.state.write().await;
        if state.fail_on_create {
            return Err(ProcessError::network("order service unavailable"));
        }
        state.next_id += 1;
        let id = format!("ORD-{:05}", state.next_id);
        state.orders.insert(
            id.clone(),
            Order {
                id: id.clone(),
                draft: draft.clone(),
                status: OrderStatus::Pending,
                cancel_reason: None,
            },
        );
        Ok(id)
    }

    async fn cancel_order(&self, order_id: &str, reason: &str) -> Result<()> {
        let mut state = self.state.write().await;
        if state.fail_on_cancel {
            return Err(ProcessError::network("order service unavailable"));
        }
        let order = state
            .orders
            .get_mut(order_id)
            .ok_or_else(|| ProcessError::permanent(format!("unknown order `{order_id}`")))?;
        order.status = OrderStatus::Cancelled;
        order.cancel_reason = Some(reason.to_string());
        Ok(())
    }
}
