//! Product catalog and stock.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use reliability::{ProcessError, Result};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Product {
    pub id: String,
    pub name: String,
    pub price_cents: i64,
    pub stock: u32,
    pub purchasable: bool,
}

/// Catalog lookups and stock adjustments.
#[async_trait]
pub trait CatalogService: Send + Sync {
    async fn product(&self, product_id: &str) -> Result<Option<Product>>;

    /// Decrements stock if at least `quantity` is available.
    ///
    /// Returns false, leaving stock untouched, when it is not.
    async fn reserve(&self, product_id: &str, quantity: u32) -> Result<bool>;

    /// Returns previously reserved units.
    async fn restore(&self, product_id: &str, quantity: u32) -> Result<()>;
}

#[derive(Debug, Default)]
struct CatalogState {
    products: HashMap<String, Product>,
    fail_restore: bool,
}

/// In-memory catalog. The write lock makes `reserve` a single atomic check-and-decrement.
#[derive(Debug, Clone, Default)]
pub struct InMemoryCatalogService {
    state: Arc<RwLock<CatalogState>>,
}

impl InMemoryCatalogService {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_product(&self, product: Product) {
        self.state
            .write()
            .await
            .products
            .insert(product.id.clone(), product);
    }

    /// Adds a purchasable product.
    pub async fn stock_product(&self, id: &str, price_cents: i64, stock: u32) {
        self.add_product(Product {
            id: id.to_string(),
            name: id.to_string(),
            price_cents,
            stock,
            purchasable: true,
        })
        .await;
    }

    pub async fn stock(&self, product_id: &str) -> Option<u32> {
        self.state
            .read()
            .await
            .products
            .get(product_id)
            .map(|p| p.stock)
    }

    /// Makes `restore` fail, simulating a catalog outage during compensation.
    pub async fn set_fail_restore(&self, fail: bool) {
        self.state.write().await.fail_restore = fail;
    }
}

#[async_trait]
impl CatalogService for InMemoryCatalogService {
    async fn product(&self, product_id: &str) -> Result<Option<Product>> {
        Ok(self.state.read().await.products.get(product_id).cloned())
    }

    async fn reserve(&self, product_id: &str, quantity: u32) -> Result<bool> {
        let mut state = self.state.write().await;
        match state.products.get_mut(product_id) {
            Some(product) if product.stock >= quantity => {
                product.stock -= quantity;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn restore(&self, product_id: &str, quantity: u32) -> Result<()> {
        let mut state = self.state.write().await;
        if state.fail_restore {
            return Err(ProcessError::network("catalog unavailable"));
        }
        let product = state.products.get_mut(product_id).ok_or_else(|| {
            ProcessError::permanent(format!("unknown product `{product_id}`"))
        })?;
        product.stock += quantity;
        Ok(())
    }
}
