//! Product catalog: read-only lookups for order validation, stock updates
//! for the inventory consumer.

use crate::types::Money;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{PoisonError, RwLock};

/// Maximum number of products returned by [`Catalog::list_products`].
pub const LIST_LIMIT: usize = 50;

/// A catalog entry.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Product {
    /// Product identifier
    pub product_id: String,
    /// Display name
    pub name: String,
    /// Unit price
    pub price: Money,
    /// Units on hand. May go negative when orders outrun stock.
    pub stock: i64,
    /// Category
    pub category: String,
}

impl Product {
    /// Creates a new product
    #[must_use]
    pub fn new(
        product_id: impl Into<String>,
        name: impl Into<String>,
        price: Money,
        stock: i64,
        category: impl Into<String>,
    ) -> Self {
        Self {
            product_id: product_id.into(),
            name: name.into(),
            price,
            stock,
            category: category.into(),
        }
    }
}

/// In-memory product table.
#[derive(Debug, Default)]
pub struct Catalog {
    products: RwLock<BTreeMap<String, Product>>,
}

impl Catalog {
    /// Empty catalog.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Catalog holding the demo products.
    #[must_use]
    pub fn seeded() -> Self {
        let catalog = Self::new();
        for (id, name, cents, stock, category) in [
            ("prod-001", "Wireless Headphones", 7999, 50, "Electronics"),
            ("prod-002", "Running Shoes", 12_999, 30, "Sports"),
            ("prod-003", "Coffee Maker", 4999, 20, "Home"),
            ("prod-004", "Yoga Mat", 2999, 100, "Sports"),
            ("prod-005", "Laptop Stand", 3999, 45, "Electronics"),
            ("prod-006", "Water Bottle", 1999, 200, "Sports"),
            ("prod-007", "Bluetooth Speaker", 5999, 60, "Electronics"),
            ("prod-008", "Desk Lamp", 3499, 75, "Home"),
        ] {
            catalog.insert(Product::new(id, name, Money::from_cents(cents), stock, category));
        }
        catalog
    }

    /// Add or replace a product.
    pub fn insert(&self, product: Product) {
        self.products
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(product.product_id.clone(), product);
    }

    /// Look up a product by id.
    #[must_use]
    pub fn get_product(&self, product_id: &str) -> Option<Product> {
        self.products
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(product_id)
            .cloned()
    }

    /// Up to [`LIST_LIMIT`] products, ordered by id.
    #[must_use]
    pub fn list_products(&self) -> Vec<Product> {
        self.products
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .take(LIST_LIMIT)
            .cloned()
            .collect()
    }

    /// Subtract `quantity` from a product's stock. Returns the new stock, or
    /// `None` for an unknown product.
    pub fn decrement_stock(&self, product_id: &str, quantity: u32) -> Option<i64> {
        let mut products = self.products.write().unwrap_or_else(PoisonError::into_inner);
        let product = products.get_mut(product_id)?;
        product.stock -= i64::from(quantity);
        Some(product.stock)
    }

    /// Current stock of a product.
    #[must_use]
    pub fn stock_of(&self, product_id: &str) -> Option<i64> {
        self.get_product(product_id).map(|p| p.stock)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seeded_catalog_has_demo_products() {
        let catalog = Catalog::seeded();
        let headphones = catalog.get_product("prod-001");
        assert_eq!(headphones.map(|p| p.price), Some(Money::from_cents(7999)));
        assert_eq!(catalog.list_products().len(), 8);
        assert!(catalog.get_product("prod-999").is_none());
    }

    #[test]
    fn listing_is_capped() {
        let catalog = Catalog::new();
        for i in 0..60 {
            catalog.insert(Product::new(format!("p-{i:03}"), "x", Money::from_cents(1), 1, "misc"));
        }
        assert_eq!(catalog.list_products().len(), LIST_LIMIT);
    }

    #[test]
    fn decrement_stock() {
        let catalog = Catalog::seeded();
        assert_eq!(catalog.decrement_stock("prod-003", 5), Some(15));
        assert_eq!(catalog.stock_of("prod-003"), Some(15));
        assert_eq!(catalog.decrement_stock("prod-999", 1), None);
    }
}
