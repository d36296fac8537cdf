use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt::Display;
use std::sync::Arc;

pub mod sqlite;

pub use sqlite::SqliteCatalog;

use crate::error::CatalogLookupError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VendorId(pub i64);

impl Display for VendorId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vendor {
    pub id: VendorId,
    pub name: String,
    pub active: bool,
    pub sold_meal_names: BTreeSet<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceTier {
    pub label: String,
    pub price: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Meal {
    pub id: i64,
    pub name: String,
    pub price: i64,
    /// Alternative sizes. Empty when the dish has a single price.
    #[serde(default)]
    pub tiers: Vec<PriceTier>,
    pub active: bool,
}

impl Meal {
    /// Base price for the chosen tier, or the dish price when untiered.
    pub fn base_price(&self, tier: Option<&str>) -> Option<i64> {
        match tier {
            None if self.tiers.len() <= 1 => Some(
                self.tiers
                    .first()
                    .map_or(self.price, |only_tier| only_tier.price),
            ),
            None => None,
            Some(label) => self
                .tiers
                .iter()
                .find(|tier| tier.label == label)
                .map(|tier| tier.price),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SideDish {
    pub id: i64,
    pub meal_id: i64,
    pub name: String,
    pub price: i64,
}

/// Read-only view of vendors, meals and side dishes.
#[async_trait]
pub trait CatalogReader: Send + Sync + 'static {
    async fn list_active_meals(&self) -> Result<Vec<Meal>, CatalogLookupError>;

    /// Exact-name lookup, regardless of the meal's active flag, so orders
    /// placed before a dish was withdrawn can still be routed.
    async fn find_meal_by_name(&self, name: &str) -> Result<Option<Meal>, CatalogLookupError>;

    async fn list_side_dishes_for_meal(
        &self,
        meal_id: i64,
    ) -> Result<Vec<SideDish>, CatalogLookupError>;

    async fn list_vendors_for_meal(&self, meal_name: &str)
    -> Result<Vec<Vendor>, CatalogLookupError>;
}

pub type DynCatalog = Arc<dyn CatalogReader>;
