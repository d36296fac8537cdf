use std::collections::BTreeMap;
use tracing::{debug, warn};

use crate::catalog::{DynCatalog, VendorId};
use crate::error::CatalogLookupError;
use crate::order::{DayLabel, Order};

/// Picks the vendor that prepares each day's main dish.
///
/// The rule is deterministic: among the active vendors selling the dish
/// the lowest id wins. Lookup failures and dishes nobody sells resolve to
/// `None` and never fail the caller.
#[derive(Clone)]
pub struct VendorResolver {
    catalog: DynCatalog,
}

impl std::fmt::Debug for VendorResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VendorResolver").finish_non_exhaustive()
    }
}

impl VendorResolver {
    pub fn new(catalog: DynCatalog) -> Self {
        Self { catalog }
    }

    pub fn catalog(&self) -> &DynCatalog {
        &self.catalog
    }

    pub async fn resolve(&self, meal_name: &str) -> Option<VendorId> {
        match self.try_resolve(meal_name).await {
            Ok(vendor) => vendor,
            Err(e) => {
                warn!(meal_name, error = %e, "Catalog lookup failed while resolving vendor");
                None
            }
        }
    }

    async fn try_resolve(&self, meal_name: &str) -> Result<Option<VendorId>, CatalogLookupError> {
        let Some(meal) = self.catalog.find_meal_by_name(meal_name).await? else {
            debug!(meal_name, "No meal with this name in the catalog");
            return Ok(None);
        };

        let vendor = self
            .catalog
            .list_vendors_for_meal(&meal.name)
            .await?
            .into_iter()
            .filter(|vendor| vendor.active)
            .map(|vendor| vendor.id)
            .min();

        Ok(vendor)
    }

    /// Resolves every selected day of `order`. Days whose dish cannot be
    /// routed are left out of the map.
    pub async fn assign_all(&self, order: &Order) -> BTreeMap<DayLabel, VendorId> {
        let mut assignments = BTreeMap::new();

        for day in &order.selected_days {
            let Some(selection) = order.meals_by_day.get(day) else {
                warn!(order_id = %order.id, day = %day, "Selected day has no meal; skipping vendor assignment");
                continue;
            };

            match self.resolve(&selection.main_dish).await {
                Some(vendor_id) => {
                    assignments.insert(day.clone(), vendor_id);
                }
                None => warn!(
                    order_id = %order.id,
                    day = %day,
                    meal = %selection.main_dish,
                    "No active vendor for meal; day left unassigned"
                ),
            }
        }

        assignments
    }
}
