use chrono::Utc;
use sqlx::SqlitePool;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::info;

use crate::catalog::DynCatalog;
use crate::error::{CatalogLookupError, PersistenceError, ValidationError};
use crate::order::repository::{find_order_by_id, insert_order};
use crate::order::{
    FulfillmentStatus, MealSelection, Order, OrderDraft, OrderId, PaymentStatus, PricingConfig,
    compute_total,
};
use crate::payment::{PaymentCoordinator, PaymentError, PaymentHandoff};

#[derive(Debug, thiserror::Error)]
pub enum CheckoutError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("Catalog unavailable: {0}")]
    Catalog(#[from] CatalogLookupError),
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
    #[error(transparent)]
    Payment(#[from] PaymentError),
}

impl From<sqlx::Error> for CheckoutError {
    fn from(err: sqlx::Error) -> Self {
        Self::Persistence(PersistenceError::Database(err))
    }
}

/// Turns a finished draft into a stored order and starts its payment.
#[derive(Debug, Clone)]
pub struct Checkout {
    pool: SqlitePool,
    catalog: DynCatalogHandle,
    pricing: PricingConfig,
    coordinator: Arc<PaymentCoordinator>,
}

/// `DynCatalog` wrapper so `Checkout` can derive `Debug`.
#[derive(Clone)]
struct DynCatalogHandle(DynCatalog);

impl std::fmt::Debug for DynCatalogHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("DynCatalog")
    }
}

impl Checkout {
    pub fn new(
        pool: SqlitePool,
        catalog: DynCatalog,
        pricing: PricingConfig,
        coordinator: Arc<PaymentCoordinator>,
    ) -> Self {
        Self {
            pool,
            catalog: DynCatalogHandle(catalog),
            pricing,
            coordinator,
        }
    }

    /// Checks a meal snapshot against the current catalog and returns the
    /// price it should carry.
    async fn current_price(
        &self,
        day: &str,
        selection: &MealSelection,
    ) -> Result<i64, CheckoutError> {
        let catalog = &self.catalog.0;
        let meal = catalog
            .find_meal_by_name(&selection.main_dish)
            .await?
            .filter(|meal| meal.active)
            .ok_or_else(|| ValidationError::UnknownDish(selection.main_dish.clone()))?;

        let base = meal
            .base_price(selection.tier.as_deref())
            .ok_or_else(|| match &selection.tier {
                Some(tier) => ValidationError::UnknownTier {
                    dish: meal.name.clone(),
                    tier: tier.clone(),
                },
                None => ValidationError::TierRequired {
                    dish: meal.name.clone(),
                },
            })?;

        let offered = catalog.list_side_dishes_for_meal(meal.id).await?;
        let mut seen = HashSet::new();
        let mut sides_total = 0i64;

        for side in &selection.side_dishes {
            if !seen.insert(side.id) {
                return Err(ValidationError::DuplicateSideDish(side.name.clone()).into());
            }
            let current = offered
                .iter()
                .find(|offered| offered.id == side.id)
                .ok_or_else(|| ValidationError::SideDishNotForDish {
                    side: side.name.clone(),
                    dish: meal.name.clone(),
                })?;
            sides_total = sides_total
                .checked_add(current.price)
                .ok_or(ValidationError::AmountOverflow)?;
        }

        let current = base
            .checked_add(sides_total)
            .ok_or(ValidationError::AmountOverflow)?;

        if current != selection.price {
            return Err(ValidationError::StalePrice {
                day: day.to_string(),
                current,
                snapshot: selection.price,
            }
            .into());
        }

        Ok(current)
    }

    /// Validates the draft, re-prices it against the catalog and stores a
    /// new `pending`/`awaiting` order with a server-side total.
    pub async fn place_order(&self, draft: &OrderDraft) -> Result<Order, CheckoutError> {
        let draft = draft.validated()?;

        let mut prices = Vec::with_capacity(draft.selected_days.len());
        for day in &draft.selected_days {
            let selection = draft
                .meals_by_day
                .get(day)
                .ok_or_else(|| ValidationError::MissingMeal { day: day.clone() })?;
            prices.push(self.current_price(day, selection).await?);
        }

        let total = compute_total(&prices, draft.payment_mode, &self.pricing)?;
        if total <= 0 {
            return Err(ValidationError::NonPositiveTotal(total).into());
        }

        let order = Order::from_draft(draft, total, Utc::now());
        let mut conn = self.pool.acquire().await?;
        insert_order(&mut conn, &order).await?;

        info!(
            order_id = %order.id,
            days = order.selected_days.len(),
            mode = %order.payment_mode,
            total,
            "Order placed"
        );
        Ok(order)
    }

    /// Returns the stored order when it can take another payment attempt
    /// for `draft`: still unpaid, not yet in fulfillment and carrying
    /// exactly the draft's content.
    pub async fn reusable_order(
        &self,
        order_id: OrderId,
        draft: &OrderDraft,
    ) -> Result<Option<Order>, CheckoutError> {
        let draft = draft.validated()?;
        let mut conn = self.pool.acquire().await?;
        let Some(order) = find_order_by_id(&mut conn, order_id).await? else {
            return Ok(None);
        };

        let unpaid = matches!(
            order.payment_status,
            PaymentStatus::Pending | PaymentStatus::Failed
        ) && order.fulfillment_status == FulfillmentStatus::Awaiting;

        Ok((unpaid && order.matches_draft(&draft)).then_some(order))
    }

    pub async fn start_payment(&self, order_id: OrderId) -> Result<PaymentHandoff, CheckoutError> {
        Ok(self.coordinator.create_transaction(order_id).await?)
    }
}
