use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Display;
use uuid::Uuid;

pub mod pricing;
pub mod repository;
pub mod status;
pub mod validation;

pub use pricing::{PricingConfig, compute_total};
pub use status::{FulfillmentStatus, ParseStatusError, PaymentMode, PaymentStatus};

use crate::catalog::VendorId;
use crate::error::ValidationError;

/// Free-form day label such as a weekday name.
pub type DayLabel = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OrderId(pub Uuid);

impl OrderId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Display for OrderId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for OrderId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s.trim()).map(Self)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Customer {
    pub full_name: String,
    pub phone_number: String,
}

impl Customer {
    /// Returns the customer with trimmed name and normalized phone number.
    pub fn validated(&self) -> Result<Self, ValidationError> {
        Ok(Self {
            full_name: validation::non_blank(&self.full_name, "Full name")?,
            phone_number: validation::normalize_phone_number(&self.phone_number)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SideDishChoice {
    pub id: i64,
    pub name: String,
    pub price: i64,
}

/// One day's meal with prices frozen at selection time, so later catalog
/// price changes never alter a placed order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MealSelection {
    pub main_dish: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tier: Option<String>,
    pub price: i64,
    #[serde(default)]
    pub side_dishes: Vec<SideDishChoice>,
}

impl MealSelection {
    pub fn side_dishes_total(&self) -> i64 {
        self.side_dishes.iter().map(|side| side.price).sum()
    }

    /// Price the selection must carry given the base price of its dish.
    pub fn expected_price(&self, base_price: i64) -> i64 {
        base_price + self.side_dishes_total()
    }
}

/// Everything a finished planning session hands over. Nothing here is
/// trusted: [`OrderDraft::validated`] and the catalog re-pricing in
/// checkout run before an [`Order`] exists.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderDraft {
    pub customer: Customer,
    pub delivery_address: String,
    pub delivery_time: String,
    pub selected_days: Vec<DayLabel>,
    pub meals_by_day: BTreeMap<DayLabel, MealSelection>,
    pub payment_mode: PaymentMode,
    /// Optional account password, only for the authentication collaborator.
    #[serde(default, skip_serializing)]
    pub account_password: Option<String>,
}

impl OrderDraft {
    pub fn validated(&self) -> Result<Self, ValidationError> {
        let selected_days = validation::validate_days(&self.selected_days)?;

        if let Some(day) = selected_days
            .iter()
            .find(|day| !self.meals_by_day.contains_key(*day))
        {
            return Err(ValidationError::MissingMeal { day: day.clone() });
        }
        if let Some(day) = self
            .meals_by_day
            .keys()
            .find(|day| !selected_days.contains(day))
        {
            return Err(ValidationError::UnselectedDay { day: day.clone() });
        }

        if let Some(password) = &self.account_password {
            validation::check_password_policy(password)?;
        }

        Ok(Self {
            customer: self.customer.validated()?,
            delivery_address: validation::non_blank(&self.delivery_address, "Delivery address")?,
            delivery_time: validation::non_blank(&self.delivery_time, "Delivery time")?,
            selected_days,
            meals_by_day: self.meals_by_day.clone(),
            payment_mode: self.payment_mode,
            account_password: self.account_password.clone(),
        })
    }

    /// Meal prices in day order. Assumes a validated draft.
    pub fn meal_prices(&self) -> Vec<i64> {
        meal_prices(&self.selected_days, &self.meals_by_day)
    }
}

fn meal_prices(days: &[DayLabel], meals: &BTreeMap<DayLabel, MealSelection>) -> Vec<i64> {
    days.iter()
        .filter_map(|day| meals.get(day))
        .map(|meal| meal.price)
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
    pub id: OrderId,
    pub customer: Customer,
    pub delivery_address: String,
    pub delivery_time: String,
    pub selected_days: Vec<DayLabel>,
    pub meals_by_day: BTreeMap<DayLabel, MealSelection>,
    pub payment_mode: PaymentMode,
    pub total_amount: i64,
    pub payment_transaction_ref: Option<String>,
    pub payment_status: PaymentStatus,
    pub fulfillment_status: FulfillmentStatus,
    pub vendors_by_day: BTreeMap<DayLabel, VendorId>,
    /// Set when a payment outcome could not be decided automatically.
    pub needs_review: bool,
    /// Bumped on every stored change; guards concurrent updates.
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Order {
    /// Builds a fresh order from a validated draft and its server-side total.
    pub fn from_draft(draft: OrderDraft, total_amount: i64, now: DateTime<Utc>) -> Self {
        Self {
            id: OrderId::generate(),
            customer: draft.customer,
            delivery_address: draft.delivery_address,
            delivery_time: draft.delivery_time,
            selected_days: draft.selected_days,
            meals_by_day: draft.meals_by_day,
            payment_mode: draft.payment_mode,
            total_amount,
            payment_transaction_ref: None,
            payment_status: PaymentStatus::Pending,
            fulfillment_status: FulfillmentStatus::Awaiting,
            vendors_by_day: BTreeMap::new(),
            needs_review: false,
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn meal_prices(&self) -> Vec<i64> {
        meal_prices(&self.selected_days, &self.meals_by_day)
    }

    /// Recomputes the amount to charge from the stored meal snapshots.
    pub fn recompute_total(&self, config: &PricingConfig) -> Result<i64, ValidationError> {
        if let Some(day) = self
            .selected_days
            .iter()
            .find(|day| !self.meals_by_day.contains_key(*day))
        {
            return Err(ValidationError::MissingMeal { day: day.clone() });
        }
        compute_total(&self.meal_prices(), self.payment_mode, config)
    }

    /// Whether the order carries exactly what a validated draft asks for.
    pub fn matches_draft(&self, draft: &OrderDraft) -> bool {
        self.customer == draft.customer
            && self.delivery_address == draft.delivery_address
            && self.delivery_time == draft.delivery_time
            && self.selected_days == draft.selected_days
            && self.meals_by_day == draft.meals_by_day
            && self.payment_mode == draft.payment_mode
    }
}
