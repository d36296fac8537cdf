use clap::Parser;
use num_traits::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};

use super::PaymentMode;
use crate::error::ValidationError;

#[derive(Parser, Debug, Clone, Copy, PartialEq, Eq)]
pub struct PricingConfig {
    /// Flat delivery fee charged once per selected day
    #[clap(long, env, default_value = "200", value_parser = clap::value_parser!(i64).range(0..))]
    pub delivery_fee: i64,
    /// Discount applied to the meal subtotal of weekly-paid orders
    #[clap(long, env, default_value = "10", value_parser = clap::value_parser!(u32).range(0..=100))]
    pub weekly_discount_percent: u32,
}

impl Default for PricingConfig {
    fn default() -> Self {
        Self {
            delivery_fee: 200,
            weekly_discount_percent: 10,
        }
    }
}

/// Applies the weekly discount to a meal subtotal, rounding half away from
/// zero to whole currency units.
fn discounted_subtotal(subtotal: i64, percent: u32) -> Option<i64> {
    let kept = Decimal::from(100u32.checked_sub(percent)?);
    let discounted = Decimal::from(subtotal) * kept / Decimal::ONE_HUNDRED;

    discounted
        .round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero)
        .to_i64()
}

/// Total charged for an order: meal prices, discounted when paying weekly,
/// plus one delivery fee per day. Delivery fees are never discounted.
pub fn compute_total(
    meal_prices: &[i64],
    mode: PaymentMode,
    config: &PricingConfig,
) -> Result<i64, ValidationError> {
    let subtotal = meal_prices
        .iter()
        .try_fold(0i64, |acc, price| acc.checked_add(*price))
        .ok_or(ValidationError::AmountOverflow)?;

    let meals = match mode {
        PaymentMode::Daily => subtotal,
        PaymentMode::Weekly => discounted_subtotal(subtotal, config.weekly_discount_percent)
            .ok_or(ValidationError::AmountOverflow)?,
    };

    let days = i64::try_from(meal_prices.len()).map_err(|_| ValidationError::AmountOverflow)?;
    let delivery = config
        .delivery_fee
        .checked_mul(days)
        .ok_or(ValidationError::AmountOverflow)?;

    meals
        .checked_add(delivery)
        .ok_or(ValidationError::AmountOverflow)
}
