//! Error types shared across the order lifecycle. Each enum covers one
//! concern so callers can tell bad input apart from storage trouble or a
//! misbehaving collaborator.

/// Rejected user input. Always recoverable: the step that produced it
/// re-prompts and nothing is coerced.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("At least one delivery day must be selected")]
    EmptyDaySelection,
    #[error("Day labels cannot be blank")]
    BlankDayLabel,
    #[error("Day {0} was selected more than once")]
    DuplicateDay(String),
    #[error("No meal selected for {day}")]
    MissingMeal { day: String },
    #[error("Meal given for {day}, which is not a selected day")]
    UnselectedDay { day: String },
    #[error("Pick a dish for {day} before confirming")]
    NoDishSelected { day: String },
    #[error("{dish} comes in several sizes; pick one before confirming")]
    TierRequired { dish: String },
    #[error("{dish} has no size named {tier}")]
    UnknownTier { dish: String, tier: String },
    #[error("Side dish {side} is not offered with {dish}")]
    SideDishNotForDish { side: String, dish: String },
    #[error("Side dish {0} was already added")]
    DuplicateSideDish(String),
    #[error("Unknown dish: {0}")]
    UnknownDish(String),
    #[error("Prices for {day}'s meal changed since it was selected (now {current}, was {snapshot})")]
    StalePrice {
        day: String,
        current: i64,
        snapshot: i64,
    },
    #[error("{0} cannot be blank")]
    BlankField(&'static str),
    #[error("Invalid phone number: {0}")]
    InvalidPhoneNumber(String),
    #[error("Password {0}")]
    PasswordPolicy(&'static str),
    #[error("Choose a payment mode first")]
    PaymentModeMissing,
    #[error("Order total must be positive, got {0}")]
    NonPositiveTotal(i64),
    #[error("Order amount is out of range")]
    AmountOverflow,
    #[error("Input does not belong to the {step} step")]
    UnexpectedInput { step: &'static str },
    #[error("Cannot go back from the {step} step")]
    CannotGoBack { step: &'static str },
    #[error("The session was already handed off to payment")]
    AlreadyHandedOff,
}

/// Database persistence and data corruption errors.
#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("Invalid JSON column: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Invalid {column} value in database: {value}")]
    InvalidColumn { column: &'static str, value: String },
    #[error("Order not found: {0}")]
    NotFound(String),
    #[error("Order {order_id} changed concurrently (expected version {expected_version})")]
    ConcurrencyConflict {
        order_id: String,
        expected_version: i64,
    },
    #[error("Order id prefix must be at least {min} characters")]
    PrefixTooShort { min: usize },
}

/// Catalog lookups that could not be answered. Never escapes the vendor
/// resolver, which degrades to "unassigned".
#[derive(Debug, thiserror::Error)]
pub enum CatalogLookupError {
    #[error("Catalog database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("Invalid catalog row: {0}")]
    InvalidRow(String),
}

/// A gateway callback that could not be matched to an order.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReconciliationError {
    #[error("No order references transaction {0}")]
    UnknownTransaction(String),
    #[error("Transaction {transaction_id} already belongs to order {order_id}")]
    TransactionClaimed {
        transaction_id: String,
        order_id: String,
    },
}
