use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{QueryBuilder, Sqlite, SqliteConnection};
use std::collections::BTreeMap;

use super::{
    DayLabel, FulfillmentStatus, MealSelection, Order, OrderId, PaymentMode, PaymentStatus,
};
use crate::catalog::VendorId;
use crate::error::{PersistenceError, ValidationError};
use crate::order::Customer;
use crate::order::validation::normalize_phone_number;

/// Shortest id prefix accepted by the "track my order" lookup.
pub const MIN_TRACKING_PREFIX_LEN: usize = 4;
const TRACKING_RESULT_LIMIT: i64 = 20;
const DEFAULT_LIST_LIMIT: u32 = 100;

const ORDER_COLUMNS: &str = "
    id, full_name, phone_number, delivery_address, delivery_time,
    selected_days, meals_by_day, payment_mode, total_amount,
    payment_transaction_ref, payment_status, fulfillment_status,
    vendors_by_day, needs_review, version, created_at, updated_at
";

#[derive(sqlx::FromRow)]
struct OrderRow {
    id: String,
    full_name: String,
    phone_number: String,
    delivery_address: String,
    delivery_time: String,
    selected_days: String,
    meals_by_day: String,
    payment_mode: String,
    total_amount: i64,
    payment_transaction_ref: Option<String>,
    payment_status: String,
    fulfillment_status: String,
    vendors_by_day: String,
    needs_review: bool,
    version: i64,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

fn invalid(column: &'static str, value: impl Into<String>) -> PersistenceError {
    PersistenceError::InvalidColumn {
        column,
        value: value.into(),
    }
}

fn row_to_order(
    OrderRow {
        id,
        full_name,
        phone_number,
        delivery_address,
        delivery_time,
        selected_days,
        meals_by_day,
        payment_mode,
        total_amount,
        payment_transaction_ref,
        payment_status,
        fulfillment_status,
        vendors_by_day,
        needs_review,
        version,
        created_at,
        updated_at,
    }: OrderRow,
) -> Result<Order, PersistenceError> {
    let selected_days: Vec<DayLabel> = serde_json::from_str(&selected_days)?;
    if selected_days.is_empty() {
        return Err(invalid("selected_days", "[]"));
    }

    let meals_by_day: BTreeMap<DayLabel, MealSelection> = serde_json::from_str(&meals_by_day)?;
    let vendors_by_day: BTreeMap<DayLabel, VendorId> = serde_json::from_str(&vendors_by_day)?;

    if total_amount < 0 {
        return Err(invalid("total_amount", total_amount.to_string()));
    }

    Ok(Order {
        id: id.parse().map_err(|_| invalid("id", id.as_str()))?,
        customer: Customer {
            full_name,
            phone_number,
        },
        delivery_address,
        delivery_time,
        selected_days,
        meals_by_day,
        payment_mode: payment_mode
            .parse::<PaymentMode>()
            .map_err(|_| invalid("payment_mode", payment_mode.as_str()))?,
        total_amount,
        payment_transaction_ref,
        payment_status: payment_status
            .parse::<PaymentStatus>()
            .map_err(|_| invalid("payment_status", payment_status.as_str()))?,
        fulfillment_status: fulfillment_status
            .parse::<FulfillmentStatus>()
            .map_err(|_| invalid("fulfillment_status", fulfillment_status.as_str()))?,
        vendors_by_day,
        needs_review,
        version,
        created_at,
        updated_at,
    })
}

pub async fn insert_order(
    conn: &mut SqliteConnection,
    order: &Order,
) -> Result<(), PersistenceError> {
    if order.selected_days.is_empty() {
        return Err(invalid("selected_days", "[]"));
    }

    sqlx::query(
        "
        INSERT INTO orders (
            id, full_name, phone_number, delivery_address, delivery_time,
            selected_days, meals_by_day, payment_mode, total_amount,
            payment_transaction_ref, payment_status, fulfillment_status,
            vendors_by_day, needs_review, version, created_at, updated_at
        )
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)
        ",
    )
    .bind(order.id.to_string())
    .bind(&order.customer.full_name)
    .bind(&order.customer.phone_number)
    .bind(&order.delivery_address)
    .bind(&order.delivery_time)
    .bind(serde_json::to_string(&order.selected_days)?)
    .bind(serde_json::to_string(&order.meals_by_day)?)
    .bind(order.payment_mode.as_str())
    .bind(order.total_amount)
    .bind(&order.payment_transaction_ref)
    .bind(order.payment_status.as_str())
    .bind(order.fulfillment_status.as_str())
    .bind(serde_json::to_string(&order.vendors_by_day)?)
    .bind(order.needs_review)
    .bind(order.version)
    .bind(order.created_at)
    .bind(order.updated_at)
    .execute(conn)
    .await?;

    Ok(())
}

pub async fn find_order_by_id(
    conn: &mut SqliteConnection,
    id: OrderId,
) -> Result<Option<Order>, PersistenceError> {
    let query = format!("SELECT {ORDER_COLUMNS} FROM orders WHERE id = ?1");
    sqlx::query_as::<_, OrderRow>(&query)
        .bind(id.to_string())
        .fetch_optional(conn)
        .await?
        .map(row_to_order)
        .transpose()
}

/// Like [`find_order_by_id`] but a missing order is an error.
pub async fn get_order(
    conn: &mut SqliteConnection,
    id: OrderId,
) -> Result<Order, PersistenceError> {
    find_order_by_id(conn, id)
        .await?
        .ok_or_else(|| PersistenceError::NotFound(id.to_string()))
}

/// Finds the order that opened `transaction_ref`, whether it is the current
/// reference or one replaced by a later attempt.
pub async fn find_order_by_transaction_ref(
    conn: &mut SqliteConnection,
    transaction_ref: &str,
) -> Result<Option<Order>, PersistenceError> {
    let query = format!(
        "SELECT {ORDER_COLUMNS} FROM orders
        WHERE payment_transaction_ref = ?1
           OR id = (SELECT order_id FROM payment_transactions WHERE transaction_id = ?1)"
    );
    sqlx::query_as::<_, OrderRow>(&query)
        .bind(transaction_ref)
        .fetch_optional(conn)
        .await?
        .map(row_to_order)
        .transpose()
}

/// Remembers that `order_id` opened `transaction_id`. Recording the same
/// pair twice is a no-op.
pub async fn record_transaction(
    conn: &mut SqliteConnection,
    order_id: OrderId,
    transaction_id: &str,
) -> Result<(), PersistenceError> {
    sqlx::query(
        "
        INSERT INTO payment_transactions (transaction_id, order_id, opened_at)
        VALUES (?1, ?2, ?3)
        ON CONFLICT(transaction_id) DO NOTHING
        ",
    )
    .bind(transaction_id)
    .bind(order_id.to_string())
    .bind(Utc::now())
    .execute(conn)
    .await?;

    Ok(())
}

/// Every transaction `order_id` has opened, oldest first.
pub async fn list_order_transactions(
    conn: &mut SqliteConnection,
    order_id: OrderId,
) -> Result<Vec<String>, PersistenceError> {
    Ok(sqlx::query_scalar::<_, String>(
        "SELECT transaction_id FROM payment_transactions WHERE order_id = ?1 ORDER BY opened_at, rowid",
    )
    .bind(order_id.to_string())
    .fetch_all(conn)
    .await?)
}

fn escape_like(prefix: &str) -> String {
    prefix
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_")
}

/// Case-insensitive lookup on the leading characters of the order id,
/// newest first.
pub async fn find_orders_by_id_prefix(
    conn: &mut SqliteConnection,
    prefix: &str,
) -> Result<Vec<Order>, PersistenceError> {
    let prefix = prefix.trim();
    if prefix.chars().count() < MIN_TRACKING_PREFIX_LEN {
        return Err(PersistenceError::PrefixTooShort {
            min: MIN_TRACKING_PREFIX_LEN,
        });
    }

    let pattern = format!("{}%", escape_like(&prefix.to_lowercase()));
    let query = format!(
        "SELECT {ORDER_COLUMNS} FROM orders WHERE lower(id) LIKE ?1 ESCAPE '\\' ORDER BY created_at DESC LIMIT ?2"
    );

    sqlx::query_as::<_, OrderRow>(&query)
        .bind(pattern)
        .bind(TRACKING_RESULT_LIMIT)
        .fetch_all(conn)
        .await?
        .into_iter()
        .map(row_to_order)
        .collect()
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderFilter {
    pub payment_status: Option<PaymentStatus>,
    pub fulfillment_status: Option<FulfillmentStatus>,
    pub phone_number: Option<String>,
    pub needs_review: Option<bool>,
    pub limit: Option<u32>,
}

impl OrderFilter {
    /// Brings operator input into the form orders are stored in.
    pub fn normalized(mut self) -> Result<Self, ValidationError> {
        self.phone_number = self
            .phone_number
            .as_deref()
            .map(normalize_phone_number)
            .transpose()?;
        Ok(self)
    }
}

/// Operator listing, newest first.
pub async fn list_orders(
    conn: &mut SqliteConnection,
    filter: &OrderFilter,
) -> Result<Vec<Order>, PersistenceError> {
    let mut query = QueryBuilder::<Sqlite>::new(format!("SELECT {ORDER_COLUMNS} FROM orders WHERE 1 = 1"));

    if let Some(status) = filter.payment_status {
        query.push(" AND payment_status = ").push_bind(status.as_str());
    }
    if let Some(status) = filter.fulfillment_status {
        query
            .push(" AND fulfillment_status = ")
            .push_bind(status.as_str());
    }
    if let Some(phone_number) = &filter.phone_number {
        query.push(" AND phone_number = ").push_bind(phone_number.clone());
    }
    if let Some(needs_review) = filter.needs_review {
        query.push(" AND needs_review = ").push_bind(needs_review);
    }

    query
        .push(" ORDER BY created_at DESC LIMIT ")
        .push_bind(i64::from(filter.limit.unwrap_or(DEFAULT_LIST_LIMIT)));

    query
        .build_query_as::<OrderRow>()
        .fetch_all(conn)
        .await?
        .into_iter()
        .map(row_to_order)
        .collect()
}

/// Field-level changes applied by [`update_order`]. `None` leaves the
/// column untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OrderChanges {
    pub total_amount: Option<i64>,
    pub payment_transaction_ref: Option<String>,
    pub payment_status: Option<PaymentStatus>,
    pub fulfillment_status: Option<FulfillmentStatus>,
    pub vendors_by_day: Option<BTreeMap<DayLabel, VendorId>>,
    pub needs_review: Option<bool>,
}

impl OrderChanges {
    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }
}

/// Applies `changes` only if the stored row is still at `expected_version`,
/// then returns the updated order. A stale version is a
/// [`PersistenceError::ConcurrencyConflict`].
pub async fn update_order(
    conn: &mut SqliteConnection,
    id: OrderId,
    expected_version: i64,
    changes: OrderChanges,
) -> Result<Order, PersistenceError> {
    let mut query = QueryBuilder::<Sqlite>::new("UPDATE orders SET version = version + 1, updated_at = ");
    query.push_bind(Utc::now());

    if let Some(total_amount) = changes.total_amount {
        query.push(", total_amount = ").push_bind(total_amount);
    }
    if let Some(transaction_ref) = changes.payment_transaction_ref {
        query
            .push(", payment_transaction_ref = ")
            .push_bind(transaction_ref);
    }
    if let Some(status) = changes.payment_status {
        query.push(", payment_status = ").push_bind(status.as_str());
    }
    if let Some(status) = changes.fulfillment_status {
        query.push(", fulfillment_status = ").push_bind(status.as_str());
    }
    if let Some(vendors) = &changes.vendors_by_day {
        query
            .push(", vendors_by_day = ")
            .push_bind(serde_json::to_string(vendors)?);
    }
    if let Some(needs_review) = changes.needs_review {
        query.push(", needs_review = ").push_bind(needs_review);
    }

    query
        .push(" WHERE id = ")
        .push_bind(id.to_string())
        .push(" AND version = ")
        .push_bind(expected_version);

    let result = query.build().execute(&mut *conn).await?;

    if result.rows_affected() == 0 {
        let current = sqlx::query_scalar::<_, i64>("SELECT version FROM orders WHERE id = ?1")
            .bind(id.to_string())
            .fetch_optional(&mut *conn)
            .await?;

        return Err(match current {
            None => PersistenceError::NotFound(id.to_string()),
            Some(_) => PersistenceError::ConcurrencyConflict {
                order_id: id.to_string(),
                expected_version,
            },
        });
    }

    get_order(conn, id).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{OrderBuilder, setup_test_db};

    #[tokio::test]
    async fn test_insert_and_find_round_trip() {
        let pool = setup_test_db().await;
        let mut conn = pool.acquire().await.unwrap();
        let order = OrderBuilder::new().build();

        insert_order(&mut conn, &order).await.unwrap();
        let stored = find_order_by_id(&mut conn, order.id).await.unwrap().unwrap();

        assert_eq!(stored.id, order.id);
        assert_eq!(stored.selected_days, order.selected_days);
        assert_eq!(stored.meals_by_day, order.meals_by_day);
        assert_eq!(stored.total_amount, 1300);
        assert_eq!(stored.payment_status, PaymentStatus::Pending);
        assert_eq!(stored.fulfillment_status, FulfillmentStatus::Awaiting);
        assert_eq!(stored.version, 0);
    }

    #[tokio::test]
    async fn test_find_missing_order() {
        let pool = setup_test_db().await;
        let mut conn = pool.acquire().await.unwrap();

        assert!(
            find_order_by_id(&mut conn, OrderId::generate())
                .await
                .unwrap()
                .is_none()
        );
        assert!(matches!(
            get_order(&mut conn, OrderId::generate()).await.unwrap_err(),
            PersistenceError::NotFound(_)
        ));
    }

    #[tokio::test]
    async fn test_insert_rejects_empty_days() {
        let pool = setup_test_db().await;
        let mut conn = pool.acquire().await.unwrap();
        let mut order = OrderBuilder::new().build();
        order.selected_days.clear();

        assert!(matches!(
            insert_order(&mut conn, &order).await.unwrap_err(),
            PersistenceError::InvalidColumn {
                column: "selected_days",
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_find_by_transaction_ref() {
        let pool = setup_test_db().await;
        let mut conn = pool.acquire().await.unwrap();
        let order = OrderBuilder::new().with_transaction_ref("tx_77").build();
        insert_order(&mut conn, &order).await.unwrap();

        let found = find_order_by_transaction_ref(&mut conn, "tx_77")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.id, order.id);
        assert!(
            find_order_by_transaction_ref(&mut conn, "tx_78")
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn test_replaced_transactions_still_resolve_to_their_order() {
        let pool = setup_test_db().await;
        let mut conn = pool.acquire().await.unwrap();
        let order = OrderBuilder::new().with_transaction_ref("tx_2").build();
        insert_order(&mut conn, &order).await.unwrap();

        record_transaction(&mut conn, order.id, "tx_1").await.unwrap();
        record_transaction(&mut conn, order.id, "tx_2").await.unwrap();
        record_transaction(&mut conn, order.id, "tx_2").await.unwrap();

        assert_eq!(
            list_order_transactions(&mut conn, order.id).await.unwrap(),
            vec!["tx_1".to_string(), "tx_2".to_string()]
        );
        for transaction_id in ["tx_1", "tx_2"] {
            let found = find_order_by_transaction_ref(&mut conn, transaction_id)
                .await
                .unwrap()
                .unwrap();
            assert_eq!(found.id, order.id);
        }
    }

    #[tokio::test]
    async fn test_prefix_lookup_is_case_insensitive() {
        let pool = setup_test_db().await;
        let mut conn = pool.acquire().await.unwrap();
        let order = OrderBuilder::new().build();
        insert_order(&mut conn, &order).await.unwrap();
        insert_order(&mut conn, &OrderBuilder::new().build())
            .await
            .unwrap();

        let prefix = order.id.to_string()[..8].to_uppercase();
        let found = find_orders_by_id_prefix(&mut conn, &prefix).await.unwrap();

        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, order.id);
    }

    #[tokio::test]
    async fn test_prefix_lookup_treats_wildcards_literally() {
        let pool = setup_test_db().await;
        let mut conn = pool.acquire().await.unwrap();
        insert_order(&mut conn, &OrderBuilder::new().build())
            .await
            .unwrap();

        assert!(
            find_orders_by_id_prefix(&mut conn, "%%%%")
                .await
                .unwrap()
                .is_empty()
        );
        assert!(
            find_orders_by_id_prefix(&mut conn, "____")
                .await
                .unwrap()
                .is_empty()
        );
    }

    #[tokio::test]
    async fn test_prefix_lookup_requires_minimum_length() {
        let pool = setup_test_db().await;
        let mut conn = pool.acquire().await.unwrap();

        assert!(matches!(
            find_orders_by_id_prefix(&mut conn, " ab ").await.unwrap_err(),
            PersistenceError::PrefixTooShort { min: 4 }
        ));
    }

    #[tokio::test]
    async fn test_list_orders_with_filters() {
        let pool = setup_test_db().await;
        let mut conn = pool.acquire().await.unwrap();

        let paid = OrderBuilder::new()
            .with_payment_status(PaymentStatus::Paid)
            .with_phone("+22997000001")
            .build();
        let pending = OrderBuilder::new().with_phone("+22997000002").build();
        let canceled = OrderBuilder::new()
            .with_fulfillment_status(FulfillmentStatus::Canceled)
            .with_phone("+22997000001")
            .build();

        for order in [&paid, &pending, &canceled] {
            insert_order(&mut conn, order).await.unwrap();
        }

        let all = list_orders(&mut conn, &OrderFilter::default()).await.unwrap();
        assert_eq!(all.len(), 3);

        let by_payment = list_orders(
            &mut conn,
            &OrderFilter {
                payment_status: Some(PaymentStatus::Paid),
                ..OrderFilter::default()
            },
        )
        .await
        .unwrap();
        assert_eq!(by_payment.len(), 1);
        assert_eq!(by_payment[0].id, paid.id);

        let by_phone_and_status = list_orders(
            &mut conn,
            &OrderFilter {
                phone_number: Some("+22997000001".to_string()),
                fulfillment_status: Some(FulfillmentStatus::Canceled),
                ..OrderFilter::default()
            },
        )
        .await
        .unwrap();
        assert_eq!(by_phone_and_status.len(), 1);
        assert_eq!(by_phone_and_status[0].id, canceled.id);

        let by_formatted_phone = list_orders(
            &mut conn,
            &OrderFilter {
                phone_number: Some(" +229 97 00 00 01 ".to_string()),
                ..OrderFilter::default()
            }
            .normalized()
            .unwrap(),
        )
        .await
        .unwrap();
        assert_eq!(by_formatted_phone.len(), 2);

        let limited = list_orders(
            &mut conn,
            &OrderFilter {
                limit: Some(2),
                ..OrderFilter::default()
            },
        )
        .await
        .unwrap();
        assert_eq!(limited.len(), 2);
    }

    #[tokio::test]
    async fn test_update_order_bumps_version() {
        let pool = setup_test_db().await;
        let mut conn = pool.acquire().await.unwrap();
        let order = OrderBuilder::new().build();
        insert_order(&mut conn, &order).await.unwrap();

        let vendors = BTreeMap::from([("Monday".to_string(), VendorId(2))]);
        let updated = update_order(
            &mut conn,
            order.id,
            0,
            OrderChanges {
                payment_status: Some(PaymentStatus::Paid),
                vendors_by_day: Some(vendors.clone()),
                ..OrderChanges::default()
            },
        )
        .await
        .unwrap();

        assert_eq!(updated.version, 1);
        assert_eq!(updated.payment_status, PaymentStatus::Paid);
        assert_eq!(updated.vendors_by_day, vendors);
        assert_eq!(updated.fulfillment_status, FulfillmentStatus::Awaiting);
        assert!(updated.updated_at >= order.updated_at);
    }

    #[tokio::test]
    async fn test_update_order_detects_stale_version() {
        let pool = setup_test_db().await;
        let mut conn = pool.acquire().await.unwrap();
        let order = OrderBuilder::new().build();
        insert_order(&mut conn, &order).await.unwrap();

        update_order(
            &mut conn,
            order.id,
            0,
            OrderChanges {
                fulfillment_status: Some(FulfillmentStatus::Confirmed),
                ..OrderChanges::default()
            },
        )
        .await
        .unwrap();

        let err = update_order(
            &mut conn,
            order.id,
            0,
            OrderChanges {
                fulfillment_status: Some(FulfillmentStatus::Preparing),
                ..OrderChanges::default()
            },
        )
        .await
        .unwrap_err();

        assert!(matches!(
            err,
            PersistenceError::ConcurrencyConflict { expected_version: 0, .. }
        ));
    }

    #[tokio::test]
    async fn test_update_missing_order() {
        let pool = setup_test_db().await;
        let mut conn = pool.acquire().await.unwrap();

        let err = update_order(
            &mut conn,
            OrderId::generate(),
            0,
            OrderChanges {
                needs_review: Some(true),
                ..OrderChanges::default()
            },
        )
        .await
        .unwrap_err();
        assert!(matches!(err, PersistenceError::NotFound(_)));
    }

    #[test]
    fn test_escape_like() {
        assert_eq!(escape_like("ab%_\\"), "ab\\%\\_\\\\");
    }

    #[test]
    fn test_order_changes_is_empty() {
        assert!(OrderChanges::default().is_empty());
        assert!(
            !OrderChanges {
                needs_review: Some(false),
                ..OrderChanges::default()
            }
            .is_empty()
        );
    }
}
