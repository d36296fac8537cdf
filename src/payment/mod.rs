//! Gateway transaction handshake: open a hosted transaction for an order,
//! then reconcile the gateway's asynchronous callback into payment status.
//!
//! The callback is the only thing that moves `payment_status`. Callbacks
//! may arrive more than once, so reconciliation is idempotent.

use backon::{ConstantBuilder, Retryable};
use serde::Serialize;
use sqlx::SqlitePool;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use url::Url;

use meal_gateway::{
    CallbackStatus, Currency, CustomerInfo, DynGateway, GatewayError, SupportedGateway,
    TransactionMetadata, TransactionRequest,
};

pub mod callbacks;

pub use callbacks::{CallbackRecord, list_callbacks};

use crate::error::{PersistenceError, ReconciliationError, ValidationError};
use crate::order::repository::{
    OrderChanges, find_order_by_transaction_ref, get_order, record_transaction, update_order,
};
use crate::order::{FulfillmentStatus, Order, OrderId, PaymentStatus, PricingConfig};
use crate::resolver::VendorResolver;

/// Extra attempts at applying a callback when the order keeps changing
/// under us.
const RECONCILE_RETRIES: usize = 2;
const RECONCILE_RETRY_DELAY: Duration = Duration::from_millis(20);

#[derive(Debug, thiserror::Error)]
pub enum PaymentError {
    #[error("Order {0} not found")]
    OrderNotFound(OrderId),
    #[error("Order {0} is already paid")]
    AlreadyPaid(OrderId),
    #[error("Order cannot be paid: {0}")]
    Validation(#[from] ValidationError),
    #[error("Payment could not be started: {0}")]
    Gateway(#[from] GatewayError),
    #[error(
        "Gateway did not answer within {timeout_secs}s for order {order_id}; flagged for manual review"
    )]
    TimedOut { order_id: OrderId, timeout_secs: u64 },
    #[error(transparent)]
    Reconciliation(#[from] ReconciliationError),
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
}

impl From<sqlx::Error> for PaymentError {
    fn from(err: sqlx::Error) -> Self {
        Self::Persistence(PersistenceError::Database(err))
    }
}

/// Outcome carried by a reconciled callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CallbackOutcome {
    Approved,
    Declined,
    Unknown,
}

/// Where an order stands in the gateway handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "outcome", rename_all = "snake_case")]
pub enum TransactionState {
    NoTransaction,
    /// Just opened; the customer has not been sent to the hosted page yet.
    Created,
    AwaitingCallback,
    Reconciled(CallbackOutcome),
}

impl TransactionState {
    /// Derives the state from what is stored on the order. `Created` is
    /// never stored: it only describes a freshly returned handoff.
    pub const fn of(order: &Order) -> Self {
        match (order.payment_status, order.needs_review) {
            (PaymentStatus::Paid | PaymentStatus::Refunded, _) => {
                Self::Reconciled(CallbackOutcome::Approved)
            }
            (PaymentStatus::Failed, _) => Self::Reconciled(CallbackOutcome::Declined),
            (PaymentStatus::Pending, true) => Self::Reconciled(CallbackOutcome::Unknown),
            (PaymentStatus::Pending, false) => {
                if order.payment_transaction_ref.is_some() {
                    Self::AwaitingCallback
                } else {
                    Self::NoTransaction
                }
            }
        }
    }
}

/// What the caller needs to redirect the customer to the hosted page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PaymentHandoff {
    pub order_id: OrderId,
    pub transaction_id: String,
    pub payment_url: Url,
    pub token: String,
    pub amount: i64,
    pub state: TransactionState,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ReconcileOutcome {
    /// No order references the transaction. Acknowledged without effect.
    Ignored,
    Paid { assigned_days: usize },
    Failed,
    /// The order already reflects this outcome.
    Duplicate,
    /// A decline for a transaction that a later attempt replaced.
    /// Acknowledged without effect.
    Superseded,
    FlaggedForReview,
}

impl ReconcileOutcome {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Ignored => "ignored",
            Self::Paid { .. } => "paid",
            Self::Failed => "failed",
            Self::Duplicate => "duplicate",
            Self::Superseded => "superseded",
            Self::FlaggedForReview => "flagged_for_review",
        }
    }
}

/// Read-only payment view for the customer's status page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OrderStatusView {
    pub order_id: OrderId,
    pub payment_status: PaymentStatus,
    pub fulfillment_status: FulfillmentStatus,
    pub transaction: TransactionState,
    pub total_amount: i64,
    pub needs_review: bool,
}

impl From<&Order> for OrderStatusView {
    fn from(order: &Order) -> Self {
        Self {
            order_id: order.id,
            payment_status: order.payment_status,
            fulfillment_status: order.fulfillment_status,
            transaction: TransactionState::of(order),
            total_amount: order.total_amount,
            needs_review: order.needs_review,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoordinatorSettings {
    pub pricing: PricingConfig,
    pub callback_url: Url,
    pub gateway_timeout: Duration,
}

#[derive(Debug)]
pub struct PaymentCoordinator {
    pool: SqlitePool,
    gateway: DynGateway,
    resolver: VendorResolver,
    settings: CoordinatorSettings,
}

impl PaymentCoordinator {
    pub const fn new(
        pool: SqlitePool,
        gateway: DynGateway,
        resolver: VendorResolver,
        settings: CoordinatorSettings,
    ) -> Self {
        Self {
            pool,
            gateway,
            resolver,
            settings,
        }
    }

    pub const fn pricing(&self) -> &PricingConfig {
        &self.settings.pricing
    }

    pub const fn resolver(&self) -> &VendorResolver {
        &self.resolver
    }

    pub fn gateway_kind(&self) -> SupportedGateway {
        self.gateway.to_supported_gateway()
    }

    async fn load_order(&self, order_id: OrderId) -> Result<Order, PaymentError> {
        let mut conn = self.pool.acquire().await?;
        match get_order(&mut conn, order_id).await {
            Ok(order) => Ok(order),
            Err(PersistenceError::NotFound(_)) => Err(PaymentError::OrderNotFound(order_id)),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn order_status(&self, order_id: OrderId) -> Result<OrderStatusView, PaymentError> {
        Ok(OrderStatusView::from(&self.load_order(order_id).await?))
    }

    fn build_request(&self, order: &Order, amount: i64) -> Result<TransactionRequest, PaymentError> {
        let customer = order.customer.validated()?;
        let amount = u64::try_from(amount).map_err(|_| ValidationError::NonPositiveTotal(amount))?;

        Ok(TransactionRequest {
            amount,
            description: format!(
                "Meal order {} for {} day(s)",
                order.id,
                order.selected_days.len()
            ),
            currency: Currency::Xof,
            callback_url: self.settings.callback_url.clone(),
            customer: CustomerInfo::from_full_name(&customer.full_name, customer.phone_number),
            metadata: TransactionMetadata {
                order_id: order.id.to_string(),
            },
        })
    }

    /// Opens a hosted transaction for `order_id` and makes it the order's
    /// current reference. Earlier transactions stay linked to the order, so
    /// a customer who pays an older one is still recognised. The payment
    /// status itself only changes through callbacks.
    ///
    /// A gateway error leaves the order untouched. A gateway that does not
    /// answer in time leaves the outcome unknown: the order is only flagged
    /// for review, since the provider may still have opened the transaction.
    pub async fn create_transaction(&self, order_id: OrderId) -> Result<PaymentHandoff, PaymentError> {
        let order = self.load_order(order_id).await?;

        if order.payment_status == PaymentStatus::Paid {
            return Err(PaymentError::AlreadyPaid(order_id));
        }

        let amount = order.recompute_total(&self.settings.pricing)?;
        if amount <= 0 {
            return Err(ValidationError::NonPositiveTotal(amount).into());
        }
        let request = self.build_request(&order, amount)?;

        let timeout = self.settings.gateway_timeout;
        let hosted = match tokio::time::timeout(timeout, self.gateway.create_transaction(&request))
            .await
        {
            Ok(Ok(hosted)) => hosted,
            Ok(Err(e)) if e.is_timeout() => return Err(self.flag_timeout(&order, timeout).await),
            Ok(Err(e)) => {
                warn!(%order_id, gateway = %self.gateway.to_supported_gateway(), "Gateway rejected transaction: {e}");
                return Err(e.into());
            }
            Err(_) => return Err(self.flag_timeout(&order, timeout).await),
        };

        let stored = self
            .store_transaction(&order, amount, &hosted.transaction_id)
            .await;

        if let Err(e) = stored {
            error!(
                %order_id,
                transaction_id = %hosted.transaction_id,
                "Transaction opened but could not be made the order's current reference: {e}"
            );
            return Err(e.into());
        }

        info!(%order_id, transaction_id = %hosted.transaction_id, amount, "Payment transaction created");

        Ok(PaymentHandoff {
            order_id,
            transaction_id: hosted.transaction_id,
            payment_url: hosted.hosted_payment_url,
            token: hosted.token,
            amount,
            state: TransactionState::Created,
        })
    }

    /// Links the opened transaction before touching the versioned row, so a
    /// concurrent update cannot lose it.
    async fn store_transaction(
        &self,
        order: &Order,
        amount: i64,
        transaction_id: &str,
    ) -> Result<Order, PaymentError> {
        let mut conn = self.pool.acquire().await?;
        record_transaction(&mut conn, order.id, transaction_id).await?;

        Ok(update_order(
            &mut conn,
            order.id,
            order.version,
            OrderChanges {
                total_amount: Some(amount),
                payment_transaction_ref: Some(transaction_id.to_string()),
                needs_review: Some(false),
                ..OrderChanges::default()
            },
        )
        .await?)
    }

    /// Links a transaction the order never stored, typically one opened by
    /// a call that timed out, and makes it the current reference so its
    /// callback can be reconciled.
    pub async fn attach_transaction(
        &self,
        order_id: OrderId,
        transaction_id: &str,
    ) -> Result<Order, PaymentError> {
        let transaction_id = transaction_id.trim();
        if transaction_id.is_empty() {
            return Err(ValidationError::BlankField("Transaction id").into());
        }

        let order = self.load_order(order_id).await?;
        if order.payment_status == PaymentStatus::Paid {
            return Err(PaymentError::AlreadyPaid(order_id));
        }

        let mut sql_tx = self.pool.begin().await?;

        if let Some(owner) = find_order_by_transaction_ref(&mut sql_tx, transaction_id).await?
            && owner.id != order_id
        {
            return Err(ReconciliationError::TransactionClaimed {
                transaction_id: transaction_id.to_string(),
                order_id: owner.id.to_string(),
            }
            .into());
        }

        record_transaction(&mut sql_tx, order_id, transaction_id).await?;
        let updated = update_order(
            &mut sql_tx,
            order_id,
            order.version,
            OrderChanges {
                payment_transaction_ref: Some(transaction_id.to_string()),
                ..OrderChanges::default()
            },
        )
        .await?;

        sql_tx.commit().await?;

        info!(%order_id, transaction_id, "Transaction attached to order");
        Ok(updated)
    }

    async fn flag_timeout(&self, order: &Order, timeout: Duration) -> PaymentError {
        let order_id = order.id;
        warn!(%order_id, timeout_secs = timeout.as_secs(), "Gateway timed out; flagging order for manual review");

        let flagged = async {
            let mut conn = self.pool.acquire().await?;
            update_order(
                &mut conn,
                order_id,
                order.version,
                OrderChanges {
                    needs_review: Some(true),
                    ..OrderChanges::default()
                },
            )
            .await
        }
        .await;

        if let Err(e) = flagged {
            error!(%order_id, "Failed to flag timed out order for review: {e}");
        }

        PaymentError::TimedOut {
            order_id,
            timeout_secs: timeout.as_secs(),
        }
    }

    /// Applies a gateway callback. Unknown transactions are logged and
    /// acknowledged as [`ReconcileOutcome::Ignored`].
    pub async fn reconcile_callback(
        &self,
        transaction_id: &str,
        reported_status: &str,
    ) -> Result<ReconcileOutcome, PaymentError> {
        let transaction_id = transaction_id.trim();
        let status = CallbackStatus::parse(reported_status);

        let apply = || async { self.apply_callback(transaction_id, &status).await };
        let (order_id, outcome) = apply
            .retry(
                ConstantBuilder::default()
                    .with_delay(RECONCILE_RETRY_DELAY)
                    .with_max_times(RECONCILE_RETRIES),
            )
            .when(|e| {
                matches!(
                    e,
                    PaymentError::Persistence(PersistenceError::ConcurrencyConflict { .. })
                )
            })
            .notify(|e, _| {
                warn!(transaction_id, "Order changed during reconciliation; retrying: {e}");
            })
            .await?;

        let mut conn = self.pool.acquire().await?;
        callbacks::record_callback(
            &mut conn,
            transaction_id,
            reported_status.trim(),
            order_id,
            outcome.as_str(),
        )
        .await?;

        info!(transaction_id, status = %status, outcome = outcome.as_str(), "Payment callback reconciled");
        Ok(outcome)
    }

    async fn apply_callback(
        &self,
        transaction_id: &str,
        status: &CallbackStatus,
    ) -> Result<(Option<OrderId>, ReconcileOutcome), PaymentError> {
        let order = {
            let mut conn = self.pool.acquire().await?;
            find_order_by_transaction_ref(&mut conn, transaction_id).await?
        };

        let Some(order) = order else {
            let err = ReconciliationError::UnknownTransaction(transaction_id.to_string());
            warn!(status = %status, "Acknowledging callback without effect: {err}");
            return Ok((None, ReconcileOutcome::Ignored));
        };

        let is_current = order.payment_transaction_ref.as_deref() == Some(transaction_id);

        let changes = match (status, order.payment_status) {
            (CallbackStatus::Canceled | CallbackStatus::Declined, _) if !is_current => {
                debug!(order_id = %order.id, transaction_id, status = %status, "Decline for a replaced transaction");
                return Ok((Some(order.id), ReconcileOutcome::Superseded));
            }
            (CallbackStatus::Approved, PaymentStatus::Paid)
            | (CallbackStatus::Canceled | CallbackStatus::Declined, PaymentStatus::Failed)
                if is_current =>
            {
                return Ok((Some(order.id), ReconcileOutcome::Duplicate));
            }
            (CallbackStatus::Approved, PaymentStatus::Pending | PaymentStatus::Failed) => {
                let vendors = self.resolver.assign_all(&order).await;
                OrderChanges {
                    payment_status: Some(PaymentStatus::Paid),
                    payment_transaction_ref: Some(transaction_id.to_string()),
                    vendors_by_day: Some(vendors),
                    needs_review: Some(false),
                    ..OrderChanges::default()
                }
            }
            (CallbackStatus::Canceled | CallbackStatus::Declined, PaymentStatus::Pending) => {
                OrderChanges {
                    payment_status: Some(PaymentStatus::Failed),
                    needs_review: Some(false),
                    ..OrderChanges::default()
                }
            }
            (_, current) => {
                warn!(
                    order_id = %order.id,
                    transaction_id,
                    status = %status,
                    %current,
                    "Callback outcome cannot be applied automatically; flagging for review"
                );
                if order.needs_review {
                    return Ok((Some(order.id), ReconcileOutcome::FlaggedForReview));
                }
                OrderChanges {
                    needs_review: Some(true),
                    ..OrderChanges::default()
                }
            }
        };

        let mut conn = self.pool.acquire().await?;
        let updated = update_order(&mut conn, order.id, order.version, changes).await?;

        let outcome = match updated.payment_status {
            PaymentStatus::Paid if order.payment_status != PaymentStatus::Paid => {
                ReconcileOutcome::Paid {
                    assigned_days: updated.vendors_by_day.len(),
                }
            }
            PaymentStatus::Failed if order.payment_status != PaymentStatus::Failed => {
                ReconcileOutcome::Failed
            }
            _ => ReconcileOutcome::FlaggedForReview,
        };

        Ok((Some(order.id), outcome))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{SqliteCatalog, VendorId};
    use crate::test_utils::{
        OrderBuilder, insert_test_order, seed_catalog, setup_test_db,
    };
    use meal_gateway::TestGateway;
    use std::collections::BTreeMap;
    use std::sync::Arc;

    fn settings() -> CoordinatorSettings {
        CoordinatorSettings {
            pricing: PricingConfig::default(),
            callback_url: Url::parse("http://127.0.0.1:8080/payments/callback").unwrap(),
            gateway_timeout: Duration::from_secs(5),
        }
    }

    fn coordinator_on(pool: &SqlitePool, gateway: TestGateway, timeout: Duration) -> PaymentCoordinator {
        let resolver = VendorResolver::new(Arc::new(SqliteCatalog::new(pool.clone())));
        PaymentCoordinator::new(
            pool.clone(),
            Arc::new(gateway),
            resolver,
            CoordinatorSettings {
                gateway_timeout: timeout,
                ..settings()
            },
        )
    }

    async fn coordinator_with(gateway: TestGateway, timeout: Duration) -> (PaymentCoordinator, SqlitePool) {
        let pool = setup_test_db().await;
        seed_catalog(&pool).await;
        (coordinator_on(&pool, gateway, timeout), pool)
    }

    async fn coordinator() -> (PaymentCoordinator, SqlitePool) {
        coordinator_with(TestGateway::new(), Duration::from_secs(5)).await
    }

    async fn reload(pool: &SqlitePool, order_id: OrderId) -> Order {
        let mut conn = pool.acquire().await.unwrap();
        get_order(&mut conn, order_id).await.unwrap()
    }

    async fn order_with_transaction(pool: &SqlitePool, transaction_id: &str) -> Order {
        insert_test_order(
            pool,
            &OrderBuilder::new()
                .with_transaction_ref(transaction_id)
                .build(),
        )
        .await
    }

    #[tokio::test]
    async fn test_create_transaction_stores_reference() {
        let gateway = TestGateway::new();
        let (coordinator, pool) = coordinator_with(gateway.clone(), Duration::from_secs(5)).await;
        let order = insert_test_order(&pool, &OrderBuilder::new().build()).await;

        let handoff = coordinator.create_transaction(order.id).await.unwrap();

        assert_eq!(handoff.transaction_id, "TEST_TX_1");
        assert_eq!(handoff.token, "TEST_TOKEN_1");
        assert_eq!(handoff.amount, 1300);
        assert_eq!(handoff.state, TransactionState::Created);
        assert_eq!(gateway.opened(), 1);

        let stored = reload(&pool, order.id).await;
        assert_eq!(stored.payment_transaction_ref.as_deref(), Some("TEST_TX_1"));
        assert_eq!(stored.payment_status, PaymentStatus::Pending);
        assert_eq!(TransactionState::of(&stored), TransactionState::AwaitingCallback);
    }

    #[tokio::test]
    async fn test_create_transaction_uses_recomputed_total() {
        let (coordinator, pool) = coordinator().await;
        let mut order = OrderBuilder::new().build();
        order.total_amount = 1;
        let order = insert_test_order(&pool, &order).await;

        let handoff = coordinator.create_transaction(order.id).await.unwrap();

        assert_eq!(handoff.amount, 1300);
        assert_eq!(reload(&pool, order.id).await.total_amount, 1300);
    }

    #[tokio::test]
    async fn test_gateway_failure_leaves_order_untouched() {
        let (coordinator, pool) =
            coordinator_with(TestGateway::with_failure("card network down"), Duration::from_secs(5)).await;
        let order = insert_test_order(&pool, &OrderBuilder::new().build()).await;

        let err = coordinator.create_transaction(order.id).await.unwrap_err();
        assert!(matches!(err, PaymentError::Gateway(GatewayError::Rejected(_))));

        assert_eq!(reload(&pool, order.id).await, order);
    }

    #[tokio::test]
    async fn test_gateway_timeout_flags_order_for_review() {
        let (coordinator, pool) = coordinator_with(
            TestGateway::with_delay(Duration::from_secs(2)),
            Duration::from_millis(100),
        )
        .await;
        let order = insert_test_order(&pool, &OrderBuilder::new().build()).await;

        let err = coordinator.create_transaction(order.id).await.unwrap_err();
        assert!(matches!(err, PaymentError::TimedOut { .. }));

        let stored = reload(&pool, order.id).await;
        assert!(stored.needs_review);
        assert_eq!(stored.payment_status, PaymentStatus::Pending);
        assert_eq!(stored.payment_transaction_ref, None);
        assert_eq!(
            TransactionState::of(&stored),
            TransactionState::Reconciled(CallbackOutcome::Unknown)
        );
    }

    #[tokio::test]
    async fn test_create_transaction_rejects_paid_and_missing_orders() {
        let (coordinator, pool) = coordinator().await;
        let paid = insert_test_order(
            &pool,
            &OrderBuilder::new()
                .with_payment_status(PaymentStatus::Paid)
                .build(),
        )
        .await;

        assert!(matches!(
            coordinator.create_transaction(paid.id).await.unwrap_err(),
            PaymentError::AlreadyPaid(_)
        ));
        assert!(matches!(
            coordinator
                .create_transaction(OrderId::generate())
                .await
                .unwrap_err(),
            PaymentError::OrderNotFound(_)
        ));
    }

    #[tokio::test]
    async fn test_create_transaction_validates_customer() {
        let (coordinator, pool) = coordinator().await;
        let order = insert_test_order(&pool, &OrderBuilder::new().with_phone("call me").build()).await;

        assert!(matches!(
            coordinator.create_transaction(order.id).await.unwrap_err(),
            PaymentError::Validation(ValidationError::InvalidPhoneNumber(_))
        ));
    }

    #[tokio::test]
    async fn test_approved_callback_marks_paid_and_assigns_vendors() {
        let (coordinator, pool) = coordinator().await;
        let order = order_with_transaction(&pool, "tx_1").await;

        let outcome = coordinator.reconcile_callback("tx_1", "approved").await.unwrap();
        assert_eq!(outcome, ReconcileOutcome::Paid { assigned_days: 2 });

        let stored = reload(&pool, order.id).await;
        assert_eq!(stored.payment_status, PaymentStatus::Paid);
        assert_eq!(
            stored.vendors_by_day,
            BTreeMap::from([
                ("Monday".to_string(), VendorId(2)),
                ("Tuesday".to_string(), VendorId(2)),
            ])
        );
    }

    #[tokio::test]
    async fn test_approved_twice_is_idempotent() {
        let (coordinator, pool) = coordinator().await;
        let order = order_with_transaction(&pool, "tx_1").await;

        coordinator.reconcile_callback("tx_1", "approved").await.unwrap();
        let after_first = reload(&pool, order.id).await;

        let outcome = coordinator.reconcile_callback("tx_1", "APPROVED").await.unwrap();
        assert_eq!(outcome, ReconcileOutcome::Duplicate);

        let after_second = reload(&pool, order.id).await;
        assert_eq!(after_second, after_first);

        let mut conn = pool.acquire().await.unwrap();
        let log = list_callbacks(&mut conn, "tx_1").await.unwrap();
        assert_eq!(
            log.iter().map(|record| record.outcome.as_str()).collect::<Vec<_>>(),
            vec!["paid", "duplicate"]
        );
    }

    #[tokio::test]
    async fn test_canceled_callback_marks_failed_without_vendors() {
        let (coordinator, pool) = coordinator().await;
        let order = order_with_transaction(&pool, "tx_1").await;

        let outcome = coordinator.reconcile_callback("tx_1", "canceled").await.unwrap();
        assert_eq!(outcome, ReconcileOutcome::Failed);

        let stored = reload(&pool, order.id).await;
        assert_eq!(stored.payment_status, PaymentStatus::Failed);
        assert!(stored.vendors_by_day.is_empty());
    }

    #[tokio::test]
    async fn test_decline_never_downgrades_paid_order() {
        let (coordinator, pool) = coordinator().await;
        let order = order_with_transaction(&pool, "tx_1").await;
        coordinator.reconcile_callback("tx_1", "approved").await.unwrap();

        let outcome = coordinator.reconcile_callback("tx_1", "declined").await.unwrap();
        assert_eq!(outcome, ReconcileOutcome::FlaggedForReview);

        let stored = reload(&pool, order.id).await;
        assert_eq!(stored.payment_status, PaymentStatus::Paid);
        assert!(stored.needs_review);
    }

    #[tokio::test]
    async fn test_unknown_status_stays_pending_and_flags_review() {
        let (coordinator, pool) = coordinator().await;
        let order = order_with_transaction(&pool, "tx_1").await;

        let outcome = coordinator.reconcile_callback("tx_1", "pending_3ds").await.unwrap();
        assert_eq!(outcome, ReconcileOutcome::FlaggedForReview);

        let stored = reload(&pool, order.id).await;
        assert_eq!(stored.payment_status, PaymentStatus::Pending);
        assert!(stored.needs_review);
        assert!(stored.vendors_by_day.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_transaction_is_acknowledged_without_mutation() {
        let (coordinator, pool) = coordinator().await;
        let order = order_with_transaction(&pool, "tx_1").await;

        let outcome = coordinator.reconcile_callback("tx_404", "approved").await.unwrap();
        assert_eq!(outcome, ReconcileOutcome::Ignored);
        assert_eq!(reload(&pool, order.id).await, order);

        let mut conn = pool.acquire().await.unwrap();
        let log = list_callbacks(&mut conn, "tx_404").await.unwrap();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].order_id, None);
        assert_eq!(log[0].outcome, "ignored");
    }

    #[tokio::test]
    async fn test_approved_after_failure_recovers() {
        let (coordinator, pool) = coordinator().await;
        let order = order_with_transaction(&pool, "tx_1").await;

        coordinator.reconcile_callback("tx_1", "declined").await.unwrap();
        let outcome = coordinator.reconcile_callback("tx_1", "approved").await.unwrap();

        assert_eq!(outcome, ReconcileOutcome::Paid { assigned_days: 2 });
        assert_eq!(reload(&pool, order.id).await.payment_status, PaymentStatus::Paid);
    }

    #[tokio::test]
    async fn test_retry_after_failure_keeps_status_until_callback() {
        let (coordinator, pool) = coordinator().await;
        let order = insert_test_order(&pool, &OrderBuilder::new().build()).await;

        let first = coordinator.create_transaction(order.id).await.unwrap();
        coordinator
            .reconcile_callback(&first.transaction_id, "canceled")
            .await
            .unwrap();

        let second = coordinator.create_transaction(order.id).await.unwrap();
        assert_ne!(first.transaction_id, second.transaction_id);

        let stored = reload(&pool, order.id).await;
        assert_eq!(stored.payment_status, PaymentStatus::Failed);
        assert_eq!(
            stored.payment_transaction_ref.as_deref(),
            Some(second.transaction_id.as_str())
        );

        assert_eq!(
            coordinator
                .reconcile_callback(&second.transaction_id, "approved")
                .await
                .unwrap(),
            ReconcileOutcome::Paid { assigned_days: 2 }
        );
    }

    #[tokio::test]
    async fn test_replaced_transaction_can_still_pay_the_order() {
        let (coordinator, pool) = coordinator().await;
        let order = insert_test_order(&pool, &OrderBuilder::new().build()).await;

        let first = coordinator.create_transaction(order.id).await.unwrap();
        let second = coordinator.create_transaction(order.id).await.unwrap();

        let outcome = coordinator
            .reconcile_callback(&first.transaction_id, "approved")
            .await
            .unwrap();
        assert_eq!(outcome, ReconcileOutcome::Paid { assigned_days: 2 });

        let stored = reload(&pool, order.id).await;
        assert_eq!(stored.payment_status, PaymentStatus::Paid);
        assert_eq!(
            stored.payment_transaction_ref.as_deref(),
            Some(first.transaction_id.as_str())
        );

        // The abandoned attempt expires without touching the paid order.
        assert_eq!(
            coordinator
                .reconcile_callback(&second.transaction_id, "canceled")
                .await
                .unwrap(),
            ReconcileOutcome::Superseded
        );
        let stored = reload(&pool, order.id).await;
        assert_eq!(stored.payment_status, PaymentStatus::Paid);
        assert!(!stored.needs_review);
    }

    #[tokio::test]
    async fn test_decline_of_replaced_transaction_is_ignored() {
        let (coordinator, pool) = coordinator().await;
        let order = insert_test_order(&pool, &OrderBuilder::new().build()).await;

        let first = coordinator.create_transaction(order.id).await.unwrap();
        coordinator.create_transaction(order.id).await.unwrap();

        let outcome = coordinator
            .reconcile_callback(&first.transaction_id, "declined")
            .await
            .unwrap();
        assert_eq!(outcome, ReconcileOutcome::Superseded);
        assert_eq!(reload(&pool, order.id).await.payment_status, PaymentStatus::Pending);
    }

    #[tokio::test]
    async fn test_second_approval_on_paid_order_flags_review() {
        let (coordinator, pool) = coordinator().await;
        let order = insert_test_order(&pool, &OrderBuilder::new().build()).await;

        let first = coordinator.create_transaction(order.id).await.unwrap();
        let second = coordinator.create_transaction(order.id).await.unwrap();
        coordinator
            .reconcile_callback(&second.transaction_id, "approved")
            .await
            .unwrap();

        let outcome = coordinator
            .reconcile_callback(&first.transaction_id, "approved")
            .await
            .unwrap();
        assert_eq!(outcome, ReconcileOutcome::FlaggedForReview);

        let stored = reload(&pool, order.id).await;
        assert_eq!(stored.payment_status, PaymentStatus::Paid);
        assert!(stored.needs_review);
        assert_eq!(
            stored.payment_transaction_ref.as_deref(),
            Some(second.transaction_id.as_str())
        );
    }

    #[tokio::test]
    async fn test_successful_retry_after_timeout_clears_review_flag() {
        let (slow, pool) = coordinator_with(
            TestGateway::with_delay(Duration::from_secs(2)),
            Duration::from_millis(50),
        )
        .await;
        let order = insert_test_order(&pool, &OrderBuilder::new().build()).await;
        slow.create_transaction(order.id).await.unwrap_err();
        assert!(reload(&pool, order.id).await.needs_review);

        let coordinator = coordinator_on(&pool, TestGateway::new(), Duration::from_secs(5));
        let handoff = coordinator.create_transaction(order.id).await.unwrap();

        let stored = reload(&pool, order.id).await;
        assert!(!stored.needs_review);
        assert_eq!(TransactionState::of(&stored), TransactionState::AwaitingCallback);

        coordinator
            .reconcile_callback(&handoff.transaction_id, "approved")
            .await
            .unwrap();
        let stored = reload(&pool, order.id).await;
        assert_eq!(stored.payment_status, PaymentStatus::Paid);
        assert!(!stored.needs_review);
    }

    #[tokio::test]
    async fn test_decisive_callback_clears_review_flag() {
        let (coordinator, pool) = coordinator().await;
        let order = order_with_transaction(&pool, "tx_1").await;

        coordinator.reconcile_callback("tx_1", "pending_3ds").await.unwrap();
        assert!(reload(&pool, order.id).await.needs_review);

        coordinator.reconcile_callback("tx_1", "declined").await.unwrap();
        let stored = reload(&pool, order.id).await;
        assert_eq!(stored.payment_status, PaymentStatus::Failed);
        assert!(!stored.needs_review);
    }

    #[tokio::test]
    async fn test_attach_transaction_after_timeout() {
        let (coordinator, pool) = coordinator_with(
            TestGateway::with_delay(Duration::from_secs(2)),
            Duration::from_millis(50),
        )
        .await;
        let order = insert_test_order(&pool, &OrderBuilder::new().build()).await;
        coordinator.create_transaction(order.id).await.unwrap_err();

        // Before the operator links it, the provider's callback matches nothing.
        assert_eq!(
            coordinator.reconcile_callback("gw_991", "approved").await.unwrap(),
            ReconcileOutcome::Ignored
        );

        let attached = coordinator.attach_transaction(order.id, " gw_991 ").await.unwrap();
        assert_eq!(attached.payment_transaction_ref.as_deref(), Some("gw_991"));

        let outcome = coordinator.reconcile_callback("gw_991", "approved").await.unwrap();
        assert_eq!(outcome, ReconcileOutcome::Paid { assigned_days: 2 });

        let stored = reload(&pool, order.id).await;
        assert_eq!(stored.payment_status, PaymentStatus::Paid);
        assert!(!stored.needs_review);
    }

    #[tokio::test]
    async fn test_attach_transaction_rejects_claimed_or_paid() {
        let (coordinator, pool) = coordinator().await;
        let owner = order_with_transaction(&pool, "tx_1").await;
        let other = insert_test_order(&pool, &OrderBuilder::new().build()).await;

        let err = coordinator.attach_transaction(other.id, "tx_1").await.unwrap_err();
        assert!(matches!(
            err,
            PaymentError::Reconciliation(ReconciliationError::TransactionClaimed { ref order_id, .. })
                if *order_id == owner.id.to_string()
        ));
        assert_eq!(reload(&pool, other.id).await, other);

        assert!(matches!(
            coordinator.attach_transaction(other.id, "  ").await.unwrap_err(),
            PaymentError::Validation(ValidationError::BlankField(_))
        ));

        coordinator.reconcile_callback("tx_1", "approved").await.unwrap();
        assert!(matches!(
            coordinator.attach_transaction(owner.id, "tx_2").await.unwrap_err(),
            PaymentError::AlreadyPaid(_)
        ));
    }

    #[tokio::test]
    async fn test_order_status_view() {
        let (coordinator, pool) = coordinator().await;
        let order = insert_test_order(&pool, &OrderBuilder::new().build()).await;

        let view = coordinator.order_status(order.id).await.unwrap();
        assert_eq!(view.payment_status, PaymentStatus::Pending);
        assert_eq!(view.transaction, TransactionState::NoTransaction);
        assert_eq!(view.total_amount, 1300);
    }

    #[test]
    fn test_transaction_state_serialization() {
        assert_eq!(
            serde_json::to_value(TransactionState::Reconciled(CallbackOutcome::Declined)).unwrap(),
            serde_json::json!({"state": "reconciled", "outcome": "declined"})
        );
        assert_eq!(
            serde_json::to_value(TransactionState::AwaitingCallback).unwrap(),
            serde_json::json!({"state": "awaiting_callback"})
        );
    }
}
