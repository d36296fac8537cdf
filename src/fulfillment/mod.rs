//! Operator-driven fulfillment pipeline. Every accepted change is applied
//! under the order's version guard and audited in the same transaction.

use sqlx::SqlitePool;
use tracing::{info, warn};

pub mod audit;

pub use audit::{AuditRecord, audit_trail};

use crate::error::PersistenceError;
use crate::order::repository::{OrderChanges, find_order_by_id, update_order};
use crate::order::{FulfillmentStatus, Order, OrderId};

use FulfillmentStatus::{Awaiting, Canceled, Confirmed, Delivered, OutForDelivery, Preparing};

/// Allowed moves per state. Non-terminal states may move to any other
/// state, backwards included; terminal states have no outgoing edges.
pub const TRANSITIONS: &[(FulfillmentStatus, &[FulfillmentStatus])] = &[
    (
        Awaiting,
        &[Confirmed, Preparing, OutForDelivery, Delivered, Canceled],
    ),
    (
        Confirmed,
        &[Awaiting, Preparing, OutForDelivery, Delivered, Canceled],
    ),
    (
        Preparing,
        &[Awaiting, Confirmed, OutForDelivery, Delivered, Canceled],
    ),
    (
        OutForDelivery,
        &[Awaiting, Confirmed, Preparing, Delivered, Canceled],
    ),
    (Delivered, &[]),
    (Canceled, &[]),
];

#[derive(Debug, thiserror::Error)]
pub enum TransitionError {
    #[error("Order {0} not found")]
    NotFound(OrderId),
    #[error("Order is already {from}; no further changes are allowed")]
    Terminal { from: FulfillmentStatus },
    #[error("Cannot move an order from {from} to {to}")]
    NotAllowed {
        from: FulfillmentStatus,
        to: FulfillmentStatus,
    },
    #[error("Order is already {0}")]
    Unchanged(FulfillmentStatus),
    #[error("An actor is required to change an order's status")]
    MissingActor,
    #[error("Order {order_id} changed since version {expected_version} was read")]
    ConcurrencyConflict {
        order_id: OrderId,
        expected_version: i64,
    },
    #[error(transparent)]
    Persistence(PersistenceError),
}

impl From<PersistenceError> for TransitionError {
    fn from(err: PersistenceError) -> Self {
        match err {
            PersistenceError::ConcurrencyConflict {
                order_id,
                expected_version,
            } => match order_id.parse() {
                Ok(order_id) => Self::ConcurrencyConflict {
                    order_id,
                    expected_version,
                },
                Err(_) => Self::Persistence(PersistenceError::ConcurrencyConflict {
                    order_id,
                    expected_version,
                }),
            },
            other => Self::Persistence(other),
        }
    }
}

impl From<sqlx::Error> for TransitionError {
    fn from(err: sqlx::Error) -> Self {
        Self::Persistence(PersistenceError::Database(err))
    }
}

pub fn allowed_targets(from: FulfillmentStatus) -> &'static [FulfillmentStatus] {
    TRANSITIONS
        .iter()
        .find(|(state, _)| *state == from)
        .map(|(_, targets)| *targets)
        .unwrap_or(&[])
}

pub fn check_transition(
    from: FulfillmentStatus,
    to: FulfillmentStatus,
) -> Result<(), TransitionError> {
    if from == to {
        return Err(TransitionError::Unchanged(from));
    }
    if from.is_terminal() {
        return Err(TransitionError::Terminal { from });
    }
    if !allowed_targets(from).contains(&to) {
        return Err(TransitionError::NotAllowed { from, to });
    }
    Ok(())
}

/// A fulfillment change requested by an operator. Without an
/// `expected_version` the currently stored version is used.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransitionRequest {
    pub order_id: OrderId,
    pub target: FulfillmentStatus,
    pub actor: String,
    pub description: Option<String>,
    pub expected_version: Option<i64>,
}

/// Applies a fulfillment change: load, check the table, version-guarded
/// update, audit record. All or nothing.
pub async fn transition(
    pool: &SqlitePool,
    request: TransitionRequest,
) -> Result<Order, TransitionError> {
    let TransitionRequest {
        order_id,
        target,
        actor,
        description,
        expected_version,
    } = request;

    let actor = actor.trim();
    if actor.is_empty() {
        return Err(TransitionError::MissingActor);
    }
    let description = description
        .as_deref()
        .map(str::trim)
        .filter(|text| !text.is_empty());

    let mut sql_tx = pool.begin().await?;

    let order = find_order_by_id(&mut sql_tx, order_id)
        .await?
        .ok_or(TransitionError::NotFound(order_id))?;

    let expected_version = expected_version.unwrap_or(order.version);
    if expected_version != order.version {
        return Err(TransitionError::ConcurrencyConflict {
            order_id,
            expected_version,
        });
    }

    let from = order.fulfillment_status;
    if let Err(e) = check_transition(from, target) {
        warn!(%order_id, %from, to = %target, actor, "Rejected fulfillment transition: {e}");
        return Err(e);
    }

    let updated = update_order(
        &mut sql_tx,
        order_id,
        expected_version,
        OrderChanges {
            fulfillment_status: Some(target),
            ..OrderChanges::default()
        },
    )
    .await?;

    audit::record_transition(&mut sql_tx, order_id, actor, from, target, description).await?;

    sql_tx.commit().await?;

    info!(%order_id, %from, to = %target, actor, "Fulfillment status changed");
    Ok(updated)
}
