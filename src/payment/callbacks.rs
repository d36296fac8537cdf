use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::SqliteConnection;

use crate::error::PersistenceError;
use crate::order::OrderId;

/// A gateway callback as received, kept for manual reconciliation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CallbackRecord {
    pub id: i64,
    pub transaction_id: String,
    pub reported_status: String,
    pub order_id: Option<OrderId>,
    pub outcome: String,
    pub received_at: DateTime<Utc>,
}

#[derive(sqlx::FromRow)]
struct CallbackRow {
    id: i64,
    transaction_id: String,
    reported_status: String,
    order_id: Option<String>,
    outcome: String,
    received_at: DateTime<Utc>,
}

impl TryFrom<CallbackRow> for CallbackRecord {
    type Error = PersistenceError;

    fn try_from(row: CallbackRow) -> Result<Self, Self::Error> {
        let order_id = row
            .order_id
            .map(|id| {
                id.parse::<OrderId>()
                    .map_err(|_| PersistenceError::InvalidColumn {
                        column: "order_id",
                        value: id.clone(),
                    })
            })
            .transpose()?;

        Ok(Self {
            id: row.id,
            transaction_id: row.transaction_id,
            reported_status: row.reported_status,
            order_id,
            outcome: row.outcome,
            received_at: row.received_at,
        })
    }
}

pub(crate) async fn record_callback(
    conn: &mut SqliteConnection,
    transaction_id: &str,
    reported_status: &str,
    order_id: Option<OrderId>,
    outcome: &str,
) -> Result<(), PersistenceError> {
    sqlx::query(
        "
        INSERT INTO payment_callbacks (transaction_id, reported_status, order_id, outcome, received_at)
        VALUES (?1, ?2, ?3, ?4, ?5)
        ",
    )
    .bind(transaction_id)
    .bind(reported_status)
    .bind(order_id.map(|id| id.to_string()))
    .bind(outcome)
    .bind(Utc::now())
    .execute(conn)
    .await?;

    Ok(())
}

/// Callbacks received for a transaction, oldest first.
pub async fn list_callbacks(
    conn: &mut SqliteConnection,
    transaction_id: &str,
) -> Result<Vec<CallbackRecord>, PersistenceError> {
    sqlx::query_as::<_, CallbackRow>(
        "
        SELECT id, transaction_id, reported_status, order_id, outcome, received_at
        FROM payment_callbacks
        WHERE transaction_id = ?1
        ORDER BY id ASC
        ",
    )
    .bind(transaction_id)
    .fetch_all(conn)
    .await?
    .into_iter()
    .map(CallbackRecord::try_from)
    .collect()
}
