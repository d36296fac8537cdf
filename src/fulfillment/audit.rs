use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::SqliteConnection;

use crate::error::PersistenceError;
use crate::order::{FulfillmentStatus, OrderId};

/// One fulfillment status change, written in the same transaction as the
/// change itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub id: i64,
    pub order_id: OrderId,
    pub actor: String,
    pub from_status: FulfillmentStatus,
    pub to_status: FulfillmentStatus,
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(sqlx::FromRow)]
struct AuditRow {
    id: i64,
    order_id: String,
    actor: String,
    from_status: String,
    to_status: String,
    description: Option<String>,
    created_at: DateTime<Utc>,
}

impl TryFrom<AuditRow> for AuditRecord {
    type Error = PersistenceError;

    fn try_from(row: AuditRow) -> Result<Self, Self::Error> {
        let invalid = |column, value: &str| PersistenceError::InvalidColumn {
            column,
            value: value.to_string(),
        };

        Ok(Self {
            id: row.id,
            order_id: row
                .order_id
                .parse()
                .map_err(|_| invalid("order_id", &row.order_id))?,
            from_status: row
                .from_status
                .parse()
                .map_err(|_| invalid("from_status", &row.from_status))?,
            to_status: row
                .to_status
                .parse()
                .map_err(|_| invalid("to_status", &row.to_status))?,
            actor: row.actor,
            description: row.description,
            created_at: row.created_at,
        })
    }
}

pub(crate) async fn record_transition(
    conn: &mut SqliteConnection,
    order_id: OrderId,
    actor: &str,
    from: FulfillmentStatus,
    to: FulfillmentStatus,
    description: Option<&str>,
) -> Result<i64, PersistenceError> {
    let result = sqlx::query(
        "
        INSERT INTO fulfillment_audit (order_id, actor, from_status, to_status, description, created_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6)
        ",
    )
    .bind(order_id.to_string())
    .bind(actor)
    .bind(from.as_str())
    .bind(to.as_str())
    .bind(description)
    .bind(Utc::now())
    .execute(conn)
    .await?;

    Ok(result.last_insert_rowid())
}

/// Status history of an order, oldest first.
pub async fn audit_trail(
    conn: &mut SqliteConnection,
    order_id: OrderId,
) -> Result<Vec<AuditRecord>, PersistenceError> {
    sqlx::query_as::<_, AuditRow>(
        "
        SELECT id, order_id, actor, from_status, to_status, description, created_at
        FROM fulfillment_audit
        WHERE order_id = ?1
        ORDER BY id ASC
        ",
    )
    .bind(order_id.to_string())
    .fetch_all(conn)
    .await?
    .into_iter()
    .map(AuditRecord::try_from)
    .collect()
}
