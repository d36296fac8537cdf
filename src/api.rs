use chrono::{DateTime, Utc};
use rocket::http::Status;
use rocket::response::status::Custom;
use rocket::response::{self, Responder};
use rocket::serde::json::Json;
use rocket::{FromForm, Request, Route, State, get, post, routes};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::catalog::{DynCatalog, Meal, SideDish};
use crate::checkout::{Checkout, CheckoutError};
use crate::error::{CatalogLookupError, PersistenceError};
use crate::fulfillment::audit::{AuditRecord, audit_trail};
use crate::fulfillment::{TransitionError, TransitionRequest, transition};
use crate::order::repository::{
    OrderFilter, find_order_by_id, find_orders_by_id_prefix, list_orders,
};
use crate::order::{FulfillmentStatus, Order, OrderDraft, OrderId, ParseStatusError, PaymentStatus};
use crate::payment::callbacks::{CallbackRecord, list_callbacks};
use crate::payment::{OrderStatusView, PaymentCoordinator, PaymentError, PaymentHandoff};
use crate::planning::{PlanningSession, Step, StepInput};

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

/// Error answered as `{ "error": ... }` with a status matching its cause.
#[derive(Debug)]
pub struct ApiError {
    status: Status,
    message: String,
}

impl ApiError {
    fn new(status: Status, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

impl<'r> Responder<'r, 'static> for ApiError {
    fn respond_to(self, request: &'r Request<'_>) -> response::Result<'static> {
        if self.status.code >= 500 {
            error!(status = self.status.code, uri = %request.uri(), "Request failed: {}", self.message);
        }
        Custom(self.status, Json(ErrorResponse { error: self.message })).respond_to(request)
    }
}

impl From<sqlx::Error> for ApiError {
    fn from(err: sqlx::Error) -> Self {
        PersistenceError::Database(err).into()
    }
}

impl From<PersistenceError> for ApiError {
    fn from(err: PersistenceError) -> Self {
        let status = match &err {
            PersistenceError::NotFound(_) => Status::NotFound,
            PersistenceError::PrefixTooShort { .. } => Status::BadRequest,
            PersistenceError::ConcurrencyConflict { .. } => Status::Conflict,
            PersistenceError::Database(_)
            | PersistenceError::Json(_)
            | PersistenceError::InvalidColumn { .. } => Status::InternalServerError,
        };
        Self::new(status, err.to_string())
    }
}

impl From<CatalogLookupError> for ApiError {
    fn from(err: CatalogLookupError) -> Self {
        Self::new(Status::ServiceUnavailable, err.to_string())
    }
}

impl From<ParseStatusError> for ApiError {
    fn from(err: ParseStatusError) -> Self {
        Self::new(Status::BadRequest, err.to_string())
    }
}

impl From<PaymentError> for ApiError {
    fn from(err: PaymentError) -> Self {
        let status = match err {
            PaymentError::Persistence(e) => return e.into(),
            PaymentError::OrderNotFound(_) => Status::NotFound,
            PaymentError::AlreadyPaid(_) | PaymentError::Reconciliation(_) => Status::Conflict,
            PaymentError::Validation(_) => Status::UnprocessableEntity,
            PaymentError::Gateway(_) => Status::BadGateway,
            PaymentError::TimedOut { .. } => Status::GatewayTimeout,
        };
        Self::new(status, err.to_string())
    }
}

impl From<CheckoutError> for ApiError {
    fn from(err: CheckoutError) -> Self {
        match err {
            CheckoutError::Validation(e) => Self::new(Status::UnprocessableEntity, e.to_string()),
            CheckoutError::Catalog(e) => e.into(),
            CheckoutError::Persistence(e) => e.into(),
            CheckoutError::Payment(e) => e.into(),
        }
    }
}

impl From<TransitionError> for ApiError {
    fn from(err: TransitionError) -> Self {
        let status = match &err {
            TransitionError::NotFound(_) => Status::NotFound,
            TransitionError::Terminal { .. }
            | TransitionError::NotAllowed { .. }
            | TransitionError::Unchanged(_)
            | TransitionError::ConcurrencyConflict { .. } => Status::Conflict,
            TransitionError::MissingActor => Status::UnprocessableEntity,
            TransitionError::Persistence(_) => Status::InternalServerError,
        };
        Self::new(status, err.to_string())
    }
}

fn parse_order_id(raw: &str) -> Result<OrderId, ApiError> {
    raw.trim()
        .parse()
        .map_err(|_| ApiError::new(Status::BadRequest, format!("Invalid order id: {raw}")))
}

#[get("/health")]
pub fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        timestamp: chrono::Utc::now(),
    })
}

#[get("/menu")]
pub async fn menu(catalog: &State<DynCatalog>) -> Result<Json<Vec<Meal>>, ApiError> {
    Ok(Json(catalog.list_active_meals().await?))
}

#[get("/menu/<meal_id>/sides")]
pub async fn menu_sides(
    meal_id: i64,
    catalog: &State<DynCatalog>,
) -> Result<Json<Vec<SideDish>>, ApiError> {
    Ok(Json(catalog.list_side_dishes_for_meal(meal_id).await?))
}

#[derive(Debug, Deserialize)]
pub struct PlanningStepRequest {
    #[serde(default)]
    pub session: PlanningSession,
    pub input: StepInput,
}

/// The session after the request. On rejected input the session is
/// returned unchanged together with the reason.
#[derive(Debug, Serialize, Deserialize)]
pub struct PlanningResponse {
    pub step: Step,
    pub session: PlanningSession,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

fn planning_response(
    session: PlanningSession,
    result: Result<Step, crate::error::ValidationError>,
) -> Custom<Json<PlanningResponse>> {
    match result {
        Ok(step) => Custom(
            Status::Ok,
            Json(PlanningResponse {
                step,
                session,
                error: None,
            }),
        ),
        Err(e) => Custom(
            Status::UnprocessableEntity,
            Json(PlanningResponse {
                step: session.step(),
                session,
                error: Some(e.to_string()),
            }),
        ),
    }
}

#[post("/planning/step", format = "json", data = "<request>")]
pub fn planning_step(request: Json<PlanningStepRequest>) -> Custom<Json<PlanningResponse>> {
    let PlanningStepRequest { mut session, input } = request.into_inner();
    let result = session.submit(input);
    planning_response(session, result)
}

#[post("/planning/back", format = "json", data = "<session>")]
pub fn planning_back(session: Json<PlanningSession>) -> Custom<Json<PlanningResponse>> {
    let mut session = session.into_inner();
    let result = session.prev();
    planning_response(session, result)
}

#[derive(Debug, Serialize)]
pub struct CheckoutResponse {
    pub session: PlanningSession,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payment: Option<PaymentHandoff>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Hands a finished planning session off to payment. The session is
/// always returned so a failed attempt can be retried against the same
/// stored order.
#[post("/checkout", format = "json", data = "<session>")]
pub async fn checkout_session(
    session: Json<PlanningSession>,
    checkout: &State<Arc<Checkout>>,
) -> Custom<Json<CheckoutResponse>> {
    let mut session = session.into_inner();

    match session.hand_off(checkout).await {
        Ok(handoff) => Custom(
            Status::Ok,
            Json(CheckoutResponse {
                session,
                payment: Some(handoff),
                error: None,
            }),
        ),
        Err(e) => {
            let ApiError { status, message } = e.into();
            if status.code >= 500 {
                error!(status = status.code, "Checkout failed: {message}");
            }
            Custom(
                status,
                Json(CheckoutResponse {
                    session,
                    payment: None,
                    error: Some(message),
                }),
            )
        }
    }
}

#[post("/orders", format = "json", data = "<draft>")]
pub async fn place_order(
    draft: Json<OrderDraft>,
    checkout: &State<Arc<Checkout>>,
) -> Result<Custom<Json<Order>>, ApiError> {
    let order = checkout.place_order(&draft).await?;
    Ok(Custom(Status::Created, Json(order)))
}

#[post("/orders/<id>/payment")]
pub async fn start_payment(
    id: &str,
    checkout: &State<Arc<Checkout>>,
) -> Result<Json<PaymentHandoff>, ApiError> {
    let order_id = parse_order_id(id)?;
    Ok(Json(checkout.start_payment(order_id).await?))
}

/// Stored payment and delivery state. Never inferred from the redirect
/// the customer arrived with.
#[get("/orders/<id>")]
pub async fn order_status(
    id: &str,
    coordinator: &State<Arc<PaymentCoordinator>>,
) -> Result<Json<OrderStatusView>, ApiError> {
    let order_id = parse_order_id(id)?;
    Ok(Json(coordinator.order_status(order_id).await?))
}

#[derive(Debug, Serialize)]
pub struct TrackedOrder {
    #[serde(flatten)]
    pub status: OrderStatusView,
    pub selected_days: Vec<String>,
    pub created_at: DateTime<Utc>,
}

#[get("/track/<prefix>")]
pub async fn track(
    prefix: &str,
    pool: &State<SqlitePool>,
) -> Result<Json<Vec<TrackedOrder>>, ApiError> {
    let mut conn = pool.acquire().await?;
    let orders = find_orders_by_id_prefix(&mut conn, prefix).await?;

    Ok(Json(
        orders
            .iter()
            .map(|order| TrackedOrder {
                status: order.into(),
                selected_days: order.selected_days.clone(),
                created_at: order.created_at,
            })
            .collect(),
    ))
}

#[derive(Debug, FromForm)]
pub struct CallbackQuery {
    #[field(name = "transactionId")]
    pub transaction_id: Option<String>,
    pub status: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookPayload {
    #[serde(alias = "id", alias = "transaction_id")]
    pub transaction_id: String,
    pub status: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CallbackAck {
    pub acknowledged: bool,
    pub outcome: String,
}

async fn acknowledge(
    coordinator: &PaymentCoordinator,
    transaction_id: Option<&str>,
    status: Option<&str>,
) -> Json<CallbackAck> {
    let outcome = match (transaction_id, status) {
        (Some(transaction_id), Some(status)) if !transaction_id.trim().is_empty() => {
            match coordinator.reconcile_callback(transaction_id, status).await {
                Ok(outcome) => outcome.as_str().to_string(),
                Err(e) => {
                    error!(transaction_id, status, "Failed to reconcile payment callback: {e}");
                    "error".to_string()
                }
            }
        }
        _ => {
            warn!(?transaction_id, ?status, "Payment callback without transaction id or status");
            "malformed".to_string()
        }
    };

    Json(CallbackAck {
        acknowledged: true,
        outcome,
    })
}

/// Browser redirect back from the hosted page. Always acknowledged.
#[get("/payments/callback?<callback..>")]
pub async fn payment_callback(
    callback: CallbackQuery,
    coordinator: &State<Arc<PaymentCoordinator>>,
) -> Json<CallbackAck> {
    acknowledge(
        coordinator,
        callback.transaction_id.as_deref(),
        callback.status.as_deref(),
    )
    .await
}

/// Server-to-server notification. Always acknowledged, even when the body
/// cannot be read, so the gateway stops retrying.
#[post("/payments/webhook", data = "<body>")]
pub async fn payment_webhook(
    body: String,
    coordinator: &State<Arc<PaymentCoordinator>>,
) -> Json<CallbackAck> {
    match serde_json::from_str::<WebhookPayload>(&body) {
        Ok(payload) => {
            acknowledge(
                coordinator,
                Some(&payload.transaction_id),
                Some(&payload.status),
            )
            .await
        }
        Err(e) => {
            warn!("Unreadable payment webhook body: {e}");
            acknowledge(coordinator, None, None).await
        }
    }
}

#[derive(Debug, FromForm)]
pub struct OrderListQuery {
    pub payment_status: Option<String>,
    pub fulfillment_status: Option<String>,
    pub phone_number: Option<String>,
    pub needs_review: Option<bool>,
    pub limit: Option<u32>,
}

impl TryFrom<OrderListQuery> for OrderFilter {
    type Error = ParseStatusError;

    fn try_from(query: OrderListQuery) -> Result<Self, Self::Error> {
        Ok(Self {
            payment_status: query
                .payment_status
                .as_deref()
                .map(str::parse::<PaymentStatus>)
                .transpose()?,
            fulfillment_status: query
                .fulfillment_status
                .as_deref()
                .map(str::parse::<FulfillmentStatus>)
                .transpose()?,
            phone_number: query.phone_number,
            needs_review: query.needs_review,
            limit: query.limit,
        })
    }
}

#[get("/operator/orders?<query..>")]
pub async fn operator_list_orders(
    query: OrderListQuery,
    pool: &State<SqlitePool>,
) -> Result<Json<Vec<Order>>, ApiError> {
    let filter = OrderFilter::try_from(query)?
        .normalized()
        .map_err(|e| ApiError::new(Status::BadRequest, e.to_string()))?;
    let mut conn = pool.acquire().await?;
    Ok(Json(list_orders(&mut conn, &filter).await?))
}

#[get("/operator/orders/<id>")]
pub async fn operator_get_order(
    id: &str,
    pool: &State<SqlitePool>,
) -> Result<Json<Order>, ApiError> {
    let order_id = parse_order_id(id)?;
    let mut conn = pool.acquire().await?;
    find_order_by_id(&mut conn, order_id)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::new(Status::NotFound, format!("Order {order_id} not found")))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StatusChange {
    pub status: FulfillmentStatus,
    pub actor: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub expected_version: Option<i64>,
}

#[post("/operator/orders/<id>/status", format = "json", data = "<change>")]
pub async fn operator_set_status(
    id: &str,
    change: Json<StatusChange>,
    pool: &State<SqlitePool>,
) -> Result<Json<Order>, ApiError> {
    let order_id = parse_order_id(id)?;
    let StatusChange {
        status,
        actor,
        description,
        expected_version,
    } = change.into_inner();

    let order = transition(
        pool,
        TransitionRequest {
            order_id,
            target: status,
            actor,
            description,
            expected_version,
        },
    )
    .await?;

    Ok(Json(order))
}

#[get("/operator/orders/<id>/audit")]
pub async fn operator_audit(
    id: &str,
    pool: &State<SqlitePool>,
) -> Result<Json<Vec<AuditRecord>>, ApiError> {
    let order_id = parse_order_id(id)?;
    let mut conn = pool.acquire().await?;
    Ok(Json(audit_trail(&mut conn, order_id).await?))
}

#[get("/operator/payments/<transaction_id>/callbacks")]
pub async fn operator_callbacks(
    transaction_id: &str,
    pool: &State<SqlitePool>,
) -> Result<Json<Vec<CallbackRecord>>, ApiError> {
    let mut conn = pool.acquire().await?;
    let callbacks = list_callbacks(&mut conn, transaction_id).await?;
    info!(transaction_id, count = callbacks.len(), "Listed payment callbacks");
    Ok(Json(callbacks))
}

pub fn routes() -> Vec<Route> {
    routes![
        health,
        menu,
        menu_sides,
        planning_step,
        planning_back,
        checkout_session,
        place_order,
        start_payment,
        order_status,
        track,
        payment_callback,
        payment_webhook,
        operator_list_orders,
        operator_get_order,
        operator_set_status,
        operator_audit,
        operator_callbacks
    ]
}
