use clap::{Parser, Subcommand};
use std::io::Write;
use thiserror::Error;
use tracing::info;

use meal_gateway::GatewayEnv;

use crate::env::{Env, LogLevel, Services};
use crate::fulfillment::audit::audit_trail;
use crate::fulfillment::{TransitionRequest, transition};
use crate::order::repository::{
    OrderChanges, OrderFilter, find_orders_by_id_prefix, get_order, list_orders, update_order,
};
use crate::order::{FulfillmentStatus, Order, OrderId, PaymentStatus, PricingConfig};
use crate::payment::callbacks::list_callbacks;

#[derive(Debug, Error)]
pub enum CliError {
    #[error("Invalid order id: {value}. Expected a full UUID")]
    InvalidOrderId { value: String },
    #[error("Order {order_id} is {status}; vendors are only assigned to paid orders")]
    NotPaid {
        order_id: OrderId,
        status: PaymentStatus,
    },
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// List orders, newest first
    List {
        #[arg(long = "payment-status")]
        payment_status: Option<PaymentStatus>,
        #[arg(long = "fulfillment-status")]
        fulfillment_status: Option<FulfillmentStatus>,
        #[arg(long = "phone")]
        phone_number: Option<String>,
        /// Only orders whose payment outcome needs a human decision
        #[arg(long = "needs-review")]
        needs_review: bool,
        #[arg(short = 'n', long = "limit", default_value = "20")]
        limit: u32,
    },
    /// Find orders by the first characters of their id
    Track {
        /// At least 4 characters, case-insensitive
        prefix: String,
    },
    /// Move an order through the delivery pipeline
    SetStatus {
        #[arg(long = "order-id")]
        order_id: String,
        #[arg(long = "status")]
        status: FulfillmentStatus,
        #[arg(long = "actor")]
        actor: String,
        #[arg(long = "description")]
        description: Option<String>,
        /// Refuse the change if the order moved past this version
        #[arg(long = "expected-version")]
        expected_version: Option<i64>,
    },
    /// Show the delivery status history of an order
    Audit {
        #[arg(long = "order-id")]
        order_id: String,
    },
    /// Apply a payment outcome by hand, e.g. after checking the gateway
    /// dashboard for a callback that never arrived
    Reconcile {
        #[arg(long = "transaction-id")]
        transaction_id: String,
        /// Link the transaction to this order first, for attempts whose
        /// reference was never stored because the gateway timed out
        #[arg(long = "order-id")]
        order_id: Option<String>,
        /// approved, declined, canceled, ...
        #[arg(long = "status")]
        status: String,
    },
    /// Re-run vendor assignment for a paid order and store the result
    AssignVendors {
        #[arg(long = "order-id")]
        order_id: String,
    },
}

#[derive(Debug, Parser)]
#[command(name = "meal-orders-cli")]
#[command(about = "Operator tools for meal orders")]
#[command(version)]
pub struct CliEnv {
    #[clap(long = "db", env, default_value = "sqlite://meal-orders.db")]
    pub database_url: String,
    #[clap(long, env, default_value = "info")]
    pub log_level: LogLevel,
    #[clap(flatten)]
    pub pricing: PricingConfig,
    #[clap(flatten)]
    pub gateway: GatewayEnv,
    #[clap(long, env, default_value = "false")]
    pub dry_run: bool,
    #[command(subcommand)]
    pub command: Commands,
}

impl CliEnv {
    /// Parse CLI arguments and convert to internal Env struct
    pub fn parse_and_convert() -> (Env, Commands) {
        let cli_env = Self::parse();

        let env = Env {
            database_url: cli_env.database_url,
            log_level: cli_env.log_level,
            server_port: 8080,
            pricing: cli_env.pricing,
            gateway: cli_env.gateway,
            dry_run: cli_env.dry_run,
            otel_exporter_endpoint: None,
            otel_exporter_token: None,
            otel_service_name: "meal-orders-cli".to_string(),
        };

        (env, cli_env.command)
    }
}

fn parse_order_id(raw: &str) -> Result<OrderId, CliError> {
    raw.trim().parse().map_err(|_| CliError::InvalidOrderId {
        value: raw.to_string(),
    })
}

pub async fn run_command(env: Env, command: Commands) -> anyhow::Result<()> {
    let pool = env.get_sqlite_pool().await?;
    sqlx::migrate!().run(&pool).await?;
    let services = env.build_services(pool)?;

    run_command_with_writers(&services, command, &mut std::io::stdout()).await
}

async fn run_command_with_writers<W: Write>(
    services: &Services,
    command: Commands,
    stdout: &mut W,
) -> anyhow::Result<()> {
    match command {
        Commands::List {
            payment_status,
            fulfillment_status,
            phone_number,
            needs_review,
            limit,
        } => {
            let filter = OrderFilter {
                payment_status,
                fulfillment_status,
                phone_number,
                needs_review: needs_review.then_some(true),
                limit: Some(limit),
            }
            .normalized()?;
            let mut conn = services.pool.acquire().await?;
            let orders = list_orders(&mut conn, &filter).await?;
            write_order_table(&orders, stdout)?;
        }
        Commands::Track { prefix } => {
            let mut conn = services.pool.acquire().await?;
            let orders = find_orders_by_id_prefix(&mut conn, &prefix).await?;
            if orders.is_empty() {
                writeln!(stdout, "No order id starts with {prefix}")?;
            } else {
                write_order_table(&orders, stdout)?;
            }
        }
        Commands::SetStatus {
            order_id,
            status,
            actor,
            description,
            expected_version,
        } => {
            let order_id = parse_order_id(&order_id)?;
            let before = {
                let mut conn = services.pool.acquire().await?;
                get_order(&mut conn, order_id).await?
            };
            let order = transition(
                &services.pool,
                TransitionRequest {
                    order_id,
                    target: status,
                    actor,
                    description,
                    expected_version,
                },
            )
            .await?;
            writeln!(
                stdout,
                "✅ Order {order_id}: {} -> {} (version {})",
                before.fulfillment_status, order.fulfillment_status, order.version
            )?;
        }
        Commands::Audit { order_id } => {
            let order_id = parse_order_id(&order_id)?;
            let mut conn = services.pool.acquire().await?;
            let trail = audit_trail(&mut conn, order_id).await?;
            if trail.is_empty() {
                writeln!(stdout, "No status changes recorded for {order_id}")?;
            }
            for record in trail {
                writeln!(
                    stdout,
                    "{}  {:<16} -> {:<16} by {}{}",
                    record.created_at.format("%Y-%m-%d %H:%M:%S"),
                    record.from_status,
                    record.to_status,
                    record.actor,
                    record
                        .description
                        .map(|text| format!(" ({text})"))
                        .unwrap_or_default()
                )?;
            }
        }
        Commands::Reconcile {
            transaction_id,
            order_id,
            status,
        } => {
            if let Some(order_id) = order_id {
                let order_id = parse_order_id(&order_id)?;
                services
                    .coordinator
                    .attach_transaction(order_id, &transaction_id)
                    .await?;
                writeln!(stdout, "Transaction {transaction_id} attached to order {order_id}")?;
            }

            let outcome = services
                .coordinator
                .reconcile_callback(&transaction_id, &status)
                .await?;
            writeln!(
                stdout,
                "Transaction {transaction_id}: {}",
                outcome.as_str()
            )?;

            let mut conn = services.pool.acquire().await?;
            let callbacks = list_callbacks(&mut conn, transaction_id.trim()).await?;
            writeln!(stdout, "   Callbacks recorded: {}", callbacks.len())?;
        }
        Commands::AssignVendors { order_id } => {
            let order_id = parse_order_id(&order_id)?;
            assign_vendors(services, order_id, stdout).await?;
        }
    }

    Ok(())
}

async fn assign_vendors<W: Write>(
    services: &Services,
    order_id: OrderId,
    stdout: &mut W,
) -> anyhow::Result<()> {
    let order = {
        let mut conn = services.pool.acquire().await?;
        get_order(&mut conn, order_id).await?
    };
    if order.payment_status != PaymentStatus::Paid {
        return Err(CliError::NotPaid {
            order_id,
            status: order.payment_status,
        }
        .into());
    }

    let vendors = services.coordinator.resolver().assign_all(&order).await;
    let unresolved: Vec<&str> = order
        .selected_days
        .iter()
        .filter(|day| !vendors.contains_key(*day))
        .map(String::as_str)
        .collect();

    let mut conn = services.pool.acquire().await?;
    let updated = update_order(
        &mut conn,
        order_id,
        order.version,
        OrderChanges {
            vendors_by_day: Some(vendors),
            ..OrderChanges::default()
        },
    )
    .await?;

    info!(%order_id, assigned = updated.vendors_by_day.len(), "Vendors reassigned");
    for (day, vendor) in &updated.vendors_by_day {
        writeln!(stdout, "   {day}: vendor {vendor}")?;
    }
    if !unresolved.is_empty() {
        writeln!(stdout, "❌ No active vendor for: {}", unresolved.join(", "))?;
    }
    Ok(())
}

fn write_order_table<W: Write>(orders: &[Order], stdout: &mut W) -> std::io::Result<()> {
    writeln!(
        stdout,
        "{:<36}  {:<8}  {:<16}  {:>8}  {:<6}  days",
        "id", "payment", "fulfillment", "total", "review"
    )?;
    for order in orders {
        writeln!(
            stdout,
            "{:<36}  {:<8}  {:<16}  {:>8}  {:<6}  {}",
            order.id,
            order.payment_status,
            order.fulfillment_status,
            order.total_amount,
            if order.needs_review { "yes" } else { "" },
            order.selected_days.join(",")
        )?;
    }
    Ok(())
}
