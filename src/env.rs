use clap::Parser;
use opentelemetry::trace::TracerProvider;
use opentelemetry::{KeyValue, global};
use opentelemetry_otlp::{SpanExporter, WithExportConfig, WithHttpConfig};
use opentelemetry_sdk::{Resource, trace as sdktrace};
use sqlx::SqlitePool;
use sqlx::sqlite::SqliteConnectOptions;
use std::str::FromStr;
use std::sync::Arc;
use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use url::Url;

use meal_gateway::{DynGateway, GatewayEnv, GatewayError, HttpGateway, TestGateway};

use crate::catalog::{DynCatalog, SqliteCatalog};
use crate::checkout::Checkout;
use crate::order::PricingConfig;
use crate::payment::{CoordinatorSettings, PaymentCoordinator};
use crate::resolver::VendorResolver;

#[derive(clap::ValueEnum, Debug, Clone)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl From<LogLevel> for Level {
    fn from(log_level: LogLevel) -> Self {
        (&log_level).into()
    }
}

impl From<&LogLevel> for Level {
    fn from(log_level: &LogLevel) -> Self {
        match log_level {
            LogLevel::Trace => Self::TRACE,
            LogLevel::Debug => Self::DEBUG,
            LogLevel::Info => Self::INFO,
            LogLevel::Warn => Self::WARN,
            LogLevel::Error => Self::ERROR,
        }
    }
}

#[derive(Parser, Debug, Clone)]
pub struct Env {
    #[clap(long = "db", env)]
    pub database_url: String,
    #[clap(long, env, default_value = "debug")]
    pub log_level: LogLevel,
    #[clap(long, env, default_value = "8080")]
    pub server_port: u16,
    #[clap(flatten)]
    pub pricing: PricingConfig,
    #[clap(flatten)]
    pub gateway: GatewayEnv,
    /// Open transactions against an in-process test gateway instead of the
    /// real provider
    #[clap(long, env, default_value = "false")]
    pub dry_run: bool,
    /// OTLP/HTTP traces endpoint (optional)
    #[clap(long, env)]
    pub otel_exporter_endpoint: Option<Url>,
    /// Bearer token sent to the OTLP endpoint
    #[clap(long, env)]
    pub otel_exporter_token: Option<String>,
    #[clap(long, env, default_value = "meal-orders")]
    pub otel_service_name: String,
}

/// Long-lived services shared by the HTTP surface and the operator CLI.
#[derive(Clone)]
pub struct Services {
    pub pool: SqlitePool,
    pub catalog: DynCatalog,
    pub coordinator: Arc<PaymentCoordinator>,
    pub checkout: Arc<Checkout>,
}

impl Env {
    /// Opens the database, creating the file on first use.
    pub async fn get_sqlite_pool(&self) -> Result<SqlitePool, sqlx::Error> {
        let options = SqliteConnectOptions::from_str(&self.database_url)?.create_if_missing(true);
        SqlitePool::connect_with(options).await
    }

    pub fn get_gateway(&self) -> Result<DynGateway, GatewayError> {
        if self.dry_run {
            Ok(Arc::new(TestGateway::new()))
        } else {
            Ok(Arc::new(HttpGateway::new(self.gateway.clone())?))
        }
    }

    pub fn coordinator_settings(&self) -> CoordinatorSettings {
        CoordinatorSettings {
            pricing: self.pricing,
            callback_url: self.gateway.gateway_callback_url.clone(),
            gateway_timeout: self.gateway.timeout(),
        }
    }

    pub fn build_services(&self, pool: SqlitePool) -> Result<Services, GatewayError> {
        let catalog: DynCatalog = Arc::new(SqliteCatalog::new(pool.clone()));
        let coordinator = Arc::new(PaymentCoordinator::new(
            pool.clone(),
            self.get_gateway()?,
            VendorResolver::new(catalog.clone()),
            self.coordinator_settings(),
        ));
        let checkout = Arc::new(Checkout::new(
            pool.clone(),
            catalog.clone(),
            self.pricing,
            coordinator.clone(),
        ));

        Ok(Services {
            pool,
            catalog,
            coordinator,
            checkout,
        })
    }
}

fn env_filter(default_filter: &str) -> tracing_subscriber::EnvFilter {
    tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| default_filter.into())
}

pub fn setup_tracing(env: &Env) {
    let level: Level = (&env.log_level).into();
    let default_filter = format!("meal_orders={level},meal_gateway={level},server={level},cli={level}");

    if let Some(endpoint) = &env.otel_exporter_endpoint {
        setup_tracing_with_otlp(&default_filter, endpoint, env);
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter(&default_filter))
            .compact()
            .init();

        tracing::debug!("No OTLP endpoint configured; logging to console only");
    }
}

fn setup_tracing_with_otlp(default_filter: &str, endpoint: &Url, env: &Env) {
    let resource = Resource::builder()
        .with_attributes(vec![KeyValue::new(
            "service.name",
            env.otel_service_name.clone(),
        )])
        .build();

    let mut headers = std::collections::HashMap::new();
    if let Some(token) = &env.otel_exporter_token {
        headers.insert("authorization".to_string(), format!("Bearer {token}"));
    }

    let otlp_exporter = match SpanExporter::builder()
        .with_http()
        .with_endpoint(endpoint.as_str())
        .with_headers(headers)
        .build()
    {
        Ok(exporter) => exporter,
        Err(e) => {
            eprintln!("Failed to create OTLP exporter: {e}, falling back to console logging");
            tracing_subscriber::fmt()
                .with_env_filter(env_filter(default_filter))
                .compact()
                .init();
            return;
        }
    };

    let tracer_provider = sdktrace::SdkTracerProvider::builder()
        .with_batch_exporter(otlp_exporter)
        .with_resource(resource)
        .build();

    global::set_tracer_provider(tracer_provider.clone());

    let tracer = tracer_provider.tracer(env.otel_service_name.clone());
    let otel_layer = tracing_opentelemetry::layer().with_tracer(tracer);

    tracing_subscriber::registry()
        .with(env_filter(default_filter))
        .with(tracing_subscriber::fmt::layer().compact())
        .with(otel_layer)
        .init();

    tracing::info!(endpoint = %endpoint, "Tracing initialized with console and OTLP layers");
}
