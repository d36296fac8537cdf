use rocket::Config;
use tracing::{error, info};

pub mod api;
pub mod catalog;
pub mod checkout;
pub mod cli;
pub mod env;
pub mod error;
pub mod fulfillment;
pub mod order;
pub mod payment;
pub mod planning;
pub mod resolver;

#[cfg(test)]
pub mod test_utils;

use crate::env::Env;

pub async fn launch(env: Env) -> anyhow::Result<()> {
    let pool = env.get_sqlite_pool().await?;

    // Run database migrations to ensure all tables exist
    sqlx::migrate!().run(&pool).await?;

    let services = env.build_services(pool)?;
    info!(
        gateway = %services.coordinator.gateway_kind(),
        port = env.server_port,
        "Starting meal order server"
    );

    let config = Config::figment()
        .merge(("port", env.server_port))
        .merge(("address", "0.0.0.0"));

    let rocket = rocket::custom(config)
        .mount("/", api::routes())
        .manage(services.pool.clone())
        .manage(services.catalog.clone())
        .manage(services.coordinator.clone())
        .manage(services.checkout.clone());

    let server_task = tokio::spawn(rocket.launch());

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal, shutting down gracefully...");
        }

        result = server_task => {
            match result {
                Ok(Ok(_)) => info!("Server completed successfully"),
                Ok(Err(e)) => error!("Server failed: {e}"),
                Err(e) => error!("Server task panicked: {e}"),
            }
        }
    }

    services.pool.close().await;
    info!("Shutdown complete");
    Ok(())
}
