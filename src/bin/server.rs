use clap::Parser;
use meal_orders::env::{Env, setup_tracing};
use meal_orders::launch;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv_override().ok();
    let env = Env::try_parse()?;
    setup_tracing(&env);

    launch(env).await
}
