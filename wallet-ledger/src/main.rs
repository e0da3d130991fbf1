use anyhow::{anyhow, Context};
use dotenv::dotenv;
use tracing::info;
use wallet_ledger::{config::Config, store::PgLedgerStore, telemetry};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();

    let config = Config::from_env().context("Failed to load configuration")?;
    config
        .validate()
        .map_err(|e| anyhow!("Invalid configuration: {}", e))?;

    telemetry::init_tracing(&config.logging)?;

    info!("Applying wallet ledger migrations");

    let store = PgLedgerStore::connect(&config.database)
        .await
        .context("Failed to connect to database")?;
    store.migrate().await.context("Migration failed")?;

    info!("Wallet ledger schema ready");
    Ok(())
}
