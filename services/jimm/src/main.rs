use anyhow::{Context, Result};
use tokio::signal;
use tokio::sync::watch;

use jimm::app::{Dependencies, Jimm};
use jimm::config::Config;
use jimm::observability;

#[tokio::main]
async fn main() -> Result<()> {
    observability::init_observability();

    let config = Config::from_env_or_yaml().with_context(|| "load configuration")?;
    tracing::info!(
        db_address = %config.db_address,
        controller_uuid = %config.controller_uuid,
        "starting jimm"
    );

    let jimm = Jimm::new(config, Dependencies::standalone());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            tracing::info!("shutdown requested");
            let _ = shutdown_tx.send(true);
        }
    });

    jimm.run(shutdown_rx)
        .await
        .with_context(|| "service stopped with error")?;
    Ok(())
}
