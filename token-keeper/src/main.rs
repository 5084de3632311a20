use anyhow::{Context, Result};
use schwab_broker::config::{load_config, BrokerConfig};
use schwab_broker::AuthContext;
use std::sync::Arc;
use token_keeper::{interval_from_env, TokenKeeper};
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "token_keeper=info,schwab_broker=info".into()),
        )
        .init();

    info!("Token keeper starting...");

    let config = match std::env::var("SCHWAB_CONFIG") {
        Ok(path) => load_config(&path).context("Failed to load configuration")?,
        Err(_) => BrokerConfig::default(),
    }
    .with_env_overrides()
    .context("Invalid environment override")?;

    let ctx = AuthContext::initialize(config)
        .await
        .context("Failed to initialize auth context")?;

    let period = interval_from_env();
    info!(
        backend = %ctx.backend(),
        interval_secs = period.as_secs(),
        "Configuration loaded"
    );

    let keeper = TokenKeeper::new(Arc::new(ctx.token_manager()), period);
    let status = keeper.status();
    let handle = keeper.start();

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl_c signal")?;
    info!("Shutdown signal received");

    handle.abort();
    let status = status.lock().await;
    info!(
        checks = status.check_count,
        errors = status.error_count,
        "Token keeper stopped"
    );

    Ok(())
}
