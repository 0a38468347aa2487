use anyhow::Result;
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

use risk_aggregator::{AggregatorConfig, RiskAggregator};

fn init_logging() {
    fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .compact()
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();

    let config = AggregatorConfig::from_env();
    let mut aggregator = RiskAggregator::new(config).await?;
    aggregator.start();

    tokio::signal::ctrl_c().await?;
    info!("shutdown requested");
    aggregator.stop().await;

    Ok(())
}
