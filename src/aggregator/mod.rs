pub mod binance_futures;
pub mod binance_portfolio;
pub mod bybit;
pub mod rest;
pub mod signer;
pub mod traits;
pub mod types;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tracing::{info, warn};

use crate::cache::SnapshotCache;
use crate::config::AggregatorConfig;
use crate::error::AggregatorError;
use crate::health::HealthMonitor;
use crate::scheduler::{FetchScheduler, RegisteredClient};
use binance_futures::BinanceFuturesClient;
use binance_portfolio::BinancePortfolioClient;
use bybit::BybitUnifiedClient;
use traits::ExchangeClient;
use types::{CombinedSnapshot, ExchangeData, HealthReport};

/// Closed set of exchange/account-mode clients. Per-variant signing and
/// parsing stays private to each variant's module.
pub enum AccountClient {
    BinanceFutures(BinanceFuturesClient),
    BinancePortfolio(BinancePortfolioClient),
    BybitUnified(BybitUnifiedClient),
}

#[async_trait]
impl ExchangeClient for AccountClient {
    async fn initialize(&mut self) -> Result<(), AggregatorError> {
        match self {
            AccountClient::BinanceFutures(c) => c.initialize().await,
            AccountClient::BinancePortfolio(c) => c.initialize().await,
            AccountClient::BybitUnified(c) => c.initialize().await,
        }
    }

    async fn fetch_snapshot(&self) -> Result<ExchangeData, AggregatorError> {
        match self {
            AccountClient::BinanceFutures(c) => c.fetch_snapshot().await,
            AccountClient::BinancePortfolio(c) => c.fetch_snapshot().await,
            AccountClient::BybitUnified(c) => c.fetch_snapshot().await,
        }
    }
}

/// Owning aggregate over cache, scheduler and health view. This is the whole
/// surface the HTTP layer consumes; nothing here is process-global.
pub struct RiskAggregator {
    cache: Arc<SnapshotCache>,
    scheduler: FetchScheduler,
    health: HealthMonitor,
}

impl RiskAggregator {
    /// Build clients for every configured exchange and register each one
    /// independently: an initialization failure marks that client
    /// unavailable and is logged, it never aborts the remaining
    /// registrations.
    pub async fn new(config: AggregatorConfig) -> Result<Self> {
        let timeout = Duration::from_millis(config.timeout_ms);
        let mut candidates: Vec<(String, String, AccountClient)> = Vec::new();

        if let Some(binance) = config.binance_futures.clone() {
            candidates.push((
                binance_futures::EXCHANGE.to_string(),
                binance.account_id.clone(),
                AccountClient::BinanceFutures(BinanceFuturesClient::new(binance, timeout)),
            ));
        }
        if let Some(portfolio) = config.binance_portfolio.clone() {
            candidates.push((
                binance_portfolio::EXCHANGE.to_string(),
                portfolio.account_id.clone(),
                AccountClient::BinancePortfolio(BinancePortfolioClient::new(portfolio, timeout)),
            ));
        }
        if let Some(unified) = config.bybit_unified.clone() {
            candidates.push((
                bybit::EXCHANGE.to_string(),
                unified.account_id.clone(),
                AccountClient::BybitUnified(BybitUnifiedClient::new(unified, timeout)),
            ));
        }

        let mut registered: Vec<RegisteredClient> = Vec::new();
        for (exchange, account, mut client) in candidates {
            match client.initialize().await {
                Ok(()) => {
                    info!(%exchange, %account, "exchange client registered");
                    registered.push(RegisteredClient {
                        exchange,
                        account,
                        client,
                    });
                }
                Err(err) => {
                    warn!(%exchange, %account, error = %err, "client initialization failed, marked unavailable");
                }
            }
        }
        if registered.is_empty() {
            warn!("no exchange clients registered; snapshots will stay empty");
        }

        let mut available_exchanges: Vec<String> = Vec::new();
        let mut available_accounts: Vec<String> = Vec::new();
        for client in &registered {
            if !available_exchanges.contains(&client.exchange) {
                available_exchanges.push(client.exchange.clone());
            }
            if !available_accounts.contains(&client.account) {
                available_accounts.push(client.account.clone());
            }
        }

        let cache = Arc::new(SnapshotCache::new(available_exchanges, available_accounts));
        let scheduler = FetchScheduler::new(
            registered,
            cache.clone(),
            Duration::from_secs(config.poll_interval_secs),
        );
        let health = HealthMonitor::new(scheduler.states());

        Ok(Self {
            cache,
            scheduler,
            health,
        })
    }

    pub fn start(&mut self) {
        self.scheduler.start();
    }

    pub async fn stop(&mut self) {
        self.scheduler.stop().await;
    }

    pub async fn snapshot(&self) -> CombinedSnapshot {
        self.cache.snapshot().await
    }

    pub async fn set_current(&self, exchange: &str, account: &str) -> Result<(), AggregatorError> {
        self.cache.set_current(exchange, account).await
    }

    pub async fn health(&self) -> HealthReport {
        self.health.report().await
    }
}
