//! Binance portfolio-margin client (papi). One shared margin pool backing
//! both USDT-margined (UM) and coin-margined (CM) positions; the two pools
//! are fetched separately and merged into one snapshot.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::warn;

use crate::aggregator::rest::{decode_json, parse_f64};
use crate::aggregator::signer;
use crate::aggregator::traits::ExchangeClient;
use crate::aggregator::types::{ExchangeData, Position};
use crate::config::BinancePortfolioConfig;
use crate::error::AggregatorError;
use crate::risk::metrics::{build_summary, SummaryInputs};
use crate::risk::normalize::{normalize_position, RawPosition};

pub const EXCHANGE: &str = "binance-portfolio";
const BASE_CURRENCY: &str = "USDT";
const RECV_WINDOW_MS: u64 = 5_000;

/// Coin-margined symbols carry an underscore suffix: `BTCUSD_PERP`,
/// `BTCUSD_250926`. USDT-margined symbols do not.
pub fn is_coin_margined(symbol: &str) -> bool {
    symbol.contains("USD_")
}

/// Fixed-settlement (dated) coin-margined contracts have no funding leg.
pub fn has_funding_leg(symbol: &str) -> bool {
    !is_coin_margined(symbol) || symbol.ends_with("_PERP")
}

/// Funding rate for a merged-pool symbol; structurally 0 for instruments
/// without a funding leg.
/// TODO: source _PERP funding from the dapi premium index; the USD-M index
/// does not cover coin-margined symbols.
fn funding_rate_for(symbol: &str, um_rates: &HashMap<String, f64>) -> f64 {
    if !has_funding_leg(symbol) {
        return 0.0;
    }
    um_rates.get(symbol).copied().unwrap_or(0.0)
}

pub struct BinancePortfolioClient {
    http: reqwest::Client,
    config: BinancePortfolioConfig,
    time_offset_ms: i64,
}

impl BinancePortfolioClient {
    pub fn new(config: BinancePortfolioConfig, timeout: Duration) -> Self {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .timeout(timeout)
            .build()
            .expect("failed to create reqwest client");
        Self {
            http,
            config,
            time_offset_ms: 0,
        }
    }

    async fn signed_get<T: DeserializeOwned>(
        &self,
        path: &str,
        mut params: Vec<(&str, String)>,
    ) -> Result<T, AggregatorError> {
        let timestamp = Utc::now().timestamp_millis() + self.time_offset_ms;
        params.push(("recvWindow", RECV_WINDOW_MS.to_string()));
        params.push(("timestamp", timestamp.to_string()));
        let query = signer::encode_query(&params);
        let signed = signer::binance_signed_query(&self.config.credentials.api_secret, &query);
        let url = format!("{}{path}?{signed}", self.config.base_url.trim_end_matches('/'));
        let response = self
            .http
            .get(url)
            .header("X-MBX-APIKEY", &self.config.credentials.api_key)
            .send()
            .await?;
        decode_json(path, response).await
    }

    /// Market data lives on the USD-M host; papi itself has none.
    async fn market_get<T: DeserializeOwned>(
        &self,
        path: &str,
        params: &[(&str, String)],
    ) -> Result<T, AggregatorError> {
        let mut url = format!("{}{path}", self.config.market_data_url.trim_end_matches('/'));
        if !params.is_empty() {
            url = format!("{url}?{}", signer::encode_query(params));
        }
        let response = self.http.get(&url).send().await?;
        decode_json(path, response).await
    }

    async fn account(&self) -> Result<PortfolioAccount, AggregatorError> {
        self.signed_get("/papi/v1/account", Vec::new()).await
    }

    async fn balances(&self) -> Result<Vec<PortfolioBalance>, AggregatorError> {
        self.signed_get("/papi/v1/balance", Vec::new()).await
    }

    async fn um_position_risk(&self) -> Result<Vec<UmPositionRow>, AggregatorError> {
        self.signed_get("/papi/v1/um/positionRisk", Vec::new()).await
    }

    async fn cm_position_risk(&self) -> Result<Vec<CmPositionRow>, AggregatorError> {
        self.signed_get("/papi/v1/cm/positionRisk", Vec::new()).await
    }

    async fn um_open_orders(&self) -> Result<Vec<serde_json::Value>, AggregatorError> {
        self.signed_get("/papi/v1/um/openOrders", Vec::new()).await
    }

    async fn cm_open_orders(&self) -> Result<Vec<serde_json::Value>, AggregatorError> {
        self.signed_get("/papi/v1/cm/openOrders", Vec::new()).await
    }

    async fn um_funding_rates(&self) -> Result<HashMap<String, f64>, AggregatorError> {
        let rows: Vec<PremiumIndexRow> = self.market_get("/fapi/v1/premiumIndex", &[]).await?;
        Ok(rows
            .into_iter()
            .filter_map(|row| {
                let rate = row.last_funding_rate?;
                parse_f64("premiumIndex.lastFundingRate", &rate)
                    .ok()
                    .map(|rate| (row.symbol, rate))
            })
            .collect())
    }

    async fn ticker_price(&self, symbol: &str) -> Option<f64> {
        let row: TickerPriceRow = self
            .market_get("/fapi/v1/ticker/price", &[("symbol", symbol.to_string())])
            .await
            .ok()?;
        parse_f64("ticker.price", &row.price).ok()
    }

    /// Direct pair, else via BTC, else 0 with a warning.
    async fn asset_value_in_base(&self, asset: &str, amount: f64) -> f64 {
        if asset == BASE_CURRENCY {
            return amount;
        }
        if let Some(price) = self.ticker_price(&format!("{asset}{BASE_CURRENCY}")).await {
            return amount * price;
        }
        if let (Some(via), Some(anchor)) = (
            self.ticker_price(&format!("{asset}BTC")).await,
            self.ticker_price(&format!("BTC{BASE_CURRENCY}")).await,
        ) {
            return amount * via * anchor;
        }
        warn!(asset, "no price route to base currency, valuing at 0");
        0.0
    }

    async fn sum_balances(&self, balances: &[PortfolioBalance]) -> Result<f64, AggregatorError> {
        let mut total = 0.0;
        for entry in balances {
            let amount = parse_f64("balance.totalWalletBalance", &entry.total_wallet_balance)?;
            if amount <= 0.0 {
                continue;
            }
            total += self.asset_value_in_base(&entry.asset, amount).await;
        }
        Ok(total)
    }
}

#[async_trait]
impl ExchangeClient for BinancePortfolioClient {
    async fn initialize(&mut self) -> Result<(), AggregatorError> {
        let server_time: ServerTime = self.market_get("/fapi/v1/time", &[]).await?;
        self.time_offset_ms = server_time.server_time - Utc::now().timestamp_millis();
        self.account().await?;
        Ok(())
    }

    async fn fetch_snapshot(&self) -> Result<ExchangeData, AggregatorError> {
        let (account, balances, um_rows, cm_rows, um_orders, cm_orders, funding) = tokio::try_join!(
            self.account(),
            self.balances(),
            self.um_position_risk(),
            self.cm_position_risk(),
            self.um_open_orders(),
            self.cm_open_orders(),
            self.um_funding_rates(),
        )?;

        let mut raws: Vec<RawPosition> = Vec::new();
        for row in &um_rows {
            let rate = funding_rate_for(&row.symbol, &funding);
            raws.push(RawPosition {
                symbol: row.symbol.clone(),
                signed_size: parse_f64("um.positionAmt", &row.position_amt)?,
                entry_price: parse_f64("um.entryPrice", &row.entry_price)?,
                mark_price: parse_f64("um.markPrice", &row.mark_price)?,
                liquidation_price: parse_f64("um.liquidationPrice", &row.liquidation_price)?,
                leverage: parse_f64("um.leverage", &row.leverage)?,
                notional: Some(parse_f64("um.notional", &row.notional)?),
                unrealized_pnl: parse_f64("um.unRealizedProfit", &row.unrealized_profit)?,
                realized_pnl: 0.0,
                current_funding_rate: rate,
                next_funding_rate: rate,
                // Portfolio margin is cross by construction.
                margin_flag: None,
                combined_margin: true,
            });
        }
        for row in &cm_rows {
            let mark_price = parse_f64("cm.markPrice", &row.mark_price)?;
            // CM notionalValue is denominated in the settlement coin; the
            // dollar exposure is that coin amount at mark.
            let coin_notional = parse_f64("cm.notionalValue", &row.notional_value)?;
            let rate = funding_rate_for(&row.symbol, &funding);
            raws.push(RawPosition {
                symbol: row.symbol.clone(),
                signed_size: parse_f64("cm.positionAmt", &row.position_amt)?,
                entry_price: parse_f64("cm.entryPrice", &row.entry_price)?,
                mark_price,
                liquidation_price: parse_f64("cm.liquidationPrice", &row.liquidation_price)?,
                leverage: parse_f64("cm.leverage", &row.leverage)?,
                notional: Some(coin_notional.abs() * mark_price),
                unrealized_pnl: parse_f64("cm.unRealizedProfit", &row.unrealized_profit)?,
                realized_pnl: 0.0,
                current_funding_rate: rate,
                next_funding_rate: rate,
                margin_flag: None,
                combined_margin: true,
            });
        }
        let positions: Vec<Position> = raws
            .iter()
            .filter_map(|raw| normalize_position(EXCHANGE, raw))
            .collect();

        let equity = parse_f64("account.accountEquity", &account.account_equity)?;
        let maintenance_margin =
            parse_f64("account.accountMaintMargin", &account.account_maint_margin)?;
        let base_balance = if equity > 0.0 {
            equity
        } else {
            self.sum_balances(&balances).await?
        };

        let account_summary = build_summary(SummaryInputs {
            exchange: EXCHANGE,
            account_id: &self.config.account_id,
            base_currency: BASE_CURRENCY,
            base_balance,
            equity,
            maintenance_margin,
            open_orders_count: um_orders.len() + cm_orders.len(),
            positions: &positions,
        });

        Ok(ExchangeData {
            positions,
            account_summary,
        })
    }
}

#[derive(Debug, Deserialize)]
struct ServerTime {
    #[serde(rename = "serverTime")]
    server_time: i64,
}

#[derive(Debug, Deserialize)]
struct PortfolioAccount {
    #[serde(rename = "accountEquity")]
    account_equity: String,
    #[serde(rename = "accountMaintMargin")]
    account_maint_margin: String,
}

#[derive(Debug, Deserialize)]
struct PortfolioBalance {
    asset: String,
    #[serde(rename = "totalWalletBalance")]
    total_wallet_balance: String,
}

#[derive(Debug, Deserialize)]
struct UmPositionRow {
    symbol: String,
    #[serde(rename = "positionAmt")]
    position_amt: String,
    #[serde(rename = "entryPrice")]
    entry_price: String,
    #[serde(rename = "markPrice")]
    mark_price: String,
    #[serde(rename = "liquidationPrice")]
    liquidation_price: String,
    leverage: String,
    #[serde(rename = "unRealizedProfit")]
    unrealized_profit: String,
    notional: String,
}

#[derive(Debug, Deserialize)]
struct CmPositionRow {
    symbol: String,
    #[serde(rename = "positionAmt")]
    position_amt: String,
    #[serde(rename = "entryPrice")]
    entry_price: String,
    #[serde(rename = "markPrice")]
    mark_price: String,
    #[serde(rename = "liquidationPrice")]
    liquidation_price: String,
    leverage: String,
    #[serde(rename = "unRealizedProfit")]
    unrealized_profit: String,
    #[serde(rename = "notionalValue")]
    notional_value: String,
}

#[derive(Debug, Deserialize)]
struct PremiumIndexRow {
    symbol: String,
    #[serde(rename = "lastFundingRate")]
    last_funding_rate: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TickerPriceRow {
    price: String,
}
