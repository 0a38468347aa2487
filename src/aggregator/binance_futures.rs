//! Binance USD-M linear futures client (fapi).

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
use crate::config::BinanceFuturesConfig;
use crate::error::AggregatorError;
use crate::risk::metrics::{build_summary, SummaryInputs};
use crate::risk::normalize::{normalize_position, RawPosition};

pub const EXCHANGE: &str = "binance-futures";
const BASE_CURRENCY: &str = "USDT";
const RECV_WINDOW_MS: u64 = 5_000;

pub struct BinanceFuturesClient {
    http: reqwest::Client,
    config: BinanceFuturesConfig,
    /// Server clock minus local clock, recorded at initialize and applied to
    /// every signed timestamp to avoid recvWindow rejections.
    time_offset_ms: i64,
}

impl BinanceFuturesClient {
    pub fn new(config: BinanceFuturesConfig, timeout: Duration) -> Self {
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

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url.trim_end_matches('/'), path)
    }

    async fn public_get<T: DeserializeOwned>(
        &self,
        path: &str,
        params: &[(&str, String)],
    ) -> Result<T, AggregatorError> {
        let mut url = self.url(path);
        if !params.is_empty() {
            url = format!("{url}?{}", signer::encode_query(params));
        }
        let response = self.http.get(&url).send().await?;
        decode_json(path, response).await
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
        let response = self
            .http
            .get(format!("{}?{signed}", self.url(path)))
            .header("X-MBX-APIKEY", &self.config.credentials.api_key)
            .send()
            .await?;
        decode_json(path, response).await
    }

    async fn account(&self) -> Result<AccountResponse, AggregatorError> {
        self.signed_get("/fapi/v2/account", Vec::new()).await
    }

    async fn position_risk(&self) -> Result<Vec<PositionRiskRow>, AggregatorError> {
        self.signed_get("/fapi/v2/positionRisk", Vec::new()).await
    }

    async fn open_orders(&self) -> Result<Vec<serde_json::Value>, AggregatorError> {
        // Only the count is consumed.
        self.signed_get("/fapi/v1/openOrders", Vec::new()).await
    }

    async fn premium_index(&self) -> Result<Vec<PremiumIndexRow>, AggregatorError> {
        self.public_get("/fapi/v1/premiumIndex", &[]).await
    }

    /// Best-effort mark for one symbol from the public ticker; `None` when
    /// the pair does not trade.
    async fn ticker_price(&self, symbol: &str) -> Option<f64> {
        let row: TickerPriceRow = self
            .public_get("/fapi/v1/ticker/price", &[("symbol", symbol.to_string())])
            .await
            .ok()?;
        parse_f64("ticker.price", &row.price).ok()
    }

    /// Convert one asset balance into the base currency: direct pair first,
    /// then via BTC as the intermediate, else 0 with a warning. Two steps
    /// maximum, no deeper recursion.
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

    /// Manual equity summation, used when the exchange-reported total is
    /// missing or non-positive. Non-positive balances are skipped.
    async fn sum_asset_balances(&self, assets: &[AssetBalance]) -> Result<f64, AggregatorError> {
        let mut total = 0.0;
        for entry in assets {
            let amount = parse_f64("account.assets.marginBalance", &entry.margin_balance)?;
            if amount <= 0.0 {
                continue;
            }
            total += self.asset_value_in_base(&entry.asset, amount).await;
        }
        Ok(total)
    }
}

#[async_trait]
impl ExchangeClient for BinanceFuturesClient {
    async fn initialize(&mut self) -> Result<(), AggregatorError> {
        let server_time: ServerTime = self.public_get("/fapi/v1/time", &[]).await?;
        self.time_offset_ms = server_time.server_time - Utc::now().timestamp_millis();
        // Credential check; the response body is discarded.
        self.account().await?;
        Ok(())
    }

    async fn fetch_snapshot(&self) -> Result<ExchangeData, AggregatorError> {
        let (account, rows, open_orders, premium) = tokio::try_join!(
            self.account(),
            self.position_risk(),
            self.open_orders(),
            self.premium_index(),
        )?;

        let funding: HashMap<&str, f64> = premium
            .iter()
            .filter_map(|row| {
                let rate = row.last_funding_rate.as_deref()?;
                parse_f64("premiumIndex.lastFundingRate", rate)
                    .ok()
                    .map(|rate| (row.symbol.as_str(), rate))
            })
            .collect();

        let mut positions: Vec<Position> = Vec::new();
        for row in &rows {
            let signed_size = parse_f64("positionRisk.positionAmt", &row.position_amt)?;
            // fapi does not expose a predicted rate; reuse the current
            // period's rate as the estimate.
            let rate = funding.get(row.symbol.as_str()).copied().unwrap_or(0.0);
            let raw = RawPosition {
                symbol: row.symbol.clone(),
                signed_size,
                entry_price: parse_f64("positionRisk.entryPrice", &row.entry_price)?,
                mark_price: parse_f64("positionRisk.markPrice", &row.mark_price)?,
                liquidation_price: parse_f64("positionRisk.liquidationPrice", &row.liquidation_price)?,
                leverage: parse_f64("positionRisk.leverage", &row.leverage)?,
                notional: Some(parse_f64("positionRisk.notional", &row.notional)?),
                unrealized_pnl: parse_f64("positionRisk.unRealizedProfit", &row.unrealized_profit)?,
                realized_pnl: 0.0,
                current_funding_rate: rate,
                next_funding_rate: rate,
                margin_flag: Some(row.margin_type.clone()),
                combined_margin: false,
            };
            if let Some(position) = normalize_position(EXCHANGE, &raw) {
                positions.push(position);
            }
        }

        let equity = parse_f64("account.totalMarginBalance", &account.total_margin_balance)?;
        let maintenance_margin = parse_f64("account.totalMaintMargin", &account.total_maint_margin)?;
        let base_balance = if equity > 0.0 {
            equity
        } else {
            self.sum_asset_balances(&account.assets).await?
        };

        let account_summary = build_summary(SummaryInputs {
            exchange: EXCHANGE,
            account_id: &self.config.account_id,
            base_currency: BASE_CURRENCY,
            base_balance,
            equity,
            maintenance_margin,
            open_orders_count: open_orders.len(),
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
struct AccountResponse {
    #[serde(rename = "totalMarginBalance")]
    total_margin_balance: String,
    #[serde(rename = "totalMaintMargin")]
    total_maint_margin: String,
    #[serde(default)]
    assets: Vec<AssetBalance>,
}

#[derive(Debug, Deserialize)]
struct AssetBalance {
    asset: String,
    #[serde(rename = "marginBalance")]
    margin_balance: String,
}

#[derive(Debug, Deserialize)]
struct PositionRiskRow {
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
    #[serde(rename = "marginType")]
    margin_type: String,
    #[serde(rename = "unRealizedProfit")]
    unrealized_profit: String,
    notional: String,
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregator::types::Side;

    #[test]
    fn position_risk_row_normalizes_end_to_end() {
        let row: PositionRiskRow = serde_json::from_str(
            r#"{
                "symbol": "BTCUSDT",
                "positionAmt": "-0.5",
                "entryPrice": "61000",
                "markPrice": "60000",
                "liquidationPrice": "0",
                "leverage": "10",
                "marginType": "cross",
                "unRealizedProfit": "500.0",
                "notional": "-30000"
            }"#,
        )
        .unwrap();

        let raw = RawPosition {
            symbol: row.symbol.clone(),
            signed_size: parse_f64("positionAmt", &row.position_amt).unwrap(),
            entry_price: parse_f64("entryPrice", &row.entry_price).unwrap(),
            mark_price: parse_f64("markPrice", &row.mark_price).unwrap(),
            liquidation_price: parse_f64("liquidationPrice", &row.liquidation_price).unwrap(),
            leverage: parse_f64("leverage", &row.leverage).unwrap(),
            notional: Some(parse_f64("notional", &row.notional).unwrap()),
            unrealized_pnl: parse_f64("unRealizedProfit", &row.unrealized_profit).unwrap(),
            margin_flag: Some(row.margin_type.clone()),
            ..Default::default()
        };
        let position = normalize_position(EXCHANGE, &raw).unwrap();
        assert_eq!(position.side, Side::Short);
        assert_eq!(position.size, 0.50);
        assert_eq!(position.notional_value, 30_000.00);
        assert!(position.liquidation_price > 60_000.0);
    }

    #[test]
    fn account_response_tolerates_missing_assets() {
        let account: AccountResponse = serde_json::from_str(
            r#"{"totalMarginBalance": "1000.5", "totalMaintMargin": "12.25"}"#,
        )
        .unwrap();
        assert!(account.assets.is_empty());
        assert_eq!(
            parse_f64("totalMarginBalance", &account.total_margin_balance).unwrap(),
            1000.5
        );
    }
}
