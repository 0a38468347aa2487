//! Bybit unified-margin client (v5 API). One combined account whose linear
//! positions are split across USDT and USDC settlement pools; both pools are
//! fetched and merged.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures::future::try_join_all;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::warn;

use crate::aggregator::rest::{decode_json, parse_f64, parse_f64_or_zero};
use crate::aggregator::signer;
use crate::aggregator::traits::ExchangeClient;
use crate::aggregator::types::{ExchangeData, Position};
use crate::config::BybitUnifiedConfig;
use crate::error::AggregatorError;
use crate::risk::metrics::{build_summary, SummaryInputs};
use crate::risk::normalize::{normalize_position, RawPosition};

pub const EXCHANGE: &str = "bybit-unified";
const BASE_CURRENCY: &str = "USDT";
const SETTLE_COINS: [&str; 2] = ["USDT", "USDC"];

/// retCode values Bybit uses for rejected credentials or signatures.
const AUTH_RET_CODES: [i64; 3] = [10003, 10004, 10005];

pub struct BybitUnifiedClient {
    http: reqwest::Client,
    config: BybitUnifiedConfig,
    time_offset_ms: i64,
}

impl BybitUnifiedClient {
    pub fn new(config: BybitUnifiedConfig, timeout: Duration) -> Self {
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
        let resp: ApiResponse = decode_json(path, response).await?;
        decode_result(path, resp)
    }

    async fn signed_get<T: DeserializeOwned>(
        &self,
        path: &str,
        params: &[(&str, String)],
    ) -> Result<T, AggregatorError> {
        let credentials = &self.config.credentials;
        let timestamp = Utc::now().timestamp_millis() + self.time_offset_ms;
        let query = signer::encode_query(params);
        let payload = signer::bybit_sign_payload(
            timestamp,
            &credentials.api_key,
            self.config.recv_window,
            &query,
        );
        let signature = signer::sign_hex(&credentials.api_secret, &payload);
        let url = if query.is_empty() {
            self.url(path)
        } else {
            format!("{}?{query}", self.url(path))
        };
        let response = self
            .http
            .get(url)
            .header("X-BAPI-API-KEY", &credentials.api_key)
            .header("X-BAPI-TIMESTAMP", timestamp.to_string())
            .header("X-BAPI-SIGN", signature)
            .header("X-BAPI-RECV-WINDOW", self.config.recv_window.to_string())
            .send()
            .await?;
        let resp: ApiResponse = decode_json(path, response).await?;
        decode_result(path, resp)
    }

    async fn positions(&self, settle_coin: &str) -> Result<Vec<PositionItem>, AggregatorError> {
        let result: ListResult<PositionItem> = self
            .signed_get(
                "/v5/position/list",
                &[
                    ("category", "linear".to_string()),
                    ("settleCoin", settle_coin.to_string()),
                    ("limit", "200".to_string()),
                ],
            )
            .await?;
        Ok(result.list)
    }

    async fn open_orders(&self, settle_coin: &str) -> Result<usize, AggregatorError> {
        let result: ListResult<serde_json::Value> = self
            .signed_get(
                "/v5/order/realtime",
                &[
                    ("category", "linear".to_string()),
                    ("settleCoin", settle_coin.to_string()),
                    ("limit", "50".to_string()),
                ],
            )
            .await?;
        Ok(result.list.len())
    }

    async fn wallet_balance(&self) -> Result<WalletAccount, AggregatorError> {
        let result: ListResult<WalletAccount> = self
            .signed_get(
                "/v5/account/wallet-balance",
                &[("accountType", "UNIFIED".to_string())],
            )
            .await?;
        result.list.into_iter().next().ok_or_else(|| {
            AggregatorError::Parse("wallet-balance: empty UNIFIED account list".to_string())
        })
    }

    /// Funding rate and last price per linear symbol, from the public ticker.
    async fn tickers(&self) -> Result<HashMap<String, TickerItem>, AggregatorError> {
        let result: ListResult<TickerItem> = self
            .public_get("/v5/market/tickers", &[("category", "linear".to_string())])
            .await?;
        Ok(result
            .list
            .into_iter()
            .map(|item| (item.symbol.clone(), item))
            .collect())
    }

    /// Equity in base currency. The exchange-reported USD total is preferred;
    /// the fallback sums per-coin values, converting through the ticker map
    /// (direct pair, else via BTC), skipping non-positive balances.
    fn base_balance(
        &self,
        account: &WalletAccount,
        tickers: &HashMap<String, TickerItem>,
    ) -> Result<f64, AggregatorError> {
        let total = parse_f64_or_zero("wallet.totalEquity", &account.total_equity)?;
        if total > 0.0 {
            return Ok(total);
        }
        let mut sum = 0.0;
        for coin in &account.coin {
            let usd_value = parse_f64_or_zero("wallet.coin.usdValue", &coin.usd_value)?;
            if usd_value > 0.0 {
                sum += usd_value;
                continue;
            }
            let amount = parse_f64_or_zero("wallet.coin.walletBalance", &coin.wallet_balance)?;
            if amount <= 0.0 {
                continue;
            }
            sum += convert_via_tickers(&coin.coin, amount, tickers).unwrap_or_else(|| {
                warn!(coin = %coin.coin, "no price route to base currency, valuing at 0");
                0.0
            });
        }
        Ok(sum)
    }
}

/// Error envelopes carry an empty `result` object, so retCode has to be
/// classified before the payload is decoded into its typed shape.
fn decode_result<T: DeserializeOwned>(
    path: &str,
    resp: ApiResponse,
) -> Result<T, AggregatorError> {
    if resp.ret_code != 0 {
        let message = format!("{path}: {} (retCode {})", resp.ret_msg, resp.ret_code);
        return if AUTH_RET_CODES.contains(&resp.ret_code) {
            Err(AggregatorError::Auth(message))
        } else {
            Err(AggregatorError::Network(message))
        };
    }
    serde_json::from_value(resp.result)
        .map_err(|err| AggregatorError::Parse(format!("{path}: {err}")))
}

/// Direct `{coin}USDT` pair first, else two steps through BTC.
fn convert_via_tickers(
    coin: &str,
    amount: f64,
    tickers: &HashMap<String, TickerItem>,
) -> Option<f64> {
    if coin == BASE_CURRENCY {
        return Some(amount);
    }
    let last_price = |symbol: &str| -> Option<f64> {
        tickers
            .get(symbol)
            .and_then(|t| parse_f64("tickers.lastPrice", &t.last_price).ok())
            .filter(|p| *p > 0.0)
    };
    if let Some(price) = last_price(&format!("{coin}{BASE_CURRENCY}")) {
        return Some(amount * price);
    }
    let via = last_price(&format!("{coin}BTC"))?;
    let anchor = last_price(&format!("BTC{BASE_CURRENCY}"))?;
    Some(amount * via * anchor)
}

#[async_trait]
impl ExchangeClient for BybitUnifiedClient {
    async fn initialize(&mut self) -> Result<(), AggregatorError> {
        let time: ServerTimeResult = self.public_get("/v5/market/time", &[]).await?;
        let server_nanos: i64 = time.time_nano.trim().parse().map_err(|_| {
            AggregatorError::Parse(format!(
                "market/time: non-numeric timeNano '{}'",
                time.time_nano
            ))
        })?;
        self.time_offset_ms = server_nanos / 1_000_000 - Utc::now().timestamp_millis();
        self.wallet_balance().await?;
        Ok(())
    }

    async fn fetch_snapshot(&self) -> Result<ExchangeData, AggregatorError> {
        let (pools, order_counts, account, tickers) = tokio::try_join!(
            try_join_all(SETTLE_COINS.iter().map(|coin| self.positions(coin))),
            try_join_all(SETTLE_COINS.iter().map(|coin| self.open_orders(coin))),
            self.wallet_balance(),
            self.tickers(),
        )?;

        let mut positions: Vec<Position> = Vec::new();
        for item in pools.iter().flatten() {
            let size = parse_f64("position.size", &item.size)?;
            let signed_size = match item.side.as_str() {
                "Buy" => size,
                "Sell" => -size,
                // Flat one-way rows report side "None" with size 0.
                _ => 0.0,
            };
            let rate = tickers
                .get(&item.symbol)
                .and_then(|t| parse_f64_or_zero("tickers.fundingRate", &t.funding_rate).ok())
                .unwrap_or(0.0);
            let raw = RawPosition {
                symbol: item.symbol.clone(),
                signed_size,
                entry_price: parse_f64_or_zero("position.avgPrice", &item.avg_price)?,
                mark_price: parse_f64_or_zero("position.markPrice", &item.mark_price)?,
                liquidation_price: parse_f64_or_zero("position.liqPrice", &item.liq_price)?,
                leverage: parse_f64_or_zero("position.leverage", &item.leverage)?,
                notional: Some(parse_f64_or_zero("position.positionValue", &item.position_value)?),
                unrealized_pnl: parse_f64_or_zero("position.unrealisedPnl", &item.unrealised_pnl)?,
                realized_pnl: parse_f64_or_zero("position.curRealisedPnl", &item.cur_realised_pnl)?,
                // v5 does not publish a predicted next rate; reuse the
                // current one as the estimate.
                current_funding_rate: rate,
                next_funding_rate: rate,
                margin_flag: Some(item.trade_mode.to_string()),
                combined_margin: true,
            };
            if let Some(position) = normalize_position(EXCHANGE, &raw) {
                positions.push(position);
            }
        }

        let equity = parse_f64_or_zero("wallet.totalEquity", &account.total_equity)?;
        let maintenance_margin = parse_f64_or_zero(
            "wallet.totalMaintenanceMargin",
            &account.total_maintenance_margin,
        )?;
        let base_balance = self.base_balance(&account, &tickers)?;

        let account_summary = build_summary(SummaryInputs {
            exchange: EXCHANGE,
            account_id: &self.config.account_id,
            base_currency: BASE_CURRENCY,
            base_balance,
            equity,
            maintenance_margin,
            open_orders_count: order_counts.iter().sum(),
            positions: &positions,
        });

        Ok(ExchangeData {
            positions,
            account_summary,
        })
    }
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    #[serde(rename = "retCode")]
    ret_code: i64,
    #[serde(rename = "retMsg")]
    ret_msg: String,
    #[serde(default)]
    result: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct ListResult<T> {
    list: Vec<T>,
}

#[derive(Debug, Deserialize)]
struct ServerTimeResult {
    #[serde(rename = "timeNano")]
    time_nano: String,
}

#[derive(Debug, Deserialize)]
struct PositionItem {
    symbol: String,
    side: String,
    size: String,
    #[serde(rename = "avgPrice")]
    avg_price: String,
    #[serde(rename = "markPrice")]
    mark_price: String,
    #[serde(rename = "liqPrice", default)]
    liq_price: String,
    leverage: String,
    #[serde(rename = "positionValue")]
    position_value: String,
    #[serde(rename = "unrealisedPnl")]
    unrealised_pnl: String,
    #[serde(rename = "curRealisedPnl", default)]
    cur_realised_pnl: String,
    #[serde(rename = "tradeMode")]
    trade_mode: i64,
}

#[derive(Debug, Deserialize)]
struct WalletAccount {
    #[serde(rename = "totalEquity")]
    total_equity: String,
    #[serde(rename = "totalMaintenanceMargin", default)]
    total_maintenance_margin: String,
    #[serde(default)]
    coin: Vec<CoinBalance>,
}

#[derive(Debug, Deserialize)]
struct CoinBalance {
    coin: String,
    #[serde(rename = "walletBalance", default)]
    wallet_balance: String,
    #[serde(rename = "usdValue", default)]
    usd_value: String,
}

#[derive(Debug, Deserialize)]
struct TickerItem {
    symbol: String,
    #[serde(rename = "fundingRate", default)]
    funding_rate: String,
    #[serde(rename = "lastPrice", default)]
    last_price: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregator::types::{MarginMode, Side};

    fn ticker(symbol: &str, last_price: &str) -> (String, TickerItem) {
        (
            symbol.to_string(),
            TickerItem {
                symbol: symbol.to_string(),
                funding_rate: String::new(),
                last_price: last_price.to_string(),
            },
        )
    }

    #[test]
    fn rejected_credentials_surface_as_auth_despite_empty_result() {
        let resp: ApiResponse = serde_json::from_str(
            r#"{"retCode":10004,"retMsg":"error sign!","result":{},"retExtInfo":{},"time":1700000000000}"#,
        )
        .unwrap();
        let err = decode_result::<ListResult<PositionItem>>("/v5/position/list", resp).unwrap_err();
        assert!(matches!(err, AggregatorError::Auth(_)));
    }

    #[test]
    fn non_auth_ret_codes_map_to_network() {
        let resp: ApiResponse = serde_json::from_str(
            r#"{"retCode":10016,"retMsg":"system error","result":{},"time":1700000000000}"#,
        )
        .unwrap();
        let err = decode_result::<ListResult<PositionItem>>("/v5/position/list", resp).unwrap_err();
        assert!(matches!(err, AggregatorError::Network(_)));
    }

    #[test]
    fn success_envelope_decodes_typed_result() {
        let resp: ApiResponse = serde_json::from_str(
            r#"{"retCode":0,"retMsg":"OK","result":{"list":[{"symbol":"BTCUSDT","fundingRate":"0.0001","lastPrice":"60000"}]},"time":1700000000000}"#,
        )
        .unwrap();
        let result: ListResult<TickerItem> = decode_result("/v5/market/tickers", resp).unwrap();
        assert_eq!(result.list.len(), 1);
        assert_eq!(result.list[0].symbol, "BTCUSDT");
    }

    #[test]
    fn sell_side_normalizes_to_short_with_isolated_mode() {
        let item: PositionItem = serde_json::from_str(
            r#"{
                "symbol": "ETHUSDT",
                "side": "Sell",
                "size": "2",
                "avgPrice": "3100",
                "markPrice": "3000",
                "liqPrice": "3500",
                "leverage": "5",
                "positionValue": "6000",
                "unrealisedPnl": "200",
                "curRealisedPnl": "-12.5",
                "tradeMode": 1
            }"#,
        )
        .unwrap();
        let size = parse_f64("size", &item.size).unwrap();
        let raw = RawPosition {
            symbol: item.symbol.clone(),
            signed_size: -size,
            entry_price: parse_f64("avgPrice", &item.avg_price).unwrap(),
            mark_price: parse_f64("markPrice", &item.mark_price).unwrap(),
            liquidation_price: parse_f64_or_zero("liqPrice", &item.liq_price).unwrap(),
            leverage: parse_f64("leverage", &item.leverage).unwrap(),
            notional: Some(parse_f64("positionValue", &item.position_value).unwrap()),
            realized_pnl: parse_f64_or_zero("curRealisedPnl", &item.cur_realised_pnl).unwrap(),
            margin_flag: Some(item.trade_mode.to_string()),
            combined_margin: true,
            ..Default::default()
        };
        let position = normalize_position(EXCHANGE, &raw).unwrap();
        assert_eq!(position.side, Side::Short);
        assert_eq!(position.margin_mode, MarginMode::Isolated);
        assert_eq!(position.liquidation_price, 3_500.00);
        assert_eq!(position.realized_pnl, -12.5);
        // (3500 - 3000) / 3000 * 100
        assert_eq!(position.liquidation_distance_percent, 16.67);
    }

    #[test]
    fn empty_liq_price_falls_back_to_estimation() {
        let raw = RawPosition {
            symbol: "SOLUSDC".into(),
            signed_size: 10.0,
            mark_price: 150.0,
            liquidation_price: parse_f64_or_zero("liqPrice", "").unwrap(),
            leverage: 4.0,
            combined_margin: true,
            ..Default::default()
        };
        let position = normalize_position(EXCHANGE, &raw).unwrap();
        assert!(position.liquidation_price > 0.0);
        assert!(position.liquidation_price < 150.0);
    }

    #[test]
    fn balance_conversion_prefers_direct_pair_then_btc_route() {
        let tickers: HashMap<String, TickerItem> = [
            ticker("BTCUSDT", "60000"),
            ticker("ETHUSDT", "3000"),
            ticker("XYZBTC", "0.001"),
        ]
        .into_iter()
        .collect();

        assert_eq!(convert_via_tickers("USDT", 100.0, &tickers), Some(100.0));
        assert_eq!(convert_via_tickers("ETH", 2.0, &tickers), Some(6_000.0));
        // No XYZUSDT pair: routes through BTC.
        assert_eq!(convert_via_tickers("XYZ", 10.0, &tickers), Some(600.0));
        assert_eq!(convert_via_tickers("ABC", 1.0, &tickers), None);
    }
}
