use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Direction of exposure. Size is always an absolute magnitude; the sign
/// of the exposure lives here and only here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    Long,
    Short,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MarginMode {
    Cross,
    Isolated,
}

/// One open derivative position, normalized across exchanges.
/// All numeric fields are rounded to 2 decimal places by the normalizer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Position {
    pub symbol: String,
    pub side: Side,
    pub size: f64,
    pub notional_value: f64,
    pub entry_price: f64,
    pub mark_price: f64,
    pub liquidation_price: f64,
    /// Positive means price must move that percent against the position to
    /// reach liquidation; 0 when the liquidation price is unknown.
    pub liquidation_distance_percent: f64,
    pub current_funding_rate_percent: f64,
    pub next_funding_rate_percent: f64,
    pub leverage: f64,
    pub unrealized_pnl: f64,
    pub realized_pnl: f64,
    pub margin_mode: MarginMode,
    pub exchange: String,
}

/// Account-level aggregates for one (exchange, account) pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountSummary {
    pub exchange: String,
    pub account_id: String,
    pub base_currency: String,
    /// Total equity converted into `base_currency`.
    pub base_balance: f64,
    pub total_notional_value: f64,
    /// Notional-weighted average leverage across open positions.
    pub account_leverage: f64,
    pub open_positions_count: usize,
    pub open_orders_count: usize,
    /// maintenanceMargin / equity * 100; 0 when equity is non-positive.
    pub account_margin_ratio: f64,
    /// Percent headroom of equity above maintenance margin, capped at 100.
    pub liquidation_buffer: f64,
}

/// The complete normalized state for one (exchange, account) pair.
/// Replaced wholesale on every successful fetch cycle, never mutated in place.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExchangeData {
    pub positions: Vec<Position>,
    pub account_summary: AccountSummary,
}

/// Snapshot over every registered pair plus the current selection pointers.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CombinedSnapshot {
    pub exchanges: HashMap<String, HashMap<String, ExchangeData>>,
    pub current_exchange: Option<String>,
    pub current_account: Option<String>,
    pub available_exchanges: Vec<String>,
    pub available_accounts: Vec<String>,
}

/// Per-(exchange, account) polling bookkeeping. Created at registration and
/// mutated only by the scheduler.
#[derive(Debug, Clone, Copy, Default)]
pub struct FetchState {
    /// Unix millis of the last successful fetch; 0 before the first success.
    pub last_fetch_ms: i64,
    pub consecutive_errors: u32,
    /// Unix millis until which fetches are skipped; 0 when not backing off.
    pub backoff_until_ms: i64,
    /// True while a fetch for this key is in flight.
    pub in_flight: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthEntry {
    pub exchange: String,
    pub account: String,
    pub healthy: bool,
    pub last_fetch_ms: i64,
    pub seconds_since_last_fetch: i64,
    pub in_backoff: bool,
    pub backoff_until_ms: i64,
    pub consecutive_errors: u32,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub entries: Vec<HealthEntry>,
}
