//! Account-level risk aggregates derived from normalized positions plus raw
//! account totals. Every division-by-zero case yields 0, never NaN.

use crate::aggregator::types::{AccountSummary, Position};
use crate::risk::normalize::round2;

/// Sum of absolute per-position notional values.
pub fn total_notional(positions: &[Position]) -> f64 {
    positions.iter().map(|p| p.notional_value.abs()).sum()
}

/// Notional-weighted average leverage; 0 when there are no positions.
pub fn weighted_leverage(positions: &[Position]) -> f64 {
    let total: f64 = positions.iter().map(|p| p.notional_value.abs()).sum();
    if total <= 0.0 {
        return 0.0;
    }
    let weighted: f64 = positions
        .iter()
        .map(|p| p.leverage * p.notional_value.abs())
        .sum();
    weighted / total
}

/// maintenanceMargin / equity * 100; 0 when equity is non-positive.
pub fn margin_ratio(maintenance_margin: f64, equity: f64) -> f64 {
    if equity <= 0.0 {
        return 0.0;
    }
    maintenance_margin / equity * 100.0
}

/// Percent headroom of equity above maintenance margin, clamped to [0, 100];
/// 0 when there is no maintenance margin requirement.
pub fn liquidation_buffer(equity: f64, maintenance_margin: f64) -> f64 {
    if maintenance_margin <= 0.0 {
        return 0.0;
    }
    let buffer = (equity - maintenance_margin) / maintenance_margin * 100.0;
    buffer.clamp(0.0, 100.0)
}

/// Raw inputs a client hands over after its fan-out completes.
#[derive(Debug, Clone)]
pub struct SummaryInputs<'a> {
    pub exchange: &'a str,
    pub account_id: &'a str,
    pub base_currency: &'a str,
    /// Equity already converted into the base currency.
    pub base_balance: f64,
    pub equity: f64,
    pub maintenance_margin: f64,
    pub open_orders_count: usize,
    pub positions: &'a [Position],
}

pub fn build_summary(inputs: SummaryInputs<'_>) -> AccountSummary {
    AccountSummary {
        exchange: inputs.exchange.to_string(),
        account_id: inputs.account_id.to_string(),
        base_currency: inputs.base_currency.to_string(),
        base_balance: round2(inputs.base_balance),
        total_notional_value: round2(total_notional(inputs.positions)),
        account_leverage: round2(weighted_leverage(inputs.positions)),
        open_positions_count: inputs.positions.len(),
        open_orders_count: inputs.open_orders_count,
        account_margin_ratio: round2(margin_ratio(inputs.maintenance_margin, inputs.equity)),
        liquidation_buffer: round2(liquidation_buffer(inputs.equity, inputs.maintenance_margin)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregator::types::{MarginMode, Side};

    fn position(notional: f64, leverage: f64) -> Position {
        Position {
            symbol: "BTCUSDT".into(),
            side: Side::Long,
            size: 1.0,
            notional_value: notional,
            entry_price: 0.0,
            mark_price: 0.0,
            liquidation_price: 0.0,
            liquidation_distance_percent: 0.0,
            current_funding_rate_percent: 0.0,
            next_funding_rate_percent: 0.0,
            leverage,
            unrealized_pnl: 0.0,
            realized_pnl: 0.0,
            margin_mode: MarginMode::Cross,
            exchange: "binance-futures".into(),
        }
    }

    #[test]
    fn weighted_leverage_empty_is_zero() {
        assert_eq!(weighted_leverage(&[]), 0.0);
    }

    #[test]
    fn weighted_leverage_is_notional_weighted() {
        let positions = vec![position(1_000.0, 10.0), position(3_000.0, 5.0)];
        // (10*1000 + 5*3000) / 4000
        assert_eq!(weighted_leverage(&positions), 6.25);
    }

    #[test]
    fn liquidation_buffer_bounds() {
        assert_eq!(liquidation_buffer(1_000.0, 0.0), 0.0);
        assert_eq!(liquidation_buffer(0.0, 0.0), 0.0);
        // Huge headroom clamps to 100.
        assert_eq!(liquidation_buffer(1_000_000.0, 10.0), 100.0);
        // Below maintenance margin clamps to 0.
        assert_eq!(liquidation_buffer(5.0, 10.0), 0.0);
        // 50% headroom.
        assert_eq!(liquidation_buffer(15.0, 10.0), 50.0);
    }

    #[test]
    fn margin_ratio_handles_non_positive_equity() {
        assert_eq!(margin_ratio(10.0, 0.0), 0.0);
        assert_eq!(margin_ratio(10.0, -5.0), 0.0);
        assert_eq!(margin_ratio(10.0, 100.0), 10.0);
    }

    #[test]
    fn summary_assembles_rounded_fields() {
        let positions = vec![position(1_000.0, 10.0), position(3_000.0, 5.0)];
        let summary = build_summary(SummaryInputs {
            exchange: "binance-futures",
            account_id: "futures",
            base_currency: "USDT",
            base_balance: 10_000.123,
            equity: 10_000.0,
            maintenance_margin: 40.0,
            open_orders_count: 3,
            positions: &positions,
        });
        assert_eq!(summary.base_balance, 10_000.12);
        assert_eq!(summary.total_notional_value, 4_000.0);
        assert_eq!(summary.account_leverage, 6.25);
        assert_eq!(summary.open_positions_count, 2);
        assert_eq!(summary.open_orders_count, 3);
        assert_eq!(summary.account_margin_ratio, 0.4);
        assert_eq!(summary.liquidation_buffer, 100.0);
    }
}
