//! Maps raw exchange position records into the canonical [`Position`] shape.

use crate::aggregator::types::{MarginMode, Position, Side};

/// Maintenance-margin-ratio assumption used when an exchange does not report
/// a liquidation price. Roughly the lowest Binance/Bybit linear tier.
pub const MAINT_MARGIN_RATIO: f64 = 0.005;

/// Extra headroom assumed for combined-margin account modes (portfolio /
/// unified margin), where the shared pool shifts the real liquidation level.
pub const COMBINED_MARGIN_BUFFER: f64 = 0.01;

/// Liquidation prices below this are treated as "not provided" by the source.
const LIQ_EPSILON: f64 = 1e-8;

/// Exchange-agnostic intermediate record. Each client converts its native
/// response rows into this shape before normalization.
#[derive(Debug, Clone, Default)]
pub struct RawPosition {
    pub symbol: String,
    /// Signed size as reported by the exchange; negative means short.
    pub signed_size: f64,
    pub entry_price: f64,
    pub mark_price: f64,
    /// 0 when the source omits it.
    pub liquidation_price: f64,
    pub leverage: f64,
    /// Exchange-reported notional, when available; otherwise derived from
    /// `|signed_size| * mark_price`.
    pub notional: Option<f64>,
    pub unrealized_pnl: f64,
    pub realized_pnl: f64,
    /// Funding rates as fractions (0.0001 == 0.01%); 0 for instruments with
    /// no funding leg.
    pub current_funding_rate: f64,
    pub next_funding_rate: f64,
    /// Exchange-native margin-mode flag ("cross", "isolated", "0", "1", ...).
    pub margin_flag: Option<String>,
    /// True for portfolio/unified margin accounts sharing one margin pool.
    pub combined_margin: bool,
}

/// Round to 2 decimal places. Applied to every numeric output; this is a
/// presentation contract, equality-based consumers rely on it.
pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Estimate a liquidation price from mark price and leverage.
///
/// This is an approximation, not an exchange-computed value: it assumes a
/// flat maintenance-margin ratio and ignores tiered brackets and existing
/// margin balance. Used only when the source omits the liquidation price.
pub fn estimate_liquidation_price(
    mark_price: f64,
    leverage: f64,
    side: Side,
    combined_margin: bool,
) -> f64 {
    if mark_price <= 0.0 || leverage <= 0.0 {
        return 0.0;
    }
    let mut headroom = 1.0 / leverage + MAINT_MARGIN_RATIO;
    if combined_margin {
        headroom += COMBINED_MARGIN_BUFFER;
    }
    match side {
        Side::Long => (mark_price * (1.0 - headroom)).max(0.0),
        Side::Short => mark_price * (1.0 + headroom),
    }
}

/// Direction-aware liquidation distance in percent. Positive means the price
/// must move that percent against the position to reach liquidation; 0 when
/// the liquidation price is unknown.
pub fn liquidation_distance_percent(mark_price: f64, liquidation_price: f64, side: Side) -> f64 {
    if liquidation_price <= LIQ_EPSILON || mark_price <= 0.0 {
        return 0.0;
    }
    let distance = match side {
        Side::Long => (mark_price - liquidation_price) / mark_price * 100.0,
        Side::Short => (liquidation_price - mark_price) / mark_price * 100.0,
    };
    round2(distance)
}

fn margin_mode_from_flag(flag: Option<&str>) -> MarginMode {
    match flag.map(|f| f.trim().to_ascii_lowercase()).as_deref() {
        Some("isolated") | Some("1") | Some("true") => MarginMode::Isolated,
        // Unrecognized values default to cross.
        _ => MarginMode::Cross,
    }
}

/// Normalize one raw record. Returns `None` for flat (zero-size) records.
pub fn normalize_position(exchange: &str, raw: &RawPosition) -> Option<Position> {
    if raw.signed_size == 0.0 {
        return None;
    }
    let side = if raw.signed_size > 0.0 {
        Side::Long
    } else {
        Side::Short
    };
    let size = raw.signed_size.abs();
    let notional = raw
        .notional
        .map(f64::abs)
        .unwrap_or_else(|| size * raw.mark_price);

    let liquidation_price = if raw.liquidation_price > LIQ_EPSILON {
        raw.liquidation_price
    } else {
        estimate_liquidation_price(raw.mark_price, raw.leverage, side, raw.combined_margin)
    };

    Some(Position {
        symbol: raw.symbol.clone(),
        side,
        size: round2(size),
        notional_value: round2(notional),
        entry_price: round2(raw.entry_price),
        mark_price: round2(raw.mark_price),
        liquidation_price: round2(liquidation_price),
        liquidation_distance_percent: liquidation_distance_percent(
            raw.mark_price,
            liquidation_price,
            side,
        ),
        current_funding_rate_percent: round2(raw.current_funding_rate * 100.0),
        next_funding_rate_percent: round2(raw.next_funding_rate * 100.0),
        leverage: round2(raw.leverage),
        unrealized_pnl: round2(raw.unrealized_pnl),
        realized_pnl: round2(raw.realized_pnl),
        margin_mode: margin_mode_from_flag(raw.margin_flag.as_deref()),
        exchange: exchange.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_size_records_are_skipped() {
        let raw = RawPosition {
            symbol: "BTCUSDT".into(),
            signed_size: 0.0,
            mark_price: 60_000.0,
            leverage: 10.0,
            ..Default::default()
        };
        assert!(normalize_position("binance-futures", &raw).is_none());
    }

    #[test]
    fn short_position_normalizes_with_estimated_liquidation() {
        // End-to-end shape from a Binance positionRisk row with no
        // exchange-reported liquidation price.
        let raw = RawPosition {
            symbol: "BTCUSDT".into(),
            signed_size: -0.5,
            entry_price: 61_000.0,
            mark_price: 60_000.0,
            liquidation_price: 0.0,
            leverage: 10.0,
            ..Default::default()
        };
        let position = normalize_position("binance-futures", &raw).unwrap();
        assert_eq!(position.side, Side::Short);
        assert_eq!(position.size, 0.50);
        assert_eq!(position.notional_value, 30_000.00);
        assert!(position.liquidation_price > 60_000.0);
        assert!(position.liquidation_distance_percent > 0.0);
    }

    #[test]
    fn estimated_liquidation_is_on_the_correct_side() {
        for leverage in [1.5, 3.0, 10.0, 50.0, 125.0] {
            for mark in [0.05, 100.0, 60_000.0] {
                let long = estimate_liquidation_price(mark, leverage, Side::Long, false);
                let short = estimate_liquidation_price(mark, leverage, Side::Short, false);
                assert!(long.is_finite() && long < mark, "lev {leverage} mark {mark}");
                assert!(short.is_finite() && short > mark, "lev {leverage} mark {mark}");
            }
        }
    }

    #[test]
    fn combined_margin_widens_the_estimate() {
        let plain = estimate_liquidation_price(60_000.0, 10.0, Side::Short, false);
        let combined = estimate_liquidation_price(60_000.0, 10.0, Side::Short, true);
        assert!(combined > plain);
    }

    #[test]
    fn exchange_reported_liquidation_price_wins() {
        let raw = RawPosition {
            symbol: "ETHUSDT".into(),
            signed_size: 2.0,
            mark_price: 3_000.0,
            liquidation_price: 2_500.0,
            leverage: 5.0,
            ..Default::default()
        };
        let position = normalize_position("bybit", &raw).unwrap();
        assert_eq!(position.liquidation_price, 2_500.00);
        // (3000 - 2500) / 3000 * 100
        assert_eq!(position.liquidation_distance_percent, 16.67);
    }

    #[test]
    fn unknown_liquidation_yields_zero_distance() {
        assert_eq!(liquidation_distance_percent(3_000.0, 0.0, Side::Long), 0.0);
    }

    #[test]
    fn unrecognized_margin_flags_default_to_cross() {
        let mut raw = RawPosition {
            symbol: "BTCUSDT".into(),
            signed_size: 1.0,
            mark_price: 60_000.0,
            leverage: 10.0,
            margin_flag: Some("portfolio???".into()),
            ..Default::default()
        };
        let position = normalize_position("binance-futures", &raw).unwrap();
        assert_eq!(position.margin_mode, MarginMode::Cross);

        raw.margin_flag = Some("ISOLATED".into());
        let position = normalize_position("binance-futures", &raw).unwrap();
        assert_eq!(position.margin_mode, MarginMode::Isolated);
    }

    #[test]
    fn funding_rates_convert_to_percent() {
        let raw = RawPosition {
            symbol: "BTCUSDT".into(),
            signed_size: 1.0,
            mark_price: 60_000.0,
            leverage: 10.0,
            current_funding_rate: 0.0001,
            next_funding_rate: 0.0003,
            ..Default::default()
        };
        let position = normalize_position("binance-futures", &raw).unwrap();
        assert_eq!(position.current_funding_rate_percent, 0.01);
        assert_eq!(position.next_funding_rate_percent, 0.03);
    }
}
