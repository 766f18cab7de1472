//! Pricing: spread, mark/last/mid derivation, and the intrabar path.
//!
//! Mark price is derived through a single code path (`close | hlc3 | ohlc4`)
//! and computed exactly once per bar by the exchange orchestrator; everything
//! downstream (MTM, liquidation) reuses that value.

use std::str::FromStr;

use chrono::Duration;
use serde::{Deserialize, Serialize};

use crate::bar::Bar;
use crate::error::CoreError;
use crate::sim::types::{FillReason, OrderSide, PricePoint, PriceSnapshot};

/// How the mark price is derived from a bar.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MarkPriceSource {
    #[default]
    Close,
    Hlc3,
    Ohlc4,
}

impl MarkPriceSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            MarkPriceSource::Close => "close",
            MarkPriceSource::Hlc3 => "hlc3",
            MarkPriceSource::Ohlc4 => "ohlc4",
        }
    }
}

impl FromStr for MarkPriceSource {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "close" => Ok(MarkPriceSource::Close),
            "hlc3" => Ok(MarkPriceSource::Hlc3),
            "ohlc4" => Ok(MarkPriceSource::Ohlc4),
            other => Err(CoreError::Config(format!(
                "Unsupported mark_price_source '{}'. Supported: close, hlc3, ohlc4",
                other
            ))),
        }
    }
}

/// Fixed bid-ask spread proxy in basis points.
#[derive(Debug, Clone, Copy)]
pub struct SpreadConfig {
    pub fixed_spread_bps: f64,
}

impl Default for SpreadConfig {
    fn default() -> Self {
        Self {
            fixed_spread_bps: 2.0,
        }
    }
}

#[derive(Debug)]
pub struct SpreadModel {
    config: SpreadConfig,
}

impl SpreadModel {
    pub fn new(config: SpreadConfig) -> Self {
        Self { config }
    }

    /// Spread in price units: `close x (bps / 1e4)`.
    pub fn get_spread(&self, bar: &Bar) -> f64 {
        bar.close * (self.config.fixed_spread_bps / 10_000.0)
    }
}

impl Default for SpreadModel {
    fn default() -> Self {
        Self::new(SpreadConfig::default())
    }
}

/// Derives mark/last/mid/bid/ask from OHLC data.
#[derive(Debug)]
pub struct PriceModel {
    mark_source: MarkPriceSource,
}

impl PriceModel {
    pub fn new(mark_source: MarkPriceSource) -> Self {
        Self { mark_source }
    }

    pub fn mark_source(&self) -> MarkPriceSource {
        self.mark_source
    }

    pub fn get_mark_price(&self, bar: &Bar) -> f64 {
        match self.mark_source {
            MarkPriceSource::Close => bar.close,
            MarkPriceSource::Hlc3 => bar.hlc3(),
            MarkPriceSource::Ohlc4 => bar.ohlc4(),
        }
    }

    /// Complete per-bar price snapshot. Mid is approximated by close; bid and
    /// ask bracket it by half the spread.
    pub fn get_prices(&self, bar: &Bar, spread: f64) -> PriceSnapshot {
        let mark = self.get_mark_price(bar);
        let last = bar.close;
        let mid = bar.close;
        let half_spread = spread / 2.0;
        PriceSnapshot {
            timestamp: bar.ts_close,
            mark_price: mark,
            last_price: last,
            mid_price: mid,
            bid_price: mid - half_spread,
            ask_price: mid + half_spread,
            spread,
        }
    }
}

impl Default for PriceModel {
    fn default() -> Self {
        Self::new(MarkPriceSource::Close)
    }
}

/// Deterministic intrabar price path for TP/SL checking.
///
/// Side-aware conservative ordering, 4 points per bar:
/// - long:  O -> L -> H -> C (SL at the low is visited before TP at the high)
/// - short: O -> H -> L -> C
///
/// This encodes the locked tie-break: when both SL and TP are hit within one
/// bar, SL wins.
#[derive(Debug)]
pub struct IntrabarPath;

impl IntrabarPath {
    pub fn new() -> Self {
        Self
    }

    /// Four-point path at fixed sub-bar offsets.
    pub fn generate_path_for_side(&self, bar: &Bar, side: OrderSide) -> Vec<PricePoint> {
        let ts = bar.ts_open;
        let delta = Duration::seconds(15);
        let prices = match side {
            OrderSide::Long => [bar.open, bar.low, bar.high, bar.close],
            OrderSide::Short => [bar.open, bar.high, bar.low, bar.close],
        };
        prices
            .iter()
            .enumerate()
            .map(|(i, &price)| PricePoint {
                timestamp: ts + delta * (i as i32),
                price,
                sequence: i as u8,
            })
            .collect()
    }

    /// Check whether TP or SL fires within the bar; SL wins ties.
    pub fn check_tp_sl(
        &self,
        bar: &Bar,
        side: OrderSide,
        tp: Option<f64>,
        sl: Option<f64>,
    ) -> Option<FillReason> {
        let (sl_hit, tp_hit) = match side {
            OrderSide::Long => (
                sl.map(|s| bar.low <= s).unwrap_or(false),
                tp.map(|t| bar.high >= t).unwrap_or(false),
            ),
            OrderSide::Short => (
                sl.map(|s| bar.high >= s).unwrap_or(false),
                tp.map(|t| bar.low <= t).unwrap_or(false),
            ),
        };

        if sl_hit {
            Some(FillReason::StopLoss)
        } else if tp_hit {
            Some(FillReason::TakeProfit)
        } else {
            None
        }
    }

    /// Exit price for a TP/SL fill (the level itself; close as fallback).
    pub fn get_exit_price(
        &self,
        bar: &Bar,
        reason: FillReason,
        tp: Option<f64>,
        sl: Option<f64>,
    ) -> f64 {
        match reason {
            FillReason::StopLoss => sl.unwrap_or(bar.close),
            FillReason::TakeProfit => tp.unwrap_or(bar.close),
            _ => bar.close,
        }
    }
}

impl Default for IntrabarPath {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn bar(open: f64, high: f64, low: f64, close: f64) -> Bar {
        Bar::new(
            "BTCUSDT",
            "15m",
            Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2024, 1, 2, 0, 15, 0).unwrap(),
            open,
            high,
            low,
            close,
            1_000.0,
        )
    }

    #[test]
    fn test_mark_sources() {
        let b = bar(100.0, 110.0, 90.0, 105.0);
        assert_eq!(PriceModel::new(MarkPriceSource::Close).get_mark_price(&b), 105.0);
        assert!(
            (PriceModel::new(MarkPriceSource::Hlc3).get_mark_price(&b)
                - (110.0 + 90.0 + 105.0) / 3.0)
                .abs()
                < 1e-12
        );
        assert!(
            (PriceModel::new(MarkPriceSource::Ohlc4).get_mark_price(&b)
                - (100.0 + 110.0 + 90.0 + 105.0) / 4.0)
                .abs()
                < 1e-12
        );
    }

    #[test]
    fn test_mark_source_parse() {
        assert_eq!("hlc3".parse::<MarkPriceSource>().unwrap(), MarkPriceSource::Hlc3);
        assert!("vwap".parse::<MarkPriceSource>().is_err());
    }

    #[test]
    fn test_spread_and_bid_ask() {
        let b = bar(100.0, 110.0, 90.0, 100.0);
        let spread = SpreadModel::new(SpreadConfig { fixed_spread_bps: 2.0 }).get_spread(&b);
        assert!((spread - 0.02).abs() < 1e-12);

        let prices = PriceModel::default().get_prices(&b, spread);
        assert_eq!(prices.mid_price, 100.0);
        assert!((prices.bid_price - 99.99).abs() < 1e-9);
        assert!((prices.ask_price - 100.01).abs() < 1e-9);
        assert_eq!(prices.timestamp, b.ts_close);
    }

    #[test]
    fn test_path_ordering_by_side() {
        let b = bar(100.0, 110.0, 90.0, 105.0);
        let path = IntrabarPath::new();

        let long: Vec<f64> = path
            .generate_path_for_side(&b, OrderSide::Long)
            .iter()
            .map(|p| p.price)
            .collect();
        assert_eq!(long, vec![100.0, 90.0, 110.0, 105.0]);

        let short: Vec<f64> = path
            .generate_path_for_side(&b, OrderSide::Short)
            .iter()
            .map(|p| p.price)
            .collect();
        assert_eq!(short, vec![100.0, 110.0, 90.0, 105.0]);
    }

    #[test]
    fn test_tp_sl_tie_break_long() {
        // Both SL (39000) and TP (42000) hit in one bar: SL wins.
        let b = bar(40_200.0, 42_100.0, 38_500.0, 39_000.0);
        let path = IntrabarPath::new();
        assert_eq!(
            path.check_tp_sl(&b, OrderSide::Long, Some(42_000.0), Some(39_000.0)),
            Some(FillReason::StopLoss)
        );
    }

    #[test]
    fn test_tp_only_long() {
        let b = bar(40_200.0, 42_100.0, 39_900.0, 41_500.0);
        let path = IntrabarPath::new();
        assert_eq!(
            path.check_tp_sl(&b, OrderSide::Long, Some(42_000.0), Some(39_000.0)),
            Some(FillReason::TakeProfit)
        );
        assert_eq!(
            path.get_exit_price(&b, FillReason::TakeProfit, Some(42_000.0), Some(39_000.0)),
            42_000.0
        );
    }

    #[test]
    fn test_tp_sl_short_symmetric() {
        // Short with SL above (41000) and TP below (38000).
        let tp_bar = bar(39_500.0, 39_800.0, 37_500.0, 37_800.0);
        let path = IntrabarPath::new();
        assert_eq!(
            path.check_tp_sl(&tp_bar, OrderSide::Short, Some(38_000.0), Some(41_000.0)),
            Some(FillReason::TakeProfit)
        );

        // Both hit: SL wins for shorts too.
        let both = bar(39_500.0, 41_200.0, 37_500.0, 38_000.0);
        assert_eq!(
            path.check_tp_sl(&both, OrderSide::Short, Some(38_000.0), Some(41_000.0)),
            Some(FillReason::StopLoss)
        );
    }

    #[test]
    fn test_no_trigger_inside_range() {
        let b = bar(40_000.0, 40_500.0, 39_600.0, 40_200.0);
        let path = IntrabarPath::new();
        assert_eq!(
            path.check_tp_sl(&b, OrderSide::Long, Some(42_000.0), Some(39_000.0)),
            None
        );
        assert_eq!(path.check_tp_sl(&b, OrderSide::Long, None, None), None);
    }
}
