//! Funding: scheduled settlement windows and rate application.
//!
//! Bybit convention: settlements at 00:00, 08:00, 16:00 UTC (every 8h).
//! Settlement epochs for a run window are precomputed once; per-bar lookup is
//! an O(1)-ish intersection with the `(prev_ts, ts]` window.
//!
//! `funding_pnl = size x entry_price x rate x direction`, with direction -1
//! for longs (positive rates cost longs) and +1 for shorts.

use std::collections::BTreeMap;

use chrono::{DateTime, TimeZone, Timelike, Utc};

use crate::sim::types::{FundingEvent, FundingResult, OrderSide, Position};

/// Funding interval in milliseconds (8 hours).
pub const FUNDING_INTERVAL_MS: i64 = 8 * 60 * 60 * 1000;

/// Is this timestamp a funding settlement time (00:00/08:00/16:00 UTC)?
pub fn is_funding_settlement_time(ts: DateTime<Utc>) -> bool {
    ts.hour() % 8 == 0 && ts.minute() == 0 && ts.second() == 0 && ts.timestamp_subsec_millis() == 0
}

/// All settlement epochs (ms) in `[start_ms, end_ms]`.
pub fn funding_settlements_in_range(start_ms: i64, end_ms: i64) -> Vec<i64> {
    if end_ms < start_ms {
        return Vec::new();
    }
    let first = start_ms.div_euclid(FUNDING_INTERVAL_MS) * FUNDING_INTERVAL_MS;
    let first = if first < start_ms {
        first + FUNDING_INTERVAL_MS
    } else {
        first
    };
    let mut out = Vec::new();
    let mut ts = first;
    while ts <= end_ms {
        out.push(ts);
        ts += FUNDING_INTERVAL_MS;
    }
    out
}

/// Next settlement time strictly after `ts`.
pub fn next_funding_settlement(ts: DateTime<Utc>) -> DateTime<Utc> {
    let ms = ts.timestamp_millis();
    let next = (ms.div_euclid(FUNDING_INTERVAL_MS) + 1) * FUNDING_INTERVAL_MS;
    Utc.timestamp_millis_opt(next)
        .single()
        .expect("settlement epoch is a valid timestamp")
}

/// Hours until the next settlement (in (0.0, 8.0]).
pub fn time_to_next_settlement(ts: DateTime<Utc>) -> f64 {
    let delta = next_funding_settlement(ts) - ts;
    delta.num_milliseconds() as f64 / 3_600_000.0
}

/// Number of settlements in `[start, end]`.
pub fn count_funding_settlements_in_range(start: DateTime<Utc>, end: DateTime<Utc>) -> usize {
    funding_settlements_in_range(start.timestamp_millis(), end.timestamp_millis()).len()
}

/// Funding rates keyed by settlement epoch, with the settlement set
/// precomputed for the run window.
#[derive(Debug, Clone, Default)]
pub struct FundingTable {
    rates: BTreeMap<i64, f64>,
}

impl FundingTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_rates(rates: impl IntoIterator<Item = (i64, f64)>) -> Self {
        Self {
            rates: rates.into_iter().collect(),
        }
    }

    pub fn insert(&mut self, settlement_ms: i64, rate: f64) {
        self.rates.insert(settlement_ms, rate);
    }

    pub fn rate_at(&self, settlement_ms: i64) -> Option<f64> {
        self.rates.get(&settlement_ms).copied()
    }

    pub fn is_empty(&self) -> bool {
        self.rates.is_empty()
    }

    /// Funding events with settlement in `(prev_ms, ts_ms]`, sorted by time.
    ///
    /// `prev_ms = None` (first bar) includes everything up to `ts_ms`.
    pub fn events_in_window(
        &self,
        symbol: &str,
        prev_ms: Option<i64>,
        ts_ms: i64,
    ) -> Vec<FundingEvent> {
        let lower = prev_ms.unwrap_or(i64::MIN);
        self.rates
            .range((
                std::ops::Bound::Excluded(lower),
                std::ops::Bound::Included(ts_ms),
            ))
            .filter_map(|(&settlement_ms, &rate)| {
                Utc.timestamp_millis_opt(settlement_ms)
                    .single()
                    .map(|timestamp| FundingEvent {
                        timestamp,
                        symbol: symbol.to_string(),
                        funding_rate: rate,
                    })
            })
            .collect()
    }
}

/// Applies funding events to an open position.
#[derive(Debug)]
pub struct FundingModel {
    enabled: bool,
}

impl FundingModel {
    pub fn new(enabled: bool) -> Self {
        Self { enabled }
    }

    /// Apply events in `(prev_ts, ts]` to the position (if any).
    pub fn apply_events(
        &self,
        events: &[FundingEvent],
        prev_ts: Option<DateTime<Utc>>,
        ts: DateTime<Utc>,
        position: Option<&Position>,
    ) -> FundingResult {
        let mut result = FundingResult::default();

        if !self.enabled {
            return result;
        }
        let position = match position {
            Some(p) => p,
            None => return result,
        };

        for event in events {
            // Events should be pre-filtered to the window; re-check anyway so
            // the model is safe to call with a raw list.
            if let Some(prev) = prev_ts {
                if event.timestamp <= prev {
                    continue;
                }
            }
            if event.timestamp > ts {
                continue;
            }

            result.funding_pnl += Self::calculate_funding(position, event);
            result.events_applied.push(event.clone());
        }

        result
    }

    fn calculate_funding(position: &Position, event: &FundingEvent) -> f64 {
        let position_value = position.size * position.entry_price;
        let direction = match position.side {
            OrderSide::Long => -1.0,
            OrderSide::Short => 1.0,
        };
        position_value * event.funding_rate * direction
    }
}

impl Default for FundingModel {
    fn default() -> Self {
        Self::new(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
    }

    fn position(side: OrderSide) -> Position {
        Position {
            position_id: "pos-0001".to_string(),
            symbol: "BTCUSDT".to_string(),
            side,
            entry_price: 40_000.0,
            entry_time: ts(2024, 1, 2, 1, 0),
            size: 0.25,
            size_usdt: 10_000.0,
            stop_loss: None,
            take_profit: None,
            fees_paid: 0.0,
            entry_fee: 0.0,
            entry_bar_index: 0,
            min_price: None,
            max_price: None,
            funding_pnl_cumulative: 0.0,
            initial_stop: None,
            trailing_active: false,
            be_activated: false,
            tp_order_type: "Market".to_string(),
            sl_order_type: "Market".to_string(),
        }
    }

    #[test]
    fn test_settlement_time_detection() {
        assert!(is_funding_settlement_time(ts(2024, 1, 2, 0, 0)));
        assert!(is_funding_settlement_time(ts(2024, 1, 2, 8, 0)));
        assert!(is_funding_settlement_time(ts(2024, 1, 2, 16, 0)));
        assert!(!is_funding_settlement_time(ts(2024, 1, 2, 4, 0)));
        assert!(!is_funding_settlement_time(ts(2024, 1, 2, 8, 1)));
    }

    #[test]
    fn test_next_settlement_and_time_to() {
        assert_eq!(next_funding_settlement(ts(2024, 1, 2, 3, 30)), ts(2024, 1, 2, 8, 0));
        assert_eq!(next_funding_settlement(ts(2024, 1, 2, 20, 0)), ts(2024, 1, 3, 0, 0));
        // Exactly on a settlement: the next one.
        assert_eq!(next_funding_settlement(ts(2024, 1, 2, 8, 0)), ts(2024, 1, 2, 16, 0));

        assert!((time_to_next_settlement(ts(2024, 1, 2, 3, 30)) - 4.5).abs() < 1e-9);
        assert!((time_to_next_settlement(ts(2024, 1, 2, 8, 0)) - 8.0).abs() < 1e-9);
    }

    #[test]
    fn test_settlements_in_range() {
        // 01:00 -> 17:00 covers 08:00 and 16:00.
        let settlements = funding_settlements_in_range(
            ts(2024, 1, 2, 1, 0).timestamp_millis(),
            ts(2024, 1, 2, 17, 0).timestamp_millis(),
        );
        assert_eq!(settlements.len(), 2);
        assert_eq!(settlements[0], ts(2024, 1, 2, 8, 0).timestamp_millis());
        assert_eq!(settlements[1], ts(2024, 1, 2, 16, 0).timestamp_millis());

        assert_eq!(
            count_funding_settlements_in_range(ts(2024, 1, 2, 0, 0), ts(2024, 1, 2, 23, 59)),
            3
        );
    }

    #[test]
    fn test_zero_length_window_no_events() {
        let table = FundingTable::from_rates([(ts(2024, 1, 2, 8, 0).timestamp_millis(), 0.0001)]);
        let at = ts(2024, 1, 2, 8, 0).timestamp_millis();
        assert!(table.events_in_window("BTCUSDT", Some(at), at).is_empty());
    }

    #[test]
    fn test_events_window_bounds_exclusive_inclusive() {
        let settlement = ts(2024, 1, 2, 8, 0).timestamp_millis();
        let table = FundingTable::from_rates([(settlement, 0.0001)]);

        // Window ending exactly at the settlement includes it.
        let events = table.events_in_window("BTCUSDT", Some(settlement - 1), settlement);
        assert_eq!(events.len(), 1);

        // Window starting at the settlement excludes it.
        let events = table.events_in_window("BTCUSDT", Some(settlement), settlement + 1);
        assert!(events.is_empty());
    }

    #[test]
    fn test_funding_applied_once_per_window() {
        // S6: position open over a 9h span covering the 08:00 settlement.
        let settlement = ts(2024, 1, 2, 8, 0);
        let table = FundingTable::from_rates([(settlement.timestamp_millis(), 0.0001)]);
        let events = table.events_in_window(
            "BTCUSDT",
            Some(ts(2024, 1, 2, 7, 45).timestamp_millis()),
            ts(2024, 1, 2, 8, 0).timestamp_millis(),
        );
        assert_eq!(events.len(), 1);

        let model = FundingModel::default();
        let pos = position(OrderSide::Long);
        let result = model.apply_events(
            &events,
            Some(ts(2024, 1, 2, 7, 45)),
            ts(2024, 1, 2, 8, 0),
            Some(&pos),
        );
        assert_eq!(result.events_applied.len(), 1);
        // Long pays positive rate: 0.25 * 40000 * 0.0001 = 1.0 USDT cost.
        assert!((result.funding_pnl - (-1.0)).abs() < 1e-9);
    }

    #[test]
    fn test_funding_direction_short_receives() {
        let settlement = ts(2024, 1, 2, 8, 0);
        let events = vec![FundingEvent {
            timestamp: settlement,
            symbol: "BTCUSDT".to_string(),
            funding_rate: 0.0001,
        }];
        let model = FundingModel::default();
        let pos = position(OrderSide::Short);
        let result = model.apply_events(&events, None, settlement, Some(&pos));
        assert!((result.funding_pnl - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_no_position_no_funding() {
        let settlement = ts(2024, 1, 2, 8, 0);
        let events = vec![FundingEvent {
            timestamp: settlement,
            symbol: "BTCUSDT".to_string(),
            funding_rate: 0.0001,
        }];
        let model = FundingModel::default();
        let result = model.apply_events(&events, None, settlement, None);
        assert_eq!(result.funding_pnl, 0.0);
        assert!(result.events_applied.is_empty());
    }
}
