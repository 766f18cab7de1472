//! Exchange-side metrics: running execution-quality and cost totals.
//!
//! These are exchange/execution metrics only; strategy-level metrics derive
//! from the trade stream elsewhere.

use serde::{Deserialize, Serialize};

use crate::sim::types::{Fill, FillReason, StepResult};

/// Snapshot of exchange metrics at a point in time (all USDT).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExchangeMetricsSnapshot {
    pub total_slippage_usdt: f64,
    pub avg_slippage_bps: f64,
    pub max_slippage_bps: f64,

    pub total_fees_usdt: f64,
    pub entry_fees_usdt: f64,
    pub exit_fees_usdt: f64,

    pub total_funding_pnl_usdt: f64,
    pub funding_events_count: u64,

    pub liquidation_count: u64,
    pub liquidation_fees_usdt: f64,

    pub total_fills: u64,
    pub entry_fills: u64,
    pub exit_fills: u64,

    pub total_rejections: u64,
    pub margin_rejections: u64,

    pub total_volume_usdt: f64,
}

/// Collects and aggregates exchange-side metrics, updated per bar.
#[derive(Debug, Default)]
pub struct ExchangeMetrics {
    slippage_usdt: f64,
    slippage_bps_sum: f64,
    slippage_bps_max: f64,
    slippage_samples: u64,

    entry_fees: f64,
    exit_fees: f64,

    funding_pnl: f64,
    funding_count: u64,

    liquidation_count: u64,
    liquidation_fees: f64,

    entry_fills: u64,
    exit_fills: u64,

    total_rejections: u64,
    margin_rejections: u64,

    total_volume: f64,
}

impl ExchangeMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record everything from one step result.
    pub fn record_step(&mut self, step: &StepResult) {
        for fill in &step.fills {
            self.record_fill(fill);
        }

        for rejection in &step.rejections {
            self.total_rejections += 1;
            if rejection.code.contains("INSUFFICIENT") || rejection.code.contains("MARGIN") {
                self.margin_rejections += 1;
            }
        }

        self.funding_pnl += step.funding_result.funding_pnl;
        self.funding_count += step.funding_result.events_applied.len() as u64;

        if step.liquidation_result.liquidated {
            self.liquidation_count += 1;
            if let Some(event) = &step.liquidation_result.event {
                self.liquidation_fees += event.liquidation_fee;
            }
        }
    }

    fn record_fill(&mut self, fill: &Fill) {
        self.total_volume += fill.size_usdt;

        if fill.slippage > 0.0 && fill.price > 0.0 {
            self.slippage_usdt += fill.slippage * fill.size;
            let bps = fill.slippage / fill.price * 10_000.0;
            self.slippage_bps_sum += bps;
            self.slippage_bps_max = self.slippage_bps_max.max(bps);
            self.slippage_samples += 1;
        }

        if fill.reason == FillReason::Entry {
            self.entry_fills += 1;
            self.entry_fees += fill.fee;
        } else {
            self.exit_fills += 1;
            self.exit_fees += fill.fee;
        }
    }

    pub fn snapshot(&self) -> ExchangeMetricsSnapshot {
        ExchangeMetricsSnapshot {
            total_slippage_usdt: self.slippage_usdt,
            avg_slippage_bps: if self.slippage_samples > 0 {
                self.slippage_bps_sum / self.slippage_samples as f64
            } else {
                0.0
            },
            max_slippage_bps: self.slippage_bps_max,
            total_fees_usdt: self.entry_fees + self.exit_fees,
            entry_fees_usdt: self.entry_fees,
            exit_fees_usdt: self.exit_fees,
            total_funding_pnl_usdt: self.funding_pnl,
            funding_events_count: self.funding_count,
            liquidation_count: self.liquidation_count,
            liquidation_fees_usdt: self.liquidation_fees,
            total_fills: self.entry_fills + self.exit_fills,
            entry_fills: self.entry_fills,
            exit_fills: self.exit_fills,
            total_rejections: self.total_rejections,
            margin_rejections: self.margin_rejections,
            total_volume_usdt: self.total_volume,
        }
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::types::{
        FundingEvent, FundingResult, LiquidationResult, OrderSide, Rejection,
    };
    use chrono::{TimeZone, Utc};

    fn fill(reason: FillReason, fee: f64, slippage: f64) -> Fill {
        Fill {
            fill_id: "fill-000001".to_string(),
            order_id: "order-000001".to_string(),
            symbol: "BTCUSDT".to_string(),
            side: OrderSide::Long,
            price: 40_000.0,
            size: 0.25,
            size_usdt: 10_000.0,
            timestamp: Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap(),
            reason,
            fee,
            slippage,
        }
    }

    fn step(fills: Vec<Fill>, rejections: Vec<Rejection>, funding_pnl: f64) -> StepResult {
        StepResult {
            ts_close: Utc.with_ymd_and_hms(2024, 1, 2, 0, 15, 0).unwrap(),
            mark_price: 40_000.0,
            mark_price_source: "close".to_string(),
            fills,
            rejections,
            funding_result: FundingResult {
                funding_pnl,
                events_applied: if funding_pnl != 0.0 {
                    vec![FundingEvent {
                        timestamp: Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap(),
                        symbol: "BTCUSDT".to_string(),
                        funding_rate: 0.0001,
                    }]
                } else {
                    vec![]
                },
            },
            liquidation_result: LiquidationResult::default(),
            ledger_update: None,
            prices: None,
        }
    }

    #[test]
    fn test_fill_and_fee_accounting() {
        let mut metrics = ExchangeMetrics::new();
        metrics.record_step(&step(
            vec![fill(FillReason::Entry, 6.0, 20.0), fill(FillReason::TakeProfit, 6.0, 21.0)],
            vec![],
            0.0,
        ));

        let snap = metrics.snapshot();
        assert_eq!(snap.total_fills, 2);
        assert_eq!(snap.entry_fills, 1);
        assert_eq!(snap.exit_fills, 1);
        assert_eq!(snap.entry_fees_usdt, 6.0);
        assert_eq!(snap.total_fees_usdt, 12.0);
        assert_eq!(snap.total_volume_usdt, 20_000.0);
        assert!(snap.avg_slippage_bps > 0.0);
        assert!(snap.max_slippage_bps >= snap.avg_slippage_bps);
    }

    #[test]
    fn test_rejection_classification() {
        let mut metrics = ExchangeMetrics::new();
        let rejection = |code: &str| Rejection {
            order_id: "order-000001".to_string(),
            reason: "r".to_string(),
            code: code.to_string(),
            timestamp: Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap(),
        };
        metrics.record_step(&step(
            vec![],
            vec![
                rejection("INSUFFICIENT_ENTRY_GATE"),
                rejection("LIQUIDITY_EXCEEDED"),
            ],
            0.0,
        ));
        let snap = metrics.snapshot();
        assert_eq!(snap.total_rejections, 2);
        assert_eq!(snap.margin_rejections, 1);
    }

    #[test]
    fn test_funding_totals() {
        let mut metrics = ExchangeMetrics::new();
        metrics.record_step(&step(vec![], vec![], -1.0));
        metrics.record_step(&step(vec![], vec![], -1.5));
        let snap = metrics.snapshot();
        assert_eq!(snap.funding_events_count, 2);
        assert!((snap.total_funding_pnl_usdt + 2.5).abs() < 1e-9);
    }
}
