//! Core types for the simulated exchange.
//!
//! All monetary values are in USDT (quote currency); fields carry the
//! `_usdt` suffix. This simulator supports USDT-quoted linear perpetuals
//! only, isolated margin.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Order identifier (sequential within one exchange instance, so runs stay
/// bit-reproducible).
pub type OrderId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderType {
    Market,
    Limit,
    StopMarket,
    StopLimit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderSide {
    Long,
    Short,
}

impl OrderSide {
    pub fn opposite(&self) -> OrderSide {
        match self {
            OrderSide::Long => OrderSide::Short,
            OrderSide::Short => OrderSide::Long,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Pending,
    Filled,
    Cancelled,
    Rejected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimeInForce {
    #[serde(rename = "GTC")]
    Gtc,
    #[serde(rename = "IOC")]
    Ioc,
    #[serde(rename = "FOK")]
    Fok,
    #[serde(rename = "PostOnly")]
    PostOnly,
}

impl Default for TimeInForce {
    fn default() -> Self {
        TimeInForce::Gtc
    }
}

/// Trigger direction for conditional orders (Bybit semantics).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerDirection {
    /// Trigger when bar.high >= trigger_price (breakout)
    RisesTo,
    /// Trigger when bar.low <= trigger_price (breakdown)
    FallsTo,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FillReason {
    Entry,
    #[serde(rename = "sl")]
    StopLoss,
    #[serde(rename = "tp")]
    TakeProfit,
    Signal,
    EndOfData,
    Liquidation,
    ForceClose,
}

/// How an exit price was derived, recorded on the trade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitPriceSource {
    TpLevel,
    SlLevel,
    MarkPrice,
    BarClose,
    Signal,
}

/// Engine-wide stop reasons.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    EndOfData,
    StrategyStarved,
    Liquidated,
    InsufficientMargin,
    Manual,
    MaxRuntime,
}

/// Order waiting in the book.
///
/// Invariants checked at submission: LIMIT/STOP_LIMIT require `limit_price`;
/// STOP_* require `trigger_price` and `trigger_direction`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub order_id: OrderId,
    pub symbol: String,
    pub side: OrderSide,
    pub size_usdt: f64,
    pub order_type: OrderType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit_price: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trigger_price: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trigger_direction: Option<TriggerDirection>,
    #[serde(default)]
    pub time_in_force: TimeInForce,
    #[serde(default)]
    pub reduce_only: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_loss: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub take_profit: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    pub status: OrderStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub submission_bar_index: Option<i64>,
}

impl Order {
    /// Conditional (stop) order?
    pub fn is_conditional(&self) -> bool {
        matches!(self.order_type, OrderType::StopMarket | OrderType::StopLimit)
    }
}

/// Currently open position (at most one per symbol in this scope).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub position_id: String,
    pub symbol: String,
    pub side: OrderSide,
    pub entry_price: f64,
    pub entry_time: DateTime<Utc>,
    /// Base currency units
    pub size: f64,
    pub size_usdt: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_loss: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub take_profit: Option<f64>,
    pub fees_paid: f64,
    pub entry_fee: f64,
    pub entry_bar_index: i64,
    /// MAE/MFE tracking over the position lifetime
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_price: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_price: Option<f64>,
    /// Cumulative funding PnL applied at 8h settlements
    pub funding_pnl_cumulative: f64,
    /// Original SL before trailing / break-even adjustments
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initial_stop: Option<f64>,
    pub trailing_active: bool,
    pub be_activated: bool,
    pub tp_order_type: String,
    pub sl_order_type: String,
}

impl Position {
    /// Unrealized PnL at the given mark price.
    pub fn unrealized_pnl(&self, mark_price: f64) -> f64 {
        match self.side {
            OrderSide::Long => (mark_price - self.entry_price) * self.size,
            OrderSide::Short => (self.entry_price - mark_price) * self.size,
        }
    }

    /// Track bar extremes for MAE/MFE.
    pub fn observe_range(&mut self, low: f64, high: f64) {
        self.min_price = Some(self.min_price.map_or(low, |m| m.min(low)));
        self.max_price = Some(self.max_price.map_or(high, |m| m.max(high)));
    }
}

/// Record of a single fill event (entry or exit).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fill {
    pub fill_id: String,
    pub order_id: OrderId,
    pub symbol: String,
    pub side: OrderSide,
    pub price: f64,
    pub size: f64,
    pub size_usdt: f64,
    pub timestamp: DateTime<Utc>,
    pub reason: FillReason,
    pub fee: f64,
    pub slippage: f64,
}

/// Scheduled funding settlement applied to an open position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FundingEvent {
    pub timestamp: DateTime<Utc>,
    pub symbol: String,
    pub funding_rate: f64,
}

/// Mark-triggered forced closure record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LiquidationEvent {
    pub timestamp: DateTime<Utc>,
    pub symbol: String,
    pub side: OrderSide,
    pub mark_price: f64,
    pub bankruptcy_price: f64,
    pub equity_usdt: f64,
    pub maintenance_margin_usdt: f64,
    pub liquidation_fee: f64,
}

/// Point-in-time price references for one bar.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceSnapshot {
    pub timestamp: DateTime<Utc>,
    pub mark_price: f64,
    pub last_price: f64,
    pub mid_price: f64,
    pub bid_price: f64,
    pub ask_price: f64,
    pub spread: f64,
}

/// Single point in the deterministic intrabar path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PricePoint {
    pub timestamp: DateTime<Utc>,
    pub price: f64,
    pub sequence: u8,
}

/// Order rejection record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rejection {
    pub order_id: OrderId,
    pub reason: String,
    pub code: String,
    pub timestamp: DateTime<Utc>,
}

/// Result of order execution within a bar.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FillResult {
    pub fills: Vec<Fill>,
    pub rejections: Vec<Rejection>,
}

/// Result of funding application for one bar window.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FundingResult {
    pub funding_pnl: f64,
    pub events_applied: Vec<FundingEvent>,
}

/// Result of the liquidation check.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LiquidationResult {
    pub liquidated: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event: Option<LiquidationEvent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fill: Option<Fill>,
}

/// Complete ledger state at a point in time.
///
/// Bybit-aligned margin model:
/// - equity = cash + unrealized
/// - free = equity - used
/// - available = max(0, free)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerState {
    pub cash_balance_usdt: f64,
    pub unrealized_pnl_usdt: f64,
    pub equity_usdt: f64,
    pub used_margin_usdt: f64,
    pub free_margin_usdt: f64,
    pub available_balance_usdt: f64,
    pub maintenance_margin_usdt: f64,
    pub total_fees_paid: f64,
}

/// Result of a ledger mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerUpdate {
    pub state: LedgerState,
    pub realized_pnl: f64,
    pub fees_paid: f64,
    pub funding_paid: f64,
}

/// Result of processing a single bar.
///
/// `mark_price` is computed exactly once per step and reused for MTM and
/// liquidation; `mark_price_source` records how it was derived.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    pub ts_close: DateTime<Utc>,
    pub mark_price: f64,
    pub mark_price_source: String,
    pub fills: Vec<Fill>,
    pub rejections: Vec<Rejection>,
    pub funding_result: FundingResult,
    pub liquidation_result: LiquidationResult,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ledger_update: Option<LedgerUpdate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prices: Option<PriceSnapshot>,
}

/// Closed-trade record derived on position close.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trade {
    pub trade_id: String,
    pub symbol: String,
    pub side: OrderSide,
    pub entry_time: DateTime<Utc>,
    pub entry_price: f64,
    pub entry_size: f64,
    pub entry_size_usdt: f64,
    pub exit_time: DateTime<Utc>,
    pub exit_price: f64,
    pub exit_reason: FillReason,
    pub exit_price_source: ExitPriceSource,
    pub realized_pnl: f64,
    pub fees_paid: f64,
    pub net_pnl: f64,
    pub funding_pnl: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_loss: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub take_profit: Option<f64>,
    pub entry_bar_index: i64,
    pub exit_bar_index: i64,
}

/// One point of the equity curve.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EquityPoint {
    pub ts_ms: i64,
    pub equity: f64,
}

/// Strategy-facing view of the exchange state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExchangeStateView {
    pub symbol: String,
    pub ledger: LedgerState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<Position>,
    pub pending_order_count: usize,
    pub entries_disabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entries_disabled_reason: Option<StopReason>,
    pub entry_attempts_count: u64,
    pub entry_rejections_count: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_rejection_code: Option<String>,
    pub leverage: f64,
    pub is_liquidatable: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn position(side: OrderSide) -> Position {
        Position {
            position_id: "pos-0001".to_string(),
            symbol: "BTCUSDT".to_string(),
            side,
            entry_price: 40_000.0,
            entry_time: Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap(),
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
    fn test_unrealized_pnl_signs() {
        let long = position(OrderSide::Long);
        assert_eq!(long.unrealized_pnl(41_000.0), 250.0);
        assert_eq!(long.unrealized_pnl(39_000.0), -250.0);

        let short = position(OrderSide::Short);
        assert_eq!(short.unrealized_pnl(41_000.0), -250.0);
        assert_eq!(short.unrealized_pnl(39_000.0), 250.0);
    }

    #[test]
    fn test_observe_range_tracks_extremes() {
        let mut pos = position(OrderSide::Long);
        pos.observe_range(39_500.0, 40_500.0);
        pos.observe_range(39_000.0, 40_200.0);
        assert_eq!(pos.min_price, Some(39_000.0));
        assert_eq!(pos.max_price, Some(40_500.0));
    }

    #[test]
    fn test_fill_reason_serde_short_forms() {
        assert_eq!(
            serde_json::to_string(&FillReason::StopLoss).unwrap(),
            "\"sl\""
        );
        assert_eq!(
            serde_json::to_string(&FillReason::TakeProfit).unwrap(),
            "\"tp\""
        );
        assert_eq!(
            serde_json::to_string(&FillReason::EndOfData).unwrap(),
            "\"end_of_data\""
        );
    }

    #[test]
    fn test_time_in_force_serde() {
        assert_eq!(serde_json::to_string(&TimeInForce::Gtc).unwrap(), "\"GTC\"");
        assert_eq!(
            serde_json::to_string(&TimeInForce::PostOnly).unwrap(),
            "\"PostOnly\""
        );
    }
}
