//! Execution: slippage, impact, liquidity, and order fills.
//!
//! Entry fills happen at `bar.ts_open`, gated on available margin. Exit fills
//! happen at `bar.ts_open` with the price derived from the exit reason.
//! Fees use notional (`size_usdt`) on both legs for symmetry.

use chrono::{DateTime, Utc};

use crate::bar::Bar;
use crate::sim::pricing::IntrabarPath;
use crate::sim::types::{
    Fill, FillReason, FillResult, Order, OrderSide, Position, Rejection,
};

/// Rejection code when the entry gate fails.
pub const CODE_INSUFFICIENT_ENTRY_GATE: &str = "INSUFFICIENT_ENTRY_GATE";
/// Rejection code when the liquidity cap would force a partial fill.
pub const CODE_LIQUIDITY_EXCEEDED: &str = "LIQUIDITY_EXCEEDED";

/// Fixed slippage in basis points, direction-aware.
#[derive(Debug, Clone, Copy)]
pub struct SlippageConfig {
    pub fixed_bps: f64,
}

impl Default for SlippageConfig {
    fn default() -> Self {
        Self { fixed_bps: 5.0 }
    }
}

#[derive(Debug)]
pub struct SlippageModel {
    config: SlippageConfig,
}

impl SlippageModel {
    pub fn new(config: SlippageConfig) -> Self {
        Self { config }
    }

    pub fn slippage_rate(&self) -> f64 {
        self.config.fixed_bps / 10_000.0
    }

    /// Entry: longs pay up, shorts receive less.
    pub fn apply_entry(&self, price: f64, side: OrderSide) -> f64 {
        let amount = price * self.slippage_rate();
        match side {
            OrderSide::Long => price + amount,
            OrderSide::Short => price - amount,
        }
    }

    /// Exit inverts the direction: closing a long receives less, closing a
    /// short pays up.
    pub fn apply_exit(&self, price: f64, position_side: OrderSide) -> f64 {
        let amount = price * self.slippage_rate();
        match position_side {
            OrderSide::Long => price - amount,
            OrderSide::Short => price + amount,
        }
    }
}

/// Market impact as a multiplier (>= 1) on base slippage. Disabled by
/// default. Volume is used only for liquidity/impact estimation, never for
/// directional inference.
#[derive(Debug, Clone, Copy)]
pub struct ImpactConfig {
    pub enabled: bool,
    pub linear_factor: f64,
    pub max_impact_bps: f64,
}

impl Default for ImpactConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            linear_factor: 0.1,
            max_impact_bps: 100.0,
        }
    }
}

#[derive(Debug)]
pub struct ImpactModel {
    config: ImpactConfig,
}

impl ImpactModel {
    pub fn new(config: ImpactConfig) -> Self {
        Self { config }
    }

    pub fn get_impact_multiplier(&self, size_usdt: f64, bar: &Bar) -> f64 {
        if !self.config.enabled {
            return 1.0;
        }
        let bar_volume_usdt = bar.volume * bar.close;
        if bar_volume_usdt <= 0.0 {
            return 1.0;
        }
        let volume_fraction = size_usdt / bar_volume_usdt;
        let impact = 1.0 + volume_fraction * self.config.linear_factor;
        let max_multiplier = 1.0 + self.config.max_impact_bps / 10_000.0;
        impact.min(max_multiplier)
    }
}

/// Liquidity cap on fillable size as a fraction of bar volume (in USDT).
/// Disabled by default; with the cap enabled, oversized orders are rejected
/// rather than silently clipped (no partial-fill arithmetic in v1).
#[derive(Debug, Clone, Copy)]
pub struct LiquidityConfig {
    pub enabled: bool,
    pub max_volume_fraction: f64,
    pub min_fill_usdt: f64,
}

impl Default for LiquidityConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_volume_fraction: 0.10,
            min_fill_usdt: 1.0,
        }
    }
}

#[derive(Debug)]
pub struct LiquidityModel {
    config: LiquidityConfig,
}

impl LiquidityModel {
    pub fn new(config: LiquidityConfig) -> Self {
        Self { config }
    }

    /// Maximum fillable size in USDT for this bar.
    pub fn get_max_fillable(&self, size_usdt: f64, bar: &Bar) -> f64 {
        if !self.config.enabled {
            return size_usdt;
        }
        let bar_volume_usdt = bar.volume * bar.close;
        if bar_volume_usdt <= 0.0 {
            return size_usdt;
        }
        let max_liquidity = (bar_volume_usdt * self.config.max_volume_fraction)
            .max(self.config.min_fill_usdt);
        size_usdt.min(max_liquidity)
    }

    pub fn would_be_partial_fill(&self, size_usdt: f64, bar: &Bar) -> bool {
        self.get_max_fillable(size_usdt, bar) < size_usdt
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ExecutionModelConfig {
    pub slippage: SlippageConfig,
    pub impact: ImpactConfig,
    pub liquidity: LiquidityConfig,
    pub taker_fee_rate: f64,
}

impl Default for ExecutionModelConfig {
    fn default() -> Self {
        Self {
            slippage: SlippageConfig::default(),
            impact: ImpactConfig::default(),
            liquidity: LiquidityConfig::default(),
            taker_fee_rate: 0.0006,
        }
    }
}

/// Handles order fills with slippage, impact, and liquidity checks.
#[derive(Debug)]
pub struct ExecutionModel {
    config: ExecutionModelConfig,
    slippage: SlippageModel,
    impact: ImpactModel,
    liquidity: LiquidityModel,
    intrabar: IntrabarPath,
    fill_counter: u64,
}

impl ExecutionModel {
    pub fn new(config: ExecutionModelConfig) -> Self {
        Self {
            config,
            slippage: SlippageModel::new(config.slippage),
            impact: ImpactModel::new(config.impact),
            liquidity: LiquidityModel::new(config.liquidity),
            intrabar: IntrabarPath::new(),
            fill_counter: 0,
        }
    }

    fn next_fill_id(&mut self) -> String {
        self.fill_counter += 1;
        format!("fill-{:06}", self.fill_counter)
    }

    /// Fill a pending entry order at the given base price (bar open for
    /// market orders, the trigger/limit level for conditional fills).
    ///
    /// Rejects with `INSUFFICIENT_ENTRY_GATE` when the available balance
    /// cannot cover `required_usdt`, and with `LIQUIDITY_EXCEEDED` when the
    /// liquidity cap would force a partial fill.
    pub fn fill_entry_order(
        &mut self,
        order: &Order,
        bar: &Bar,
        base_price: f64,
        available_balance_usdt: f64,
        required_usdt: f64,
    ) -> FillResult {
        let mut result = FillResult::default();
        let fill_ts = bar.ts_open;

        if available_balance_usdt < required_usdt {
            result.rejections.push(Rejection {
                order_id: order.order_id.clone(),
                reason: format!(
                    "Insufficient margin: available={:.2} < required={:.2}",
                    available_balance_usdt, required_usdt
                ),
                code: CODE_INSUFFICIENT_ENTRY_GATE.to_string(),
                timestamp: fill_ts,
            });
            return result;
        }

        if self.liquidity.would_be_partial_fill(order.size_usdt, bar) {
            let fillable = self.liquidity.get_max_fillable(order.size_usdt, bar);
            result.rejections.push(Rejection {
                order_id: order.order_id.clone(),
                reason: format!(
                    "Order size {:.2} exceeds fillable liquidity {:.2}",
                    order.size_usdt, fillable
                ),
                code: CODE_LIQUIDITY_EXCEEDED.to_string(),
                timestamp: fill_ts,
            });
            return result;
        }

        let impact = self.impact.get_impact_multiplier(order.size_usdt, bar);
        let slipped = self.slippage.apply_entry(base_price, order.side);
        // Impact widens the slippage component, never the base price.
        let fill_price = base_price + (slipped - base_price) * impact;

        let size = order.size_usdt / fill_price;
        let fee = order.size_usdt * self.config.taker_fee_rate;

        result.fills.push(Fill {
            fill_id: self.next_fill_id(),
            order_id: order.order_id.clone(),
            symbol: order.symbol.clone(),
            side: order.side,
            price: fill_price,
            size,
            size_usdt: order.size_usdt,
            timestamp: fill_ts,
            reason: FillReason::Entry,
            fee,
            slippage: (fill_price - base_price).abs(),
        });

        result
    }

    /// TP/SL check for an open position, delegated to the intrabar path.
    pub fn check_tp_sl(&self, position: &Position, bar: &Bar) -> Option<FillReason> {
        self.intrabar
            .check_tp_sl(bar, position.side, position.take_profit, position.stop_loss)
    }

    /// Exit price for a triggered TP/SL, before slippage.
    pub fn exit_price_for(&self, position: &Position, bar: &Bar, reason: FillReason) -> f64 {
        self.intrabar
            .get_exit_price(bar, reason, position.take_profit, position.stop_loss)
    }

    /// Fill a position exit at the given base price with exit slippage.
    pub fn fill_exit(
        &mut self,
        position: &Position,
        base_price: f64,
        fill_ts: DateTime<Utc>,
        reason: FillReason,
    ) -> Fill {
        let fill_price = self.slippage.apply_exit(base_price, position.side);
        let fee = position.size_usdt * self.config.taker_fee_rate;

        Fill {
            fill_id: self.next_fill_id(),
            // Exit fills close a position, not a booked order.
            order_id: String::new(),
            symbol: position.symbol.clone(),
            side: position.side,
            price: fill_price,
            size: position.size,
            size_usdt: position.size_usdt,
            timestamp: fill_ts,
            reason,
            fee,
            slippage: (fill_price - base_price).abs(),
        }
    }

    /// Realized PnL: `(exit - entry) x size` for longs, inverted for shorts.
    pub fn calculate_realized_pnl(&self, position: &Position, exit_price: f64) -> f64 {
        let price_diff = match position.side {
            OrderSide::Long => exit_price - position.entry_price,
            OrderSide::Short => position.entry_price - exit_price,
        };
        price_diff * position.size
    }

    pub fn taker_fee_rate(&self) -> f64 {
        self.config.taker_fee_rate
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::types::{OrderStatus, OrderType, TimeInForce};
    use chrono::{TimeZone, Utc};

    fn bar(open: f64, high: f64, low: f64, close: f64, volume: f64) -> Bar {
        Bar::new(
            "BTCUSDT",
            "15m",
            Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2024, 1, 2, 0, 15, 0).unwrap(),
            open,
            high,
            low,
            close,
            volume,
        )
    }

    fn order(side: OrderSide, size_usdt: f64) -> Order {
        Order {
            order_id: "order-000001".to_string(),
            symbol: "BTCUSDT".to_string(),
            side,
            size_usdt,
            order_type: OrderType::Market,
            limit_price: None,
            trigger_price: None,
            trigger_direction: None,
            time_in_force: TimeInForce::Gtc,
            reduce_only: false,
            stop_loss: None,
            take_profit: None,
            created_at: None,
            status: OrderStatus::Pending,
            submission_bar_index: Some(0),
        }
    }

    fn position(side: OrderSide, entry: f64, size_usdt: f64) -> Position {
        Position {
            position_id: "pos-0001".to_string(),
            symbol: "BTCUSDT".to_string(),
            side,
            entry_price: entry,
            entry_time: Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap(),
            size: size_usdt / entry,
            size_usdt,
            stop_loss: Some(entry * 0.975),
            take_profit: Some(entry * 1.05),
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
    fn test_slippage_directions() {
        let model = SlippageModel::new(SlippageConfig { fixed_bps: 10.0 });
        assert!((model.apply_entry(100.0, OrderSide::Long) - 100.1).abs() < 1e-9);
        assert!((model.apply_entry(100.0, OrderSide::Short) - 99.9).abs() < 1e-9);
        assert!((model.apply_exit(100.0, OrderSide::Long) - 99.9).abs() < 1e-9);
        assert!((model.apply_exit(100.0, OrderSide::Short) - 100.1).abs() < 1e-9);
    }

    #[test]
    fn test_entry_fill_accepted() {
        let mut exec = ExecutionModel::new(ExecutionModelConfig::default());
        let b = bar(40_200.0, 42_100.0, 39_900.0, 41_500.0, 1_000.0);
        let o = order(OrderSide::Long, 10_000.0);
        let result = exec.fill_entry_order(&o, &b, b.open, 20_000.0, 5_006.0);

        assert!(result.rejections.is_empty());
        assert_eq!(result.fills.len(), 1);
        let fill = &result.fills[0];
        assert_eq!(fill.reason, FillReason::Entry);
        assert_eq!(fill.timestamp, b.ts_open);
        // 5 bps slippage on 40200
        assert!((fill.price - 40_200.0 * 1.0005).abs() < 1e-6);
        assert!((fill.size - 10_000.0 / fill.price).abs() < 1e-12);
        assert!((fill.fee - 6.0).abs() < 1e-9);
    }

    #[test]
    fn test_entry_gate_rejection() {
        let mut exec = ExecutionModel::new(ExecutionModelConfig::default());
        let b = bar(40_200.0, 42_100.0, 39_900.0, 41_500.0, 1_000.0);
        let o = order(OrderSide::Long, 10_000.0);
        // S4: available 5000 < required 5006.
        let result = exec.fill_entry_order(&o, &b, b.open, 5_000.0, 5_006.0);
        assert!(result.fills.is_empty());
        assert_eq!(result.rejections.len(), 1);
        assert_eq!(result.rejections[0].code, CODE_INSUFFICIENT_ENTRY_GATE);
    }

    #[test]
    fn test_liquidity_cap_rejects_oversized() {
        let mut config = ExecutionModelConfig::default();
        config.liquidity = LiquidityConfig {
            enabled: true,
            max_volume_fraction: 0.10,
            min_fill_usdt: 1.0,
        };
        let mut exec = ExecutionModel::new(config);
        // Bar volume = 10 units * 100 = 1000 USDT; cap = 100 USDT.
        let b = bar(100.0, 101.0, 99.0, 100.0, 10.0);
        let o = order(OrderSide::Long, 500.0);
        let result = exec.fill_entry_order(&o, &b, b.open, 10_000.0, 250.0);
        assert!(result.fills.is_empty());
        assert_eq!(result.rejections[0].code, CODE_LIQUIDITY_EXCEEDED);
    }

    #[test]
    fn test_impact_multiplier_widens_slippage() {
        let mut config = ExecutionModelConfig::default();
        config.impact = ImpactConfig {
            enabled: true,
            linear_factor: 1.0,
            max_impact_bps: 10_000.0,
        };
        let mut exec = ExecutionModel::new(config);
        // Order is 50% of bar volume -> multiplier 1.5.
        let b = bar(100.0, 101.0, 99.0, 100.0, 200.0);
        let o = order(OrderSide::Long, 10_000.0);
        let result = exec.fill_entry_order(&o, &b, b.open, 100_000.0, 5_006.0);
        let fill = &result.fills[0];
        // Base slippage 5 bps * 1.5 = 7.5 bps.
        assert!((fill.price - 100.0 * 1.00075).abs() < 1e-9);
    }

    #[test]
    fn test_exit_fill_and_pnl_long() {
        let mut exec = ExecutionModel::new(ExecutionModelConfig::default());
        let pos = position(OrderSide::Long, 40_000.0, 10_000.0);
        let ts = Utc.with_ymd_and_hms(2024, 1, 2, 0, 15, 0).unwrap();
        let fill = exec.fill_exit(&pos, 42_000.0, ts, FillReason::TakeProfit);

        // Exit long: receive less.
        assert!(fill.price < 42_000.0);
        assert!((fill.fee - 6.0).abs() < 1e-9);

        let pnl = exec.calculate_realized_pnl(&pos, fill.price);
        assert!((pnl - (fill.price - 40_000.0) * pos.size).abs() < 1e-9);
        assert!(pnl > 0.0);
    }

    #[test]
    fn test_pnl_sign_short() {
        let exec = ExecutionModel::new(ExecutionModelConfig::default());
        let pos = position(OrderSide::Short, 40_000.0, 10_000.0);
        assert!(exec.calculate_realized_pnl(&pos, 38_000.0) > 0.0);
        assert!(exec.calculate_realized_pnl(&pos, 42_000.0) < 0.0);
    }

    #[test]
    fn test_check_tp_sl_delegates_conservatively() {
        let exec = ExecutionModel::new(ExecutionModelConfig::default());
        let pos = position(OrderSide::Long, 40_000.0, 10_000.0);
        // Both hit: SL wins.
        let b = bar(40_200.0, 42_100.0, 38_500.0, 39_000.0, 1_000.0);
        assert_eq!(exec.check_tp_sl(&pos, &b), Some(FillReason::StopLoss));
    }
}
