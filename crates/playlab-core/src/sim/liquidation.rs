//! Liquidation: mark-triggered forced closure at bankruptcy.
//!
//! Triggered when `equity <= maintenance_margin` with a position open. The
//! position closes at the mark price with a liquidation fee of
//! `position_value x liquidation_fee_rate`. No ADL, no partial liquidation.

use crate::sim::types::{
    Fill, FillReason, LedgerState, LiquidationEvent, LiquidationResult, OrderSide, Position,
    PriceSnapshot,
};

#[derive(Debug, Clone, Copy)]
pub struct LiquidationConfig {
    pub liquidation_fee_rate: f64,
}

impl Default for LiquidationConfig {
    fn default() -> Self {
        Self {
            liquidation_fee_rate: 0.0006,
        }
    }
}

#[derive(Debug)]
pub struct LiquidationModel {
    config: LiquidationConfig,
    liq_counter: u64,
}

impl LiquidationModel {
    pub fn new(config: LiquidationConfig) -> Self {
        Self {
            config,
            liq_counter: 0,
        }
    }

    pub fn is_liquidatable(equity_usdt: f64, maintenance_margin_usdt: f64) -> bool {
        maintenance_margin_usdt > 0.0 && equity_usdt <= maintenance_margin_usdt
    }

    /// Check the liquidation condition and build the forced-close records.
    ///
    /// The returned fill/event are not yet applied to the ledger; the
    /// orchestrator owns that ordering.
    pub fn check_liquidation(
        &mut self,
        ledger_state: &LedgerState,
        prices: &PriceSnapshot,
        position: Option<&Position>,
    ) -> LiquidationResult {
        let mut result = LiquidationResult::default();

        let position = match position {
            Some(p) => p,
            None => return result,
        };

        if !Self::is_liquidatable(ledger_state.equity_usdt, ledger_state.maintenance_margin_usdt) {
            return result;
        }

        result.liquidated = true;

        let position_value = position.size * prices.mark_price;
        let liquidation_fee = position_value * self.config.liquidation_fee_rate;
        let bankruptcy_price =
            Self::bankruptcy_price(position, ledger_state.cash_balance_usdt);

        result.event = Some(LiquidationEvent {
            timestamp: prices.timestamp,
            symbol: position.symbol.clone(),
            side: position.side,
            mark_price: prices.mark_price,
            bankruptcy_price,
            equity_usdt: ledger_state.equity_usdt,
            maintenance_margin_usdt: ledger_state.maintenance_margin_usdt,
            liquidation_fee,
        });

        self.liq_counter += 1;
        result.fill = Some(Fill {
            fill_id: format!("liq-{:06}", self.liq_counter),
            order_id: String::new(),
            symbol: position.symbol.clone(),
            side: position.side,
            price: prices.mark_price,
            size: position.size,
            size_usdt: position.size_usdt,
            timestamp: prices.timestamp,
            reason: FillReason::Liquidation,
            fee: liquidation_fee,
            slippage: 0.0,
        });

        result
    }

    /// Price at which equity reaches zero for the position.
    pub fn bankruptcy_price(position: &Position, cash_balance_usdt: f64) -> f64 {
        if position.size == 0.0 {
            return 0.0;
        }
        let price_buffer = cash_balance_usdt / position.size;
        let price = match position.side {
            OrderSide::Long => position.entry_price - price_buffer,
            OrderSide::Short => position.entry_price + price_buffer,
        };
        price.max(0.0)
    }

    /// Liquidation-price estimate:
    /// long:  `entry - (cash - size x entry x MMR) / size`
    /// short: `entry + (cash - size x entry x MMR) / size`
    /// clamped at zero.
    pub fn calculate_liquidation_price(
        position: &Position,
        cash_balance_usdt: f64,
        maintenance_margin_rate: f64,
    ) -> f64 {
        let entry = position.entry_price;
        let size = position.size;
        if size == 0.0 {
            return 0.0;
        }

        let mm_at_entry = size * entry * maintenance_margin_rate;
        let price_buffer = (cash_balance_usdt - mm_at_entry) / size;

        let liq_price = match position.side {
            OrderSide::Long => entry - price_buffer,
            OrderSide::Short => entry + price_buffer,
        };
        liq_price.max(0.0)
    }
}

impl Default for LiquidationModel {
    fn default() -> Self {
        Self::new(LiquidationConfig::default())
    }
}
