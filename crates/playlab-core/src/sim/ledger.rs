//! USDT accounting ledger with invariants.
//!
//! The ledger is the single source of truth for USDT state; all mutations go
//! through it. Invariants (recomputed after every mutation):
//!
//! 1. equity = cash + unrealized
//! 2. free_margin = equity - used_margin
//! 3. available = max(0, free_margin)
//! 4. cash changes only on fill PnL/fees and funding

use crate::sim::types::{LedgerState, LedgerUpdate, Position};

/// Configuration for ledger accounting.
#[derive(Debug, Clone, Copy)]
pub struct LedgerConfig {
    /// IMR = 1 / leverage
    pub initial_margin_rate: f64,
    /// MMR (0.5% Bybit default)
    pub maintenance_margin_rate: f64,
    pub taker_fee_rate: f64,
    /// Check invariants after every mutation; a violation is a programming
    /// error and panics.
    pub debug_check_invariants: bool,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            initial_margin_rate: 0.5,
            maintenance_margin_rate: 0.005,
            taker_fee_rate: 0.0006,
            debug_check_invariants: false,
        }
    }
}

/// USDT accounting ledger with a Bybit-aligned margin model.
#[derive(Debug)]
pub struct Ledger {
    config: LedgerConfig,

    cash_balance_usdt: f64,
    unrealized_pnl_usdt: f64,
    used_margin_usdt: f64,
    maintenance_margin_usdt: f64,
    total_fees_paid: f64,

    equity_usdt: f64,
    free_margin_usdt: f64,
    available_balance_usdt: f64,
}

impl Ledger {
    pub fn new(initial_capital: f64, config: LedgerConfig) -> Self {
        Self {
            config,
            cash_balance_usdt: initial_capital,
            unrealized_pnl_usdt: 0.0,
            used_margin_usdt: 0.0,
            maintenance_margin_usdt: 0.0,
            total_fees_paid: 0.0,
            equity_usdt: initial_capital,
            free_margin_usdt: initial_capital,
            available_balance_usdt: initial_capital.max(0.0),
        }
    }

    pub fn state(&self) -> LedgerState {
        LedgerState {
            cash_balance_usdt: self.cash_balance_usdt,
            unrealized_pnl_usdt: self.unrealized_pnl_usdt,
            equity_usdt: self.equity_usdt,
            used_margin_usdt: self.used_margin_usdt,
            free_margin_usdt: self.free_margin_usdt,
            available_balance_usdt: self.available_balance_usdt,
            maintenance_margin_usdt: self.maintenance_margin_usdt,
            total_fees_paid: self.total_fees_paid,
        }
    }

    /// Check all ledger invariants; returns violations (empty when clean).
    pub fn check_invariants(&self) -> Vec<String> {
        let mut errors = Vec::new();

        let expected_equity = self.cash_balance_usdt + self.unrealized_pnl_usdt;
        if (self.equity_usdt - expected_equity).abs() > 1e-8 {
            errors.push(format!(
                "equity ({:.8}) != cash ({:.8}) + unrealized ({:.8})",
                self.equity_usdt, self.cash_balance_usdt, self.unrealized_pnl_usdt
            ));
        }

        let expected_free = self.equity_usdt - self.used_margin_usdt;
        if (self.free_margin_usdt - expected_free).abs() > 1e-8 {
            errors.push(format!(
                "free_margin ({:.8}) != equity ({:.8}) - used ({:.8})",
                self.free_margin_usdt, self.equity_usdt, self.used_margin_usdt
            ));
        }

        let expected_available = self.free_margin_usdt.max(0.0);
        if (self.available_balance_usdt - expected_available).abs() > 1e-8 {
            errors.push(format!(
                "available ({:.8}) != max(0, free_margin) ({:.8})",
                self.available_balance_usdt, expected_available
            ));
        }

        errors
    }

    fn recompute_derived(&mut self) {
        self.equity_usdt = self.cash_balance_usdt + self.unrealized_pnl_usdt;
        self.free_margin_usdt = self.equity_usdt - self.used_margin_usdt;
        self.available_balance_usdt = self.free_margin_usdt.max(0.0);

        if self.config.debug_check_invariants {
            let errors = self.check_invariants();
            if !errors.is_empty() {
                panic!("Ledger invariant violation: {:?}", errors);
            }
        }
    }

    /// Mark-to-market: recompute unrealized, used, and maintenance margins.
    pub fn update_for_mark_price(&mut self, position: Option<&Position>, mark_price: f64) -> LedgerUpdate {
        match position {
            None => {
                self.unrealized_pnl_usdt = 0.0;
                self.used_margin_usdt = 0.0;
                self.maintenance_margin_usdt = 0.0;
            }
            Some(pos) => {
                self.unrealized_pnl_usdt = pos.unrealized_pnl(mark_price);
                let position_value = (pos.size * mark_price).abs();
                self.used_margin_usdt = position_value * self.config.initial_margin_rate;
                self.maintenance_margin_usdt = position_value * self.config.maintenance_margin_rate;
            }
        }
        self.recompute_derived();

        LedgerUpdate {
            state: self.state(),
            realized_pnl: 0.0,
            fees_paid: 0.0,
            funding_paid: 0.0,
        }
    }

    /// Deduct the entry fee from cash.
    pub fn apply_entry_fee(&mut self, fee: f64) {
        self.cash_balance_usdt -= fee;
        self.total_fees_paid += fee;
        self.recompute_derived();
    }

    /// Full close: realize PnL minus fee into cash, clear margin state.
    pub fn apply_exit(&mut self, realized_pnl: f64, exit_fee: f64) -> LedgerUpdate {
        self.cash_balance_usdt += realized_pnl - exit_fee;
        self.total_fees_paid += exit_fee;

        self.unrealized_pnl_usdt = 0.0;
        self.used_margin_usdt = 0.0;
        self.maintenance_margin_usdt = 0.0;

        self.recompute_derived();

        LedgerUpdate {
            state: self.state(),
            realized_pnl,
            fees_paid: exit_fee,
            funding_paid: 0.0,
        }
    }

    /// Partial close: realize PnL, keep margin state for the next MTM.
    pub fn apply_partial_exit(&mut self, realized_pnl: f64, exit_fee: f64) -> LedgerUpdate {
        self.cash_balance_usdt += realized_pnl - exit_fee;
        self.total_fees_paid += exit_fee;
        self.recompute_derived();

        LedgerUpdate {
            state: self.state(),
            realized_pnl,
            fees_paid: exit_fee,
            funding_paid: 0.0,
        }
    }

    /// Funding settlement (positive = received, negative = paid).
    pub fn apply_funding(&mut self, funding_pnl: f64) -> LedgerUpdate {
        self.cash_balance_usdt += funding_pnl;
        self.recompute_derived();

        LedgerUpdate {
            state: self.state(),
            realized_pnl: 0.0,
            fees_paid: 0.0,
            funding_paid: funding_pnl,
        }
    }

    pub fn apply_liquidation_fee(&mut self, fee: f64) {
        self.cash_balance_usdt -= fee;
        self.total_fees_paid += fee;
        self.recompute_derived();
    }

    /// Required available balance to enter:
    /// `notional x IMR + notional x taker (+ notional x taker if close fee)`.
    pub fn compute_required_for_entry(&self, notional_usdt: f64, include_close_fee: bool) -> f64 {
        let position_im = notional_usdt * self.config.initial_margin_rate;
        let est_open_fee = notional_usdt * self.config.taker_fee_rate;
        let est_close_fee = if include_close_fee {
            notional_usdt * self.config.taker_fee_rate
        } else {
            0.0
        };
        position_im + est_open_fee + est_close_fee
    }

    pub fn can_afford_entry(&self, notional_usdt: f64, include_close_fee: bool) -> bool {
        self.available_balance_usdt >= self.compute_required_for_entry(notional_usdt, include_close_fee)
    }

    /// Liquidation condition: maintenance margin > 0 and equity <= maintenance.
    pub fn is_liquidatable(&self) -> bool {
        self.maintenance_margin_usdt > 0.0 && self.equity_usdt <= self.maintenance_margin_usdt
    }

    pub fn available_balance_usdt(&self) -> f64 {
        self.available_balance_usdt
    }

    pub fn equity_usdt(&self) -> f64 {
        self.equity_usdt
    }

    pub fn cash_balance_usdt(&self) -> f64 {
        self.cash_balance_usdt
    }

    pub fn total_fees_paid(&self) -> f64 {
        self.total_fees_paid
    }

    /// Update the IMR (leverage change); takes effect on the next MTM.
    pub fn set_initial_margin_rate(&mut self, imr: f64) {
        self.config.initial_margin_rate = imr;
    }

    pub fn taker_fee_rate(&self) -> f64 {
        self.config.taker_fee_rate
    }
}
