//! Simulated exchange orchestrator.
//!
//! Per-bar pipeline (strict ordering contract):
//! prices -> funding -> stop triggers -> entry fills -> pending close ->
//! SL/TP -> MTM -> liquidation.
//!
//! The mark price is computed exactly once per bar and reused by every
//! subsequent step. Strategy decides at `ts_close`; entry fills realize at
//! the next bar's `ts_open`; TP/SL and liquidation fills realize on the bar
//! where they triggered.

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::bar::Bar;
use crate::error::{CoreError, Result};
use crate::sim::execution::{
    ExecutionModel, ExecutionModelConfig, ImpactConfig, LiquidityConfig, SlippageConfig,
};
use crate::sim::funding::FundingModel;
use crate::sim::ledger::{Ledger, LedgerConfig};
use crate::sim::liquidation::{LiquidationConfig, LiquidationModel};
use crate::sim::metrics::{ExchangeMetrics, ExchangeMetricsSnapshot};
use crate::sim::orderbook::{OrderBook, DEFAULT_MAX_ORDERS};
use crate::sim::pricing::{MarkPriceSource, PriceModel, SpreadConfig, SpreadModel};
use crate::sim::types::{
    ExchangeStateView, ExitPriceSource, Fill, FillReason, FundingEvent, LiquidationResult, Order,
    OrderId, OrderSide, OrderStatus, OrderType, Position, Rejection, StepResult, StopReason,
    TimeInForce, Trade, TriggerDirection,
};

pub const CODE_ENTRIES_DISABLED: &str = "ENTRIES_DISABLED";
pub const CODE_POSITION_EXISTS: &str = "POSITION_EXISTS";
pub const CODE_POST_ONLY_WOULD_TAKE: &str = "POST_ONLY_WOULD_TAKE";
pub const CODE_REDUCE_ONLY_NO_POSITION: &str = "REDUCE_ONLY_NO_POSITION";

/// Exchange configuration.
///
/// One fee rate feeds both the ledger (entry-gate arithmetic) and the
/// execution model (fill fees); divergence is not representable.
#[derive(Debug, Clone)]
pub struct ExchangeConfig {
    pub symbol: String,
    pub initial_capital: f64,
    pub leverage: f64,
    pub maintenance_margin_rate: f64,
    pub taker_fee_rate: f64,
    pub slippage_bps: f64,
    pub spread_bps: f64,
    pub mark_price_source: MarkPriceSource,
    pub include_close_fee_in_gate: bool,
    pub liquidation_fee_rate: f64,
    pub funding_enabled: bool,
    pub debug_check_invariants: bool,
    pub max_orders: usize,
    pub impact: ImpactConfig,
    pub liquidity: LiquidityConfig,
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        Self {
            symbol: "BTCUSDT".to_string(),
            initial_capital: 10_000.0,
            leverage: 1.0,
            maintenance_margin_rate: 0.005,
            taker_fee_rate: 0.0006,
            slippage_bps: 5.0,
            spread_bps: 2.0,
            mark_price_source: MarkPriceSource::Close,
            include_close_fee_in_gate: false,
            liquidation_fee_rate: 0.0006,
            funding_enabled: true,
            debug_check_invariants: false,
            max_orders: DEFAULT_MAX_ORDERS,
            impact: ImpactConfig::default(),
            liquidity: LiquidityConfig::default(),
        }
    }
}

/// Order submission request.
#[derive(Debug, Clone)]
pub struct OrderRequest {
    pub side: OrderSide,
    pub size_usdt: f64,
    pub order_type: OrderType,
    pub limit_price: Option<f64>,
    pub trigger_price: Option<f64>,
    pub trigger_direction: Option<TriggerDirection>,
    pub time_in_force: TimeInForce,
    pub reduce_only: bool,
    pub stop_loss: Option<f64>,
    pub take_profit: Option<f64>,
    pub created_at: Option<DateTime<Utc>>,
}

impl OrderRequest {
    pub fn market(side: OrderSide, size_usdt: f64) -> Self {
        Self {
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
        }
    }

    pub fn with_sl_tp(mut self, stop_loss: Option<f64>, take_profit: Option<f64>) -> Self {
        self.stop_loss = stop_loss;
        self.take_profit = take_profit;
        self
    }

    pub fn with_created_at(mut self, ts: DateTime<Utc>) -> Self {
        self.created_at = Some(ts);
        self
    }
}

/// Simulated exchange for deterministic backtesting of USDT linear perps.
#[derive(Debug)]
pub struct SimulatedExchange {
    config: ExchangeConfig,
    imr: f64,

    ledger: Ledger,
    book: OrderBook,
    price_model: PriceModel,
    spread_model: SpreadModel,
    execution: ExecutionModel,
    funding: FundingModel,
    liquidation: LiquidationModel,
    metrics: ExchangeMetrics,

    pub position: Option<Position>,
    pending_close_reason: Option<FillReason>,
    pending_close_bar_index: i64,
    trades: Vec<Trade>,
    last_closed_trades: Vec<Trade>,

    position_counter: u64,
    trade_counter: u64,
    current_bar_index: i64,
    /// Snapshot readiness at the strategy's decision time, echoed by the
    /// engine for diagnostics.
    #[allow(dead_code)]
    current_snapshot_ready: bool,

    // Starvation tracking
    pub entries_disabled: bool,
    pub entries_disabled_reason: Option<StopReason>,
    pub first_starved_ts: Option<DateTime<Utc>>,
    pub first_starved_bar_index: Option<i64>,
    pub entry_attempts_count: u64,
    pub entry_rejections_count: u64,
    pub last_rejection_code: Option<String>,
    pub last_rejection_reason: Option<String>,
}

impl SimulatedExchange {
    pub fn new(config: ExchangeConfig) -> Result<Self> {
        if !config.symbol.ends_with("USDT") {
            return Err(CoreError::Config(format!(
                "Symbol '{}' is not USDT-quoted; this simulator supports USDT linear perpetuals only",
                config.symbol
            )));
        }
        if config.leverage < 1.0 {
            return Err(CoreError::Config("leverage must be >= 1".into()));
        }
        if config.initial_capital <= 0.0 {
            return Err(CoreError::Config("initial_capital must be > 0".into()));
        }

        let imr = 1.0 / config.leverage;
        let ledger = Ledger::new(
            config.initial_capital,
            LedgerConfig {
                initial_margin_rate: imr,
                maintenance_margin_rate: config.maintenance_margin_rate,
                taker_fee_rate: config.taker_fee_rate,
                debug_check_invariants: config.debug_check_invariants,
            },
        );
        let execution = ExecutionModel::new(ExecutionModelConfig {
            slippage: SlippageConfig {
                fixed_bps: config.slippage_bps,
            },
            impact: config.impact,
            liquidity: config.liquidity,
            taker_fee_rate: config.taker_fee_rate,
        });

        Ok(Self {
            imr,
            ledger,
            book: OrderBook::new(config.max_orders),
            price_model: PriceModel::new(config.mark_price_source),
            spread_model: SpreadModel::new(SpreadConfig {
                fixed_spread_bps: config.spread_bps,
            }),
            execution,
            funding: FundingModel::new(config.funding_enabled),
            liquidation: LiquidationModel::new(LiquidationConfig {
                liquidation_fee_rate: config.liquidation_fee_rate,
            }),
            metrics: ExchangeMetrics::new(),
            position: None,
            pending_close_reason: None,
            pending_close_bar_index: -1,
            trades: Vec::new(),
            last_closed_trades: Vec::new(),
            position_counter: 0,
            trade_counter: 0,
            current_bar_index: 0,
            current_snapshot_ready: true,
            entries_disabled: false,
            entries_disabled_reason: None,
            first_starved_ts: None,
            first_starved_bar_index: None,
            entry_attempts_count: 0,
            entry_rejections_count: 0,
            last_rejection_code: None,
            last_rejection_reason: None,
            config,
        })
    }

    // ── Balances ──────────────────────────────────────────────────────────

    pub fn equity_usdt(&self) -> f64 {
        self.ledger.equity_usdt()
    }

    pub fn cash_balance_usdt(&self) -> f64 {
        self.ledger.cash_balance_usdt()
    }

    pub fn available_balance_usdt(&self) -> f64 {
        self.ledger.available_balance_usdt()
    }

    pub fn is_liquidatable(&self) -> bool {
        self.ledger.is_liquidatable()
    }

    pub fn leverage(&self) -> f64 {
        self.config.leverage
    }

    pub fn trades(&self) -> &[Trade] {
        &self.trades
    }

    /// Trades closed in the last `process_bar` call.
    pub fn last_closed_trades(&self) -> &[Trade] {
        &self.last_closed_trades
    }

    pub fn metrics_snapshot(&self) -> ExchangeMetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn pending_order_count(&self) -> usize {
        self.book.count()
    }

    pub fn compute_required_for_entry(&self, notional_usdt: f64) -> f64 {
        self.ledger
            .compute_required_for_entry(notional_usdt, self.config.include_close_fee_in_gate)
    }

    /// Strategy-facing state view.
    pub fn state_view(&self) -> ExchangeStateView {
        ExchangeStateView {
            symbol: self.config.symbol.clone(),
            ledger: self.ledger.state(),
            position: self.position.clone(),
            pending_order_count: self.book.count(),
            entries_disabled: self.entries_disabled,
            entries_disabled_reason: self.entries_disabled_reason,
            entry_attempts_count: self.entry_attempts_count,
            entry_rejections_count: self.entry_rejections_count,
            last_rejection_code: self.last_rejection_code.clone(),
            leverage: self.config.leverage,
            is_liquidatable: self.ledger.is_liquidatable(),
        }
    }

    // ── Order management ──────────────────────────────────────────────────

    /// Submit an order for the next bar. Returns `None` (with counters and
    /// codes updated) when entries are disabled or a position blocks it.
    pub fn submit_order(&mut self, request: OrderRequest) -> Result<Option<OrderId>> {
        if matches!(request.order_type, OrderType::Limit | OrderType::StopLimit)
            && request.limit_price.is_none()
        {
            return Err(CoreError::Config(format!(
                "{:?} order requires limit_price",
                request.order_type
            )));
        }
        if request.order_type == OrderType::StopMarket || request.order_type == OrderType::StopLimit
        {
            if request.trigger_price.is_none() || request.trigger_direction.is_none() {
                return Err(CoreError::Config(format!(
                    "{:?} order requires trigger_price and trigger_direction",
                    request.order_type
                )));
            }
        }
        if request.size_usdt <= 0.0 {
            return Err(CoreError::Config("order size_usdt must be > 0".into()));
        }

        if !request.reduce_only {
            self.entry_attempts_count += 1;

            if self.entries_disabled {
                self.entry_rejections_count += 1;
                self.last_rejection_code = Some(CODE_ENTRIES_DISABLED.to_string());
                return Ok(None);
            }
            if self.position.is_some() && request.order_type == OrderType::Market {
                self.last_rejection_code = Some(CODE_POSITION_EXISTS.to_string());
                return Ok(None);
            }
        }

        let order = Order {
            order_id: String::new(),
            symbol: self.config.symbol.clone(),
            side: request.side,
            size_usdt: request.size_usdt,
            order_type: request.order_type,
            limit_price: request.limit_price,
            trigger_price: request.trigger_price,
            trigger_direction: request.trigger_direction,
            time_in_force: request.time_in_force,
            reduce_only: request.reduce_only,
            stop_loss: request.stop_loss,
            take_profit: request.take_profit,
            created_at: request.created_at,
            status: OrderStatus::Pending,
            submission_bar_index: Some(self.current_bar_index),
        };
        self.book.add_order(order).map(Some)
    }

    /// Request position close at the next bar open.
    pub fn submit_close(&mut self) {
        self.pending_close_reason = Some(FillReason::Signal);
        self.pending_close_bar_index = self.current_bar_index;
    }

    pub fn cancel_order(&mut self, order_id: &str) -> bool {
        self.book.cancel_order(order_id)
    }

    pub fn cancel_all_orders(&mut self) -> usize {
        self.book.cancel_all(None)
    }

    #[allow(clippy::too_many_arguments)]
    pub fn amend_order(
        &mut self,
        order_id: &str,
        limit_price: Option<f64>,
        trigger_price: Option<f64>,
        size_usdt: Option<f64>,
        stop_loss: Option<f64>,
        take_profit: Option<f64>,
    ) -> bool {
        self.book
            .amend_order(order_id, limit_price, trigger_price, size_usdt, stop_loss, take_profit)
    }

    /// Change leverage; IMR updates on the next mark-to-market.
    pub fn set_leverage(&mut self, leverage: f64) -> Result<()> {
        if leverage < 1.0 {
            return Err(CoreError::Config("leverage must be >= 1".into()));
        }
        self.config.leverage = leverage;
        self.imr = 1.0 / leverage;
        self.ledger.set_initial_margin_rate(self.imr);
        Ok(())
    }

    /// Mark entries as disabled due to starvation (the engine decides when).
    pub fn set_starvation(&mut self, timestamp: DateTime<Utc>, bar_index: i64) {
        if !self.entries_disabled {
            self.entries_disabled = true;
            self.entries_disabled_reason = Some(StopReason::StrategyStarved);
            self.first_starved_ts = Some(timestamp);
            self.first_starved_bar_index = Some(bar_index);
            self.last_rejection_code = Some("STRATEGY_STARVED".to_string());
        }
    }

    /// Per-bar context set by the engine before `process_bar`.
    pub fn set_bar_context(&mut self, bar_index: i64, snapshot_ready: bool) {
        self.current_bar_index = bar_index;
        self.current_snapshot_ready = snapshot_ready;
    }

    // ── Bar processing ────────────────────────────────────────────────────

    /// Process one bar; the main simulation step.
    pub fn process_bar(
        &mut self,
        bar: &Bar,
        prev_bar: Option<&Bar>,
        funding_events: &[FundingEvent],
    ) -> Result<StepResult> {
        let ts_open = bar.ts_open;
        let step_time = bar.ts_close;
        let mut fills: Vec<Fill> = Vec::new();
        let mut rejections: Vec<Rejection> = Vec::new();
        let mut closed_trades: Vec<Trade> = Vec::new();

        // 1. Prices once: the memoized mark is the single source of truth
        //    for this step.
        let spread = self.spread_model.get_spread(bar);
        let prices = self.price_model.get_prices(bar, spread);
        let mark_price = prices.mark_price;

        // 2. Funding in (prev_ts_close, ts_close].
        let prev_ts = prev_bar.map(|b| b.ts_close);
        let funding_result =
            self.funding
                .apply_events(funding_events, prev_ts, step_time, self.position.as_ref());
        if funding_result.funding_pnl != 0.0 {
            self.ledger.apply_funding(funding_result.funding_pnl);
            if let Some(pos) = self.position.as_mut() {
                pos.funding_pnl_cumulative += funding_result.funding_pnl;
            }
        }

        // 3a. Stop triggers against bar OHLC. Orders submitted at this bar's
        //     close become eligible on the next bar (no lookahead).
        for triggered in self.book.check_triggers(bar) {
            if triggered.submission_bar_index == Some(self.current_bar_index) {
                continue;
            }
            self.handle_triggered_stop(&triggered, bar, &mut fills, &mut rejections, &mut closed_trades);
        }

        // 3b. Pending entry/limit fills at ts_open.
        for order in self.book.get_pending_orders(None, None) {
            if order.is_conditional() {
                continue;
            }
            if order.submission_bar_index == Some(self.current_bar_index) {
                continue;
            }
            self.try_fill_resting_order(&order, bar, &mut fills, &mut rejections, &mut closed_trades);
        }

        // 3c. IOC/FOK orders not filled on their first eligible bar expire.
        for order in self.book.get_pending_orders(None, None) {
            let expired = matches!(order.time_in_force, TimeInForce::Ioc | TimeInForce::Fok)
                && order.submission_bar_index.unwrap_or(self.current_bar_index)
                    < self.current_bar_index;
            if expired {
                self.book.cancel_order(&order.order_id);
            }
        }

        // 3d. Pending close at ts_open using the bar open. A close requested
        //     at this bar's close realizes on the next bar.
        if self.pending_close_reason.is_some() && self.pending_close_bar_index < self.current_bar_index
        {
            if let Some(reason) = self.pending_close_reason.take() {
                if self.position.is_some() {
                    if let Some(trade) = self.close_position(
                        bar.open,
                        ts_open,
                        reason,
                        ExitPriceSource::Signal,
                        &mut fills,
                    ) {
                        closed_trades.push(trade);
                    }
                }
            }
        }

        // 4. SL/TP via the intrabar path.
        if let Some(pos) = self.position.as_mut() {
            pos.observe_range(bar.low, bar.high);
        }
        if let Some(pos) = self.position.clone() {
            if let Some(exit_reason) = self.execution.check_tp_sl(&pos, bar) {
                let exit_price = self.execution.exit_price_for(&pos, bar, exit_reason);
                let source = match exit_reason {
                    FillReason::TakeProfit => ExitPriceSource::TpLevel,
                    _ => ExitPriceSource::SlLevel,
                };
                if let Some(trade) =
                    self.close_position(exit_price, ts_open, exit_reason, source, &mut fills)
                {
                    closed_trades.push(trade);
                }
            }
        }

        // 5. MTM with the memoized mark.
        let mut ledger_update = self
            .ledger
            .update_for_mark_price(self.position.as_ref(), mark_price);

        // 6. Liquidation check at the same mark.
        let mut liquidation_result = LiquidationResult::default();
        if self.ledger.is_liquidatable() {
            liquidation_result = self.liquidation.check_liquidation(
                &self.ledger.state(),
                &prices,
                self.position.as_ref(),
            );
            if liquidation_result.liquidated {
                if let (Some(mut fill), Some(pos)) =
                    (liquidation_result.fill.clone(), self.position.take())
                {
                    // Fills never post later than the bar open; the event
                    // keeps the ts_close the check ran at.
                    fill.timestamp = ts_open;
                    debug!(
                        symbol = %self.config.symbol,
                        mark = mark_price,
                        "position liquidated"
                    );
                    let realized = self.execution.calculate_realized_pnl(&pos, mark_price);
                    self.ledger.apply_exit(realized, fill.fee);
                    let trade = self.build_trade(
                        &pos,
                        fill.price,
                        step_time,
                        FillReason::Liquidation,
                        ExitPriceSource::MarkPrice,
                        realized,
                        fill.fee,
                    );
                    closed_trades.push(trade);
                    fills.push(fill);
                    ledger_update = self.ledger.update_for_mark_price(None, mark_price);
                }
            }
        }

        self.last_closed_trades = closed_trades;

        let step = StepResult {
            ts_close: step_time,
            mark_price,
            mark_price_source: self.price_model.mark_source().as_str().to_string(),
            fills,
            rejections,
            funding_result,
            liquidation_result,
            ledger_update: Some(ledger_update),
            prices: Some(prices),
        };
        self.metrics.record_step(&step);
        Ok(step)
    }

    /// Force close any open position (end of data / cancellation).
    pub fn force_close_position(
        &mut self,
        price: f64,
        timestamp: DateTime<Utc>,
        reason: FillReason,
        exit_price_source: ExitPriceSource,
    ) -> Option<Trade> {
        let mut fills = Vec::new();
        let trade = self.close_position(price, timestamp, reason, exit_price_source, &mut fills);
        if trade.is_some() {
            // Final valuation with the position gone.
            let mark = price;
            self.ledger.update_for_mark_price(None, mark);
        }
        trade
    }

    // ── Internals ─────────────────────────────────────────────────────────

    fn handle_triggered_stop(
        &mut self,
        order: &Order,
        bar: &Bar,
        fills: &mut Vec<Fill>,
        rejections: &mut Vec<Rejection>,
        closed_trades: &mut Vec<Trade>,
    ) {
        let trigger_price = match order.trigger_price {
            Some(p) => p,
            None => return,
        };
        // Fill conservatively at the trigger level, clamped into bar range.
        let base_price = trigger_price.clamp(bar.low, bar.high);

        match order.order_type {
            OrderType::StopMarket => {
                self.fill_order_at(order, bar, base_price, fills, rejections, closed_trades);
            }
            OrderType::StopLimit => {
                let limit = match order.limit_price {
                    Some(p) => p,
                    None => return,
                };
                let crossed = match order.side {
                    OrderSide::Long => bar.low <= limit,
                    OrderSide::Short => bar.high >= limit,
                };
                if crossed {
                    self.fill_order_at(order, bar, limit, fills, rejections, closed_trades);
                }
                // Triggered but limit not crossed: stays booked and is
                // re-checked on subsequent triggering bars.
            }
            _ => {}
        }
    }

    fn try_fill_resting_order(
        &mut self,
        order: &Order,
        bar: &Bar,
        fills: &mut Vec<Fill>,
        rejections: &mut Vec<Rejection>,
        closed_trades: &mut Vec<Trade>,
    ) {
        let base_price = match order.order_type {
            OrderType::Market => bar.open,
            OrderType::Limit => {
                let limit = match order.limit_price {
                    Some(p) => p,
                    None => return,
                };
                if order.time_in_force == TimeInForce::PostOnly {
                    let marketable = match order.side {
                        OrderSide::Long => limit >= bar.open,
                        OrderSide::Short => limit <= bar.open,
                    };
                    if marketable {
                        self.reject_order(order, CODE_POST_ONLY_WOULD_TAKE, "post-only order would take liquidity", bar.ts_open, rejections);
                        return;
                    }
                }
                let crossed = match order.side {
                    OrderSide::Long => bar.low <= limit,
                    OrderSide::Short => bar.high >= limit,
                };
                if !crossed {
                    return;
                }
                limit
            }
            _ => return,
        };

        self.fill_order_at(order, bar, base_price, fills, rejections, closed_trades);
    }

    /// Fill one order (entry or reduce-only close) at a base price.
    fn fill_order_at(
        &mut self,
        order: &Order,
        bar: &Bar,
        base_price: f64,
        fills: &mut Vec<Fill>,
        rejections: &mut Vec<Rejection>,
        closed_trades: &mut Vec<Trade>,
    ) {
        if order.reduce_only {
            match self.position.as_ref() {
                Some(pos) if pos.side != order.side => {
                    if let Some(trade) = self.close_position(
                        base_price,
                        bar.ts_open,
                        FillReason::Signal,
                        ExitPriceSource::Signal,
                        fills,
                    ) {
                        closed_trades.push(trade);
                    }
                    self.book.mark_filled(&order.order_id);
                }
                _ => {
                    self.reject_order(
                        order,
                        CODE_REDUCE_ONLY_NO_POSITION,
                        "reduce-only order with no opposite position",
                        bar.ts_open,
                        rejections,
                    );
                }
            }
            return;
        }

        if self.position.is_some() {
            // One position per symbol: market entries cannot stack; resting
            // orders wait for the position to clear.
            if order.order_type == OrderType::Market {
                self.reject_order(
                    order,
                    CODE_POSITION_EXISTS,
                    "position already open",
                    bar.ts_open,
                    rejections,
                );
            }
            return;
        }

        if self.entries_disabled {
            self.reject_order(
                order,
                CODE_ENTRIES_DISABLED,
                "entries disabled",
                bar.ts_open,
                rejections,
            );
            return;
        }

        let required = self.compute_required_for_entry(order.size_usdt);
        let available = self.ledger.available_balance_usdt();
        let result = self
            .execution
            .fill_entry_order(order, bar, base_price, available, required);

        if let Some(rejection) = result.rejections.first() {
            self.entry_rejections_count += 1;
            self.last_rejection_code = Some(rejection.code.clone());
            self.last_rejection_reason = Some(rejection.reason.clone());
            rejections.push(rejection.clone());
            self.book.mark_rejected(&order.order_id);
            return;
        }

        if let Some(fill) = result.fills.first() {
            self.ledger.apply_entry_fee(fill.fee);
            self.position_counter += 1;
            self.position = Some(Position {
                position_id: format!("pos-{:06}", self.position_counter),
                symbol: order.symbol.clone(),
                side: order.side,
                entry_price: fill.price,
                entry_time: fill.timestamp,
                size: fill.size,
                size_usdt: order.size_usdt,
                stop_loss: order.stop_loss,
                take_profit: order.take_profit,
                fees_paid: fill.fee,
                entry_fee: fill.fee,
                entry_bar_index: self.current_bar_index,
                min_price: None,
                max_price: None,
                funding_pnl_cumulative: 0.0,
                initial_stop: order.stop_loss,
                trailing_active: false,
                be_activated: false,
                tp_order_type: "Market".to_string(),
                sl_order_type: "Market".to_string(),
            });
            self.book.mark_filled(&order.order_id);
            fills.push(fill.clone());
        }
    }

    fn reject_order(
        &mut self,
        order: &Order,
        code: &str,
        reason: &str,
        timestamp: DateTime<Utc>,
        rejections: &mut Vec<Rejection>,
    ) {
        self.entry_rejections_count += 1;
        self.last_rejection_code = Some(code.to_string());
        self.last_rejection_reason = Some(reason.to_string());
        rejections.push(Rejection {
            order_id: order.order_id.clone(),
            reason: reason.to_string(),
            code: code.to_string(),
            timestamp,
        });
        self.book.mark_rejected(&order.order_id);
    }

    /// Close the open position at a base price (slippage applied) and record
    /// the trade.
    fn close_position(
        &mut self,
        base_price: f64,
        fill_ts: DateTime<Utc>,
        reason: FillReason,
        exit_price_source: ExitPriceSource,
        fills: &mut Vec<Fill>,
    ) -> Option<Trade> {
        let pos = self.position.take()?;
        let fill = self.execution.fill_exit(&pos, base_price, fill_ts, reason);
        let realized = self.execution.calculate_realized_pnl(&pos, fill.price);
        self.ledger.apply_exit(realized, fill.fee);

        let trade = self.build_trade(
            &pos,
            fill.price,
            fill_ts,
            reason,
            exit_price_source,
            realized,
            fill.fee,
        );
        fills.push(fill);
        Some(trade)
    }

    #[allow(clippy::too_many_arguments)]
    fn build_trade(
        &mut self,
        pos: &Position,
        exit_price: f64,
        exit_time: DateTime<Utc>,
        exit_reason: FillReason,
        exit_price_source: ExitPriceSource,
        realized_pnl: f64,
        exit_fee: f64,
    ) -> Trade {
        self.trade_counter += 1;
        let trade = Trade {
            trade_id: format!("trade-{:06}", self.trade_counter),
            symbol: pos.symbol.clone(),
            side: pos.side,
            entry_time: pos.entry_time,
            entry_price: pos.entry_price,
            entry_size: pos.size,
            entry_size_usdt: pos.size_usdt,
            exit_time,
            exit_price,
            exit_reason,
            exit_price_source,
            realized_pnl,
            fees_paid: pos.fees_paid + exit_fee,
            net_pnl: realized_pnl - exit_fee,
            funding_pnl: pos.funding_pnl_cumulative,
            stop_loss: pos.stop_loss,
            take_profit: pos.take_profit,
            entry_bar_index: pos.entry_bar_index,
            exit_bar_index: self.current_bar_index,
        };
        self.trades.push(trade.clone());
        trade
    }
}
