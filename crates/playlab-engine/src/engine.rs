//! The backtest engine loop: warmup, multi-timeframe alignment, hot loop.
//!
//! Per exec bar: apply every HTF close at or before the exec close, update
//! exec detectors, rationalize, build the snapshot, evaluate Play rules,
//! gather funding events, run the exchange step, and record trade/equity
//! rows. Strategy decides at `ts_close`; entry fills realize at the next
//! bar's `ts_open` (the exchange skips same-bar submissions).
//!
//! Configuration errors surface before the first bar as `Err`; runtime
//! errors inside the loop become a failed [`EngineResult`] carrying the
//! error code and the bar index.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use playlab_core::bar::{timeframe_ms, Bar, BarData, IndicatorMap};
use playlab_core::error::{CoreError, Result};
use playlab_core::play::{Action, ExitMode, Play, PositionMode, TfRole};
use playlab_core::prices::PriceSource;
use playlab_core::rationalize::{RationalizerConfig, StateRationalizer};
use playlab_core::registry::Registry;
use playlab_core::sim::exchange::{ExchangeConfig, OrderRequest, SimulatedExchange};
use playlab_core::sim::execution::CODE_INSUFFICIENT_ENTRY_GATE;
use playlab_core::sim::funding::FundingTable;
use playlab_core::sim::metrics::ExchangeMetricsSnapshot;
use playlab_core::sim::pricing::{MarkPriceSource, PriceModel};
use playlab_core::sim::types::{
    EquityPoint, ExitPriceSource, FillReason, LedgerState, OrderSide, StopReason, Trade,
};
use playlab_core::state::MultiTfState;

use crate::evaluator::{RuleEvaluator, TriggeredAction};
use crate::features::{FeatureFrame, IndicatorSource};
use crate::snapshot::Snapshot;

/// Engine-level configuration (everything else comes from the Play).
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Bars to advance without emitting actions, per TF role.
    pub warmup_bars: usize,
    /// Consecutive entry-gate-rejected bars before the run is starved.
    pub starvation_bars: usize,
    /// Optional wall-time budget; the current bar completes, the position is
    /// force-closed, and artifacts are still written.
    pub max_runtime: Option<std::time::Duration>,
    /// Transition history depth for the rationalizer.
    pub history_depth: usize,
    pub mark_price_source: MarkPriceSource,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            warmup_bars: 0,
            starvation_bars: 100,
            max_runtime: None,
            history_depth: 1000,
            mark_price_source: MarkPriceSource::Close,
        }
    }
}

/// Cooperative cancellation flag checked between bars.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// One row of the optional events artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRow {
    pub ts_ms: i64,
    pub kind: String,
    pub detail: String,
    pub amount_usdt: f64,
}

/// Structured result of one backtest run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineResult {
    pub success: bool,
    pub stop_reason: StopReason,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_details: Option<String>,

    pub play_id: String,
    pub play_hash: String,
    pub symbol: String,
    pub tf_exec: String,
    pub htf_labels: Vec<String>,
    pub data_source_id: String,
    pub window_start_ms: i64,
    pub window_end_ms: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eval_start_ts_ms: Option<i64>,
    pub bars_processed: usize,

    pub trades: Vec<Trade>,
    pub equity: Vec<EquityPoint>,
    pub events: Vec<EventRow>,
    pub metrics: ExchangeMetricsSnapshot,
    pub final_ledger: LedgerState,
}

struct HtfFeed {
    role: TfRole,
    label: String,
    bars: Vec<Bar>,
    frame: FeatureFrame,
    cursor: usize,
}

/// Drives one backtest run of a Play over a window.
pub struct BacktestEngine {
    play: Play,
    config: EngineConfig,
    cancel: CancelToken,
}

impl BacktestEngine {
    pub fn new(play: Play, config: EngineConfig) -> Result<Self> {
        play.validate()?;
        Ok(Self {
            play,
            config,
            cancel: CancelToken::new(),
        })
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn play(&self) -> &Play {
        &self.play
    }

    /// Run the backtest over `[start, end]`.
    pub fn run(
        &self,
        price_source: &dyn PriceSource,
        indicators: &dyn IndicatorSource,
        funding: &FundingTable,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<EngineResult> {
        let play = &self.play;
        let symbol = play.symbol.clone();
        let exec_tf = play.timeframes.exec.clone();
        let exec_tf_ms = timeframe_ms(&exec_tf)?;
        let start_ms = start.timestamp_millis();

        let health = price_source.healthcheck();
        if !health.ok {
            return Err(CoreError::DataNotAvailable(format!(
                "price source '{}' unhealthy: {}",
                health.source, health.message
            )));
        }

        // ── Data preparation ─────────────────────────────────────────────
        let warmup_pad = Duration::milliseconds(self.config.warmup_bars as i64 * exec_tf_ms);
        let exec_bars = price_source.get_ohlcv(&symbol, &exec_tf, start - warmup_pad, end)?;
        if exec_bars.is_empty() {
            return Err(CoreError::DataNotAvailable(format!(
                "no {} bars for {} in [{}, {}]",
                exec_tf, symbol, start, end
            )));
        }
        for bar in &exec_bars {
            bar.validate()?;
        }

        let exec_features = FeatureFrame::compute(
            indicators,
            play.features
                .get(&TfRole::Exec)
                .map(|v| v.as_slice())
                .unwrap_or(&[]),
            &exec_bars,
        )?;

        let mut htf_feeds: Vec<HtfFeed> = Vec::new();
        for (role, label) in play.timeframes.htf_roles() {
            let htf_ms = timeframe_ms(label)?;
            let pad = Duration::milliseconds(self.config.warmup_bars as i64 * htf_ms);
            let bars = price_source.get_ohlcv(&symbol, label, start - pad, end)?;
            for bar in &bars {
                bar.validate()?;
            }
            let frame = FeatureFrame::compute(
                indicators,
                play.features.get(&role).map(|v| v.as_slice()).unwrap_or(&[]),
                &bars,
            )?;
            htf_feeds.push(HtfFeed {
                role,
                label: label.to_string(),
                bars,
                frame,
                cursor: 0,
            });
        }

        // ── Build the per-run state ──────────────────────────────────────
        let registry = Registry::builtin();
        let mut structures = MultiTfState::new(
            exec_tf.clone(),
            play.exec_structures(),
            &play.htf_structures(),
            &registry,
        )?;
        let mut rationalizer = StateRationalizer::new(RationalizerConfig {
            history_depth: self.config.history_depth,
            version_only: false,
        });
        let mut evaluator = RuleEvaluator::new(&play.actions);
        let mut exchange = SimulatedExchange::new(ExchangeConfig {
            symbol: symbol.clone(),
            initial_capital: play.account.starting_equity,
            leverage: play.account.leverage,
            taker_fee_rate: play.account.fees.taker_rate,
            slippage_bps: play.account.slippage_bps,
            mark_price_source: self.config.mark_price_source,
            ..ExchangeConfig::default()
        })?;
        let preview_prices = PriceModel::new(self.config.mark_price_source);
        let mark_source_str = self.config.mark_price_source.as_str();

        info!(
            play_id = %play.play_id,
            symbol = %symbol,
            exec_tf = %exec_tf,
            bars = exec_bars.len(),
            "starting backtest run"
        );

        // ── Hot loop ─────────────────────────────────────────────────────
        let started = Instant::now();
        let mut equity: Vec<EquityPoint> = Vec::with_capacity(exec_bars.len());
        let mut events: Vec<EventRow> = Vec::new();
        let mut feature_row: BTreeMap<String, f64> = BTreeMap::new();
        let mut prev_bar: Option<&Bar> = None;
        let mut eval_start_ts_ms: Option<i64> = None;
        let mut bars_processed = 0usize;
        let mut consecutive_starved_bars = 0usize;

        let mut stop_reason = StopReason::EndOfData;
        let mut success = true;
        let mut error_code: Option<String> = None;
        let mut error_details: Option<String> = None;
        let mut last_bar: Option<&Bar> = None;

        'bars: for (i, bar) in exec_bars.iter().enumerate() {
            if self.cancel.is_cancelled() {
                stop_reason = StopReason::Manual;
                break 'bars;
            }
            if let Some(budget) = self.config.max_runtime {
                if started.elapsed() > budget {
                    stop_reason = StopReason::MaxRuntime;
                    break 'bars;
                }
            }

            let bar_idx = i as i64;
            last_bar = Some(bar);

            // a. HTF closes at or before the exec close apply first.
            let mut htf_ready = true;
            for feed in htf_feeds.iter_mut() {
                while feed.cursor < feed.bars.len()
                    && feed.bars[feed.cursor].ts_close <= bar.ts_close
                {
                    let htf_bar = &feed.bars[feed.cursor];
                    let idx = feed.cursor as i64;
                    let indicators_map =
                        IndicatorMap::from_pairs(feed.frame.row(feed.cursor).map(|(k, v)| (k.to_string(), v)));
                    let data = BarData::new(
                        idx,
                        htf_bar.open,
                        htf_bar.high,
                        htf_bar.low,
                        htf_bar.close,
                        htf_bar.volume,
                    )
                    .with_indicators(indicators_map);
                    if let Err(e) = structures.update_htf(&feed.label, &data) {
                        return Err(e);
                    }
                    for (key, value) in feed.frame.row(feed.cursor) {
                        feature_row.insert(format!("{}.{}", role_name(feed.role), key), value);
                    }
                    feed.cursor += 1;
                }
                if !feed.frame.is_empty() {
                    let applied = feed.cursor;
                    let finite =
                        applied > 0 && feed.frame.all_finite_at(applied - 1);
                    htf_ready &= finite;
                }
            }

            // b. Exec detector updates.
            let exec_indicators = IndicatorMap::from_pairs(
                exec_features.row(i).map(|(k, v)| (k.to_string(), v)),
            );
            let bar_data = BarData::new(
                bar_idx,
                bar.open,
                bar.high,
                bar.low,
                bar.close,
                bar.volume,
            )
            .with_indicators(exec_indicators);
            if let Err(e) = structures.update_exec(&bar_data) {
                success = false;
                error_code = Some(e.code().to_string());
                error_details = Some(format!("bar {}: {}", bar_idx, e));
                break 'bars;
            }

            // c. Rationalize after all detector updates.
            let rationalized = rationalizer.rationalize(bar_idx, &structures);

            for (key, value) in exec_features.row(i) {
                feature_row.insert(format!("exec.{}", key), value);
            }

            // d. Snapshot readiness: warmup satisfied, inside the window,
            //    every declared feature finite at its aligned timestamp.
            let in_window = bar.ts_close_ms() >= start_ms;
            let exec_ready = exec_features.is_empty() || exec_features.all_finite_at(i);
            let ready = in_window && i >= self.config.warmup_bars && exec_ready && htf_ready;

            exchange.set_bar_context(bar_idx, ready);

            let mark_preview = preview_prices.get_mark_price(bar);
            if ready && !mark_preview.is_finite() {
                success = false;
                error_code = Some("INVARIANT_VIOLATION".to_string());
                error_details = Some(format!("bar {}: non-finite mark price", bar_idx));
                break 'bars;
            }

            // e. Evaluate the Play and apply its actions.
            if ready {
                if eval_start_ts_ms.is_none() {
                    eval_start_ts_ms = Some(bar.ts_close_ms());
                    debug!(bar_idx, ts = %bar.ts_close, "evaluation window opened");
                }
                let exchange_view = exchange.state_view();
                let snapshot = Snapshot {
                    ts_close: bar.ts_close,
                    bar_idx,
                    mark_price: mark_preview,
                    mark_price_source: mark_source_str,
                    bar,
                    features: &feature_row,
                    structures: &structures,
                    rationalized: &rationalized,
                    exchange: &exchange_view,
                    ready,
                };
                let actions = match evaluator.evaluate(&snapshot) {
                    Ok(actions) => actions,
                    Err(e) => {
                        success = false;
                        error_code = Some(e.code().to_string());
                        error_details = Some(format!("bar {}: {}", bar_idx, e));
                        break 'bars;
                    }
                };
                if let Err(e) = self.apply_actions(&actions, &snapshot, &mut exchange) {
                    success = false;
                    error_code = Some(e.code().to_string());
                    error_details = Some(format!("bar {}: {}", bar_idx, e));
                    break 'bars;
                }
            }

            // f. Funding events intersecting (prev.ts_close, ts_close].
            let funding_events = funding.events_in_window(
                &symbol,
                prev_bar.map(|b| b.ts_close_ms()),
                bar.ts_close_ms(),
            );

            // g. Exchange step.
            let step = match exchange.process_bar(bar, prev_bar, &funding_events) {
                Ok(step) => step,
                Err(e) => {
                    success = false;
                    error_code = Some(e.code().to_string());
                    error_details = Some(format!("bar {}: {}", bar_idx, e));
                    break 'bars;
                }
            };

            // h. Record events and the equity row.
            for fill in &step.fills {
                events.push(EventRow {
                    ts_ms: fill.timestamp.timestamp_millis(),
                    kind: "fill".to_string(),
                    detail: format!("{:?}:{:?}", fill.side, fill.reason),
                    amount_usdt: fill.size_usdt,
                });
            }
            for event in &step.funding_result.events_applied {
                events.push(EventRow {
                    ts_ms: event.timestamp.timestamp_millis(),
                    kind: "funding".to_string(),
                    detail: format!("rate={}", event.funding_rate),
                    amount_usdt: step.funding_result.funding_pnl,
                });
            }
            if let Some(liq) = &step.liquidation_result.event {
                events.push(EventRow {
                    ts_ms: liq.timestamp.timestamp_millis(),
                    kind: "liquidation".to_string(),
                    detail: format!("mark={}", liq.mark_price),
                    amount_usdt: liq.liquidation_fee,
                });
            }
            if let Some(update) = &step.ledger_update {
                equity.push(EquityPoint {
                    ts_ms: bar.ts_close_ms(),
                    equity: update.state.equity_usdt,
                });
            }
            bars_processed += 1;

            // Starvation: consecutive gate-rejected bars flip the run.
            let gate_rejected = step
                .rejections
                .iter()
                .any(|r| r.code == CODE_INSUFFICIENT_ENTRY_GATE);
            if gate_rejected {
                consecutive_starved_bars += 1;
            } else if !step.fills.is_empty() {
                consecutive_starved_bars = 0;
            }
            if ready && consecutive_starved_bars >= self.config.starvation_bars {
                warn!(bar_idx, "strategy starved: entries disabled");
                exchange.set_starvation(bar.ts_close, bar_idx);
                stop_reason = StopReason::StrategyStarved;
                break 'bars;
            }

            // Liquidation that empties the account ends the run.
            if step.liquidation_result.liquidated && exchange.equity_usdt() <= 0.0 {
                stop_reason = StopReason::Liquidated;
                break 'bars;
            }

            prev_bar = Some(bar);
        }

        // ── Termination: force-close any open position ───────────────────
        if exchange.position.is_some() {
            if let Some(bar) = last_bar {
                let reason = match stop_reason {
                    StopReason::EndOfData => FillReason::EndOfData,
                    _ => FillReason::ForceClose,
                };
                exchange.force_close_position(
                    bar.close,
                    bar.ts_close,
                    reason,
                    ExitPriceSource::BarClose,
                );
            }
        }

        let final_ledger = exchange.state_view().ledger;
        let trades = exchange.trades().to_vec();
        info!(
            trades = trades.len(),
            bars = bars_processed,
            stop = ?stop_reason,
            "run finished"
        );

        Ok(EngineResult {
            success,
            stop_reason,
            error_code,
            error_details,
            play_id: play.play_id.clone(),
            play_hash: play.play_hash()?,
            symbol,
            tf_exec: exec_tf,
            htf_labels: htf_feeds.iter().map(|f| f.label.clone()).collect(),
            data_source_id: price_source.source_name().to_string(),
            window_start_ms: start_ms,
            window_end_ms: end.timestamp_millis(),
            eval_start_ts_ms,
            bars_processed,
            trades,
            equity,
            events,
            metrics: exchange.metrics_snapshot(),
            final_ledger,
        })
    }

    /// Convert triggered actions into exchange calls under the position
    /// policy and risk settings.
    fn apply_actions(
        &self,
        actions: &[TriggeredAction],
        snapshot: &Snapshot<'_>,
        exchange: &mut SimulatedExchange,
    ) -> Result<()> {
        let policy = &self.play.position_policy;

        for triggered in actions {
            match &triggered.action {
                Action::EnterLong { size_usdt } => {
                    if policy.mode == PositionMode::ShortOnly {
                        continue;
                    }
                    self.submit_entry(snapshot, exchange, OrderSide::Long, *size_usdt)?;
                }
                Action::EnterShort { size_usdt } => {
                    if policy.mode == PositionMode::LongOnly {
                        continue;
                    }
                    self.submit_entry(snapshot, exchange, OrderSide::Short, *size_usdt)?;
                }
                Action::ClosePosition => {
                    if policy.exit_mode == ExitMode::SlTpOnly {
                        continue;
                    }
                    exchange.submit_close();
                }
                Action::CancelOrders => {
                    exchange.cancel_all_orders();
                }
                Action::SetLeverage { leverage } => {
                    exchange.set_leverage(*leverage)?;
                }
            }
        }
        Ok(())
    }

    fn submit_entry(
        &self,
        snapshot: &Snapshot<'_>,
        exchange: &mut SimulatedExchange,
        side: OrderSide,
        size_override: Option<f64>,
    ) -> Result<()> {
        let risk = &self.play.risk;
        let account = &self.play.account;
        let notional = size_override
            .or(risk.notional_usdt)
            .unwrap_or_else(|| {
                let size_pct = risk.size_pct.unwrap_or(1.0);
                snapshot.exchange.ledger.available_balance_usdt * size_pct * account.leverage
            });
        if notional <= 0.0 {
            return Ok(());
        }

        let reference = snapshot.bar.close;
        let attach_sl_tp = self.play.position_policy.exit_mode != ExitMode::SignalOnly;
        let (stop_loss, take_profit) = if attach_sl_tp {
            let sl = risk.stop_loss_pct.map(|pct| match side {
                OrderSide::Long => reference * (1.0 - pct),
                OrderSide::Short => reference * (1.0 + pct),
            });
            let tp = risk.take_profit_pct.map(|pct| match side {
                OrderSide::Long => reference * (1.0 + pct),
                OrderSide::Short => reference * (1.0 - pct),
            });
            (sl, tp)
        } else {
            (None, None)
        };

        exchange
            .submit_order(
                OrderRequest::market(side, notional)
                    .with_sl_tp(stop_loss, take_profit)
                    .with_created_at(snapshot.ts_close),
            )
            .map(|_| ())
    }
}

fn role_name(role: TfRole) -> &'static str {
    match role {
        TfRole::Exec => "exec",
        TfRole::LowTf => "low_tf",
        TfRole::MedTf => "med_tf",
        TfRole::HighTf => "high_tf",
    }
}
