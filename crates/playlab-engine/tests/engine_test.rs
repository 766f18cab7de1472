//! End-to-end engine tests over synthetic data: warmup gating, MTF
//! alignment, entry/exit mechanics, accounting reconciliation, artifact
//! writing, and run-twice determinism.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, TimeZone, Utc};

use playlab_core::bar::Bar;
use playlab_core::detectors::{DetectorSpec, ParamValue};
use playlab_core::error::Result;
use playlab_core::play::{
    AccountConfig, Action, ActionRule, Condition, FeatureSpec, FeeModel, MarginMode, Play,
    PositionPolicy, RiskConfig, TfRole, Timeframes, Value,
};
use playlab_core::prices::{HealthCheck, PriceSource};
use playlab_core::registry::Registry;
use playlab_core::sim::funding::FundingTable;
use playlab_core::sim::types::{FillReason, StopReason};
use playlab_engine::artifacts::{load_result_summary, write_run_artifacts};
use playlab_engine::determinism::compare_runs;
use playlab_engine::engine::{BacktestEngine, EngineConfig};
use playlab_engine::features::IndicatorSource;

fn base_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap()
}

/// Deterministic close path: flat at 100 until bar 16, then +0.5 per bar.
fn close_at(n: usize) -> f64 {
    if n < 16 {
        100.0
    } else {
        100.0 + (n as f64 - 15.0) * 0.5
    }
}

fn make_15m_bars(count: usize) -> Vec<Bar> {
    let mut bars = Vec::with_capacity(count);
    let mut prev_close: f64 = 100.0;
    for n in 0..count {
        let close = close_at(n);
        let open = prev_close;
        let high = open.max(close) + 0.3;
        let low = open.min(close) - 0.3;
        bars.push(Bar::new(
            "BTCUSDT",
            "15m",
            base_time() + Duration::minutes(15 * n as i64),
            base_time() + Duration::minutes(15 * (n as i64 + 1)),
            open,
            high,
            low,
            close,
            1_000.0,
        ));
        prev_close = close;
    }
    bars
}

fn make_1h_bars(count_15m: usize) -> Vec<Bar> {
    let bars_15m = make_15m_bars(count_15m);
    bars_15m
        .chunks(4)
        .filter(|c| c.len() == 4)
        .map(|chunk| {
            Bar::new(
                "BTCUSDT",
                "1h",
                chunk[0].ts_open,
                chunk[3].ts_close,
                chunk[0].open,
                chunk.iter().map(|b| b.high).fold(f64::NEG_INFINITY, f64::max),
                chunk.iter().map(|b| b.low).fold(f64::INFINITY, f64::min),
                chunk[3].close,
                chunk.iter().map(|b| b.volume).sum(),
            )
        })
        .collect()
}

struct SyntheticSource {
    bars_15m: Vec<Bar>,
    bars_1h: Vec<Bar>,
}

impl SyntheticSource {
    fn new(count_15m: usize) -> Self {
        Self {
            bars_15m: make_15m_bars(count_15m),
            bars_1h: make_1h_bars(count_15m),
        }
    }
}

impl PriceSource for SyntheticSource {
    fn source_name(&self) -> &str {
        "synthetic_test"
    }

    fn get_mark_price(&self, _symbol: &str, ts: DateTime<Utc>) -> Option<f64> {
        self.bars_15m
            .iter()
            .find(|b| b.ts_close == ts)
            .map(|b| b.close)
    }

    fn get_ohlcv(
        &self,
        _symbol: &str,
        tf: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Bar>> {
        let all = match tf {
            "15m" => &self.bars_15m,
            "1h" => &self.bars_1h,
            _ => return Ok(vec![]),
        };
        Ok(all
            .iter()
            .filter(|b| b.ts_open >= start && b.ts_open <= end)
            .cloned()
            .collect())
    }

    fn get_1m_marks(
        &self,
        _symbol: &str,
        _start: DateTime<Utc>,
        _end: DateTime<Utc>,
    ) -> Result<Vec<f64>> {
        Ok(vec![])
    }

    fn healthcheck(&self) -> HealthCheck {
        HealthCheck::ok("synthetic_test", "ready")
    }
}

/// Constant-ATR indicator source with a short warm-up of NaNs.
struct TestIndicators;

impl IndicatorSource for TestIndicators {
    fn compute(&self, feature: &FeatureSpec, bars: &[Bar]) -> Result<Vec<f64>> {
        match feature.name.as_str() {
            "atr" => Ok(bars
                .iter()
                .enumerate()
                .map(|(i, _)| if i < 3 { f64::NAN } else { 1.0 })
                .collect()),
            other => Err(playlab_core::error::CoreError::Config(format!(
                "unknown indicator '{}'",
                other
            ))),
        }
    }
}

fn breakout_play() -> Play {
    let mut features = BTreeMap::new();
    features.insert(
        TfRole::Exec,
        vec![FeatureSpec {
            name: "atr".to_string(),
            key: None,
            params: Default::default(),
        }],
    );

    let mut structures = BTreeMap::new();
    structures.insert(
        TfRole::Exec,
        vec![DetectorSpec::new("swing", "swing")
            .with_param("left", ParamValue::Int(2))
            .with_param("right", ParamValue::Int(2))],
    );
    structures.insert(
        TfRole::HighTf,
        vec![DetectorSpec::new("swing", "swing_1h")
            .with_param("left", ParamValue::Int(2))
            .with_param("right", ParamValue::Int(2))],
    );

    Play {
        play_id: "test_breakout".to_string(),
        symbol: "BTCUSDT".to_string(),
        timeframes: Timeframes {
            exec: "15m".to_string(),
            low_tf: None,
            med_tf: None,
            high_tf: Some("1h".to_string()),
        },
        account: AccountConfig {
            starting_equity: 10_000.0,
            leverage: 1.0,
            margin_mode: MarginMode::Isolated,
            fees: FeeModel {
                taker_rate: 0.0006,
                maker_rate: 0.0001,
            },
            slippage_bps: 0.0,
        },
        features,
        structures,
        actions: vec![ActionRule {
            name: Some("breakout_long".to_string()),
            when: Condition::Gt {
                left: Value::Ref {
                    path: "close".to_string(),
                },
                right: Value::Num(100.5),
            },
            then: Action::EnterLong { size_usdt: None },
        }],
        position_policy: PositionPolicy::default(),
        risk: RiskConfig {
            stop_loss_pct: Some(0.02),
            take_profit_pct: Some(0.02),
            size_pct: None,
            notional_usdt: Some(1_000.0),
        },
    }
}

fn run_once(count_15m: usize) -> playlab_engine::engine::EngineResult {
    let play = breakout_play();
    let engine = BacktestEngine::new(
        play,
        EngineConfig {
            warmup_bars: 5,
            ..EngineConfig::default()
        },
    )
    .unwrap();
    let source = SyntheticSource::new(count_15m);
    let funding = FundingTable::new();
    let start = base_time() + Duration::hours(2);
    let end = base_time() + Duration::minutes(15 * count_15m as i64);
    engine
        .run(&source, &TestIndicators, &funding, start, end)
        .unwrap()
}

#[test]
fn test_run_produces_trades_and_equity() {
    let result = run_once(40);
    assert!(result.success, "{:?}", result.error_details);
    assert!(!result.trades.is_empty());
    assert_eq!(result.equity.len(), result.bars_processed);
    assert!(result.eval_start_ts_ms.is_some());
    assert_eq!(result.htf_labels, vec!["1h".to_string()]);
    assert_eq!(result.data_source_id, "synthetic_test");
}

#[test]
fn test_first_trade_exits_at_take_profit() {
    let result = run_once(40);
    let trade = &result.trades[0];
    assert_eq!(trade.exit_reason, FillReason::TakeProfit);
    assert!(trade.exit_bar_index >= trade.entry_bar_index);
    // TP is 2% above the signal close; the fill is at the level itself.
    assert!((trade.exit_price / trade.entry_price - 1.0) < 0.025);
    assert!(trade.realized_pnl > 0.0);
    // Entry realizes at a bar open: a 15-minute boundary.
    assert_eq!(trade.entry_time.timestamp() % 900, 0);
}

#[test]
fn test_window_end_closes_open_position() {
    let result = run_once(40);
    let last = result.trades.last().unwrap();
    // The close series keeps rising, so the engine re-enters and the window
    // end force-closes the final position.
    assert_eq!(result.stop_reason, StopReason::EndOfData);
    assert_eq!(last.exit_reason, FillReason::EndOfData);
}

#[test]
fn test_accounting_reconciliation() {
    // Post-hoc: sum(realized - fees) + funding == final_cash - initial_cash.
    let result = run_once(40);
    let net: f64 = result
        .trades
        .iter()
        .map(|t| t.realized_pnl - t.fees_paid + t.funding_pnl)
        .sum();
    let delta = result.final_ledger.cash_balance_usdt - 10_000.0;
    assert!(
        (net - delta).abs() < 1e-6,
        "net {} vs cash delta {}",
        net,
        delta
    );
}

#[test]
fn test_no_evaluation_before_warmup() {
    let result = run_once(40);
    // Evaluation cannot start before the configured start of the window.
    let start_ms = (base_time() + Duration::hours(2)).timestamp_millis();
    assert!(result.eval_start_ts_ms.unwrap() >= start_ms);
    // No trade can enter before evaluation started.
    for trade in &result.trades {
        assert!(trade.entry_time.timestamp_millis() >= result.eval_start_ts_ms.unwrap());
    }
}

#[test]
fn test_run_twice_is_bit_identical() {
    let a = run_once(40);
    let b = run_once(40);
    assert_eq!(
        playlab_engine::artifacts::trades_hash(&a.trades),
        playlab_engine::artifacts::trades_hash(&b.trades)
    );
    assert_eq!(
        playlab_engine::artifacts::equity_hash(&a.equity),
        playlab_engine::artifacts::equity_hash(&b.equity)
    );
    assert_eq!(a.play_hash, b.play_hash);
}

#[test]
fn test_artifacts_round_trip_and_compare() {
    let result = run_once(40);
    let registry = Registry::builtin();
    let tmp = tempfile::tempdir().unwrap();
    let root_a = tmp.path().join("a");
    let root_b = tmp.path().join("b");

    let artifacts_a = write_run_artifacts(&root_a, &result, &registry, true).unwrap();
    let artifacts_b = write_run_artifacts(&root_b, &run_once(40), &registry, false).unwrap();

    // Canonical file set exists.
    for file in [
        "result.json",
        "trades.parquet",
        "equity.parquet",
        "run_manifest.json",
        "pipeline_signature.json",
    ] {
        assert!(artifacts_a.dir.join(file).exists(), "missing {}", file);
    }
    assert!(artifacts_a.dir.join("events.csv").exists());
    assert!(!artifacts_b.dir.join("events.csv").exists());

    // result.json reloads to the same summary.
    let reloaded = load_result_summary(&artifacts_a.dir).unwrap();
    assert_eq!(reloaded.run_hash, artifacts_a.result.run_hash);
    assert_eq!(reloaded.trade_count, result.trades.len());

    // Independent runs of the same window are hash-equal.
    let comparison = compare_runs(&artifacts_a.dir, &artifacts_b.dir).unwrap();
    assert!(comparison.passed, "{}", comparison.report());
}

#[test]
fn test_cancellation_stops_run() {
    let play = breakout_play();
    let engine = BacktestEngine::new(play, EngineConfig::default()).unwrap();
    engine.cancel_token().cancel();
    let source = SyntheticSource::new(40);
    let funding = FundingTable::new();
    let result = engine
        .run(
            &source,
            &TestIndicators,
            &funding,
            base_time(),
            base_time() + Duration::hours(10),
        )
        .unwrap();
    assert_eq!(result.stop_reason, StopReason::Manual);
    assert_eq!(result.bars_processed, 0);
}

#[test]
fn test_missing_data_is_loud() {
    let play = breakout_play();
    let engine = BacktestEngine::new(play, EngineConfig::default()).unwrap();
    let source = SyntheticSource {
        bars_15m: vec![],
        bars_1h: vec![],
    };
    let funding = FundingTable::new();
    let err = engine
        .run(
            &source,
            &TestIndicators,
            &funding,
            base_time(),
            base_time() + Duration::hours(1),
        )
        .unwrap_err();
    assert_eq!(err.code(), "DATA_NOT_AVAILABLE");
}
