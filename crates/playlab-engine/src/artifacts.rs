//! Canonical run artifacts with content hashes.
//!
//! Every run writes a fixed file set under
//! `runs/<play_id>/<symbol>/<tf_exec>/<window_start>_<window_end>_<hash8>/`:
//! `result.json`, `trades.parquet`, `equity.parquet`, optional `events.csv`,
//! `run_manifest.json`, `pipeline_signature.json`.
//!
//! Hash rules:
//! - `trades_hash` / `equity_hash`: SHA-256 over row-canonicalized content
//!   (fixed column order, `|`-joined fields, shortest round-trip floats)
//! - `play_hash`: SHA-256 over the canonical Play JSON
//! - `run_hash`: SHA-256 over `play_hash || trades_hash || equity_hash ||
//!   pipeline signature hash`

use std::fs;
use std::io::Write as _;
use std::path::{Path, PathBuf};

use polars::prelude::*;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use playlab_core::error::{CoreError, Result};
use playlab_core::registry::Registry;
use playlab_core::sim::types::{EquityPoint, Trade};

use crate::engine::EngineResult;

/// Artifact schema version, bumped on any column/layout change.
pub const ARTIFACT_SCHEMA_VERSION: &str = "1.0.0";

pub const FILE_RESULT: &str = "result.json";
pub const FILE_TRADES: &str = "trades.parquet";
pub const FILE_EQUITY: &str = "equity.parquet";
pub const FILE_EVENTS: &str = "events.csv";
pub const FILE_MANIFEST: &str = "run_manifest.json";
pub const FILE_PIPELINE_SIGNATURE: &str = "pipeline_signature.json";

/// Summary written to `result.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultSummary {
    pub schema_version: String,
    pub success: bool,
    pub stop_reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    pub play_id: String,
    pub symbol: String,
    pub tf_exec: String,
    pub window_start_ms: i64,
    pub window_end_ms: i64,
    pub bars_processed: usize,
    pub trade_count: usize,
    pub final_equity_usdt: f64,
    pub total_fees_usdt: f64,
    pub trades_hash: String,
    pub equity_hash: String,
    pub play_hash: String,
    pub run_hash: String,
}

/// Manifest written to `run_manifest.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunManifest {
    pub play_id: String,
    pub play_hash: String,
    pub symbols: Vec<String>,
    pub tf_exec: String,
    pub htf_labels: Vec<String>,
    pub window_start_ms: i64,
    pub window_end_ms: i64,
    pub data_source_id: String,
    pub equity_timestamp_column: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eval_start_ts_ms: Option<i64>,
}

/// Schema/registry fingerprints written to `pipeline_signature.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineSignature {
    pub schema_version: String,
    pub trades_columns: Vec<String>,
    pub equity_columns: Vec<String>,
    pub detector_registry: String,
}

impl PipelineSignature {
    pub fn current(registry: &Registry) -> Self {
        Self {
            schema_version: ARTIFACT_SCHEMA_VERSION.to_string(),
            trades_columns: TRADE_COLUMNS.iter().map(|c| c.to_string()).collect(),
            equity_columns: vec!["ts_ms".to_string(), "equity".to_string()],
            detector_registry: registry.fingerprint(),
        }
    }

    pub fn hash(&self) -> Result<String> {
        Ok(sha256_hex(serde_json::to_string(self)?.as_bytes()))
    }
}

/// Written artifact locations plus the result summary.
#[derive(Debug, Clone)]
pub struct RunArtifacts {
    pub dir: PathBuf,
    pub result: ResultSummary,
}

const TRADE_COLUMNS: &[&str] = &[
    "trade_id",
    "symbol",
    "side",
    "entry_time_ms",
    "entry_price",
    "entry_size",
    "entry_size_usdt",
    "exit_time_ms",
    "exit_price",
    "exit_reason",
    "exit_price_source",
    "realized_pnl",
    "fees_paid",
    "net_pnl",
    "funding_pnl",
    "stop_loss",
    "take_profit",
    "entry_bar_index",
    "exit_bar_index",
];

fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

fn fmt_opt(value: Option<f64>) -> String {
    match value {
        Some(v) => format!("{}", v),
        None => "null".to_string(),
    }
}

/// Trades sorted by `(entry_time, entry_bar_index)`; the canonical row order
/// for both the parquet file and the hash.
fn sorted_trades(trades: &[Trade]) -> Vec<&Trade> {
    let mut sorted: Vec<&Trade> = trades.iter().collect();
    sorted.sort_by_key(|t| (t.entry_time.timestamp_millis(), t.entry_bar_index));
    sorted
}

/// Row-canonicalized trades hash.
pub fn trades_hash(trades: &[Trade]) -> String {
    let mut canon = String::new();
    for trade in sorted_trades(trades) {
        let reason = serde_json::to_string(&trade.exit_reason).unwrap_or_default();
        let source = serde_json::to_string(&trade.exit_price_source).unwrap_or_default();
        let side = serde_json::to_string(&trade.side).unwrap_or_default();
        canon.push_str(&format!(
            "{}|{}|{}|{}|{}|{}|{}|{}|{}|{}|{}|{}|{}|{}|{}|{}|{}|{}|{}\n",
            trade.trade_id,
            trade.symbol,
            side,
            trade.entry_time.timestamp_millis(),
            trade.entry_price,
            trade.entry_size,
            trade.entry_size_usdt,
            trade.exit_time.timestamp_millis(),
            trade.exit_price,
            reason,
            source,
            trade.realized_pnl,
            trade.fees_paid,
            trade.net_pnl,
            trade.funding_pnl,
            fmt_opt(trade.stop_loss),
            fmt_opt(trade.take_profit),
            trade.entry_bar_index,
            trade.exit_bar_index,
        ));
    }
    sha256_hex(canon.as_bytes())
}

/// Row-canonicalized equity hash (sorted by `ts_ms`).
pub fn equity_hash(points: &[EquityPoint]) -> String {
    let mut sorted: Vec<&EquityPoint> = points.iter().collect();
    sorted.sort_by_key(|p| p.ts_ms);
    let mut canon = String::new();
    for point in sorted {
        canon.push_str(&format!("{}|{}\n", point.ts_ms, point.equity));
    }
    sha256_hex(canon.as_bytes())
}

/// Run hash over the play/trades/equity hashes plus the pipeline signature.
pub fn run_hash(
    play_hash: &str,
    trades_hash: &str,
    equity_hash: &str,
    signature_hash: &str,
) -> String {
    sha256_hex(format!("{}{}{}{}", play_hash, trades_hash, equity_hash, signature_hash).as_bytes())
}

fn trades_to_dataframe(trades: &[Trade]) -> Result<DataFrame> {
    let sorted = sorted_trades(trades);
    let enum_str = |v: serde_json::Result<String>| v.unwrap_or_default().trim_matches('"').to_string();

    let trade_id: Vec<String> = sorted.iter().map(|t| t.trade_id.clone()).collect();
    let symbol: Vec<String> = sorted.iter().map(|t| t.symbol.clone()).collect();
    let side: Vec<String> = sorted
        .iter()
        .map(|t| enum_str(serde_json::to_string(&t.side)))
        .collect();
    let entry_time_ms: Vec<i64> = sorted
        .iter()
        .map(|t| t.entry_time.timestamp_millis())
        .collect();
    let entry_price: Vec<f64> = sorted.iter().map(|t| t.entry_price).collect();
    let entry_size: Vec<f64> = sorted.iter().map(|t| t.entry_size).collect();
    let entry_size_usdt: Vec<f64> = sorted.iter().map(|t| t.entry_size_usdt).collect();
    let exit_time_ms: Vec<i64> = sorted
        .iter()
        .map(|t| t.exit_time.timestamp_millis())
        .collect();
    let exit_price: Vec<f64> = sorted.iter().map(|t| t.exit_price).collect();
    let exit_reason: Vec<String> = sorted
        .iter()
        .map(|t| enum_str(serde_json::to_string(&t.exit_reason)))
        .collect();
    let exit_price_source: Vec<String> = sorted
        .iter()
        .map(|t| enum_str(serde_json::to_string(&t.exit_price_source)))
        .collect();
    let realized_pnl: Vec<f64> = sorted.iter().map(|t| t.realized_pnl).collect();
    let fees_paid: Vec<f64> = sorted.iter().map(|t| t.fees_paid).collect();
    let net_pnl: Vec<f64> = sorted.iter().map(|t| t.net_pnl).collect();
    let funding_pnl: Vec<f64> = sorted.iter().map(|t| t.funding_pnl).collect();
    let stop_loss: Vec<Option<f64>> = sorted.iter().map(|t| t.stop_loss).collect();
    let take_profit: Vec<Option<f64>> = sorted.iter().map(|t| t.take_profit).collect();
    let entry_bar_index: Vec<i64> = sorted.iter().map(|t| t.entry_bar_index).collect();
    let exit_bar_index: Vec<i64> = sorted.iter().map(|t| t.exit_bar_index).collect();

    DataFrame::new(vec![
        Series::new("trade_id".into(), trade_id).into(),
        Series::new("symbol".into(), symbol).into(),
        Series::new("side".into(), side).into(),
        Series::new("entry_time_ms".into(), entry_time_ms).into(),
        Series::new("entry_price".into(), entry_price).into(),
        Series::new("entry_size".into(), entry_size).into(),
        Series::new("entry_size_usdt".into(), entry_size_usdt).into(),
        Series::new("exit_time_ms".into(), exit_time_ms).into(),
        Series::new("exit_price".into(), exit_price).into(),
        Series::new("exit_reason".into(), exit_reason).into(),
        Series::new("exit_price_source".into(), exit_price_source).into(),
        Series::new("realized_pnl".into(), realized_pnl).into(),
        Series::new("fees_paid".into(), fees_paid).into(),
        Series::new("net_pnl".into(), net_pnl).into(),
        Series::new("funding_pnl".into(), funding_pnl).into(),
        Series::new("stop_loss".into(), stop_loss).into(),
        Series::new("take_profit".into(), take_profit).into(),
        Series::new("entry_bar_index".into(), entry_bar_index).into(),
        Series::new("exit_bar_index".into(), exit_bar_index).into(),
    ])
    .map_err(|e| CoreError::Data(format!("trades dataframe: {}", e)))
}

fn equity_to_dataframe(points: &[EquityPoint]) -> Result<DataFrame> {
    let mut sorted: Vec<&EquityPoint> = points.iter().collect();
    sorted.sort_by_key(|p| p.ts_ms);
    let ts_ms: Vec<i64> = sorted.iter().map(|p| p.ts_ms).collect();
    let equity: Vec<f64> = sorted.iter().map(|p| p.equity).collect();
    DataFrame::new(vec![
        Series::new("ts_ms".into(), ts_ms).into(),
        Series::new("equity".into(), equity).into(),
    ])
    .map_err(|e| CoreError::Data(format!("equity dataframe: {}", e)))
}

fn write_parquet(df: &mut DataFrame, path: &Path) -> Result<()> {
    let file = fs::File::create(path)?;
    ParquetWriter::new(file)
        .finish(df)
        .map_err(|e| CoreError::Data(format!("parquet write {}: {}", path.display(), e)))?;
    Ok(())
}

/// Write the canonical artifact set for a finished run.
///
/// `root` is the base runs directory; the canonical subdirectory is created
/// beneath it. Pass `write_events` to include the optional `events.csv`.
pub fn write_run_artifacts(
    root: &Path,
    result: &EngineResult,
    registry: &Registry,
    write_events: bool,
) -> Result<RunArtifacts> {
    let signature = PipelineSignature::current(registry);
    let signature_hash = signature.hash()?;

    let trades_hash = trades_hash(&result.trades);
    let equity_hash = equity_hash(&result.equity);
    let run_hash = run_hash(&result.play_hash, &trades_hash, &equity_hash, &signature_hash);

    let dir = root
        .join(&result.play_id)
        .join(&result.symbol)
        .join(&result.tf_exec)
        .join(format!(
            "{}_{}_{}",
            result.window_start_ms,
            result.window_end_ms,
            &run_hash[..8]
        ));
    fs::create_dir_all(&dir)?;

    let summary = ResultSummary {
        schema_version: ARTIFACT_SCHEMA_VERSION.to_string(),
        success: result.success,
        stop_reason: serde_json::to_string(&result.stop_reason)
            .unwrap_or_default()
            .trim_matches('"')
            .to_string(),
        error_code: result.error_code.clone(),
        play_id: result.play_id.clone(),
        symbol: result.symbol.clone(),
        tf_exec: result.tf_exec.clone(),
        window_start_ms: result.window_start_ms,
        window_end_ms: result.window_end_ms,
        bars_processed: result.bars_processed,
        trade_count: result.trades.len(),
        final_equity_usdt: result.final_ledger.equity_usdt,
        total_fees_usdt: result.final_ledger.total_fees_paid,
        trades_hash,
        equity_hash,
        play_hash: result.play_hash.clone(),
        run_hash,
    };

    fs::write(
        dir.join(FILE_RESULT),
        serde_json::to_string_pretty(&summary)?,
    )?;

    let mut trades_df = trades_to_dataframe(&result.trades)?;
    write_parquet(&mut trades_df, &dir.join(FILE_TRADES))?;

    let mut equity_df = equity_to_dataframe(&result.equity)?;
    write_parquet(&mut equity_df, &dir.join(FILE_EQUITY))?;

    if write_events {
        let mut file = fs::File::create(dir.join(FILE_EVENTS))?;
        writeln!(file, "ts_ms,kind,detail,amount_usdt")?;
        for event in &result.events {
            writeln!(
                file,
                "{},{},{},{}",
                event.ts_ms, event.kind, event.detail, event.amount_usdt
            )?;
        }
    }

    let manifest = RunManifest {
        play_id: result.play_id.clone(),
        play_hash: result.play_hash.clone(),
        symbols: vec![result.symbol.clone()],
        tf_exec: result.tf_exec.clone(),
        htf_labels: result.htf_labels.clone(),
        window_start_ms: result.window_start_ms,
        window_end_ms: result.window_end_ms,
        data_source_id: result.data_source_id.clone(),
        equity_timestamp_column: "ts_ms".to_string(),
        eval_start_ts_ms: result.eval_start_ts_ms,
    };
    fs::write(
        dir.join(FILE_MANIFEST),
        serde_json::to_string_pretty(&manifest)?,
    )?;
    fs::write(
        dir.join(FILE_PIPELINE_SIGNATURE),
        serde_json::to_string_pretty(&signature)?,
    )?;

    Ok(RunArtifacts {
        dir,
        result: summary,
    })
}

/// Load a previously written `result.json`.
pub fn load_result_summary(run_dir: &Path) -> Result<ResultSummary> {
    let path = run_dir.join(FILE_RESULT);
    let raw = fs::read_to_string(&path)
        .map_err(|e| CoreError::DataNotAvailable(format!("{}: {}", path.display(), e)))?;
    Ok(serde_json::from_str(&raw)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use playlab_core::sim::types::{ExitPriceSource, FillReason, OrderSide};

    fn trade(id: &str, entry_ms: i64, entry_bar: i64) -> Trade {
        Trade {
            trade_id: id.to_string(),
            symbol: "BTCUSDT".to_string(),
            side: OrderSide::Long,
            entry_time: Utc.timestamp_millis_opt(entry_ms).unwrap(),
            entry_price: 40_000.0,
            entry_size: 0.25,
            entry_size_usdt: 10_000.0,
            exit_time: Utc.timestamp_millis_opt(entry_ms + 900_000).unwrap(),
            exit_price: 41_000.0,
            exit_reason: FillReason::TakeProfit,
            exit_price_source: ExitPriceSource::TpLevel,
            realized_pnl: 250.0,
            fees_paid: 12.0,
            net_pnl: 238.0,
            funding_pnl: 0.0,
            stop_loss: Some(39_000.0),
            take_profit: Some(41_000.0),
            entry_bar_index: entry_bar,
            exit_bar_index: entry_bar + 1,
        }
    }

    #[test]
    fn test_trades_hash_is_order_insensitive() {
        let a = vec![trade("trade-000001", 1_000, 1), trade("trade-000002", 2_000, 2)];
        let b = vec![trade("trade-000002", 2_000, 2), trade("trade-000001", 1_000, 1)];
        assert_eq!(trades_hash(&a), trades_hash(&b));
    }

    #[test]
    fn test_trades_hash_sensitive_to_content() {
        let a = vec![trade("trade-000001", 1_000, 1)];
        let mut changed = a.clone();
        changed[0].realized_pnl += 0.000001;
        assert_ne!(trades_hash(&a), trades_hash(&changed));
    }

    #[test]
    fn test_equity_hash_stable() {
        let points = vec![
            EquityPoint { ts_ms: 2_000, equity: 10_010.0 },
            EquityPoint { ts_ms: 1_000, equity: 10_000.0 },
        ];
        let shuffled = vec![points[1], points[0]];
        assert_eq!(equity_hash(&points), equity_hash(&shuffled));
        assert_eq!(equity_hash(&[]), equity_hash(&[]));
    }

    #[test]
    fn test_pipeline_signature_hash_stable() {
        let registry = Registry::builtin();
        let a = PipelineSignature::current(&registry).hash().unwrap();
        let b = PipelineSignature::current(&registry).hash().unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_run_hash_composition() {
        let h = run_hash("p", "t", "e", "s");
        assert_eq!(h, sha256_hex(b"ptes"));
        assert_ne!(h, run_hash("p", "t", "e", "x"));
    }
}
