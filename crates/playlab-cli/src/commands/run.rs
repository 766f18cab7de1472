//! Run command: execute one Play over bar files and write artifacts.

use std::path::Path;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use colored::Colorize;
use tracing::info;

use playlab_core::play::Play;
use playlab_core::registry::Registry;
use playlab_core::sim::funding::FundingTable;
use playlab_engine::artifacts::write_run_artifacts;
use playlab_engine::engine::{BacktestEngine, EngineConfig};

use super::exit_code_for;
use crate::data::FileBarSource;
use crate::indicators::BuiltinIndicators;

pub struct RunArgs {
    pub play: String,
    pub bars: String,
    pub htf_bars: Vec<String>,
    pub start: String,
    pub end: String,
    pub out: String,
    pub warmup: usize,
    pub events: bool,
}

fn parse_ts(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .with_context(|| format!("invalid timestamp '{}' (expected RFC 3339)", raw))
}

pub fn execute(args: &RunArgs) -> Result<i32> {
    let raw = std::fs::read_to_string(&args.play)
        .with_context(|| format!("cannot read Play file {}", args.play))?;
    let play: Play = serde_json::from_str(&raw)
        .with_context(|| format!("cannot parse Play JSON {}", args.play))?;

    let start = parse_ts(&args.start)?;
    let end = parse_ts(&args.end)?;

    let mut source = FileBarSource::new(play.symbol.clone());
    if let Err(e) = source.load_tf(&play.timeframes.exec, Path::new(&args.bars)) {
        eprintln!("{} {}", "error:".red(), e);
        return Ok(exit_code_for(e.code()));
    }
    for entry in &args.htf_bars {
        let Some((label, path)) = entry.split_once('=') else {
            bail!("--htf-bars entries must be label=path, got '{}'", entry);
        };
        if let Err(e) = source.load_tf(label, Path::new(path)) {
            eprintln!("{} {}", "error:".red(), e);
            return Ok(exit_code_for(e.code()));
        }
    }

    let engine = match BacktestEngine::new(
        play,
        EngineConfig {
            warmup_bars: args.warmup,
            ..EngineConfig::default()
        },
    ) {
        Ok(engine) => engine,
        Err(e) => {
            eprintln!("{} {}", "error:".red(), e);
            return Ok(exit_code_for(e.code()));
        }
    };

    let funding = FundingTable::new();
    let result = match engine.run(&source, &BuiltinIndicators, &funding, start, end) {
        Ok(result) => result,
        Err(e) => {
            eprintln!("{} {}", "error:".red(), e);
            return Ok(exit_code_for(e.code()));
        }
    };

    let registry = Registry::builtin();
    let artifacts = match write_run_artifacts(Path::new(&args.out), &result, &registry, args.events)
    {
        Ok(artifacts) => artifacts,
        Err(e) => {
            eprintln!("{} {}", "error:".red(), e);
            return Ok(exit_code_for(e.code()));
        }
    };
    info!(dir = %artifacts.dir.display(), "artifacts written");

    let summary = &artifacts.result;
    println!("{}", "Run complete".bold());
    println!("  play:        {}", summary.play_id);
    println!("  window:      {} .. {}", args.start, args.end);
    println!("  bars:        {}", summary.bars_processed);
    println!("  trades:      {}", summary.trade_count);
    println!(
        "  final equity: {}",
        format!("{:.2} USDT", summary.final_equity_usdt).cyan()
    );
    println!("  stop reason: {}", summary.stop_reason);
    println!("  run hash:    {}", &summary.run_hash[..16]);
    println!("  artifacts:   {}", artifacts.dir.display());

    if !result.success {
        if let Some(code) = &result.error_code {
            eprintln!(
                "{} {} {}",
                "run failed:".red(),
                code,
                result.error_details.as_deref().unwrap_or("")
            );
            return Ok(exit_code_for(code));
        }
        return Ok(1);
    }
    Ok(0)
}
