//! PlayLab Engine - the bar-by-bar backtest loop and its run artifacts.
//!
//! This crate provides:
//! - The engine loop (warmup, multi-timeframe alignment, hot loop)
//! - Per-bar snapshots handed to the Play rule evaluator
//! - The rule evaluator (compiled condition trees with cross/holds state)
//! - Canonical run artifacts with content hashes, plus a run comparator
//! - An executable audit suite of math/parity/plumbing property checks

pub mod artifacts;
pub mod audit;
pub mod determinism;
pub mod engine;
pub mod evaluator;
pub mod features;
pub mod snapshot;

pub use engine::{BacktestEngine, CancelToken, EngineConfig, EngineResult};
pub use features::{FeatureFrame, IndicatorSource};
pub use snapshot::Snapshot;
