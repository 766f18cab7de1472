//! Parquet-backed bar files as a PriceSource.
//!
//! Expected columns: `ts_open_ms` (i64), `ts_close_ms` (i64), `open`, `high`,
//! `low`, `close`, `volume` (f64). Symbol and timeframe come from the file
//! registration, not the file contents.

use std::collections::BTreeMap;
use std::path::Path;

use chrono::{DateTime, TimeZone, Utc};
use polars::prelude::*;

use playlab_core::bar::Bar;
use playlab_core::error::{CoreError, Result};
use playlab_core::prices::{HealthCheck, PriceSource};

/// Read one bar file into memory.
pub fn read_bars_parquet(path: &Path, symbol: &str, tf: &str) -> Result<Vec<Bar>> {
    let file = std::fs::File::open(path)
        .map_err(|e| CoreError::DataNotAvailable(format!("{}: {}", path.display(), e)))?;
    let df = ParquetReader::new(file)
        .finish()
        .map_err(|e| CoreError::Data(format!("parquet read {}: {}", path.display(), e)))?;

    let col_i64 = |name: &str| -> Result<Vec<i64>> {
        Ok(df
            .column(name)
            .map_err(|e| CoreError::Data(format!("column '{}': {}", name, e)))?
            .i64()
            .map_err(|e| CoreError::Data(format!("column '{}' is not i64: {}", name, e)))?
            .into_no_null_iter()
            .collect())
    };
    let col_f64 = |name: &str| -> Result<Vec<f64>> {
        Ok(df
            .column(name)
            .map_err(|e| CoreError::Data(format!("column '{}': {}", name, e)))?
            .f64()
            .map_err(|e| CoreError::Data(format!("column '{}' is not f64: {}", name, e)))?
            .into_no_null_iter()
            .collect())
    };

    let ts_open = col_i64("ts_open_ms")?;
    let ts_close = col_i64("ts_close_ms")?;
    let open = col_f64("open")?;
    let high = col_f64("high")?;
    let low = col_f64("low")?;
    let close = col_f64("close")?;
    let volume = col_f64("volume")?;

    let mut bars = Vec::with_capacity(ts_open.len());
    for i in 0..ts_open.len() {
        let ts_open = Utc
            .timestamp_millis_opt(ts_open[i])
            .single()
            .ok_or_else(|| CoreError::Data(format!("invalid ts_open_ms at row {}", i)))?;
        let ts_close = Utc
            .timestamp_millis_opt(ts_close[i])
            .single()
            .ok_or_else(|| CoreError::Data(format!("invalid ts_close_ms at row {}", i)))?;
        let bar = Bar::new(
            symbol, tf, ts_open, ts_close, open[i], high[i], low[i], close[i], volume[i],
        );
        bar.validate()?;
        bars.push(bar);
    }
    bars.sort_by_key(|b| b.ts_open);
    Ok(bars)
}

/// In-memory PriceSource over bar files keyed by timeframe label.
pub struct FileBarSource {
    symbol: String,
    by_tf: BTreeMap<String, Vec<Bar>>,
}

impl FileBarSource {
    pub fn new(symbol: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into(),
            by_tf: BTreeMap::new(),
        }
    }

    pub fn load_tf(&mut self, tf: &str, path: &Path) -> Result<()> {
        let bars = read_bars_parquet(path, &self.symbol, tf)?;
        self.by_tf.insert(tf.to_string(), bars);
        Ok(())
    }
}

impl PriceSource for FileBarSource {
    fn source_name(&self) -> &str {
        "backtest_parquet"
    }

    fn get_mark_price(&self, _symbol: &str, ts: DateTime<Utc>) -> Option<f64> {
        self.by_tf
            .values()
            .flat_map(|bars| bars.iter())
            .find(|b| b.ts_close == ts)
            .map(|b| b.close)
    }

    fn get_ohlcv(
        &self,
        symbol: &str,
        tf: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Bar>> {
        if symbol != self.symbol {
            return Err(CoreError::DataNotAvailable(format!(
                "symbol '{}' not loaded (have '{}')",
                symbol, self.symbol
            )));
        }
        let bars = self.by_tf.get(tf).ok_or_else(|| {
            CoreError::DataNotAvailable(format!(
                "no bars loaded for tf '{}' (have: {})",
                tf,
                self.by_tf.keys().cloned().collect::<Vec<_>>().join(", ")
            ))
        })?;
        Ok(bars
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
        Err(CoreError::DataNotAvailable(
            "1m mark series not available from bar files".to_string(),
        ))
    }

    fn healthcheck(&self) -> HealthCheck {
        if self.by_tf.is_empty() {
            return HealthCheck::failed("backtest_parquet", "no bar files loaded");
        }
        let total: usize = self.by_tf.values().map(|v| v.len()).sum();
        HealthCheck::ok("backtest_parquet", format!("{} bars loaded", total))
    }
}
