//! Price source abstraction consumed by the engine.
//!
//! Price sources are stateless data fetchers; the engine orchestrates calls
//! and caches what it needs. The simulation-side [`SimMarkProvider`] consumes
//! `(ts_close_ms, close)` arrays and resolves the mark through the single
//! `close | hlc3 | ohlc4` code path in the exchange, exactly once per bar.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::bar::Bar;
use crate::error::Result;

/// Result of a source health check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthCheck {
    pub ok: bool,
    pub source: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl HealthCheck {
    pub fn ok(source: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            ok: true,
            source: source.into(),
            message: message.into(),
            details: None,
        }
    }

    pub fn failed(source: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            ok: false,
            source: source.into(),
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}

/// Result of a mark price query, with provenance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarkPriceResult {
    pub value: f64,
    pub source: String,
    pub ts_close_ms: i64,
}

/// Abstract mark-price and OHLCV lookup.
///
/// Implementations with actual I/O live outside this crate; the engine only
/// depends on this trait.
pub trait PriceSource {
    /// Unique name identifying this source (e.g. "backtest_parquet").
    fn source_name(&self) -> &str;

    /// Mark price at a specific timestamp, or `None` if unavailable.
    fn get_mark_price(&self, symbol: &str, ts: DateTime<Utc>) -> Option<f64>;

    /// OHLCV bars for `[start, end]` inclusive, sorted by `ts_open` ascending.
    fn get_ohlcv(
        &self,
        symbol: &str,
        tf: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Bar>>;

    /// 1-minute mark series for intra-bar evaluation (optional path).
    fn get_1m_marks(&self, symbol: &str, start: DateTime<Utc>, end: DateTime<Utc>)
        -> Result<Vec<f64>>;

    /// Check whether the source is ready to serve data.
    fn healthcheck(&self) -> HealthCheck;
}

/// Simulated mark price provider over precomputed arrays.
///
/// Deterministic, no lookahead: only closed exec bars feed it. Lookup by
/// close timestamp is O(1).
pub struct SimMarkProvider {
    ts_close_ms: Vec<i64>,
    close: Vec<f64>,
    index: HashMap<i64, usize>,
}

impl SimMarkProvider {
    pub const SOURCE_NAME: &'static str = "backtest_exec_close";

    pub fn new(ts_close_ms: Vec<i64>, close: Vec<f64>) -> Result<Self> {
        if ts_close_ms.len() != close.len() {
            return Err(crate::error::CoreError::Data(format!(
                "Array length mismatch: ts_close={}, close={}",
                ts_close_ms.len(),
                close.len()
            )));
        }
        let index = ts_close_ms
            .iter()
            .enumerate()
            .map(|(i, &ts)| (ts, i))
            .collect();
        Ok(Self {
            ts_close_ms,
            close,
            index,
        })
    }

    pub fn from_bars(bars: &[Bar]) -> Result<Self> {
        Self::new(
            bars.iter().map(|b| b.ts_close_ms()).collect(),
            bars.iter().map(|b| b.close).collect(),
        )
    }

    /// Mark close price at the given exec bar close timestamp.
    pub fn get_mark_close(&self, ts_close_ms: i64) -> Option<f64> {
        self.index.get(&ts_close_ms).map(|&i| self.close[i])
    }

    /// Full mark price result with provenance.
    pub fn get_mark_result(&self, ts_close_ms: i64) -> Option<MarkPriceResult> {
        self.get_mark_close(ts_close_ms).map(|value| MarkPriceResult {
            value,
            source: Self::SOURCE_NAME.to_string(),
            ts_close_ms,
        })
    }

    pub fn len(&self) -> usize {
        self.ts_close_ms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ts_close_ms.is_empty()
    }

    pub fn healthcheck(&self) -> HealthCheck {
        if self.is_empty() {
            return HealthCheck::failed(Self::SOURCE_NAME, "No data available");
        }
        let nan_count = self.close.iter().filter(|v| v.is_nan()).count();
        if nan_count > 0 {
            return HealthCheck::failed(
                Self::SOURCE_NAME,
                format!("Data contains {} NaN values", nan_count),
            )
            .with_details(serde_json::json!({
                "nan_count": nan_count,
                "total": self.len(),
            }));
        }
        HealthCheck::ok(
            Self::SOURCE_NAME,
            format!("Ready with {} bars", self.len()),
        )
        .with_details(serde_json::json!({ "bar_count": self.len() }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sim_mark_provider_lookup() {
        let provider = SimMarkProvider::new(vec![1000, 2000, 3000], vec![10.0, 11.0, 12.0]).unwrap();
        assert_eq!(provider.get_mark_close(2000), Some(11.0));
        assert_eq!(provider.get_mark_close(2500), None);

        let result = provider.get_mark_result(3000).unwrap();
        assert_eq!(result.value, 12.0);
        assert_eq!(result.source, "backtest_exec_close");
    }

    #[test]
    fn test_sim_mark_provider_rejects_length_mismatch() {
        assert!(SimMarkProvider::new(vec![1000], vec![]).is_err());
    }

    #[test]
    fn test_healthcheck_states() {
        let empty = SimMarkProvider::new(vec![], vec![]).unwrap();
        assert!(!empty.healthcheck().ok);

        let nan = SimMarkProvider::new(vec![1000], vec![f64::NAN]).unwrap();
        let check = nan.healthcheck();
        assert!(!check.ok);
        assert!(check.message.contains("NaN"));

        let good = SimMarkProvider::new(vec![1000], vec![10.0]).unwrap();
        assert!(good.healthcheck().ok);
    }
}
