//! Bar (OHLCV) data types and timeframe labels.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};

/// Supported Bybit-style timeframe labels, smallest first.
pub const SUPPORTED_TIMEFRAMES: &[&str] = &[
    "1m", "3m", "5m", "15m", "30m", "1h", "2h", "4h", "6h", "12h", "D", "W", "M",
];

/// Convert a timeframe label to its duration in milliseconds.
///
/// "M" uses a 30-day approximation; exact month boundaries come from the data
/// itself (bars carry both open and close timestamps).
pub fn timeframe_ms(label: &str) -> Result<i64> {
    const MINUTE: i64 = 60_000;
    const HOUR: i64 = 60 * MINUTE;
    const DAY: i64 = 24 * HOUR;
    match label {
        "1m" => Ok(MINUTE),
        "3m" => Ok(3 * MINUTE),
        "5m" => Ok(5 * MINUTE),
        "15m" => Ok(15 * MINUTE),
        "30m" => Ok(30 * MINUTE),
        "1h" => Ok(HOUR),
        "2h" => Ok(2 * HOUR),
        "4h" => Ok(4 * HOUR),
        "6h" => Ok(6 * HOUR),
        "12h" => Ok(12 * HOUR),
        "D" => Ok(DAY),
        "W" => Ok(7 * DAY),
        "M" => Ok(30 * DAY),
        _ => Err(CoreError::Config(format!(
            "Unknown timeframe label '{}'. Supported: {}",
            label,
            SUPPORTED_TIMEFRAMES.join(", ")
        ))),
    }
}

/// A single OHLCV bar with both open and close timestamps (UTC).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    /// Trading symbol (e.g., "BTCUSDT")
    pub symbol: String,

    /// Timeframe label (e.g., "15m", "1h", "D")
    pub tf: String,

    /// Bar open timestamp (UTC)
    pub ts_open: DateTime<Utc>,

    /// Bar close timestamp (UTC), strictly after `ts_open`
    pub ts_close: DateTime<Utc>,

    /// Opening price
    pub open: f64,

    /// Highest price during the bar
    pub high: f64,

    /// Lowest price during the bar
    pub low: f64,

    /// Closing price
    pub close: f64,

    /// Traded volume (base units)
    pub volume: f64,
}

impl Bar {
    /// Create a new bar with all fields.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        symbol: impl Into<String>,
        tf: impl Into<String>,
        ts_open: DateTime<Utc>,
        ts_close: DateTime<Utc>,
        open: f64,
        high: f64,
        low: f64,
        close: f64,
        volume: f64,
    ) -> Self {
        Self {
            symbol: symbol.into(),
            tf: tf.into(),
            ts_open,
            ts_close,
            open,
            high,
            low,
            close,
            volume,
        }
    }

    /// Check the OHLC and timestamp invariants.
    ///
    /// `low <= open, close <= high`, `low <= high`, `ts_close > ts_open`.
    pub fn validate(&self) -> Result<()> {
        if !(self.low <= self.high) {
            return Err(CoreError::Data(format!(
                "Bar {} {}: low ({}) > high ({})",
                self.symbol, self.ts_close, self.low, self.high
            )));
        }
        if !(self.low <= self.open && self.open <= self.high) {
            return Err(CoreError::Data(format!(
                "Bar {} {}: open ({}) outside [low, high] = [{}, {}]",
                self.symbol, self.ts_close, self.open, self.low, self.high
            )));
        }
        if !(self.low <= self.close && self.close <= self.high) {
            return Err(CoreError::Data(format!(
                "Bar {} {}: close ({}) outside [low, high] = [{}, {}]",
                self.symbol, self.ts_close, self.close, self.low, self.high
            )));
        }
        if self.ts_close <= self.ts_open {
            return Err(CoreError::Data(format!(
                "Bar {} at {}: ts_close must be after ts_open",
                self.symbol, self.ts_open
            )));
        }
        Ok(())
    }

    /// Bar open timestamp as epoch milliseconds.
    pub fn ts_open_ms(&self) -> i64 {
        self.ts_open.timestamp_millis()
    }

    /// Bar close timestamp as epoch milliseconds.
    pub fn ts_close_ms(&self) -> i64 {
        self.ts_close.timestamp_millis()
    }

    /// Returns the bar's range (high - low).
    pub fn range(&self) -> f64 {
        self.high - self.low
    }

    /// (high + low + close) / 3
    pub fn hlc3(&self) -> f64 {
        (self.high + self.low + self.close) / 3.0
    }

    /// (open + high + low + close) / 4
    pub fn ohlc4(&self) -> f64 {
        (self.open + self.high + self.low + self.close) / 4.0
    }
}

/// Small sorted-vector map for per-bar indicator values.
///
/// Indicators per bar are few and accessed by known names, so a sorted vec
/// with binary search beats a hash map here and keeps `BarData` allocation
/// cheap (the engine reuses a scratch buffer between bars).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IndicatorMap {
    entries: Vec<(String, f64)>,
}

impl IndicatorMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from arbitrary pairs; later duplicates overwrite earlier ones.
    pub fn from_pairs(pairs: impl IntoIterator<Item = (String, f64)>) -> Self {
        let mut map = Self::new();
        for (k, v) in pairs {
            map.insert(k, v);
        }
        map
    }

    /// Insert or overwrite a value.
    pub fn insert(&mut self, key: impl Into<String>, value: f64) {
        let key = key.into();
        match self.entries.binary_search_by(|(k, _)| k.as_str().cmp(&key)) {
            Ok(i) => self.entries[i].1 = value,
            Err(i) => self.entries.insert(i, (key, value)),
        }
    }

    /// Look up a value by name.
    pub fn get(&self, key: &str) -> Option<f64> {
        self.entries
            .binary_search_by(|(k, _)| k.as_str().cmp(key))
            .ok()
            .map(|i| self.entries[i].1)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), *v))
    }
}

/// Single bar passed to structure detector updates.
///
/// `idx` is the per-timeframe bar index, monotonically increasing.
/// `indicators` holds pre-computed indicator values forward-filled from the
/// bar's timeframe.
#[derive(Debug, Clone, PartialEq)]
pub struct BarData {
    pub idx: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub indicators: IndicatorMap,
}

impl BarData {
    pub fn new(idx: i64, open: f64, high: f64, low: f64, close: f64, volume: f64) -> Self {
        Self {
            idx,
            open,
            high,
            low,
            close,
            volume,
            indicators: IndicatorMap::new(),
        }
    }

    pub fn with_indicators(mut self, indicators: IndicatorMap) -> Self {
        self.indicators = indicators;
        self
    }

    /// Read an OHLCV field by name ("open", "high", "low", "close", "volume").
    pub fn field(&self, name: &str) -> Option<f64> {
        match name {
            "open" => Some(self.open),
            "high" => Some(self.high),
            "low" => Some(self.low),
            "close" => Some(self.close),
            "volume" => Some(self.volume),
            _ => None,
        }
    }
}
