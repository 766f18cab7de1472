//! Per-bar snapshot handed to the Play rule evaluator.
//!
//! The snapshot is an immutable view over the state already computed for the
//! bar: the memoized mark price, per-role feature values, detector outputs,
//! the rationalized state, and a strategy-facing exchange view.
//!
//! Paths resolve in this order:
//! 1. bar fields: `open`, `high`, `low`, `close`, `volume`, `mark_price`
//! 2. `derived.<name>`: rationalized derived values
//! 3. `features.<role>.<name>`: declared indicator values
//! 4. `exec.<key>.<field>` / `htf_<label>.<key>.<field>`: detector outputs

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

use playlab_core::bar::Bar;
use playlab_core::detectors::OutputValue;
use playlab_core::error::{CoreError, Result};
use playlab_core::rationalize::RationalizedState;
use playlab_core::sim::types::ExchangeStateView;
use playlab_core::state::MultiTfState;

/// Immutable per-bar view for rule evaluation.
pub struct Snapshot<'a> {
    pub ts_close: DateTime<Utc>,
    pub bar_idx: i64,
    pub mark_price: f64,
    pub mark_price_source: &'a str,
    pub bar: &'a Bar,
    /// `"<role>.<key>"` -> value at this bar (forward-filled per role)
    pub features: &'a BTreeMap<String, f64>,
    pub structures: &'a MultiTfState,
    pub rationalized: &'a RationalizedState,
    pub exchange: &'a ExchangeStateView,
    /// All declared features finite at their aligned timestamps.
    pub ready: bool,
}

impl<'a> Snapshot<'a> {
    /// Resolve a dotted path to a value. Unknown paths fail loudly with the
    /// valid options of the layer that rejected them.
    pub fn value(&self, path: &str) -> Result<OutputValue> {
        match path {
            "open" => return Ok(OutputValue::Float(self.bar.open)),
            "high" => return Ok(OutputValue::Float(self.bar.high)),
            "low" => return Ok(OutputValue::Float(self.bar.low)),
            "close" => return Ok(OutputValue::Float(self.bar.close)),
            "volume" => return Ok(OutputValue::Float(self.bar.volume)),
            "mark_price" => return Ok(OutputValue::Float(self.mark_price)),
            _ => {}
        }

        if let Some(name) = path.strip_prefix("derived.") {
            return match self.rationalized.derived_values.get(name) {
                Some(&v) => Ok(OutputValue::Float(v)),
                None => Err(CoreError::Config(format!(
                    "Unknown derived value '{}'\n\nAvailable: {}",
                    name,
                    self.rationalized
                        .derived_values
                        .keys()
                        .cloned()
                        .collect::<Vec<_>>()
                        .join(", ")
                ))),
            };
        }

        if let Some(rest) = path.strip_prefix("features.") {
            return match self.features.get(rest) {
                Some(&v) => Ok(OutputValue::Float(v)),
                None => Err(CoreError::Config(format!(
                    "Unknown feature '{}'\n\nDeclared features: {}",
                    rest,
                    self.features.keys().cloned().collect::<Vec<_>>().join(", ")
                ))),
            };
        }

        self.structures.get_value(path)
    }

    /// Numeric view of a path; text/bool values are a type error here.
    pub fn number(&self, path: &str) -> Result<f64> {
        let value = self.value(path)?;
        value.as_f64().ok_or_else(|| {
            CoreError::Config(format!(
                "Path '{}' resolved to non-numeric value '{}'",
                path, value
            ))
        })
    }
}
