//! Feature-value interface and per-role feature frames.
//!
//! Indicator implementations live outside this workspace; the engine only
//! consumes a feature-value interface and materializes per-role arrays
//! aligned with bar closes. Values are forward-filled into detector bar data
//! and checked for finiteness during warmup.

use std::collections::BTreeMap;

use playlab_core::bar::Bar;
use playlab_core::error::{CoreError, Result};
use playlab_core::play::FeatureSpec;

/// External indicator computation interface.
///
/// Implementations must return one value per input bar, aligned by index
/// (NaN for not-yet-warm positions).
pub trait IndicatorSource {
    fn compute(&self, feature: &FeatureSpec, bars: &[Bar]) -> Result<Vec<f64>>;
}

/// Computed feature arrays for one TF role, aligned with that role's bars.
#[derive(Debug, Clone, Default)]
pub struct FeatureFrame {
    /// output key -> per-bar values
    columns: BTreeMap<String, Vec<f64>>,
    len: usize,
}

impl FeatureFrame {
    /// Compute all declared features for a role over its bars.
    pub fn compute(
        source: &dyn IndicatorSource,
        features: &[FeatureSpec],
        bars: &[Bar],
    ) -> Result<Self> {
        let mut columns = BTreeMap::new();
        for feature in features {
            let values = source.compute(feature, bars)?;
            if values.len() != bars.len() {
                return Err(CoreError::Data(format!(
                    "Indicator '{}' returned {} values for {} bars",
                    feature.output_key(),
                    values.len(),
                    bars.len()
                )));
            }
            columns.insert(feature.output_key().to_string(), values);
        }
        Ok(Self {
            columns,
            len: bars.len(),
        })
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    /// Value of one feature at a bar index.
    pub fn value_at(&self, key: &str, idx: usize) -> Option<f64> {
        self.columns.get(key).and_then(|v| v.get(idx)).copied()
    }

    /// All features at a bar index.
    pub fn row(&self, idx: usize) -> impl Iterator<Item = (&str, f64)> {
        self.columns
            .iter()
            .filter_map(move |(k, v)| v.get(idx).map(|&x| (k.as_str(), x)))
    }

    /// True when every feature value at this index is finite.
    pub fn all_finite_at(&self, idx: usize) -> bool {
        self.columns
            .values()
            .all(|v| v.get(idx).map(|x| x.is_finite()).unwrap_or(false))
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.columns.keys().map(|k| k.as_str())
    }
}
