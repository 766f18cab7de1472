//! Fibonacci retracement/extension levels from swing points.
//!
//! Levels are recalculated only when the dependency's swing indices change.
//! Values stay NaN until both swings exist.

use std::collections::BTreeMap;

use crate::bar::BarData;
use crate::detectors::{level_key, Deps, Detector, DetectorSpec, OutputValue, ParamView};
use crate::error::Result;
use crate::registry::Factory;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FibMode {
    Retracement,
    Extension,
}

#[derive(Debug)]
pub struct FibonacciDetector {
    swing: usize,
    levels: Vec<f64>,
    keys: Vec<String>,
    mode: FibMode,

    values: Vec<f64>,
    last_high_idx: i64,
    last_low_idx: i64,
    version: u64,
}

impl FibonacciDetector {
    pub const TYPE_NAME: &'static str = "fibonacci";

    pub fn factory() -> Factory {
        Factory {
            type_name: Self::TYPE_NAME,
            required_params: &["levels"],
            optional_params: &["mode"],
            depends_on: &["swing"],
            build: Self::build,
        }
    }

    fn build(spec: &DetectorSpec, deps: &BTreeMap<String, usize>) -> Result<Box<dyn Detector>> {
        let view = ParamView::new(&spec.key, &spec.params);
        let levels = view.positive_levels("levels")?;
        let mode = match view
            .str_choice_or("mode", &["retracement", "extension"], "retracement")?
            .as_str()
        {
            "extension" => FibMode::Extension,
            _ => FibMode::Retracement,
        };
        let keys: Vec<String> = levels.iter().map(|&l| level_key(l)).collect();
        let values = vec![f64::NAN; levels.len()];
        Ok(Box::new(Self {
            swing: deps["swing"],
            levels,
            keys,
            mode,
            values,
            last_high_idx: -1,
            last_low_idx: -1,
            version: 0,
        }))
    }

    fn recalculate(&mut self, high: f64, low: f64) {
        if high.is_nan() || low.is_nan() {
            return;
        }
        let range = high - low;
        for (i, &level) in self.levels.iter().enumerate() {
            self.values[i] = match self.mode {
                FibMode::Retracement => high - range * level,
                FibMode::Extension => high + range * level,
            };
        }
        self.version += 1;
    }
}

impl Detector for FibonacciDetector {
    fn type_name(&self) -> &'static str {
        Self::TYPE_NAME
    }

    fn update(&mut self, _bar_idx: i64, _bar: &BarData, deps: Deps<'_>) {
        let swing = deps.get(self.swing);
        let high_idx = swing.get("high_idx").and_then(|v| v.as_i64()).unwrap_or(-1);
        let low_idx = swing.get("low_idx").and_then(|v| v.as_i64()).unwrap_or(-1);

        if high_idx != self.last_high_idx || low_idx != self.last_low_idx {
            let high = swing
                .get("high_level")
                .and_then(|v| v.as_f64())
                .unwrap_or(f64::NAN);
            let low = swing
                .get("low_level")
                .and_then(|v| v.as_f64())
                .unwrap_or(f64::NAN);
            self.recalculate(high, low);
            self.last_high_idx = high_idx;
            self.last_low_idx = low_idx;
        }
    }

    fn output_keys(&self) -> Vec<String> {
        self.keys.clone()
    }

    fn get(&self, key: &str) -> Option<OutputValue> {
        self.keys
            .iter()
            .position(|k| k == key)
            .map(|i| OutputValue::Float(self.values[i]))
    }

    fn version(&self) -> u64 {
        self.version
    }
}
