//! Trend classification from the swing sequence.
//!
//! Direction is +1 on higher highs AND higher lows, -1 on lower highs AND
//! lower lows, 0 otherwise (ranging or insufficient data). `bars_in_trend`
//! increments per bar and resets on a direction flip, which also bumps the
//! version.

use std::collections::BTreeMap;

use crate::bar::BarData;
use crate::detectors::{Deps, Detector, DetectorSpec, OutputValue};
use crate::error::Result;
use crate::registry::Factory;

#[derive(Debug)]
pub struct TrendDetector {
    swing: usize,

    prev_high: f64,
    prev_low: f64,
    last_high_idx: i64,
    last_low_idx: i64,
    last_hh: Option<bool>,
    last_hl: Option<bool>,

    direction: i64,
    strength: f64,
    bars_in_trend: i64,
    version: u64,
}

impl TrendDetector {
    pub const TYPE_NAME: &'static str = "trend";

    pub fn factory() -> Factory {
        Factory {
            type_name: Self::TYPE_NAME,
            required_params: &[],
            optional_params: &[],
            depends_on: &["swing"],
            build: Self::build,
        }
    }

    fn build(_spec: &DetectorSpec, deps: &BTreeMap<String, usize>) -> Result<Box<dyn Detector>> {
        Ok(Box::new(Self {
            swing: deps["swing"],
            prev_high: f64::NAN,
            prev_low: f64::NAN,
            last_high_idx: -1,
            last_low_idx: -1,
            last_hh: None,
            last_hl: None,
            direction: 0,
            strength: 0.0,
            bars_in_trend: 0,
            version: 0,
        }))
    }

    fn classify(hh: Option<bool>, hl: Option<bool>) -> i64 {
        match (hh, hl) {
            (Some(true), Some(true)) => 1,
            (Some(false), Some(false)) => -1,
            _ => 0,
        }
    }
}

impl Detector for TrendDetector {
    fn type_name(&self) -> &'static str {
        Self::TYPE_NAME
    }

    fn update(&mut self, _bar_idx: i64, _bar: &BarData, deps: Deps<'_>) {
        let swing = deps.get(self.swing);
        let high_idx = swing.get("high_idx").and_then(|v| v.as_i64()).unwrap_or(-1);
        let low_idx = swing.get("low_idx").and_then(|v| v.as_i64()).unwrap_or(-1);

        let high_changed = high_idx != self.last_high_idx && high_idx >= 0;
        let low_changed = low_idx != self.last_low_idx && low_idx >= 0;

        if !high_changed && !low_changed {
            self.bars_in_trend += 1;
            return;
        }

        let current_high = swing
            .get("high_level")
            .and_then(|v| v.as_f64())
            .unwrap_or(f64::NAN);
        let current_low = swing
            .get("low_level")
            .and_then(|v| v.as_f64())
            .unwrap_or(f64::NAN);

        if high_changed && !self.prev_high.is_nan() && !current_high.is_nan() {
            self.last_hh = Some(current_high > self.prev_high);
        }
        if low_changed && !self.prev_low.is_nan() && !current_low.is_nan() {
            self.last_hl = Some(current_low > self.prev_low);
        }

        let new_dir = Self::classify(self.last_hh, self.last_hl);
        if new_dir != self.direction {
            self.direction = new_dir;
            self.bars_in_trend = 0;
            self.version += 1;
        } else {
            self.bars_in_trend += 1;
        }

        if high_changed {
            self.prev_high = current_high;
            self.last_high_idx = high_idx;
        }
        if low_changed {
            self.prev_low = current_low;
            self.last_low_idx = low_idx;
        }
    }

    fn output_keys(&self) -> Vec<String> {
        vec![
            "direction".to_string(),
            "strength".to_string(),
            "bars_in_trend".to_string(),
            "version".to_string(),
        ]
    }

    fn get(&self, key: &str) -> Option<OutputValue> {
        match key {
            "direction" => Some(OutputValue::Int(self.direction)),
            "strength" => Some(OutputValue::Float(self.strength)),
            "bars_in_trend" => Some(OutputValue::Int(self.bars_in_trend)),
            "version" => Some(OutputValue::Int(self.version as i64)),
            _ => None,
        }
    }

    fn version(&self) -> u64 {
        self.version
    }
}
