//! Swing high/low detector with delayed confirmation.
//!
//! A pivot at the window center is confirmed when the full `left + 1 + right`
//! window is present and the center's high (resp. low) is strictly greater
//! (resp. less) than every other high (low) in the window. Confirmation is
//! therefore always delayed by exactly `right` bars: a high at bar N is
//! published at bar N + right, with `high_idx` reporting N.

use crate::bar::BarData;
use crate::detectors::{Deps, Detector, DetectorSpec, OutputValue, ParamView};
use crate::error::Result;
use crate::primitives::RingBuffer;
use crate::registry::Factory;

#[derive(Debug)]
pub struct SwingDetector {
    left: usize,
    right: usize,
    high_buf: RingBuffer,
    low_buf: RingBuffer,

    high_level: f64,
    high_idx: i64,
    low_level: f64,
    low_idx: i64,

    version: u64,
    last_confirmed_pivot_idx: i64,
    last_confirmed_pivot_type: String,
}

impl SwingDetector {
    pub const TYPE_NAME: &'static str = "swing";

    pub fn factory() -> Factory {
        Factory {
            type_name: Self::TYPE_NAME,
            required_params: &["left", "right"],
            optional_params: &[],
            depends_on: &[],
            build: Self::build,
        }
    }

    fn build(
        spec: &DetectorSpec,
        _deps: &std::collections::BTreeMap<String, usize>,
    ) -> Result<Box<dyn Detector>> {
        let view = ParamView::new(&spec.key, &spec.params);
        let left = view.int_min("left", 1, 5)? as usize;
        let right = view.int_min("right", 1, 5)? as usize;
        let window = left + right + 1;
        Ok(Box::new(Self {
            left,
            right,
            high_buf: RingBuffer::new(window),
            low_buf: RingBuffer::new(window),
            high_level: f64::NAN,
            high_idx: -1,
            low_level: f64::NAN,
            low_idx: -1,
            version: 0,
            last_confirmed_pivot_idx: -1,
            last_confirmed_pivot_type: String::new(),
        }))
    }

    fn is_swing_high(&self, pivot: usize) -> bool {
        let pivot_val = self.high_buf.get(pivot).unwrap_or(f64::NAN);
        for i in 0..self.high_buf.len() {
            if i != pivot && self.high_buf.get(i).unwrap_or(f64::NAN) >= pivot_val {
                return false;
            }
        }
        true
    }

    fn is_swing_low(&self, pivot: usize) -> bool {
        let pivot_val = self.low_buf.get(pivot).unwrap_or(f64::NAN);
        for i in 0..self.low_buf.len() {
            if i != pivot && self.low_buf.get(i).unwrap_or(f64::NAN) <= pivot_val {
                return false;
            }
        }
        true
    }
}

impl Detector for SwingDetector {
    fn type_name(&self) -> &'static str {
        Self::TYPE_NAME
    }

    fn update(&mut self, bar_idx: i64, bar: &BarData, _deps: Deps<'_>) {
        self.high_buf.push(bar.high);
        self.low_buf.push(bar.low);

        if !self.high_buf.is_full() {
            return;
        }

        // Pivot sits at buffer index `left`, which is bar_idx - right absolute.
        let pivot = self.left;
        let pivot_bar_idx = bar_idx - self.right as i64;

        if self.is_swing_high(pivot) {
            self.high_level = self.high_buf.get(pivot).unwrap_or(f64::NAN);
            self.high_idx = pivot_bar_idx;
            self.version += 1;
            self.last_confirmed_pivot_idx = pivot_bar_idx;
            self.last_confirmed_pivot_type = "high".to_string();
        }

        if self.is_swing_low(pivot) {
            self.low_level = self.low_buf.get(pivot).unwrap_or(f64::NAN);
            self.low_idx = pivot_bar_idx;
            self.version += 1;
            self.last_confirmed_pivot_idx = pivot_bar_idx;
            self.last_confirmed_pivot_type = "low".to_string();
        }
    }

    fn output_keys(&self) -> Vec<String> {
        vec![
            "high_level".to_string(),
            "high_idx".to_string(),
            "low_level".to_string(),
            "low_idx".to_string(),
            "version".to_string(),
            "last_confirmed_pivot_idx".to_string(),
            "last_confirmed_pivot_type".to_string(),
        ]
    }

    fn get(&self, key: &str) -> Option<OutputValue> {
        match key {
            "high_level" => Some(OutputValue::Float(self.high_level)),
            "high_idx" => Some(OutputValue::Int(self.high_idx)),
            "low_level" => Some(OutputValue::Float(self.low_level)),
            "low_idx" => Some(OutputValue::Int(self.low_idx)),
            "version" => Some(OutputValue::Int(self.version as i64)),
            "last_confirmed_pivot_idx" => Some(OutputValue::Int(self.last_confirmed_pivot_idx)),
            "last_confirmed_pivot_type" => {
                Some(OutputValue::Text(self.last_confirmed_pivot_type.clone()))
            }
            _ => None,
        }
    }

    fn version(&self) -> u64 {
        self.version
    }
}
