//! Rolling window min/max over an OHLCV field.

use std::collections::BTreeMap;

use crate::bar::BarData;
use crate::detectors::{Deps, Detector, DetectorSpec, OutputValue, ParamView};
use crate::error::Result;
use crate::primitives::{MonotonicDeque, WindowMode};
use crate::registry::Factory;

#[derive(Debug)]
pub struct RollingWindowDetector {
    field: String,
    deque: MonotonicDeque,
    version: u64,
}

impl RollingWindowDetector {
    pub const TYPE_NAME: &'static str = "rolling_window";

    pub fn factory() -> Factory {
        Factory {
            type_name: Self::TYPE_NAME,
            required_params: &["size", "field", "mode"],
            optional_params: &[],
            depends_on: &[],
            build: Self::build,
        }
    }

    fn build(spec: &DetectorSpec, _deps: &BTreeMap<String, usize>) -> Result<Box<dyn Detector>> {
        let view = ParamView::new(&spec.key, &spec.params);
        let size = view.int_min("size", 1, 20)? as usize;
        let field = view.str_choice("field", &["open", "high", "low", "close", "volume"])?;
        let mode = match view.str_choice("mode", &["min", "max"])?.as_str() {
            "max" => WindowMode::Max,
            _ => WindowMode::Min,
        };
        Ok(Box::new(Self {
            field,
            deque: MonotonicDeque::new(size, mode),
            version: 0,
        }))
    }
}

impl Detector for RollingWindowDetector {
    fn type_name(&self) -> &'static str {
        Self::TYPE_NAME
    }

    fn update(&mut self, bar_idx: i64, bar: &BarData, _deps: Deps<'_>) {
        // Field name was validated at build time.
        let value = bar.field(&self.field).unwrap_or(f64::NAN);
        self.deque.push(bar_idx, value);
    }

    fn output_keys(&self) -> Vec<String> {
        vec!["value".to_string()]
    }

    fn get(&self, key: &str) -> Option<OutputValue> {
        match key {
            "value" => Some(match self.deque.get() {
                Some(v) => OutputValue::Float(v),
                None => OutputValue::None,
            }),
            _ => None,
        }
    }

    fn version(&self) -> u64 {
        self.version
    }
}
