//! Demand/supply zone detector with an ATR-scaled width.
//!
//! State machine: none -> active on a new swing of the matching side,
//! active -> broken when the close violates the far boundary. Broken is
//! absorbing until the next swing on that side replaces the zone.

use std::collections::BTreeMap;

use crate::bar::BarData;
use crate::detectors::{Deps, Detector, DetectorSpec, OutputValue, ParamView};
use crate::error::Result;
use crate::registry::Factory;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ZoneSide {
    Demand,
    Supply,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ZoneState {
    None,
    Active,
    Broken,
}

impl ZoneState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ZoneState::None => "none",
            ZoneState::Active => "active",
            ZoneState::Broken => "broken",
        }
    }
}

#[derive(Debug)]
pub struct ZoneDetector {
    swing: usize,
    side: ZoneSide,
    width_atr: f64,

    state: ZoneState,
    upper: f64,
    lower: f64,
    anchor_idx: i64,
    last_swing_idx: i64,
    version: u64,
}

impl ZoneDetector {
    pub const TYPE_NAME: &'static str = "zone";

    pub fn factory() -> Factory {
        Factory {
            type_name: Self::TYPE_NAME,
            required_params: &["zone_type", "width_atr"],
            optional_params: &[],
            depends_on: &["swing"],
            build: Self::build,
        }
    }

    fn build(spec: &DetectorSpec, deps: &BTreeMap<String, usize>) -> Result<Box<dyn Detector>> {
        let view = ParamView::new(&spec.key, &spec.params);
        let side = match view.str_choice("zone_type", &["demand", "supply"])?.as_str() {
            "supply" => ZoneSide::Supply,
            _ => ZoneSide::Demand,
        };
        let width_atr = view.f64_positive("width_atr", 1.5)?;
        Ok(Box::new(Self {
            swing: deps["swing"],
            side,
            width_atr,
            state: ZoneState::None,
            upper: f64::NAN,
            lower: f64::NAN,
            anchor_idx: -1,
            last_swing_idx: -1,
            version: 0,
        }))
    }
}

impl Detector for ZoneDetector {
    fn type_name(&self) -> &'static str {
        Self::TYPE_NAME
    }

    fn update(&mut self, _bar_idx: i64, bar: &BarData, deps: Deps<'_>) {
        let swing = deps.get(self.swing);
        let (swing_level, swing_idx) = match self.side {
            ZoneSide::Demand => (
                swing
                    .get("low_level")
                    .and_then(|v| v.as_f64())
                    .unwrap_or(f64::NAN),
                swing.get("low_idx").and_then(|v| v.as_i64()).unwrap_or(-1),
            ),
            ZoneSide::Supply => (
                swing
                    .get("high_level")
                    .and_then(|v| v.as_f64())
                    .unwrap_or(f64::NAN),
                swing.get("high_idx").and_then(|v| v.as_i64()).unwrap_or(-1),
            ),
        };

        // New swing on our side replaces the zone.
        if swing_idx != self.last_swing_idx && swing_idx >= 0 {
            let atr = bar.indicators.get("atr").unwrap_or(f64::NAN);
            let width = if atr.is_nan() { 0.0 } else { atr * self.width_atr };

            match self.side {
                ZoneSide::Demand => {
                    self.lower = swing_level - width;
                    self.upper = swing_level;
                }
                ZoneSide::Supply => {
                    self.lower = swing_level;
                    self.upper = swing_level + width;
                }
            }
            self.state = ZoneState::Active;
            self.anchor_idx = swing_idx;
            self.last_swing_idx = swing_idx;
            self.version += 1;
        }

        if self.state == ZoneState::Active {
            let broken = match self.side {
                ZoneSide::Demand => bar.close < self.lower,
                ZoneSide::Supply => bar.close > self.upper,
            };
            if broken {
                self.state = ZoneState::Broken;
                self.version += 1;
            }
        }
    }

    fn output_keys(&self) -> Vec<String> {
        vec![
            "state".to_string(),
            "upper".to_string(),
            "lower".to_string(),
            "anchor_idx".to_string(),
            "version".to_string(),
        ]
    }

    fn get(&self, key: &str) -> Option<OutputValue> {
        match key {
            "state" => Some(OutputValue::Text(self.state.as_str().to_string())),
            "upper" => Some(OutputValue::Float(self.upper)),
            "lower" => Some(OutputValue::Float(self.lower)),
            "anchor_idx" => Some(OutputValue::Int(self.anchor_idx)),
            "version" => Some(OutputValue::Int(self.version as i64)),
            _ => None,
        }
    }

    fn version(&self) -> u64 {
        self.version
    }
}
