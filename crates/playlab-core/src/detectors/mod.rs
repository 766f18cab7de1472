//! Incremental market-structure detectors.
//!
//! Detectors are bar-by-bar state machines stored in a per-timeframe arena
//! (see [`crate::state::TfState`]). Dependencies between detectors are arena
//! indices resolved at build time; an updating detector reads its dependencies
//! through a [`Deps`] view over the detectors declared before it, so a
//! detector can never mutate (or observe a half-updated) dependency.

pub mod derived_zone;
pub mod fibonacci;
pub mod rolling;
pub mod swing;
pub mod trend;
pub mod zone;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::bar::BarData;
use crate::error::{CoreError, Result};

/// A single detector output value.
///
/// Outputs are keyed by strings of differing kinds; this tagged union keeps
/// [`crate::rationalize::Transition`] records plain values (no trait objects).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OutputValue {
    Float(f64),
    Int(i64),
    Bool(bool),
    Text(String),
    None,
}

impl OutputValue {
    /// Numeric view: floats as-is, ints widened. `None` for other kinds.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            OutputValue::Float(v) => Some(*v),
            OutputValue::Int(v) => Some(*v as f64),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            OutputValue::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            OutputValue::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            OutputValue::Text(v) => Some(v),
            _ => None,
        }
    }

    pub fn is_none(&self) -> bool {
        matches!(self, OutputValue::None)
    }

    /// Value equality with NaN treated as equal to NaN.
    ///
    /// Plain `==` on floats would report a NaN-valued output as "changed"
    /// every bar; transition detection must use this instead.
    pub fn same(&self, other: &OutputValue) -> bool {
        match (self, other) {
            (OutputValue::Float(a), OutputValue::Float(b)) => {
                (a.is_nan() && b.is_nan()) || a == b
            }
            (a, b) => a == b,
        }
    }
}

impl std::fmt::Display for OutputValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OutputValue::Float(v) => write!(f, "{}", v),
            OutputValue::Int(v) => write!(f, "{}", v),
            OutputValue::Bool(v) => write!(f, "{}", v),
            OutputValue::Text(v) => write!(f, "{}", v),
            OutputValue::None => write!(f, "null"),
        }
    }
}

/// A parameter value as declared in a Play document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Int(i64),
    Float(f64),
    Bool(bool),
    Text(String),
    List(Vec<ParamValue>),
}

impl ParamValue {
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            ParamValue::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ParamValue::Int(v) => Some(*v as f64),
            ParamValue::Float(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            ParamValue::Text(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[ParamValue]> {
        match self {
            ParamValue::List(v) => Some(v),
            _ => None,
        }
    }
}

impl From<i64> for ParamValue {
    fn from(v: i64) -> Self {
        ParamValue::Int(v)
    }
}

impl From<f64> for ParamValue {
    fn from(v: f64) -> Self {
        ParamValue::Float(v)
    }
}

impl From<&str> for ParamValue {
    fn from(v: &str) -> Self {
        ParamValue::Text(v.to_string())
    }
}

/// Detector parameters keyed by name (sorted for deterministic iteration).
pub type Params = BTreeMap<String, ParamValue>;

/// One structure declaration from a Play document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectorSpec {
    /// Structure type name (registry key, e.g. "swing")
    #[serde(rename = "type")]
    pub type_name: String,

    /// Unique key within the timeframe (path segment in reads)
    pub key: String,

    #[serde(default)]
    pub params: Params,

    /// Dependency slot name -> key of an earlier structure in the same TF
    #[serde(default)]
    pub depends_on: BTreeMap<String, String>,
}

impl DetectorSpec {
    pub fn new(type_name: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            key: key.into(),
            params: Params::new(),
            depends_on: BTreeMap::new(),
        }
    }

    pub fn with_param(mut self, name: &str, value: impl Into<ParamValue>) -> Self {
        self.params.insert(name.to_string(), value.into());
        self
    }

    pub fn with_dep(mut self, slot: &str, key: &str) -> Self {
        self.depends_on.insert(slot.to_string(), key.to_string());
        self
    }
}

/// One arena slot: the detector plus its identity.
#[derive(Debug)]
pub struct DetectorEntry {
    pub key: String,
    pub type_name: String,
    pub detector: Box<dyn Detector>,
}

/// Read-only view over the detectors declared before the one being updated.
///
/// Indices are absolute arena positions; the build step guarantees every
/// stored dependency index is strictly less than the dependent's own.
#[derive(Clone, Copy)]
pub struct Deps<'a> {
    arena: &'a [DetectorEntry],
}

impl<'a> Deps<'a> {
    pub fn new(arena: &'a [DetectorEntry]) -> Self {
        Self { arena }
    }

    pub fn empty() -> Deps<'static> {
        Deps { arena: &[] }
    }

    pub fn get(&self, idx: usize) -> &dyn Detector {
        self.arena[idx].detector.as_ref()
    }
}

/// Bar-by-bar incremental detector.
///
/// `update` is called once per close of the detector's timeframe, in
/// declaration order; `get` must be O(1).
pub trait Detector: std::fmt::Debug {
    fn type_name(&self) -> &'static str;

    fn update(&mut self, bar_idx: i64, bar: &BarData, deps: Deps<'_>);

    /// Stable list of readable output keys.
    fn output_keys(&self) -> Vec<String>;

    /// Output by key; `None` when the key is not declared.
    fn get(&self, key: &str) -> Option<OutputValue>;

    /// Validated lookup whose error lists the valid keys.
    fn get_safe(&self, key: &str) -> Result<OutputValue> {
        self.get(key).ok_or_else(|| CoreError::UnknownOutputKey {
            detector: self.type_name().to_string(),
            key: key.to_string(),
            valid: self.output_keys(),
        })
    }

    /// Monotonically increasing material-state counter.
    fn version(&self) -> u64;
}

/// Parameter validation helpers shared by detector constructors.
///
/// Errors embed the offending key plus a corrective snippet, mirroring the
/// fail-loud configuration policy.
pub(crate) struct ParamView<'a> {
    key: &'a str,
    params: &'a Params,
}

impl<'a> ParamView<'a> {
    pub fn new(key: &'a str, params: &'a Params) -> Self {
        Self { key, params }
    }

    pub fn int_min(&self, name: &str, min: i64, example: i64) -> Result<i64> {
        match self.params.get(name).and_then(ParamValue::as_i64) {
            Some(v) if v >= min => Ok(v),
            other => Err(CoreError::Config(format!(
                "Structure '{}': '{}' must be an integer >= {}, got {:?}\n\nFix: {}: {}",
                self.key, name, min, other, name, example
            ))),
        }
    }

    pub fn f64_positive(&self, name: &str, example: f64) -> Result<f64> {
        match self.params.get(name).and_then(ParamValue::as_f64) {
            Some(v) if v > 0.0 => Ok(v),
            _ => Err(CoreError::Config(format!(
                "Structure '{}': '{}' must be a positive number\n\nFix: {}: {}",
                self.key, name, name, example
            ))),
        }
    }

    pub fn f64_positive_or(&self, name: &str, default: f64) -> Result<f64> {
        match self.params.get(name) {
            None => Ok(default),
            Some(v) => match v.as_f64() {
                Some(v) if v > 0.0 => Ok(v),
                _ => Err(CoreError::Config(format!(
                    "Structure '{}': '{}' must be a positive number\n\nFix: {}: {}",
                    self.key, name, name, default
                ))),
            },
        }
    }

    pub fn str_choice(&self, name: &str, choices: &[&str]) -> Result<String> {
        match self.params.get(name).and_then(ParamValue::as_str) {
            Some(v) if choices.contains(&v) => Ok(v.to_string()),
            other => Err(CoreError::Config(format!(
                "Structure '{}': '{}' must be one of {}, got {:?}\n\nFix: {}: {}",
                self.key,
                name,
                choices.join(", "),
                other,
                name,
                choices[0]
            ))),
        }
    }

    pub fn str_choice_or(&self, name: &str, choices: &[&str], default: &str) -> Result<String> {
        if self.params.get(name).is_none() {
            return Ok(default.to_string());
        }
        self.str_choice(name, choices)
    }

    /// Non-empty list of positive ratios.
    pub fn positive_levels(&self, name: &str) -> Result<Vec<f64>> {
        let fix = format!("Fix: {}: [0.382, 0.5, 0.618]", name);
        let list = self
            .params
            .get(name)
            .and_then(ParamValue::as_list)
            .ok_or_else(|| {
                CoreError::Config(format!(
                    "Structure '{}': '{}' must be a non-empty list of numbers\n\n{}",
                    self.key, name, fix
                ))
            })?;
        if list.is_empty() {
            return Err(CoreError::Config(format!(
                "Structure '{}': '{}' must be a non-empty list of numbers\n\n{}",
                self.key, name, fix
            )));
        }
        let mut levels = Vec::with_capacity(list.len());
        for (i, v) in list.iter().enumerate() {
            match v.as_f64() {
                Some(x) if x > 0.0 => levels.push(x),
                _ => {
                    return Err(CoreError::Config(format!(
                        "Structure '{}': '{}[{}]' must be a positive number\n\n{}",
                        self.key, name, i, fix
                    )))
                }
            }
        }
        Ok(levels)
    }
}

/// Canonical output-key form of a ratio: shortest decimal, trailing zeros
/// stripped (`0.5` -> "level_0.5").
pub(crate) fn level_key(level: f64) -> String {
    format!("level_{}", level)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_output_value_same_handles_nan() {
        let a = OutputValue::Float(f64::NAN);
        let b = OutputValue::Float(f64::NAN);
        assert!(a.same(&b));
        assert!(!a.same(&OutputValue::Float(1.0)));
        assert!(OutputValue::Float(2.0).same(&OutputValue::Float(2.0)));
        assert!(!OutputValue::Int(2).same(&OutputValue::Float(2.0)));
    }

    #[test]
    fn test_param_view_int_min() {
        let mut params = Params::new();
        params.insert("left".into(), ParamValue::Int(5));
        let view = ParamView::new("swing", &params);
        assert_eq!(view.int_min("left", 1, 5).unwrap(), 5);

        params.insert("left".into(), ParamValue::Int(0));
        let view = ParamView::new("swing", &params);
        let err = view.int_min("left", 1, 5).unwrap_err();
        assert!(err.to_string().contains("'left' must be an integer >= 1"));
    }

    #[test]
    fn test_param_view_levels() {
        let mut params = Params::new();
        params.insert(
            "levels".into(),
            ParamValue::List(vec![ParamValue::Float(0.382), ParamValue::Float(0.618)]),
        );
        let view = ParamView::new("fib", &params);
        assert_eq!(view.positive_levels("levels").unwrap(), vec![0.382, 0.618]);

        params.insert(
            "levels".into(),
            ParamValue::List(vec![ParamValue::Float(-1.0)]),
        );
        let view = ParamView::new("fib", &params);
        assert!(view.positive_levels("levels").is_err());
    }

    #[test]
    fn test_level_key_strips_zeros() {
        assert_eq!(level_key(0.5), "level_0.5");
        assert_eq!(level_key(0.618), "level_0.618");
        assert_eq!(level_key(1.0), "level_1");
    }
}
