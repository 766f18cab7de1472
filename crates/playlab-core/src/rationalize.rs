//! Rationalization layer: transition detection over detector outputs.
//!
//! After all detector updates for a bar, the rationalizer compares a curated
//! field set per detector against the previous bar's values, emits
//! [`Transition`] records for changes (and once on first non-null
//! observation), appends them to a bounded ring, and produces the per-bar
//! [`RationalizedState`] with derived values and a regime tag.
//!
//! Transition order is deterministic: exec first, then HTFs by label, with
//! detectors in declaration order and fields in tracked order.

use std::collections::{BTreeMap, VecDeque};

use serde::{Deserialize, Serialize};

use crate::detectors::{Detector, OutputValue};
use crate::state::MultiTfState;

/// Market regime classification.
///
/// Classification logic is still stubbed (see module docs on derived values);
/// the variants are part of the snapshot contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MarketRegime {
    TrendingUp,
    TrendingDown,
    Ranging,
    Volatile,
    #[default]
    Unknown,
}

/// Records a state change in a structure detector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transition {
    pub detector: String,
    pub field: String,
    /// `None` on first observation.
    pub old_value: Option<OutputValue>,
    pub new_value: OutputValue,
    pub bar_idx: i64,
    pub timeframe: String,
}

/// Per-bar aggregation produced once per exec-bar-close.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RationalizedState {
    pub bar_idx: i64,
    pub transitions: Vec<Transition>,
    pub derived_values: BTreeMap<String, f64>,
    pub regime: MarketRegime,
}

impl RationalizedState {
    pub fn transition_count(&self) -> usize {
        self.transitions.len()
    }

    pub fn has_transitions(&self) -> bool {
        !self.transitions.is_empty()
    }

    pub fn transitions_for(&self, detector: &str) -> Vec<&Transition> {
        self.transitions
            .iter()
            .filter(|t| t.detector == detector)
            .collect()
    }
}

/// Filter criteria for querying transition history.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TransitionFilter {
    pub detector: Option<String>,
    pub field: Option<String>,
    pub timeframe: Option<String>,
    pub min_bar_idx: Option<i64>,
    pub max_bar_idx: Option<i64>,
}

impl TransitionFilter {
    pub fn matches(&self, transition: &Transition) -> bool {
        if let Some(d) = &self.detector {
            if &transition.detector != d {
                return false;
            }
        }
        if let Some(f) = &self.field {
            if &transition.field != f {
                return false;
            }
        }
        if let Some(tf) = &self.timeframe {
            if &transition.timeframe != tf {
                return false;
            }
        }
        if let Some(min) = self.min_bar_idx {
            if transition.bar_idx < min {
                return false;
            }
        }
        if let Some(max) = self.max_bar_idx {
            if transition.bar_idx > max {
                return false;
            }
        }
        true
    }
}

/// Curated fields to track per detector type.
///
/// Unknown types fall back to tracking every output key.
fn tracked_fields(type_name: &str) -> Option<&'static [&'static str]> {
    match type_name {
        "swing" => Some(&["high_level", "low_level", "high_idx", "low_idx", "version"]),
        "zone" => Some(&["state", "upper", "lower", "version"]),
        "trend" => Some(&["direction", "strength", "bars_in_trend", "version"]),
        "fibonacci" => Some(&["level_0.382", "level_0.5", "level_0.618"]),
        "rolling_window" => Some(&["value"]),
        "derived_zone" => Some(&[
            "zone0_state",
            "zone1_state",
            "zone2_state",
            "any_active",
            "active_count",
            "source_version",
        ]),
        _ => None,
    }
}

/// Rationalizer configuration.
#[derive(Debug, Clone)]
pub struct RationalizerConfig {
    /// Max transitions retained for lookback queries.
    pub history_depth: usize,
    /// Track only the `version` field of every detector.
    pub version_only: bool,
}

impl Default for RationalizerConfig {
    fn default() -> Self {
        Self {
            history_depth: 1000,
            version_only: false,
        }
    }
}

/// Detects field transitions and maintains bounded history.
pub struct StateRationalizer {
    config: RationalizerConfig,
    previous: BTreeMap<(String, String, String), OutputValue>,
    history: VecDeque<Transition>,
}

impl StateRationalizer {
    pub fn new(config: RationalizerConfig) -> Self {
        Self {
            config,
            previous: BTreeMap::new(),
            history: VecDeque::new(),
        }
    }

    /// Compute the rationalized state for the current bar.
    ///
    /// Called once per exec-bar-close after all detector updates.
    pub fn rationalize(&mut self, bar_idx: i64, state: &MultiTfState) -> RationalizedState {
        let mut transitions = Vec::new();

        for (key, type_name, detector) in state.exec.iter() {
            self.detect(bar_idx, "exec", key, type_name, detector, &mut transitions);
        }
        for (label, tf_state) in &state.htf {
            for (key, type_name, detector) in tf_state.iter() {
                self.detect(bar_idx, label, key, type_name, detector, &mut transitions);
            }
        }

        for t in &transitions {
            if self.history.len() == self.config.history_depth {
                self.history.pop_front();
            }
            self.history.push_back(t.clone());
        }

        // Derived values are stable placeholders until their semantics are
        // finalized; downstream Plays may already reference them.
        let mut derived_values = BTreeMap::new();
        derived_values.insert("confluence_score".to_string(), 0.0);
        derived_values.insert("alignment".to_string(), 0.0);

        RationalizedState {
            bar_idx,
            transitions,
            derived_values,
            regime: MarketRegime::Unknown,
        }
    }

    fn detect(
        &mut self,
        bar_idx: i64,
        timeframe: &str,
        detector_key: &str,
        type_name: &str,
        detector: &dyn Detector,
        out: &mut Vec<Transition>,
    ) {
        let fallback;
        let fields: Vec<&str> = if self.config.version_only {
            vec!["version"]
        } else {
            match tracked_fields(type_name) {
                Some(fields) => fields.to_vec(),
                None => {
                    fallback = detector.output_keys();
                    fallback.iter().map(|s| s.as_str()).collect()
                }
            }
        };

        for field in fields {
            let current = match detector.get(field) {
                Some(v) => v,
                // Curated field not present on this instance (e.g. a fib with
                // non-default levels): skip.
                None => continue,
            };

            let cache_key = (
                timeframe.to_string(),
                detector_key.to_string(),
                field.to_string(),
            );

            match self.previous.get(&cache_key) {
                Some(prev) => {
                    if !prev.same(&current) {
                        out.push(Transition {
                            detector: detector_key.to_string(),
                            field: field.to_string(),
                            old_value: Some(prev.clone()),
                            new_value: current.clone(),
                            bar_idx,
                            timeframe: timeframe.to_string(),
                        });
                    }
                }
                None => {
                    if !current.is_none() {
                        out.push(Transition {
                            detector: detector_key.to_string(),
                            field: field.to_string(),
                            old_value: None,
                            new_value: current.clone(),
                            bar_idx,
                            timeframe: timeframe.to_string(),
                        });
                    }
                }
            }

            self.previous.insert(cache_key, current);
        }
    }

    /// Query history, oldest first; `count` keeps the most recent matches.
    pub fn get_history(
        &self,
        filter: Option<&TransitionFilter>,
        count: Option<usize>,
    ) -> Vec<Transition> {
        let mut result: Vec<Transition> = self
            .history
            .iter()
            .filter(|t| filter.map(|f| f.matches(t)).unwrap_or(true))
            .cloned()
            .collect();
        if let Some(count) = count {
            if result.len() > count {
                result.drain(..result.len() - count);
            }
        }
        result
    }

    pub fn get_transitions_since(&self, bar_idx: i64, detector: Option<&str>) -> Vec<Transition> {
        let filter = TransitionFilter {
            detector: detector.map(|d| d.to_string()),
            min_bar_idx: Some(bar_idx),
            ..Default::default()
        };
        self.get_history(Some(&filter), None)
    }

    pub fn get_last_transition(&self, detector: &str, field: &str) -> Option<Transition> {
        self.history
            .iter()
            .rev()
            .find(|t| t.detector == detector && t.field == field)
            .cloned()
    }

    pub fn count_transitions(&self, detector: Option<&str>, since_bar_idx: Option<i64>) -> usize {
        self.history
            .iter()
            .filter(|t| detector.map(|d| t.detector == d).unwrap_or(true))
            .filter(|t| since_bar_idx.map(|b| t.bar_idx >= b).unwrap_or(true))
            .count()
    }

    pub fn history_size(&self) -> usize {
        self.history.len()
    }

    /// Reset all state. Call when starting a new backtest run.
    pub fn reset(&mut self) {
        self.previous.clear();
        self.history.clear();
    }
}

impl Default for StateRationalizer {
    fn default() -> Self {
        Self::new(RationalizerConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bar::BarData;
    use crate::detectors::{DetectorSpec, ParamValue};
    use crate::registry::Registry;
    use std::collections::BTreeMap as Map;

    fn multi_with_swing() -> MultiTfState {
        let registry = Registry::builtin();
        let specs = vec![DetectorSpec::new("swing", "swing")
            .with_param("left", ParamValue::Int(2))
            .with_param("right", ParamValue::Int(2))];
        MultiTfState::new("15m", &specs, &Map::new(), &registry).unwrap()
    }

    fn bar(idx: i64, high: f64, low: f64) -> BarData {
        BarData::new(idx, (high + low) / 2.0, high, low, (high + low) / 2.0, 10.0)
    }

    #[test]
    fn test_first_observation_emits_non_null_transitions() {
        let mut multi = multi_with_swing();
        let mut rationalizer = StateRationalizer::default();

        multi.update_exec(&bar(0, 102.0, 99.0)).unwrap();
        let state = rationalizer.rationalize(0, &multi);

        // All tracked swing fields are non-null (NaN floats included), so the
        // first bar emits one transition per tracked field with old=None.
        assert_eq!(state.transition_count(), 5);
        assert!(state.transitions.iter().all(|t| t.old_value.is_none()));
        assert!(state.transitions.iter().all(|t| t.bar_idx == 0));
    }

    #[test]
    fn test_no_transitions_without_changes() {
        let mut multi = multi_with_swing();
        let mut rationalizer = StateRationalizer::default();

        multi.update_exec(&bar(0, 102.0, 99.0)).unwrap();
        rationalizer.rationalize(0, &multi);

        // NaN high_level stays NaN: must not re-emit.
        multi.update_exec(&bar(1, 103.0, 100.0)).unwrap();
        let state = rationalizer.rationalize(1, &multi);
        assert_eq!(state.transition_count(), 0);
    }

    #[test]
    fn test_pivot_confirmation_emits_changes() {
        let mut multi = multi_with_swing();
        let mut rationalizer = StateRationalizer::default();

        let bars = [
            bar(0, 102.0, 99.0),
            bar(1, 105.0, 100.0),
            bar(2, 110.0, 103.0),
            bar(3, 107.0, 102.0),
            bar(4, 104.0, 98.0),
        ];
        let mut last = RationalizedState {
            bar_idx: 0,
            transitions: vec![],
            derived_values: BTreeMap::new(),
            regime: MarketRegime::Unknown,
        };
        for b in &bars {
            multi.update_exec(b).unwrap();
            last = rationalizer.rationalize(b.idx, &multi);
        }

        // Swing high confirmed at bar 4: high_level, high_idx, version change.
        let fields: Vec<&str> = last.transitions.iter().map(|t| t.field.as_str()).collect();
        assert!(fields.contains(&"high_level"));
        assert!(fields.contains(&"high_idx"));
        assert!(fields.contains(&"version"));
        for t in &last.transitions {
            assert!(t.old_value.is_some());
            assert!(!t.old_value.as_ref().unwrap().same(&t.new_value));
            assert_eq!(t.bar_idx, 4);
        }
    }

    #[test]
    fn test_history_bounded() {
        let mut multi = multi_with_swing();
        let mut rationalizer = StateRationalizer::new(RationalizerConfig {
            history_depth: 3,
            version_only: false,
        });
        multi.update_exec(&bar(0, 102.0, 99.0)).unwrap();
        rationalizer.rationalize(0, &multi);
        // First bar emitted 5 transitions into a depth-3 ring.
        assert_eq!(rationalizer.history_size(), 3);
    }

    #[test]
    fn test_version_only_mode() {
        let mut multi = multi_with_swing();
        let mut rationalizer = StateRationalizer::new(RationalizerConfig {
            history_depth: 100,
            version_only: true,
        });
        multi.update_exec(&bar(0, 102.0, 99.0)).unwrap();
        let state = rationalizer.rationalize(0, &multi);
        assert_eq!(state.transition_count(), 1);
        assert_eq!(state.transitions[0].field, "version");
    }

    #[test]
    fn test_query_api() {
        let mut multi = multi_with_swing();
        let mut rationalizer = StateRationalizer::default();
        let bars = [
            bar(0, 102.0, 99.0),
            bar(1, 105.0, 100.0),
            bar(2, 110.0, 103.0),
            bar(3, 107.0, 102.0),
            bar(4, 104.0, 98.0),
        ];
        for b in &bars {
            multi.update_exec(b).unwrap();
            rationalizer.rationalize(b.idx, &multi);
        }

        let since = rationalizer.get_transitions_since(4, Some("swing"));
        assert!(!since.is_empty());
        assert!(since.iter().all(|t| t.bar_idx >= 4));

        let last = rationalizer.get_last_transition("swing", "high_level").unwrap();
        assert_eq!(last.bar_idx, 4);
        assert_eq!(last.new_value.as_f64(), Some(110.0));

        assert!(rationalizer.count_transitions(Some("swing"), None) >= 5);
        assert_eq!(rationalizer.count_transitions(Some("missing"), None), 0);

        let filter = TransitionFilter {
            field: Some("high_idx".to_string()),
            ..Default::default()
        };
        let filtered = rationalizer.get_history(Some(&filter), Some(1));
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].field, "high_idx");

        rationalizer.reset();
        assert_eq!(rationalizer.history_size(), 0);
    }

    #[test]
    fn test_derived_values_placeholders_present() {
        let mut multi = multi_with_swing();
        let mut rationalizer = StateRationalizer::default();
        multi.update_exec(&bar(0, 102.0, 99.0)).unwrap();
        let state = rationalizer.rationalize(0, &multi);
        assert_eq!(state.derived_values.get("confluence_score"), Some(&0.0));
        assert_eq!(state.derived_values.get("alignment"), Some(&0.0));
        assert_eq!(state.regime, MarketRegime::Unknown);
    }
}
