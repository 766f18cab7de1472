//! Per-timeframe and multi-timeframe detector state containers.
//!
//! Detectors live in a declaration-order arena; declaration order is a
//! topological order by construction because dependencies may only reference
//! earlier keys. Updates walk the arena in index order, giving each detector
//! a read-only view over its (already-updated) dependencies.

use std::collections::BTreeMap;

use crate::bar::BarData;
use crate::detectors::{Deps, Detector, DetectorEntry, DetectorSpec, OutputValue};
use crate::error::{CoreError, Result};
use crate::registry::Registry;

/// Detector state for a single timeframe.
#[derive(Debug)]
pub struct TfState {
    pub timeframe: String,
    arena: Vec<DetectorEntry>,
    index: BTreeMap<String, usize>,
    last_bar_idx: i64,
}

impl TfState {
    /// Build from specs in declaration order.
    ///
    /// Fails loudly on duplicate keys, unknown types, and dependencies on
    /// keys that are not yet defined.
    pub fn new(timeframe: impl Into<String>, specs: &[DetectorSpec], registry: &Registry) -> Result<Self> {
        let timeframe = timeframe.into();
        let mut arena: Vec<DetectorEntry> = Vec::with_capacity(specs.len());
        let mut index: BTreeMap<String, usize> = BTreeMap::new();

        for spec in specs {
            if index.contains_key(&spec.key) {
                return Err(CoreError::DuplicateKey(spec.key.clone()));
            }

            let mut resolved: BTreeMap<String, usize> = BTreeMap::new();
            for (slot, dep_key) in &spec.depends_on {
                match index.get(dep_key) {
                    Some(&dep_idx) => {
                        resolved.insert(slot.clone(), dep_idx);
                    }
                    None => {
                        return Err(CoreError::DependencyNotDefined {
                            key: spec.key.clone(),
                            dep: dep_key.clone(),
                            defined: index.keys().cloned().collect(),
                        });
                    }
                }
            }

            let detector = registry.create(spec, &resolved)?;
            index.insert(spec.key.clone(), arena.len());
            arena.push(DetectorEntry {
                key: spec.key.clone(),
                type_name: spec.type_name.clone(),
                detector,
            });
        }

        Ok(Self {
            timeframe,
            arena,
            index,
            last_bar_idx: -1,
        })
    }

    /// Update every detector for one bar close, in declaration order.
    pub fn update(&mut self, bar: &BarData) -> Result<()> {
        if bar.idx <= self.last_bar_idx {
            return Err(CoreError::Config(format!(
                "Non-monotonic bar index for TF '{}': got {}, last seen {}",
                self.timeframe, bar.idx, self.last_bar_idx
            )));
        }
        self.last_bar_idx = bar.idx;

        for i in 0..self.arena.len() {
            let (done, rest) = self.arena.split_at_mut(i);
            rest[0].detector.update(bar.idx, bar, Deps::new(done));
        }
        Ok(())
    }

    /// Read one detector output; unknown keys and fields fail loudly.
    pub fn get_value(&self, key: &str, field: &str) -> Result<OutputValue> {
        let &idx = self.index.get(key).ok_or_else(|| {
            CoreError::Config(format!(
                "Unknown structure '{}' in TF '{}'\n\nDefined structures: {}\n\nFix: use one of the defined keys above",
                key,
                self.timeframe,
                self.list_keys().join(", ")
            ))
        })?;
        let entry = &self.arena[idx];
        entry
            .detector
            .get(field)
            .ok_or_else(|| CoreError::UnknownOutputKey {
                detector: entry.key.clone(),
                key: field.to_string(),
                valid: entry.detector.output_keys(),
            })
    }

    /// Declared keys in declaration order.
    pub fn list_keys(&self) -> Vec<String> {
        self.arena.iter().map(|e| e.key.clone()).collect()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.index.contains_key(key)
    }

    pub fn get_detector(&self, key: &str) -> Option<&dyn Detector> {
        self.index.get(key).map(|&i| self.arena[i].detector.as_ref())
    }

    /// Iterate `(key, type_name, detector)` in declaration order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str, &dyn Detector)> {
        self.arena
            .iter()
            .map(|e| (e.key.as_str(), e.type_name.as_str(), e.detector.as_ref()))
    }

    pub fn last_bar_idx(&self) -> i64 {
        self.last_bar_idx
    }

    pub fn len(&self) -> usize {
        self.arena.len()
    }

    pub fn is_empty(&self) -> bool {
        self.arena.is_empty()
    }
}

/// One exec-timeframe state plus a set of HTF states keyed by TF label.
///
/// Readable by dotted paths: `exec.<key>.<field>` or `htf_<label>.<key>.<field>`.
pub struct MultiTfState {
    pub exec_tf: String,
    pub exec: TfState,
    pub htf: BTreeMap<String, TfState>,
}

impl MultiTfState {
    pub fn new(
        exec_tf: impl Into<String>,
        exec_specs: &[DetectorSpec],
        htf_specs: &BTreeMap<String, Vec<DetectorSpec>>,
        registry: &Registry,
    ) -> Result<Self> {
        let exec_tf = exec_tf.into();
        let exec = TfState::new(exec_tf.clone(), exec_specs, registry)?;
        let mut htf = BTreeMap::new();
        for (label, specs) in htf_specs {
            htf.insert(label.clone(), TfState::new(label.clone(), specs, registry)?);
        }
        Ok(Self { exec_tf, exec, htf })
    }

    pub fn update_exec(&mut self, bar: &BarData) -> Result<()> {
        self.exec.update(bar)
    }

    pub fn update_htf(&mut self, label: &str, bar: &BarData) -> Result<()> {
        if !self.htf.contains_key(label) {
            return Err(CoreError::Config(format!(
                "Unknown HTF label '{}'\n\nConfigured HTFs: {}\n\nFix: use one of the configured labels above",
                label,
                self.htf.keys().cloned().collect::<Vec<_>>().join(", ")
            )));
        }
        match self.htf.get_mut(label) {
            Some(state) => state.update(bar),
            None => unreachable!("presence checked above"),
        }
    }

    /// Read a value by path (`exec.swing.high_level`, `htf_1h.fib.level_0.618`).
    ///
    /// The field segment may itself contain dots, so the path is split into
    /// at most three parts.
    pub fn get_value(&self, path: &str) -> Result<OutputValue> {
        let mut parts = path.splitn(3, '.');
        let (role, key, field) = match (parts.next(), parts.next(), parts.next()) {
            (Some(role), Some(key), Some(field)) if !field.is_empty() => (role, key, field),
            _ => {
                return Err(CoreError::Config(format!(
                    "Invalid path '{}': expected at least 3 parts '<tf_role>.<key>.<field>'\n\n\
                     Fix: e.g. exec.swing.high_level",
                    path
                )))
            }
        };

        let state = self.resolve_role(role)?;
        state.get_value(key, field)
    }

    fn resolve_role(&self, role: &str) -> Result<&TfState> {
        if role == "exec" {
            return Ok(&self.exec);
        }
        if let Some(label) = role.strip_prefix("htf_") {
            if let Some(state) = self.htf.get(label) {
                return Ok(state);
            }
        }
        let mut valid: Vec<String> = vec!["exec".to_string()];
        valid.extend(self.htf.keys().map(|k| format!("htf_{}", k)));
        Err(CoreError::Config(format!(
            "Unknown tf_role '{}'\n\nValid prefixes: {}\n\nFix: use one of the valid prefixes above",
            role,
            valid.join(", ")
        )))
    }

    /// Every readable path across all timeframes and detectors.
    pub fn list_all_paths(&self) -> Vec<String> {
        let mut paths = Vec::new();
        for (key, _, detector) in self.exec.iter() {
            for field in detector.output_keys() {
                paths.push(format!("exec.{}.{}", key, field));
            }
        }
        for (label, state) in &self.htf {
            for (key, _, detector) in state.iter() {
                for field in detector.output_keys() {
                    paths.push(format!("htf_{}.{}.{}", label, key, field));
                }
            }
        }
        paths
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detectors::ParamValue;

    fn swing_spec(key: &str, left: i64, right: i64) -> DetectorSpec {
        DetectorSpec::new("swing", key)
            .with_param("left", ParamValue::Int(left))
            .with_param("right", ParamValue::Int(right))
    }

    fn bar(idx: i64, high: f64, low: f64, close: f64) -> BarData {
        BarData::new(idx, close, high, low, close, 100.0)
    }

    // Swing high 110 at idx 2, confirmed at idx 4 (left=2, right=2).
    fn seed_bars() -> Vec<BarData> {
        vec![
            bar(0, 102.0, 99.0, 101.0),
            bar(1, 105.0, 100.0, 104.0),
            bar(2, 110.0, 103.0, 108.0),
            bar(3, 107.0, 102.0, 103.0),
            bar(4, 104.0, 95.0, 96.0),
        ]
    }

    #[test]
    fn test_tf_state_basic() {
        let registry = Registry::builtin();
        let specs = vec![swing_spec("swing", 2, 2)];
        let mut state = TfState::new("15m", &specs, &registry).unwrap();
        for b in seed_bars() {
            state.update(&b).unwrap();
        }
        assert_eq!(
            state.get_value("swing", "high_level").unwrap().as_f64(),
            Some(110.0)
        );
        assert_eq!(
            state.get_value("swing", "high_idx").unwrap().as_i64(),
            Some(2)
        );
    }

    #[test]
    fn test_dependency_chain_update_order() {
        let registry = Registry::builtin();
        let specs = vec![
            swing_spec("swing", 2, 2),
            DetectorSpec::new("fibonacci", "fib")
                .with_param(
                    "levels",
                    ParamValue::List(vec![
                        ParamValue::Float(0.382),
                        ParamValue::Float(0.5),
                        ParamValue::Float(0.618),
                    ]),
                )
                .with_dep("swing", "swing"),
            DetectorSpec::new("trend", "trend").with_dep("swing", "swing"),
        ];
        let mut state = TfState::new("15m", &specs, &registry).unwrap();
        assert_eq!(state.list_keys(), vec!["swing", "fib", "trend"]);

        // High 110 @ 2 confirmed @ 4; low 88 @ 6 confirmed @ 8.
        let bars = vec![
            bar(0, 102.0, 99.0, 101.0),
            bar(1, 105.0, 100.0, 104.0),
            bar(2, 110.0, 103.0, 108.0),
            bar(3, 107.0, 96.0, 98.0),
            bar(4, 103.0, 95.0, 96.0),
            bar(5, 98.0, 93.0, 94.0),
            bar(6, 95.0, 88.0, 90.0),
            bar(7, 97.0, 92.0, 95.0),
            bar(8, 100.0, 91.0, 98.0),
        ];
        for b in bars {
            state.update(&b).unwrap();
        }

        let high = state.get_value("swing", "high_level").unwrap().as_f64().unwrap();
        let low = state.get_value("swing", "low_level").unwrap().as_f64().unwrap();
        assert_eq!(high, 110.0);
        assert_eq!(low, 88.0);

        let range = high - low;
        let fib_382 = state.get_value("fib", "level_0.382").unwrap().as_f64().unwrap();
        let fib_500 = state.get_value("fib", "level_0.5").unwrap().as_f64().unwrap();
        assert!((fib_382 - (high - range * 0.382)).abs() < 1e-9);
        assert!((fib_500 - (high - range * 0.5)).abs() < 1e-9);
    }

    #[test]
    fn test_rejects_non_monotonic_bar_idx() {
        let registry = Registry::builtin();
        let mut state = TfState::new("15m", &[swing_spec("swing", 2, 2)], &registry).unwrap();
        state.update(&bar(5, 10.0, 9.0, 9.5)).unwrap();
        let err = state.update(&bar(5, 10.0, 9.0, 9.5)).unwrap_err();
        assert!(err.to_string().contains("Non-monotonic"));
        assert!(state.update(&bar(6, 10.0, 9.0, 9.5)).is_ok());
    }

    #[test]
    fn test_duplicate_key_rejected() {
        let registry = Registry::builtin();
        let specs = vec![swing_spec("swing", 2, 2), swing_spec("swing", 3, 3)];
        let err = TfState::new("15m", &specs, &registry).unwrap_err();
        assert!(err.to_string().contains("Duplicate structure key"));
    }

    #[test]
    fn test_dependency_not_yet_defined() {
        let registry = Registry::builtin();
        let specs = vec![DetectorSpec::new("trend", "trend").with_dep("swing", "swing")];
        let err = TfState::new("15m", &specs, &registry).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("not yet defined"));
        assert!(msg.contains("Fix:"));
    }

    #[test]
    fn test_multi_tf_paths() {
        let registry = Registry::builtin();
        let exec_specs = vec![
            swing_spec("swing", 2, 2),
            DetectorSpec::new("trend", "trend").with_dep("swing", "swing"),
        ];
        let mut htf_specs = BTreeMap::new();
        htf_specs.insert("1h".to_string(), vec![swing_spec("swing_1h", 3, 3)]);

        let mut multi = MultiTfState::new("15m", &exec_specs, &htf_specs, &registry).unwrap();

        for b in seed_bars() {
            multi.update_exec(&b).unwrap();
        }
        multi.update_htf("1h", &bar(0, 110.0, 95.0, 105.0)).unwrap();

        assert_eq!(
            multi.get_value("exec.swing.high_level").unwrap().as_f64(),
            Some(110.0)
        );
        // HTF swing unconfirmed with one bar.
        assert!(multi
            .get_value("htf_1h.swing_1h.high_level")
            .unwrap()
            .as_f64()
            .unwrap()
            .is_nan());

        let paths = multi.list_all_paths();
        assert!(paths.contains(&"exec.swing.high_level".to_string()));
        assert!(paths.contains(&"exec.trend.direction".to_string()));
        assert!(paths.contains(&"htf_1h.swing_1h.low_idx".to_string()));
    }

    #[test]
    fn test_path_with_dots_in_field() {
        let registry = Registry::builtin();
        let exec_specs = vec![
            swing_spec("swing", 2, 2),
            DetectorSpec::new("fibonacci", "fib")
                .with_param("levels", ParamValue::List(vec![ParamValue::Float(0.618)]))
                .with_dep("swing", "swing"),
        ];
        let multi =
            MultiTfState::new("15m", &exec_specs, &BTreeMap::new(), &registry).unwrap();
        // Field "level_0.618" contains a dot; path still resolves.
        assert!(multi.get_value("exec.fib.level_0.618").is_ok());
    }

    #[test]
    fn test_path_errors_enumerate_options() {
        let registry = Registry::builtin();
        let multi = MultiTfState::new(
            "15m",
            &[swing_spec("swing", 2, 2)],
            &BTreeMap::new(),
            &registry,
        )
        .unwrap();

        let err = multi.get_value("short.path").unwrap_err();
        assert!(err.to_string().contains("at least 3 parts"));

        let err = multi.get_value("unknown.swing.high_level").unwrap_err();
        assert!(err.to_string().contains("Valid prefixes: exec"));

        let err = multi.get_value("exec.missing.high_level").unwrap_err();
        assert!(err.to_string().contains("Defined structures: swing"));

        let err = multi.get_value("exec.swing.bogus_field").unwrap_err();
        assert!(err.to_string().contains("Available outputs"));
    }

    #[test]
    fn test_unknown_htf_label_rejected() {
        let registry = Registry::builtin();
        let mut multi = MultiTfState::new(
            "15m",
            &[swing_spec("swing", 2, 2)],
            &BTreeMap::new(),
            &registry,
        )
        .unwrap();
        let err = multi.update_htf("4h", &bar(0, 10.0, 9.0, 9.5)).unwrap_err();
        assert!(err.to_string().contains("Unknown HTF label '4h'"));
    }
}
