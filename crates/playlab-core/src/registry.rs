//! Structure registry: name -> detector factory with declared params/deps.
//!
//! The registry is populated at startup and read-only during runs; there is
//! no global registry object; each engine builds (or receives) its own.

use std::collections::BTreeMap;

use crate::detectors::derived_zone::DerivedZoneDetector;
use crate::detectors::fibonacci::FibonacciDetector;
use crate::detectors::rolling::RollingWindowDetector;
use crate::detectors::swing::SwingDetector;
use crate::detectors::trend::TrendDetector;
use crate::detectors::zone::ZoneDetector;
use crate::detectors::{Detector, DetectorSpec};
use crate::error::{CoreError, Result};

/// Build function: spec plus resolved dependency arena indices.
pub type BuildFn = fn(&DetectorSpec, &BTreeMap<String, usize>) -> Result<Box<dyn Detector>>;

/// Factory entry for one structure type.
pub struct Factory {
    pub type_name: &'static str,
    pub required_params: &'static [&'static str],
    pub optional_params: &'static [&'static str],
    pub depends_on: &'static [&'static str],
    pub build: BuildFn,
}

/// Name -> factory table.
pub struct Registry {
    factories: BTreeMap<&'static str, Factory>,
}

impl Registry {
    /// Empty registry (tests and custom embedding).
    pub fn new() -> Self {
        Self {
            factories: BTreeMap::new(),
        }
    }

    /// Registry with all built-in detector types.
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        for factory in [
            SwingDetector::factory(),
            TrendDetector::factory(),
            FibonacciDetector::factory(),
            RollingWindowDetector::factory(),
            ZoneDetector::factory(),
            DerivedZoneDetector::factory(),
        ] {
            registry
                .register(factory)
                .expect("builtin registration cannot collide");
        }
        registry
    }

    /// Register a factory; duplicate names are an error.
    pub fn register(&mut self, factory: Factory) -> Result<()> {
        if self.factories.contains_key(factory.type_name) {
            return Err(CoreError::Config(format!(
                "Structure type '{}' is already registered\n\nFix: use a different type name",
                factory.type_name
            )));
        }
        self.factories.insert(factory.type_name, factory);
        Ok(())
    }

    /// Sorted list of registered type names.
    pub fn list_types(&self) -> Vec<String> {
        self.factories.keys().map(|k| k.to_string()).collect()
    }

    /// Factory metadata lookup; unknown types list the registered ones.
    pub fn info(&self, type_name: &str) -> Result<&Factory> {
        self.factories
            .get(type_name)
            .ok_or_else(|| CoreError::UnknownStructureType {
                name: type_name.to_string(),
                available: self.list_types(),
            })
    }

    /// Validate a spec against the factory declaration, then construct.
    ///
    /// `resolved_deps` maps dependency slot names to arena indices of earlier
    /// detectors in the same timeframe.
    pub fn create(
        &self,
        spec: &DetectorSpec,
        resolved_deps: &BTreeMap<String, usize>,
    ) -> Result<Box<dyn Detector>> {
        let factory = self.info(&spec.type_name)?;

        let missing_params: Vec<&str> = factory
            .required_params
            .iter()
            .filter(|p| !spec.params.contains_key(**p))
            .copied()
            .collect();
        if !missing_params.is_empty() {
            let param_lines: Vec<String> = missing_params
                .iter()
                .map(|p| format!("      {}: <value>  # REQUIRED", p))
                .collect();
            return Err(CoreError::Config(format!(
                "Structure '{}' (type: {}) missing required params: {:?}\n\n\
                 Fix in Play:\n  - type: {}\n    key: {}\n    params:\n{}",
                spec.key,
                spec.type_name,
                missing_params,
                spec.type_name,
                spec.key,
                param_lines.join("\n")
            )));
        }

        let missing_deps: Vec<&str> = factory
            .depends_on
            .iter()
            .filter(|d| !resolved_deps.contains_key(**d))
            .copied()
            .collect();
        if !missing_deps.is_empty() {
            let dep_lines: Vec<String> = missing_deps
                .iter()
                .map(|d| format!("      {}: <key>  # REQUIRED", d))
                .collect();
            return Err(CoreError::Config(format!(
                "Structure '{}' (type: {}) missing dependencies: {:?}\n\n\
                 Fix in Play:\n  - type: {}\n    key: {}\n    depends_on:\n{}",
                spec.key,
                spec.type_name,
                missing_deps,
                spec.type_name,
                spec.key,
                dep_lines.join("\n")
            )));
        }

        (factory.build)(spec, resolved_deps)
    }

    /// Deterministic fingerprint of the registered type set, recorded in the
    /// pipeline signature so runs can detect registry drift.
    pub fn fingerprint(&self) -> String {
        let mut parts = Vec::with_capacity(self.factories.len());
        for (name, factory) in &self.factories {
            parts.push(format!(
                "{}(params={},optional={},deps={})",
                name,
                factory.required_params.join("+"),
                factory.optional_params.join("+"),
                factory.depends_on.join("+")
            ));
        }
        parts.join(";")
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::builtin()
    }
}
