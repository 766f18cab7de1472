//! Determinism verification: hash-equality comparison between runs.
//!
//! Two runs of the same `(play_id, window, data_source_id)` must agree on
//! `trades_hash`, `equity_hash`, and `run_hash`. The comparator loads both
//! `result.json` files, warns when the Plays differ, and reports per-field
//! hash comparisons.

use std::path::Path;

use serde::{Deserialize, Serialize};

use playlab_core::error::Result;

use crate::artifacts::load_result_summary;

/// One hash field comparison between two runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HashComparison {
    pub field: String,
    pub run_a: String,
    pub run_b: String,
    pub matches: bool,
}

/// Result of determinism verification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeterminismResult {
    pub passed: bool,
    pub run_a_path: String,
    pub run_b_path: String,
    pub run_a_play_id: String,
    pub run_b_play_id: String,
    pub hash_comparisons: Vec<HashComparison>,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl DeterminismResult {
    /// Human-readable report.
    pub fn report(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!(
            "Determinism verification: {}\n",
            if self.passed { "PASSED" } else { "FAILED" }
        ));
        out.push_str(&format!("  run A: {}\n", self.run_a_path));
        out.push_str(&format!("  run B: {}\n", self.run_b_path));
        for comparison in &self.hash_comparisons {
            out.push_str(&format!(
                "  {} {}: A={} B={}\n",
                if comparison.matches { "[ok]" } else { "[mismatch]" },
                comparison.field,
                comparison.run_a,
                comparison.run_b
            ));
        }
        for warning in &self.warnings {
            out.push_str(&format!("  warning: {}\n", warning));
        }
        for error in &self.errors {
            out.push_str(&format!("  error: {}\n", error));
        }
        out
    }
}

/// Compare two run directories for determinism.
///
/// Output hashes (`trades_hash`, `equity_hash`, `run_hash`) must match;
/// a differing `play_hash` (or play id) only warns.
pub fn compare_runs(run_a: &Path, run_b: &Path) -> Result<DeterminismResult> {
    let mut result = DeterminismResult {
        passed: true,
        run_a_path: run_a.display().to_string(),
        run_b_path: run_b.display().to_string(),
        run_a_play_id: String::new(),
        run_b_play_id: String::new(),
        hash_comparisons: Vec::new(),
        errors: Vec::new(),
        warnings: Vec::new(),
    };

    let summary_a = match load_result_summary(run_a) {
        Ok(s) => s,
        Err(e) => {
            result.passed = false;
            result.errors.push(format!("cannot load run A: {}", e));
            return Ok(result);
        }
    };
    let summary_b = match load_result_summary(run_b) {
        Ok(s) => s,
        Err(e) => {
            result.passed = false;
            result.errors.push(format!("cannot load run B: {}", e));
            return Ok(result);
        }
    };

    result.run_a_play_id = summary_a.play_id.clone();
    result.run_b_play_id = summary_b.play_id.clone();
    if summary_a.play_id != summary_b.play_id {
        result.warnings.push(format!(
            "comparing different Plays: {} vs {}",
            summary_a.play_id, summary_b.play_id
        ));
    }

    let fields = [
        ("trades_hash", &summary_a.trades_hash, &summary_b.trades_hash, true),
        ("equity_hash", &summary_a.equity_hash, &summary_b.equity_hash, true),
        ("run_hash", &summary_a.run_hash, &summary_b.run_hash, true),
        ("play_hash", &summary_a.play_hash, &summary_b.play_hash, false),
    ];

    for (field, a, b, required) in fields {
        let matches = a == b;
        result.hash_comparisons.push(HashComparison {
            field: field.to_string(),
            run_a: a.clone(),
            run_b: b.clone(),
            matches,
        });
        if !matches {
            if required {
                result.passed = false;
                result.errors.push(format!("hash mismatch for {}", field));
            } else {
                result.warnings.push(format!("{} differs", field));
            }
        }
    }

    Ok(result)
}
