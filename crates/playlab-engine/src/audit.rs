//! Executable audit suite: math, parity, and plumbing property checks.
//!
//! Each audit is a pure function returning a finding; `run_all` executes the
//! suite. The same checks run from the test suite, so a failing property
//! shows up both in CI and in ad-hoc audit runs.

use serde::{Deserialize, Serialize};

use playlab_core::bar::{Bar, BarData};
use playlab_core::detectors::{DetectorSpec, OutputValue, ParamValue};
use playlab_core::primitives::{MonotonicDeque, RingBuffer, WindowMode};
use playlab_core::registry::Registry;
use playlab_core::sim::ledger::{Ledger, LedgerConfig};
use playlab_core::sim::pricing::IntrabarPath;
use playlab_core::sim::types::{FillReason, OrderSide};
use playlab_core::state::TfState;
use chrono::{Duration, TimeZone, Utc};

/// Result of one audit check.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditFinding {
    pub name: String,
    pub passed: bool,
    pub details: String,
}

impl AuditFinding {
    fn pass(name: &str, details: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            passed: true,
            details: details.into(),
        }
    }

    fn fail(name: &str, details: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            passed: false,
            details: details.into(),
        }
    }
}

/// Deterministic pseudo-random sequence (no RNG dependency, reproducible).
fn lcg_sequence(seed: u64, n: usize) -> Vec<f64> {
    let mut state = seed.max(1);
    let mut out = Vec::with_capacity(n);
    for _ in 0..n {
        state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        // Map to [0, 1000).
        out.push((state >> 11) as f64 / (1u64 << 53) as f64 * 1000.0);
    }
    out
}

/// Monotonic deque min/max must equal a naive window recompute.
pub fn audit_primitives() -> AuditFinding {
    let name = "primitives_window_parity";
    let values = lcg_sequence(42, 500);
    for window in [1usize, 3, 17, 64] {
        let mut min_deque = MonotonicDeque::new(window, WindowMode::Min);
        let mut max_deque = MonotonicDeque::new(window, WindowMode::Max);
        for (i, &v) in values.iter().enumerate() {
            min_deque.push(i as i64, v);
            max_deque.push(i as i64, v);
            let lo = i.saturating_sub(window - 1);
            let naive_min = values[lo..=i].iter().cloned().fold(f64::INFINITY, f64::min);
            let naive_max = values[lo..=i]
                .iter()
                .cloned()
                .fold(f64::NEG_INFINITY, f64::max);
            if min_deque.get() != Some(naive_min) || max_deque.get() != Some(naive_max) {
                return AuditFinding::fail(
                    name,
                    format!("window={} diverged from naive recompute at i={}", window, i),
                );
            }
        }
    }

    // Ring buffer logical ordering after wrap.
    let mut ring = RingBuffer::new(7);
    for (i, &v) in values.iter().enumerate().take(50) {
        ring.push(v);
        let expect_len = (i + 1).min(7);
        if ring.len() != expect_len {
            return AuditFinding::fail(name, format!("ring length wrong at i={}", i));
        }
        if ring.get(ring.len() - 1) != Some(v) {
            return AuditFinding::fail(name, format!("ring newest wrong at i={}", i));
        }
    }

    AuditFinding::pass(name, "deque and ring match naive recompute over 500 values")
}

/// Ledger invariants must hold after every mutation of a deterministic
/// mutation sequence.
pub fn audit_ledger_invariants() -> AuditFinding {
    let name = "ledger_invariants";
    let mut ledger = Ledger::new(25_000.0, LedgerConfig::default());
    let values = lcg_sequence(7, 200);

    for (i, &v) in values.iter().enumerate() {
        match i % 5 {
            0 => {
                ledger.apply_entry_fee(v * 0.01);
            }
            1 => {
                ledger.apply_funding(v * 0.02 - 10.0);
            }
            2 => {
                ledger.apply_partial_exit(v - 500.0, v * 0.001);
            }
            3 => {
                ledger.apply_exit(v - 500.0, v * 0.001);
            }
            _ => {
                ledger.apply_liquidation_fee(v * 0.005);
            }
        }
        let errors = ledger.check_invariants();
        if !errors.is_empty() {
            return AuditFinding::fail(name, format!("step {}: {:?}", i, errors));
        }
    }
    AuditFinding::pass(name, "invariants held across 200 mutations")
}

/// SL-before-TP tie-break table across both sides.
pub fn audit_tiebreak_table() -> AuditFinding {
    let name = "intrabar_tiebreak";
    let path = IntrabarPath::new();
    let ts_open = Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap();
    let bar = |high: f64, low: f64| {
        Bar::new(
            "BTCUSDT",
            "15m",
            ts_open,
            ts_open + Duration::minutes(15),
            (high + low) / 2.0,
            high,
            low,
            (high + low) / 2.0,
            1.0,
        )
    };

    // (side, high, low, tp, sl, expected)
    let cases: &[(OrderSide, f64, f64, Option<f64>, Option<f64>, Option<FillReason>)] = &[
        (OrderSide::Long, 105.0, 95.0, Some(104.0), Some(96.0), Some(FillReason::StopLoss)),
        (OrderSide::Long, 105.0, 99.0, Some(104.0), Some(96.0), Some(FillReason::TakeProfit)),
        (OrderSide::Long, 103.0, 99.0, Some(104.0), Some(96.0), None),
        (OrderSide::Short, 105.0, 95.0, Some(96.0), Some(104.0), Some(FillReason::StopLoss)),
        (OrderSide::Short, 103.0, 95.0, Some(96.0), Some(104.0), Some(FillReason::TakeProfit)),
        (OrderSide::Short, 103.0, 99.0, Some(96.0), Some(104.0), None),
        (OrderSide::Long, 105.0, 95.0, None, None, None),
    ];

    for (i, (side, high, low, tp, sl, expected)) in cases.iter().enumerate() {
        let got = path.check_tp_sl(&bar(*high, *low), *side, *tp, *sl);
        if got != *expected {
            return AuditFinding::fail(
                name,
                format!("case {}: expected {:?}, got {:?}", i, expected, got),
            );
        }
    }
    AuditFinding::pass(name, "tie-break table holds for both sides")
}

/// Realized PnL sign laws: profit iff price moved in the position's favor.
pub fn audit_pnl_sign_laws() -> AuditFinding {
    let name = "pnl_sign_laws";
    let prices = lcg_sequence(99, 100);
    for (i, &exit) in prices.iter().enumerate() {
        let entry = 500.0;
        let size = 2.0;
        let long = (exit - entry) * size;
        let short = (entry - exit) * size;
        if (exit > entry && (long <= 0.0 || short >= 0.0))
            || (exit < entry && (long >= 0.0 || short <= 0.0))
        {
            return AuditFinding::fail(name, format!("sign violated at case {}", i));
        }
        if (long + short).abs() > 1e-9 {
            return AuditFinding::fail(name, "long and short PnL are not antisymmetric".to_string());
        }
    }
    AuditFinding::pass(name, "sign and antisymmetry laws hold")
}

/// Building a detector container twice from the same specs and feeding the
/// same bars must yield identical output series.
pub fn audit_detector_rebuild_determinism() -> AuditFinding {
    let name = "detector_rebuild_determinism";
    let registry = Registry::builtin();
    let specs = vec![
        DetectorSpec::new("swing", "swing")
            .with_param("left", ParamValue::Int(2))
            .with_param("right", ParamValue::Int(2)),
        DetectorSpec::new("trend", "trend").with_dep("swing", "swing"),
        DetectorSpec::new("derived_zone", "zones")
            .with_param(
                "levels",
                ParamValue::List(vec![ParamValue::Float(0.382), ParamValue::Float(0.618)]),
            )
            .with_param("max_active", ParamValue::Int(4))
            .with_dep("source", "swing"),
    ];

    let values = lcg_sequence(1234, 120);
    let run = || -> Result<Vec<Vec<(String, OutputValue)>>, String> {
        let mut state =
            TfState::new("15m", &specs, &registry).map_err(|e| e.to_string())?;
        let mut series = Vec::new();
        for (i, &v) in values.iter().enumerate() {
            let high = v + 10.0;
            let low = v - 10.0;
            let bar = BarData::new(i as i64, v, high, low, v, 100.0);
            state.update(&bar).map_err(|e| e.to_string())?;
            let mut row = Vec::new();
            for (key, _, detector) in state.iter() {
                for field in detector.output_keys() {
                    if let Some(value) = detector.get(&field) {
                        row.push((format!("{}.{}", key, field), value));
                    }
                }
            }
            series.push(row);
        }
        Ok(series)
    };

    match (run(), run()) {
        (Ok(a), Ok(b)) => {
            if a.len() != b.len() {
                return AuditFinding::fail(name, "series length mismatch".to_string());
            }
            for (i, (row_a, row_b)) in a.iter().zip(b.iter()).enumerate() {
                if row_a.len() != row_b.len() {
                    return AuditFinding::fail(name, format!("row width mismatch at bar {}", i));
                }
                for ((ka, va), (kb, vb)) in row_a.iter().zip(row_b.iter()) {
                    if ka != kb || !va.same(vb) {
                        return AuditFinding::fail(
                            name,
                            format!("bar {}: {} diverged ({} vs {})", i, ka, va, vb),
                        );
                    }
                }
            }
            AuditFinding::pass(name, "identical output series across rebuilds")
        }
        (Err(e), _) | (_, Err(e)) => AuditFinding::fail(name, e),
    }
}

/// Run the whole audit suite.
pub fn run_all() -> Vec<AuditFinding> {
    vec![
        audit_primitives(),
        audit_ledger_invariants(),
        audit_tiebreak_table(),
        audit_pnl_sign_laws(),
        audit_detector_rebuild_determinism(),
    ]
}
